use std::{fmt, process::Stdio, str::FromStr};

use anyhow::{anyhow, bail, Result};
use log::debug;
use tokio::process::Command;

use crate::settings::Settings;

/// Hard per-container memory cap passed to every `run`.
pub(crate) const MEMORY_LIMIT: &str = "1g";
/// Hard per-container CPU cap passed to every `run`.
pub(crate) const CPU_LIMIT: &str = "1";

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) enum Runner {
    #[default]
    Docker,
    Podman,
    /// No runner on this host: every sandbox call fails fast.
    None,
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Podman => write!(f, "podman"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for Runner {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "none" => Ok(Self::None),
            _ => bail!("Runner must be one of [\"docker\", \"podman\", \"none\"]"),
        }
    }
}

impl Runner {
    #[must_use]
    pub(crate) fn as_cmd(&self) -> Command {
        let mut cmd = Command::new(self.to_string());
        cmd.kill_on_drop(true); // Makes sure the underlying OS process dies with us
        cmd.stdin(Stdio::null());
        cmd
    }
}

/// Resource limits shared by pool members, one-shot sandboxes and probes.
#[must_use]
pub(crate) fn base_run_args(settings: &Settings) -> Vec<String> {
    vec![
        "--init".to_owned(),
        "--network".to_owned(),
        settings.docker_network_mode.clone(),
        format!("--memory={MEMORY_LIMIT}"),
        format!("--cpus={CPU_LIMIT}"),
        "--pids-limit".to_owned(),
        settings.docker_pids_limit.to_string(),
        "--cap-drop=ALL".to_owned(),
        "--security-opt=no-new-privileges".to_owned(),
    ]
}

#[derive(Debug)]
pub(crate) struct Exec {
    pub(crate) code: Option<i32>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl Exec {
    #[must_use]
    pub(crate) fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs to completion, capturing both streams. Only fails when the runner
/// binary itself could not be spawned.
pub(crate) async fn exec(mut cmd: Command) -> Result<Exec> {
    let call = show(&cmd);
    debug!("Calling {call}");
    let out =
        cmd.output().await.map_err(|e| anyhow!("Failed spawning {call}: {e}"))?;
    let exec = Exec {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    };
    debug!("{call} exited with {:?}", exec.code);
    Ok(exec)
}

#[must_use]
pub(crate) fn show(cmd: &Command) -> String {
    let std = cmd.as_std();
    format!(
        "`{command} {args}`",
        command = std.get_program().to_string_lossy(),
        args = std
            .get_args()
            .map(|x| x.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    )
}
