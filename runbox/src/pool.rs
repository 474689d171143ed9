use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use log::{debug, info, warn};
use tokio::{sync::Mutex, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;

use crate::{
    runner::{self, base_run_args},
    settings::Settings,
};

pub(crate) const POOL_PREFIX: &str = "python_exec_pool_";

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

// Pre-installed into fresh members so the common case skips pip entirely.
const HOT_PACKAGES: &[&str] = &["numpy", "pandas", "matplotlib"];

/// Warm containers loaned out to requests, self-healed by a periodic
/// keep-alive pass.
///
/// A member name is in `available` or `in_use`, never both; docker calls
/// run outside the state mutex.
pub(crate) struct ContainerPool {
    settings: Arc<Settings>,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    available: Vec<String>,
    in_use: HashSet<String>,
}

impl PoolState {
    fn acquire(&mut self) -> Option<String> {
        if self.available.is_empty() {
            return None;
        }
        let name = self.available.remove(0);
        self.in_use.insert(name.clone());
        Some(name)
    }

    fn release(&mut self, name: &str, expected: &[String]) {
        self.in_use.remove(name);
        if expected.iter().any(|n| n == name) && !self.available.iter().any(|n| n == name) {
            self.available.push(name.to_owned());
        }
    }

    /// Fresh `available` snapshot, excluding whatever is loaned out.
    fn rebuild(&mut self, expected: &[String]) {
        self.available =
            expected.iter().filter(|name| !self.in_use.contains(*name)).cloned().collect();
    }
}

impl ContainerPool {
    #[must_use]
    pub(crate) fn new(settings: Arc<Settings>) -> Self {
        Self { settings, state: Mutex::new(PoolState::default()) }
    }

    #[must_use]
    fn warm_size(&self) -> usize {
        self.settings.max_workers.min(2).max(1)
    }

    #[must_use]
    pub(crate) fn member_names(&self) -> Vec<String> {
        (0..self.warm_size()).map(|i| format!("{POOL_PREFIX}{i}")).collect()
    }

    /// Non-blocking: `None` sends the caller down the one-shot path.
    pub(crate) async fn acquire(&self) -> Option<String> {
        let name = self.state.lock().await.acquire();
        if let Some(ref name) = name {
            debug!("Loaning pool member {name}");
        }
        name
    }

    pub(crate) async fn release(&self, name: &str) {
        let expected = self.member_names();
        self.state.lock().await.release(name, &expected);
        debug!("Returned pool member {name}");
    }

    /// Brings every expected member online: running members are kept,
    /// stopped ones recreated, missing ones created. Never fails; per-member
    /// errors are logged and skipped so one bad container cannot take the
    /// service down.
    pub(crate) async fn ensure_warm(&self) {
        let expected = self.member_names();
        for name in &expected {
            match self.is_running(name).await {
                Some(true) => continue,
                Some(false) => self.remove(name).await,
                None => {} // absent
            }
            if let Err(e) = self.create_member(name).await {
                warn!("Failed warming pool member {name}: {e}");
            }
        }
        self.state.lock().await.rebuild(&expected);
    }

    async fn is_running(&self, name: &str) -> Option<bool> {
        let mut cmd = self.settings.runner.as_cmd();
        cmd.args(["inspect", "-f", "{{.State.Running}}", name]);
        let out = runner::exec(cmd).await.ok()?;
        if !out.success() {
            return None;
        }
        Some(out.stdout.trim().eq_ignore_ascii_case("true"))
    }

    async fn remove(&self, name: &str) {
        let mut cmd = self.settings.runner.as_cmd();
        cmd.args(["rm", "-f", name]);
        let _ = runner::exec(cmd).await;
    }

    #[must_use]
    fn create_cmd(&self, name: &str) -> tokio::process::Command {
        let mut cmd = self.settings.runner.as_cmd();
        cmd.args(["run", "-d", "--name", name, "--restart", "unless-stopped"]);
        cmd.args(base_run_args(&self.settings));
        cmd.arg(&self.settings.docker_image);
        cmd.args(["tail", "-f", "/dev/null"]); // keeps the member alive
        cmd
    }

    async fn create_member(&self, name: &str) -> Result<()> {
        let out = runner::exec(self.create_cmd(name)).await?;
        if out.success() {
            info!("Created pool member {name}");
            self.preinstall(name).await;
            return Ok(());
        }

        // Name conflict: reuse a running leftover, otherwise remove then recreate.
        if out.stderr.contains("is already in use") || out.stderr.contains("Conflict") {
            if self.is_running(name).await == Some(true) {
                return Ok(());
            }
            self.remove(name).await;
            let retried = runner::exec(self.create_cmd(name)).await?;
            if retried.success() {
                info!("Recreated pool member {name}");
                self.preinstall(name).await;
                return Ok(());
            }
            bail!("Failed recreating container: {}", retried.stderr.trim())
        }
        bail!("Failed creating container: {}", out.stderr.trim())
    }

    async fn preinstall(&self, name: &str) {
        for package in HOT_PACKAGES {
            let mut cmd = self.settings.runner.as_cmd();
            cmd.args(["exec", name, "pip", "install", "--user", package]);
            if let Ok(out) = runner::exec(cmd).await {
                if !out.success() {
                    debug!("Pre-install of {package} in {name} failed: {}", out.stderr.trim());
                }
            }
        }
    }

    /// Re-verifies the pool every minute until cancelled.
    pub(crate) fn keep_alive(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = time::sleep(KEEPALIVE_PERIOD) => pool.ensure_warm().await,
                }
            }
            debug!("Keep-alive loop stopped");
        })
    }

    /// Force-stops and removes every member. Safe to call more than once.
    pub(crate) async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            state.available.clear();
            state.in_use.clear();
        }
        for name in self.member_names() {
            let mut stop = self.settings.runner.as_cmd();
            stop.args(["stop", name.as_str()]);
            let _ = runner::exec(stop).await;
            let mut rm = self.settings.runner.as_cmd();
            rm.args(["rm", name.as_str()]);
            let _ = runner::exec(rm).await;
        }
        info!("Pool shut down");
    }
}
