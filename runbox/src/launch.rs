use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, warn};
use serde::Deserialize;
use tokio::{process::Command, time::timeout};

use crate::{
    names::{ExecutionId, SafeName},
    runner::{self, base_run_args},
    service::{
        CHART_FILE_NAME, GUEST_INPUT_DIR, GUEST_INPUT_MAP_PATH, GUEST_OUTPUT_DIR,
        GUEST_SCRIPT_PATH,
    },
    settings::Settings,
    workspace::Workspace,
};

pub(crate) const TIMEOUT_ERROR: &str = "Execution timeout";

// Host-side slack on top of the guest wall clock: lets the in-container
// `timeout` wrapper fire first so its exit code is observable.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

// `timeout` exits 124 on expiry, 137 after the follow-up KILL.
const TIMEOUT_WRAPPER_CODES: [i32; 2] = [124, 137];

/// Streams captured from one guest run. `stderr` is set iff the run failed
/// (non-zero exit, timeout, or a sandbox-level error).
#[derive(Debug, Default)]
pub(crate) struct GuestRun {
    pub(crate) stdout: String,
    pub(crate) stderr: Option<String>,
}

impl GuestRun {
    #[must_use]
    fn timed_out() -> Self {
        Self { stdout: String::new(), stderr: Some(TIMEOUT_ERROR.to_owned()) }
    }

    #[must_use]
    fn infra(err: anyhow::Error) -> Self {
        Self { stdout: String::new(), stderr: Some(format!("{err:#}")) }
    }
}

/// Executes the script inside a warm pool member: copy in, run under the
/// guest timeout wrapper, copy qualifying outputs back out, clean the
/// member for its next loan.
pub(crate) async fn run_pooled(
    settings: &Settings,
    ws: &Workspace,
    container: &str,
    has_inputs: bool,
) -> GuestRun {
    match run_pooled_inner(settings, ws, container, has_inputs).await {
        Ok(run) => run,
        Err(e) => GuestRun::infra(e),
    }
}

async fn run_pooled_inner(
    settings: &Settings,
    ws: &Workspace,
    container: &str,
    has_inputs: bool,
) -> Result<GuestRun> {
    let runner = settings.runner;

    let mut cp = runner.as_cmd();
    cp.args(["cp", ws.code_path().as_str(), format!("{container}:{GUEST_SCRIPT_PATH}").as_str()]);
    checked(cp, "Failed copying script into sandbox").await?;

    // Clear leftovers of any earlier loan before staging this request.
    let mut prepare = runner.as_cmd();
    prepare.args(["exec", container, "bash", "-c"]);
    prepare.arg(format!(
        "mkdir -p {GUEST_OUTPUT_DIR} {GUEST_INPUT_DIR} && rm -rf {GUEST_OUTPUT_DIR}/* {GUEST_INPUT_DIR}/*"
    ));
    checked(prepare, "Failed preparing sandbox dirs").await?;

    if has_inputs {
        let mut cp = runner.as_cmd();
        cp.arg("cp");
        cp.arg(format!("{}/.", ws.input_dir()));
        cp.arg(format!("{container}:{GUEST_INPUT_DIR}/"));
        checked(cp, "Failed copying inputs into sandbox").await?;

        let mut cp = runner.as_cmd();
        cp.args(["cp", ws.input_map_path().as_str()]);
        cp.arg(format!("{container}:{GUEST_INPUT_MAP_PATH}"));
        checked(cp, "Failed copying input map into sandbox").await?;
    }

    let mut run = runner.as_cmd();
    run.args(["exec", container, "bash", "-c"]);
    run.arg(wrapped_invocation(settings.execution_timeout));
    let deadline = Duration::from_secs(settings.execution_timeout) + TIMEOUT_GRACE;
    let out = match timeout(deadline, runner::exec(run)).await {
        Err(_elapsed) => {
            kill_and_clean(settings, container).await;
            return Ok(GuestRun::timed_out());
        }
        Ok(out) => out?,
    };
    let result = pooled_outcome(out);

    copy_chart_out(settings, ws, container).await?;
    copy_outputs_out(settings, ws, container).await;
    clean_member(settings, container).await;

    Ok(result)
}

/// Prefer the guest-side `timeout` so the exit code distinguishes expiry;
/// fall back to a bare run governed by the host-side deadline.
#[must_use]
fn wrapped_invocation(timeout_secs: u64) -> String {
    format!(
        "if command -v timeout >/dev/null 2>&1; then \
         timeout -k 2s {timeout_secs}s python {GUEST_SCRIPT_PATH}; \
         else python {GUEST_SCRIPT_PATH}; fi"
    )
}

#[must_use]
fn pooled_outcome(out: runner::Exec) -> GuestRun {
    match out.code {
        Some(0) => GuestRun { stdout: out.stdout, stderr: None },
        Some(code) if TIMEOUT_WRAPPER_CODES.contains(&code) && out.stderr.trim().is_empty() => {
            GuestRun::timed_out()
        }
        code => GuestRun { stdout: out.stdout, stderr: Some(failure_stderr(code, out.stderr)) },
    }
}

#[must_use]
fn failure_stderr(code: Option<i32>, stderr: String) -> String {
    if stderr.trim().is_empty() {
        match code {
            Some(code) => format!("Guest exited with status {code}"),
            None => "Guest killed by signal".to_owned(),
        }
    } else {
        stderr
    }
}

async fn copy_chart_out(settings: &Settings, ws: &Workspace, container: &str) -> Result<()> {
    let guest_chart = format!("{GUEST_OUTPUT_DIR}/{CHART_FILE_NAME}");
    let mut probe = settings.runner.as_cmd();
    probe.args(["exec", container, "test", "-f", guest_chart.as_str()]);
    if !runner::exec(probe).await?.success() {
        return Ok(());
    }
    let mut cp = settings.runner.as_cmd();
    cp.arg("cp");
    cp.arg(format!("{container}:{guest_chart}"));
    cp.arg(ws.output_dir().join(CHART_FILE_NAME));
    checked(cp, "Failed copying chart out of sandbox").await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ListedOutput {
    name: String,
    size: u64,
}

// Output files are listed from inside the guest, then copied out one by one.
// Only names that survive sanitization and the extension allow-list are
// worth the copy; the collector re-checks sizes and budgets on the host.
async fn copy_outputs_out(settings: &Settings, ws: &Workspace, container: &str) {
    let mut list = settings.runner.as_cmd();
    list.args(["exec", container, "python", "-c", LIST_OUTPUTS_SNIPPET]);
    let Ok(out) = runner::exec(list).await else { return };
    if !out.success() || out.stdout.trim().is_empty() {
        return;
    }
    let items: Vec<ListedOutput> = match serde_json::from_str(out.stdout.trim()) {
        Ok(items) => items,
        Err(e) => {
            warn!("Ignoring unparseable sandbox output listing: {e}");
            return;
        }
    };

    for ListedOutput { name, size } in items {
        let Ok(safe) = SafeName::try_new(name.clone()) else { continue };
        if safe.as_str() != name || name == CHART_FILE_NAME {
            continue;
        }
        let Some((_, ext)) = name.rsplit_once('.') else { continue };
        if !settings.allows_extension(ext) {
            continue;
        }
        if size == 0 || size > settings.output_file_max_bytes {
            continue;
        }
        let mut cp = settings.runner.as_cmd();
        cp.arg("cp");
        cp.arg(format!("{container}:{GUEST_OUTPUT_DIR}/{name}"));
        cp.arg(ws.output_dir().join(&name));
        if let Ok(out) = runner::exec(cp).await {
            if !out.success() {
                debug!("Failed copying output {name} out: {}", out.stderr.trim());
            }
        }
    }
}

const LIST_OUTPUTS_SNIPPET: &str = r#"import os, json
p='/code/output'
items=[]
for n in os.listdir(p):
    fp=os.path.join(p,n)
    if os.path.isfile(fp):
        items.append({'name': n, 'size': os.path.getsize(fp)})
print(json.dumps(items, ensure_ascii=False))
"#;

async fn clean_member(settings: &Settings, container: &str) {
    let mut rm = settings.runner.as_cmd();
    rm.args(["exec", container, "rm", "-f", GUEST_SCRIPT_PATH, GUEST_INPUT_MAP_PATH]);
    let _ = runner::exec(rm).await;
    let mut clear = settings.runner.as_cmd();
    clear.args(["exec", container, "bash", "-c"]);
    clear.arg(format!("rm -rf {GUEST_OUTPUT_DIR}/* {GUEST_INPUT_DIR}/*"));
    let _ = runner::exec(clear).await;
}

// Host deadline fired: the guest process is still alive inside the member.
async fn kill_and_clean(settings: &Settings, container: &str) {
    let mut kill = settings.runner.as_cmd();
    kill.args(["exec", container, "pkill", "-f", GUEST_SCRIPT_PATH]);
    let _ = runner::exec(kill).await;
    let mut clear = settings.runner.as_cmd();
    clear.args(["exec", container, "bash", "-c"]);
    clear.arg(format!(
        "rm -rf {GUEST_OUTPUT_DIR}/* {GUEST_INPUT_DIR}/* {GUEST_SCRIPT_PATH} {GUEST_INPUT_MAP_PATH}"
    ));
    let _ = runner::exec(clear).await;
}

/// Executes the script in a fresh `--rm` container with the script (and any
/// inputs) bind-mounted read-only and the workspace output dir mounted
/// read-write.
pub(crate) async fn run_one_shot(
    settings: &Settings,
    id: &ExecutionId,
    ws: &Workspace,
    has_inputs: bool,
) -> GuestRun {
    let container = format!("python_exec_{id}");

    let mut cmd = settings.runner.as_cmd();
    cmd.args(["run", "--rm", "--name", container.as_str()]);
    cmd.args(base_run_args(settings));
    cmd.arg("-v");
    cmd.arg(format!("{}:{GUEST_SCRIPT_PATH}:ro", ws.code_path()));
    if has_inputs {
        cmd.arg("-v");
        cmd.arg(format!("{}:{GUEST_INPUT_DIR}:ro", ws.input_dir()));
        cmd.arg("-v");
        cmd.arg(format!("{}:{GUEST_INPUT_MAP_PATH}:ro", ws.input_map_path()));
    }
    cmd.arg("-v");
    cmd.arg(format!("{}:{GUEST_OUTPUT_DIR}", ws.output_dir()));
    cmd.arg(&settings.docker_image);
    cmd.args(["python", GUEST_SCRIPT_PATH]);

    let deadline = Duration::from_secs(settings.execution_timeout) + TIMEOUT_GRACE;
    match timeout(deadline, runner::exec(cmd)).await {
        Err(_elapsed) => {
            stop_and_remove(settings, &container).await;
            GuestRun::timed_out()
        }
        Ok(Err(e)) => {
            stop_and_remove(settings, &container).await;
            GuestRun::infra(anyhow!("Failed launching one-shot sandbox: {e}"))
        }
        Ok(Ok(out)) => match out.code {
            Some(0) => GuestRun { stdout: out.stdout, stderr: None },
            code => GuestRun { stdout: out.stdout, stderr: Some(failure_stderr(code, out.stderr)) },
        },
    }
}

async fn stop_and_remove(settings: &Settings, container: &str) {
    let mut stop = settings.runner.as_cmd();
    stop.args(["stop", container]);
    let _ = runner::exec(stop).await;
    let mut rm = settings.runner.as_cmd();
    rm.args(["rm", container]);
    let _ = runner::exec(rm).await;
}

async fn checked(cmd: Command, what: &str) -> Result<runner::Exec> {
    let out = runner::exec(cmd).await?;
    if !out.success() {
        bail!("{what}: {}", out.stderr.trim())
    }
    Ok(out)
}
