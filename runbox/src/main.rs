use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use pico_args::Arguments;

use crate::{
    executor::Executor,
    probe::CapabilityProbe,
    service::ExecuteRequest,
    settings::Settings,
};

mod assemble;
mod executor;
mod fetch;
mod harvest;
mod launch;
mod logging;
mod names;
mod pool;
mod probe;
mod runner;
mod service;
mod settings;
mod workspace;

const PKG: &str = env!("CARGO_PKG_NAME");
const VSN: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let mut args = Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        return Ok(help());
    }
    if args.contains(["-V", "--version"]) {
        println!("{PKG} {VSN}");
        return Ok(ExitCode::SUCCESS);
    }

    let settings = Settings::from_env();
    logging::setup(settings.debug);

    match args.subcommand()?.as_deref() {
        Some("exec") => exec(settings, args).await,
        Some("capabilities") => capabilities(settings).await,
        Some("env") => {
            println!("{settings:#?}");
            Ok(ExitCode::SUCCESS)
        }
        Some(cmd) => {
            eprintln!("Unexpected command {cmd:?}");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(help()),
    }
}

/// One full engine round trip: initialize, execute, print the API payload,
/// shut down. Exits non-zero when the run reported an error.
async fn exec(settings: Settings, mut args: Arguments) -> Result<ExitCode> {
    let files: Vec<String> = args.values_from_str("--file")?;
    let script: Utf8PathBuf = args.free_from_str()?;
    let code = std::fs::read_to_string(&script)?;

    let executor = Executor::new(settings.clone());
    if let Err(e) = executor.initialize().await {
        eprintln!("{e:#}");
        return Ok(ExitCode::FAILURE);
    }
    let result = executor.execute(ExecuteRequest { code, files }).await;
    executor.shutdown().await;

    let payload = result.to_payload(&settings);
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(if payload.error.is_some() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

async fn capabilities(settings: Settings) -> Result<ExitCode> {
    let probe = CapabilityProbe::new();
    let doc = probe.document(&settings).await;
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(ExitCode::SUCCESS)
}

#[must_use]
fn help() -> ExitCode {
    eprintln!(
        r#"{PKG} {VSN}: sandboxed Python code-execution broker

Usage:
    {PKG} exec <script.py> [--file URL]...    Run a snippet once, print the result JSON
    {PKG} capabilities                        Print the capability document
    {PKG} env                                 Print the resolved settings

Configuration comes from the environment; see the README for the variables.
"#
    );
    ExitCode::SUCCESS
}
