use std::{env, fs::OpenOptions, io::Write};

use chrono::Utc;
use env_logger::{Builder, Env, Target};
use log::Level;

pub(crate) const ENV_LOG: &str = "RUNBOX_LOG";
pub(crate) const ENV_LOG_STYLE: &str = "RUNBOX_LOG_STYLE";
pub(crate) const ENV_LOG_PATH: &str = "RUNBOX_LOG_PATH";

/// Logs to stderr, or to `$RUNBOX_LOG_PATH` when set. Reentrant, for tests.
pub(crate) fn setup(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };
    let mut builder =
        Builder::from_env(Env::default().filter_or(ENV_LOG, default_filter).write_style(ENV_LOG_STYLE));
    builder.format(|buf, record| {
        let now = Utc::now().format("%y/%m/%d %H:%M:%S%.3f");
        writeln!(buf, "{} {now} {}", log_level_for_logging(record.level()), record.args())
    });
    if let Ok(path) = env::var(ENV_LOG_PATH) {
        if let Ok(log_file) = OpenOptions::new().create(true).append(true).open(path) {
            builder.target(Target::Pipe(Box::new(log_file)));
        }
    }
    let _ = builder.try_init();
}

#[must_use]
fn log_level_for_logging(lvl: Level) -> char {
    match lvl {
        Level::Error => 'E',
        Level::Warn => 'W',
        Level::Info => 'I',
        Level::Debug => 'D',
        Level::Trace => 'T',
    }
}

#[test]
fn unique_level_chars() {
    use std::collections::HashSet;

    let all: HashSet<_> = [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace]
        .into_iter()
        .map(log_level_for_logging)
        .collect();
    assert_eq!(all.len(), 5);
}
