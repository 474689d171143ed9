use std::{collections::BTreeSet, env};

use camino::Utf8PathBuf;
use log::debug;

use crate::runner::Runner;

pub(crate) const DEBUG: &str = "DEBUG";
pub(crate) const PORT: &str = "PORT";
pub(crate) const MAX_WORKERS: &str = "MAX_WORKERS";
pub(crate) const EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
pub(crate) const DOCKER_IMAGE: &str = "DOCKER_IMAGE";
pub(crate) const DOCKER_NETWORK_MODE: &str = "DOCKER_NETWORK_MODE";
pub(crate) const DOCKER_PIDS_LIMIT: &str = "DOCKER_PIDS_LIMIT";
pub(crate) const IMAGE_STORE_PATH: &str = "IMAGE_STORE_PATH";
pub(crate) const IMAGE_URL_PREFIX: &str = "IMAGE_URL_PREFIX";
pub(crate) const FILE_STORE_PATH: &str = "FILE_STORE_PATH";
pub(crate) const FILE_URL_PREFIX: &str = "FILE_URL_PREFIX";
pub(crate) const PUBLIC_BASE_URL: &str = "PUBLIC_BASE_URL";
pub(crate) const INPUT_MAX_FILES: &str = "INPUT_MAX_FILES";
pub(crate) const INPUT_FILE_MAX_BYTES: &str = "INPUT_FILE_MAX_BYTES";
pub(crate) const INPUT_TOTAL_MAX_BYTES: &str = "INPUT_TOTAL_MAX_BYTES";
pub(crate) const OUTPUT_MAX_FILES: &str = "OUTPUT_MAX_FILES";
pub(crate) const OUTPUT_FILE_MAX_BYTES: &str = "OUTPUT_FILE_MAX_BYTES";
pub(crate) const OUTPUT_TOTAL_MAX_BYTES: &str = "OUTPUT_TOTAL_MAX_BYTES";
pub(crate) const OUTPUT_ALLOWED_EXTENSIONS: &str = "OUTPUT_ALLOWED_EXTENSIONS";
pub(crate) const CONTAINER_RUNNER: &str = "CONTAINER_RUNNER";
pub(crate) const WORKSPACE_BASE: &str = "WORKSPACE_BASE";

const DEFAULT_IMAGE: &str = "registry.cn-hangzhou.aliyuncs.com/ripper/python-executor:latest";
const DEFAULT_ALLOWED_EXTENSIONS: &str = "md,csv,txt,json,log";

const MIB: u64 = 1024 * 1024;

/// Process-wide configuration, frozen after construction.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) debug: bool,
    pub(crate) port: u16,
    pub(crate) max_workers: usize,
    pub(crate) execution_timeout: u64,
    pub(crate) docker_image: String,
    pub(crate) docker_network_mode: String,
    pub(crate) docker_pids_limit: u32,
    pub(crate) image_store_path: Utf8PathBuf,
    pub(crate) image_url_prefix: String,
    pub(crate) file_store_path: Utf8PathBuf,
    pub(crate) file_url_prefix: String,
    pub(crate) public_base_url: String,
    pub(crate) input_max_files: usize,
    pub(crate) input_file_max_bytes: u64,
    pub(crate) input_total_max_bytes: u64,
    pub(crate) output_max_files: usize,
    pub(crate) output_file_max_bytes: u64,
    pub(crate) output_total_max_bytes: u64,
    pub(crate) output_allowed_extensions: BTreeSet<String>,
    pub(crate) runner: Runner,
    pub(crate) workspace_base: Utf8PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            port: 14564,
            max_workers: 4,
            execution_timeout: 30,
            docker_image: DEFAULT_IMAGE.to_owned(),
            docker_network_mode: "bridge".to_owned(),
            docker_pids_limit: 256,
            image_store_path: "./images".into(),
            image_url_prefix: "/images".to_owned(),
            file_store_path: "./files".into(),
            file_url_prefix: "/files".to_owned(),
            public_base_url: String::new(),
            input_max_files: 10,
            input_file_max_bytes: 20 * MIB,
            input_total_max_bytes: 50 * MIB,
            output_max_files: 20,
            output_file_max_bytes: 5 * MIB,
            output_total_max_bytes: 20 * MIB,
            output_allowed_extensions: csv_set(DEFAULT_ALLOWED_EXTENSIONS),
            runner: Runner::default(),
            workspace_base: "/tmp/runbox".into(),
        }
    }
}

impl Settings {
    #[must_use]
    pub(crate) fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            debug: env_bool(DEBUG, defaults.debug),
            port: env_num(PORT, defaults.port),
            max_workers: env_num(MAX_WORKERS, defaults.max_workers).max(1),
            execution_timeout: env_num(EXECUTION_TIMEOUT, defaults.execution_timeout).max(1),
            docker_image: env_str(DOCKER_IMAGE, &defaults.docker_image),
            docker_network_mode: env_str(DOCKER_NETWORK_MODE, &defaults.docker_network_mode),
            docker_pids_limit: env_num(DOCKER_PIDS_LIMIT, defaults.docker_pids_limit),
            image_store_path: env_str(IMAGE_STORE_PATH, defaults.image_store_path.as_str()).into(),
            image_url_prefix: env_str(IMAGE_URL_PREFIX, &defaults.image_url_prefix),
            file_store_path: env_str(FILE_STORE_PATH, defaults.file_store_path.as_str()).into(),
            file_url_prefix: env_str(FILE_URL_PREFIX, &defaults.file_url_prefix),
            public_base_url: env_str(PUBLIC_BASE_URL, &defaults.public_base_url),
            input_max_files: env_num(INPUT_MAX_FILES, defaults.input_max_files),
            input_file_max_bytes: env_num(INPUT_FILE_MAX_BYTES, defaults.input_file_max_bytes),
            input_total_max_bytes: env_num(INPUT_TOTAL_MAX_BYTES, defaults.input_total_max_bytes),
            output_max_files: env_num(OUTPUT_MAX_FILES, defaults.output_max_files),
            output_file_max_bytes: env_num(OUTPUT_FILE_MAX_BYTES, defaults.output_file_max_bytes),
            output_total_max_bytes: env_num(
                OUTPUT_TOTAL_MAX_BYTES,
                defaults.output_total_max_bytes,
            ),
            output_allowed_extensions: env::var(OUTPUT_ALLOWED_EXTENSIONS)
                .map(|val| csv_set(&val))
                .unwrap_or(defaults.output_allowed_extensions),
            runner: env::var(CONTAINER_RUNNER)
                .ok()
                .and_then(|val| val.parse().ok())
                .unwrap_or(defaults.runner),
            workspace_base: env_str(WORKSPACE_BASE, defaults.workspace_base.as_str()).into(),
        }
    }

    #[must_use]
    pub(crate) fn allows_extension(&self, ext: &str) -> bool {
        self.output_allowed_extensions.contains(&ext.to_lowercase())
    }
}

#[must_use]
fn env_str(var: &str, default: &str) -> String {
    env::var(var).ok().filter(|val| !val.is_empty()).unwrap_or_else(|| default.to_owned())
}

#[must_use]
fn env_bool(var: &str, default: bool) -> bool {
    let Ok(val) = env::var(var) else { return default };
    ["1", "true", "yes", "y", "on"].contains(&val.trim().to_lowercase().as_str())
}

// Malformed values fall back to the default.
#[must_use]
fn env_num<T: std::str::FromStr + Copy>(var: &str, default: T) -> T {
    let Ok(val) = env::var(var) else { return default };
    val.trim().parse().unwrap_or_else(|_| {
        debug!("Ignoring unparseable ${var}={val:?}");
        default
    })
}

#[must_use]
fn csv_set(val: &str) -> BTreeSet<String> {
    val.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_without_env() {
        temp_env::with_vars_unset([MAX_WORKERS, EXECUTION_TIMEOUT, PORT, OUTPUT_ALLOWED_EXTENSIONS], || {
            let settings = Settings::from_env();
            assert_eq!(settings.max_workers, 4);
            assert_eq!(settings.execution_timeout, 30);
            assert_eq!(settings.port, 14564);
            assert!(settings.allows_extension("csv"));
            assert!(!settings.allows_extension("png"));
        });
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                (MAX_WORKERS, Some("9")),
                (EXECUTION_TIMEOUT, Some("5")),
                (DOCKER_NETWORK_MODE, Some("none")),
                (OUTPUT_ALLOWED_EXTENSIONS, Some("CSV, md ,,txt")),
                (PUBLIC_BASE_URL, Some("https://broker.example")),
            ],
            || {
                let settings = Settings::from_env();
                assert_eq!(settings.max_workers, 9);
                assert_eq!(settings.execution_timeout, 5);
                assert_eq!(settings.docker_network_mode, "none");
                assert_eq!(
                    settings.output_allowed_extensions,
                    ["csv", "md", "txt"].map(str::to_owned).into()
                );
                assert_eq!(settings.public_base_url, "https://broker.example");
            },
        );
    }

    #[test]
    fn malformed_values_keep_defaults() {
        temp_env::with_vars(
            [(MAX_WORKERS, Some("lots")), (INPUT_FILE_MAX_BYTES, Some("-3"))],
            || {
                let settings = Settings::from_env();
                assert_eq!(settings.max_workers, 4);
                assert_eq!(settings.input_file_max_bytes, 20 * MIB);
            },
        );
    }

    #[test]
    fn zero_workers_clamped() {
        temp_env::with_var(MAX_WORKERS, Some("0"), || {
            assert_eq!(Settings::from_env().max_workers, 1);
        });
    }
}
