use std::{fs::Permissions, os::unix::fs::PermissionsExt};

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use log::warn;
use tokio::fs;

use crate::names::ExecutionId;

pub(crate) const CODE_FILE_NAME: &str = "code.py";
pub(crate) const INPUT_DIR_NAME: &str = "input";
pub(crate) const OUTPUT_DIR_NAME: &str = "output";
pub(crate) const INPUT_MAP_FILE_NAME: &str = "input_map.json";

// The sandbox runs as a non-root user: dirs must stay writable and the
// script readable from inside the container.
const DIR_MODE: u32 = 0o777;
const FILE_MODE: u32 = 0o666;

/// Host directory owned by exactly one in-flight request.
#[derive(Debug)]
pub(crate) struct Workspace {
    root: Utf8PathBuf,
}

impl Workspace {
    /// Creates `{base}/{id}` with its `input/` and `output/` subdirs.
    pub(crate) async fn create(base: &Utf8Path, id: &ExecutionId) -> Result<Self> {
        let root = base.join(id.to_string());
        for dir in [&root, &root.join(INPUT_DIR_NAME), &root.join(OUTPUT_DIR_NAME)] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| anyhow!("Failed creating workspace dir {dir}: {e}"))?;
            fs::set_permissions(dir, Permissions::from_mode(DIR_MODE))
                .await
                .map_err(|e| anyhow!("Failed opening up {dir}: {e}"))?;
        }
        Ok(Self { root })
    }

    #[must_use]
    pub(crate) fn code_path(&self) -> Utf8PathBuf {
        self.root.join(CODE_FILE_NAME)
    }

    #[must_use]
    pub(crate) fn input_dir(&self) -> Utf8PathBuf {
        self.root.join(INPUT_DIR_NAME)
    }

    #[must_use]
    pub(crate) fn output_dir(&self) -> Utf8PathBuf {
        self.root.join(OUTPUT_DIR_NAME)
    }

    #[must_use]
    pub(crate) fn input_map_path(&self) -> Utf8PathBuf {
        self.root.join(INPUT_MAP_FILE_NAME)
    }

    pub(crate) async fn write_script(&self, code: &str) -> Result<()> {
        let path = self.code_path();
        fs::write(&path, code)
            .await
            .map_err(|e| anyhow!("Failed writing guest script {path}: {e}"))?;
        fs::set_permissions(&path, Permissions::from_mode(FILE_MODE))
            .await
            .map_err(|e| anyhow!("Failed opening up {path}: {e}"))?;
        Ok(())
    }

    /// Persists the URL to guest-path map next to the script, so the guest
    /// can rewrite references to its downloaded inputs.
    pub(crate) async fn write_input_map(&self, map: &IndexMap<String, String>) -> Result<()> {
        let path = self.input_map_path();
        let json = serde_json::to_string_pretty(map).expect("PROOF: string map");
        fs::write(&path, json)
            .await
            .map_err(|e| anyhow!("Failed writing input map {path}: {e}"))?;
        fs::set_permissions(&path, Permissions::from_mode(FILE_MODE))
            .await
            .map_err(|e| anyhow!("Failed opening up {path}: {e}"))?;
        Ok(())
    }

    /// Removes the whole tree. Runs on every completion path; never fails
    /// the request.
    pub(crate) async fn teardown(self) {
        if let Err(e) = fs::remove_dir_all(&self.root).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Leaving workspace {} behind: {e}", self.root);
            }
        }
    }
}
