use std::{fs, os::unix::fs::PermissionsExt};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use log::{debug, warn};

use crate::{
    names::{ExecutionId, SafeName},
    service::{OutputFile, CHART_FILE_NAME},
    settings::Settings,
};

const STORE_FILE_MODE: u32 = 0o666;

/// What survived the allow-list and budgets, now sitting in the stores.
#[derive(Debug, Default)]
pub(crate) struct Harvest {
    pub(crate) files: Vec<OutputFile>,
    pub(crate) image_filename: Option<String>,
}

/// Publishes the run's chart and permitted output files into the persistent
/// stores. Best-effort on every entry: a corrupt listing never fails the
/// request, partial outputs of failed runs are still published.
pub(crate) async fn collect_outputs(
    settings: &Settings,
    id: &ExecutionId,
    output_dir: Utf8PathBuf,
) -> Harvest {
    let settings = settings.clone();
    let id_for_error = id.clone();
    let id = id.clone();
    tokio::task::spawn_blocking(move || Harvest {
        image_filename: publish_chart(&settings, &id, &output_dir),
        files: persist_output_files(&settings, &id, &output_dir),
    })
    .await
    .unwrap_or_else(|e| {
        warn!("Output collection for {id_for_error} aborted: {e}");
        Harvest::default()
    })
}

/// Moves `result.png` (if the run produced one) into the image store as
/// `plot_{id}_{unix_seconds}.png`.
#[must_use]
fn publish_chart(settings: &Settings, id: &ExecutionId, output_dir: &Utf8Path) -> Option<String> {
    let chart_path = output_dir.join(CHART_FILE_NAME);
    if !chart_path.is_file() {
        return None;
    }
    let filename = format!("plot_{id}_{}.png", Utc::now().timestamp());
    let stored = settings.image_store_path.join(&filename);
    if let Err(e) = fs::create_dir_all(&settings.image_store_path)
        .and_then(|()| move_file(&chart_path, &stored))
        .and_then(|()| fs::set_permissions(&stored, fs::Permissions::from_mode(STORE_FILE_MODE)))
    {
        warn!("Failed publishing chart for {id}: {e}");
        return None;
    }
    Some(filename)
}

#[must_use]
fn persist_output_files(
    settings: &Settings,
    id: &ExecutionId,
    output_dir: &Utf8Path,
) -> Vec<OutputFile> {
    if let Err(e) = fs::create_dir_all(&settings.file_store_path) {
        warn!("Failed creating file store {}: {e}", settings.file_store_path);
        return vec![];
    }
    let mut names: Vec<String> = match output_dir.read_dir_utf8() {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_owned())
            .collect(),
        Err(_) => return vec![], // no output dir, nothing produced
    };
    names.sort();

    let mut results = vec![];
    let mut total_bytes = 0;
    let mut index = 0;
    for name in names {
        if results.len() >= settings.output_max_files {
            break;
        }
        let Ok(safe) = SafeName::try_new(name.clone()) else { continue };
        if safe.as_str() != name || !allowed_output_name(settings, &name) {
            continue;
        }

        let src = output_dir.join(&name);
        if !src.is_file() {
            continue;
        }
        let Ok(size_bytes) = src.metadata().map(|md| md.len()) else { continue };
        if size_bytes == 0 || size_bytes > settings.output_file_max_bytes {
            continue;
        }
        if total_bytes + size_bytes > settings.output_total_max_bytes {
            break;
        }

        index += 1;
        let stored_name = format!("out_{id}_{index}_{name}");
        let dst = settings.file_store_path.join(&stored_name);
        if let Err(e) = move_file(&src, &dst).and_then(|()| {
            fs::set_permissions(&dst, fs::Permissions::from_mode(STORE_FILE_MODE))
        }) {
            debug!("Skipping output {name} for {id}: {e}");
            index -= 1;
            continue;
        }

        results.push(OutputFile {
            filename: stored_name,
            original_name: name,
            size_bytes,
        });
        total_bytes += size_bytes;
    }
    results
}

#[must_use]
fn allowed_output_name(settings: &Settings, name: &str) -> bool {
    if name == CHART_FILE_NAME {
        return false;
    }
    let Some((_, ext)) = name.rsplit_once('.') else { return false };
    settings.allows_extension(ext)
}

// The stores can live on another filesystem than the workspaces.
fn move_file(src: &Utf8Path, dst: &Utf8Path) -> std::io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Stores {
        _keep: tempfile::TempDir,
        settings: Settings,
        output_dir: Utf8PathBuf,
    }

    fn stores() -> Stores {
        let root = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(root.path()).unwrap();
        let output_dir = base.join("output");
        fs::create_dir_all(&output_dir).unwrap();
        let settings = Settings {
            image_store_path: base.join("images"),
            file_store_path: base.join("files"),
            ..Settings::default()
        };
        Stores { _keep: root, settings, output_dir }
    }

    fn write(dir: &Utf8Path, name: &str, contents: &[u8]) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[tokio::test]
    async fn accepts_allowed_files_in_sorted_order() {
        let Stores { settings, output_dir, .. } = &stores();
        let id = ExecutionId::random();
        write(output_dir, "b.csv", b"2,3\n");
        write(output_dir, "a.md", b"ok");

        let harvest = collect_outputs(settings, &id, output_dir.clone()).await;
        assert_eq!(harvest.image_filename, None);
        let [first, second] = &harvest.files[..] else { panic!("expected 2 files") };
        assert_eq!(first.original_name, "a.md");
        assert_eq!(first.filename, format!("out_{id}_1_a.md"));
        assert_eq!(first.size_bytes, 2);
        assert_eq!(second.original_name, "b.csv");
        assert_eq!(second.filename, format!("out_{id}_2_b.csv"));

        // moved, not copied
        assert!(!output_dir.join("a.md").exists());
        let stored = settings.file_store_path.join(&first.filename);
        assert_eq!(fs::read(stored).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn filters_reserved_disallowed_and_empty() {
        let Stores { settings, output_dir, .. } = &stores();
        let id = ExecutionId::random();
        write(output_dir, CHART_FILE_NAME, b"\x89PNG");
        write(output_dir, "binary.exe", b"MZ");
        write(output_dir, "empty.txt", b"");
        write(output_dir, "noext", b"data");
        write(output_dir, "note.md", b"ok");

        let harvest = collect_outputs(settings, &id, output_dir.clone()).await;
        let names: Vec<_> = harvest.files.iter().map(|f| f.original_name.as_str()).collect();
        assert_eq!(names, vec!["note.md"]);
    }

    #[tokio::test]
    async fn per_file_budget_skips_total_budget_stops() {
        let Stores { output_dir, settings, .. } = &stores();
        let settings = Settings {
            output_file_max_bytes: 4,
            output_total_max_bytes: 6,
            ..settings.clone()
        };
        let id = ExecutionId::random();
        write(output_dir, "1_ok.txt", b"aaaa");
        write(output_dir, "2_big.txt", b"aaaaaaaa"); // over per-file cap: skipped
        write(output_dir, "3_ok.txt", b"aa");
        write(output_dir, "4_never.txt", b"aa"); // total would exceed: stop

        let harvest = collect_outputs(&settings, &id, output_dir.clone()).await;
        let names: Vec<_> = harvest.files.iter().map(|f| f.original_name.as_str()).collect();
        assert_eq!(names, vec!["1_ok.txt", "3_ok.txt"]);
        let total: u64 = harvest.files.iter().map(|f| f.size_bytes).sum();
        assert!(total <= settings.output_total_max_bytes);
    }

    #[tokio::test]
    async fn file_count_is_capped() {
        let Stores { output_dir, settings, .. } = &stores();
        let settings = Settings { output_max_files: 2, ..settings.clone() };
        let id = ExecutionId::random();
        for i in 0..5 {
            write(output_dir, &format!("f{i}.log"), b"x");
        }
        let harvest = collect_outputs(&settings, &id, output_dir.clone()).await;
        assert_eq!(harvest.files.len(), 2);
    }

    #[tokio::test]
    async fn chart_moves_into_image_store() {
        let Stores { settings, output_dir, .. } = &stores();
        let id = ExecutionId::random();
        write(output_dir, CHART_FILE_NAME, b"\x89PNG fake");

        let harvest = collect_outputs(settings, &id, output_dir.clone()).await;
        let filename = harvest.image_filename.unwrap();
        assert!(filename.starts_with(&format!("plot_{id}_")));
        assert!(filename.ends_with(".png"));
        assert!(settings.image_store_path.join(&filename).is_file());
        assert!(!output_dir.join(CHART_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn missing_output_dir_yields_nothing() {
        let Stores { settings, output_dir, .. } = &stores();
        let id = ExecutionId::random();
        fs::remove_dir_all(output_dir).unwrap();
        let harvest = collect_outputs(settings, &id, output_dir.clone()).await;
        assert!(harvest.files.is_empty());
        assert_eq!(harvest.image_filename, None);
    }
}
