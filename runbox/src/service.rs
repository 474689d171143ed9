use serde::Serialize;

use crate::settings::Settings;

/// Paths the guest sees, fixed across pooled and one-shot sandboxes.
pub(crate) const GUEST_SCRIPT_PATH: &str = "/code/script.py";
pub(crate) const GUEST_INPUT_DIR: &str = "/code/input";
pub(crate) const GUEST_INPUT_MAP_PATH: &str = "/code/input_map.json";
pub(crate) const GUEST_OUTPUT_DIR: &str = "/code/output";
/// Name the chart epilogue saves under; never published as a plain output file.
pub(crate) const CHART_FILE_NAME: &str = "result.png";

#[derive(Debug, Clone, Default)]
pub(crate) struct ExecuteRequest {
    pub(crate) code: String,
    pub(crate) files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct InputFile {
    pub(crate) url: String,
    pub(crate) original_name: String,
    pub(crate) local_name: String,
    pub(crate) size_bytes: u64,
}

impl InputFile {
    #[must_use]
    pub(crate) fn local_path(&self) -> String {
        format!("{GUEST_INPUT_DIR}/{}", self.local_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OutputFile {
    pub(crate) filename: String,
    pub(crate) original_name: String,
    pub(crate) size_bytes: u64,
}

/// What one execution produced. A non-empty `stderr` means the request failed;
/// consumers key on that, never on transport status.
#[derive(Debug, Default)]
pub(crate) struct ExecuteResult {
    pub(crate) stdout: String,
    pub(crate) stderr: Option<String>,
    pub(crate) execution_time: f64,
    pub(crate) image_filename: Option<String>,
    pub(crate) files: Vec<OutputFile>,
    pub(crate) inputs: Vec<InputFile>,
}

impl ExecuteResult {
    #[must_use]
    pub(crate) fn failed(stderr: impl ToString, execution_time: f64) -> Self {
        Self {
            stderr: Some(stderr.to_string()),
            execution_time,
            ..Self::default()
        }
    }

    /// The JSON shape the HTTP collaborator hands to downstream consumers.
    #[must_use]
    pub(crate) fn to_payload(&self, settings: &Settings) -> Payload {
        Payload {
            result: self.stdout.clone(),
            error: self.stderr.clone(),
            execution_time: self.execution_time,
            image_url: self.image_filename.as_deref().map(|filename| {
                join_public_url(
                    &settings.public_base_url,
                    &format!("{}/{filename}", settings.image_url_prefix.trim_end_matches('/')),
                )
            }),
            files: self
                .files
                .iter()
                .map(|f| FilePayload {
                    filename: f.filename.clone(),
                    original_name: f.original_name.clone(),
                    size_bytes: f.size_bytes,
                    url: join_public_url(
                        &settings.public_base_url,
                        &format!(
                            "{}/{}",
                            settings.file_url_prefix.trim_end_matches('/'),
                            f.filename
                        ),
                    ),
                })
                .collect(),
            inputs: self
                .inputs
                .iter()
                .map(|i| InputPayload {
                    url: i.url.clone(),
                    original_name: i.original_name.clone(),
                    local_name: i.local_name.clone(),
                    local_path: i.local_path(),
                    size_bytes: i.size_bytes,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Payload {
    pub(crate) result: String,
    pub(crate) error: Option<String>,
    pub(crate) execution_time: f64,
    pub(crate) image_url: Option<String>,
    pub(crate) files: Vec<FilePayload>,
    pub(crate) inputs: Vec<InputPayload>,
}

#[derive(Debug, Serialize)]
pub(crate) struct FilePayload {
    pub(crate) filename: String,
    pub(crate) original_name: String,
    pub(crate) size_bytes: u64,
    pub(crate) url: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct InputPayload {
    pub(crate) url: String,
    pub(crate) original_name: String,
    pub(crate) local_name: String,
    pub(crate) local_path: String,
    pub(crate) size_bytes: u64,
}

#[must_use]
fn join_public_url(public_base_url: &str, path: &str) -> String {
    let base = public_base_url.trim();
    if base.is_empty() {
        return path.to_owned();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// The narrow contract the HTTP collaborator depends on. An in-process fake
/// satisfies it for transport-level tests.
pub(crate) trait ExecutionService {
    async fn initialize(&self) -> anyhow::Result<()>;
    async fn execute(&self, request: ExecuteRequest) -> ExecuteResult;
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn result_with_artifacts() -> ExecuteResult {
        ExecuteResult {
            stdout: "ok\n".to_owned(),
            stderr: None,
            execution_time: 0.5,
            image_filename: Some("plot_deadbeef_1700000000.png".to_owned()),
            files: vec![OutputFile {
                filename: "out_deadbeef_1_note.md".to_owned(),
                original_name: "note.md".to_owned(),
                size_bytes: 2,
            }],
            inputs: vec![InputFile {
                url: "http://host/api?filename=data.csv".to_owned(),
                original_name: "data.csv".to_owned(),
                local_name: "data.csv".to_owned(),
                size_bytes: 9,
            }],
        }
    }

    #[test]
    fn payload_without_public_base() {
        let payload = result_with_artifacts().to_payload(&Settings::default());
        assert_eq!(payload.image_url.as_deref(), Some("/images/plot_deadbeef_1700000000.png"));
        assert_eq!(payload.files[0].url, "/files/out_deadbeef_1_note.md");
        assert_eq!(payload.inputs[0].local_path, "/code/input/data.csv");
        assert_eq!(payload.error, None);
    }

    #[test]
    fn payload_with_public_base() {
        let settings = Settings {
            public_base_url: "https://broker.example/".to_owned(),
            ..Settings::default()
        };
        let payload = result_with_artifacts().to_payload(&settings);
        assert_eq!(
            payload.image_url.as_deref(),
            Some("https://broker.example/images/plot_deadbeef_1700000000.png")
        );
        assert_eq!(payload.files[0].url, "https://broker.example/files/out_deadbeef_1_note.md");
    }

    #[test]
    fn payload_serializes_null_error_on_success() {
        let payload = result_with_artifacts().to_payload(&Settings::default());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["error"], serde_json::Value::Null);
        assert_eq!(json["result"], "ok\n");
        assert_eq!(json["files"][0]["size_bytes"], 2);
    }

    #[test]
    fn failed_results_keep_timing() {
        let result = ExecuteResult::failed("Execution timeout", 2.3);
        assert_eq!(result.stderr.as_deref(), Some("Execution timeout"));
        assert_eq!(result.execution_time, 2.3);
        assert_eq!(result.stdout, "");
        assert!(result.files.is_empty());
    }
}
