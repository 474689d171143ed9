use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, time::timeout};

use crate::{
    runner::{self, CPU_LIMIT, MEMORY_LIMIT},
    settings::Settings,
};

const CACHE_TTL: Duration = Duration::from_secs(300);
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

// Runs inside the guest image; prints one JSON document on stdout.
const INTROSPECTION_SNIPPET: &str = r#"import json, platform
pkgs={}
try:
    from importlib import metadata
    for d in metadata.distributions():
        n=(d.metadata.get('Name') or '').strip()
        if n:
            pkgs[n]=getattr(d,'version','') or ''
except Exception:
    pkgs={}
items=[{'name':k,'version':v} for k,v in pkgs.items()]
items.sort(key=lambda x: x['name'].lower())
print(json.dumps({'pythonVersion': platform.python_version(), 'installedPackages': items}, ensure_ascii=False))
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub(crate) struct PackageInfo {
    pub(crate) name: String,
    pub(crate) version: String,
}

/// What a one-shot introspection of the guest image reported.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapabilityInfo {
    pub(crate) ok: bool,
    pub(crate) python_version: Option<String>,
    pub(crate) installed_packages: Vec<PackageInfo>,
    pub(crate) error: Option<String>,
}

/// Lazily introspects the guest image, remembering the answer per image id
/// for five minutes.
pub(crate) struct CapabilityProbe {
    cache: Mutex<HashMap<String, (Instant, CapabilityInfo)>>,
}

impl CapabilityProbe {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    pub(crate) async fn runtime_info(&self, settings: &Settings) -> CapabilityInfo {
        let mut cache = self.cache.lock().await;
        if let Some((at, info)) = cache.get(&settings.docker_image) {
            if at.elapsed() < CACHE_TTL {
                return info.clone();
            }
        }

        let info = match inspect_image(settings).await {
            Ok(info) => info,
            Err(e) => CapabilityInfo { error: Some(format!("{e:#}")), ..CapabilityInfo::default() },
        };
        cache.insert(settings.docker_image.clone(), (Instant::now(), info.clone()));
        info
    }

    /// The full capability document the HTTP collaborator serves.
    pub(crate) async fn document(&self, settings: &Settings) -> CapabilitiesDocument {
        let runtime = self.runtime_info(settings).await;
        CapabilitiesDocument::new(settings, runtime)
    }
}

async fn inspect_image(settings: &Settings) -> Result<CapabilityInfo> {
    let mut cmd = settings.runner.as_cmd();
    cmd.args(["run", "--rm", "--network", settings.docker_network_mode.as_str()]);
    cmd.args([
        format!("--memory={MEMORY_LIMIT}"),
        format!("--cpus={CPU_LIMIT}"),
        format!("--pids-limit={}", settings.docker_pids_limit),
    ]);
    cmd.arg(&settings.docker_image);
    cmd.args(["python", "-c", INTROSPECTION_SNIPPET]);

    info!("Introspecting guest image {}", settings.docker_image);
    let out = timeout(PROBE_TIMEOUT, runner::exec(cmd))
        .await
        .map_err(|_| anyhow!("Introspection timed out after {PROBE_TIMEOUT:?}"))??;
    if !out.success() {
        let message = [out.stderr.trim(), out.stdout.trim(), "probe run failed"]
            .into_iter()
            .find(|s| !s.is_empty())
            .expect("PROOF: last candidate is non-empty")
            .to_owned();
        return Ok(CapabilityInfo { error: Some(message), ..CapabilityInfo::default() });
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ProbeOutput {
        python_version: Option<String>,
        #[serde(default)]
        installed_packages: Vec<PackageInfo>,
    }
    let ProbeOutput { python_version, installed_packages } =
        serde_json::from_str(out.stdout.trim()).map_err(|_| {
            anyhow!("invalid json output from executor image")
        })?;

    Ok(CapabilityInfo { ok: true, python_version, installed_packages, error: None })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CapabilitiesDocument {
    pub(crate) python_version: Option<String>,
    pub(crate) installed_packages: Vec<PackageInfo>,
    pub(crate) limits: Limits,
    pub(crate) network_policy: NetworkPolicy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Limits {
    pub(crate) max_concurrency: usize,
    pub(crate) execution_timeout_seconds: u64,
    pub(crate) container: ContainerLimits,
    pub(crate) input: IoLimits,
    pub(crate) output: OutputLimits,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContainerLimits {
    pub(crate) memory: String,
    pub(crate) cpus: u32,
    pub(crate) pids_limit: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IoLimits {
    pub(crate) max_files: usize,
    pub(crate) max_file_bytes: u64,
    pub(crate) total_max_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OutputLimits {
    pub(crate) max_files: usize,
    pub(crate) max_file_bytes: u64,
    pub(crate) total_max_bytes: u64,
    pub(crate) allowed_extensions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NetworkPolicy {
    pub(crate) executor_network_mode: String,
    pub(crate) internet_access: bool,
    pub(crate) supports_http_input_files: bool,
    pub(crate) supports_pip_install: bool,
    pub(crate) introspection: Introspection,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Introspection {
    pub(crate) ok: bool,
    pub(crate) error: Option<String>,
}

impl CapabilitiesDocument {
    #[must_use]
    pub(crate) fn new(settings: &Settings, runtime: CapabilityInfo) -> Self {
        let internet_access =
            !settings.docker_network_mode.trim().eq_ignore_ascii_case("none");
        Self {
            python_version: runtime.python_version,
            installed_packages: runtime.installed_packages,
            limits: Limits {
                max_concurrency: settings.max_workers,
                execution_timeout_seconds: settings.execution_timeout,
                container: ContainerLimits {
                    memory: MEMORY_LIMIT.to_owned(),
                    cpus: 1,
                    pids_limit: settings.docker_pids_limit,
                },
                input: IoLimits {
                    max_files: settings.input_max_files,
                    max_file_bytes: settings.input_file_max_bytes,
                    total_max_bytes: settings.input_total_max_bytes,
                },
                output: OutputLimits {
                    max_files: settings.output_max_files,
                    max_file_bytes: settings.output_file_max_bytes,
                    total_max_bytes: settings.output_total_max_bytes,
                    allowed_extensions: settings
                        .output_allowed_extensions
                        .iter()
                        .cloned()
                        .collect(),
                },
            },
            network_policy: NetworkPolicy {
                executor_network_mode: settings.docker_network_mode.clone(),
                internet_access,
                supports_http_input_files: true,
                supports_pip_install: internet_access,
                introspection: Introspection { ok: runtime.ok, error: runtime.error },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn runtime() -> CapabilityInfo {
        CapabilityInfo {
            ok: true,
            python_version: Some("3.12.4".to_owned()),
            installed_packages: vec![PackageInfo {
                name: "numpy".to_owned(),
                version: "2.1.0".to_owned(),
            }],
            error: None,
        }
    }

    #[test]
    fn document_shape_is_camel_cased() {
        let doc = CapabilitiesDocument::new(&Settings::default(), runtime());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["pythonVersion"], "3.12.4");
        assert_eq!(json["installedPackages"][0]["name"], "numpy");
        assert_eq!(json["limits"]["maxConcurrency"], 4);
        assert_eq!(json["limits"]["executionTimeoutSeconds"], 30);
        assert_eq!(json["limits"]["container"]["memory"], "1g");
        assert_eq!(json["limits"]["container"]["pidsLimit"], 256);
        assert_eq!(json["limits"]["input"]["maxFiles"], 10);
        assert_eq!(json["limits"]["output"]["allowedExtensions"][0], "csv");
        assert_eq!(json["networkPolicy"]["executorNetworkMode"], "bridge");
        assert_eq!(json["networkPolicy"]["internetAccess"], true);
        assert_eq!(json["networkPolicy"]["supportsHttpInputFiles"], true);
        assert_eq!(json["networkPolicy"]["introspection"]["ok"], true);
        assert_eq!(json["networkPolicy"]["introspection"]["error"], serde_json::Value::Null);
    }

    #[test]
    fn network_none_disables_pip_and_internet() {
        let settings =
            Settings { docker_network_mode: "none".to_owned(), ..Settings::default() };
        let doc = CapabilitiesDocument::new(&settings, runtime());
        assert!(!doc.network_policy.internet_access);
        assert!(!doc.network_policy.supports_pip_install);
        assert!(doc.network_policy.supports_http_input_files);
    }

    #[test]
    fn probe_output_parses_the_introspection_shape() {
        let payload = r#"{"pythonVersion": "3.12.4", "installedPackages": [{"name": "pandas", "version": "2.2.2"}]}"#;
        let parsed: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed["pythonVersion"], "3.12.4");
        // the snippet prints exactly these two keys
        assert!(INTROSPECTION_SNIPPET.contains("pythonVersion"));
        assert!(INTROSPECTION_SNIPPET.contains("installedPackages"));
    }

    #[tokio::test]
    async fn cache_serves_fresh_entries_without_reprobing() {
        let probe = CapabilityProbe::new();
        let settings = Settings::default();
        probe
            .cache
            .lock()
            .await
            .insert(settings.docker_image.clone(), (Instant::now(), runtime()));

        let info = probe.runtime_info(&settings).await;
        assert!(info.ok);
        assert_eq!(info.python_version.as_deref(), Some("3.12.4"));
    }
}
