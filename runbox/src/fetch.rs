use std::{collections::HashSet, time::Duration};

use anyhow::{anyhow, bail, Result};
use camino::Utf8Path;
use indexmap::IndexMap;
use log::info;
use percent_encoding::percent_decode_str;
use reqwest::{header::CONTENT_DISPOSITION, Client, Response};
use tokio::{fs::File, io::AsyncWriteExt};
use url::Url;

use crate::{
    names::SafeName,
    service::{InputFile, GUEST_INPUT_DIR},
    settings::Settings,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Default)]
pub(crate) struct FetchedInputs {
    /// URL to guest path, in request order. Written next to the script so
    /// the guest can rewrite references.
    pub(crate) map: IndexMap<String, String>,
    pub(crate) inputs: Vec<InputFile>,
}

/// Downloads every request URL into the workspace input dir, enforcing the
/// three input budgets. Any breach fails the whole request; partial
/// downloads are discarded with the workspace.
pub(crate) async fn download_input_files(
    settings: &Settings,
    input_dir: &Utf8Path,
    urls: &[String],
) -> Result<FetchedInputs> {
    if urls.is_empty() {
        return Ok(FetchedInputs::default());
    }
    if urls.len() > settings.input_max_files {
        bail!("Too many input files: {} > {}", urls.len(), settings.input_max_files);
    }

    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| anyhow!("HTTP client's config/TLS failed: {e}"))?;

    let mut fetched = FetchedInputs::default();
    let mut taken: HashSet<String> = HashSet::new();
    let mut total_bytes = 0;
    for raw_url in urls {
        let url = Url::parse(raw_url).map_err(|e| anyhow!("Bad input URL {raw_url:?}: {e}"))?;
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| anyhow!("Failed fetching {raw_url}: {e}"))?;
        if !resp.status().is_success() {
            bail!("Failed fetching {raw_url}: HTTP {}", resp.status());
        }

        let resolved = local_file_name(&url, &resp)
            .ok_or_else(|| anyhow!("No usable filename for input URL {raw_url}"))?;
        let name = dedupe_name(resolved.clone(), &taken);
        taken.insert(name.to_string());

        let local_path = input_dir.join(name.to_string());
        let size_bytes =
            stream_to_file(resp, &local_path, settings.input_file_max_bytes).await?;
        total_bytes += size_bytes;
        if total_bytes > settings.input_total_max_bytes {
            bail!(
                "Input files exceed total budget: {total_bytes} > {}",
                settings.input_total_max_bytes
            );
        }
        info!("Downloaded {raw_url} to {local_path} ({size_bytes}B)");

        fetched.map.insert(raw_url.clone(), format!("{GUEST_INPUT_DIR}/{name}"));
        fetched.inputs.push(InputFile {
            url: raw_url.clone(),
            original_name: resolved.to_string(),
            local_name: name.to_string(),
            size_bytes,
        });
    }
    Ok(fetched)
}

async fn stream_to_file(mut resp: Response, path: &Utf8Path, max_bytes: u64) -> Result<u64> {
    let mut file =
        File::create(path).await.map_err(|e| anyhow!("Failed creating {path}: {e}"))?;
    let mut written = 0;
    while let Some(chunk) =
        resp.chunk().await.map_err(|e| anyhow!("Failed reading download body: {e}"))?
    {
        written += chunk.len() as u64;
        if written > max_bytes {
            bail!("Input file too large: more than {max_bytes} bytes");
        }
        file.write_all(&chunk).await.map_err(|e| anyhow!("Failed writing {path}: {e}"))?;
    }
    file.flush().await.map_err(|e| anyhow!("Failed flushing {path}: {e}"))?;
    Ok(written)
}

/// Picks the local filename: `filename` query parameter, then
/// `Content-Disposition` (`filename*` before `filename=`), then the last
/// path segment. Names that sanitize away fall through to the next source.
#[must_use]
fn local_file_name(url: &Url, resp: &Response) -> Option<SafeName> {
    let from_query = url
        .query_pairs()
        .find(|(key, _)| key.as_ref() == "filename")
        .map(|(_, value)| value.into_owned());

    let from_disposition = resp
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(content_disposition_filename);

    let from_path = url
        .path_segments()
        .and_then(|segments| segments.last().map(ToOwned::to_owned))
        .map(|segment| percent_decode_str(&segment).decode_utf8_lossy().into_owned());

    [from_query, from_disposition, from_path]
        .into_iter()
        .flatten()
        .find_map(|candidate| SafeName::try_new(candidate).ok())
}

/// RFC 6266: prefer the RFC 5987 `filename*` parameter over plain `filename=`.
#[must_use]
fn content_disposition_filename(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            // ext-value: charset '' percent-encoded, e.g. UTF-8''na%C3%AFve.csv
            let encoded = value.splitn(3, '\'').nth(2)?;
            return Some(percent_decode_str(encoded).decode_utf8_lossy().into_owned());
        }
        if let Some(value) = part.strip_prefix("filename=") {
            plain = Some(value.trim_matches('"').to_owned());
        }
    }
    plain
}

/// Resolves in-request collisions by suffixing `_n` before the extension.
#[must_use]
fn dedupe_name(name: SafeName, taken: &HashSet<String>) -> SafeName {
    if !taken.contains(name.as_str()) {
        return name;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_owned(), Some(ext.to_owned())),
        _ => (name.to_string(), None),
    };
    for n in 1.. {
        let candidate = match &ext {
            Some(ext) => format!("{stem}_{n}.{ext}"),
            None => format!("{stem}_{n}"),
        };
        if !taken.contains(&candidate) {
            return SafeName::try_new(candidate).expect("PROOF: suffixed a safe name");
        }
    }
    unreachable!("ran out of integers")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn filename_query_param_wins_and_is_decoded() {
        // 工作簿1_副本.csv, percent-encoded
        let url = Url::parse(
            "http://host/api/common/file/read?filename=%E5%B7%A5%E4%BD%9C%E7%B0%BF1_%E5%89%AF%E6%9C%AC.csv&token=x",
        )
        .unwrap();
        let name = url
            .query_pairs()
            .find(|(key, _)| key.as_ref() == "filename")
            .map(|(_, value)| value.into_owned())
            .unwrap();
        assert_eq!(name, "工作簿1_副本.csv");
        assert!(SafeName::try_new(name).is_ok());
    }

    #[test_case(r#"attachment; filename="data.csv""#, Some("data.csv"); "quoted")]
    #[test_case("attachment; filename=data.csv", Some("data.csv"); "bare")]
    #[test_case(
        "attachment; filename*=UTF-8''na%C3%AFve.csv; filename=\"wrong.txt\"",
        Some("naïve.csv");
        "rfc5987 wins over plain"
    )]
    #[test_case("attachment", None; "no filename")]
    #[test_case("inline; filename*=UTF-8''%E5%89%AF%E6%9C%AC.csv", Some("副本.csv"); "encoded utf8")]
    fn content_disposition(header: &str, expected: Option<&str>) {
        assert_eq!(content_disposition_filename(header).as_deref(), expected);
    }

    #[test]
    fn path_segment_fallback() {
        let url = Url::parse("http://host/files/report%20final.csv").unwrap();
        let segment = url.path_segments().unwrap().last().unwrap();
        let decoded = percent_decode_str(segment).decode_utf8_lossy().into_owned();
        assert_eq!(decoded, "report final.csv");
    }

    #[test]
    fn collisions_get_numbered_before_extension() {
        let mut taken = HashSet::new();
        for expected in ["data.csv", "data_1.csv", "data_2.csv"] {
            let name = dedupe_name(SafeName::try_new("data.csv").unwrap(), &taken);
            assert_eq!(name.as_str(), expected);
            taken.insert(name.to_string());
        }
    }

    #[test]
    fn collisions_without_extension() {
        let taken = HashSet::from(["README".to_owned()]);
        let name = dedupe_name(SafeName::try_new("README").unwrap(), &taken);
        assert_eq!(name.as_str(), "README_1");
    }

    #[tokio::test]
    async fn rejects_too_many_files() {
        let settings = Settings { input_max_files: 1, ..Settings::default() };
        let urls = vec!["http://host/a".to_owned(), "http://host/b".to_owned()];
        let err = download_input_files(&settings, Utf8Path::new("/nonexistent"), &urls)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many input files"));
    }

    #[tokio::test]
    async fn rejects_malformed_urls() {
        let settings = Settings::default();
        let urls = vec!["not a url".to_owned()];
        let err = download_input_files(&settings, Utf8Path::new("/nonexistent"), &urls)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Bad input URL"));
    }

    #[tokio::test]
    async fn no_urls_is_a_noop() {
        let fetched =
            download_input_files(&Settings::default(), Utf8Path::new("/nonexistent"), &[])
                .await
                .unwrap();
        assert!(fetched.map.is_empty());
        assert!(fetched.inputs.is_empty());
    }
}
