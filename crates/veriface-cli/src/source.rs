//! Image sources: file paths, http(s) URLs, `data:` URLs and bare base64.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;

/// Load the bytes named by `source`.
pub fn load(source: &str) -> Result<Vec<u8>> {
    if let Some(rest) = source.strip_prefix("data:") {
        return decode_data_url(rest);
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return fetch(source);
    }
    let path = Path::new(source);
    if path.exists() {
        return std::fs::read(path).with_context(|| format!("failed to read {}", path.display()));
    }
    STANDARD
        .decode(source.trim())
        .context("source is not a readable file, URL or base64 payload")
}

/// `rest` is everything after `data:`.
fn decode_data_url(rest: &str) -> Result<Vec<u8>> {
    let Some((header, payload)) = rest.split_once(',') else {
        bail!("malformed data URL: missing ','");
    };
    if header.split(';').any(|part| part == "base64") {
        STANDARD
            .decode(payload.trim())
            .context("malformed base64 in data URL")
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

fn fetch(url: &str) -> Result<Vec<u8>> {
    tracing::debug!(url, "fetching image");
    let resp = ureq::get(url)
        .call()
        .with_context(|| format!("failed to download {url}"))?;
    let bytes = resp
        .into_body()
        .read_to_vec()
        .with_context(|| format!("failed to read response body from {url}"))?;
    tracing::debug!(url, bytes = bytes.len(), "image fetched");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_data_url() {
        let encoded = STANDARD.encode(b"{\"detections\":[]}");
        let bytes = load(&format!("data:application/json;base64,{encoded}")).unwrap();
        assert_eq!(bytes, b"{\"detections\":[]}");
    }

    #[test]
    fn test_plain_data_url() {
        let bytes = load("data:application/json,{}").unwrap();
        assert_eq!(bytes, b"{}");
    }

    #[test]
    fn test_malformed_data_url() {
        assert!(load("data:application/json;base64").is_err());
    }

    #[test]
    fn test_bare_base64() {
        let encoded = STANDARD.encode(b"hello");
        assert_eq!(load(&encoded).unwrap(), b"hello");
    }

    #[test]
    fn test_file_path() {
        let path = std::env::temp_dir().join(format!("veriface-source-{}.json", std::process::id()));
        std::fs::write(&path, b"[1,2,3]").unwrap();
        assert_eq!(load(path.to_str().unwrap()).unwrap(), b"[1,2,3]");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_unreadable_source() {
        let err = load("/definitely/not/here.png").unwrap_err();
        assert!(err.to_string().contains("not a readable file"));
    }
}
