// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! Builtin: `builtin:fetchurl` — download a URL to `$out`.
//!
//! The derivation env must carry `url`, `outputHash` and `outputHashMode`
//! (`flat` or `recursive`); the declared fixed output is what actually
//! pins the bytes, and the shared fixed-output verification re-checks it
//! after this builtin runs. Network fetches retry with exponential
//! backoff; `file://` URLs read straight from disk.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::build::BuildError;

const FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

pub(crate) async fn run(
    env: &BTreeMap<String, String>,
    out_path: &Path,
) -> Result<(), BuildError> {
    let url = env
        .get("url")
        .ok_or_else(|| BuildError::Other("builtin:fetchurl requires 'url' env var".into()))?;
    // outputHash/outputHashMode are required by the scheme; their values
    // are enforced via the derivation's fixed output.
    for key in ["outputHash", "outputHashMode"] {
        if !env.contains_key(key) {
            return Err(BuildError::Other(format!(
                "builtin:fetchurl requires '{key}' env var"
            )));
        }
    }
    match env.get("outputHashMode").map(String::as_str) {
        Some("flat") | Some("recursive") => {}
        Some(other) => {
            return Err(BuildError::Other(format!(
                "builtin:fetchurl: unknown outputHashMode '{other}'"
            )));
        }
        None => unreachable!("checked above"),
    }

    if let Some(file_path) = url.strip_prefix("file://") {
        let contents = tokio::fs::read(file_path)
            .await
            .map_err(|e| BuildError::Other(format!("builtin:fetchurl reading '{file_path}': {e}")))?;
        tokio::fs::write(out_path, contents)
            .await
            .map_err(|e| BuildError::Other(format!("builtin:fetchurl writing output: {e}")))?;
        return Ok(());
    }

    let client = reqwest::Client::builder()
        .user_agent("crucible-daemon")
        .build()
        .map_err(|e| BuildError::Other(format!("builtin:fetchurl client setup: {e}")))?;

    let mut last_error = String::new();
    for attempt in 0..FETCH_ATTEMPTS {
        if attempt > 0 {
            let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
            warn!(url, attempt, "fetch failed, retrying after {backoff:?}: {last_error}");
            tokio::time::sleep(backoff).await;
        }
        match fetch_once(&client, url, out_path).await {
            Ok(()) => {
                debug!(url, "fetch complete");
                return Ok(());
            }
            Err(e) => last_error = e,
        }
    }

    Err(BuildError::Other(format!(
        "builtin:fetchurl: giving up on '{url}' after {FETCH_ATTEMPTS} attempts: {last_error}"
    )))
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    out_path: &Path,
) -> Result<(), String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| e.to_string())?
        .error_for_status()
        .map_err(|e| e.to_string())?;

    let mut file = tokio::fs::File::create(out_path)
        .await
        .map_err(|e| format!("creating output: {e}"))?;

    let mut stream = response.bytes_stream();
    use futures::StreamExt as _;
    use tokio::io::AsyncWriteExt as _;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("writing output: {e}"))?;
    }
    file.flush().await.map_err(|e| format!("flushing output: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod unittests {
    use super::*;

    #[tokio::test]
    async fn file_url_copies_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        std::fs::write(&source, b"fetched bytes").unwrap();

        let env = BTreeMap::from([
            ("url".to_string(), format!("file://{}", source.display())),
            ("outputHash".to_string(), "sha256:unchecked-here".into()),
            ("outputHashMode".to_string(), "flat".into()),
        ]);
        let out = dir.path().join("out");
        run(&env, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"fetched bytes");
    }

    #[tokio::test]
    async fn missing_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::new();
        assert!(run(&env, &dir.path().join("out")).await.is_err());
    }

    #[tokio::test]
    async fn bad_hash_mode_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([
            ("url".to_string(), "file:///dev/null".to_string()),
            ("outputHash".to_string(), "sha256:x".into()),
            ("outputHashMode".to_string(), "sideways".into()),
        ]);
        assert!(run(&env, &dir.path().join("out")).await.is_err());
    }
}
