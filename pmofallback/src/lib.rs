//! External-script fallback adapters, run as short-lived subprocesses.
//!
//! When every registered [`pmosource::Resolver`] has failed, the
//! coordinator falls back to a configured, ordered list of external
//! script URLs. Each script is downloaded once (content-addressed by
//! `md5(url)`), then invoked through a small embedded runtime host file
//! via the configured interpreter. The subprocess's last non-empty stdout
//! line is the response envelope.

use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Small adapter the interpreter loads before the user script. It exposes
/// a `require`-free `main(source, songId, quality, infoJson)` convention
/// so fallback scripts do not need to know the protocol's exact stdout
/// framing.
const RUN_EXTERNAL_HOST: &str = r#"// Auto-generated by pmofallback. Do not edit.
const [, , scriptPath, source, songId, quality, infoJson] = process.argv;
const script = require(scriptPath);

(async () => {
    try {
        const info = infoJson ? JSON.parse(infoJson) : {};
        const result = await script.url(source, songId, quality, info);
        console.log(JSON.stringify({ code: 0, data: result.url, quality: result.quality || quality }));
    } catch (err) {
        console.log(JSON.stringify({ code: 2, msg: String(err && err.message ? err.message : err) }));
    }
})();
"#;

const HOST_FILE_NAME: &str = "run_external.js";

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("downloading fallback script: {0}")]
    Download(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interpreter {0:?} could not be spawned")]
    InterpreterMissing(String),
    #[error("subprocess exited with non-zero status")]
    NonZeroExit,
    #[error("subprocess produced no usable output")]
    MalformedOutput,
    #[error("subprocess timed out")]
    Timeout,
    #[error("script reported failure: {0}")]
    ScriptFailed(String),
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Envelope {
    code: i32,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    quality: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FallbackSuccess {
    pub url: String,
    pub quality: String,
}

pub struct FallbackRunner {
    scripts_dir: PathBuf,
    interpreter: String,
    urls: Vec<String>,
    client: reqwest::Client,
    deadline: Duration,
}

impl FallbackRunner {
    pub fn new(scripts_dir: impl Into<PathBuf>, interpreter: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            interpreter: interpreter.into(),
            urls,
            client: reqwest::Client::new(),
            deadline: Duration::from_secs(15),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Refreshes every configured script from its URL, ignoring any
    /// already-cached copy. Intended for a one-shot call at startup.
    pub async fn refresh_all(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scripts_dir).await?;
        for url in &self.urls {
            if let Err(err) = self.ensure_script(url, true).await {
                warn!(%url, %err, "failed to refresh fallback script");
            }
        }
        Ok(())
    }

    /// Tries every configured fallback script in order, returning the
    /// first success. Every failure is logged and swallowed.
    pub async fn try_all(
        &self,
        source: &str,
        song_id: &str,
        quality: &str,
        info_json: &str,
    ) -> Option<FallbackSuccess> {
        tokio::fs::create_dir_all(&self.scripts_dir).await.ok()?;
        let host_file = match self.ensure_host_file().await {
            Ok(path) => path,
            Err(err) => {
                warn!(%err, "cannot materialize fallback runtime host file");
                return None;
            }
        };

        for url in &self.urls {
            let script_path = match self.ensure_script(url, false).await {
                Ok(path) => path,
                Err(err) => {
                    warn!(%url, %err, "fallback script unavailable");
                    continue;
                }
            };

            match self
                .invoke(&host_file, &script_path, source, song_id, quality, info_json)
                .await
            {
                Ok(success) => return Some(success),
                Err(err) => {
                    debug!(%url, %err, "fallback script did not resolve");
                }
            }
        }
        None
    }

    async fn ensure_host_file(&self) -> Result<PathBuf> {
        let path = self.scripts_dir.join(HOST_FILE_NAME);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::write(&path, RUN_EXTERNAL_HOST).await?;
        }
        Ok(path)
    }

    async fn ensure_script(&self, url: &str, force: bool) -> Result<PathBuf> {
        let digest = md5::compute(url.as_bytes());
        let path = self.scripts_dir.join(format!("{digest:x}.js"));
        if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        let body = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("downloading fallback script {url}"))?
            .error_for_status()
            .with_context(|| format!("fallback script {url} returned an error status"))?
            .bytes()
            .await?;
        tokio::fs::write(&path, &body).await?;
        Ok(path)
    }

    async fn invoke(
        &self,
        host_file: &PathBuf,
        script_file: &PathBuf,
        source: &str,
        song_id: &str,
        quality: &str,
        info_json: &str,
    ) -> Result<FallbackSuccess, FallbackError> {
        let mut command = Command::new(&self.interpreter);
        command
            .arg(host_file)
            .arg(script_file)
            .arg(source)
            .arg(song_id)
            .arg(quality)
            .arg(info_json)
            .kill_on_drop(true);

        let child = command
            .output();

        let output = match tokio::time::timeout(self.deadline, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    return Err(FallbackError::InterpreterMissing(self.interpreter.clone()));
                }
                return Err(FallbackError::Io(err));
            }
            Err(_) => return Err(FallbackError::Timeout),
        };

        if !output.status.success() {
            return Err(FallbackError::NonZeroExit);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or(FallbackError::MalformedOutput)?;

        let envelope: Envelope =
            serde_json::from_str(last_line.trim()).map_err(|_| FallbackError::MalformedOutput)?;

        if envelope.code == 0 {
            let data = envelope.data.ok_or(FallbackError::MalformedOutput)?;
            Ok(FallbackSuccess {
                url: data,
                quality: envelope.quality.unwrap_or_else(|| quality.to_string()),
            })
        } else {
            Err(FallbackError::ScriptFailed(
                envelope.msg.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_host_file_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FallbackRunner::new(dir.path(), "node", vec![]);
        let path = runner.ensure_host_file().await.unwrap();
        assert!(path.exists());
        let contents_first = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::write(&path, "modified").await.unwrap();
        let path_again = runner.ensure_host_file().await.unwrap();
        let contents_second = tokio::fs::read_to_string(&path_again).await.unwrap();
        assert_eq!(contents_second, "modified");
        assert_ne!(contents_first, contents_second);
    }

    #[tokio::test]
    async fn try_all_with_no_urls_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FallbackRunner::new(dir.path(), "node", vec![]);
        let result = runner.try_all("kw", "1", "320k", "{}").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_interpreter_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("deadbeefdeadbeefdeadbeefdeadbeef.js"), "").await.unwrap();
        let runner = FallbackRunner::new(dir.path(), "definitely-not-an-interpreter", vec![]);
        let host = runner.ensure_host_file().await.unwrap();
        let script = dir.path().join("deadbeefdeadbeefdeadbeefdeadbeef.js");
        let result = runner.invoke(&host, &script, "kw", "1", "320k", "{}").await;
        assert!(matches!(result, Err(FallbackError::InterpreterMissing(_))));
    }
}
