//! Background download and metadata embedding for resolved playback URLs.
//!
//! The materializer never fails the request that triggered it: every
//! transport error is retried a bounded number of times and, on
//! exhaustion, simply logged. Concurrent materializations racing on the
//! same final path are idempotent — the first writer to complete the
//! rename wins, the rest discover the file already present and return.

use futures::StreamExt;
use pmoartifacts::{store::ArtifactKey, ArtifactStore};
use pmometadata::{EmbedRequest, SongInfo as EmbedSongInfo};
use pmosource::SongInfo;
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

const CHUNK_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_AUDIO_EXTENSION: &str = "mp3";

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("transport error downloading {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Materializer {
    store: Arc<ArtifactStore>,
    client: reqwest::Client,
}

impl Materializer {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Downloads `remote_url` into the artifact store under `key`, unless
    /// a file for that key already exists. Retries transport failures up
    /// to [`CHUNK_RETRY_ATTEMPTS`] times with linear backoff.
    pub async fn materialize_audio(
        &self,
        key: ArtifactKey,
        remote_url: &str,
    ) -> Result<PathBuf, MaterializeError> {
        let ext = extension_from_url(remote_url).unwrap_or_else(|| DEFAULT_AUDIO_EXTENSION.to_string());
        let final_path = self.store.audio_path_with_ext(&key, &ext);

        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            debug!(path = %final_path.display(), "audio artifact already materialized");
            self.store.put(key, final_path.clone()).await;
            return Ok(final_path);
        }

        self.download_with_retry(remote_url, &final_path).await?;
        self.store.put(key, final_path.clone()).await;
        Ok(final_path)
    }

    /// Downloads a cover image for `(source, songId)`, storing it under
    /// the conventional `<source>_<songId>_cover.<ext>` filename.
    pub async fn materialize_cover(
        &self,
        source: &str,
        song_id: &str,
        remote_url: &str,
    ) -> Result<PathBuf, MaterializeError> {
        let ext = extension_from_url(remote_url).unwrap_or_else(|| "jpg".to_string());
        let final_path = self.store.cover_path_with_ext(source, song_id, &ext);

        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            self.store.put_cover(source, song_id, final_path.clone()).await;
            return Ok(final_path);
        }

        self.download_with_retry(remote_url, &final_path).await?;
        self.store.put_cover(source, song_id, final_path.clone()).await;
        Ok(final_path)
    }

    async fn download_with_retry(
        &self,
        url: &str,
        final_path: &PathBuf,
    ) -> Result<(), MaterializeError> {
        let tmp_path = final_path.with_extension(format!(
            "{}.part",
            final_path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));

        let mut last_err = None;
        for attempt in 0..CHUNK_RETRY_ATTEMPTS {
            match self.download_once(url, &tmp_path).await {
                Ok(()) => {
                    tokio::fs::rename(&tmp_path, final_path).await?;
                    return Ok(());
                }
                Err(err) => {
                    let _ = tokio::fs::remove_file(&tmp_path).await;
                    warn!(url, attempt, %err, "download attempt failed");
                    last_err = Some(err);
                    if attempt + 1 < CHUNK_RETRY_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop always sets an error before exhausting attempts"))
    }

    async fn download_once(&self, url: &str, tmp_path: &PathBuf) -> Result<(), MaterializeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| MaterializeError::Transport {
                url: url.to_string(),
                source,
            })?
            .error_for_status()
            .map_err(|source| MaterializeError::Transport {
                url: url.to_string(),
                source,
            })?;

        if let Some(parent) = tmp_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| MaterializeError::Transport {
                url: url.to_string(),
                source,
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Embeds `info`/`lyric`/`cover` into every on-disk audio variant for
    /// `(source, songId)`. Any individual embed failure is logged and does
    /// not stop the others.
    pub async fn embed_all_variants(
        &self,
        source: &str,
        song_id: &str,
        info: Option<&SongInfo>,
        lyric: Option<&str>,
        cover_jpeg: Option<&[u8]>,
    ) {
        let paths = self.store.audio_paths_for(source, song_id).await;
        if paths.is_empty() {
            return;
        }

        let embed_info = info.map(|info| EmbedSongInfo {
            name: info.name.clone(),
            singer: info.singer.clone(),
            album: info.album.clone(),
        });

        let request = EmbedRequest {
            info: embed_info.as_ref(),
            lyric,
            cover_jpeg,
        };

        for path in paths {
            if let Err(err) = pmometadata::embed(&path, &request) {
                error!(path = %path.display(), %err, "failed to embed metadata");
            }
        }
    }
}

fn extension_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments = parsed.path_segments()?;
    let last = segments.last()?;
    let ext = std::path::Path::new(last).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 5 {
        None
    } else {
        Some(ext.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn materialize_audio_is_idempotent_when_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::scan(dir.path()).await.unwrap());
        let key = ArtifactKey::new("kw", "1", "320k");
        let path = store.audio_path_with_ext(&key, "mp3");
        tokio::fs::write(&path, b"already here").await.unwrap();

        let materializer = Materializer::new(store.clone());
        let result = materializer
            .materialize_audio(key.clone(), "https://example.invalid/a.mp3")
            .await
            .unwrap();
        assert_eq!(result, path);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"already here");
    }

    #[test]
    fn extension_from_url_extracts_and_lowercases() {
        assert_eq!(
            extension_from_url("https://example.com/a/B.MP3?x=1"),
            Some("mp3".to_string())
        );
        assert_eq!(extension_from_url("https://example.com/a/noext"), None);
    }
}
