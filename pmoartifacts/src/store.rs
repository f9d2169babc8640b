//! In-memory index over the cache directory's `<source>_<songId>_<quality>.<ext>`
//! and `<source>_<songId>_cover.<ext>` artifact files.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Identifies a single materialized audio artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub source: String,
    pub song_id: String,
    pub quality: String,
}

impl ArtifactKey {
    pub fn new(source: impl Into<String>, song_id: impl Into<String>, quality: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            song_id: song_id.into(),
            quality: quality.into(),
        }
    }
}

/// A lookup that found an entry but not at the requested quality still
/// returns a path; the caller must report the quality actually served.
#[derive(Debug, Clone)]
pub struct ArtifactLookup {
    pub path: PathBuf,
    pub quality: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CoverKey {
    source: String,
    song_id: String,
}

pub struct ArtifactStore {
    dir: PathBuf,
    index: RwLock<HashMap<ArtifactKey, PathBuf>>,
    covers: RwLock<HashMap<CoverKey, PathBuf>>,
}

impl ArtifactStore {
    /// Scans `dir` once, building the in-memory index from filenames.
    /// Missing directories are created; unreadable ones are a hard error.
    pub async fn scan(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = HashMap::new();
        let mut covers = HashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            match parse_artifact_filename(name) {
                Some(ParsedName::Audio(key)) => {
                    index.insert(key, path);
                }
                Some(ParsedName::Cover { source, song_id }) => {
                    covers.insert(CoverKey { source, song_id }, path);
                }
                None => {
                    debug!(file = name, "skipping unrecognized cache file");
                }
            }
        }

        debug!(
            audio = index.len(),
            covers = covers.len(),
            dir = %dir.display(),
            "artifact store scan complete"
        );

        Ok(Self {
            dir,
            index: RwLock::new(index),
            covers: RwLock::new(covers),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Exact-quality or best-effort substitute lookup. Quality substitution
    /// is deliberate: any other quality for the same `(source, songId)` is
    /// preferable to a miss, and the caller is expected to surface the
    /// quality actually returned.
    pub async fn lookup(&self, source: &str, song_id: &str, quality: &str) -> Option<ArtifactLookup> {
        let index = self.index.read().await;
        let exact = ArtifactKey::new(source, song_id, quality);
        if let Some(path) = index.get(&exact) {
            return Some(ArtifactLookup {
                path: path.clone(),
                quality: quality.to_string(),
            });
        }
        index
            .iter()
            .find(|(key, _)| key.source == source && key.song_id == song_id)
            .map(|(key, path)| ArtifactLookup {
                path: path.clone(),
                quality: key.quality.clone(),
            })
    }

    /// Records a freshly materialized audio file without rescanning the
    /// directory, so subsequent requests observe it immediately.
    pub async fn put(&self, key: ArtifactKey, path: PathBuf) {
        self.index.write().await.insert(key, path);
    }

    pub async fn cover_path(&self, source: &str, song_id: &str) -> Option<PathBuf> {
        self.covers
            .read()
            .await
            .get(&CoverKey {
                source: source.to_string(),
                song_id: song_id.to_string(),
            })
            .cloned()
    }

    pub async fn put_cover(&self, source: &str, song_id: &str, path: PathBuf) {
        self.covers.write().await.insert(
            CoverKey {
                source: source.to_string(),
                song_id: song_id.to_string(),
            },
            path,
        );
    }

    /// Every on-disk audio path currently indexed for `(source, songId)`,
    /// across all qualities. Used by the metadata job to re-tag every
    /// variant after a cover/info update.
    pub async fn audio_paths_for(&self, source: &str, song_id: &str) -> Vec<PathBuf> {
        self.index
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.source == source && key.song_id == song_id)
            .map(|(_, path)| path.clone())
            .collect()
    }

    pub fn audio_path(&self, key: &ArtifactKey) -> PathBuf {
        let ext = "mp3";
        self.dir
            .join(format!("{}_{}_{}.{ext}", key.source, key.song_id, key.quality))
    }

    pub fn audio_path_with_ext(&self, key: &ArtifactKey, ext: &str) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}.{ext}", key.source, key.song_id, key.quality))
    }

    pub fn cover_path_with_ext(&self, source: &str, song_id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{source}_{song_id}_cover.{ext}"))
    }
}

enum ParsedName {
    Audio(ArtifactKey),
    Cover { source: String, song_id: String },
}

fn parse_artifact_filename(name: &str) -> Option<ParsedName> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    let source = parts[0].to_string();
    let last = *parts.last().unwrap();
    let song_id = parts[1..parts.len() - 1].join("_");
    if song_id.is_empty() {
        warn!(file = name, "cache filename has empty songId segment");
        return None;
    }
    if last == "cover" {
        Some(ParsedName::Cover { source, song_id })
    } else {
        Some(ParsedName::Audio(ArtifactKey::new(source, song_id, last)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_indexes_audio_and_cover_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kw_123_320k.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("kw_123_cover.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let store = ArtifactStore::scan(dir.path()).await.unwrap();
        let lookup = store.lookup("kw", "123", "320k").await.unwrap();
        assert_eq!(lookup.quality, "320k");
        assert!(store.cover_path("kw", "123").await.is_some());
    }

    #[tokio::test]
    async fn lookup_substitutes_quality_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kw_123_128k.mp3"), b"x").unwrap();
        let store = ArtifactStore::scan(dir.path()).await.unwrap();
        let lookup = store.lookup("kw", "123", "320k").await.unwrap();
        assert_eq!(lookup.quality, "128k");
    }

    #[tokio::test]
    async fn put_is_visible_without_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::scan(dir.path()).await.unwrap();
        let key = ArtifactKey::new("kw", "999", "320k");
        store.put(key.clone(), dir.path().join("kw_999_320k.mp3")).await;
        assert!(store.lookup("kw", "999", "320k").await.is_some());
    }

    #[tokio::test]
    async fn songid_with_underscores_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kw_abc_def_320k.mp3"), b"x").unwrap();
        let store = ArtifactStore::scan(dir.path()).await.unwrap();
        assert!(store.lookup("kw", "abc_def", "320k").await.is_some());
    }
}
