//! Read-only lookup over a user-supplied audio folder.
//!
//! Client-reported filenames rarely match the byte sequence on disk:
//! URL-encoding, NFC/NFD discrepancies, and case all vary by platform and
//! client. [`normalize_name`] applies the same canonicalization pipeline
//! to both the index keys built at startup and every incoming lookup.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use unicode_normalization::UnicodeNormalization;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "ogg", "wav", "opus"];
const LYRIC_EXTENSIONS: &[&str] = &["lrc", "txt"];
const COVER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// What exists on disk for a given library entry.
#[derive(Debug, Clone, Default)]
pub struct LibraryRecord {
    pub audio: Option<PathBuf>,
    pub cover: Option<PathBuf>,
    pub lyric: Option<PathBuf>,
}

impl LibraryRecord {
    pub fn has_music(&self) -> bool {
        self.audio.is_some()
    }
}

pub struct LocalLibrary {
    root: PathBuf,
    /// Keyed by the normalized audio stem (no extension).
    index: RwLock<HashMap<String, LibraryRecord>>,
}

impl LocalLibrary {
    pub async fn scan(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        let mut index: HashMap<String, LibraryRecord> = HashMap::new();
        let mut stack = vec![root.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
                    continue;
                };
                let ext_lower = ext.to_lowercase();
                let key = normalize_name(stem);
                let record = index.entry(key.clone()).or_default();
                if AUDIO_EXTENSIONS.contains(&ext_lower.as_str()) {
                    record.audio = Some(path.clone());
                } else if COVER_EXTENSIONS.contains(&ext_lower.as_str()) {
                    record.cover = Some(path.clone());
                } else if LYRIC_EXTENSIONS.contains(&ext_lower.as_str()) {
                    record.lyric = Some(path.clone());
                }
                // Case-insensitive alias for non-case-sensitive client lookups.
                let record_snapshot = record.clone();
                let lower_key = key.to_lowercase();
                if lower_key != key {
                    index.entry(lower_key).or_insert_with(|| record_snapshot);
                }
            }
        }

        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn has_music(&self, name: &str) -> bool {
        self.lookup(name).await.is_some_and(|r| r.has_music())
    }

    /// Resolves `name` against the index, trying progressively looser
    /// normalizations before falling back to a similarity match.
    pub async fn lookup(&self, name: &str) -> Option<LibraryRecord> {
        let index = self.index.read().await;

        let normalized = normalize_name(name);
        if let Some(record) = index.get(&normalized) {
            return Some(record.clone());
        }

        let lowercase = normalized.to_lowercase();
        if let Some(record) = index.get(&lowercase) {
            return Some(record.clone());
        }

        let basename = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(normalize_name);
        if let Some(basename) = &basename {
            if let Some(record) = index.get(basename) {
                return Some(record.clone());
            }
            let basename_lower = basename.to_lowercase();
            if let Some(record) = index.get(&basename_lower) {
                return Some(record.clone());
            }
        }

        const SIMILARITY_THRESHOLD: f64 = 0.8;
        index
            .iter()
            .filter(|(key, _)| key.contains(&lowercase) || lowercase.contains(key.as_str()))
            .max_by(|(a, _), (b, _)| {
                strsim::jaro_winkler(&lowercase, a)
                    .partial_cmp(&strsim::jaro_winkler(&lowercase, b))
                    .unwrap()
            })
            .filter(|(key, _)| strsim::jaro_winkler(&lowercase, key) >= SIMILARITY_THRESHOLD)
            .map(|(_, record)| record.clone())
    }
}

/// Strip directory components, URL-decode repeatedly (bounded), apply
/// Unicode NFC normalization, then collapse whitespace and trim trailing
/// whitespace/dots.
pub fn normalize_name(name: &str) -> String {
    let basename = name.replace('\\', "/");
    let basename = Path::new(&basename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&basename)
        .to_string();

    let mut decoded = basename;
    for _ in 0..4 {
        match urlencoding::decode(&decoded) {
            Ok(next) if next != decoded => decoded = next.into_owned(),
            _ => break,
        }
    }

    let nfc: String = decoded.nfc().collect();

    let collapsed = nfc.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end_matches(['.', ' ']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_directory_and_collapses_whitespace() {
        assert_eq!(
            normalize_name("some/dir/Song   Title.."),
            "Song Title"
        );
    }

    #[test]
    fn normalize_decodes_percent_encoding() {
        assert_eq!(normalize_name("Song%20Title"), "Song Title");
    }

    #[tokio::test]
    async fn scan_finds_audio_cover_and_lyric_siblings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Song.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("Song.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("Song.lrc"), b"x").unwrap();

        let library = LocalLibrary::scan(dir.path()).await.unwrap();
        let record = library.lookup("Song").await.unwrap();
        assert!(record.audio.is_some());
        assert!(record.cover.is_some());
        assert!(record.lyric.is_some());
        assert!(library.has_music("Song").await);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MySong.mp3"), b"x").unwrap();
        let library = LocalLibrary::scan(dir.path()).await.unwrap();
        assert!(library.has_music("mysong").await);
    }

    #[tokio::test]
    async fn missing_name_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let library = LocalLibrary::scan(dir.path()).await.unwrap();
        assert!(library.lookup("nothing here").await.is_none());
    }
}
