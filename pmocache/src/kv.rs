//! Namespaced, TTL-aware key-value store.
//!
//! A [`KvCache`] holds any number of *namespaces* (`urls`, `lyric`, `info`,
//! …), each a flat `key -> value` map persisted to its own JSON file under
//! the cache directory. Namespaces are loaded eagerly at [`KvCache::open`]
//! and flushed back to disk either explicitly ([`KvCache::flush`]) or on a
//! timer ([`KvCache::spawn_periodic_flush`]).

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Abstraction over "now", so tests can control expiry without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredEntry {
    value: serde_json::Value,
    /// Unix timestamp after which this entry is considered absent. `None`
    /// means the entry never expires.
    expire_at: Option<i64>,
}

type Namespace = HashMap<String, StoredEntry>;

/// Persistent namespaced key-value cache with per-entry TTL.
pub struct KvCache {
    dir: PathBuf,
    namespaces: RwLock<HashMap<String, Namespace>>,
    clock: Arc<dyn Clock>,
}

impl KvCache {
    /// Opens (creating if necessary) the cache directory and eagerly loads
    /// every `*.json` namespace file found there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_clock(dir, Arc::new(SystemClock))
    }

    pub fn open_with_clock(dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating kv cache directory {}", dir.display()))?;

        let mut namespaces = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(ns) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match std::fs::read(&path) {
                    Ok(bytes) => match serde_json::from_slice::<Namespace>(&bytes) {
                        Ok(map) => {
                            debug!(namespace = ns, entries = map.len(), "loaded kv namespace");
                            namespaces.insert(ns.to_string(), map);
                        }
                        Err(err) => {
                            warn!(namespace = ns, %err, "corrupt kv namespace file, resetting");
                            namespaces.insert(ns.to_string(), Namespace::new());
                        }
                    },
                    Err(err) => {
                        warn!(namespace = ns, %err, "cannot read kv namespace file, resetting");
                        namespaces.insert(ns.to_string(), Namespace::new());
                    }
                }
            }
        }

        Ok(Self {
            dir,
            namespaces: RwLock::new(namespaces),
            clock,
        })
    }

    /// Reads a value, silently treating an expired entry as absent.
    pub async fn get<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Option<T> {
        {
            let guard = self.namespaces.read().await;
            let entry = guard.get(namespace)?.get(key)?;
            if let Some(expire_at) = entry.expire_at {
                if expire_at <= self.clock.now() {
                    drop(guard);
                    self.remove(namespace, key).await;
                    return None;
                }
            }
            if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                return Some(value);
            }
            return None;
        }
    }

    /// Returns the raw expiry timestamp stored for `key`, if any entry exists.
    pub async fn expire_at(&self, namespace: &str, key: &str) -> Option<Option<i64>> {
        let guard = self.namespaces.read().await;
        guard.get(namespace)?.get(key).map(|e| e.expire_at)
    }

    /// Inserts or overwrites `key` in `namespace`. `ttl = None` stores a
    /// non-expiring entry.
    pub async fn put<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expire_at = ttl.map(|d| self.clock.now() + d.as_secs() as i64);
        let stored = StoredEntry {
            value: serde_json::to_value(value)?,
            expire_at,
        };
        let mut guard = self.namespaces.write().await;
        guard
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), stored);
        Ok(())
    }

    pub async fn remove(&self, namespace: &str, key: &str) {
        let mut guard = self.namespaces.write().await;
        if let Some(ns) = guard.get_mut(namespace) {
            ns.remove(key);
        }
    }

    /// Writes every namespace to its own file, via a temp-file-then-rename
    /// so a crash mid-write never corrupts the previous snapshot.
    pub async fn flush(&self) -> Result<()> {
        let guard = self.namespaces.read().await;
        for (namespace, map) in guard.iter() {
            let final_path = self.dir.join(format!("{namespace}.json"));
            let tmp_path = self.dir.join(format!("{namespace}.json.tmp"));
            let bytes = serde_json::to_vec_pretty(map)?;
            tokio::fs::write(&tmp_path, &bytes)
                .await
                .with_context(|| format!("writing {}", tmp_path.display()))?;
            tokio::fs::rename(&tmp_path, &final_path)
                .await
                .with_context(|| format!("renaming {} to {}", tmp_path.display(), final_path.display()))?;
        }
        Ok(())
    }

    /// Spawns a background task that calls [`KvCache::flush`] on a timer
    /// until the returned handle is dropped or aborted.
    pub fn spawn_periodic_flush(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.flush().await {
                    error!(%err, "periodic kv cache flush failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct ManualClock(AtomicI64);
    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = KvCache::open(dir.path()).unwrap();
        cache
            .put("urls", "kw:1", &"http://x/a.mp3".to_string(), None)
            .await
            .unwrap();
        let got: Option<String> = cache.get("urls", "kw:1").await;
        assert_eq!(got.as_deref(), Some("http://x/a.mp3"));
    }

    #[tokio::test]
    async fn expired_entry_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock(AtomicI64::new(1000)));
        let cache = KvCache::open_with_clock(dir.path(), clock.clone()).unwrap();
        cache
            .put("urls", "kw:1", &"http://x/a.mp3".to_string(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        clock.0.store(1011, Ordering::SeqCst);
        let got: Option<String> = cache.get("urls", "kw:1").await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn flush_then_reopen_restores_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = KvCache::open(dir.path()).unwrap();
            cache
                .put("info", "kw:1", &serde_json::json!({"name": "Song"}), None)
                .await
                .unwrap();
            cache.flush().await.unwrap();
        }
        let reopened = KvCache::open(dir.path()).unwrap();
        let got: Option<serde_json::Value> = reopened.get("info", "kw:1").await;
        assert_eq!(got, Some(serde_json::json!({"name": "Song"})));
    }

    #[tokio::test]
    async fn corrupt_namespace_file_resets_only_that_namespace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("urls.json"), b"not json").unwrap();
        std::fs::write(
            dir.path().join("info.json"),
            serde_json::to_vec(&HashMap::from([(
                "k".to_string(),
                StoredEntry {
                    value: serde_json::json!("v"),
                    expire_at: None,
                },
            )]))
            .unwrap(),
        )
        .unwrap();
        let cache = KvCache::open(dir.path()).unwrap();
        let urls: Option<String> = cache.get("urls", "anything").await;
        assert_eq!(urls, None);
        let info: Option<String> = cache.get("info", "k").await;
        assert_eq!(info.as_deref(), Some("v"));
    }
}
