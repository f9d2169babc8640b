//! # pmocache - namespaced TTL key-value cache for PMOMusic
//!
//! This crate provides the persistent, namespaced key-value store used to
//! remember short-lived playback URLs, lyric text, and canonical song info
//! across process restarts. It is the counterpart of `pmoartifacts`, which
//! indexes materialized files on disk rather than JSON blobs.
//!
//! ## Architecture
//!
//! Each namespace (`urls`, `lyric`, `info`, …) is held in memory behind a
//! `RwLock` and backed by a single JSON file on disk, written atomically by
//! a periodic flusher (see [`kv::KvCache::spawn_periodic_flush`]). Entries
//! carry an optional expiry; [`kv::KvCache::get`] never returns an entry
//! whose expiry has passed.
//!
//! ## Exemple
//!
//! ```rust,no_run
//! use pmocache::kv::KvCache;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = KvCache::open("./cache/kv")?;
//!     cache.put("urls", "kw:12345", &"https://example.com/a.mp3", Some(Duration::from_secs(60))).await?;
//!     let url: Option<String> = cache.get("urls", "kw:12345").await;
//!     println!("{:?}", url);
//!     Ok(())
//! }
//! ```

pub mod kv;

pub use kv::{Clock, KvCache, SystemClock};
