//! Resolver trait and registry for upstream music metadata sources.
//!
//! A [`Resolver`] is the uniform contract every upstream adapter (`kw`,
//! `kg`, `mg`, `tx`, `wy`, …) implements: given an opaque `songId` it can
//! produce a playback URL, lyric text, or canonical song info. The
//! [`ResolverRegistry`] is a name-keyed table the coordinator consults by
//! source tag; it is deliberately ignorant of what each resolver does
//! internally.
//!
//! This crate ships two illustrative resolvers (see [`illustrative`]) that
//! show the shape a real adapter takes; production deployments register
//! their own [`Resolver`] implementations instead.

pub mod illustrative;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Debug, sync::Arc};
use thiserror::Error;

/// Result of a successful `resolve` call. `quality` echoes back what the
/// upstream actually served, which may differ from what was requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedUrl {
    pub url: String,
    pub quality: String,
}

/// Where a song's cover art currently lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cover {
    /// Not yet materialized locally; still points at the upstream URL.
    Remote(String),
    /// Rewritten to a local `/cache/...` path after materialization.
    Local(String),
}

/// Canonical song info, as cached in the `info` KV namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SongInfo {
    pub name: Option<String>,
    pub singer: Option<String>,
    pub album: Option<String>,
    pub cover: Option<Cover>,
}

/// Errors a [`Resolver`] may report. Anything else (panics aside) is a bug.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("resolver failed: {0}")]
    Failed(String),
    #[error("method not implemented by this resolver")]
    UnknownMethod,
    #[error("no resolver registered for source {0:?}")]
    UnknownSource(String),
}

pub type ResolverResult<T> = std::result::Result<T, ResolverError>;

/// A single upstream adapter. Only `tag` and `resolve` are mandatory;
/// everything else defaults to [`ResolverError::UnknownMethod`] so a
/// resolver that only knows how to produce playback URLs doesn't need to
/// implement the rest.
#[async_trait]
pub trait Resolver: Debug + Send + Sync {
    /// Short lowercase tag this resolver answers to (`"kw"`, `"kg"`, …).
    fn tag(&self) -> &'static str;

    async fn resolve(&self, song_id: &str, quality: &str) -> ResolverResult<ResolvedUrl>;

    async fn lyric(&self, _song_id: &str) -> ResolverResult<String> {
        Err(ResolverError::UnknownMethod)
    }

    async fn info(&self, _song_id: &str) -> ResolverResult<SongInfo> {
        Err(ResolverError::UnknownMethod)
    }

    async fn search(&self, _query: &str) -> ResolverResult<serde_json::Value> {
        Err(ResolverError::UnknownMethod)
    }

    /// Fallback for any method not covered by a dedicated trait function.
    async fn other(&self, _method: &str, _song_id: &str) -> ResolverResult<serde_json::Value> {
        Err(ResolverError::UnknownMethod)
    }
}

/// Name-keyed table of registered resolvers.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<&'static str, Arc<dyn Resolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(resolver.tag(), resolver);
    }

    pub fn get(&self, source: &str) -> ResolverResult<Arc<dyn Resolver>> {
        self.resolvers
            .get(source)
            .cloned()
            .ok_or_else(|| ResolverError::UnknownSource(source.to_string()))
    }

    pub fn sources(&self) -> Vec<&'static str> {
        self.resolvers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StubResolver;

    #[async_trait]
    impl Resolver for StubResolver {
        fn tag(&self) -> &'static str {
            "stub"
        }

        async fn resolve(&self, song_id: &str, quality: &str) -> ResolverResult<ResolvedUrl> {
            Ok(ResolvedUrl {
                url: format!("https://example.invalid/{song_id}"),
                quality: quality.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn registry_round_trips_a_resolver() {
        let mut registry = ResolverRegistry::new();
        registry.register(Arc::new(StubResolver));

        let resolver = registry.get("stub").unwrap();
        let resolved = resolver.resolve("42", "320k").await.unwrap();
        assert_eq!(resolved.url, "https://example.invalid/42");
        assert_eq!(resolved.quality, "320k");
    }

    #[tokio::test]
    async fn unknown_source_is_reported() {
        let registry = ResolverRegistry::new();
        let err = registry.get("nope").unwrap_err();
        assert!(matches!(err, ResolverError::UnknownSource(s) if s == "nope"));
    }

    #[tokio::test]
    async fn unimplemented_methods_default_to_unknown_method() {
        let resolver = StubResolver;
        let err = resolver.lyric("1").await.unwrap_err();
        assert!(matches!(err, ResolverError::UnknownMethod));
    }
}
