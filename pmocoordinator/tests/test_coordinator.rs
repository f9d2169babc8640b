use async_trait::async_trait;
use pmoartifacts::ArtifactStore;
use pmocache::KvCache;
use pmocoordinator::Coordinator;
use pmofallback::FallbackRunner;
use pmomaterializer::Materializer;
use pmosource::{Resolver, ResolverError, ResolverRegistry, ResolverResult, ResolvedUrl, SongInfo};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// A resolver that counts how many times `info` was actually invoked, so
/// tests can assert the KV cache shortcuts the second lookup.
#[derive(Debug)]
struct CountingResolver {
    info_calls: AtomicUsize,
}

#[async_trait]
impl Resolver for CountingResolver {
    fn tag(&self) -> &'static str {
        "kw"
    }

    async fn resolve(&self, song_id: &str, quality: &str) -> ResolverResult<ResolvedUrl> {
        Ok(ResolvedUrl {
            url: format!("https://example.invalid/{song_id}.{quality}.mp3"),
            quality: quality.to_string(),
        })
    }

    async fn info(&self, song_id: &str) -> ResolverResult<SongInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        Ok(SongInfo {
            name: Some(format!("Song {song_id}")),
            singer: Some("Someone".to_string()),
            album: None,
            cover: None,
        })
    }

    async fn search(&self, query: &str) -> ResolverResult<serde_json::Value> {
        Ok(serde_json::json!({ "query": query, "results": [] }))
    }
}

async fn build(dir: &std::path::Path, resolver: Arc<CountingResolver>) -> Arc<Coordinator> {
    let artifacts = Arc::new(ArtifactStore::scan(dir.join("cache")).await.unwrap());
    let kv = Arc::new(KvCache::open(dir.join("kv")).unwrap());
    let mut registry = ResolverRegistry::new();
    registry.register(resolver);
    let fallback = Arc::new(FallbackRunner::new(dir.join("scripts"), "node", vec![]));
    let materializer = Arc::new(Materializer::new(artifacts.clone()));

    Coordinator::new(
        "/cache",
        artifacts,
        None,
        kv,
        Arc::new(registry),
        fallback,
        materializer,
    )
}

#[tokio::test]
async fn info_is_served_from_cache_on_second_call() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(CountingResolver { info_calls: AtomicUsize::new(0) });
    let coordinator = build(dir.path(), resolver.clone()).await;

    let first = coordinator.other("info", "kw", "7").await;
    assert_eq!(first.code, 0);
    let second = coordinator.other("info", "kw", "7").await;
    assert_eq!(second.code, 0);
    assert_eq!(second.data, first.data);

    assert_eq!(resolver.info_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn search_delegates_without_caching() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(CountingResolver { info_calls: AtomicUsize::new(0) });
    let coordinator = build(dir.path(), resolver).await;

    let envelope = coordinator.search("kw", "some query").await;
    assert_eq!(envelope.code, 0);
    assert_eq!(envelope.data["query"], "some query");
}

#[tokio::test]
async fn url_then_repeated_url_hits_the_kv_cache() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(CountingResolver { info_calls: AtomicUsize::new(0) });
    let coordinator = build(dir.path(), resolver).await;

    let first = coordinator.url("kw", "99", "320k", None, None).await;
    assert_eq!(first.code, 0);
    assert_eq!(first.extra.as_ref().unwrap()["cache"], false);

    let second = coordinator.url("kw", "99", "320k", None, None).await;
    assert_eq!(second.code, 0);
    assert_eq!(second.extra.as_ref().unwrap()["cache"], true);
    assert_eq!(second.data, first.data);
}

#[tokio::test]
async fn other_reports_unknown_method_for_unsupported_resolver_call() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(CountingResolver { info_calls: AtomicUsize::new(0) });
    let coordinator = build(dir.path(), resolver).await;

    let envelope = coordinator.other("lyric", "kw", "1").await;
    assert_eq!(envelope.code, 1);
}
