use pmocache::KvCache;
use std::time::Duration;

fn open(dir: &std::path::Path) -> KvCache {
    KvCache::open(dir).unwrap()
}

#[tokio::test]
async fn namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path());

    cache.put("urls", "kw:1", &"http://x/a.mp3".to_string(), None).await.unwrap();
    cache.put("lyric", "kw:1", &"la la la".to_string(), None).await.unwrap();

    let url: Option<String> = cache.get("urls", "kw:1").await;
    let lyric: Option<String> = cache.get("lyric", "kw:1").await;
    assert_eq!(url.as_deref(), Some("http://x/a.mp3"));
    assert_eq!(lyric.as_deref(), Some("la la la"));

    // wrong namespace for a real key is a miss, not a cross-namespace hit
    let mismatched: Option<String> = cache.get("info", "kw:1").await;
    assert_eq!(mismatched, None);
}

#[tokio::test]
async fn remove_drops_the_entry() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path());

    cache.put("urls", "kw:1", &"http://x/a.mp3".to_string(), None).await.unwrap();
    cache.remove("urls", "kw:1").await;

    let got: Option<String> = cache.get("urls", "kw:1").await;
    assert_eq!(got, None);
}

#[tokio::test]
async fn flush_writes_one_json_file_per_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let cache = open(dir.path());

    cache.put("urls", "kw:1", &"http://x/a.mp3".to_string(), None).await.unwrap();
    cache.put("info", "kw:1", &serde_json::json!({"name": "Song"}), None).await.unwrap();
    cache.flush().await.unwrap();

    assert!(dir.path().join("urls.json").exists());
    assert!(dir.path().join("info.json").exists());
    assert!(!dir.path().join("lyric.json").exists());
}

#[tokio::test]
async fn periodic_flush_persists_without_an_explicit_call() {
    let dir = tempfile::tempdir().unwrap();
    let cache = std::sync::Arc::new(open(dir.path()));
    cache.put("urls", "kw:1", &"http://x/a.mp3".to_string(), None).await.unwrap();

    let handle = cache.clone().spawn_periodic_flush(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(80)).await;
    handle.abort();

    assert!(dir.path().join("urls.json").exists());
}
