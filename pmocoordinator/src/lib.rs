//! Single entry point for `url`/`lyric`/`info`/`search`/`other` requests.
//!
//! Owns the dedup map for background metadata materialization and composes
//! the Artifact Store, KV Cache, Resolver Registry, Fallback Runner, and
//! Materializer into the five externally-visible operations described by
//! the outer HTTP layer.

use base64::Engine;
use pmoartifacts::{store::ArtifactKey, ArtifactStore, LocalLibrary};
use pmocache::KvCache;
use pmofallback::FallbackRunner;
use pmomaterializer::Materializer;
use pmosource::{Cover, Resolver, ResolverError, ResolverRegistry, SongInfo};
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LYRIC_NAMESPACE: &str = "lyric";
const URL_NAMESPACE: &str = "urls";
const INFO_NAMESPACE: &str = "info";

/// Response envelope mirrored bit-for-bit by the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub code: i32,
    pub msg: String,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl Envelope {
    fn ok(data: impl Serialize) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            extra: None,
        }
    }

    fn ok_with_extra(data: impl Serialize, extra: serde_json::Value) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
            extra: Some(extra),
        }
    }

    fn unknown(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
            data: serde_json::Value::Null,
            extra: None,
        }
    }

    fn failed(msg: impl Into<String>) -> Self {
        Self {
            code: 2,
            msg: msg.into(),
            data: serde_json::Value::Null,
            extra: None,
        }
    }
}

pub struct Coordinator {
    cache_dir_url: String,
    artifacts: Arc<ArtifactStore>,
    local_library: Option<Arc<LocalLibrary>>,
    kv: Arc<KvCache>,
    resolvers: Arc<ResolverRegistry>,
    fallback: Arc<FallbackRunner>,
    materializer: Arc<Materializer>,
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl Coordinator {
    pub fn new(
        cache_dir_url: impl Into<String>,
        artifacts: Arc<ArtifactStore>,
        local_library: Option<Arc<LocalLibrary>>,
        kv: Arc<KvCache>,
        resolvers: Arc<ResolverRegistry>,
        fallback: Arc<FallbackRunner>,
        materializer: Arc<Materializer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache_dir_url: cache_dir_url.into(),
            artifacts,
            local_library,
            kv,
            resolvers,
            fallback,
            materializer,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// `GET /url/<source>/<songId>[/<quality>]`.
    ///
    /// `quality` is mandatory; an empty string (the no-quality route maps
    /// here) reports `{code: 2, msg: "need quality param"}` rather than
    /// falling through to resolution.
    ///
    /// `info_b64`/`lyric_b64` are optional base64url-encoded JSON blobs the
    /// client already knows; when decodable they populate the KV cache
    /// *before* resolution, per the upstream behavior this was distilled
    /// from.
    pub async fn url(
        self: &Arc<Self>,
        source: &str,
        song_id: &str,
        quality: &str,
        info_b64: Option<&str>,
        lyric_b64: Option<&str>,
    ) -> Envelope {
        if quality.is_empty() {
            return Envelope::failed("need quality param");
        }

        let song_id = canonical_song_id(source, song_id);

        if let Some(blob) = info_b64 {
            if let Some(info) = decode_base64_json::<SongInfo>(blob) {
                let _ = self.kv.put(INFO_NAMESPACE, &info_key(source, &song_id), &info, None).await;
            }
        }
        if let Some(blob) = lyric_b64 {
            if let Some(text) = decode_base64_json::<String>(blob) {
                let ttl = pmoconfig::get_config().get_lyric_ttl_seconds();
                let _ = self
                    .kv
                    .put(LYRIC_NAMESPACE, &info_key(source, &song_id), &text, Some(Duration::from_secs(ttl)))
                    .await;
            }
        }

        if let Some(lookup) = self.artifacts.lookup(source, &song_id, quality).await {
            debug!(source, song_id = %song_id, "artifact store hit");
            self.schedule_metadata_job(source.to_string(), song_id.clone());
            let basename = lookup
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            return Envelope::ok_with_extra(
                format!("{}/{}", self.cache_dir_url, basename),
                serde_json::json!({ "cache": true, "localfile": true, "quality": lookup.quality }),
            );
        }

        if let Some(entry) = self.kv.get::<StoredUrl>(URL_NAMESPACE, &url_key(source, &song_id, quality)).await {
            self.schedule_metadata_job(source.to_string(), song_id.clone());
            let (_, ttl) = pmoconfig::get_config().get_source_ttl(source);
            let expire_at = entry.expire_at.map(|e| e + (ttl as f64 * 0.25) as i64);
            return Envelope::ok_with_extra(
                entry.url,
                serde_json::json!({ "cache": true, "expire": { "time": expire_at, "canExpire": entry.can_expire } }),
            );
        }

        match self.resolve_via_registry(source, &song_id, quality).await {
            Ok(resolved) => {
                self.schedule_audio_materialization(source, &song_id, &resolved.quality, &resolved.url);
                self.schedule_metadata_job(source.to_string(), song_id.clone());

                let (can_expire, ttl) = pmoconfig::get_config().get_source_ttl(source);
                let expire_at = if can_expire {
                    Some(chrono::Utc::now().timestamp() + (ttl as f64 * 0.75) as i64)
                } else {
                    None
                };
                let stored = StoredUrl {
                    url: resolved.url.clone(),
                    can_expire,
                    expire_at,
                };
                let ttl_duration = expire_at.map(|_| Duration::from_secs((ttl as f64 * 0.75) as u64));
                let _ = self
                    .kv
                    .put(URL_NAMESPACE, &url_key(source, &song_id, quality), &stored, ttl_duration)
                    .await;

                Envelope::ok_with_extra(
                    resolved.url,
                    serde_json::json!({ "cache": false, "expire": { "time": expire_at, "canExpire": can_expire }, "localfile": false }),
                )
            }
            Err(resolver_err) => match resolver_err {
                ResolverError::UnknownSource(_) => Envelope::unknown(resolver_err.to_string()),
                _ => self.try_fallback(source, &song_id, quality).await,
            },
        }
    }

    async fn resolve_via_registry(
        &self,
        source: &str,
        song_id: &str,
        quality: &str,
    ) -> Result<pmosource::ResolvedUrl, ResolverError> {
        let resolver = self.resolvers.get(source)?;
        resolver.resolve(song_id, quality).await
    }

    async fn try_fallback(self: &Arc<Self>, source: &str, song_id: &str, quality: &str) -> Envelope {
        let info_json = self
            .kv
            .get::<SongInfo>(INFO_NAMESPACE, &info_key(source, song_id))
            .await
            .and_then(|info| serde_json::to_string(&info).ok())
            .unwrap_or_else(|| "{}".to_string());

        match self.fallback.try_all(source, song_id, quality, &info_json).await {
            Some(success) => {
                let key = ArtifactKey::new(source, song_id, &success.quality);
                if let Err(err) = self.materializer.materialize_audio(key, &success.url).await {
                    warn!(source, song_id, %err, "synchronous fallback materialization failed");
                }
                self.schedule_metadata_job(source.to_string(), song_id.to_string());

                let stored = StoredUrl {
                    url: success.url.clone(),
                    can_expire: false,
                    expire_at: None,
                };
                let _ = self
                    .kv
                    .put(URL_NAMESPACE, &url_key(source, song_id, quality), &stored, None)
                    .await;

                Envelope::ok_with_extra(
                    success.url,
                    serde_json::json!({ "cache": false, "fallback": "externalScript" }),
                )
            }
            None => Envelope::failed("no resolver or fallback could satisfy the request"),
        }
    }

    /// `GET /lyric/<source>/<songId>`.
    pub async fn lyric(self: &Arc<Self>, source: &str, song_id: &str) -> Envelope {
        let song_id = canonical_song_id(source, song_id);
        if let Some(text) = self.kv.get::<String>(LYRIC_NAMESPACE, &info_key(source, &song_id)).await {
            return Envelope::ok(text);
        }

        let resolver = match self.resolvers.get(source) {
            Ok(r) => r,
            Err(err) => return Envelope::unknown(err.to_string()),
        };

        match resolver.lyric(&song_id).await {
            Ok(text) => {
                let ttl = pmoconfig::get_config().get_lyric_ttl_seconds();
                let _ = self
                    .kv
                    .put(LYRIC_NAMESPACE, &info_key(source, &song_id), &text, Some(Duration::from_secs(ttl)))
                    .await;
                Envelope::ok(text)
            }
            Err(ResolverError::UnknownMethod) => Envelope::unknown("resolver does not implement lyric"),
            Err(err) => Envelope::failed(err.to_string()),
        }
    }

    /// `GET /info/<source>/<songId>`, exposed through [`Coordinator::other`].
    pub async fn info(self: &Arc<Self>, source: &str, song_id: &str) -> Envelope {
        let song_id = canonical_song_id(source, song_id);
        if let Some(info) = self.kv.get::<SongInfo>(INFO_NAMESPACE, &info_key(source, &song_id)).await {
            return Envelope::ok(info);
        }

        let resolver = match self.resolvers.get(source) {
            Ok(r) => r,
            Err(err) => return Envelope::unknown(err.to_string()),
        };

        match resolver.info(&song_id).await {
            Ok(info) => {
                let _ = self.kv.put(INFO_NAMESPACE, &info_key(source, &song_id), &info, None).await;
                Envelope::ok(info)
            }
            Err(ResolverError::UnknownMethod) => Envelope::unknown("resolver does not implement info"),
            Err(err) => Envelope::failed(err.to_string()),
        }
    }

    /// `GET /search/<source>?q=...`. No caching.
    pub async fn search(&self, source: &str, query: &str) -> Envelope {
        let resolver = match self.resolvers.get(source) {
            Ok(r) => r,
            Err(err) => return Envelope::unknown(err.to_string()),
        };
        match resolver.search(query).await {
            Ok(value) => Envelope::ok(value),
            Err(ResolverError::UnknownMethod) => Envelope::unknown("resolver does not implement search"),
            Err(err) => Envelope::failed(err.to_string()),
        }
    }

    /// `GET /<method>/<source>/<songId>`, for any method not covered above.
    pub async fn other(self: &Arc<Self>, method: &str, source: &str, song_id: &str) -> Envelope {
        if method == "info" {
            return self.info(source, song_id).await;
        }
        let song_id = canonical_song_id(source, song_id);
        let resolver = match self.resolvers.get(source) {
            Ok(r) => r,
            Err(err) => return Envelope::unknown(err.to_string()),
        };
        match resolver.other(method, &song_id).await {
            Ok(value) => Envelope::ok(value),
            Err(ResolverError::UnknownMethod) => Envelope::unknown(format!("resolver does not implement {method}")),
            Err(err) => Envelope::failed(err.to_string()),
        }
    }

    pub fn local_library(&self) -> Option<&Arc<LocalLibrary>> {
        self.local_library.as_ref()
    }

    fn schedule_audio_materialization(&self, source: &str, song_id: &str, quality: &str, url: &str) {
        let key = ArtifactKey::new(source, song_id, quality);
        let materializer = self.materializer.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(err) = materializer.materialize_audio(key, &url).await {
                warn!(%err, "background audio materialization failed");
            }
        });
    }

    /// Schedules the metadata job for `(source, songId)` unless one is
    /// already in flight, per the InFlightSet dedup invariant. Runs even on
    /// a cache hit, so lyric/cover/info catch up if a prior request's slow
    /// path raced ahead of its fast path.
    fn schedule_metadata_job(self: &Arc<Self>, source: String, song_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = (source.clone(), song_id.clone());
            {
                let mut in_flight = this.in_flight.lock().await;
                if !in_flight.insert(key.clone()) {
                    debug!(%source, %song_id, "metadata job already in flight, skipping");
                    return;
                }
            }

            this.run_metadata_job(&source, &song_id).await;

            this.in_flight.lock().await.remove(&key);
        });
    }

    async fn run_metadata_job(&self, source: &str, song_id: &str) {
        let resolver = match self.resolvers.get(source) {
            Ok(r) => r,
            Err(_) => return,
        };

        let mut info = self.kv.get::<SongInfo>(INFO_NAMESPACE, &info_key(source, song_id)).await;
        if info.is_none() {
            match resolver.info(song_id).await {
                Ok(fetched) => {
                    let _ = self.kv.put(INFO_NAMESPACE, &info_key(source, song_id), &fetched, None).await;
                    info = Some(fetched);
                }
                Err(err) => {
                    if !matches!(err, ResolverError::UnknownMethod) {
                        warn!(source, song_id, %err, "metadata job: info fetch failed");
                    }
                }
            }
        }

        if self.kv.get::<String>(LYRIC_NAMESPACE, &info_key(source, song_id)).await.is_none() {
            match resolver.lyric(song_id).await {
                Ok(text) => {
                    let ttl = pmoconfig::get_config().get_lyric_ttl_seconds();
                    let _ = self
                        .kv
                        .put(LYRIC_NAMESPACE, &info_key(source, song_id), &text, Some(Duration::from_secs(ttl)))
                        .await;
                }
                Err(err) => {
                    if !matches!(err, ResolverError::UnknownMethod) {
                        warn!(source, song_id, %err, "metadata job: lyric fetch failed");
                    }
                }
            }
        }

        let mut cover_bytes: Option<Vec<u8>> = None;
        if let Some(info) = &info {
            if let Some(Cover::Remote(url)) = &info.cover {
                if self.artifacts.cover_path(source, song_id).await.is_none() {
                    match self.materializer.materialize_cover(source, song_id, url).await {
                        Ok(path) => {
                            let mut updated = info.clone();
                            updated.cover = Some(Cover::Local(format!(
                                "{}/{}",
                                self.cache_dir_url,
                                path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
                            )));
                            let _ = self.kv.put(INFO_NAMESPACE, &info_key(source, song_id), &updated, None).await;
                            cover_bytes = tokio::fs::read(&path).await.ok();
                        }
                        Err(err) => warn!(source, song_id, %err, "metadata job: cover materialization failed"),
                    }
                }
            }
        }

        let lyric_text = self.kv.get::<String>(LYRIC_NAMESPACE, &info_key(source, song_id)).await;
        let cover_jpeg = match &cover_bytes {
            Some(bytes) => pmometadata_jpeg(bytes),
            None => None,
        };

        self.materializer
            .embed_all_variants(source, song_id, info.as_ref(), lyric_text.as_deref(), cover_jpeg.as_deref())
            .await;

        info!(source, song_id, "metadata job complete");
    }
}

fn pmometadata_jpeg(bytes: &[u8]) -> Option<Vec<u8>> {
    pmometadata::ensure_jpeg(bytes).ok()
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredUrl {
    url: String,
    can_expire: bool,
    expire_at: Option<i64>,
}

fn canonical_song_id(source: &str, song_id: &str) -> String {
    if source == "kg" {
        song_id.to_lowercase()
    } else {
        song_id.to_string()
    }
}

fn info_key(source: &str, song_id: &str) -> String {
    format!("{source}:{song_id}")
}

fn url_key(source: &str, song_id: &str, quality: &str) -> String {
    format!("{source}:{song_id}:{quality}")
}

fn decode_base64_json<T: serde::de::DeserializeOwned>(blob: &str) -> Option<T> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(blob).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pmosource::ResolvedUrl;

    #[derive(Debug)]
    struct StubResolver;

    #[async_trait]
    impl Resolver for StubResolver {
        fn tag(&self) -> &'static str {
            "kw"
        }

        async fn resolve(&self, song_id: &str, quality: &str) -> pmosource::ResolverResult<ResolvedUrl> {
            Ok(ResolvedUrl {
                url: format!("https://example.invalid/{song_id}.mp3"),
                quality: quality.to_string(),
            })
        }
    }

    async fn build_coordinator(dir: &std::path::Path) -> Arc<Coordinator> {
        let artifacts = Arc::new(ArtifactStore::scan(dir.join("cache")).await.unwrap());
        let kv = Arc::new(KvCache::open(dir.join("kv")).unwrap());
        let mut registry = ResolverRegistry::new();
        registry.register(Arc::new(StubResolver));
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
    async fn url_resolves_through_registry_on_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path()).await;
        let envelope = coordinator.url("kw", "42", "320k", None, None).await;
        assert_eq!(envelope.code, 0);
        assert_eq!(envelope.data, serde_json::json!("https://example.invalid/42.mp3"));
    }

    #[tokio::test]
    async fn url_reports_unknown_source() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path()).await;
        let envelope = coordinator.url("nope", "1", "320k", None, None).await;
        assert_eq!(envelope.code, 1);
    }

    #[tokio::test]
    async fn url_reports_missing_quality() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path()).await;
        let envelope = coordinator.url("kw", "42", "", None, None).await;
        assert_eq!(envelope.code, 2);
    }

    #[tokio::test]
    async fn kg_song_id_is_lowercased() {
        assert_eq!(canonical_song_id("kg", "ABC123"), "abc123");
        assert_eq!(canonical_song_id("kw", "ABC123"), "ABC123");
    }

    #[tokio::test]
    async fn lyric_reports_unknown_method_when_resolver_lacks_it() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = build_coordinator(dir.path()).await;
        let envelope = coordinator.lyric("kw", "42").await;
        assert_eq!(envelope.code, 1);
    }
}
