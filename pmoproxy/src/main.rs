//! PMOMusic metadata proxy entry point.
//!
//! Wires configuration, the artifact store, the KV cache, the resolver
//! registry, the fallback runner, and the materializer into a
//! [`pmocoordinator::Coordinator`], then exposes it over HTTP through
//! [`pmoserver::Server`].

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use pmoartifacts::{ArtifactStore, LocalLibrary};
use pmocache::KvCache;
use pmocoordinator::{Coordinator, Envelope};
use pmofallback::FallbackRunner;
use pmomaterializer::Materializer;
use pmoserver::{logs::LoggingOptions, ConfigExt, ServerBuilder};
use pmosource::{illustrative::HttpJsonResolver, ResolverRegistry};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct UrlQuery {
    info: Option<String>,
    lyric: Option<String>,
}

async fn url_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path((source, song_id, quality)): Path<(String, String, String)>,
    Query(q): Query<UrlQuery>,
) -> impl IntoResponse {
    let envelope = coordinator
        .url(&source, &song_id, &quality, q.info.as_deref(), q.lyric.as_deref())
        .await;
    envelope_response(envelope)
}

/// `/url/<source>/<songId>` with no `quality` segment. `Coordinator::url`
/// reports `QualityMissing` (code 2) for this rather than reaching a
/// resolver, same as the upstream's dual route registration.
async fn url_no_quality_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path((source, song_id)): Path<(String, String)>,
    Query(q): Query<UrlQuery>,
) -> impl IntoResponse {
    let envelope = coordinator
        .url(&source, &song_id, "", q.info.as_deref(), q.lyric.as_deref())
        .await;
    envelope_response(envelope)
}

async fn lyric_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path((source, song_id)): Path<(String, String)>,
) -> impl IntoResponse {
    envelope_response(coordinator.lyric(&source, &song_id).await)
}

async fn search_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path(source): Path<String>,
    Query(q): Query<std::collections::HashMap<String, String>>,
) -> impl IntoResponse {
    let query = q.get("q").cloned().unwrap_or_default();
    envelope_response(coordinator.search(&source, &query).await)
}

async fn other_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path((method, source, song_id)): Path<(String, String, String)>,
) -> impl IntoResponse {
    envelope_response(coordinator.other(&method, &source, &song_id).await)
}

async fn other_with_quality_handler(
    State(coordinator): State<Arc<Coordinator>>,
    Path((method, source, song_id, _quality)): Path<(String, String, String, String)>,
) -> impl IntoResponse {
    envelope_response(coordinator.other(&method, &source, &song_id).await)
}

/// Maps an [`Envelope`] to the outer layer's fixed HTTP status mapping:
/// `2 -> 200`, `1 -> 404`, `4 -> 500`, `5 -> 429`, `6 -> 404`, `0 -> 200`.
fn envelope_response(envelope: Envelope) -> (StatusCode, Json<Envelope>) {
    let status = match envelope.code {
        0 | 2 => StatusCode::OK,
        1 | 6 => StatusCode::NOT_FOUND,
        5 => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(envelope))
}

async fn cache_handler(
    State(cache_dir): State<Arc<std::path::PathBuf>>,
    Path(basename): Path<String>,
) -> impl IntoResponse {
    if basename.contains("..") || basename.contains('/') {
        return (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], Vec::<u8>::new()).into_response();
    }
    let path = cache_dir.join(&basename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let content_type = content_type_for(&basename);
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], Vec::<u8>::new()).into_response(),
    }
}

fn content_type_for(basename: &str) -> &'static str {
    match basename.rsplit('.').next().unwrap_or("").to_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "ogg" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

/// Registers the illustrative HTTP-JSON resolvers this crate ships.
///
/// Real per-source adapters (vendor scrapers) are out of scope; a deployer
/// wires their own [`pmosource::Resolver`] implementations onto the
/// registry the same way before passing it to [`Coordinator::new`].
fn register_illustrative_resolvers(registry: &mut ResolverRegistry) {
    if let Ok(base_url) = std::env::var("PMOPROXY_KG_BASE_URL") {
        registry.register(Arc::new(HttpJsonResolver::new("kg", base_url)));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = pmoconfig::get_config();

    let mut server = ServerBuilder::new_configured().build();
    server.init_logging(LoggingOptions::from_config()).await;
    server.init_config_api().await?;

    let cache_dir = config.get_remote_cache_dir()?;
    let artifacts = Arc::new(ArtifactStore::scan(&cache_dir).await?);

    let local_library = match config.get_local_library_dir() {
        Some(dir) => match LocalLibrary::scan(&dir).await {
            Ok(lib) => Some(Arc::new(lib)),
            Err(err) => {
                warn!(%err, "failed to scan local library, continuing without it");
                None
            }
        },
        None => None,
    };

    let kv_dir = std::path::Path::new(&cache_dir).join("kv");
    let kv = Arc::new(KvCache::open(&kv_dir)?);
    kv.clone().spawn_periodic_flush(Duration::from_secs(30));

    let mut registry = ResolverRegistry::new();
    register_illustrative_resolvers(&mut registry);
    info!(sources = ?registry.sources(), "resolvers registered");
    let resolvers = Arc::new(registry);

    let scripts_dir = config.get_scripts_dir()?;
    let interpreter = config.get_scripts_interpreter();
    let script_urls = config.get_external_script_urls();
    let fallback = Arc::new(FallbackRunner::new(scripts_dir, interpreter, script_urls));
    if let Err(err) = fallback.refresh_all().await {
        warn!(%err, "failed to refresh one or more fallback scripts at startup");
    }

    let materializer = Arc::new(Materializer::new(artifacts.clone()));

    let base_url = server.base_url();
    let cache_url = format!("{base_url}/cache");
    let coordinator = Coordinator::new(
        cache_url,
        artifacts,
        local_library,
        kv,
        resolvers,
        fallback,
        materializer,
    );

    let api_router = Router::new()
        .route("/url/{source}/{song_id}/{quality}", get(url_handler))
        .route("/url/{source}/{song_id}", get(url_no_quality_handler))
        .route("/lyric/{source}/{song_id}", get(lyric_handler))
        .route("/search/{source}", get(search_handler))
        .route("/{method}/{source}/{song_id}/{quality}", get(other_with_quality_handler))
        .route("/{method}/{source}/{song_id}", get(other_handler))
        .with_state(coordinator);

    server.add_router("/", api_router).await;

    let cache_dir_state = Arc::new(std::path::PathBuf::from(&cache_dir));
    let cache_router = Router::new()
        .route("/cache/{basename}", get(cache_handler))
        .with_state(cache_dir_state);
    server.add_router("/", cache_router).await;

    info!("starting pmoproxy");
    server.start().await;
    server.wait().await;

    Ok(())
}
