// logs.rs
mod sselayer;

pub use sselayer::SseLayer;

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock},
    time::SystemTime,
};

use axum::{
    Json, Router,
    extract::{Query, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Représente une entrée de log
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Buffer circulaire partagé
#[derive(Clone)]
pub struct LogState {
    buffer: Arc<RwLock<VecDeque<LogEntry>>>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogState {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            tx: broadcast::channel(1000).0,
        }
    }

    fn push(&self, entry: LogEntry) {
        let mut buf = self.buffer.write().unwrap();
        if buf.len() == buf.capacity() {
            buf.pop_front();
        }
        buf.push_back(entry.clone());
        let _ = self.tx.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    pub fn dump(&self) -> Vec<LogEntry> {
        self.buffer.read().unwrap().iter().cloned().collect()
    }
}

/// Query params pour /log-sse
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub error: Option<bool>,
    #[serde(default)]
    pub warn: Option<bool>,
    #[serde(default)]
    pub info: Option<bool>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub trace: Option<bool>,
    #[serde(default)]
    pub search: Option<String>,
}

/// Handler SSE
// Dans logs.rs
pub async fn log_sse(
    State(state): State<LogState>,
    Query(params): Query<LogQuery>,
) -> impl IntoResponse {
    let mut rx = state.subscribe();

    // Récupérer l'historique du buffer
    let history = state.dump();

    let stream = async_stream::stream! {
        // 1. Envoyer d'abord tous les logs historiques
        for entry in history {
            if !filter_entry(&entry, &params) {
                continue;
            }
            let json = serde_json::to_string(&entry).unwrap();
            yield Ok::<_, axum::Error>(Event::default().data(json));
        }

        // 2. Puis streamer les nouveaux logs en temps réel
        while let Ok(entry) = rx.recv().await {
            if !filter_entry(&entry, &params) {
                continue;
            }
            let json = serde_json::to_string(&entry).unwrap();
            yield Ok::<_, axum::Error>(Event::default().data(json));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Handler REST (dump JSON du buffer)
pub async fn log_dump(State(state): State<LogState>) -> impl IntoResponse {
    Json(state.dump())
}

/// Fonction de filtrage
fn filter_entry(entry: &LogEntry, q: &LogQuery) -> bool {
    // Filtrage par niveau
    let lvl = entry.level.to_lowercase();
    let mut allowed = false;

    if let Some(true) = q.error {
        allowed |= lvl == "error";
    }
    if let Some(true) = q.warn {
        allowed |= lvl == "warn";
    }
    if let Some(true) = q.info {
        allowed |= lvl == "info";
    }
    if let Some(true) = q.debug {
        allowed |= lvl == "debug";
    }
    if let Some(true) = q.trace {
        allowed |= lvl == "trace";
    }

    // si aucun flag → tout est autorisé
    if !(q.error.unwrap_or(false)
        || q.warn.unwrap_or(false)
        || q.info.unwrap_or(false)
        || q.debug.unwrap_or(false)
        || q.trace.unwrap_or(false))
    {
        allowed = true;
    }

    // Filtrage par mot-clé
    if let Some(search) = &q.search {
        allowed &= entry.message.contains(search) || entry.target.contains(search);
    }

    allowed
}

/// Options passées à [`init_logging`].
#[derive(Debug, Clone, Deserialize, Serialize, utoipa::ToSchema)]
pub struct LoggingOptions {
    pub buffer_capacity: usize,
    pub enable_console: bool,
    pub min_level: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            enable_console: true,
            min_level: "TRACE".to_string(),
        }
    }
}

impl LoggingOptions {
    /// Builds logging options from `host.logger.*` configuration keys.
    pub fn from_config() -> Self {
        let config = pmoconfig::get_config();
        Self {
            buffer_capacity: config.get_log_cache_size().unwrap_or(1000),
            enable_console: config.get_log_enable_console().unwrap_or(true),
            min_level: config
                .get_log_min_level()
                .unwrap_or_else(|_| "TRACE".to_string()),
        }
    }
}

/// Installs the global `tracing` subscriber (SSE layer plus optional console
/// formatter) and returns the [`LogState`] driving `/log-sse` and `/log-dump`.
///
/// Idempotent against repeated calls only in the sense that the caller is
/// expected to call this once at startup; a second call will panic, matching
/// `tracing_subscriber`'s own global-subscriber contract.
pub fn init_logging(options: LoggingOptions) -> LogState {
    let state = LogState::new(options.buffer_capacity);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(options.min_level.to_lowercase()));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(SseLayer::new(state.clone()));

    if options.enable_console {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.init();
    }

    state
}

/// OpenAPI document for the logging endpoints, mounted by [`create_logs_router`].
#[derive(utoipa::OpenApi)]
#[openapi(paths(log_setup_get, log_setup_post), components(schemas(LoggingOptions)))]
pub struct LogsApiDoc;

#[utoipa::path(get, path = "/log-setup", responses((status = 200, body = LoggingOptions)))]
pub async fn log_setup_get() -> Json<LoggingOptions> {
    Json(LoggingOptions::from_config())
}

#[utoipa::path(post, path = "/log-setup", responses((status = 200, body = LoggingOptions)))]
pub async fn log_setup_post(Json(options): Json<LoggingOptions>) -> Json<LoggingOptions> {
    let config = pmoconfig::get_config();
    let _ = config.set_log_min_level(options.min_level.clone());
    Json(options)
}

/// Builds the standalone router mounting `/log-sse`, `/log-dump`, and
/// `/log-setup` against `state`, for callers that want logging endpoints
/// without going through [`crate::Server::init_logging`].
pub fn create_logs_router(state: LogState) -> Router {
    Router::new()
        .route("/log-sse", get(log_sse))
        .route("/log-dump", get(log_dump))
        .route("/log-setup", get(log_setup_get).post(log_setup_post))
        .with_state(state)
}
