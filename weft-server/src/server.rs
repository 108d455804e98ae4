//! Server state and listener wiring.
//!
//! Builds the process-wide singletons (hub, session manager, store,
//! cache+bus, verifier), wires the broadcast callback, and serves the
//! WebSocket endpoint plus a read-only health route.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::bus::{EventBus, MemoryBus, SessionCache};
use crate::config::ServerConfig;
use crate::db::Db;
use crate::hub::{self, ConnectionHub};
use crate::registry::{OwnerRegistry, RpcRegistry};
use crate::session::SessionManager;
use crate::tokens::TokenVerifier;

/// Shared state accessible by all connection handlers.
pub struct SharedState {
    pub config: ServerConfig,
    /// This server's DID — the audience of every accepted token.
    pub server_did: String,
    /// Unique per process; publishers use it to skip their own bus echo.
    pub node_id: String,
    pub hub: Arc<ConnectionHub>,
    pub sessions: Arc<SessionManager>,
    pub db: Arc<Mutex<Db>>,
    pub cache: Arc<dyn SessionCache>,
    pub bus: Arc<dyn EventBus>,
    pub verifier: TokenVerifier,
    pub started_at: Instant,
}

pub struct Server {
    config: ServerConfig,
    registry: Option<Arc<dyn OwnerRegistry>>,
    cache: Option<Arc<dyn SessionCache>>,
    bus: Option<Arc<dyn EventBus>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: None,
            cache: None,
            bus: None,
        }
    }

    /// Inject a registry (for testing).
    pub fn with_registry(mut self, registry: Arc<dyn OwnerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Inject the cache and bus handles. Several servers consuming one
    /// shared transport form a cluster — this is how multi-node tests are
    /// wired (both handles backed by the same `MemoryBus`).
    pub fn with_cache_bus(
        mut self,
        cache: Arc<dyn SessionCache>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        self.cache = Some(cache);
        self.bus = Some(bus);
        self
    }

    /// Build the process-wide singletons and wire them together.
    fn build_state(&self) -> Result<Arc<SharedState>> {
        let config = self.config.clone();
        let node_id = Uuid::new_v4().to_string();

        let db = if config.db_path == ":memory:" {
            Db::open_memory()
        } else {
            tracing::info!(path = %config.db_path, "opening durable store");
            Db::open(&config.db_path)
        }
        .context("failed to open durable store")?;
        let db = Arc::new(Mutex::new(db));

        let (cache, bus) = match (self.cache.clone(), self.bus.clone()) {
            (Some(cache), Some(bus)) => (cache, bus),
            _ => {
                let transport = MemoryBus::new();
                (
                    Arc::clone(&transport) as Arc<dyn SessionCache>,
                    transport as Arc<dyn EventBus>,
                )
            }
        };
        let registry = self
            .registry
            .clone()
            .unwrap_or_else(|| Arc::new(RpcRegistry::new(&config.rpc_url)) as Arc<dyn OwnerRegistry>);

        let hub = ConnectionHub::new();
        let sessions =
            SessionManager::new(&node_id, Arc::clone(&cache), Arc::clone(&bus), Arc::clone(&db));

        // One-way registration: the manager only ever calls back through
        // this opaque function.
        let delivery_hub = Arc::clone(&hub);
        sessions.set_broadcast_handler(Arc::new(
            move |clients, payload, exclude, droppable| {
                delivery_hub.deliver(clients, payload, exclude, droppable);
            },
        ));
        sessions.spawn_event_loop();

        let verifier = TokenVerifier::new(&config.server_did, registry);
        let server_did = config.server_did.clone();

        Ok(Arc::new(SharedState {
            config,
            server_did,
            node_id,
            hub,
            sessions,
            db,
            cache,
            bus,
            verifier,
            started_at: Instant::now(),
        }))
    }

    /// Run the server until interrupted, then shut down gracefully.
    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        let addr = state.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, node_id = %state.node_id, "listening");

        let app = router(Arc::clone(&state));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // Stopped accepting; now drop every socket so writer tasks end.
        state.hub.close_all();
        tracing::info!("shutdown complete");
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for
    /// testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(state.config.listen_addr()).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, node_id = %state.node_id, "listening (test mode)");

        let app = router(state);
        let handle =
            tokio::spawn(async move { axum::serve(listener, app).await.map_err(Into::into) });
        Ok((addr, handle))
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

// ── Router ─────────────────────────────────────────────────────────────

pub fn router(state: Arc<SharedState>) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring unparseable CORS origin");
                    None
                }
            })
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/", get(ws_upgrade))
        .route("/api/v1/health", get(api_health))
        .layer(cors)
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub::handle_socket(socket, state))
}

#[derive(Serialize)]
struct HealthResponse {
    node_id: String,
    node_env: String,
    connections: usize,
    sessions: usize,
    uptime_secs: u64,
}

async fn api_health(State(state): State<Arc<SharedState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: state.node_id.clone(),
        node_env: state.config.node_env.clone(),
        connections: state.hub.connection_count(),
        sessions: state.sessions.local_session_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
