use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRef, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nostr_relay::config::RelayConfig;
use nostr_relay::ip::resolve_client_ip;
use nostr_relay::management;
use nostr_relay::pipeline::Pipeline;
use nostr_relay::relay_context::RelayContext;
use nostr_relay::session;
use nostr_relay::storage::memory::MemoryStore;
use nostr_relay::storage::postgres::PostgresStore;
use nostr_relay::storage::EventStore;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = RelayConfig::from_env();
    let port = config.port;

    let storage: Arc<dyn EventStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url).await.expect("failed to connect to database");
            store.migrate().await.expect("failed to run migrations");
            Arc::new(store)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory storage");
            Arc::new(MemoryStore::new())
        }
    };

    let ctx = Arc::new(RelayContext::new(config, storage));
    info!(pubkey = %ctx.identity.pubkey_hex, "relay identity ready");

    let pipeline = Arc::new(Pipeline::spawn(ctx.clone(), 4, 1000));

    spawn_ban_gc(ctx.clone());

    let state = AppState { ctx: ctx.clone(), pipeline: pipeline.clone() };

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin", post(management::handle_rpc))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("invalid bind address");
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind listen socket");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<RelayContext>,
    pipeline: Arc<Pipeline>,
}

impl FromRef<AppState> for Arc<RelayContext> {
    fn from_ref(state: &AppState) -> Self {
        state.ctx.clone()
    }
}

impl FromRef<AppState> for Arc<Pipeline> {
    fn from_ref(state: &AppState) -> Self {
        state.pipeline.clone()
    }
}

async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(ctx): State<Arc<RelayContext>>,
    State(pipeline): State<Arc<Pipeline>>,
) -> Response {
    let ip = resolve_client_ip(&headers, peer);

    if let Some(ws) = ws {
        if ctx.bans.is_banned(&ip) {
            return (axum::http::StatusCode::FORBIDDEN, "banned").into_response();
        }
        if !ctx.try_admit_connection() {
            return (axum::http::StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
        }
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        return ws
            .on_upgrade(move |socket| session::run(socket, ctx, pipeline, client_id, ip))
            .into_response();
    }

    if headers.get("accept").and_then(|v| v.to_str().ok()).unwrap_or("").contains("application/nostr+json") {
        return Json(nip11_document(&ctx)).into_response();
    }

    "Nostr relay".into_response()
}

fn nip11_document(ctx: &RelayContext) -> serde_json::Value {
    serde_json::json!({
        "name": ctx.config.relay_name,
        "description": ctx.config.relay_description,
        "pubkey": ctx.identity.pubkey_hex,
        "software": "nostr-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "supported_nips": [1, 9, 11, 13, 29, 40, 45, 77],
        "limitation": {
            "max_message_length": ctx.config.read_buffer_limit(),
            "max_content_length": ctx.config.max_content_len,
            "max_subscriptions": ctx.config.max_subscriptions_per_connection,
            "max_limit": nostr_relay::model::MAX_LIMIT,
            "min_pow_difficulty": ctx.config.pow_min_bits,
            "created_at_lower_limit": ctx.config.epoch_floor,
        },
    })
}

async fn metrics_handler(State(ctx): State<Arc<RelayContext>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        ctx.metrics.render(),
    )
}

fn spawn_ban_gc(ctx: Arc<RelayContext>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ctx.config.ban_gc_interval);
        loop {
            ticker.tick().await;
            ctx.bans.gc();
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
}
