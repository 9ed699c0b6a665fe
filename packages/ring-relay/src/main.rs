//! Ring Relay Server
//!
//! A lightweight WebSocket relay that lets two browsers set up a direct
//! WebRTC audio/video call:
//!
//! 1. **Presence**: every connection gets an ephemeral identity and the full
//!    roster of who else is online.
//!
//! 2. **Call lifecycle**: ring, accept, decline, cancel and hang up, with
//!    races (cancel vs. accept, simultaneous hangups) resolved server-side.
//!
//! 3. **Signaling relay**: SDP offers/answers and ICE candidates are forwarded
//!    between the two participants without being inspected.
//!
//! 4. **Text channel**: best-effort chat between the participants of a
//!    connected call.
//!
//! **Privacy**: media never touches the relay. Signal payloads are opaque
//! and are not logged.

mod error;
mod handler;
mod identity;
mod presence;
mod protocol;
mod relay;
mod session;
mod state;

use std::path::PathBuf;
use std::time::Duration;

use axum::{
    extract::{Request, State, WebSocketUpgrade},
    http::{header, Method},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ring-relay", version, about = "WebRTC call signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000, env = "RELAY_PORT")]
    port: u16,

    /// Outbound messages buffered per client before delivery starts failing
    #[arg(long, default_value_t = 64, env = "CLIENT_BUFFER")]
    client_buffer: usize,

    /// Largest accepted WebSocket message in bytes
    #[arg(long, default_value_t = 65536, env = "MAX_MESSAGE_BYTES")]
    max_message_bytes: usize,

    /// Seconds a call may ring before it is ended as unanswered
    #[arg(long, default_value_t = 60, env = "RING_TIMEOUT_SECS")]
    ring_timeout_secs: i64,

    /// How often to look for unanswered calls, in seconds
    #[arg(long, default_value_t = 5, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Production mode: redirect plain-HTTP page requests to HTTPS
    #[arg(long, env = "RELAY_PRODUCTION")]
    production: bool,

    /// Directory with the built browser client to serve
    #[arg(long, env = "STATIC_DIR")]
    static_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ring_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        client_buffer: args.client_buffer,
        max_message_bytes: args.max_message_bytes,
        ring_timeout_secs: args.ring_timeout_secs,
        production: args.production,
        static_dir: args.static_dir,
    };

    if let Some(ref dir) = config.static_dir {
        tracing::info!(dir = %dir.display(), "Serving static client");
    }

    let state = RelayState::new(config);

    // Spawn periodic sweep of unanswered calls
    let sweep_state = state.clone();
    let sweep_interval = args.sweep_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            sweep_state.sweep_unanswered();
        }
    });

    let addr = format!("0.0.0.0:{}", state.config.port);
    let app = build_router(state);

    tracing::info!("Ring relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

/// Assemble the HTTP surface: WebSocket endpoint, probes, optional static
/// client, and the production HTTPS redirect.
fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler));

    if let Some(ref dir) = state.config.static_dir {
        let index = ServeFile::new(dir.join("index.html"));
        app = app.fallback_service(ServeDir::new(dir).fallback(index));
    }

    if state.config.production {
        app = app.layer(middleware::from_fn(redirect_to_https));
    }

    app.layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ring-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let (ringing, accepted) = state.call_counts();
    Json(json!({
        "online_clients": state.presence.online_count(),
        "ringing_calls": ringing,
        "connected_calls": accepted,
        "ring_timeout_secs": state.config.ring_timeout_secs,
    }))
}

/// Send page requests that reached the proxy over plain HTTP to HTTPS.
///
/// The relay sits behind a TLS-terminating proxy, so the scheme comes from
/// `X-Forwarded-Proto`; a missing header means the request was plain HTTP.
/// The WebSocket and health endpoints are left alone.
async fn redirect_to_https(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if path == "/ws" || path == "/health" {
        return next.run(request).await;
    }

    let secure = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if secure {
        return next.run(request).await;
    }

    let location = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(|host| {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            format!("https://{}{}", host, path_and_query)
        });

    match location {
        Some(location) => Redirect::temporary(&location).into_response(),
        None => next.run(request).await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
