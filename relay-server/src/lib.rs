//! HTTP front of the relay: `POST /api/chat` windows the posted history,
//! forwards it upstream and streams the reply text back as plain text.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::http::header::COOKIE;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::post;
use elephie_core::ChatRelay;
use elephie_core::Config;
use elephie_core::ConfigOverrides;
use elephie_core::RelayConfig;
use elephie_core::RelayStream;
use elephie_core::StaticToken;
use elephie_core::client::AUTH_COOKIE;
use elephie_core::models::ChatRequest;
use elephie_core::window_history;
use futures::TryStreamExt;
use tokio::net::TcpListener;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

pub use cli::Cli;

const REPLY_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Body of every response to a chat request that failed before streaming.
const FAILURE_BODY: &str = "Error";

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let default_level = "info";
    let _ = tracing_subscriber::fmt()
        // Fallback to the `default_level` log filter if the environment
        // variable is not set _or_ contains an invalid value
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let Cli {
        listen,
        upstream,
        max_tokens,
        model,
        system_prompt,
    } = cli;
    let overrides = ConfigOverrides {
        endpoint_url: upstream,
        system_prompt,
        max_tokens,
        model,
        relay_url: None,
    };
    let config = Config::load_with_overrides(overrides)?;

    run_server(config.relay, listen).await?;
    Ok(())
}

/// Shared by every request; the HTTP client keeps one upstream connection
/// pool for the whole server.
#[derive(Clone)]
pub struct AppState {
    config: Arc<RelayConfig>,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .with_state(state)
}

/// Binds `addr` and serves until Ctrl-C.
pub async fn run_server(config: RelayConfig, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("relay listening on http://{}", listener.local_addr()?);
    info!(upstream = %config.endpoint_url, "forwarding chat requests");

    axum::serve(listener, router(AppState::new(config)))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => {
            warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

async fn chat_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match open_reply(&state, &headers, &body).await {
        Ok(reply) => {
            let reply = reply.inspect_err(|e| warn!("relay stream ended with error: {e}"));
            ([(CONTENT_TYPE, REPLY_CONTENT_TYPE)], Body::from_stream(reply)).into_response()
        }
        Err(e) => {
            error!("chat request failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, FAILURE_BODY).into_response()
        }
    }
}

async fn open_reply(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> elephie_core::error::Result<RelayStream> {
    let request: ChatRequest = serde_json::from_slice(body)?;
    let messages = window_history(&request.messages, state.config.history_char_budget);
    debug!(
        received = request.messages.len(),
        forwarded = messages.len(),
        "windowed chat history"
    );

    let tokens = Arc::new(StaticToken(token_from_cookies(headers)));
    let relay = ChatRelay::with_client(state.http.clone(), state.config.as_ref().clone(), tokens);
    relay.open(&messages).await
}

/// Value of the `Authorization` cookie, percent-decoded.
pub fn token_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == AUTH_COOKIE)
        .map(|(_, value)| match urlencoding::decode(value) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => value.to_string(),
        })
}
