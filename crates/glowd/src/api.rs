use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::{CardSettings, EngineHandle, EngineMessage};

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

/// Generic acknowledgement for operations submitted to the engine
#[derive(Serialize)]
struct AckResponse {
    status: String,
}

/// Body for POST /v1/cards/:name/brightness
#[derive(Deserialize)]
struct BrightnessRequest {
    percent: u8,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: EngineHandle,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/cards
///
/// Returns the latest display snapshot: per card the entity state,
/// brightness percentage, formatted countdown, and motion indicator.
async fn cards(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.engine.view();
    (StatusCode::OK, Json(view.as_ref().clone()))
}

fn card_exists(state: &AppState, name: &str) -> bool {
    state.engine.view().cards.iter().any(|c| c.name == name)
}

/// Handler for POST /v1/cards/:name/toggle
async fn toggle(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !card_exists(&state, &name) {
        return (StatusCode::NOT_FOUND, Json(ack("unknown card")));
    }

    state.engine.send(EngineMessage::Toggle { card: name });
    (StatusCode::ACCEPTED, Json(ack("accepted")))
}

/// Handler for POST /v1/cards/:name/brightness
async fn set_brightness(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(body): Json<BrightnessRequest>,
) -> impl IntoResponse {
    if !card_exists(&state, &name) {
        return (StatusCode::NOT_FOUND, Json(ack("unknown card")));
    }
    if body.percent > 100 {
        return (StatusCode::BAD_REQUEST, Json(ack("percent exceeds 100")));
    }

    state.engine.send(EngineMessage::SetBrightness {
        card: name,
        percent: body.percent,
    });
    (StatusCode::ACCEPTED, Json(ack("accepted")))
}

/// Handler for PUT /v1/cards/:name/settings
async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(settings): Json<CardSettings>,
) -> impl IntoResponse {
    if !card_exists(&state, &name) {
        return (StatusCode::NOT_FOUND, Json(ack("unknown card")));
    }

    state.engine.send(EngineMessage::UpdateSettings {
        card: name,
        settings,
    });
    (StatusCode::ACCEPTED, Json(ack("accepted")))
}

fn ack(status: &str) -> AckResponse {
    AckResponse {
        status: status.to_string(),
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/cards", get(cards))
        .route("/v1/cards/:name/toggle", post(toggle))
        .route("/v1/cards/:name/brightness", post(set_brightness))
        .route("/v1/cards/:name/settings", put(update_settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to the specified address and serves until the provided shutdown
/// signal is triggered.
pub async fn serve(
    listen: String,
    port: u16,
    engine: EngineHandle,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
