use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::controller::{Input, UserCommand};
use crate::error::CommandError;
use crate::heater::OverrideMode;
use crate::preset::Preset;
use crate::room::RoomConfig;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub inputs: mpsc::Sender<Input>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

pub enum ApiError {
    Rejected(CommandError),
    /// The controller task is gone.
    Unavailable,
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        Self::Rejected(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Rejected(e) => {
                let status = match e {
                    CommandError::UnknownRoom(_) | CommandError::UnknownPreset(_) => {
                        StatusCode::NOT_FOUND
                    }
                    CommandError::DuplicateRoom(_) | CommandError::DuplicatePreset(_) => {
                        StatusCode::CONFLICT
                    }
                    CommandError::ReservedPresetName(_)
                    | CommandError::Invalid { .. }
                    | CommandError::InvalidMode(_) => StatusCode::UNPROCESSABLE_ENTITY,
                };
                (status, e.to_string())
            }
            Self::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "controller unavailable".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TargetBody {
    temperature: f64,
}

#[derive(Deserialize)]
struct RoomPresetBody {
    preset: Option<String>,
}

#[derive(Deserialize)]
struct GlobalPresetBody {
    preset: String,
}

#[derive(Deserialize)]
struct ModeBody {
    mode: String,
}

#[derive(Deserialize)]
struct ThresholdBody {
    value: f64,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/rooms", post(add_room))
        .route("/api/rooms/{name}", put(update_room).delete(remove_room))
        .route("/api/rooms/{name}/target", put(set_target))
        .route("/api/rooms/{name}/preset", put(set_room_preset))
        .route("/api/preset", put(select_preset))
        .route("/api/presets", post(add_preset))
        .route("/api/presets/{name}", put(update_preset).delete(remove_preset))
        .route("/api/heater/mode", put(set_mode))
        .route("/api/heater/threshold", put(set_threshold))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

/// Hand a command to the controller and wait for its verdict.
async fn dispatch(state: &AppState, command: UserCommand) -> Result<(), ApiError> {
    let (reply, rx) = oneshot::channel();
    state
        .inputs
        .send(Input::Command { command, reply })
        .await
        .map_err(|_| ApiError::Unavailable)?;
    rx.await.map_err(|_| ApiError::Unavailable)??;
    Ok(())
}

async fn set_target(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<TargetBody>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::SetTarget { room, temperature: body.temperature }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_room_preset(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<RoomPresetBody>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::SetRoomPreset { room, preset: body.preset }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn select_preset(
    State(state): State<AppState>,
    Json(body): Json<GlobalPresetBody>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::SelectPreset { option: body.preset }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_mode(
    State(state): State<AppState>,
    Json(body): Json<ModeBody>,
) -> Result<StatusCode, ApiError> {
    let mode: OverrideMode = body.mode.parse()?;
    dispatch(&state, UserCommand::SetOverrideMode { mode }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_threshold(
    State(state): State<AppState>,
    Json(body): Json<ThresholdBody>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::SetThreshold { value: body.value }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_room(
    State(state): State<AppState>,
    Json(config): Json<RoomConfig>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::AddRoom(config)).await?;
    Ok(StatusCode::CREATED)
}

async fn update_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<RoomConfig>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::UpdateRoom { name, config }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::RemoveRoom { name }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_preset(
    State(state): State<AppState>,
    Json(preset): Json<Preset>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::AddPreset(preset)).await?;
    Ok(StatusCode::CREATED)
}

async fn update_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(preset): Json<Preset>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::UpdatePreset { name, preset }).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, UserCommand::RemovePreset { name }).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
