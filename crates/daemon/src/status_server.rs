//! Control HTTP server for the stream checker
//!
//! Exposes queue, admission, pipeline and sweep operations for the
//! management UI and monitoring tools.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::admission::{AdmissionError, AdmissionStatus, ResetReport};
use crate::catalog::ChannelId;
use crate::config::PipelineMode;
use crate::pipeline::{Pipeline, SweepError, SweepReport, UpdateReport};
use crate::queue::{EnqueueOutcome, QueueStatus};
use crate::status::{collect_status, SharedSystemMetrics, StatusSnapshot};

/// Errors that can occur when running the control server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Errors returned by handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Sweep(#[from] SweepError),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Admission(e) => {
                error!(error = %e, "Admission store error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Sweep(SweepError::AlreadyRunning) => StatusCode::CONFLICT,
            ApiError::Sweep(SweepError::Disabled) => StatusCode::FORBIDDEN,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub system: SharedSystemMetrics,
}

#[derive(Debug, Deserialize)]
pub struct EnqueueParams {
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub channel_id: ChannelId,
    pub outcome: EnqueueOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: PipelineMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepStatusBody {
    pub in_progress: bool,
    pub last_sweep: Option<SweepReport>,
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, ApiError> {
    Ok(Json(collect_status(&state.pipeline, &state.system).await?))
}

async fn get_queue(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.pipeline.scheduler().queue().status())
}

/// Steady-state enqueue; refused with 409 while a sweep runs
async fn enqueue_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<ChannelId>,
    Query(params): Query<EnqueueParams>,
) -> (StatusCode, Json<EnqueueResponse>) {
    let outcome = state
        .pipeline
        .enqueue_channel(&channel_id, params.priority.unwrap_or(0));
    let status = match outcome {
        EnqueueOutcome::Queued | EnqueueOutcome::RerunScheduled => StatusCode::ACCEPTED,
        EnqueueOutcome::SweepActive => StatusCode::CONFLICT,
        EnqueueOutcome::AlreadyQueued | EnqueueOutcome::InProgress => StatusCode::OK,
    };
    (status, Json(EnqueueResponse { channel_id, outcome }))
}

async fn channels_updated(
    State(state): State<AppState>,
    Json(channel_ids): Json<Vec<ChannelId>>,
) -> Json<UpdateReport> {
    Json(state.pipeline.handle_update(&channel_ids))
}

async fn get_admission(State(state): State<AppState>) -> Result<Json<AdmissionStatus>, ApiError> {
    Ok(Json(state.pipeline.scheduler().admission().status()?))
}

async fn reset_admission(State(state): State<AppState>) -> Result<Json<ResetReport>, ApiError> {
    Ok(Json(state.pipeline.scheduler().admission().reset()?))
}

async fn get_mode(State(state): State<AppState>) -> Json<ModeBody> {
    Json(ModeBody {
        mode: state.pipeline.mode(),
    })
}

async fn set_mode(State(state): State<AppState>, Json(body): Json<ModeBody>) -> Json<ModeBody> {
    state.pipeline.set_mode(body.mode);
    Json(ModeBody {
        mode: state.pipeline.mode(),
    })
}

async fn get_sweep(State(state): State<AppState>) -> Json<SweepStatusBody> {
    Json(SweepStatusBody {
        in_progress: state.pipeline.is_sweep_in_progress(),
        last_sweep: state.pipeline.last_sweep(),
    })
}

async fn trigger_sweep(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.pipeline.trigger_sweep()?;
    Ok(StatusCode::ACCEPTED)
}

/// Creates the axum Router with all control endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/queue", get(get_queue))
        .route("/queue/:channel_id", post(enqueue_channel))
        .route("/channels/updated", post(channels_updated))
        .route("/admission", get(get_admission))
        .route("/admission/reset", post(reset_admission))
        .route("/pipeline/mode", get(get_mode).put(set_mode))
        .route("/sweep", get(get_sweep).post(trigger_sweep))
        .with_state(state)
}

/// Runs the control server until it fails
pub async fn run_status_server(state: AppState, addr: SocketAddr) -> Result<(), ServerError> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Control server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
