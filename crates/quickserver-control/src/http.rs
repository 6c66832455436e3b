//! HTTP surface: health plus the two owner-facing fleet operations.
//!
//! This is the boundary where errors become user-visible text, so every failure is rendered
//! through [`FleetError::public_message`].

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use quickserver_types::{Instance, InstanceId, OwnerId};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionRequest;
use crate::error::FleetError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    draining: bool,
    in_flight: usize,
    queue_running: bool,
    queue_depth: usize,
    billing_enabled: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let draining = state.shutdown.is_draining();
    Json(HealthzResponse {
        status: if draining { "draining" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        draining,
        in_flight: state.shutdown.in_flight(),
        queue_running: state.queue.is_running(),
        queue_depth: state.queue.len(),
        billing_enabled: state.billing_enabled,
    })
}

#[derive(Debug, Deserialize)]
struct CreateInstanceBody {
    region: String,
    variant: String,
    owner_id: String,
    #[serde(default)]
    guild_id: Option<String>,
}

async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<(StatusCode, Json<Instance>), ApiError> {
    let instance = state
        .admission
        .execute(AdmissionRequest {
            region: body.region,
            variant: body.variant,
            owner_id: OwnerId::new(body.owner_id),
            guild_id: body.guild_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

#[derive(Debug, Serialize)]
struct TerminateResponse {
    deleted: Vec<InstanceId>,
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<TerminateResponse>, ApiError> {
    let owner = OwnerId::new(owner_id);
    let terminator = state.terminator.clone();
    let deleted = state
        .shutdown
        .run(async move { terminator.delete_for_owner(&owner).await })
        .await?;
    Ok(Json(TerminateResponse { deleted }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/instances", post(create_instance))
        .route("/owners/:owner_id/instance", delete(terminate_instance))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FleetError::User(_) => StatusCode::CONFLICT,
            FleetError::InsufficientCapacity(_) | FleetError::ShutdownInProgress => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FleetError::Reclamation { .. } | FleetError::Store(_) | FleetError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && !self.0.is_transient() {
            tracing::error!(error = ?self.0, kind = self.0.as_label(), "request failed");
        }
        let body = ErrorBody {
            error: self.0.public_message().to_string(),
            kind: self.0.as_label(),
        };
        (status, Json(body)).into_response()
    }
}
