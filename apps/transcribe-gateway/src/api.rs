use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use transcribe_dispatch::{DispatchError, DispatchService, Priority, RequestId, RequestOutcome, RequestRecord, RequestStatus, SubmitRequest};

const DEFAULT_DEADLINE_MS: u64 = 10_000;

pub fn router(service: Arc<DispatchService>) -> Router {
	Router::new()
		.route("/v1/transcriptions", post(submit))
		.route("/v1/transcriptions/:id", get(status))
		.route("/healthz", get(healthz))
		.route("/metrics", get(metrics))
		.with_state(service)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
	pub audio_uri: String,
	pub audio_secs: f64,
	#[serde(default)]
	pub priority: Priority,
	/// Latency budget from admission; the built-in budget covers the
	/// interactive use case.
	pub deadline_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
	pub id: RequestId,
	pub status: RequestStatus,
	pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
	pub id: RequestId,
	pub status: RequestStatus,
	pub priority: Priority,
	pub audio_secs: f64,
	pub attempts: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub elapsed_secs: Option<f64>,
	pub as_of: DateTime<Utc>,
}

impl StatusResponse {
	fn from_record(record: &RequestRecord) -> Self {
		let (text, error, elapsed_secs) = match &record.outcome {
			Some(RequestOutcome::Completed { text, elapsed }) => (Some(text.clone()), None, Some(elapsed.as_secs_f64())),
			Some(RequestOutcome::Failed { error }) => (None, Some(error.clone()), None),
			Some(RequestOutcome::Expired) | None => (None, None, None),
		};
		Self {
			id: record.id,
			status: record.status,
			priority: record.priority,
			audio_secs: record.audio_secs,
			attempts: record.attempts,
			text,
			error,
			elapsed_secs,
			as_of: Utc::now(),
		}
	}
}

#[derive(Serialize)]
pub struct HealthResponse {
	status: &'static str,
	version: &'static str,
	queue_depth: usize,
	inflight_batches: usize,
	ready_workers: usize,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
	#[error(transparent)]
	Dispatch(#[from] DispatchError),

	#[error("no request with id {0}")]
	UnknownRequest(RequestId),
}

impl ApiError {
	const fn status_code(&self) -> StatusCode {
		match self {
			Self::Dispatch(DispatchError::AdmissionRejected(reason)) => match reason {
				transcribe_dispatch::AdmissionReason::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
				transcribe_dispatch::AdmissionReason::DeadlineElapsed => StatusCode::UNPROCESSABLE_ENTITY,
			},
			Self::Dispatch(DispatchError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
			Self::UnknownRequest(_) => StatusCode::NOT_FOUND,
			Self::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		#[derive(Serialize)]
		struct ErrorBody {
			error: String,
		}

		let status = self.status_code();
		if status.is_server_error() {
			tracing::error!(error = %self, "request failed");
		}
		(status, Json(ErrorBody { error: self.to_string() })).into_response()
	}
}

// ============================================================================
// Handlers
// ============================================================================

#[axum::debug_handler]
#[instrument(name = "submit", skip(service, body))]
async fn submit(State(service): State<Arc<DispatchService>>, Json(body): Json<SubmitBody>) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
	let deadline_in = Duration::from_millis(body.deadline_ms.unwrap_or(DEFAULT_DEADLINE_MS));
	let receipt = service
		.submit(SubmitRequest {
			audio_uri: body.audio_uri,
			audio_secs: body.audio_secs,
			priority: body.priority,
			deadline_in,
		})
		.await?;

	// The caller polls for the result; nobody waits on the responder here.
	let response = SubmitResponse {
		id: receipt.id,
		status: RequestStatus::Queued,
		submitted_at: Utc::now(),
	};
	Ok((StatusCode::ACCEPTED, Json(response)))
}

#[axum::debug_handler]
#[instrument(name = "status", skip(service))]
async fn status(State(service): State<Arc<DispatchService>>, Path(id): Path<RequestId>) -> Result<Json<StatusResponse>, ApiError> {
	let record = service.status(id).await.ok_or(ApiError::UnknownRequest(id))?;
	Ok(Json(StatusResponse::from_record(&record)))
}

#[axum::debug_handler]
#[instrument(name = "healthz", skip(service))]
async fn healthz(State(service): State<Arc<DispatchService>>) -> (StatusCode, Json<HealthResponse>) {
	let health = service.health().await;
	let response = HealthResponse {
		status: "healthy",
		version: env!("CARGO_PKG_VERSION"),
		queue_depth: health.queue_depth,
		inflight_batches: health.inflight_batches,
		ready_workers: health.ready_workers,
	};
	(StatusCode::OK, Json(response))
}

#[axum::debug_handler]
async fn metrics(State(service): State<Arc<DispatchService>>) -> Response {
	match service.export_metrics() {
		Ok(text) => (StatusCode::OK, [("Content-Type", "text/plain; version=0.0.4")], text).into_response(),
		Err(e) => {
			tracing::error!("failed to gather metrics: {e}");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		}
	}
}
