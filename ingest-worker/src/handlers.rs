use std::future::ready;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing, Json, Router,
};
use health::HealthRegistry;
use ingest_common::metrics::track_metrics;
use ingest_common::Job;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::submit::{SubmitResponse, Submitter};

#[derive(Clone)]
pub struct AppState {
    pub submitter: Submitter,
    pub default_source_system: String,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    error: String,
}

/// The body of a request made to submit a source file.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequestBody {
    source_path: String,
    #[serde(default)]
    source_system: Option<String>,
}

pub fn add_routes(router: Router, state: AppState, liveness: HealthRegistry) -> Router {
    let jobs = Router::new()
        .route("/jobs", routing::post(post_job))
        .route("/jobs/:id", routing::get(get_job))
        .with_state(state);

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        )
        .merge(jobs)
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "ingest worker"
}

pub async fn post_job(
    State(state): State<AppState>,
    Json(payload): Json<SubmitRequestBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ErrorResponse>)> {
    debug!("received submission: {:?}", payload);

    let source_system = match payload.source_system.as_deref().map(str::trim) {
        Some(system) if !system.is_empty() => system.to_owned(),
        _ => state.default_source_system.clone(),
    };

    let response = state
        .submitter
        .submit(&payload.source_path, &source_system)
        .await
        .map_err(submit_error)?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    match state.submitter.status(id).await.map_err(submit_error)? {
        Some(job) => Ok(Json(job)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("job {} not found", id),
            }),
        )),
    }
}

fn submit_error(err: SubmitError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        SubmitError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        SubmitError::SourceFile { error, .. } if error.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND
        }
        SubmitError::SourceFile { .. } | SubmitError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SubmitError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    if status.is_server_error() {
        error!("submission failed: {}", err);
    } else {
        debug!("submission rejected: {}", err);
    }

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}
