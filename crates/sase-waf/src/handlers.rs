//! API Handlers

use crate::error::PipelineError;
use crate::reporter::Verdict;
use crate::AppState;
use axum::{extract::Request, http::StatusCode, Extension, Json};
use sase_waf_engine::InspectionEngine;
use serde::Serialize;
use std::sync::Arc;

/// Ping response
#[derive(Serialize)]
pub struct Pong {
    /// Always `ok`
    pub pong: &'static str,
}

/// Liveness check
pub async fn ping() -> Json<Pong> {
    tracing::info!("Ping received");
    Json(Pong { pong: "ok" })
}

/// Inspect the request and return the verdict
pub async fn inspect<E: InspectionEngine>(
    Extension(state): Extension<Arc<AppState<E>>>,
    request: Request,
) -> Result<Json<Verdict>, PipelineError> {
    let inspection = state.pipeline.inspect(request).await?;
    Ok(Json(inspection.verdict))
}

/// Unmatched route
pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
