//! Error types for the WAF adapter

use crate::lifecycle::Phase;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sase_waf_engine::EngineError;
use thiserror::Error;

/// Boxed error carried by request bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request-fatal pipeline error
///
/// Every variant maps to a bodiless 500; inspection verdicts never travel
/// through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Reading the request body from the client failed
    #[error("error while reading body: {0}")]
    BodyRead(#[source] BoxError),

    /// Engine refused the buffered body
    #[error("failed to append request body: {0}")]
    BodyAppend(#[source] EngineError),

    /// Engine could not expose its retained body copy
    #[error("failed to get the request body: {0}")]
    BodyReplay(#[source] EngineError),

    /// Phase 2 evaluation failed
    #[error("failed to process request body: {0}")]
    BodyProcess(#[source] EngineError),

    /// Phase call out of order
    #[error("phase {attempted:?} is not reachable from {current:?}")]
    PhaseOrder {
        /// Phase the transaction is in
        current: Phase,
        /// Phase that was requested
        attempted: Phase,
    },
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

/// Startup configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Config path
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Config file is not valid JSON
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Config path
        path: String,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// Inspection path is unusable
    #[error("invalid inspect path {0:?}: must be \"*\" or start with '/' and differ from /ping")]
    InvalidInspectPath(String),

    /// No rule files configured
    #[error("at least one rule file is required")]
    NoRuleFiles,
}
