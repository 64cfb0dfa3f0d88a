//! OpenSASE WAF Adapter
//!
//! HTTP front end for a WAF engine. Each inbound request is described to
//! the engine (connection, URI, headers, body), the engine's interruption
//! is turned into a `{"deny": bool, "msg": string}` verdict, and the body
//! is replayed intact for whatever sits downstream.
//!
//! - [`metadata`]: where request metadata comes from
//! - [`lifecycle`]: phase ordering and guaranteed finalization
//! - [`relay`]: body buffering and replay
//! - [`reporter`]: interruption to verdict mapping
//! - [`pipeline`]: one inspection per request

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metadata;
pub mod middleware;
pub mod pipeline;
pub mod relay;
pub mod reporter;

#[cfg(test)]
mod testing;

pub use config::{AdapterConfig, Args, InspectRoute};
pub use error::{ConfigError, PipelineError};
pub use pipeline::{Inspection, InspectionPipeline};
pub use reporter::Verdict;

use axum::{
    middleware::from_fn,
    routing::{any, get},
    Extension, Router,
};
use metadata::MetadataStrategy;
use sase_waf_engine::InspectionEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tracing::Span;

/// Application state shared across handlers
pub struct AppState<E: InspectionEngine> {
    /// Inspection pipeline
    pub pipeline: InspectionPipeline<E>,
    /// Inspection route
    pub inspect_route: InspectRoute,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl<E: InspectionEngine> AppState<E> {
    /// Build state from configuration
    pub fn new(engine: Arc<E>, config: &AdapterConfig, span: Span) -> Result<Self, ConfigError> {
        let strategy = MetadataStrategy::new(config.metadata_mode, config.header_convention);
        Ok(Self {
            pipeline: InspectionPipeline::new(engine, strategy, span),
            inspect_route: config.inspect_route()?,
            request_timeout: config.request_timeout(),
        })
    }
}

/// Build the API router
pub fn build_router<E: InspectionEngine>(state: Arc<AppState<E>>) -> Router {
    let router = Router::new().route("/ping", get(handlers::ping));

    let router = match &state.inspect_route {
        InspectRoute::Path(path) => router
            .route(path, any(handlers::inspect::<E>))
            .fallback(handlers::not_found),
        InspectRoute::Fallback => router.fallback(handlers::inspect::<E>),
    };

    router.layer(
        ServiceBuilder::new()
            .layer(from_fn(middleware::logging))
            .layer(TimeoutLayer::new(state.request_timeout))
            .layer(Extension(state)),
    )
}

/// Start the WAF API server
pub async fn serve<E: InspectionEngine>(config: &AdapterConfig, engine: Arc<E>) -> anyhow::Result<()> {
    let span = tracing::info_span!("waf");
    let state = Arc::new(AppState::new(engine, config, span)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!("WAF API is ready to handle requests on {}", config.listen_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("WAF API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
