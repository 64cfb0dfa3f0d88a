//! Inspection pipeline
//!
//! One call per inbound request: extract metadata, open a transaction,
//! run phase 1 and phase 2, and report the outcome. The transaction is
//! finalized when its scope ends, whichever way the call returns.

use crate::error::PipelineError;
use crate::lifecycle::{BodyInput, TransactionScope};
use crate::metadata::MetadataStrategy;
use crate::relay;
use crate::reporter::{InterruptionReporter, Verdict};
use axum::body::Body;
use axum::http::Request;
use http_body::Body as _;
use sase_waf_engine::InspectionEngine;
use std::sync::Arc;
use tracing::Span;

/// Result of inspecting one request
pub struct Inspection {
    /// Verdict for the caller
    pub verdict: Verdict,
    /// The request with its body replayed for downstream use
    pub request: Request<Body>,
}

/// Drives one engine through the phases for each request
pub struct InspectionPipeline<E: InspectionEngine> {
    engine: Arc<E>,
    strategy: MetadataStrategy,
    reporter: InterruptionReporter,
    span: Span,
}

impl<E: InspectionEngine> InspectionPipeline<E> {
    /// Pipeline over `engine`, logging under `span`
    pub fn new(engine: Arc<E>, strategy: MetadataStrategy, span: Span) -> Self {
        Self {
            engine,
            strategy,
            reporter: InterruptionReporter::new(span.clone()),
            span,
        }
    }

    /// Metadata strategy in use
    pub fn strategy(&self) -> MetadataStrategy {
        self.strategy
    }

    /// Inspect one request
    pub async fn inspect(&self, request: Request<Body>) -> Result<Inspection, PipelineError> {
        let (parts, body) = request.into_parts();
        let meta = self.strategy.extract(&parts);

        let mut scope = TransactionScope::create(&*self.engine, meta.tx_id.as_deref(), &self.span);
        tracing::info!(
            parent: scope.span(),
            client_ip = %meta.client_ip,
            method = %meta.method,
            uri = %meta.uri,
            version = %meta.http_version,
            "processing request"
        );

        if !scope.engine_active() {
            scope.bypass()?;
            tracing::info!(parent: scope.span(), "rule engine is set to off");
            return Ok(Inspection {
                verdict: Verdict::engine_off(),
                request: Request::from_parts(parts, body),
            });
        }

        tracing::info!(parent: scope.span(), "processing phase 1");
        if let Some(interruption) = scope.submit_connection_and_headers(&meta)? {
            let verdict = self
                .reporter
                .report(scope.id(), &interruption, scope.matched_rules());
            return Ok(Inspection {
                verdict,
                request: Request::from_parts(parts, body),
            });
        }

        tracing::info!(parent: scope.span(), "processing phase 2");
        let (interruption, body) = match scope.body_skip_reason(!body.is_end_stream()) {
            Some(reason) => {
                let submission = scope.submit_body(BodyInput::Skipped(reason))?;
                (submission.interruption, body)
            }
            None => {
                let buffered = relay::prepare(body).await.map_err(|e| {
                    tracing::error!(parent: scope.span(), error = %e, "error while reading body");
                    PipelineError::BodyRead(e)
                })?;
                tracing::debug!(parent: scope.span(), bytes = buffered.bytes().len(), "request body buffered");

                let mut reader = buffered.reader();
                let submission = scope.submit_body(BodyInput::Buffered(&mut reader))?;
                let consumed = usize::try_from(reader.position()).unwrap_or(usize::MAX);
                let replay = buffered.into_replay(submission.retained, consumed);
                (submission.interruption, Body::new(replay))
            }
        };

        let verdict = match interruption {
            Some(interruption) => self
                .reporter
                .report(scope.id(), &interruption, scope.matched_rules()),
            None => Verdict::pass(),
        };
        Ok(Inspection {
            verdict,
            request: Request::from_parts(parts, body),
        })
    }
}
