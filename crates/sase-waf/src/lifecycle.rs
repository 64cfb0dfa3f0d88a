//! Transaction lifecycle
//!
//! [`TransactionScope`] owns one engine transaction for the duration of a
//! request. It drives the engine through its phases in order and finalizes
//! the transaction (audit logging, then close) exactly once when dropped,
//! on every exit path including errors and panics in the handler.
//!
//! ```text
//! Created ──► HeadersSubmitted ──► BodySubmitted ──► Completed
//!    │               │                   │
//!    │               └──► Interrupted ◄──┘
//!    └──► Completed   (rule engine off)
//! ```

use crate::error::PipelineError;
use crate::metadata::InspectionRequest;
use sase_waf_engine::{EngineTransaction, InspectionEngine, Interruption, MatchedRule};
use std::fmt;
use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::Span;

/// Transaction phase
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Transaction created, nothing submitted
    Created,
    /// Connection, URI and headers evaluated
    HeadersSubmitted,
    /// Body appended (or skipped)
    BodySubmitted,
    /// All phases ran without interruption
    Completed,
    /// A phase produced an interruption
    Interrupted,
}

impl Phase {
    /// No further phase calls are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted)
    }

    fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Created, HeadersSubmitted)
                | (Created, Completed)
                | (HeadersSubmitted, BodySubmitted)
                | (HeadersSubmitted, Interrupted)
                | (BodySubmitted, Completed)
                | (BodySubmitted, Interrupted)
        )
    }
}

/// Why the body was not handed to the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodySkip {
    /// Engine policy disables body access
    PolicyDisabled,
    /// Request carries no body
    Absent,
}

impl fmt::Display for BodySkip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyDisabled => f.write_str("RequestBodyAccess disabled"),
            Self::Absent => f.write_str("no body"),
        }
    }
}

/// Body handed to [`TransactionScope::submit_body`]
pub enum BodyInput<'a> {
    /// Buffered body to append
    Buffered(&'a mut dyn Read),
    /// Nothing to append; phase 2 still runs over an empty body
    Skipped(BodySkip),
}

/// Outcome of phase 2
#[derive(Default)]
pub struct BodySubmission {
    /// Interruption raised while appending or evaluating the body
    pub interruption: Option<Interruption>,
    /// Engine's retained copy of what it consumed
    pub retained: Option<Box<dyn Read + Send>>,
}

/// Owned engine transaction with phase tracking
pub struct TransactionScope<T: EngineTransaction> {
    tx: T,
    phase: Phase,
    span: Span,
    finalized: bool,
}

impl<T: EngineTransaction> TransactionScope<T> {
    /// Create a transaction, reusing `id` when the caller supplied one
    pub fn create<E>(engine: &E, id: Option<&str>, parent: &Span) -> Self
    where
        E: InspectionEngine<Transaction = T>,
    {
        let tx = match id {
            Some(id) => engine.new_transaction_with_id(id),
            None => engine.new_transaction(),
        };
        let span = tracing::info_span!(parent: parent, "transaction", tx_id = %tx.id());
        Self {
            tx,
            phase: Phase::Created,
            span,
            finalized: false,
        }
    }

    /// Transaction ID
    pub fn id(&self) -> &str {
        self.tx.id()
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Per-transaction span
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Rules that matched so far
    pub fn matched_rules(&self) -> &[MatchedRule] {
        self.tx.matched_rules()
    }

    /// Whether the engine will evaluate anything for this transaction
    pub fn engine_active(&self) -> bool {
        !self.tx.is_rule_engine_off()
    }

    /// Finish without running any phase (rule engine off)
    pub fn bypass(&mut self) -> Result<(), PipelineError> {
        self.advance(Phase::Completed)
    }

    /// Phase 1: connection, URI and every header value
    pub fn submit_connection_and_headers(
        &mut self,
        request: &InspectionRequest,
    ) -> Result<Option<Interruption>, PipelineError> {
        self.advance(Phase::HeadersSubmitted)?;

        self.tx.process_connection(&request.client_ip, request.client_port, "", 0);
        self.tx
            .process_uri(&request.uri, &request.method, &request.http_version);
        for (name, value) in &request.headers {
            self.tx.add_request_header(name, value);
        }

        let interruption = self.tx.process_request_headers();
        if interruption.is_some() {
            self.advance(Phase::Interrupted)?;
        }
        Ok(interruption)
    }

    /// Reason to skip the body, if any
    pub fn body_skip_reason(&self, body_present: bool) -> Option<BodySkip> {
        if !self.tx.is_request_body_accessible() {
            Some(BodySkip::PolicyDisabled)
        } else if !body_present {
            Some(BodySkip::Absent)
        } else {
            None
        }
    }

    /// Phase 2: append the body (if any) and evaluate it
    ///
    /// An interruption raised while appending ends the phase without
    /// evaluation.
    pub fn submit_body(&mut self, body: BodyInput<'_>) -> Result<BodySubmission, PipelineError> {
        self.advance(Phase::BodySubmitted)?;

        let mut submission = BodySubmission::default();
        match body {
            BodyInput::Skipped(reason) => {
                tracing::info!(parent: &self.span, "not reading body ({})", reason);
            }
            BodyInput::Buffered(reader) => {
                let (interruption, read) = self.tx.read_request_body_from(reader).map_err(|e| {
                    tracing::error!(parent: &self.span, error = %e, "failed to append request body");
                    PipelineError::BodyAppend(e)
                })?;
                tracing::debug!(parent: &self.span, bytes = read, "request body appended");

                if interruption.is_some() {
                    self.advance(Phase::Interrupted)?;
                    submission.interruption = interruption;
                    return Ok(submission);
                }

                let retained = self.tx.request_body_reader().map_err(|e| {
                    tracing::error!(parent: &self.span, error = %e, "failed to get the request body");
                    PipelineError::BodyReplay(e)
                })?;
                submission.retained = Some(retained);
            }
        }

        let interruption = self.tx.process_request_body().map_err(|e| {
            tracing::error!(parent: &self.span, error = %e, "failed to process request body");
            PipelineError::BodyProcess(e)
        })?;
        self.advance(if interruption.is_some() {
            Phase::Interrupted
        } else {
            Phase::Completed
        })?;
        submission.interruption = interruption;
        Ok(submission)
    }

    /// Finalize now instead of at scope exit
    pub fn finalize(self) {}

    fn advance(&mut self, next: Phase) -> Result<(), PipelineError> {
        if !self.phase.can_advance_to(next) {
            return Err(PipelineError::PhaseOrder {
                current: self.phase,
                attempted: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    fn run_finalizers(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        let tx = &mut self.tx;
        if catch_unwind(AssertUnwindSafe(|| tx.process_logging())).is_err() {
            tracing::error!(parent: &self.span, "transaction logging panicked");
        }
        if let Err(e) = self.tx.close() {
            tracing::error!(parent: &self.span, error = %e, "failed to close transaction");
        }
    }
}

impl<T: EngineTransaction> Drop for TransactionScope<T> {
    fn drop(&mut self) {
        self.run_finalizers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Script, ScriptedEngine};
    use std::io::Cursor;

    fn request() -> InspectionRequest {
        InspectionRequest {
            tx_id: None,
            client_ip: "198.51.100.4".into(),
            client_port: 42000,
            method: "POST".into(),
            uri: "/upload".into(),
            http_version: "HTTP/1.1".into(),
            headers: vec![
                ("accept".into(), "a".into()),
                ("accept".into(), "b".into()),
            ],
        }
    }

    #[test]
    fn test_phase_transitions() {
        use Phase::*;
        assert!(Created.can_advance_to(HeadersSubmitted));
        assert!(Created.can_advance_to(Completed));
        assert!(!Created.can_advance_to(BodySubmitted));
        assert!(!HeadersSubmitted.can_advance_to(Completed));
        assert!(!Completed.can_advance_to(HeadersSubmitted));
        assert!(!Interrupted.can_advance_to(BodySubmitted));
        assert!(Completed.is_terminal() && Interrupted.is_terminal());
    }

    #[test]
    fn test_full_lifecycle_call_order() {
        let engine = ScriptedEngine::new(Script::default());
        {
            let mut scope = TransactionScope::create(&engine, Some("tx-1"), &Span::none());
            assert_eq!(scope.id(), "tx-1");
            assert_eq!(scope.submit_connection_and_headers(&request()).unwrap(), None);

            let mut body = Cursor::new(b"hello".to_vec());
            let submission = scope.submit_body(BodyInput::Buffered(&mut body)).unwrap();
            assert!(submission.interruption.is_none());
            assert!(submission.retained.is_some());
            assert_eq!(scope.phase(), Phase::Completed);
        }

        assert_eq!(
            engine.calls(),
            vec![
                Call::Connection("198.51.100.4".into(), 42000),
                Call::Uri("/upload".into(), "POST".into(), "HTTP/1.1".into()),
                Call::Header("accept".into(), "a".into()),
                Call::Header("accept".into(), "b".into()),
                Call::ProcessHeaders,
                Call::ReadBody(5),
                Call::BodyReader,
                Call::ProcessBody,
                Call::Logging,
                Call::Close,
            ]
        );
    }

    #[test]
    fn test_header_interruption_stops_phases() {
        let engine = ScriptedEngine::new(Script {
            header_interruption: Some(Interruption::new(942100, "block", 403)),
            ..Script::default()
        });
        let mut scope = TransactionScope::create(&engine, None, &Span::none());
        let it = scope.submit_connection_and_headers(&request()).unwrap();
        assert_eq!(it.map(|i| i.rule_id), Some(942100));
        assert_eq!(scope.phase(), Phase::Interrupted);

        let err = scope.submit_body(BodyInput::Skipped(BodySkip::Absent));
        assert!(matches!(err, Err(PipelineError::PhaseOrder { .. })));
        scope.finalize();

        assert!(!engine.calls().contains(&Call::ProcessBody));
        assert_eq!(engine.count(&Call::Close), 1);
    }

    #[test]
    fn test_skipped_body_still_runs_phase_two() {
        let engine = ScriptedEngine::new(Script::default());
        let mut scope = TransactionScope::create(&engine, None, &Span::none());
        scope.submit_connection_and_headers(&request()).unwrap();
        let submission = scope.submit_body(BodyInput::Skipped(BodySkip::Absent)).unwrap();
        assert!(submission.retained.is_none());
        assert_eq!(scope.phase(), Phase::Completed);
        drop(scope);

        let calls = engine.calls();
        assert!(calls.contains(&Call::ProcessBody));
        assert!(!calls.iter().any(|c| matches!(c, Call::ReadBody(_))));
    }

    #[test]
    fn test_append_interruption_skips_evaluation() {
        let engine = ScriptedEngine::new(Script {
            append_interruption: Some(Interruption::new(0, "deny", 413)),
            ..Script::default()
        });
        let mut scope = TransactionScope::create(&engine, None, &Span::none());
        scope.submit_connection_and_headers(&request()).unwrap();
        let mut body = Cursor::new(vec![0u8; 16]);
        let submission = scope.submit_body(BodyInput::Buffered(&mut body)).unwrap();
        assert_eq!(submission.interruption.map(|i| i.status), Some(413));
        assert_eq!(scope.phase(), Phase::Interrupted);
        drop(scope);

        assert!(!engine.calls().contains(&Call::ProcessBody));
    }

    #[test]
    fn test_engine_errors_still_finalize_once() {
        let engine = ScriptedEngine::new(Script {
            append_error: true,
            ..Script::default()
        });
        {
            let mut scope = TransactionScope::create(&engine, None, &Span::none());
            scope.submit_connection_and_headers(&request()).unwrap();
            let mut body = Cursor::new(b"x".to_vec());
            let result = scope.submit_body(BodyInput::Buffered(&mut body));
            assert!(matches!(result, Err(PipelineError::BodyAppend(_))));
        }
        assert_eq!(engine.count(&Call::Logging), 1);
        assert_eq!(engine.count(&Call::Close), 1);
    }

    #[test]
    fn test_close_runs_after_logging_panic() {
        let engine = ScriptedEngine::new(Script {
            panic_in_logging: true,
            close_error: true,
            ..Script::default()
        });
        let scope = TransactionScope::create(&engine, None, &Span::none());
        scope.finalize();
        assert_eq!(engine.count(&Call::Close), 1);
    }

    #[test]
    fn test_bypass_makes_no_phase_calls() {
        let engine = ScriptedEngine::new(Script {
            engine_off: true,
            ..Script::default()
        });
        let mut scope = TransactionScope::create(&engine, None, &Span::none());
        assert!(!scope.engine_active());
        scope.bypass().unwrap();
        assert!(scope.submit_connection_and_headers(&request()).is_err());
        drop(scope);

        assert_eq!(engine.calls(), vec![Call::Logging, Call::Close]);
    }

    #[test]
    fn test_body_skip_reasons() {
        let engine = ScriptedEngine::new(Script {
            body_access: false,
            ..Script::default()
        });
        let scope = TransactionScope::create(&engine, None, &Span::none());
        assert_eq!(scope.body_skip_reason(true), Some(BodySkip::PolicyDisabled));
        assert_eq!(BodySkip::PolicyDisabled.to_string(), "RequestBodyAccess disabled");

        let engine = ScriptedEngine::new(Script::default());
        let scope = TransactionScope::create(&engine, None, &Span::none());
        assert_eq!(scope.body_skip_reason(false), Some(BodySkip::Absent));
        assert_eq!(scope.body_skip_reason(true), None);
        assert_eq!(BodySkip::Absent.to_string(), "no body");
    }
}
