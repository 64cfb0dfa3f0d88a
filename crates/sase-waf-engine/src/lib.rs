//! OpenSASE WAF Inspection Engine
//!
//! Phase-driven HTTP request inspection. A transaction is fed connection
//! metadata, the request line and headers (phase 1), then the request body
//! (phase 2). Any rule carrying a disruptive action raises an
//! [`Interruption`] that halts the remaining phases.
//!
//! ## Layout
//!
//! - **Contract**: [`InspectionEngine`] / [`EngineTransaction`], the surface the
//!   adapter drives. Any engine that implements it can be plugged in.
//! - **Rules**: YAML rule files with engine settings and signatures
//! - **Loader**: ordered rule-file globs resolved once at startup
//! - **Engine**: [`SignatureEngine`], the bundled implementation
//!
//! ## Example
//!
//! ```
//! use sase_waf_engine::{EngineTransaction, InspectionEngine, SignatureEngine};
//!
//! let engine = SignatureEngine::from_yaml(r#"
//! engine:
//!   rule_engine: on
//! rules:
//!   - id: 1001
//!     phase: 1
//!     targets: [request_uri]
//!     operator: { contains: "/admin" }
//!     action: deny
//!     msg: "admin area"
//! "#).unwrap();
//!
//! let mut tx = engine.new_transaction_with_id("tx-1");
//! tx.process_connection("10.0.0.1", 42000, "", 0);
//! tx.process_uri("/admin/users", "GET", "HTTP/1.1");
//! let it = tx.process_request_headers().expect("interruption");
//! assert_eq!(it.action, "deny");
//! assert_eq!(it.rule_id, 1001);
//! ```

#![warn(missing_docs)]

pub mod contract;
pub mod engine;
pub mod loader;
pub mod rules;
pub mod types;

pub use contract::{EngineTransaction, InspectionEngine};
pub use engine::{SignatureEngine, SignatureTransaction};
pub use loader::WafConfig;
pub use rules::{RuleAction, RuleDef, Ruleset};
pub use types::{BodyLimitAction, EngineSettings, Interruption, MatchedRule, RuleEngineMode, Severity};

use thiserror::Error;

/// Inspection engine errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// Rule file could not be read
    #[error("failed to read rule file {path}: {source}")]
    RuleFile {
        /// Offending path
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Literal rule file path does not exist
    #[error("rule file not found: {0}")]
    RuleFileNotFound(String),

    /// Glob pattern is malformed
    #[error("invalid rule file pattern {pattern}: {reason}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Parser message
        reason: String,
    },

    /// Rule file is not valid YAML or does not match the schema
    #[error("failed to parse {path}: {reason}")]
    Parse {
        /// Offending path (or `<inline>`)
        path: String,
        /// Parser message
        reason: String,
    },

    /// Rule definition is semantically invalid
    #[error("invalid rule {id}: {reason}")]
    InvalidRule {
        /// Rule ID
        id: u32,
        /// Why the rule was rejected
        reason: String,
    },

    /// Two rules share an ID
    #[error("duplicate rule id {0}")]
    DuplicateRule(u32),

    /// Reading the request body failed
    #[error("failed to read request body: {0}")]
    BodyRead(#[from] std::io::Error),

    /// Transaction was already closed
    #[error("transaction {0} is closed")]
    TransactionClosed(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
