//! Engine data types shared with the adapter

use crate::rules::RuleAction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default request body limit (128 KiB)
pub const DEFAULT_BODY_LIMIT: usize = 131_072;

/// Disruptive verdict raised by a rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Interruption {
    /// ID of the rule that raised the interruption
    pub rule_id: u32,

    /// Disruptive action name (`block`, `deny`, `drop`, `redirect`, `reject`, `allow`)
    pub action: String,

    /// Suggested HTTP status
    pub status: u16,

    /// Free-form action data (redirect target, etc.)
    pub data: String,
}

impl Interruption {
    /// Create interruption for an action
    pub fn new(rule_id: u32, action: impl Into<String>, status: u16) -> Self {
        Self {
            rule_id,
            action: action.into(),
            status,
            data: String::new(),
        }
    }
}

/// Rule severity levels
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Debug-level finding
    Debug,
    /// Informational finding
    #[default]
    Info,
    /// Notice
    Notice,
    /// Warning
    Warning,
    /// Error
    Error,
    /// Critical
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Record of a single rule match inside a transaction
#[derive(Clone, Debug, Serialize)]
pub struct MatchedRule {
    /// Rule ID
    pub rule_id: u32,

    /// Phase the rule matched in
    pub phase: u8,

    /// Rule message (may be empty)
    pub msg: String,

    /// Matched variable and value excerpt
    pub data: String,

    /// Rule severity
    pub severity: Severity,

    /// Rule action
    pub action: RuleAction,

    /// Owning transaction
    pub tx_id: String,

    /// Request URI at match time
    pub uri: String,

    /// Client address at match time
    pub client_ip: String,
}

impl MatchedRule {
    /// Rule message
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Whether the rule's action is disruptive
    pub fn disruptive(&self) -> bool {
        self.action.is_disruptive()
    }

    /// Single-line audit representation
    pub fn audit_log(&self) -> String {
        format!(
            "[client {}] WAF: {} matched [id \"{}\"] [msg \"{}\"] [data \"{}\"] [severity \"{}\"] [phase \"{}\"] [uri \"{}\"] [unique_id \"{}\"]",
            self.client_ip,
            if self.disruptive() { "Access denied" } else { "Warning" },
            self.rule_id,
            self.msg,
            self.data,
            self.severity,
            self.phase,
            self.uri,
            self.tx_id,
        )
    }
}

/// Rule engine operating mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEngineMode {
    /// Evaluate rules and enforce disruptive actions
    #[default]
    On,
    /// Skip evaluation entirely
    Off,
    /// Evaluate and record matches, never interrupt
    DetectionOnly,
}

/// What to do when a body exceeds the configured limit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyLimitAction {
    /// Raise a 413 interruption
    #[default]
    Reject,
    /// Inspect the first `limit` bytes only
    ProcessPartial,
}

/// Effective engine settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    /// Operating mode
    pub rule_engine: RuleEngineMode,
    /// Whether phase 2 may buffer the body
    pub request_body_access: bool,
    /// Maximum buffered body size in bytes
    pub request_body_limit: usize,
    /// Over-limit behavior
    pub request_body_limit_action: BodyLimitAction,
    /// Emit an audit record per transaction with matches
    pub audit_log: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rule_engine: RuleEngineMode::On,
            request_body_access: true,
            request_body_limit: DEFAULT_BODY_LIMIT,
            request_body_limit_action: BodyLimitAction::Reject,
            audit_log: false,
        }
    }
}

/// Partial settings block from a single rule file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    /// Operating mode
    pub rule_engine: Option<RuleEngineMode>,
    /// Body access
    pub request_body_access: Option<bool>,
    /// Body limit
    pub request_body_limit: Option<usize>,
    /// Over-limit behavior
    pub request_body_limit_action: Option<BodyLimitAction>,
    /// Audit records
    pub audit_log: Option<bool>,
}

impl EngineSettings {
    /// Overlay a later file's settings on top of these
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(mode) = patch.rule_engine {
            self.rule_engine = mode;
        }
        if let Some(access) = patch.request_body_access {
            self.request_body_access = access;
        }
        if let Some(limit) = patch.request_body_limit {
            self.request_body_limit = limit;
        }
        if let Some(action) = patch.request_body_limit_action {
            self.request_body_limit_action = action;
        }
        if let Some(audit) = patch.audit_log {
            self.audit_log = audit;
        }
    }
}
