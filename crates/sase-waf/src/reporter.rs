//! Interruption reporting
//!
//! Turns an engine interruption into the JSON verdict returned to the
//! caller. The action set is closed; an action outside it is treated as a
//! deny and logged as an error.

use sase_waf_engine::{Interruption, MatchedRule};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::Span;

/// Response body for inspection requests
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the request should be denied
    pub deny: bool,
    /// Human-readable reason
    pub msg: String,
}

impl Verdict {
    /// No rule interrupted the request
    pub fn pass() -> Self {
        Self {
            deny: false,
            msg: "pass".to_string(),
        }
    }

    /// Rule engine is off; nothing was evaluated
    pub fn engine_off() -> Self {
        Self {
            deny: false,
            msg: "rule engine is set to off".to_string(),
        }
    }
}

/// Disruptive action reported by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Block the request
    Block,
    /// Deny the request
    Deny,
    /// Drop the connection
    Drop,
    /// Redirect the client elsewhere
    Redirect,
    /// Reject the request
    Reject,
    /// Allow the request, skipping further rules
    Allow,
}

/// Action name outside the known set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "deny" => Ok(Self::Deny),
            "drop" => Ok(Self::Drop),
            "redirect" => Ok(Self::Redirect),
            "reject" => Ok(Self::Reject),
            "allow" => Ok(Self::Allow),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

impl Action {
    /// Lowercase action name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Deny => "deny",
            Self::Drop => "drop",
            Self::Redirect => "redirect",
            Self::Reject => "reject",
            Self::Allow => "allow",
        }
    }

    /// Whether the caller should refuse the request
    pub fn denies(&self) -> bool {
        !matches!(self, Self::Allow)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps interruptions to verdicts and logs them
#[derive(Clone, Debug)]
pub struct InterruptionReporter {
    span: Span,
}

impl InterruptionReporter {
    /// Reporter logging under `span`
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    /// Log matched rule messages, then the decision, and build the verdict
    pub fn report(&self, tx_id: &str, interruption: &Interruption, matched: &[MatchedRule]) -> Verdict {
        for rule in matched.iter().filter(|r| !r.message().is_empty()) {
            tracing::warn!(
                parent: &self.span,
                tx_id,
                rule_id = rule.rule_id,
                severity = %rule.severity,
                "{}",
                rule.audit_log()
            );
        }

        let rule_id = interruption.rule_id;
        match interruption.action.parse::<Action>() {
            Ok(action) => {
                let msg = format!("{} action from rule ID {}", action, rule_id);
                if action.denies() {
                    tracing::warn!(parent: &self.span, tx_id, status = interruption.status, "{}", msg);
                } else {
                    tracing::info!(parent: &self.span, tx_id, "{}", msg);
                }
                Verdict {
                    deny: action.denies(),
                    msg,
                }
            }
            Err(UnknownAction(name)) => {
                tracing::error!(
                    parent: &self.span,
                    tx_id,
                    rule_id,
                    "unknown {} action from rule ID {}",
                    name,
                    rule_id
                );
                Verdict {
                    deny: true,
                    msg: format!("unknown {} action from rule ID {}", name, rule_id),
                }
            }
        }
    }
}
