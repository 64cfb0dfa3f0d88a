//! Signature Engine
//!
//! Bundled [`InspectionEngine`] that evaluates compiled YAML signatures
//! against the request variables collected by each transaction.

use crate::contract::{EngineTransaction, InspectionEngine};
use crate::loader::WafConfig;
use crate::rules::{RuleAction, Ruleset, Target};
use crate::types::{BodyLimitAction, Interruption, MatchedRule, RuleEngineMode};
use crate::{EngineError, Result};
use serde::Serialize;
use std::borrow::Cow;
use std::io::{Cursor, Read};
use std::sync::Arc;

/// Rule ID reported for body-limit interruptions
pub const BODY_LIMIT_RULE_ID: u32 = 0;

/// Signature engine
///
/// Cheap to share: the compiled rule set sits behind an `Arc` and every
/// transaction holds its own clone of it.
#[derive(Clone, Debug)]
pub struct SignatureEngine {
    ruleset: Arc<Ruleset>,
}

impl SignatureEngine {
    /// Create engine from a compiled rule set
    pub fn new(ruleset: Ruleset) -> Self {
        Self {
            ruleset: Arc::new(ruleset),
        }
    }

    /// Load every configured source and compile it
    pub fn from_config(config: &WafConfig) -> Result<Self> {
        Ok(Self::new(config.build()?))
    }

    /// Compile a single inline YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_config(&WafConfig::new().with_directives(yaml))
    }

    /// Loaded rule set
    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }
}

impl InspectionEngine for SignatureEngine {
    type Transaction = SignatureTransaction;

    fn new_transaction(&self) -> SignatureTransaction {
        self.new_transaction_with_id(&uuid::Uuid::new_v4().to_string())
    }

    fn new_transaction_with_id(&self, id: &str) -> SignatureTransaction {
        SignatureTransaction::new(id, Arc::clone(&self.ruleset))
    }
}

/// Audit record emitted by [`SignatureTransaction::process_logging`]
#[derive(Serialize)]
struct AuditRecord<'a> {
    transaction_id: &'a str,
    client_ip: &'a str,
    client_port: u16,
    method: &'a str,
    uri: &'a str,
    protocol: &'a str,
    matched_rules: &'a [MatchedRule],
    interruption: Option<&'a Interruption>,
}

/// Per-request state of the signature engine
#[derive(Debug)]
pub struct SignatureTransaction {
    id: String,
    ruleset: Arc<Ruleset>,

    client_ip: String,
    client_port: u16,
    server_ip: String,
    server_port: u16,

    method: String,
    uri: String,
    protocol: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,

    matched: Vec<MatchedRule>,
    interruption: Option<Interruption>,
    logged: bool,
    closed: bool,
}

impl SignatureTransaction {
    fn new(id: &str, ruleset: Arc<Ruleset>) -> Self {
        Self {
            id: id.to_string(),
            ruleset,
            client_ip: String::new(),
            client_port: 0,
            server_ip: String::new(),
            server_port: 0,
            method: String::new(),
            uri: String::new(),
            protocol: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
            matched: Vec::new(),
            interruption: None,
            logged: false,
            closed: false,
        }
    }

    fn mode(&self) -> RuleEngineMode {
        self.ruleset.settings.rule_engine
    }

    /// Request headers recorded so far
    pub fn request_headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Server address recorded by `process_connection`
    pub fn server_addr(&self) -> (&str, u16) {
        (&self.server_ip, self.server_port)
    }

    /// Variable values for a target, as (name, value) pairs
    fn values(&self, target: Target) -> Vec<(String, Cow<'_, str>)> {
        let scalar = |v: &str| vec![(target.name().to_string(), Cow::Owned(v.to_string()))];

        match target {
            Target::RemoteAddr => scalar(&self.client_ip),
            Target::RequestMethod => scalar(&self.method),
            Target::RequestUri => scalar(&self.uri),
            Target::RequestProtocol => scalar(&self.protocol),
            Target::RequestHeaders => self
                .headers
                .iter()
                .map(|(n, v)| (format!("{}:{}", target.name(), n), Cow::Borrowed(v.as_str())))
                .collect(),
            Target::RequestHeadersNames => self
                .headers
                .iter()
                .map(|(n, _)| (format!("{}:{}", target.name(), n), Cow::Borrowed(n.as_str())))
                .collect(),
            Target::RequestBody => vec![(target.name().to_string(), String::from_utf8_lossy(&self.body))],
        }
    }

    /// Run every rule of `phase`; first disruptive match in `On` mode interrupts
    fn evaluate(&mut self, phase: u8) -> Option<Interruption> {
        if self.interruption.is_some() {
            return self.interruption.clone();
        }
        if self.mode() == RuleEngineMode::Off {
            return None;
        }

        let ruleset = Arc::clone(&self.ruleset);
        for rule in ruleset.phase(phase) {
            let hit = rule.targets.iter().find_map(|target| {
                self.values(*target)
                    .into_iter()
                    .find_map(|(name, value)| rule.evaluate(&name, &value))
            });
            let Some(data) = hit else { continue };

            tracing::debug!(tx_id = %self.id, rule_id = rule.id, phase, "rule matched");
            self.matched.push(MatchedRule {
                rule_id: rule.id,
                phase,
                msg: rule.msg.clone(),
                data,
                severity: rule.severity,
                action: rule.action,
                tx_id: self.id.clone(),
                uri: self.uri.clone(),
                client_ip: self.client_ip.clone(),
            });

            if rule.action.is_disruptive() && self.mode() == RuleEngineMode::On {
                let mut it = Interruption::new(rule.id, rule.action.as_str(), rule.status);
                if rule.action == RuleAction::Redirect {
                    it.data = rule.redirect_to.clone().unwrap_or_default();
                }
                self.interruption = Some(it);
                return self.interruption.clone();
            }
        }
        None
    }
}

impl EngineTransaction for SignatureTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_rule_engine_off(&self) -> bool {
        self.mode() == RuleEngineMode::Off
    }

    fn process_connection(&mut self, client_ip: &str, client_port: u16, server_ip: &str, server_port: u16) {
        self.client_ip = client_ip.to_string();
        self.client_port = client_port;
        self.server_ip = server_ip.to_string();
        self.server_port = server_port;
    }

    fn process_uri(&mut self, uri: &str, method: &str, version: &str) {
        self.uri = uri.to_string();
        self.method = method.to_string();
        self.protocol = version.to_string();
    }

    fn add_request_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_lowercase(), value.to_string()));
    }

    fn process_request_headers(&mut self) -> Option<Interruption> {
        if self.closed {
            tracing::warn!(tx_id = %self.id, "phase 1 on closed transaction ignored");
            return None;
        }
        self.evaluate(1)
    }

    fn is_request_body_accessible(&self) -> bool {
        self.ruleset.settings.request_body_access
    }

    fn read_request_body_from(&mut self, reader: &mut dyn Read) -> Result<(Option<Interruption>, usize)> {
        if self.closed {
            return Err(EngineError::TransactionClosed(self.id.clone()));
        }

        let settings = &self.ruleset.settings;
        let limit = settings.request_body_limit;
        let limit_action = settings.request_body_limit_action;
        let remaining = limit.saturating_sub(self.body.len());

        // Reject reads one byte past the limit to detect overflow
        let budget = match limit_action {
            BodyLimitAction::Reject => remaining.saturating_add(1),
            BodyLimitAction::ProcessPartial => remaining,
        };

        let mut chunk = Vec::new();
        let read = (&mut *reader).take(budget as u64).read_to_end(&mut chunk)?;
        self.body.extend_from_slice(&chunk);

        if limit_action == BodyLimitAction::Reject && self.body.len() > limit {
            tracing::warn!(tx_id = %self.id, limit, "request body exceeds limit");
            if self.mode() == RuleEngineMode::On {
                let it = Interruption::new(BODY_LIMIT_RULE_ID, RuleAction::Deny.as_str(), 413);
                self.interruption = Some(it.clone());
                return Ok((Some(it), read));
            }
        }

        Ok((None, read))
    }

    fn request_body_reader(&self) -> Result<Box<dyn Read + Send>> {
        if self.closed {
            return Err(EngineError::TransactionClosed(self.id.clone()));
        }
        Ok(Box::new(Cursor::new(self.body.clone())))
    }

    fn process_request_body(&mut self) -> Result<Option<Interruption>> {
        if self.closed {
            return Err(EngineError::TransactionClosed(self.id.clone()));
        }
        Ok(self.evaluate(2))
    }

    fn matched_rules(&self) -> &[MatchedRule] {
        &self.matched
    }

    fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    fn process_logging(&mut self) {
        if self.logged {
            return;
        }
        self.logged = true;

        if self.matched.is_empty() {
            return;
        }
        if !self.ruleset.settings.audit_log {
            tracing::debug!(tx_id = %self.id, matches = self.matched.len(), "transaction matched rules");
            return;
        }

        let record = AuditRecord {
            transaction_id: &self.id,
            client_ip: &self.client_ip,
            client_port: self.client_port,
            method: &self.method,
            uri: &self.uri,
            protocol: &self.protocol,
            matched_rules: &self.matched,
            interruption: self.interruption.as_ref(),
        };
        match serde_json::to_string(&record) {
            Ok(line) => tracing::info!(target: "sase_waf_engine::audit", "{}", line),
            Err(e) => tracing::error!(tx_id = %self.id, error = %e, "failed to encode audit record"),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(EngineError::TransactionClosed(self.id.clone()));
        }
        self.closed = true;
        self.headers = Vec::new();
        self.body = Vec::new();
        Ok(())
    }
}
