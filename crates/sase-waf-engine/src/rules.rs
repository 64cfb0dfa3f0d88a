//! Rule definitions and compilation
//!
//! Rules are declared in YAML and compiled once into a [`Ruleset`]
//! that every transaction shares.

use crate::types::{EngineSettings, Severity};
use crate::{EngineError, Result};
use aho_corasick::AhoCorasick;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;

/// Maximum length of the matched-value excerpt kept in match records
const EXCERPT_LEN: usize = 64;

/// Rule action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Block the request
    Block,
    /// Deny the request
    Deny,
    /// Drop the connection
    Drop,
    /// Redirect the client
    Redirect,
    /// Reject the request
    Reject,
    /// Allow the request and stop evaluating
    Allow,
    /// Record the match and continue
    Pass,
}

impl RuleAction {
    /// Action name as reported in interruptions
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Deny => "deny",
            Self::Drop => "drop",
            Self::Redirect => "redirect",
            Self::Reject => "reject",
            Self::Allow => "allow",
            Self::Pass => "pass",
        }
    }

    /// Everything except `pass` halts evaluation
    pub fn is_disruptive(&self) -> bool {
        !matches!(self, Self::Pass)
    }

    fn default_status(&self) -> u16 {
        match self {
            Self::Redirect => 302,
            Self::Allow | Self::Pass => 200,
            _ => 403,
        }
    }
}

/// Request variable a rule inspects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Client address
    RemoteAddr,
    /// HTTP method
    RequestMethod,
    /// Request URI including query string
    RequestUri,
    /// Protocol version
    RequestProtocol,
    /// Every header value
    RequestHeaders,
    /// Every header name
    RequestHeadersNames,
    /// Buffered request body
    RequestBody,
}

impl Target {
    /// Upper-case variable name used in match data
    pub fn name(&self) -> &'static str {
        match self {
            Self::RemoteAddr => "REMOTE_ADDR",
            Self::RequestMethod => "REQUEST_METHOD",
            Self::RequestUri => "REQUEST_URI",
            Self::RequestProtocol => "REQUEST_PROTOCOL",
            Self::RequestHeaders => "REQUEST_HEADERS",
            Self::RequestHeadersNames => "REQUEST_HEADERS_NAMES",
            Self::RequestBody => "REQUEST_BODY",
        }
    }
}

/// Operator as written in a rule file
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorDef {
    /// Regular expression
    Rx(String),
    /// Substring
    Contains(String),
    /// Case-insensitive phrase list
    Pm(Vec<String>),
    /// Exact string
    Streq(String),
}

/// Value transformation applied before matching
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    /// ASCII lowercase
    Lowercase,
    /// Percent-decoding (`+` is left as is)
    UrlDecode,
    /// Strip surrounding whitespace
    Trim,
    /// Collapse whitespace runs to a single space
    CompressWhitespace,
}

impl Transform {
    fn apply<'a>(&self, value: Cow<'a, str>) -> Cow<'a, str> {
        match self {
            Self::Lowercase => Cow::Owned(value.to_lowercase()),
            Self::UrlDecode => {
                let decoded = urlencoding::decode_binary(value.as_bytes());
                Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
            }
            Self::Trim => Cow::Owned(value.trim().to_string()),
            Self::CompressWhitespace => {
                Cow::Owned(value.split_whitespace().collect::<Vec<_>>().join(" "))
            }
        }
    }
}

/// Rule as written in a rule file
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
    /// Unique rule ID (non-zero)
    pub id: u32,
    /// 1 = headers, 2 = body
    pub phase: u8,
    /// Variables to inspect
    pub targets: Vec<Target>,
    /// Match operator, written as a single-key map (`{ rx: "..." }`)
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub operator: OperatorDef,
    /// Invert the operator result
    #[serde(default)]
    pub negate: bool,
    /// Transformations applied in order
    #[serde(default)]
    pub transforms: Vec<Transform>,
    /// Action on match
    pub action: RuleAction,
    /// Message
    #[serde(default)]
    pub msg: String,
    /// Severity
    #[serde(default)]
    pub severity: Severity,
    /// Status override
    #[serde(default)]
    pub status: Option<u16>,
    /// Redirect target
    #[serde(default)]
    pub redirect_to: Option<String>,
}

/// Compiled operator
#[derive(Debug)]
enum Operator {
    Rx(Regex),
    Contains(String),
    Pm(AhoCorasick),
    Streq(String),
}

impl Operator {
    fn compile(id: u32, def: &OperatorDef) -> Result<Self> {
        let invalid = |reason: String| EngineError::InvalidRule { id, reason };

        Ok(match def {
            OperatorDef::Rx(pattern) => {
                Self::Rx(Regex::new(pattern).map_err(|e| invalid(e.to_string()))?)
            }
            OperatorDef::Contains(s) => Self::Contains(s.clone()),
            OperatorDef::Pm(phrases) => {
                if phrases.is_empty() {
                    return Err(invalid("pm needs at least one phrase".into()));
                }
                let ac = AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(phrases)
                    .map_err(|e| invalid(e.to_string()))?;
                Self::Pm(ac)
            }
            OperatorDef::Streq(s) => Self::Streq(s.clone()),
        })
    }

    /// Matched fragment, if any
    fn find<'a>(&self, value: &'a str) -> Option<&'a str> {
        match self {
            Self::Rx(re) => re.find(value).map(|m| m.as_str()),
            Self::Contains(needle) => value.find(needle.as_str()).map(|i| &value[i..i + needle.len()]),
            Self::Pm(ac) => ac.find(value).map(|m| &value[m.start()..m.end()]),
            Self::Streq(s) => (value == s).then_some(value),
        }
    }
}

/// Rule ready for evaluation
#[derive(Debug)]
pub struct CompiledRule {
    /// Rule ID
    pub id: u32,
    /// Phase
    pub phase: u8,
    /// Targets
    pub targets: Vec<Target>,
    /// Action
    pub action: RuleAction,
    /// Message
    pub msg: String,
    /// Severity
    pub severity: Severity,
    /// Interruption status
    pub status: u16,
    /// Redirect target
    pub redirect_to: Option<String>,
    operator: Operator,
    negate: bool,
    transforms: Vec<Transform>,
}

impl CompiledRule {
    fn compile(def: &RuleDef) -> Result<Self> {
        let invalid = |reason: &str| EngineError::InvalidRule {
            id: def.id,
            reason: reason.to_string(),
        };

        if def.id == 0 {
            return Err(invalid("rule id 0 is reserved"));
        }
        if !matches!(def.phase, 1 | 2) {
            return Err(invalid("phase must be 1 or 2"));
        }
        if def.targets.is_empty() {
            return Err(invalid("at least one target is required"));
        }
        if def.phase == 1 && def.targets.contains(&Target::RequestBody) {
            return Err(invalid("request_body is only available in phase 2"));
        }

        Ok(Self {
            id: def.id,
            phase: def.phase,
            targets: def.targets.clone(),
            action: def.action,
            msg: def.msg.clone(),
            severity: def.severity,
            status: def.status.unwrap_or_else(|| def.action.default_status()),
            redirect_to: def.redirect_to.clone(),
            operator: Operator::compile(def.id, &def.operator)?,
            negate: def.negate,
            transforms: def.transforms.clone(),
        })
    }

    /// Evaluate against one variable value; returns the match data on success
    pub fn evaluate(&self, var: &str, value: &str) -> Option<String> {
        let transformed = self
            .transforms
            .iter()
            .fold(Cow::Borrowed(value), |v, t| t.apply(v));

        match (self.operator.find(&transformed), self.negate) {
            (Some(fragment), false) => Some(format!("{}: {}", var, excerpt(fragment))),
            (None, true) => Some(format!("{}: {}", var, excerpt(&transformed))),
            _ => None,
        }
    }
}

fn excerpt(s: &str) -> &str {
    if s.len() <= EXCERPT_LEN {
        return s;
    }
    let mut end = EXCERPT_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Compiled rule set plus effective settings
#[derive(Debug, Default)]
pub struct Ruleset {
    /// Engine settings
    pub settings: EngineSettings,
    phase1: Vec<CompiledRule>,
    phase2: Vec<CompiledRule>,
}

impl Ruleset {
    /// Compile rule definitions in load order
    pub fn compile(settings: EngineSettings, defs: &[RuleDef]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut phase1 = Vec::new();
        let mut phase2 = Vec::new();

        for def in defs {
            if !seen.insert(def.id) {
                return Err(EngineError::DuplicateRule(def.id));
            }
            let rule = CompiledRule::compile(def)?;
            if rule.phase == 1 {
                phase1.push(rule);
            } else {
                phase2.push(rule);
            }
        }

        Ok(Self {
            settings,
            phase1,
            phase2,
        })
    }

    /// Rules for a phase, in load order
    pub fn phase(&self, phase: u8) -> &[CompiledRule] {
        match phase {
            1 => &self.phase1,
            2 => &self.phase2,
            _ => &[],
        }
    }

    /// Total rule count
    pub fn len(&self) -> usize {
        self.phase1.len() + self.phase2.len()
    }

    /// True when no rules are loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
