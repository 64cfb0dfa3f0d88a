//! Adapter configuration
//!
//! Values come from, in order of priority: command-line flags (each with an
//! environment fallback), the JSON file named by `--config`, then defaults.

use crate::error::ConfigError;
use crate::metadata::{HeaderConvention, MetadataMode};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Where inspection requests are accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InspectRoute {
    /// A single path, e.g. `/request`
    Path(String),
    /// Every path not otherwise routed
    Fallback,
}

impl InspectRoute {
    /// Parse the configured path; `*` selects the fallback route
    pub fn parse(path: &str) -> Result<Self, ConfigError> {
        match path {
            "*" => Ok(Self::Fallback),
            "/ping" => Err(ConfigError::InvalidInspectPath(path.to_string())),
            p if p.starts_with('/') => Ok(Self::Path(p.to_string())),
            _ => Err(ConfigError::InvalidInspectPath(path.to_string())),
        }
    }
}

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdapterConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// Inspection path, or `*` for every unrouted path
    pub inspect_path: String,
    /// Metadata source
    pub metadata_mode: MetadataMode,
    /// Carrier naming in forwarded mode
    pub header_convention: HeaderConvention,
    /// Rule files and glob patterns, loaded in order
    pub rule_files: Vec<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            inspect_path: "/request".to_string(),
            metadata_mode: MetadataMode::default(),
            header_convention: HeaderConvention::default(),
            rule_files: vec![
                "waf.yaml".to_string(),
                "/rules-before/*.yaml".to_string(),
                "rules/*.yaml".to_string(),
                "/rules-after/*.yaml".to_string(),
            ],
            request_timeout_secs: 15,
        }
    }
}

impl AdapterConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_string(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_string(),
            source: e,
        })
    }

    /// Resolve the effective configuration from command-line arguments
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => match Self::load(path) {
                Ok(config) => config,
                Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path, "Config not found, using defaults");
                    Self::default()
                }
                Err(e) => return Err(e),
            },
            None => Self::default(),
        };

        if let Some(addr) = args.listen {
            config.listen_addr = addr;
        }
        if let Some(path) = &args.inspect_path {
            config.inspect_path = path.clone();
        }
        if let Some(mode) = args.metadata_mode {
            config.metadata_mode = mode;
        }
        if let Some(convention) = args.header_convention {
            config.header_convention = convention;
        }
        if !args.rules.is_empty() {
            config.rule_files = args.rules.clone();
        }
        if let Some(secs) = args.timeout {
            config.request_timeout_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        InspectRoute::parse(&self.inspect_path)?;
        if self.rule_files.is_empty() {
            return Err(ConfigError::NoRuleFiles);
        }
        Ok(())
    }

    /// Parsed inspection route
    pub fn inspect_route(&self) -> Result<InspectRoute, ConfigError> {
        InspectRoute::parse(&self.inspect_path)
    }

    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Command-line arguments
#[derive(Parser, Debug, Default)]
#[command(name = "sase-waf")]
#[command(about = "OpenSASE WAF adapter - inspects HTTP requests and returns a verdict")]
#[command(version)]
pub struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "SASE_WAF_CONFIG")]
    pub config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "SASE_WAF_LISTEN")]
    pub listen: Option<SocketAddr>,

    /// Inspection path, or "*" for every unrouted path
    #[arg(long, env = "SASE_WAF_INSPECT_PATH")]
    pub inspect_path: Option<String>,

    /// Where request metadata comes from
    #[arg(long, value_enum, env = "SASE_WAF_METADATA_MODE")]
    pub metadata_mode: Option<MetadataMode>,

    /// Carrier header naming in forwarded mode
    #[arg(long, value_enum, env = "SASE_WAF_HEADER_CONVENTION")]
    pub header_convention: Option<HeaderConvention>,

    /// Rule file or glob pattern (repeatable, loaded in order)
    #[arg(short, long = "rules", env = "SASE_WAF_RULES", value_delimiter = ',')]
    pub rules: Vec<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "SASE_WAF_TIMEOUT")]
    pub timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AdapterConfig::default();
        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.inspect_route().unwrap(), InspectRoute::Path("/request".into()));
        assert_eq!(config.metadata_mode, MetadataMode::Forwarded);
        assert_eq!(config.rule_files.len(), 4);
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_inspect_route_parse() {
        assert_eq!(InspectRoute::parse("*").unwrap(), InspectRoute::Fallback);
        assert_eq!(InspectRoute::parse("/waf").unwrap(), InspectRoute::Path("/waf".into()));
        assert!(InspectRoute::parse("request").is_err());
        assert!(InspectRoute::parse("/ping").is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AdapterConfig =
            serde_json::from_str(r#"{"metadata_mode": "self_describing", "inspect_path": "*"}"#).unwrap();
        assert_eq!(config.metadata_mode, MetadataMode::SelfDescribing);
        assert_eq!(config.inspect_route().unwrap(), InspectRoute::Fallback);
        assert_eq!(config.request_timeout_secs, 15);
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"header_convention": "underscored", "request_timeout_secs": 30}}"#).unwrap();
        let path = file.path().display().to_string();

        let args = Args::try_parse_from(["sase-waf", "--config", &path, "--timeout", "5", "-r", "a.yaml,b/*.yaml"]).unwrap();
        let config = AdapterConfig::from_args(&args).unwrap();
        assert_eq!(config.header_convention, HeaderConvention::Underscored);
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.rule_files, vec!["a.yaml".to_string(), "b/*.yaml".to_string()]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let args = Args {
            config: Some("/definitely/not/here.json".into()),
            ..Args::default()
        };
        let config = AdapterConfig::from_args(&args).unwrap();
        assert_eq!(config.inspect_path, "/request");
    }

    #[test]
    fn test_invalid_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"listen_addr": "not an address"}}"#).unwrap();
        let args = Args {
            config: Some(file.path().display().to_string()),
            ..Args::default()
        };
        assert!(matches!(AdapterConfig::from_args(&args), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_bad_inspect_path_is_fatal() {
        let args = Args {
            inspect_path: Some("nope".into()),
            ..Args::default()
        };
        assert!(matches!(
            AdapterConfig::from_args(&args),
            Err(ConfigError::InvalidInspectPath(_))
        ));
    }
}
