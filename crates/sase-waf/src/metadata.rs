//! Request metadata extraction
//!
//! The adapter runs in one of two modes, fixed at startup:
//!
//! - **Forwarded**: the caller describes someone else's request through
//!   carrier headers (`X-Coraza-Ip`, `X-Coraza-Uri`, ...). Headers wrapped
//!   in the envelope prefix (`X-Coraza-Header-`) are unwrapped; carriers
//!   are never forwarded to the engine.
//! - **Self-describing**: the inbound request is inspected as-is, with the
//!   client address taken from the peer socket.

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Client port reported in forwarded mode, where no port is carried
pub const FORWARDED_CLIENT_PORT: u16 = 42000;

/// Metadata source selected at startup
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMode {
    /// Carrier headers describe a forwarded request
    #[default]
    Forwarded,
    /// The inbound request describes itself
    SelfDescribing,
}

/// Carrier header naming convention (forwarded mode)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HeaderConvention {
    /// `X-Coraza-Ip`, `X-Coraza-Header-*`
    #[default]
    Hyphenated,
    /// `X_CORAZA_IP`, `X_CORAZA_HEADER_*`
    Underscored,
}

/// Carrier header names, lowercase as stored by `http::HeaderMap`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Carriers {
    /// Client IP
    pub ip: &'static str,
    /// HTTP method
    pub method: &'static str,
    /// Request URI
    pub uri: &'static str,
    /// Protocol version
    pub version: &'static str,
    /// Transaction ID
    pub id: &'static str,
    /// Envelope prefix for forwarded headers
    pub header_prefix: &'static str,
}

impl HeaderConvention {
    /// Carrier names for this convention
    pub fn carriers(&self) -> Carriers {
        match self {
            Self::Hyphenated => Carriers {
                ip: "x-coraza-ip",
                method: "x-coraza-method",
                uri: "x-coraza-uri",
                version: "x-coraza-version",
                id: "x-coraza-id",
                header_prefix: "x-coraza-header-",
            },
            Self::Underscored => Carriers {
                ip: "x_coraza_ip",
                method: "x_coraza_method",
                uri: "x_coraza_uri",
                version: "x_coraza_version",
                id: "x_coraza_id",
                header_prefix: "x_coraza_header_",
            },
        }
    }
}

impl Carriers {
    fn is_carrier(&self, name: &str) -> bool {
        [self.ip, self.method, self.uri, self.version, self.id].contains(&name)
    }
}

/// View of the request fed to the engine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InspectionRequest {
    /// Caller-supplied transaction ID
    pub tx_id: Option<String>,
    /// Client address
    pub client_ip: String,
    /// Client port
    pub client_port: u16,
    /// HTTP method
    pub method: String,
    /// Request URI
    pub uri: String,
    /// Protocol version, e.g. `HTTP/1.1`
    pub http_version: String,
    /// Headers in order, one entry per value
    pub headers: Vec<(String, String)>,
}

/// Metadata extraction strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataStrategy {
    /// Carrier headers with the given convention
    Forwarded(HeaderConvention),
    /// Request line and peer address
    SelfDescribing,
}

impl MetadataStrategy {
    /// Resolve the strategy from configuration
    pub fn new(mode: MetadataMode, convention: HeaderConvention) -> Self {
        match mode {
            MetadataMode::Forwarded => Self::Forwarded(convention),
            MetadataMode::SelfDescribing => Self::SelfDescribing,
        }
    }

    /// Build the inspection view of a request
    pub fn extract(&self, parts: &Parts) -> InspectionRequest {
        match self {
            Self::Forwarded(convention) => forwarded(&convention.carriers(), &parts.headers),
            Self::SelfDescribing => self_describing(parts),
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

fn forwarded(carriers: &Carriers, headers: &HeaderMap) -> InspectionRequest {
    let tx_id = Some(header_str(headers, carriers.id)).filter(|id| !id.is_empty());

    let mut forwarded = Vec::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name = name.as_str();
        if carriers.is_carrier(name) {
            continue;
        }
        let name = match name.strip_prefix(carriers.header_prefix) {
            Some("") => continue,
            Some(inner) => inner,
            None => name,
        };
        forwarded.push((name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()));
    }

    InspectionRequest {
        tx_id,
        client_ip: header_str(headers, carriers.ip),
        client_port: FORWARDED_CLIENT_PORT,
        method: header_str(headers, carriers.method),
        uri: header_str(headers, carriers.uri),
        http_version: header_str(headers, carriers.version),
        headers: forwarded,
    }
}

fn self_describing(parts: &Parts) -> InspectionRequest {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    InspectionRequest {
        tx_id: None,
        client_ip: peer.map(|a| a.ip().to_string()).unwrap_or_default(),
        client_port: peer.map(|a| a.port()).unwrap_or(0),
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        http_version: format!("{:?}", parts.version),
        headers: parts
            .headers
            .iter()
            .map(|(n, v)| (n.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect(),
    }
}
