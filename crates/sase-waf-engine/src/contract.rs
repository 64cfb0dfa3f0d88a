//! Phase-processing contract between the adapter and an inspection engine
//!
//! Phase calls must be made in order: connection, URI, headers, then
//! [`EngineTransaction::process_request_headers`]; body calls follow only
//! when no interruption was raised.

use crate::types::{Interruption, MatchedRule};
use crate::Result;
use std::io::Read;

/// Shared, read-mostly engine instance
///
/// Implementations must be safe to use from many request tasks at once.
pub trait InspectionEngine: Send + Sync + 'static {
    /// Per-request transaction type
    type Transaction: EngineTransaction;

    /// Open a transaction with a generated ID
    fn new_transaction(&self) -> Self::Transaction;

    /// Open a transaction with a caller-supplied ID
    fn new_transaction_with_id(&self, id: &str) -> Self::Transaction;
}

/// One inspection session, owned by a single request
pub trait EngineTransaction: Send + 'static {
    /// Transaction ID
    fn id(&self) -> &str;

    /// True when the rule engine is configured off for this transaction
    fn is_rule_engine_off(&self) -> bool;

    /// Record connection metadata
    fn process_connection(&mut self, client_ip: &str, client_port: u16, server_ip: &str, server_port: u16);

    /// Record the request line
    fn process_uri(&mut self, uri: &str, method: &str, version: &str);

    /// Append one header value; repeated names are kept as separate values
    fn add_request_header(&mut self, name: &str, value: &str);

    /// Evaluate phase 1
    fn process_request_headers(&mut self) -> Option<Interruption>;

    /// Whether the body-access policy lets the engine buffer the body
    fn is_request_body_accessible(&self) -> bool;

    /// Buffer body bytes from `reader`, returning any limit interruption and
    /// the number of bytes consumed from `reader`
    fn read_request_body_from(&mut self, reader: &mut dyn Read) -> Result<(Option<Interruption>, usize)>;

    /// Reader over the engine's retained body copy
    fn request_body_reader(&self) -> Result<Box<dyn Read + Send>>;

    /// Evaluate phase 2
    fn process_request_body(&mut self) -> Result<Option<Interruption>>;

    /// Rules matched so far, in match order
    fn matched_rules(&self) -> &[MatchedRule];

    /// Interruption raised so far, if any
    fn interruption(&self) -> Option<&Interruption>;

    /// Flush match/audit logging
    fn process_logging(&mut self);

    /// Release engine-side resources
    fn close(&mut self) -> Result<()>;
}
