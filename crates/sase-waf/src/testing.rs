//! Test doubles: a scripted engine that records every call

use bytes::Bytes;
use http_body::{Body, Frame};
use parking_lot::Mutex;
use sase_waf_engine::{
    EngineError, EngineTransaction, InspectionEngine, Interruption, MatchedRule, RuleAction, Severity,
};
use std::io::{Cursor, Read};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Connection(String, u16),
    Uri(String, String, String),
    Header(String, String),
    ProcessHeaders,
    ReadBody(usize),
    BodyReader,
    ProcessBody,
    Logging,
    Close,
}

#[derive(Clone, Debug)]
pub struct Script {
    pub engine_off: bool,
    pub body_access: bool,
    pub header_interruption: Option<Interruption>,
    pub append_interruption: Option<Interruption>,
    pub body_interruption: Option<Interruption>,
    pub append_error: bool,
    pub close_error: bool,
    pub panic_in_logging: bool,
    pub matched: Vec<MatchedRule>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            engine_off: false,
            body_access: true,
            header_interruption: None,
            append_interruption: None,
            body_interruption: None,
            append_error: false,
            close_error: false,
            panic_in_logging: false,
            matched: Vec::new(),
        }
    }
}

pub fn matched(rule_id: u32, msg: &str) -> MatchedRule {
    MatchedRule {
        rule_id,
        phase: 1,
        msg: msg.to_string(),
        data: String::new(),
        severity: Severity::Critical,
        action: RuleAction::Block,
        tx_id: String::new(),
        uri: String::new(),
        client_ip: String::new(),
    }
}

#[derive(Clone)]
pub struct ScriptedEngine {
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn received_body(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .map(|c| match c {
                Call::ReadBody(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

impl InspectionEngine for ScriptedEngine {
    type Transaction = ScriptedTransaction;

    fn new_transaction(&self) -> ScriptedTransaction {
        self.new_transaction_with_id("generated")
    }

    fn new_transaction_with_id(&self, id: &str) -> ScriptedTransaction {
        ScriptedTransaction {
            id: id.to_string(),
            script: self.script.clone(),
            calls: Arc::clone(&self.calls),
            body: Vec::new(),
            interruption: None,
        }
    }
}

pub struct ScriptedTransaction {
    id: String,
    script: Script,
    calls: Arc<Mutex<Vec<Call>>>,
    body: Vec<u8>,
    interruption: Option<Interruption>,
}

impl ScriptedTransaction {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn interrupt(&mut self, it: &Option<Interruption>) -> Option<Interruption> {
        if it.is_some() {
            self.interruption = it.clone();
        }
        it.clone()
    }
}

impl EngineTransaction for ScriptedTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_rule_engine_off(&self) -> bool {
        self.script.engine_off
    }

    fn process_connection(&mut self, client_ip: &str, client_port: u16, _server_ip: &str, _server_port: u16) {
        self.record(Call::Connection(client_ip.to_string(), client_port));
    }

    fn process_uri(&mut self, uri: &str, method: &str, version: &str) {
        self.record(Call::Uri(uri.to_string(), method.to_string(), version.to_string()));
    }

    fn add_request_header(&mut self, name: &str, value: &str) {
        self.record(Call::Header(name.to_string(), value.to_string()));
    }

    fn process_request_headers(&mut self) -> Option<Interruption> {
        self.record(Call::ProcessHeaders);
        let it = self.script.header_interruption.clone();
        self.interrupt(&it)
    }

    fn is_request_body_accessible(&self) -> bool {
        self.script.body_access
    }

    fn read_request_body_from(
        &mut self,
        reader: &mut dyn Read,
    ) -> sase_waf_engine::Result<(Option<Interruption>, usize)> {
        if self.script.append_error {
            return Err(EngineError::BodyRead(std::io::Error::new(
                std::io::ErrorKind::Other,
                "scripted append failure",
            )));
        }
        let read = reader.read_to_end(&mut self.body)?;
        self.record(Call::ReadBody(read));
        let it = self.script.append_interruption.clone();
        Ok((self.interrupt(&it), read))
    }

    fn request_body_reader(&self) -> sase_waf_engine::Result<Box<dyn Read + Send>> {
        self.record(Call::BodyReader);
        Ok(Box::new(Cursor::new(self.body.clone())))
    }

    fn process_request_body(&mut self) -> sase_waf_engine::Result<Option<Interruption>> {
        self.record(Call::ProcessBody);
        let it = self.script.body_interruption.clone();
        Ok(self.interrupt(&it))
    }

    fn matched_rules(&self) -> &[MatchedRule] {
        &self.script.matched
    }

    fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    fn process_logging(&mut self) {
        self.record(Call::Logging);
        if self.script.panic_in_logging {
            panic!("scripted logging panic");
        }
    }

    fn close(&mut self) -> sase_waf_engine::Result<()> {
        self.record(Call::Close);
        if self.script.close_error {
            return Err(EngineError::TransactionClosed(self.id.clone()));
        }
        Ok(())
    }
}

/// Body that yields one data frame and then fails
pub struct FailingBody {
    sent: bool,
}

impl FailingBody {
    pub fn new() -> Self {
        Self { sent: false }
    }
}

impl Body for FailingBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        if !self.sent {
            self.sent = true;
            return Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(b"partial")))));
        }
        Poll::Ready(Some(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "client went away",
        ))))
    }
}
