//! Pass-through filter that traces every event it sees.

use std::fmt::Write as _;

use tracing::debug;

use super::{ControlEvent, DataEvent, Filter, Payload};
use crate::domain::request::Request;

/// Bytes shown before a dump is truncated.
const DUMP_LIMIT: usize = 64;

/// Formats `data` as space-separated hex, truncated after [`DUMP_LIMIT`] bytes.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().min(DUMP_LIMIT) * 3 + 16);
    for (i, byte) in data.iter().take(DUMP_LIMIT).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if data.len() > DUMP_LIMIT {
        let _ = write!(out, " ... (+{} bytes)", data.len() - DUMP_LIMIT);
    }
    out
}

fn describe(data: &Payload) -> String {
    match data {
        Some(bytes) => format!("[{}] {}", bytes.len(), hex_dump(bytes)),
        None => "<suppressed>".to_string(),
    }
}

/// Logs every event at `debug` level and never modifies it.
///
/// Place it at the head of a chain to see what the target and victim send,
/// or at the tail to see what the proxy actually forwards.
#[derive(Debug, Clone)]
pub struct LoggingFilter {
    label: String,
}

impl LoggingFilter {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for LoggingFilter {
    fn default() -> Self {
        Self::new("log")
    }
}

impl Filter for LoggingFilter {
    fn name(&self) -> &str {
        &self.label
    }

    fn filter_control_in(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        match &request {
            Some(req) => debug!(filter = %self.label, "< {req}: {}", describe(&data)),
            None => debug!(filter = %self.label, "< <no request>: {}", describe(&data)),
        }
        (request, data)
    }

    fn filter_control_out(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        match &request {
            Some(req) => debug!(filter = %self.label, "> {req}: {}", describe(&data)),
            None => debug!(filter = %self.label, "> <suppressed request>: {}", describe(&data)),
        }
        (request, data)
    }

    fn filter_in(&mut self, endpoint: u8, data: Payload) -> DataEvent {
        debug!(filter = %self.label, endpoint, "< ep{endpoint}: {}", describe(&data));
        (endpoint, data)
    }

    fn filter_out(&mut self, endpoint: u8, data: Payload) -> DataEvent {
        debug!(filter = %self.label, endpoint, "> ep{endpoint}: {}", describe(&data));
        (endpoint, data)
    }
}
