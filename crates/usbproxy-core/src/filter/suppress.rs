//! Swallows selected control-OUT requests so they never reach the target.
//!
//! Useful for keeping configuration writes away from the real device while
//! the victim carries on unaware.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ControlEvent, Filter, Payload};
use crate::domain::request::Request;

/// Matches control requests by setup-packet fields.
///
/// Each field left as `None` matches anything, so the default matcher
/// matches every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u16>,
}

impl RequestMatcher {
    pub fn matches(&self, req: &Request) -> bool {
        self.request_type.map_or(true, |t| t == req.request_type())
            && self.request.map_or(true, |r| r == req.request())
            && self.value.map_or(true, |v| v == req.value())
            && self.index.map_or(true, |i| i == req.index())
    }
}

/// Nulls the request of every control-OUT transfer the matcher accepts.
#[derive(Debug, Clone)]
pub struct SuppressControlOutFilter {
    matcher: RequestMatcher,
    suppressed: u64,
}

impl SuppressControlOutFilter {
    pub fn new(matcher: RequestMatcher) -> Self {
        Self {
            matcher,
            suppressed: 0,
        }
    }

    /// Number of requests this filter has suppressed so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

impl Filter for SuppressControlOutFilter {
    fn name(&self) -> &str {
        "suppress_control_out"
    }

    fn filter_control_out(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        match request {
            Some(req) if self.matcher.matches(&req) => {
                self.suppressed += 1;
                debug!("suppressing {req}");
                (None, data)
            }
            other => (other, data),
        }
    }
}
