//! The ordered filter chain owned by one proxy session.
//!
//! Filters run in insertion order for every event kind.  No filter can stop
//! the chain early: even after one filter suppresses an event, the remaining
//! filters still see it (as `None`) and may restore or replace it.  Whether
//! the event is forwarded is decided by the caller from the final value.

use std::fmt;

use super::{ControlEvent, DataEvent, Filter};
use crate::domain::request::Request;

/// An ordered sequence of filters.
///
/// A chain is plain per-session state: build a fresh one for every session.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    /// Creates an empty chain, which passes every event through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a filter at the tail, or at the head when `at_head` is set.
    ///
    /// There is no bound on chain length and the same filter type may be
    /// added more than once.
    pub fn add<F: Filter + 'static>(&mut self, filter: F, at_head: bool) {
        self.add_boxed(Box::new(filter), at_head);
    }

    /// Same as [`add`](Self::add) for an already-boxed filter.
    pub fn add_boxed(&mut self, filter: Box<dyn Filter>, at_head: bool) {
        if at_head {
            self.filters.insert(0, filter);
        } else {
            self.filters.push(filter);
        }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Names of the registered filters, in application order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs every filter's control-in transform over a response read from
    /// the target.
    pub fn apply_control_in(&mut self, request: Request, data: Vec<u8>) -> ControlEvent {
        self.filters
            .iter_mut()
            .fold((Some(request), Some(data)), |(req, data), f| {
                f.filter_control_in(req, data)
            })
    }

    /// Runs every filter's control-out transform over a victim request.
    pub fn apply_control_out(&mut self, request: Request, data: Vec<u8>) -> ControlEvent {
        self.filters
            .iter_mut()
            .fold((Some(request), Some(data)), |(req, data), f| {
                f.filter_control_out(req, data)
            })
    }

    /// Runs every filter's data-in transform over a chunk read from the target.
    pub fn apply_data_in(&mut self, endpoint: u8, data: Vec<u8>) -> DataEvent {
        self.filters
            .iter_mut()
            .fold((endpoint, Some(data)), |(ep, data), f| f.filter_in(ep, data))
    }

    /// Runs every filter's data-out transform over a chunk from the victim.
    pub fn apply_data_out(&mut self, endpoint: u8, data: Vec<u8>) -> DataEvent {
        self.filters
            .iter_mut()
            .fold((endpoint, Some(data)), |(ep, data), f| f.filter_out(ep, data))
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FromIterator<Box<dyn Filter>> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Box<dyn Filter>>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
