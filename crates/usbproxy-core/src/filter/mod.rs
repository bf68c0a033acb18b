//! Filters that observe and transform proxied USB traffic.
//!
//! # How filtering works (for beginners)
//!
//! Four kinds of events flow through the proxy:
//!
//! | Event        | Direction        | Keyed by          |
//! |--------------|------------------|-------------------|
//! | control-in   | target -> victim | [`Request`]       |
//! | control-out  | victim -> target | [`Request`]       |
//! | data-in      | target -> victim | endpoint number   |
//! | data-out     | victim -> target | endpoint number   |
//!
//! A [`Filter`] implements any subset of the four transforms; the ones it
//! leaves alone pass the event through unchanged.  Returning `None` for the
//! request (control-out) or the payload (data events) asks the proxy not to
//! forward the event, but the decision is only taken after *every* filter in
//! the [`chain::FilterChain`] has run, so a later filter can still restore it.
//!
//! # Sub-modules
//!
//! - **`chain`**      – The ordered, per-session list of filters.
//! - **`logging`**    – A pass-through filter that traces every event.
//! - **`suppress`**   – Swallows matching control-out requests.
//! - **`descriptor`** – Replaces descriptors returned by the target.

use crate::domain::request::Request;

pub mod chain;
pub mod descriptor;
pub mod logging;
pub mod suppress;

pub use descriptor::DescriptorOverrideFilter;
pub use logging::LoggingFilter;
pub use suppress::{RequestMatcher, SuppressControlOutFilter};

/// Payload of an event; `None` marks it as suppressed.
pub type Payload = Option<Vec<u8>>;

/// A control event as it travels through the chain.
pub type ControlEvent = (Option<Request>, Payload);

/// A bulk/interrupt event as it travels through the chain.
pub type DataEvent = (u8, Payload);

/// Capability interface for a traffic filter.
///
/// Every transform defaults to the identity, so a filter only overrides the
/// event kinds it cares about.  Filters may keep state between calls
/// (`&mut self`); they are owned by exactly one session's chain.
pub trait Filter: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Transforms a control-IN response on its way to the victim.
    fn filter_control_in(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        (request, data)
    }

    /// Transforms a control-OUT request on its way to the target.
    fn filter_control_out(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        (request, data)
    }

    /// Transforms bulk/interrupt data read from the target.
    fn filter_in(&mut self, endpoint: u8, data: Payload) -> DataEvent {
        (endpoint, data)
    }

    /// Transforms bulk/interrupt data written by the victim.
    fn filter_out(&mut self, endpoint: u8, data: Payload) -> DataEvent {
        (endpoint, data)
    }
}
