//! # usbproxy-core
//!
//! Shared library for the USB proxy containing the control-request model,
//! the session state marker, and the filter pipeline applied to every proxied
//! event.
//!
//! It has zero dependencies on OS APIs, USB libraries, or async runtimes.
//!
//! # Architecture overview (for beginners)
//!
//! The proxy sits between two USB worlds:
//!
//! - the **victim side**: a host computer talking to an *emulated* device, and
//! - the **target side**: the real physical device we forward traffic to.
//!
//! Every control request from the victim and every bulk/interrupt chunk in
//! either direction passes through an ordered list of *filters* that may
//! observe, rewrite, or suppress it.  This crate defines:
//!
//! - **`domain`** – The 8-byte USB setup packet, the [`Request`] that wraps it
//!   together with its payload, and the [`DeviceState`] marker.
//!
//! - **`filter`** – The [`Filter`] capability trait (four transforms that all
//!   default to "pass through unchanged"), the [`FilterChain`] that runs every
//!   filter in order, and a handful of ready-made filters.

pub mod domain;
pub mod filter;

// Re-export the most-used types at the crate root so callers can write
// `usbproxy_core::Request` instead of `usbproxy_core::domain::request::Request`.
pub use domain::request::{
    ControlType, Direction, Recipient, Request, RequestError, SetupPacket, StandardRequest,
};
pub use domain::state::DeviceState;
pub use filter::chain::FilterChain;
pub use filter::{ControlEvent, DataEvent, Filter, Payload};
