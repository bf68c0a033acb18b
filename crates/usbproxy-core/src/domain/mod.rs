//! Domain types for the USB proxy.
//!
//! - **`request`** – The USB setup packet and the control [`Request`] built
//!   around it.  A request's identity (type, code, value, index, length) is
//!   fixed once created; only its payload may be rewritten.
//!
//! - **`state`** – The device state marker a proxy session moves through.
//!
//! [`Request`]: request::Request

pub mod request;
pub mod state;
