//! Target-device adapters.
//!
//! - [`libusb`] – the real device, opened through `rusb`.
//! - [`mock`]   – a scripted, in-memory device for tests.

pub mod libusb;
pub mod mock;

pub use libusb::{RusbConnector, RusbTarget};
pub use mock::{ScriptedConnector, ScriptedTarget};
