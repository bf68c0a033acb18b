//! Infrastructure layer for the proxy.
//!
//! Contains the adapters the application layer is written against: the
//! libusb-backed target device, the channel-backed victim transport, and
//! file-system storage for the configuration.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `usbproxy_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod storage;
pub mod target;
pub mod victim;
