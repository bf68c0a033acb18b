//! Application layer of the USB proxy.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure rules, here `usbproxy_core`) and the infrastructure (libusb, the
//! emulated-device backend, the file system).
//!
//! Code in this layer:
//!
//! - **Orchestrates** domain objects to fulfil a goal (e.g., "forward this
//!   control request to the real device and answer the victim").
//! - **Depends on abstractions** (traits) rather than concrete implementations,
//!   so a scripted target or a recording transport can stand in for hardware.
//! - **Contains no USB library calls and no file system access**.
//!
//! # Sub-modules
//!
//! - **`target`**        – The [`target::TargetDevice`] capability wrapping the
//!   real device, and the connector that opens it.
//!
//! - **`victim`**        – The [`victim::VictimTransport`] capability that
//!   talks to the emulated device, and the events it delivers.
//!
//! - **`proxy_session`** – The proxy engine: routes every event through the
//!   filter chain and contains target failures as stalls.
//!
//! - **`in_poller`**     – Background readers that carry bulk/interrupt IN
//!   data from the target to the victim, one per endpoint.

pub mod in_poller;
pub mod proxy_session;
pub mod target;
pub mod victim;
