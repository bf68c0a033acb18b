//! The victim-side capability: the emulated device the victim host sees.
//!
//! The emulated-device stack (bus signaling, endpoint buffers, timing) lives
//! outside this crate.  The proxy drives it through [`VictimTransport`] and
//! is driven by it through [`VictimEvent`]s, one per inbound callback.

use async_trait::async_trait;
use thiserror::Error;
use usbproxy_core::Request;

/// Errors surfaced by the victim-facing transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The emulated-device backend has gone away.
    #[error("victim transport closed")]
    Closed,

    /// The backend refused the operation.
    #[error("victim transport rejected the operation: {0}")]
    Rejected(String),
}

/// Operations the proxy performs against the emulated device.
///
/// Infrastructure implementations forward these to an emulated-device
/// backend; test implementations record calls.
#[async_trait]
pub trait VictimTransport: Send + Sync {
    /// Makes the emulated device visible with the given EP0 packet size and
    /// starts accepting victim requests.
    async fn establish_session(&self, max_packet_size: u8) -> Result<(), TransportError>;

    /// Delivers the data stage of an IN control transfer.
    async fn send_control_response(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Completes the status stage of an OUT control transfer.
    async fn acknowledge_status_stage(&self) -> Result<(), TransportError>;

    /// Stalls endpoint 0, failing the current control transfer.
    async fn signal_stall(&self) -> Result<(), TransportError>;

    /// Stalls a bulk/interrupt endpoint after a failed transfer.
    async fn stall_endpoint(&self, endpoint: u8) -> Result<(), TransportError>;

    /// Queues IN data on a bulk/interrupt endpoint for the victim to read.
    async fn send_data(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError>;
}

/// Inbound events from the emulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VictimEvent {
    /// The victim issued a control request on endpoint 0.
    ControlRequest(Request),
    /// The victim wrote OUT data that should travel to the target.
    DataAvailable { endpoint: u8, data: Vec<u8> },
    /// An IN endpoint buffer is free and can take data from the target.
    /// `endpoint` may be the number or the IN address (`1` or `0x81`).
    BufferAvailable { endpoint: u8 },
}
