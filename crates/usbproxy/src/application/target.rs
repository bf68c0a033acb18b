//! The target-side capability: the real USB device being proxied.
//!
//! The proxy never talks to a USB library directly.  It goes through
//! [`TargetDevice`], which the infrastructure layer implements on top of
//! libusb and which tests implement with scripted responses.
//!
//! # Blocking I/O
//!
//! Native transfers block the calling thread until the device answers or the
//! native timeout expires.  [`run_blocking`] moves such a call onto Tokio's
//! blocking pool so the async tasks servicing the victim never stall on it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use usbproxy_core::SetupPacket;

/// Errors surfaced by the target device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    /// No device matched the requested identifiers when opening the target.
    #[error("could not find device {vendor_id:04x}:{product_id:04x} to proxy")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    /// A transfer against an open target failed (disconnect, transfer fault,
    /// or a stall from the device itself).
    #[error("target communication error: {0}")]
    Communication(String),
}

/// Exclusive connection to one physical device.
///
/// Implementations own the native handle for the whole session.  Endpoint
/// arguments are endpoint *numbers* (0..=15); implementations add the
/// direction bit themselves.
#[cfg_attr(test, mockall::automock)]
pub trait TargetDevice: Send + Sync {
    /// `bMaxPacketSize0` from the device descriptor.
    fn max_control_packet_size(&self) -> u8;

    /// Issues an IN control transfer and returns the data stage, at most
    /// `setup.w_length` bytes.
    fn control_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TargetError>;

    /// Issues an OUT control transfer with `data` as the data stage and
    /// returns the number of bytes the device accepted.
    fn control_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<usize, TargetError>;

    /// Writes `data` to a bulk or interrupt OUT endpoint.
    fn write(&self, endpoint: u8, data: &[u8]) -> Result<(), TargetError>;

    /// Reads up to `length` bytes from a bulk or interrupt IN endpoint.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`.
    fn read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TargetError>;

    /// Gives up any claimed interfaces.  Called once, at session teardown.
    fn release(&self) {}
}

/// Opens target devices by vendor/product identifier.
pub trait TargetConnector {
    /// Opens the first device matching `vendor_id:product_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::DeviceNotFound`] if no device matches.
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn TargetDevice>, TargetError>;
}

/// Runs a blocking target operation on Tokio's blocking thread pool.
///
/// # Errors
///
/// Returns whatever `op` returns, or [`TargetError::Communication`] if the
/// worker thread panicked.
pub async fn run_blocking<T, F>(target: &Arc<dyn TargetDevice>, op: F) -> Result<T, TargetError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TargetDevice) -> Result<T, TargetError> + Send + 'static,
{
    let target = Arc::clone(target);
    tokio::task::spawn_blocking(move || op(target.as_ref()))
        .await
        .map_err(|e| TargetError::Communication(format!("target worker aborted: {e}")))?
}
