//! Native target adapter built on `rusb` (libusb).
//!
//! Opening a device detaches any kernel driver bound to it, claims every
//! interface of the active configuration, and remembers each endpoint's
//! transfer type so reads and writes pick bulk or interrupt transfers
//! without the caller having to know.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rusb::{DeviceHandle, GlobalContext, TransferType};
use tracing::{debug, info, warn};
use usbproxy_core::SetupPacket;

use crate::application::target::{TargetConnector, TargetDevice, TargetError};

impl From<rusb::Error> for TargetError {
    fn from(e: rusb::Error) -> Self {
        TargetError::Communication(e.to_string())
    }
}

/// Opens real devices on the host's USB bus.
#[derive(Debug, Clone)]
pub struct RusbConnector {
    timeout: Duration,
}

impl RusbConnector {
    /// `timeout` bounds every control and OUT transfer on opened devices.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TargetConnector for RusbConnector {
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn TargetDevice>, TargetError> {
        let handle = rusb::open_device_with_vid_pid(vendor_id, product_id).ok_or(
            TargetError::DeviceNotFound {
                vendor_id,
                product_id,
            },
        )?;
        let target = RusbTarget::from_handle(handle, self.timeout)?;
        Ok(Arc::new(target))
    }
}

/// An opened, claimed device.
pub struct RusbTarget {
    handle: DeviceHandle<GlobalContext>,
    max_packet_size0: u8,
    /// Transfer type keyed by endpoint address (direction bit included).
    endpoints: HashMap<u8, TransferType>,
    claimed: Vec<u8>,
    timeout: Duration,
}

impl RusbTarget {
    fn from_handle(handle: DeviceHandle<GlobalContext>, timeout: Duration) -> Result<Self, TargetError> {
        let device = handle.device();
        let descriptor = device.device_descriptor()?;

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            // Not supported on every platform; claiming may still succeed.
            debug!("kernel driver auto-detach unavailable: {e}");
        }

        let config = device.active_config_descriptor()?;
        let mut endpoints = HashMap::new();
        let mut claimed = Vec::new();
        for interface in config.interfaces() {
            let number = interface.number();
            handle.claim_interface(number)?;
            claimed.push(number);
            for setting in interface.descriptors() {
                for endpoint in setting.endpoint_descriptors() {
                    endpoints
                        .entry(endpoint.address())
                        .or_insert_with(|| endpoint.transfer_type());
                }
            }
        }

        info!(
            interfaces = claimed.len(),
            endpoints = endpoints.len(),
            "claimed target device {:04x}:{:04x}",
            descriptor.vendor_id(),
            descriptor.product_id()
        );

        Ok(Self {
            handle,
            max_packet_size0: descriptor.max_packet_size(),
            endpoints,
            claimed,
            timeout,
        })
    }

    fn transfer_type(&self, address: u8) -> TransferType {
        self.endpoints
            .get(&address)
            .copied()
            .unwrap_or(TransferType::Bulk)
    }
}

/// Endpoint address of IN endpoint number `endpoint`.
fn in_address(endpoint: u8) -> u8 {
    0x80 | (endpoint & 0x0F)
}

/// Endpoint address of OUT endpoint number `endpoint`.
fn out_address(endpoint: u8) -> u8 {
    endpoint & 0x0F
}

impl TargetDevice for RusbTarget {
    fn max_control_packet_size(&self) -> u8 {
        self.max_packet_size0
    }

    fn control_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TargetError> {
        let mut buf = vec![0u8; usize::from(setup.w_length)];
        let len = self.handle.read_control(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            &mut buf,
            self.timeout,
        )?;
        buf.truncate(len);
        Ok(buf)
    }

    fn control_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<usize, TargetError> {
        let sent = self.handle.write_control(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            data,
            self.timeout,
        )?;
        Ok(sent)
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<(), TargetError> {
        let address = out_address(endpoint);
        let sent = match self.transfer_type(address) {
            TransferType::Interrupt => self.handle.write_interrupt(address, data, self.timeout)?,
            _ => self.handle.write_bulk(address, data, self.timeout)?,
        };
        if sent < data.len() {
            return Err(TargetError::Communication(format!(
                "short write on endpoint {endpoint}: {sent} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TargetError> {
        let address = in_address(endpoint);
        let mut buf = vec![0u8; length];
        let result = match self.transfer_type(address) {
            TransferType::Interrupt => self.handle.read_interrupt(address, &mut buf, timeout),
            _ => self.handle.read_bulk(address, &mut buf, timeout),
        };
        match result {
            Ok(len) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Err(rusb::Error::Timeout) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self) {
        for &number in &self.claimed {
            if let Err(e) = self.handle.release_interface(number) {
                warn!(interface = number, "failed to release interface: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_address_sets_direction_bit() {
        assert_eq!(in_address(1), 0x81);
        assert_eq!(in_address(0x81), 0x81);
    }

    #[test]
    fn test_out_address_clears_direction_bit() {
        assert_eq!(out_address(2), 0x02);
        assert_eq!(out_address(0x82), 0x02);
    }

    #[test]
    fn test_rusb_errors_map_to_communication_errors() {
        let err: TargetError = rusb::Error::NoDevice.into();
        assert!(matches!(err, TargetError::Communication(_)));
    }
}
