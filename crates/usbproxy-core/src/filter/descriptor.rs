//! Replaces descriptors returned by the target device.
//!
//! GET_DESCRIPTOR encodes the descriptor type in the high byte of `wValue`
//! and the descriptor index in the low byte.  The override answers with the
//! configured bytes instead of the device's, cut to the `wLength` the victim
//! asked for.

use tracing::debug;

use super::{ControlEvent, Filter, Payload};
use crate::domain::request::{Request, StandardRequest};

/// Descriptor type codes (USB 2.0 table 9-5).
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const HID_REPORT: u8 = 0x22;
}

/// Serves a fixed descriptor for matching GET_DESCRIPTOR requests.
#[derive(Debug, Clone)]
pub struct DescriptorOverrideFilter {
    descriptor_type: u8,
    index: u8,
    replacement: Vec<u8>,
}

impl DescriptorOverrideFilter {
    pub fn new(descriptor_type: u8, index: u8, replacement: Vec<u8>) -> Self {
        Self {
            descriptor_type,
            index,
            replacement,
        }
    }

    fn matches(&self, req: &Request) -> bool {
        let [index, descriptor_type] = req.value().to_le_bytes();
        req.setup().standard_request() == Some(StandardRequest::GetDescriptor)
            && descriptor_type == self.descriptor_type
            && index == self.index
    }
}

impl Filter for DescriptorOverrideFilter {
    fn name(&self) -> &str {
        "descriptor_override"
    }

    fn filter_control_in(&mut self, request: Option<Request>, data: Payload) -> ControlEvent {
        let Some(req) = request else {
            return (None, data);
        };
        if !self.matches(&req) {
            return (Some(req), data);
        }
        let limit = usize::from(req.length()).min(self.replacement.len());
        debug!(
            descriptor_type = self.descriptor_type,
            index = self.index,
            "overriding descriptor ({limit} bytes)"
        );
        let replaced = self.replacement[..limit].to_vec();
        (Some(req), Some(replaced))
    }
}
