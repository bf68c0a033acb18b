//! USB control requests.
//!
//! Every control transfer starts with an 8-byte *setup packet*:
//!
//! ```text
//! offset  field          size  notes
//! 0       bmRequestType  1     bit 7 = direction, bits 6..5 = type, bits 4..0 = recipient
//! 1       bRequest       1     request code
//! 2       wValue         2     little-endian
//! 4       wIndex         2     little-endian
//! 6       wLength        2     little-endian, bytes in the data stage
//! ```
//!
//! A [`Request`] pairs the setup packet with the data stage the victim sent
//! (OUT requests) or an empty payload (IN requests, where `wLength` says how
//! many bytes the victim is willing to receive).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of a setup packet on the wire.
pub const SETUP_PACKET_LEN: usize = 8;

/// Errors raised when building a [`Request`] from raw bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Fewer than eight bytes were supplied for the setup packet.
    #[error("setup packet truncated: expected {SETUP_PACKET_LEN} bytes, got {0}")]
    Truncated(usize),

    /// An OUT request carried more data than its `wLength` announces.
    #[error("OUT payload of {actual} bytes exceeds wLength {declared}")]
    PayloadTooLong { declared: u16, actual: usize },
}

/// Direction of the data stage, taken from bit 7 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Out => write!(f, "OUT"),
            Direction::In => write!(f, "IN"),
        }
    }
}

/// Request type, bits 6..5 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

impl fmt::Display for ControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlType::Standard => write!(f, "standard"),
            ControlType::Class => write!(f, "class"),
            ControlType::Vendor => write!(f, "vendor"),
            ControlType::Reserved => write!(f, "reserved"),
        }
    }
}

/// Request recipient, bits 4..0 of `bmRequestType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Device => write!(f, "device"),
            Recipient::Interface => write!(f, "interface"),
            Recipient::Endpoint => write!(f, "endpoint"),
            Recipient::Other => write!(f, "other"),
            Recipient::Reserved => write!(f, "reserved"),
        }
    }
}

/// Standard request codes from chapter 9 of the USB 2.0 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StandardRequest {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

impl StandardRequest {
    /// Maps a raw `bRequest` code to a standard request, if it is one.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => StandardRequest::GetStatus,
            0x01 => StandardRequest::ClearFeature,
            0x03 => StandardRequest::SetFeature,
            0x05 => StandardRequest::SetAddress,
            0x06 => StandardRequest::GetDescriptor,
            0x07 => StandardRequest::SetDescriptor,
            0x08 => StandardRequest::GetConfiguration,
            0x09 => StandardRequest::SetConfiguration,
            0x0A => StandardRequest::GetInterface,
            0x0B => StandardRequest::SetInterface,
            0x0C => StandardRequest::SynchFrame,
            _ => return None,
        })
    }
}

/// The 8-byte setup stage of a control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    /// Parses a setup packet from its little-endian wire form.
    ///
    /// Bytes beyond the eighth are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Truncated`] if fewer than eight bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RequestError> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(RequestError::Truncated(bytes.len()));
        }
        Ok(Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    /// Encodes the setup packet into its little-endian wire form.
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let value = self.w_value.to_le_bytes();
        let index = self.w_index.to_le_bytes();
        let length = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn direction(&self) -> Direction {
        if self.bm_request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn control_type(&self) -> ControlType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => ControlType::Standard,
            1 => ControlType::Class,
            2 => ControlType::Vendor,
            _ => ControlType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Returns the standard request this packet carries, if its type is
    /// `Standard` and the code is defined.
    pub fn standard_request(&self) -> Option<StandardRequest> {
        match self.control_type() {
            ControlType::Standard => StandardRequest::from_code(self.b_request),
            _ => None,
        }
    }
}

/// A single control transfer as seen by the proxy.
///
/// The setup fields are fixed at construction.  The payload is the OUT data
/// stage; filters that want to change it build a new request with
/// [`Request::with_payload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    setup: SetupPacket,
    payload: Vec<u8>,
}

impl Request {
    /// Creates a request from a setup packet and its data stage.
    pub fn new(setup: SetupPacket, payload: Vec<u8>) -> Self {
        Self { setup, payload }
    }

    /// Creates an IN request; IN requests carry no payload of their own.
    pub fn control_in(
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        w_length: u16,
    ) -> Self {
        Self::new(
            SetupPacket {
                bm_request_type: bm_request_type | 0x80,
                b_request,
                w_value,
                w_index,
                w_length,
            },
            Vec::new(),
        )
    }

    /// Creates an OUT request whose `wLength` matches `payload`.
    ///
    /// Payloads longer than `u16::MAX` are announced as `u16::MAX`.
    pub fn control_out(
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        payload: Vec<u8>,
    ) -> Self {
        let w_length = u16::try_from(payload.len()).unwrap_or(u16::MAX);
        Self::new(
            SetupPacket {
                bm_request_type: bm_request_type & 0x7F,
                b_request,
                w_value,
                w_index,
                w_length,
            },
            payload,
        )
    }

    /// Parses a request from a raw setup packet and the OUT data stage.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Truncated`] for short setup packets and
    /// [`RequestError::PayloadTooLong`] when an OUT payload exceeds `wLength`.
    pub fn from_setup_bytes(setup: &[u8], payload: Vec<u8>) -> Result<Self, RequestError> {
        let setup = SetupPacket::from_bytes(setup)?;
        if setup.direction() == Direction::Out && payload.len() > usize::from(setup.w_length) {
            return Err(RequestError::PayloadTooLong {
                declared: setup.w_length,
                actual: payload.len(),
            });
        }
        Ok(Self::new(setup, payload))
    }

    /// Returns a copy of this request carrying a different payload.
    pub fn with_payload(self, payload: Vec<u8>) -> Self {
        Self {
            setup: self.setup,
            payload,
        }
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn direction(&self) -> Direction {
        self.setup.direction()
    }

    /// Raw `bmRequestType` bitfield.
    pub fn request_type(&self) -> u8 {
        self.setup.bm_request_type
    }

    /// Raw `bRequest` code.
    pub fn request(&self) -> u8 {
        self.setup.b_request
    }

    pub fn value(&self) -> u16 {
        self.setup.w_value
    }

    pub fn index(&self) -> u16 {
        self.setup.w_index
    }

    /// `wLength`: bytes requested (IN) or announced (OUT).
    pub fn length(&self) -> u16 {
        self.setup.w_length
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the request and returns its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} bRequest=0x{:02x}",
            self.direction(),
            self.setup.control_type(),
            self.setup.recipient(),
            self.setup.b_request
        )?;
        if let Some(standard) = self.setup.standard_request() {
            write!(f, " ({standard:?})")?;
        }
        write!(
            f,
            " wValue=0x{:04x} wIndex=0x{:04x} wLength={}",
            self.setup.w_value, self.setup.w_index, self.setup.w_length
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
