//! Channel-backed victim transport.
//!
//! The emulated-device backend runs on its own (a gadget driver, a hardware
//! front end, a simulator).  [`ChannelTransport`] turns each
//! [`VictimTransport`] call into a [`VictimCommand`] on a bounded Tokio
//! channel; the backend consumes the commands and feeds its own callbacks
//! back to the proxy as `VictimEvent`s on a second channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::application::victim::{TransportError, VictimTransport};

/// One instruction for the emulated-device backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VictimCommand {
    Establish { max_packet_size: u8 },
    ControlResponse(Vec<u8>),
    StatusAck,
    Stall,
    StallEndpoint(u8),
    Data { endpoint: u8, data: Vec<u8> },
}

/// A [`VictimTransport`] that forwards every call over a channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    commands: mpsc::Sender<VictimCommand>,
}

impl ChannelTransport {
    /// Creates the transport and the receiving end the backend reads from.
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<VictimCommand>) {
        let (commands, rx) = mpsc::channel(depth.max(1));
        (Self { commands }, rx)
    }

    async fn send(&self, command: VictimCommand) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl VictimTransport for ChannelTransport {
    async fn establish_session(&self, max_packet_size: u8) -> Result<(), TransportError> {
        self.send(VictimCommand::Establish { max_packet_size }).await
    }

    async fn send_control_response(&self, data: &[u8]) -> Result<(), TransportError> {
        self.send(VictimCommand::ControlResponse(data.to_vec())).await
    }

    async fn acknowledge_status_stage(&self) -> Result<(), TransportError> {
        self.send(VictimCommand::StatusAck).await
    }

    async fn signal_stall(&self) -> Result<(), TransportError> {
        self.send(VictimCommand::Stall).await
    }

    async fn stall_endpoint(&self, endpoint: u8) -> Result<(), TransportError> {
        self.send(VictimCommand::StallEndpoint(endpoint)).await
    }

    async fn send_data(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        self.send(VictimCommand::Data {
            endpoint,
            data: data.to_vec(),
        })
        .await
    }
}
