//! Recording victim transport for tests.
//!
//! Captures every command the proxy issues so tests can assert on stalls,
//! acknowledgements and queued IN data without an emulated-device backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::channel::VictimCommand;
use crate::application::victim::{TransportError, VictimTransport};

/// A [`VictimTransport`] that stores commands in memory.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    commands: Mutex<Vec<VictimCommand>>,
    /// When `true`, every call fails and nothing is recorded.
    pub should_fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All commands recorded so far, oldest first.
    pub fn commands(&self) -> Vec<VictimCommand> {
        self.lock().clone()
    }

    pub fn stall_count(&self) -> usize {
        self.count(|c| matches!(c, VictimCommand::Stall))
    }

    pub fn ack_count(&self) -> usize {
        self.count(|c| matches!(c, VictimCommand::StatusAck))
    }

    /// IN data queued on `endpoint`, in delivery order.
    pub fn data_for(&self, endpoint: u8) -> Vec<Vec<u8>> {
        self.lock()
            .iter()
            .filter_map(|c| match c {
                VictimCommand::Data { endpoint: ep, data } if *ep == endpoint => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&VictimCommand) -> bool) -> usize {
        self.lock().iter().filter(|c| pred(c)).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<VictimCommand>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, command: VictimCommand) -> Result<(), TransportError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("mock failure".into()));
        }
        self.lock().push(command);
        Ok(())
    }
}

#[async_trait]
impl VictimTransport for RecordingTransport {
    async fn establish_session(&self, max_packet_size: u8) -> Result<(), TransportError> {
        self.record(VictimCommand::Establish { max_packet_size })
    }

    async fn send_control_response(&self, data: &[u8]) -> Result<(), TransportError> {
        self.record(VictimCommand::ControlResponse(data.to_vec()))
    }

    async fn acknowledge_status_stage(&self) -> Result<(), TransportError> {
        self.record(VictimCommand::StatusAck)
    }

    async fn signal_stall(&self) -> Result<(), TransportError> {
        self.record(VictimCommand::Stall)
    }

    async fn stall_endpoint(&self, endpoint: u8) -> Result<(), TransportError> {
        self.record(VictimCommand::StallEndpoint(endpoint))
    }

    async fn send_data(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
        self.record(VictimCommand::Data {
            endpoint,
            data: data.to_vec(),
        })
    }
}
