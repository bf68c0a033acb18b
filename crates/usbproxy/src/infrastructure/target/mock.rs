//! Scripted target device for tests.
//!
//! [`ScriptedTarget`] answers control IN requests from a queue of canned
//! responses, hands out queued IN data per endpoint, and records every
//! control OUT transfer and bulk write so tests can assert on what reached
//! the "device".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use usbproxy_core::SetupPacket;

use crate::application::target::{TargetConnector, TargetDevice, TargetError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-memory [`TargetDevice`].
#[derive(Debug, Default)]
pub struct ScriptedTarget {
    max_packet_size: u8,
    control_responses: Mutex<VecDeque<Result<Vec<u8>, TargetError>>>,
    in_data: Mutex<HashMap<u8, VecDeque<Vec<u8>>>>,
    control_in_calls: Mutex<Vec<SetupPacket>>,
    control_out_calls: Mutex<Vec<(SetupPacket, Vec<u8>)>>,
    writes: Mutex<Vec<(u8, Vec<u8>)>>,
    reads: AtomicUsize,
    release_count: AtomicUsize,
    control_delay: Mutex<Duration>,
    /// When `true`, every transfer fails with a communication error.
    pub should_fail: AtomicBool,
}

impl ScriptedTarget {
    pub fn new(max_packet_size: u8) -> Self {
        Self {
            max_packet_size,
            ..Self::default()
        }
    }

    /// Queues the result of the next control IN transfer.
    pub fn push_control_response(&self, response: Result<Vec<u8>, TargetError>) {
        lock(&self.control_responses).push_back(response);
    }

    /// Queues one IN transfer worth of data on `endpoint`.
    pub fn queue_in_data(&self, endpoint: u8, data: Vec<u8>) {
        lock(&self.in_data).entry(endpoint).or_default().push_back(data);
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    /// Makes every control IN transfer take at least `delay`.
    pub fn set_control_delay(&self, delay: Duration) {
        *lock(&self.control_delay) = delay;
    }

    pub fn control_in_calls(&self) -> Vec<SetupPacket> {
        lock(&self.control_in_calls).clone()
    }

    pub fn control_out_calls(&self) -> Vec<(SetupPacket, Vec<u8>)> {
        lock(&self.control_out_calls).clone()
    }

    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        lock(&self.writes).clone()
    }

    /// Number of IN reads attempted, including ones that timed out.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    fn check_failing(&self) -> Result<(), TargetError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(TargetError::Communication("scripted failure".into()));
        }
        if self.release_count() > 0 {
            return Err(TargetError::Communication("device released".into()));
        }
        Ok(())
    }
}

impl TargetDevice for ScriptedTarget {
    fn max_control_packet_size(&self) -> u8 {
        self.max_packet_size
    }

    fn control_in(&self, setup: &SetupPacket) -> Result<Vec<u8>, TargetError> {
        lock(&self.control_in_calls).push(*setup);
        let delay = *lock(&self.control_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.check_failing()?;
        let mut data = lock(&self.control_responses)
            .pop_front()
            .unwrap_or_else(|| Err(TargetError::Communication("no scripted response".into())))?;
        data.truncate(usize::from(setup.w_length));
        Ok(data)
    }

    fn control_out(&self, setup: &SetupPacket, data: &[u8]) -> Result<usize, TargetError> {
        self.check_failing()?;
        lock(&self.control_out_calls).push((*setup, data.to_vec()));
        Ok(data.len())
    }

    fn write(&self, endpoint: u8, data: &[u8]) -> Result<(), TargetError> {
        self.check_failing()?;
        lock(&self.writes).push((endpoint, data.to_vec()));
        Ok(())
    }

    fn read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, TargetError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        let next = lock(&self.in_data)
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front);
        match next {
            Some(mut data) => {
                data.truncate(length);
                Ok(Some(data))
            }
            None => {
                // Behave like a device with nothing to say: wait, then time out.
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Ok(None)
            }
        }
    }

    fn release(&self) {
        self.release_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`TargetConnector`] over a fixed set of scripted devices.
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    devices: HashMap<(u16, u16), Arc<ScriptedTarget>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `target` discoverable as `vendor_id:product_id`.
    pub fn with_device(mut self, vendor_id: u16, product_id: u16, target: Arc<ScriptedTarget>) -> Self {
        self.devices.insert((vendor_id, product_id), target);
        self
    }
}

impl TargetConnector for ScriptedConnector {
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Arc<dyn TargetDevice>, TargetError> {
        self.devices
            .get(&(vendor_id, product_id))
            .map(|target| Arc::clone(target) as Arc<dyn TargetDevice>)
            .ok_or(TargetError::DeviceNotFound {
                vendor_id,
                product_id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(w_length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length,
        }
    }

    #[test]
    fn test_control_in_truncates_to_w_length() {
        // Arrange
        let target = ScriptedTarget::new(64);
        target.push_control_response(Ok(vec![1, 2, 3, 4]));

        // Act
        let data = target.control_in(&setup(2)).unwrap();

        // Assert
        assert_eq!(data, vec![1, 2]);
        assert_eq!(target.control_in_calls().len(), 1);
    }

    #[test]
    fn test_control_in_without_script_fails() {
        let target = ScriptedTarget::new(64);
        assert!(target.control_in(&setup(8)).is_err());
    }

    #[test]
    fn test_read_returns_queued_data_then_times_out() {
        let target = ScriptedTarget::new(64);
        target.queue_in_data(1, vec![0xAB]);

        assert_eq!(
            target.read(1, 64, Duration::from_millis(1)).unwrap(),
            Some(vec![0xAB])
        );
        assert_eq!(target.read(1, 64, Duration::from_millis(1)).unwrap(), None);
        assert_eq!(target.read_count(), 2);
    }

    #[test]
    fn test_failing_target_records_nothing() {
        let target = ScriptedTarget::new(64);
        target.set_failing(true);

        assert!(target.write(2, &[1]).is_err());
        assert!(target.writes().is_empty());
    }

    #[test]
    fn test_transfers_fail_once_released() {
        // Arrange
        let target = ScriptedTarget::new(64);
        target.push_control_response(Ok(vec![1]));

        // Act
        target.release();

        // Assert
        assert!(target.control_in(&setup(1)).is_err());
        assert!(target.write(2, &[1]).is_err());
        assert_eq!(target.release_count(), 1);
    }

    #[test]
    fn test_control_delay_holds_the_transfer() {
        let target = ScriptedTarget::new(64);
        target.push_control_response(Ok(vec![1]));
        target.set_control_delay(Duration::from_millis(20));

        let started = std::time::Instant::now();
        let data = target.control_in(&setup(1)).unwrap();

        assert_eq!(data, vec![1]);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_connector_reports_missing_device() {
        let connector = ScriptedConnector::new().with_device(0x1234, 0x5678, Arc::new(ScriptedTarget::new(8)));

        assert!(connector.open(0x1234, 0x5678).is_ok());
        assert_eq!(
            connector.open(0xdead, 0xbeef).err(),
            Some(TargetError::DeviceNotFound {
                vendor_id: 0xdead,
                product_id: 0xbeef
            })
        );
    }
}
