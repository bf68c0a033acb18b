//! Proxy engine: one session between an emulated device and a real target.
//!
//! # Overview (for beginners)
//!
//! The victim host thinks it is talking to a USB device.  In reality every
//! request it makes arrives here as a [`VictimEvent`]:
//!
//! 1. **Control IN** (e.g., GET_DESCRIPTOR) – the request is replayed against
//!    the target, the response runs through the filter chain, and the
//!    (possibly rewritten) data is returned to the victim.
//! 2. **Control OUT** (e.g., SET_CONFIGURATION) – the request runs through the
//!    filter chain first.  If a filter drops it, nothing reaches the target
//!    and the victim gets no acknowledgement.  Otherwise it is replayed and
//!    the status stage is acknowledged.
//! 3. **Bulk/interrupt OUT** – data is filtered and written to the target.
//! 4. **Buffer available** – a per-endpoint poller (see
//!    [`super::in_poller`]) reads IN data from the target and queues it on
//!    the victim side.
//!
//! # Failure containment
//!
//! A target failure while servicing a control request never ends the
//! session.  It is logged and turned into exactly one stall towards the
//! victim, which is what a real device would do with a request it cannot
//! handle.  A failed bulk write stalls that endpoint instead.
//!
//! # Concurrency
//!
//! Victim callbacks are serialized by a dispatch lock, so control requests
//! are never interleaved on endpoint 0 and OUT data reaches the target in the
//! order the victim sent it.  IN pollers run alongside, one task per
//! endpoint, sharing the filter chain behind a mutex.
//!
//! [`ProxySession::shutdown`] takes the same dispatch lock, so a control
//! transfer already in flight is answered before the target is released.
//! Events that arrive after shutdown are stalled without touching the target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};
use usbproxy_core::filter::logging::hex_dump;
use usbproxy_core::{DeviceState, Direction, Filter, FilterChain, Request};
use uuid::Uuid;

use super::in_poller::{EndpointPoller, PollerContext};
use super::target::{run_blocking, TargetConnector, TargetDevice, TargetError};
use super::victim::{TransportError, VictimEvent, VictimTransport};

/// Identifies one proxy session in log output.
pub type SessionId = Uuid;

/// Low bits of an endpoint address; the direction bit is dropped.
const ENDPOINT_NUMBER_MASK: u8 = 0x0F;

/// Errors that can end a session before it starts serving the victim.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session is shut down")]
    Closed,
}

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long one IN read waits on the target before retrying.
    pub in_poll_timeout: Duration,
    /// Maximum bytes requested per IN read.
    pub in_transfer_size: usize,
    /// Pause after a failed IN read before trying again.
    pub error_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            in_poll_timeout: Duration::from_millis(100),
            in_transfer_size: 512,
            error_backoff: Duration::from_millis(250),
        }
    }
}

/// What happened to one victim event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delivered to the target (and, for control transfers, answered).
    Forwarded,
    /// Dropped by the filter chain; the target saw nothing.
    Suppressed,
    /// The target failed and the victim was sent a stall.
    Stalled,
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub forwarded: u64,
    pub suppressed: u64,
    pub stalled: u64,
    pub bytes_to_target: u64,
    pub bytes_to_victim: u64,
}

/// Live counters, shared with the IN pollers.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    forwarded: AtomicU64,
    suppressed: AtomicU64,
    stalled: AtomicU64,
    bytes_to_target: AtomicU64,
    bytes_to_victim: AtomicU64,
}

impl SessionCounters {
    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Forwarded => &self.forwarded,
            Disposition::Suppressed => &self.suppressed,
            Disposition::Stalled => &self.stalled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_to_target(&self, bytes: usize) {
        self.bytes_to_target
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_to_victim(&self, bytes: usize) {
        self.bytes_to_victim
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            bytes_to_target: self.bytes_to_target.load(Ordering::Relaxed),
            bytes_to_victim: self.bytes_to_victim.load(Ordering::Relaxed),
        }
    }
}

/// Locks a std mutex, ignoring poisoning.
///
/// A filter that panicked mid-call leaves the chain in whatever state it was
/// in; the proxy keeps going with it rather than tearing the session down.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A running proxy between one victim transport and one target device.
pub struct ProxySession {
    id: SessionId,
    target: Arc<dyn TargetDevice>,
    transport: Arc<dyn VictimTransport>,
    filters: Arc<Mutex<FilterChain>>,
    state: Mutex<DeviceState>,
    /// Serializes victim callbacks.
    dispatch: tokio::sync::Mutex<()>,
    pollers: Mutex<HashMap<u8, EndpointPoller>>,
    cancel: watch::Sender<bool>,
    counters: Arc<SessionCounters>,
    config: SessionConfig,
}

impl ProxySession {
    /// Creates a session around an already-open target.
    pub fn new(
        target: Arc<dyn TargetDevice>,
        transport: Arc<dyn VictimTransport>,
        filters: FilterChain,
        config: SessionConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            target,
            transport,
            filters: Arc::new(Mutex::new(filters)),
            state: Mutex::new(DeviceState::Detached),
            dispatch: tokio::sync::Mutex::new(()),
            pollers: Mutex::new(HashMap::new()),
            cancel,
            counters: Arc::new(SessionCounters::default()),
            config,
        }
    }

    /// Opens the target through `connector` and creates a session for it.
    ///
    /// # Errors
    ///
    /// Returns [`TargetError::DeviceNotFound`] when no matching device is
    /// attached.  No session exists in that case.
    pub fn open(
        connector: &dyn TargetConnector,
        vendor_id: u16,
        product_id: u16,
        transport: Arc<dyn VictimTransport>,
        filters: FilterChain,
        config: SessionConfig,
    ) -> Result<Self, TargetError> {
        let target = connector.open(vendor_id, product_id)?;
        let session = Self::new(target, transport, filters, config);
        info!(
            session = %session.id,
            "opened target {vendor_id:04x}:{product_id:04x}"
        );
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        *lock_unpoisoned(&self.state)
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Names of the installed filters, in application order.
    pub fn filter_names(&self) -> Vec<String> {
        lock_unpoisoned(&self.filters)
            .names()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    /// Installs a filter while the session runs.  It sees every event
    /// dispatched after this call returns.
    pub fn add_filter<F: Filter + 'static>(&self, filter: F, at_head: bool) {
        let mut filters = lock_unpoisoned(&self.filters);
        filters.add(filter, at_head);
        debug!(session = %self.id, filters = ?filters.names(), "filter added");
    }

    /// Brings up the emulated device using the target's EP0 packet size.
    ///
    /// Leaves the session in [`DeviceState::Powered`]; enumeration by the
    /// victim happens on the transport side.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] if the emulated device could not be
    /// established.
    pub async fn connect(&self) -> Result<(), ProxyError> {
        let max_packet_size = self.target.max_control_packet_size();
        self.transport.establish_session(max_packet_size).await?;
        *lock_unpoisoned(&self.state) = DeviceState::Powered;
        info!(
            session = %self.id,
            max_packet_size, "emulated device connected"
        );
        Ok(())
    }

    /// `true` once [`shutdown`](Self::shutdown) has started.
    pub fn is_closed(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Services one control request from the victim.
    pub async fn handle_request(&self, request: Request) -> Disposition {
        let _serial = self.dispatch.lock().await;
        let summary = request.to_string();
        trace!(session = %self.id, "received {summary}");

        let result = if self.is_closed() {
            Err(ProxyError::Closed)
        } else {
            match request.direction() {
                Direction::In => self.proxy_control_in(request).await,
                Direction::Out => self.proxy_control_out(request).await,
            }
        };

        let disposition = match result {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(session = %self.id, "stalling {summary}: {e}");
                if let Err(stall_err) = self.transport.signal_stall().await {
                    error!(session = %self.id, "failed to signal stall: {stall_err}");
                }
                Disposition::Stalled
            }
        };
        self.counters.record(disposition);
        disposition
    }

    async fn proxy_control_in(&self, request: Request) -> Result<Disposition, ProxyError> {
        let setup = *request.setup();
        let data = run_blocking(&self.target, move |t| t.control_in(&setup)).await?;

        let (_, data) = lock_unpoisoned(&self.filters).apply_control_in(request, data);
        let data = data.unwrap_or_default();

        debug!(session = %self.id, "< {}", hex_dump(&data));
        self.transport.send_control_response(&data).await?;
        self.counters.add_to_victim(data.len());
        Ok(Disposition::Forwarded)
    }

    async fn proxy_control_out(&self, request: Request) -> Result<Disposition, ProxyError> {
        let payload = request.payload().to_vec();
        let (request, data) = lock_unpoisoned(&self.filters).apply_control_out(request, payload);
        let Some(request) = request else {
            debug!(session = %self.id, "control OUT suppressed by filters");
            return Ok(Disposition::Suppressed);
        };

        let data = data.unwrap_or_default();
        debug!(session = %self.id, "> {request}: {}", hex_dump(&data));
        let setup = *request.setup();
        let sent = run_blocking(&self.target, move |t| t.control_out(&setup, &data)).await?;

        self.transport.acknowledge_status_stage().await?;
        self.counters.add_to_target(sent);
        Ok(Disposition::Forwarded)
    }

    /// Forwards bulk/interrupt OUT data from the victim to the target.
    pub async fn handle_data_available(&self, endpoint: u8, data: Vec<u8>) -> Disposition {
        let _serial = self.dispatch.lock().await;
        trace!(session = %self.id, endpoint, "received {} OUT bytes", data.len());

        if self.is_closed() {
            warn!(session = %self.id, endpoint, "OUT data after shutdown, stalling endpoint");
            self.stall_endpoint(endpoint).await;
            self.counters.record(Disposition::Stalled);
            return Disposition::Stalled;
        }

        let (endpoint, data) = lock_unpoisoned(&self.filters).apply_data_out(endpoint, data);
        let disposition = match data.filter(|d| !d.is_empty()) {
            None => {
                debug!(session = %self.id, endpoint, "OUT data dropped by filters");
                Disposition::Suppressed
            }
            Some(data) => self.write_to_target(endpoint, data).await,
        };
        self.counters.record(disposition);
        disposition
    }

    async fn write_to_target(&self, endpoint: u8, data: Vec<u8>) -> Disposition {
        debug!(session = %self.id, endpoint, "> {}", hex_dump(&data));
        let len = data.len();
        match run_blocking(&self.target, move |t| t.write(endpoint, &data)).await {
            Ok(()) => {
                self.counters.add_to_target(len);
                Disposition::Forwarded
            }
            Err(e) => {
                warn!(session = %self.id, endpoint, "stalling endpoint: {e}");
                self.stall_endpoint(endpoint).await;
                Disposition::Stalled
            }
        }
    }

    async fn stall_endpoint(&self, endpoint: u8) {
        if let Err(e) = self.transport.stall_endpoint(endpoint).await {
            error!(session = %self.id, endpoint, "failed to stall endpoint: {e}");
        }
    }

    /// Wakes (or starts) the IN poller for `endpoint`.
    ///
    /// Accepts either the endpoint number or its IN address: `0x81` and `1`
    /// name the same poller.
    pub async fn handle_buffer_available(&self, endpoint: u8) {
        let endpoint = endpoint & ENDPOINT_NUMBER_MASK;
        let mut pollers = lock_unpoisoned(&self.pollers);
        if self.is_closed() {
            debug!(session = %self.id, endpoint, "buffer signal after shutdown ignored");
            return;
        }
        if let Some(poller) = pollers.get(&endpoint) {
            if !poller.is_finished() {
                poller.buffer_available();
                return;
            }
            warn!(session = %self.id, endpoint, "IN poller exited, restarting");
        }

        let poller = EndpointPoller::spawn(self.poller_context(), endpoint);
        poller.buffer_available();
        pollers.insert(endpoint, poller);
    }

    fn poller_context(&self) -> PollerContext {
        PollerContext {
            session: self.id,
            target: Arc::clone(&self.target),
            transport: Arc::clone(&self.transport),
            filters: Arc::clone(&self.filters),
            counters: Arc::clone(&self.counters),
            cancel: self.cancel.subscribe(),
            transfer_size: self.config.in_transfer_size,
            poll_timeout: self.config.in_poll_timeout,
            error_backoff: self.config.error_backoff,
        }
    }

    /// Dispatches victim events until the sending side closes or the session
    /// shuts down.  An event already being handled is finished first.
    pub async fn run(&self, mut events: mpsc::Receiver<VictimEvent>) {
        info!(session = %self.id, "proxying");
        let mut cancel = self.cancel.subscribe();
        loop {
            if self.is_closed() {
                break;
            }
            let event = tokio::select! {
                biased;
                _ = cancel.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                VictimEvent::ControlRequest(request) => {
                    self.handle_request(request).await;
                }
                VictimEvent::DataAvailable { endpoint, data } => {
                    self.handle_data_available(endpoint, data).await;
                }
                VictimEvent::BufferAvailable { endpoint } => {
                    self.handle_buffer_available(endpoint).await;
                }
            }
        }
        debug!(session = %self.id, "event loop stopped");
    }

    /// Stops all pollers, waits for any in-flight control transfer and
    /// releases the target.  Returns the final counters.
    ///
    /// Only the first call releases the target; later calls just report the
    /// counters.
    pub async fn shutdown(&self) -> SessionStats {
        if self.cancel.send_replace(true) {
            return self.stats();
        }
        info!(session = %self.id, "shutting down");

        let pollers: Vec<EndpointPoller> = lock_unpoisoned(&self.pollers)
            .drain()
            .map(|(_, poller)| poller)
            .collect();
        for poller in pollers {
            poller.join().await;
        }

        let _serial = self.dispatch.lock().await;
        self.target.release();
        *lock_unpoisoned(&self.state) = DeviceState::Detached;

        let stats = self.stats();
        info!(
            session = %self.id,
            forwarded = stats.forwarded,
            suppressed = stats.suppressed,
            stalled = stats.stalled,
            bytes_to_target = stats.bytes_to_target,
            bytes_to_victim = stats.bytes_to_victim,
            "session closed"
        );
        stats
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::target::MockTargetDevice;
    use async_trait::async_trait;
    use usbproxy_core::filter::descriptor::descriptor_type;
    use usbproxy_core::filter::{DescriptorOverrideFilter, RequestMatcher, SuppressControlOutFilter};

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Established(u8),
        ControlResponse(Vec<u8>),
        StatusAck,
        Stall,
        EndpointStall(u8),
        Data(u8, Vec<u8>),
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        fn push(&self, item: Sent) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(item);
            Ok(())
        }
    }

    #[async_trait]
    impl VictimTransport for RecordingTransport {
        async fn establish_session(&self, max_packet_size: u8) -> Result<(), TransportError> {
            self.push(Sent::Established(max_packet_size))
        }
        async fn send_control_response(&self, data: &[u8]) -> Result<(), TransportError> {
            self.push(Sent::ControlResponse(data.to_vec()))
        }
        async fn acknowledge_status_stage(&self) -> Result<(), TransportError> {
            self.push(Sent::StatusAck)
        }
        async fn signal_stall(&self) -> Result<(), TransportError> {
            self.push(Sent::Stall)
        }
        async fn stall_endpoint(&self, endpoint: u8) -> Result<(), TransportError> {
            self.push(Sent::EndpointStall(endpoint))
        }
        async fn send_data(&self, endpoint: u8, data: &[u8]) -> Result<(), TransportError> {
            self.push(Sent::Data(endpoint, data.to_vec()))
        }
    }

    fn make_session(
        target: MockTargetDevice,
        filters: FilterChain,
    ) -> (ProxySession, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let session = ProxySession::new(
            Arc::new(target),
            Arc::clone(&transport) as Arc<dyn VictimTransport>,
            filters,
            SessionConfig::default(),
        );
        (session, transport)
    }

    fn get_device_descriptor(len: u16) -> Request {
        Request::control_in(0x80, 0x06, 0x0100, 0, len)
    }

    fn set_configuration(value: u16) -> Request {
        Request::control_out(0x00, 0x09, value, 0, Vec::new())
    }

    // ── connect ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_uses_target_ep0_packet_size_and_powers_up() {
        // Arrange
        let mut target = MockTargetDevice::new();
        target.expect_max_control_packet_size().return_const(64u8);
        let (session, transport) = make_session(target, FilterChain::new());
        assert_eq!(session.state(), DeviceState::Detached);

        // Act
        session.connect().await.unwrap();

        // Assert
        assert_eq!(transport.sent(), vec![Sent::Established(64)]);
        assert_eq!(session.state(), DeviceState::Powered);
    }

    // ── control IN ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_control_in_returns_target_response_to_victim() {
        // Arrange
        let mut target = MockTargetDevice::new();
        target
            .expect_control_in()
            .withf(|setup| setup.w_value == 0x0100 && setup.w_length == 18)
            .times(1)
            .returning(|_| Ok(vec![0x12, 0x01, 0x00, 0x02]));
        let (session, transport) = make_session(target, FilterChain::new());

        // Act
        let disposition = session.handle_request(get_device_descriptor(18)).await;

        // Assert
        assert_eq!(disposition, Disposition::Forwarded);
        assert_eq!(
            transport.sent(),
            vec![Sent::ControlResponse(vec![0x12, 0x01, 0x00, 0x02])]
        );
        assert_eq!(session.stats().bytes_to_victim, 4);
    }

    #[tokio::test]
    async fn test_control_in_response_is_rewritten_by_filters() {
        let mut target = MockTargetDevice::new();
        target
            .expect_control_in()
            .returning(|_| Ok(vec![0x12, 0x01, 0x00, 0x02]));
        let mut filters = FilterChain::new();
        filters.add(
            DescriptorOverrideFilter::new(descriptor_type::DEVICE, 0, vec![0xAA, 0xBB]),
            false,
        );
        let (session, transport) = make_session(target, filters);

        session.handle_request(get_device_descriptor(18)).await;

        assert_eq!(transport.sent(), vec![Sent::ControlResponse(vec![0xAA, 0xBB])]);
    }

    #[tokio::test]
    async fn test_target_failure_stalls_once_and_session_keeps_serving() {
        // Arrange: first request fails, second succeeds.
        let mut target = MockTargetDevice::new();
        let mut calls = 0;
        target.expect_control_in().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(TargetError::Communication("pipe error".into()))
            } else {
                Ok(vec![0x01])
            }
        });
        let (session, transport) = make_session(target, FilterChain::new());

        // Act
        let first = session.handle_request(get_device_descriptor(1)).await;
        let second = session.handle_request(get_device_descriptor(1)).await;

        // Assert
        assert_eq!(first, Disposition::Stalled);
        assert_eq!(second, Disposition::Forwarded);
        assert_eq!(
            transport.sent(),
            vec![Sent::Stall, Sent::ControlResponse(vec![0x01])]
        );
        let stats = session.stats();
        assert_eq!((stats.stalled, stats.forwarded), (1, 1));
    }

    // ── control OUT ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_control_out_is_replayed_then_acknowledged() {
        let mut target = MockTargetDevice::new();
        target
            .expect_control_out()
            .withf(|setup, data| setup.b_request == 0x09 && setup.w_value == 1 && data.is_empty())
            .times(1)
            .returning(|_, data| Ok(data.len()));
        let (session, transport) = make_session(target, FilterChain::new());

        let disposition = session.handle_request(set_configuration(1)).await;

        assert_eq!(disposition, Disposition::Forwarded);
        assert_eq!(transport.sent(), vec![Sent::StatusAck]);
    }

    #[tokio::test]
    async fn test_suppressed_control_out_never_reaches_target_and_is_not_acked() {
        // Arrange
        let mut target = MockTargetDevice::new();
        target.expect_control_out().never();
        let mut filters = FilterChain::new();
        filters.add(
            SuppressControlOutFilter::new(RequestMatcher {
                request: Some(0x09),
                ..RequestMatcher::default()
            }),
            false,
        );
        let (session, transport) = make_session(target, filters);

        // Act
        let disposition = session.handle_request(set_configuration(1)).await;

        // Assert
        assert_eq!(disposition, Disposition::Suppressed);
        assert!(transport.sent().is_empty());
        assert_eq!(session.stats().suppressed, 1);
    }

    #[tokio::test]
    async fn test_control_out_failure_stalls_without_ack() {
        let mut target = MockTargetDevice::new();
        target
            .expect_control_out()
            .returning(|_, _| Err(TargetError::Communication("no such device".into())));
        let (session, transport) = make_session(target, FilterChain::new());

        let disposition = session.handle_request(set_configuration(2)).await;

        assert_eq!(disposition, Disposition::Stalled);
        assert_eq!(transport.sent(), vec![Sent::Stall]);
    }

    // ── bulk/interrupt OUT ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_data_out_is_written_to_target() {
        let mut target = MockTargetDevice::new();
        target
            .expect_write()
            .withf(|endpoint, data| *endpoint == 2 && data == [1, 2, 3])
            .times(1)
            .returning(|_, _| Ok(()));
        let (session, _transport) = make_session(target, FilterChain::new());

        let disposition = session.handle_data_available(2, vec![1, 2, 3]).await;

        assert_eq!(disposition, Disposition::Forwarded);
        assert_eq!(session.stats().bytes_to_target, 3);
    }

    #[tokio::test]
    async fn test_empty_data_out_is_not_written() {
        let mut target = MockTargetDevice::new();
        target.expect_write().never();
        let (session, _transport) = make_session(target, FilterChain::new());

        let disposition = session.handle_data_available(2, Vec::new()).await;

        assert_eq!(disposition, Disposition::Suppressed);
    }

    #[tokio::test]
    async fn test_failed_data_out_stalls_that_endpoint() {
        let mut target = MockTargetDevice::new();
        target
            .expect_write()
            .returning(|_, _| Err(TargetError::Communication("timed out".into())));
        let (session, transport) = make_session(target, FilterChain::new());

        let disposition = session.handle_data_available(1, vec![0xFF]).await;

        assert_eq!(disposition, Disposition::Stalled);
        assert_eq!(transport.sent(), vec![Sent::EndpointStall(1)]);
    }

    // ── filters at runtime ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_filter_added_while_running_applies_to_later_requests() {
        let mut target = MockTargetDevice::new();
        target
            .expect_control_out()
            .times(1)
            .returning(|_, data| Ok(data.len()));
        let (session, _transport) = make_session(target, FilterChain::new());

        let before = session.handle_request(set_configuration(1)).await;
        session.add_filter(SuppressControlOutFilter::new(RequestMatcher::default()), true);
        let after = session.handle_request(set_configuration(1)).await;

        assert_eq!(before, Disposition::Forwarded);
        assert_eq!(after, Disposition::Suppressed);
        assert_eq!(session.filter_names(), vec!["suppress_control_out"]);
    }

    // ── shutdown ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_shutdown_releases_target_and_reports_stats() {
        let mut target = MockTargetDevice::new();
        target.expect_write().returning(|_, _| Ok(()));
        target.expect_release().times(1).return_const(());
        let (session, _transport) = make_session(target, FilterChain::new());
        session.handle_data_available(3, vec![0; 8]).await;

        let stats = session.shutdown().await;

        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.bytes_to_target, 8);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_in_pollers() {
        let mut target = MockTargetDevice::new();
        target.expect_read().returning(|_, _, _| Ok(None));
        target.expect_release().times(1).return_const(());
        let (session, _transport) = make_session(target, FilterChain::new());
        session.handle_buffer_available(1).await;

        // Completes only if the poller observes cancellation.
        let stats = session.shutdown().await;

        assert_eq!(stats.bytes_to_victim, 0);
    }

    #[tokio::test]
    async fn test_second_shutdown_does_not_release_again() {
        let mut target = MockTargetDevice::new();
        target.expect_release().times(1).return_const(());
        let (session, _transport) = make_session(target, FilterChain::new());

        session.shutdown().await;
        session.shutdown().await;

        assert!(session.is_closed());
        assert_eq!(session.state(), DeviceState::Detached);
    }

    #[tokio::test]
    async fn test_events_after_shutdown_stall_without_touching_target() {
        // Arrange
        let mut target = MockTargetDevice::new();
        target.expect_control_in().never();
        target.expect_write().never();
        target.expect_read().never();
        target.expect_release().times(1).return_const(());
        let (session, transport) = make_session(target, FilterChain::new());
        session.shutdown().await;

        // Act
        let control = session.handle_request(get_device_descriptor(18)).await;
        let data = session.handle_data_available(2, vec![0x01]).await;
        session.handle_buffer_available(1).await;

        // Assert
        assert_eq!(control, Disposition::Stalled);
        assert_eq!(data, Disposition::Stalled);
        assert_eq!(transport.sent(), vec![Sent::Stall, Sent::EndpointStall(2)]);
        assert!(lock_unpoisoned(&session.pollers).is_empty());
        assert_eq!(session.stats().stalled, 2);
    }

    #[tokio::test]
    async fn test_run_returns_on_shutdown_while_sender_is_open() {
        // Arrange
        let mut target = MockTargetDevice::new();
        target.expect_release().times(1).return_const(());
        let (session, _transport) = make_session(target, FilterChain::new());
        let (_tx, rx) = mpsc::channel::<VictimEvent>(4);

        // Act: completes only if the loop observes cancellation.
        let ((), stats) = tokio::join!(session.run(rx), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            session.shutdown().await
        });

        // Assert
        assert_eq!(stats, SessionStats::default());
    }

    #[tokio::test]
    async fn test_buffer_signal_for_in_address_shares_the_endpoint_poller() {
        // Arrange
        let mut target = MockTargetDevice::new();
        let mut served = false;
        target
            .expect_read()
            .withf(|endpoint, _, _| *endpoint == 2)
            .returning(move |_, _, _| {
                if std::mem::replace(&mut served, true) {
                    Ok(None)
                } else {
                    Ok(Some(vec![0x55]))
                }
            });
        target.expect_release().times(1).return_const(());
        let (session, transport) = make_session(target, FilterChain::new());

        // Act
        session.handle_buffer_available(0x82).await;
        session.handle_buffer_available(2).await;
        for _ in 0..400 {
            if !transport.sent().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Assert
        assert_eq!(transport.sent(), vec![Sent::Data(2, vec![0x55])]);
        assert_eq!(lock_unpoisoned(&session.pollers).len(), 1);
        session.shutdown().await;
    }
}
