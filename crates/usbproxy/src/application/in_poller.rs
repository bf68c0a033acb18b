//! Per-endpoint IN pollers.
//!
//! Each bulk/interrupt IN endpoint the victim has signalled a free buffer for
//! gets one background task.  The task waits for the buffer signal, reads from
//! the target until it has data, runs the data through the filter chain and
//! hands it to the victim transport.  Because one task owns one endpoint, data
//! reaches the victim in the order the target produced it.
//!
//! Timeouts on the target read mean "nothing yet" and are retried silently.
//! Target errors are logged and retried after a backoff so a device that
//! misbehaves for a moment does not take the session down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use usbproxy_core::filter::logging::hex_dump;
use usbproxy_core::FilterChain;

use super::proxy_session::{lock_unpoisoned, SessionCounters, SessionId};
use super::target::{run_blocking, TargetDevice};
use super::victim::VictimTransport;

/// Everything a poller task needs, cloned out of the owning session.
pub(crate) struct PollerContext {
    pub session: SessionId,
    pub target: Arc<dyn TargetDevice>,
    pub transport: Arc<dyn VictimTransport>,
    pub filters: Arc<Mutex<FilterChain>>,
    pub counters: Arc<SessionCounters>,
    pub cancel: watch::Receiver<bool>,
    pub transfer_size: usize,
    pub poll_timeout: Duration,
    pub error_backoff: Duration,
}

/// Handle to a running poller task for one IN endpoint.
#[derive(Debug)]
pub struct EndpointPoller {
    endpoint: u8,
    ready: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl EndpointPoller {
    /// Spawns the poller task.  It stays idle until the first
    /// [`buffer_available`](Self::buffer_available).
    pub(crate) fn spawn(ctx: PollerContext, endpoint: u8) -> Self {
        let ready = Arc::new(Notify::new());
        let handle = tokio::spawn(poll_endpoint(ctx, endpoint, Arc::clone(&ready)));
        Self {
            endpoint,
            ready,
            handle,
        }
    }

    /// Tells the poller the victim can accept one more transfer.
    ///
    /// Signals that arrive while the poller is still filling the previous
    /// buffer are coalesced into one.
    pub fn buffer_available(&self) {
        self.ready.notify_one();
    }

    /// `true` once the task has exited (cancelled or panicked).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task to exit.  The caller must have cancelled it first.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(endpoint = self.endpoint, "IN poller task failed: {e}");
        }
    }
}

async fn poll_endpoint(mut ctx: PollerContext, endpoint: u8, ready: Arc<Notify>) {
    debug!(session = %ctx.session, endpoint, "IN poller started");
    loop {
        tokio::select! {
            _ = ready.notified() => {}
            _ = ctx.cancel.changed() => break,
        }
        if !fill_buffer(&mut ctx, endpoint).await {
            break;
        }
    }
    debug!(session = %ctx.session, endpoint, "IN poller stopped");
}

/// Reads from the target until one non-empty transfer has been handed to the
/// victim.  Returns `false` when the session is shutting down.
async fn fill_buffer(ctx: &mut PollerContext, endpoint: u8) -> bool {
    loop {
        if *ctx.cancel.borrow() {
            return false;
        }

        let (length, timeout) = (ctx.transfer_size, ctx.poll_timeout);
        match run_blocking(&ctx.target, move |t| t.read(endpoint, length, timeout)).await {
            Ok(Some(data)) if !data.is_empty() => match deliver(ctx, endpoint, data).await {
                Delivery::Consumed => return true,
                Delivery::Dropped => {}
                Delivery::Cancelled => return false,
            },
            // Timeout or zero-length packet: nothing for the victim yet.
            Ok(_) => {}
            Err(e) => {
                warn!(session = %ctx.session, endpoint, "IN read failed, retrying: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.error_backoff) => {}
                    _ = ctx.cancel.changed() => return false,
                }
            }
        }
    }
}

/// Outcome of handing one chunk to the victim.
enum Delivery {
    /// The victim buffer was used (or the send failed and was logged).
    Consumed,
    /// The filters dropped the chunk; the buffer is still free.
    Dropped,
    /// The session shut down while the send was waiting on the transport.
    Cancelled,
}

/// Filters one chunk and sends it to the victim.
async fn deliver(ctx: &mut PollerContext, endpoint: u8, data: Vec<u8>) -> Delivery {
    let (endpoint, data) = lock_unpoisoned(&ctx.filters).apply_data_in(endpoint, data);
    let Some(data) = data.filter(|d| !d.is_empty()) else {
        trace!(session = %ctx.session, endpoint, "IN data dropped by filters");
        return Delivery::Dropped;
    };

    trace!(session = %ctx.session, endpoint, "< {}", hex_dump(&data));
    let sent = tokio::select! {
        sent = ctx.transport.send_data(endpoint, &data) => sent,
        _ = ctx.cancel.changed() => {
            debug!(session = %ctx.session, endpoint, "IN delivery abandoned at shutdown");
            return Delivery::Cancelled;
        }
    };
    match sent {
        Ok(()) => ctx.counters.add_to_victim(data.len()),
        Err(e) => error!(session = %ctx.session, endpoint, "failed to queue IN data: {e}"),
    }
    Delivery::Consumed
}
