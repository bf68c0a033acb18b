//! usbproxy entry point.
//!
//! Opens a real USB device, brings up an emulated device in front of it, and
//! relays every transfer between the two through the configured filter
//! chain until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! usbproxy [OPTIONS]
//!
//! Options:
//!   --vendor-id <ID>          Target vendor id, hex (0x1d50) or decimal
//!   --product-id <ID>         Target product id, hex (0x6089) or decimal
//!   --config <PATH>           Config file [default: platform config dir]
//!   -v, --verbose...          More log output (-v debug, -vv trace)
//!   --poll-timeout-ms <MS>    IN endpoint poll timeout
//! ```
//!
//! Command-line values override the config file.  `RUST_LOG`, when set,
//! overrides the verbosity entirely.
//!
//! # Architecture overview
//!
//! ```text
//! victim host ⇄ emulated-device backend
//!                    ⇅  VictimCommand / VictimEvent channels
//!              ProxySession ── FilterChain
//!                    ⇅  spawn_blocking
//!              RusbTarget (libusb) ⇄ real device
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use usbproxy::application::proxy_session::ProxySession;
use usbproxy::application::victim::VictimEvent;
use usbproxy::infrastructure::storage::config::{load_config, load_config_from, ProxyConfig};
use usbproxy::infrastructure::target::RusbConnector;
use usbproxy::infrastructure::victim::{ChannelTransport, VictimCommand};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Transparent USB proxy.
#[derive(Debug, Parser)]
#[command(
    name = "usbproxy",
    about = "Relays USB traffic between an emulated device and a real one",
    version
)]
struct Cli {
    /// Vendor id of the device to proxy.
    #[arg(long, value_parser = parse_device_id, env = "USBPROXY_VENDOR_ID")]
    vendor_id: Option<u16>,

    /// Product id of the device to proxy.
    #[arg(long, value_parser = parse_device_id, env = "USBPROXY_PRODUCT_ID")]
    product_id: Option<u16>,

    /// Path to the TOML config file.
    #[arg(long, env = "USBPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// How long each IN endpoint read waits on the target, in milliseconds.
    #[arg(long, env = "USBPROXY_POLL_TIMEOUT_MS")]
    poll_timeout_ms: Option<u64>,
}

/// Accepts `0x`-prefixed hex or plain decimal.
fn parse_device_id(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid device id '{s}': {e}"))
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    fn into_proxy_config(self) -> anyhow::Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_from(path)
                .with_context(|| format!("failed to load config from '{}'", path.display()))?,
            None => load_config().context("failed to load config")?,
        };

        if self.vendor_id.is_some() {
            config.target.vendor_id = self.vendor_id;
        }
        if self.product_id.is_some() {
            config.target.product_id = self.product_id;
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.session.in_poll_timeout_ms = ms;
        }
        if self.verbose > 0 {
            config.logging.verbosity = self.verbose;
        }
        Ok(config)
    }
}

fn log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Stand-in for the emulated-device backend: logs what the proxy asks of it
/// and keeps the event channel open until the proxy shuts down.
async fn drain_backend_commands(
    mut commands: mpsc::Receiver<VictimCommand>,
    _events: mpsc::Sender<VictimEvent>,
) {
    while let Some(command) = commands.recv().await {
        debug!(?command, "backend command");
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_proxy_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level(config.logging.verbosity))),
        )
        .init();

    let (vendor_id, product_id) = config.target_ids()?;
    let depth = config.session.event_queue_depth.max(1);
    let (transport, commands) = ChannelTransport::new(depth);
    let (events_tx, events_rx) = mpsc::channel(depth);

    let connector = RusbConnector::new(config.transfer_timeout());
    let session = ProxySession::open(
        &connector,
        vendor_id,
        product_id,
        Arc::new(transport),
        config.build_filter_chain(),
        config.session_config(),
    )
    .with_context(|| format!("failed to open target {vendor_id:04x}:{product_id:04x}"))?;

    let session = Arc::new(session);
    let backend = tokio::spawn(drain_backend_commands(commands, events_tx));
    session
        .connect()
        .await
        .context("failed to bring up the emulated device")?;

    // Never dropped mid-event: shutdown waits for the event being handled.
    let mut event_loop = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run(events_rx).await }
    });

    tokio::select! {
        _ = &mut event_loop => info!("victim backend disconnected"),
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        },
    }

    session.shutdown().await;
    if !event_loop.is_finished() {
        if let Err(e) = event_loop.await {
            error!("event loop task failed: {e}");
        }
    }
    backend.abort();
    info!("usbproxy stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
