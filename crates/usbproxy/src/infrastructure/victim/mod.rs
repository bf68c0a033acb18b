//! Victim-transport adapters.
//!
//! - [`channel`] – forwards every transport call as a [`VictimCommand`] to an
//!   emulated-device backend over a Tokio channel.
//! - [`mock`]    – records commands in memory for tests.

pub mod channel;
pub mod mock;

pub use channel::{ChannelTransport, VictimCommand};
pub use mock::RecordingTransport;
