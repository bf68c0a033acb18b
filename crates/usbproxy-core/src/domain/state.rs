//! Device state marker for a proxy session.
//!
//! USB 2.0 §9.1 defines the visible device states.  A proxy session only
//! drives `Detached -> Powered` itself; attachment and configuration are
//! signaled by the emulated-device transport and are opaque to the proxy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The device state as exposed to the victim host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceState {
    #[default]
    Detached,
    Powered,
    Attached,
    Configured,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Detached => "detached",
            DeviceState::Powered => "powered",
            DeviceState::Attached => "attached",
            DeviceState::Configured => "configured",
        };
        f.write_str(name)
    }
}
