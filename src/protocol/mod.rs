//! Command protocols layered on the backends
//!
//! - `mailbox` - SMU mailbox handshake over SMN registers
//! - `firmware` - WMI BIOS command envelope with legacy fallback
//! - `firmware_transport` - Transports the firmware adapter speaks through
//! - `service_proxy` - Vendor background service bridge
//! - `throttle` - Coalescing of repeated failure log lines
//!
//! All adapters walk the same state machine per command:
//! `Idle -> Sending -> AwaitingResponse -> Completed | TimedOut | Rejected`.

pub mod firmware;
pub mod firmware_transport;
pub mod mailbox;
pub mod service_proxy;
pub mod throttle;

pub use firmware::{FirmwareCommandProtocol, FirmwareResponse, ThermalPolicyVersion, WireFormat};
pub use firmware_transport::{
    DeviceFileTransport, EmbeddedRequest, FirmwareTransport, RawFirmwareResponse, TransportError,
};
pub use mailbox::{MailboxLayout, MailboxProtocol, MailboxResponse, MailboxStatus};
pub use service_proxy::{
    BridgeMethod, ServiceBridge, ServiceProbe, ServiceProxyProtocol, SysinfoServiceProbe, UnixSocketBridge,
};
pub use throttle::LogThrottle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Per-command protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolState {
    #[default]
    Idle,
    Sending,
    AwaitingResponse,
    Completed,
    TimedOut,
    Rejected,
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Rejected)
    }
}

/// Last observed state of an adapter, for status display
#[derive(Debug, Default)]
pub(crate) struct StateCell {
    state: Mutex<ProtocolState>,
}

impl StateCell {
    pub(crate) fn set(&self, adapter: &'static str, next: ProtocolState) {
        let mut state = self.state.lock();
        trace!(adapter, from = ?*state, to = ?next, "Protocol state");
        *state = next;
    }

    pub(crate) fn get(&self) -> ProtocolState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ProtocolState::Idle.is_terminal());
        assert!(!ProtocolState::AwaitingResponse.is_terminal());
        assert!(ProtocolState::TimedOut.is_terminal());
        assert!(ProtocolState::Rejected.is_terminal());
    }

    #[test]
    fn test_state_cell() {
        let cell = StateCell::default();
        assert_eq!(cell.get(), ProtocolState::Idle);
        cell.set("test", ProtocolState::Sending);
        assert_eq!(cell.get(), ProtocolState::Sending);
    }
}
