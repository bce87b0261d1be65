//! SMU mailbox protocol
//!
//! The mailbox is three SMN register windows: message, response and six
//! argument slots. One message at a time may be in flight across the whole
//! process, so every exchange takes the mailbox lock (bounded wait, `Busy`
//! on expiry) and then runs as a single backend transaction.
//!
//! Exchange:
//! 1. clear the response register, confirming it reads back zero
//! 2. write the arguments, then the message id
//! 3. poll the response register until it is non-zero
//! 4. on `Ok`, read the argument slots back
//!
//! Polling is bounded by an iteration count, not wall-clock time. A read
//! error while polling consumes one iteration.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProtocolState, StateCell};
use crate::backend::{BackendHandle, BackendSelector, SmnAddress};
use crate::constants::smu;
use crate::error::{OmenError, Result};

/// Register windows of one SMU mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxLayout {
    pub name: &'static str,
    message: SmnAddress,
    response: SmnAddress,
    args: [SmnAddress; smu::ARG_COUNT],
}

const fn arg_window(base: u32) -> [SmnAddress; smu::ARG_COUNT] {
    [
        SmnAddress::allowlisted(base),
        SmnAddress::allowlisted(base + 4),
        SmnAddress::allowlisted(base + 8),
        SmnAddress::allowlisted(base + 12),
        SmnAddress::allowlisted(base + 16),
        SmnAddress::allowlisted(base + 20),
    ]
}

impl MailboxLayout {
    /// MP1 on Renoir and later
    pub const MP1_RENOIR: Self = Self {
        name: "mp1",
        message: SmnAddress::allowlisted(0x03B1_0528),
        response: SmnAddress::allowlisted(0x03B1_0578),
        args: arg_window(0x03B1_0998),
    };

    /// MP1 on Raven Ridge and Picasso
    pub const MP1_RAVEN: Self = Self {
        name: "mp1-raven",
        message: SmnAddress::allowlisted(0x03B1_0528),
        response: SmnAddress::allowlisted(0x03B1_0564),
        args: arg_window(0x03B1_0998),
    };

    /// PSMU mailbox
    pub const PSMU: Self = Self {
        name: "psmu",
        message: SmnAddress::allowlisted(0x03B1_0A20),
        response: SmnAddress::allowlisted(0x03B1_0A80),
        args: arg_window(0x03B1_0A88),
    };

    pub fn message(&self) -> SmnAddress {
        self.message
    }

    pub fn response(&self) -> SmnAddress {
        self.response
    }

    pub fn arg(&self, index: usize) -> Option<SmnAddress> {
        self.args.get(index).copied()
    }
}

/// Response register outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxStatus {
    Ok,
    Failed,
    UnknownCmd,
    CmdRejectedPrereq,
    CmdRejectedBusy,
    /// Any other non-zero response value
    Bad(u32),
    /// Poll budget exhausted
    Timeout,
}

impl MailboxStatus {
    pub fn from_response(value: u32) -> Self {
        match value {
            smu::RESPONSE_OK => Self::Ok,
            smu::RESPONSE_FAILED => Self::Failed,
            smu::RESPONSE_UNKNOWN_CMD => Self::UnknownCmd,
            smu::RESPONSE_REJECTED_PREREQ => Self::CmdRejectedPrereq,
            smu::RESPONSE_REJECTED_BUSY => Self::CmdRejectedBusy,
            other => Self::Bad(other),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    fn code(&self) -> u32 {
        match self {
            Self::Ok => smu::RESPONSE_OK,
            Self::Failed => smu::RESPONSE_FAILED,
            Self::UnknownCmd => smu::RESPONSE_UNKNOWN_CMD,
            Self::CmdRejectedPrereq => smu::RESPONSE_REJECTED_PREREQ,
            Self::CmdRejectedBusy => smu::RESPONSE_REJECTED_BUSY,
            Self::Bad(code) => *code,
            Self::Timeout => 0,
        }
    }
}

/// Final status plus the argument slots as the SMU left them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxResponse {
    pub status: MailboxStatus,
    pub args: [u32; smu::ARG_COUNT],
}

impl MailboxResponse {
    /// Map non-`Ok` statuses to typed errors
    pub fn into_result(self, layout: &MailboxLayout, message_id: u32) -> Result<[u32; smu::ARG_COUNT]> {
        match self.status {
            MailboxStatus::Ok => Ok(self.args),
            MailboxStatus::Timeout => Err(OmenError::ProtocolTimeout(format!(
                "{} message {:#x} got no response",
                layout.name, message_id
            ))),
            status => Err(OmenError::ProtocolRejected {
                source_name: layout.name.to_string(),
                status: status.code(),
                reason: format!("{:?}", status),
            }),
        }
    }
}

pub struct MailboxProtocol {
    selector: Arc<BackendSelector>,
    layout: MailboxLayout,
    lock: Mutex<()>,
    lock_timeout: Duration,
    poll_budget: u32,
    state: StateCell,
}

impl MailboxProtocol {
    pub fn new(selector: Arc<BackendSelector>, layout: MailboxLayout) -> Self {
        Self {
            selector,
            layout,
            lock: Mutex::new(()),
            lock_timeout: smu::LOCK_TIMEOUT,
            poll_budget: smu::POLL_BUDGET,
            state: StateCell::default(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_poll_budget(mut self, budget: u32) -> Self {
        self.poll_budget = budget.max(1);
        self
    }

    pub fn layout(&self) -> &MailboxLayout {
        &self.layout
    }

    pub fn state(&self) -> ProtocolState {
        self.state.get()
    }

    /// Send one message with up to six arguments
    ///
    /// Returns `Busy` if the mailbox lock cannot be taken in time and
    /// `BackendUnavailable` / `IoFailure` for backend problems. Protocol-level
    /// outcomes, including an exhausted poll budget, come back as the
    /// response status.
    pub fn send_msg(&self, message_id: u32, args: &[u32]) -> Result<MailboxResponse> {
        if args.len() > smu::ARG_COUNT {
            return Err(OmenError::invalid_input(
                "mailbox args",
                format!("{} arguments, at most {}", args.len(), smu::ARG_COUNT),
            ));
        }

        let _guard = self
            .lock
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| OmenError::Busy(format!("{} mailbox", self.layout.name)))?;

        self.state.set(self.layout.name, ProtocolState::Sending);
        let result = self
            .selector
            .with_handle(|handle| self.exchange(handle, message_id, args));

        let next = match &result {
            Ok(r) if r.status.is_ok() => ProtocolState::Completed,
            Ok(r) if r.status == MailboxStatus::Timeout => ProtocolState::TimedOut,
            Ok(_) => ProtocolState::Rejected,
            Err(_) => ProtocolState::Idle,
        };
        self.state.set(self.layout.name, next);

        match &result {
            Ok(r) if !r.status.is_ok() => {
                warn!(mailbox = self.layout.name, message = format!("{:#x}", message_id), status = ?r.status, "SMU message not accepted");
            }
            Ok(_) => debug!(mailbox = self.layout.name, message = format!("{:#x}", message_id), "SMU message completed"),
            Err(e) => warn!(mailbox = self.layout.name, error = %e, "SMU exchange failed"),
        }
        result
    }

    fn exchange(&self, handle: &mut BackendHandle, message_id: u32, args: &[u32]) -> Result<MailboxResponse> {
        let layout = &self.layout;
        let timed_out = MailboxResponse {
            status: MailboxStatus::Timeout,
            args: [0; smu::ARG_COUNT],
        };

        if !self.clear_response(handle)? {
            return Ok(timed_out);
        }

        for (slot, value) in layout.args.iter().zip(args.iter().chain(std::iter::repeat(&0))) {
            handle.write_smn(*slot, *value)?;
        }
        handle.write_smn(layout.message, message_id)?;
        self.state.set(layout.name, ProtocolState::AwaitingResponse);

        let Some(response) = self.poll_response(handle) else {
            return Ok(timed_out);
        };
        let status = MailboxStatus::from_response(response);

        let mut out = [0u32; smu::ARG_COUNT];
        if status.is_ok() {
            for (slot, value) in layout.args.iter().zip(out.iter_mut()) {
                *value = handle.read_smn(slot.as_read_only())?;
            }
        }
        Ok(MailboxResponse { status, args: out })
    }

    /// Write zero to the response register until it reads back zero
    fn clear_response(&self, handle: &mut BackendHandle) -> Result<bool> {
        for _ in 0..self.poll_budget {
            handle.write_smn(self.layout.response, 0)?;
            if matches!(handle.read_smn(self.layout.response.as_read_only()), Ok(0)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Poll until the response register reads `1`
    ///
    /// A rejection code does not end the wait early. If the budget runs out,
    /// the last non-zero code read is returned so the rejection is reported
    /// instead of a bare timeout.
    fn poll_response(&self, handle: &mut BackendHandle) -> Option<u32> {
        let response = self.layout.response.as_read_only();
        let mut last = None;
        for _ in 0..self.poll_budget {
            match handle.read_smn(response) {
                Ok(smu::RESPONSE_OK) => return Some(smu::RESPONSE_OK),
                Ok(0) => {}
                Ok(value) => last = Some(value),
                Err(e) => debug!(error = %e, "Mailbox poll read failed"),
            }
            std::hint::spin_loop();
        }
        last
    }
}
