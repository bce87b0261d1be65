//! Transports for firmware BIOS commands
//!
//! Two wire formats exist across firmware revisions. The embedded-object
//! format passes a structured record; the legacy format is a flat 128-byte
//! buffer. A transport that cannot express a format reports
//! `ParameterShape`, which the adapter treats as "try the other format".

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use crate::constants::firmware as fw;

/// Transport-level failure
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call's argument shape is not accepted by this firmware
    #[error("parameter shape not accepted: {0}")]
    ParameterShape(String),

    #[error("firmware call timed out after {0:?}")]
    Timeout(Duration),

    #[error("firmware call failed: {0}")]
    Io(String),
}

/// Embedded-object request record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedRequest {
    pub signature: [u8; 4],
    pub command: u32,
    pub command_type: u32,
    pub data: Vec<u8>,
    /// Bytes of output the caller expects back
    pub output_size: usize,
}

impl EmbeddedRequest {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Return code plus output payload, independent of wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFirmwareResponse {
    pub return_code: u32,
    pub data: Vec<u8>,
}

/// Build the legacy frame: signature, LE command id, payload
pub fn encode_legacy(command_id: u32, payload: &[u8]) -> Option<[u8; fw::LEGACY_BUFFER_SIZE]> {
    if payload.len() > fw::LEGACY_MAX_PAYLOAD {
        return None;
    }
    let mut frame = [0u8; fw::LEGACY_BUFFER_SIZE];
    frame[..4].copy_from_slice(&fw::SIGNATURE);
    frame[4..8].copy_from_slice(&command_id.to_le_bytes());
    frame[fw::LEGACY_HEADER_SIZE..fw::LEGACY_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    Some(frame)
}

/// Split a legacy reply into return code and payload
pub fn decode_legacy(reply: &[u8]) -> Option<RawFirmwareResponse> {
    if reply.len() < 4 {
        return None;
    }
    Some(RawFirmwareResponse {
        return_code: u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]),
        data: reply[4..].to_vec(),
    })
}

/// Firmware command channel
#[cfg_attr(test, mockall::automock)]
pub trait FirmwareTransport: Send + Sync {
    fn execute_embedded(&self, request: &EmbeddedRequest) -> Result<RawFirmwareResponse, TransportError>;

    /// Send a legacy frame, returning the raw reply buffer
    fn execute_legacy(&self, frame: &[u8; fw::LEGACY_BUFFER_SIZE]) -> Result<Vec<u8>, TransportError>;
}

/// Legacy-only transport over a character device
///
/// A write of the 128-byte frame is answered by a 128-byte read. The
/// embedded-object format is not expressible here and always reports
/// `ParameterShape`.
#[derive(Debug, Clone)]
pub struct DeviceFileTransport {
    path: PathBuf,
    timeout: Duration,
}

impl DeviceFileTransport {
    pub const DEFAULT_PATH: &'static str = "/dev/omen_wmi";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: fw::TRANSPORT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl FirmwareTransport for DeviceFileTransport {
    fn execute_embedded(&self, _request: &EmbeddedRequest) -> Result<RawFirmwareResponse, TransportError> {
        Err(TransportError::ParameterShape(
            "device transport carries legacy frames only".into(),
        ))
    }

    fn execute_legacy(&self, frame: &[u8; fw::LEGACY_BUFFER_SIZE]) -> Result<Vec<u8>, TransportError> {
        let path = self.path.clone();
        let frame = *frame;
        let (tx, rx) = mpsc::channel();

        // Device reads can block indefinitely on wedged firmware; the worker
        // is abandoned on timeout and exits once the call returns.
        std::thread::Builder::new()
            .name("omen-wmi-call".into())
            .spawn(move || {
                let result = (|| -> std::io::Result<Vec<u8>> {
                    let mut device = OpenOptions::new().read(true).write(true).open(&path)?;
                    device.write_all(&frame)?;
                    let mut reply = vec![0u8; fw::LEGACY_BUFFER_SIZE];
                    let n = device.read(&mut reply)?;
                    reply.truncate(n);
                    Ok(reply)
                })();
                let _ = tx.send(result);
            })
            .map_err(|e| TransportError::Io(e.to_string()))?;

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(TransportError::Io(format!("{}: {}", self.path.display(), e))),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TransportError::Timeout(self.timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(TransportError::Io("firmware worker exited without a reply".into()))
            }
        }
    }
}
