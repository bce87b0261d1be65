//! Unified error handling for Omenfan
//!
//! This crate provides a single error type used across all Omenfan components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.
//!
//! Hardware-facing code never lets these escape as panics: transient failures are
//! retried inside the owning component and then folded into result records, while
//! programming errors (`Unauthorized`, `InvalidInput`) surface to the caller as-is.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Result type alias using OmenError
pub type Result<T> = std::result::Result<T, OmenError>;

/// Unified error type for all Omenfan operations
#[derive(thiserror::Error, Debug)]
pub enum OmenError {
    // ============================================================================
    // Backend and Register Access Errors
    // ============================================================================
    #[error("No hardware backend available: {0}")]
    BackendUnavailable(String),

    #[error("Write to {target} is not allowlisted")]
    Unauthorized {
        target: String,
    },

    #[error("Hardware I/O failed: {0}")]
    IoFailure(String),

    #[error("Hardware resource busy: {0}")]
    Busy(String),

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    #[error("Protocol timed out: {0}")]
    ProtocolTimeout(String),

    #[error("Command rejected by {source_name} (status {status:#x}): {reason}")]
    ProtocolRejected {
        source_name: String,
        status: u32,
        reason: String,
    },

    #[error("{0} disabled for this session after repeated failures")]
    Disabled(String),

    // ============================================================================
    // Control Loop Errors
    // ============================================================================
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("No calibration for model {model} channel {channel}")]
    CalibrationMissing {
        model: String,
        channel: u8,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Invalid input for {field}: {reason}")]
    InvalidInput {
        field: String,
        reason: String,
    },

    #[error("Curve validation failed: {0}")]
    InvalidCurve(String),

    // ============================================================================
    // I/O, Persistence and Configuration Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

/// Flat error classification carried inside result records
///
/// Result records are plain data handed to UI layers, so they carry this
/// `Copy` tag instead of the full error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    None,
    BackendUnavailable,
    Unauthorized,
    IoFailure,
    ProtocolTimeout,
    ProtocolRejected,
    BackendCallFailed,
    VerificationFailed,
    Unverified,
    CalibrationMissing,
    Busy,
    Disabled,
    Cancelled,
    InvalidInput,
    Other,
}

impl Default for ErrorKind {
    fn default() -> Self {
        Self::None
    }
}

impl OmenError {
    /// Create an I/O failure from anything printable
    pub fn io_failure(msg: impl Into<String>) -> Self {
        Self::IoFailure(msg.into())
    }

    /// Create a backend-unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create an unauthorized-write error for a target description
    pub fn unauthorized(target: impl Into<String>) -> Self {
        Self::Unauthorized {
            target: target.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Transient errors may succeed on retry; everything else is final
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::IoFailure(_) | Self::ProtocolTimeout(_) | Self::Busy(_) | Self::Io(_)
        )
    }

    /// Programming errors must reach the caller unchanged
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized { .. } | Self::InvalidInput { .. } | Self::InvalidCurve(_)
        )
    }

    /// Classification for result records
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::IoFailure(_) | Self::Io(_) => ErrorKind::IoFailure,
            Self::Busy(_) => ErrorKind::Busy,
            Self::ProtocolTimeout(_) => ErrorKind::ProtocolTimeout,
            Self::ProtocolRejected { .. } => ErrorKind::ProtocolRejected,
            Self::Disabled(_) => ErrorKind::Disabled,
            Self::VerificationFailed(_) => ErrorKind::VerificationFailed,
            Self::CalibrationMissing { .. } => ErrorKind::CalibrationMissing,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidInput { .. } | Self::InvalidCurve(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Other,
        }
    }
}
