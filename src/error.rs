//! Error types for Omenfan
//!
//! Re-exports the unified error type from omen-error crate.

pub use omen_error::{ErrorKind, OmenError, Result};
