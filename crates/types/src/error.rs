//! Common error type shared across treasury components.

use thiserror::Error;

/// Errors surfaced by the storage, chain, and engine layers.
///
/// One variant per failure domain; protocol-level PayJoin failures carry
/// their own error type in the engine crate since they map to BIP78 wire
/// error codes rather than internal faults.
#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Chain client error: {0}")]
    Chain(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid PSBT: {0}")]
    InvalidPsbt(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
