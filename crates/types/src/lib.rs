//! Shared domain types for the treasury backend.
//!
//! Everything persisted or passed between components lives here:
//! status enums, record structs mirroring the store schema, the common
//! error type, and the validated runtime configuration.

pub mod config;
pub mod error;
pub mod model;

pub use config::{PayjoinConfig, RebalanceConfig, TreasuryConfig, WalletConfig};
pub use error::TreasuryError;
pub use model::{
    DepositAddress, LockKind, PayjoinRecord, ScheduledTransactionRecord, SigningRequestItem,
    SigningRequestRecord, SigningRequestStatus, SigningRequestType, TransferRequestRecord,
    TransferStatus, TransferType,
};

/// Dust limit in satoshis (546 sats for P2WPKH).
pub const DUST_LIMIT: u64 = 546;

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;
