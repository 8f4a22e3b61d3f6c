//! Persistent domain records and their status enums.
//!
//! All enums serialize to the snake_case strings stored in SQLite; each one
//! carries a `parse` helper for the reverse direction so the store layer can
//! map rows back without stringly-typed matches scattered around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Lock records
// ============================================================================

/// Which lifecycle a `coin_locks` row belongs to.
///
/// Selection locks are temporary reservations taken during negotiation or
/// rebalancing and are swept after four minutes. Replay markers record that a
/// sender's declared inputs were already seen and are never removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Selection,
    Replay,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Selection => write!(f, "selection"),
            LockKind::Replay => write!(f, "replay"),
        }
    }
}

impl LockKind {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "selection" => Ok(LockKind::Selection),
            "replay" => Ok(LockKind::Replay),
            other => Err(format!("unknown lock kind: '{}'", other)),
        }
    }
}

// ============================================================================
// Signing requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningRequestStatus {
    Pending,
    Signed,
    Expired,
    Failed,
}

impl std::fmt::Display for SigningRequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SigningRequestStatus::Pending => "pending",
            SigningRequestStatus::Signed => "signed",
            SigningRequestStatus::Expired => "expired",
            SigningRequestStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl SigningRequestStatus {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(SigningRequestStatus::Pending),
            "signed" => Ok(SigningRequestStatus::Signed),
            "expired" => Ok(SigningRequestStatus::Expired),
            "failed" => Ok(SigningRequestStatus::Failed),
            other => Err(format!("unknown signing request status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningRequestType {
    HotWallet,
    Replenishment,
    ExpressTransfer,
    ExpressTransferPayjoin,
    DepositPayjoin,
}

impl std::fmt::Display for SigningRequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SigningRequestType::HotWallet => "hot_wallet",
            SigningRequestType::Replenishment => "replenishment",
            SigningRequestType::ExpressTransfer => "express_transfer",
            SigningRequestType::ExpressTransferPayjoin => "express_transfer_payjoin",
            SigningRequestType::DepositPayjoin => "deposit_payjoin",
        };
        write!(f, "{}", s)
    }
}

impl SigningRequestType {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "hot_wallet" => Ok(SigningRequestType::HotWallet),
            "replenishment" => Ok(SigningRequestType::Replenishment),
            "express_transfer" => Ok(SigningRequestType::ExpressTransfer),
            "express_transfer_payjoin" => Ok(SigningRequestType::ExpressTransferPayjoin),
            "deposit_payjoin" => Ok(SigningRequestType::DepositPayjoin),
            other => Err(format!("unknown signing request type: '{}'", other)),
        }
    }
}

/// One threshold-signing ledger entry.
///
/// `id` is the target transaction id. `required_signatures == 0` means the
/// request was completed in-process (hot wallet signing) and is recorded
/// already Signed; otherwise independent signers submit their own signed
/// copies of `unsigned_psbt` as items until the threshold is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningRequestRecord {
    pub id: String,
    pub wallet_id: String,
    /// Base64 PSBT, no signatures.
    pub unsigned_psbt: String,
    /// Base64 PSBT after combine+finalize, set when status becomes Signed.
    pub final_psbt: Option<String>,
    pub required_signatures: u32,
    pub status: SigningRequestStatus,
    pub request_type: SigningRequestType,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One signer's independently-signed copy of the unsigned transaction.
/// Immutable once created; payloads are unique per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningRequestItem {
    pub id: i64,
    pub signing_request_id: String,
    /// Base64 PSBT carrying this signer's signatures.
    pub signed_psbt: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Transfer requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Processing => "processing",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl TransferStatus {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "processing" => Ok(TransferStatus::Processing),
            "completed" => Ok(TransferStatus::Completed),
            "cancelled" => Ok(TransferStatus::Cancelled),
            other => Err(format!("unknown transfer status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    External,
    Internal,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferType::External => write!(f, "external"),
            TransferType::Internal => write!(f, "internal"),
        }
    }
}

impl TransferType {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "external" => Ok(TransferType::External),
            "internal" => Ok(TransferType::Internal),
            other => Err(format!("unknown transfer type: '{}'", other)),
        }
    }
}

/// A withdrawal (External) or replenishment (Internal) intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequestRecord {
    pub id: Uuid,
    pub amount_sats: u64,
    /// Destination Bitcoin address.
    pub destination: String,
    pub status: TransferStatus,
    pub transfer_type: TransferType,
    /// Set once the transfer is folded into a funding transaction.
    pub signing_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Scheduled transactions
// ============================================================================

/// A fully-signed transaction queued for future broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTransactionRecord {
    pub id: Uuid,
    /// Raw transaction, hex encoded.
    pub raw_tx: String,
    pub broadcast_at: DateTime<Utc>,
    /// If set, a successful broadcast re-points TransferRequests still linked
    /// to this signing request id onto the new transaction id.
    pub replaces_signing_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// PayJoin records
// ============================================================================

/// Idempotency record for a completed PayJoin negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayjoinRecord {
    /// Expected txid of the finalized counter-proposal.
    pub final_txid: String,
    pub original_txid: String,
    pub deposit_id: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Deposit addresses
// ============================================================================

/// Minimal deposit-address bookkeeping consumed by PayJoin output matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    pub id: String,
    pub wallet_id: String,
    pub address: String,
    /// BIP32 branch: 0 = receiving, 1 = change.
    pub derivation_change: u32,
    pub derivation_index: u32,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for s in ["pending", "signed", "expired", "failed"] {
            assert_eq!(SigningRequestStatus::parse(s).unwrap().to_string(), s);
        }
        for s in [
            "hot_wallet",
            "replenishment",
            "express_transfer",
            "express_transfer_payjoin",
            "deposit_payjoin",
        ] {
            assert_eq!(SigningRequestType::parse(s).unwrap().to_string(), s);
        }
        for s in ["pending", "processing", "completed", "cancelled"] {
            assert_eq!(TransferStatus::parse(s).unwrap().to_string(), s);
        }
        for s in ["external", "internal"] {
            assert_eq!(TransferType::parse(s).unwrap().to_string(), s);
        }
        for s in ["selection", "replay"] {
            assert_eq!(LockKind::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_unknown_enum_values_rejected() {
        assert!(SigningRequestStatus::parse("done").is_err());
        assert!(TransferType::parse("outbound").is_err());
        assert!(LockKind::parse("K-prefix").is_err());
    }
}
