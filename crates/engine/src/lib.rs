//! Transaction construction and settlement engine.
//!
//! The components here share one model of coins, locks, and signing requests:
//!
//! - [`locks::CoinLockManager`]: store-backed atomic coin reservation and
//!   permanent replay markers
//! - [`selector::UtxoSelector`]: privacy-heuristic single-coin selection
//!   under lock contention
//! - [`ledger::SigningRequestLedger`]: threshold aggregation of signed PSBT
//!   copies into a broadcastable transaction
//! - [`broadcaster::TransactionBroadcaster`]: delayed broadcast queue with
//!   replacement bookkeeping
//! - [`payjoin::PayjoinNegotiationEngine`]: BIP78 receiver counter-proposal
//! - [`rebalancer::TreasuryRebalancer`]: periodic withdrawal batching and
//!   wallet replenishment
//!
//! Chain access goes through the [`chain::ChainClient`] trait; wallet key
//! material lives in [`wallets::WalletBook`].

pub mod broadcaster;
pub mod chain;
pub mod ledger;
pub mod locks;
pub mod payjoin;
pub mod psbt;
pub mod rebalancer;
pub mod selector;
pub mod wallets;

#[cfg(test)]
pub(crate) mod testutil;

pub use broadcaster::TransactionBroadcaster;
pub use chain::{ChainClient, Coin, EsploraChain, FeeEstimates};
pub use ledger::SigningRequestLedger;
pub use locks::CoinLockManager;
pub use payjoin::{PayjoinError, PayjoinNegotiationEngine, PayjoinParams};
pub use rebalancer::TreasuryRebalancer;
pub use selector::UtxoSelector;
pub use wallets::{TreasuryWallet, WalletBook};
