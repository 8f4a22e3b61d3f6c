//! Shared test doubles for the engine crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};

use treasury_types::TreasuryError;

use crate::chain::{ChainClient, Coin, FeeEstimates};

/// In-memory `ChainClient` with fixed coins per wallet, fixed fee estimates,
/// and recorded broadcasts.
#[derive(Default)]
pub struct MockChain {
    pub coins: Mutex<HashMap<String, Vec<Coin>>>,
    pub fees: Mutex<FeeEstimates>,
    pub broadcasts: Mutex<Vec<Transaction>>,
    fail_broadcast: AtomicBool,
}

impl MockChain {
    pub fn with_fees(fast: f64, medium: f64, min_relay: f64) -> Self {
        let chain = Self::default();
        *chain.fees.lock().unwrap() = FeeEstimates {
            fast,
            medium,
            min_relay_fee: min_relay,
        };
        chain
    }

    pub fn add_coins(&self, wallet_id: &str, coins: Vec<Coin>) {
        self.coins
            .lock()
            .unwrap()
            .entry(wallet_id.to_string())
            .or_default()
            .extend(coins);
    }

    pub fn fail_broadcast(&self) {
        self.fail_broadcast.store(true, Ordering::SeqCst);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn wallet_coins(&self, wallet_id: &str) -> Result<Vec<Coin>, TreasuryError> {
        Ok(self
            .coins
            .lock()
            .unwrap()
            .get(wallet_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fee_estimates(&self) -> Result<FeeEstimates, TreasuryError> {
        Ok(*self.fees.lock().unwrap())
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, TreasuryError> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(TreasuryError::Chain("broadcast rejected by node".to_string()));
        }
        let txid = tx.compute_txid();
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(txid)
    }
}
