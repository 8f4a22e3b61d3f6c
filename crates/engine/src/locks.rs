//! Store-backed coin locking.
//!
//! The only cross-process mutual-exclusion primitive in the system: acquiring
//! a lock is an atomic insert into the store's lock table, releasing is a
//! delete. Selection locks reserve a coin during negotiation or rebalancing
//! and are swept after four minutes; replay markers record that a sender's
//! declared inputs were already seen and are never removed.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::OutPoint;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use treasury_storage::TreasuryStore;
use treasury_types::TreasuryError;

/// Selection locks older than this are swept.
pub const LOCK_TTL_SECS: i64 = 240;

/// Sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Canonical lock-table key for an outpoint ("txid:vout").
pub fn outpoint_key(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}

fn outpoint_keys(outpoints: &[OutPoint]) -> Vec<String> {
    outpoints.iter().map(outpoint_key).collect()
}

/// Atomic, store-backed reservation of UTXOs and permanent replay markers.
#[derive(Clone)]
pub struct CoinLockManager {
    store: Arc<TreasuryStore>,
}

impl CoinLockManager {
    pub fn new(store: Arc<TreasuryStore>) -> Self {
        Self { store }
    }

    /// Reserve one coin. True iff no lock row existed for it.
    pub fn try_lock(&self, outpoint: &OutPoint) -> Result<bool, TreasuryError> {
        self.store.try_lock(&outpoint_key(outpoint))
    }

    /// Release selection locks. True only if every outpoint had a row
    /// removed; false means state may be partially inconsistent, not that the
    /// whole operation failed.
    pub fn try_unlock(&self, outpoints: &[OutPoint]) -> Result<bool, TreasuryError> {
        let removed = self.store.try_unlock(&outpoint_keys(outpoints))?;
        if !removed {
            tracing::warn!(
                "Unlock removed only part of {} outpoints; some rows were missing",
                outpoints.len()
            );
        }
        Ok(removed)
    }

    /// Mark a sender's declared inputs as seen, permanently. All-or-nothing:
    /// false means at least one input was already marked.
    pub fn try_lock_inputs(&self, outpoints: &[OutPoint]) -> Result<bool, TreasuryError> {
        self.store.try_lock_inputs(&outpoint_keys(outpoints))
    }

    /// Whether any of the declared inputs were marked by a prior attempt.
    /// Marks them as a side effect when they were not.
    pub fn inputs_seen_before(&self, outpoints: &[OutPoint]) -> Result<bool, TreasuryError> {
        Ok(!self.try_lock_inputs(outpoints)?)
    }

    /// Drop every coin that currently has any lock row, selection lock or
    /// replay marker alike.
    pub fn filter_out_locked(
        &self,
        coins: Vec<crate::chain::Coin>,
    ) -> Result<Vec<crate::chain::Coin>, TreasuryError> {
        let keys: Vec<String> = coins.iter().map(|c| outpoint_key(&c.outpoint)).collect();
        let locked = self.store.locked_subset(&keys)?;
        Ok(coins
            .into_iter()
            .filter(|c| !locked.contains(&outpoint_key(&c.outpoint)))
            .collect())
    }

    /// Spawn the background sweep: once a minute, delete selection locks
    /// older than four minutes. Replay markers are never touched. The task
    /// checks the shutdown signal before each iteration.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("Lock sweeper shutting down");
                        return;
                    }
                }
                if *shutdown.borrow() {
                    tracing::info!("Lock sweeper shutting down");
                    return;
                }
                if let Err(e) = store.sweep_selection_locks(LOCK_TTL_SECS) {
                    tracing::error!("Lock sweep failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn op(n: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([n; 32]),
            vout,
        }
    }

    fn manager() -> CoinLockManager {
        CoinLockManager::new(Arc::new(TreasuryStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_concurrent_try_lock_single_winner() {
        let locks = Arc::new(manager());
        let outpoint = op(0xab, 0);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move { locks.try_lock(&outpoint) }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_inputs_seen_before() {
        let locks = manager();
        let inputs = vec![op(1, 0), op(1, 1)];

        assert!(!locks.inputs_seen_before(&inputs).unwrap());
        // Same declared inputs on a retry are now rejected.
        assert!(locks.inputs_seen_before(&inputs).unwrap());
    }

    #[test]
    fn test_filter_out_locked() {
        use crate::chain::Coin;
        use bitcoin::ScriptBuf;

        let locks = manager();
        locks.try_lock(&op(2, 0)).unwrap();

        let coins = vec![
            Coin {
                outpoint: op(2, 0),
                value: 1_000,
                wallet_id: "w".to_string(),
                derivation_change: 0,
                derivation_index: 0,
                script_pubkey: ScriptBuf::new(),
            },
            Coin {
                outpoint: op(3, 0),
                value: 2_000,
                wallet_id: "w".to_string(),
                derivation_change: 0,
                derivation_index: 1,
                script_pubkey: ScriptBuf::new(),
            },
        ];

        let free = locks.filter_out_locked(coins).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].outpoint, op(3, 0));
    }
}
