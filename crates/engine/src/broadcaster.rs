//! Delayed broadcast queue.
//!
//! Scheduled transactions are durable rows drained once per minute. A due
//! entry is parsed and broadcast; when the entry carries a `replaces` marker
//! and the broadcast succeeds, transfers still linked to the superseded
//! signing request are re-pointed onto the new txid. The schedule row is
//! deleted after a processing attempt regardless of outcome: retrying a
//! stale original transaction forever against a chain that may already
//! contain its payjoin replacement would never succeed.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::encode::{deserialize, serialize_hex};
use bitcoin::Transaction;
use chrono::{TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use treasury_storage::TreasuryStore;
use treasury_types::{ScheduledTransactionRecord, TreasuryError};

use crate::chain::ChainClient;

const DRAIN_INTERVAL: Duration = Duration::from_secs(60);

pub struct TransactionBroadcaster {
    store: Arc<TreasuryStore>,
    chain: Arc<dyn ChainClient>,
}

impl TransactionBroadcaster {
    pub fn new(store: Arc<TreasuryStore>, chain: Arc<dyn ChainClient>) -> Self {
        Self { store, chain }
    }

    /// Queue a fully-signed transaction for broadcast after `delay_secs`.
    pub fn schedule(
        &self,
        tx: &Transaction,
        delay_secs: u64,
        replaces_signing_request_id: Option<String>,
    ) -> Result<Uuid, TreasuryError> {
        let id = Uuid::new_v4();
        let broadcast_at = Utc::now() + TimeDelta::seconds(delay_secs as i64);

        self.store
            .insert_scheduled_transaction(&ScheduledTransactionRecord {
                id,
                raw_tx: serialize_hex(tx),
                broadcast_at,
                replaces_signing_request_id,
                created_at: Utc::now(),
            })?;

        tracing::info!(
            "Scheduled transaction {} for broadcast at {}",
            tx.compute_txid(),
            broadcast_at
        );
        Ok(id)
    }

    /// Process every due entry once. Returns the number of entries handled.
    pub async fn drain(&self) -> Result<usize, TreasuryError> {
        let due = self.store.due_scheduled_transactions(Utc::now())?;
        let handled = due.len();

        for entry in due {
            if let Err(e) = self.process(&entry).await {
                tracing::warn!("Scheduled broadcast {} failed: {}", entry.id, e);
            }
            // Unconditional: a stale entry is never retried.
            self.store.delete_scheduled_transaction(&entry.id)?;
        }

        Ok(handled)
    }

    async fn process(&self, entry: &ScheduledTransactionRecord) -> Result<(), TreasuryError> {
        let bytes = hex::decode(&entry.raw_tx)
            .map_err(|e| TreasuryError::Serialization(format!("bad scheduled tx hex: {}", e)))?;
        let tx: Transaction = deserialize(&bytes)
            .map_err(|e| TreasuryError::Serialization(format!("bad scheduled tx: {}", e)))?;

        let txid = self.chain.broadcast(&tx).await?;
        tracing::info!("Broadcast scheduled transaction {}", txid);

        if let Some(replaced) = &entry.replaces_signing_request_id {
            let repointed = self
                .store
                .repoint_transfers(replaced, &txid.to_string())?;
            if repointed > 0 {
                tracing::info!(
                    "Re-pointed {} transfers from signing request {} to {}",
                    repointed,
                    replaced,
                    txid
                );
            }
        }
        Ok(())
    }

    /// Spawn the drain loop. Checks the shutdown signal before each pass.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("Broadcaster shutting down");
                        return;
                    }
                }
                if *shutdown.borrow() {
                    tracing::info!("Broadcaster shutting down");
                    return;
                }
                if let Err(e) = self.drain().await {
                    tracing::error!("Broadcast drain failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    use crate::testutil::MockChain;
    use treasury_types::{TransferRequestRecord, TransferStatus, TransferType};

    fn dummy_tx() -> Transaction {
        use bitcoin::absolute::LockTime;
        use bitcoin::hashes::Hash;
        use bitcoin::transaction::Version;
        use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};

        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array([7; 32]),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
            }],
        }
    }

    fn setup() -> (TransactionBroadcaster, Arc<TreasuryStore>, Arc<MockChain>) {
        let store = Arc::new(TreasuryStore::open_in_memory().unwrap());
        let chain = Arc::new(MockChain::default());
        let broadcaster = TransactionBroadcaster::new(Arc::clone(&store), chain.clone());
        (broadcaster, store, chain)
    }

    #[tokio::test]
    async fn test_drain_skips_entries_not_yet_due() {
        let (broadcaster, _store, chain) = setup();
        broadcaster.schedule(&dummy_tx(), 3600, None).unwrap();

        assert_eq!(broadcaster.drain().await.unwrap(), 0);
        assert_eq!(chain.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_due_entry_broadcast_and_deleted() {
        let (broadcaster, store, chain) = setup();
        broadcaster.schedule(&dummy_tx(), 0, None).unwrap();

        assert_eq!(broadcaster.drain().await.unwrap(), 1);
        assert_eq!(chain.broadcast_count(), 1);

        // Entry is gone; a second drain finds nothing.
        assert_eq!(broadcaster.drain().await.unwrap(), 0);
        assert!(store
            .due_scheduled_transactions(Utc::now() + TimeDelta::days(1))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_broadcast_entry_still_deleted() {
        let (broadcaster, store, chain) = setup();
        chain.fail_broadcast();
        broadcaster.schedule(&dummy_tx(), 0, None).unwrap();

        assert_eq!(broadcaster.drain().await.unwrap(), 1);
        assert_eq!(chain.broadcast_count(), 0);
        assert!(store
            .due_scheduled_transactions(Utc::now() + TimeDelta::days(1))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_replacement_repoints_transfers() {
        let (broadcaster, store, _chain) = setup();

        let transfer = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: 10_000,
            destination: "addr".to_string(),
            status: TransferStatus::Processing,
            transfer_type: TransferType::External,
            signing_request_id: Some("old-sr".to_string()),
            created_at: Utc::now(),
        };
        store.insert_transfer_request(&transfer).unwrap();

        let tx = dummy_tx();
        let new_txid = tx.compute_txid().to_string();
        broadcaster
            .schedule(&tx, 0, Some("old-sr".to_string()))
            .unwrap();
        broadcaster.drain().await.unwrap();

        let loaded = store.get_transfer_request(&transfer.id).unwrap().unwrap();
        assert_eq!(loaded.signing_request_id.as_deref(), Some(new_txid.as_str()));
        assert_eq!(loaded.status, TransferStatus::Processing);
    }
}
