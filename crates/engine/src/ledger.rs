//! Threshold signing ledger.
//!
//! A signing request holds one unsigned transaction and collects
//! independently-signed copies of it until the required count is reached,
//! then combines the signature data onto the base transaction, finalizes,
//! and broadcasts. Requests created by fully-automated paths (hot-wallet
//! batches, completed payjoins) are recorded with a required count of zero
//! and status Signed; nothing further is collected for them.

use std::sync::Arc;

use chrono::Utc;

use treasury_storage::TreasuryStore;
use treasury_types::{
    SigningRequestRecord, SigningRequestStatus, SigningRequestType, TreasuryError,
};

use crate::chain::ChainClient;
use crate::psbt;

pub struct SigningRequestLedger {
    store: Arc<TreasuryStore>,
    chain: Arc<dyn ChainClient>,
}

impl SigningRequestLedger {
    pub fn new(store: Arc<TreasuryStore>, chain: Arc<dyn ChainClient>) -> Self {
        Self { store, chain }
    }

    /// Record a request that was completed in-process: no co-signing needed.
    pub fn record_completed(
        &self,
        txid: &str,
        wallet_id: &str,
        unsigned_psbt: &str,
        final_psbt: &str,
        request_type: SigningRequestType,
    ) -> Result<(), TreasuryError> {
        self.store.insert_signing_request(&SigningRequestRecord {
            id: txid.to_string(),
            wallet_id: wallet_id.to_string(),
            unsigned_psbt: unsigned_psbt.to_string(),
            final_psbt: Some(final_psbt.to_string()),
            required_signatures: 0,
            status: SigningRequestStatus::Signed,
            request_type,
            failure_reason: None,
            created_at: Utc::now(),
        })
    }

    /// Open a request that waits for `required_signatures` independent
    /// signed copies.
    pub fn open_request(
        &self,
        txid: &str,
        wallet_id: &str,
        unsigned_psbt: &str,
        required_signatures: u32,
        request_type: SigningRequestType,
    ) -> Result<(), TreasuryError> {
        self.store.insert_signing_request(&SigningRequestRecord {
            id: txid.to_string(),
            wallet_id: wallet_id.to_string(),
            unsigned_psbt: unsigned_psbt.to_string(),
            final_psbt: None,
            required_signatures,
            status: SigningRequestStatus::Pending,
            request_type,
            failure_reason: None,
            created_at: Utc::now(),
        })
    }

    /// Submit one signer's signed copy.
    ///
    /// Rejected when the request is not Pending, when the payload is the
    /// unsigned original, when it signs a different transaction, or when the
    /// identical payload was already recorded. Reaching the threshold
    /// triggers combine + finalize + broadcast; a failure there moves the
    /// request to Failed with the reason persisted.
    pub async fn submit_signature(
        &self,
        request_id: &str,
        signed_psbt_base64: &str,
    ) -> Result<(), TreasuryError> {
        let request = self
            .store
            .get_signing_request(request_id)?
            .ok_or_else(|| TreasuryError::NotFound(format!("signing request {}", request_id)))?;

        if request.status != SigningRequestStatus::Pending {
            return Err(TreasuryError::SigningFailed(format!(
                "signing request {} is {}, not accepting signatures",
                request_id, request.status
            )));
        }

        let base = psbt::decode_psbt(&request.unsigned_psbt)?;
        let submitted = psbt::decode_psbt(signed_psbt_base64)?;

        if submitted.unsigned_tx.compute_txid() != base.unsigned_tx.compute_txid() {
            return Err(TreasuryError::SigningFailed(
                "signed copy is for a different transaction".to_string(),
            ));
        }
        if submitted.serialize() == base.serialize() {
            return Err(TreasuryError::SigningFailed(
                "submitted transaction carries no signatures".to_string(),
            ));
        }

        let canonical = psbt::encode_psbt(&submitted);
        if !self.store.insert_signing_item(request_id, &canonical)? {
            return Err(TreasuryError::SigningFailed(
                "already signed by this signer".to_string(),
            ));
        }

        let items = self.store.signing_items(request_id)?;
        tracing::info!(
            "Signing request {}: {}/{} signatures collected",
            request_id,
            items.len(),
            request.required_signatures
        );

        if (items.len() as u32) < request.required_signatures {
            return Ok(());
        }

        match self.complete(&request, items).await {
            Ok(final_psbt) => {
                self.store
                    .set_signing_request_final(request_id, &final_psbt)?;
                tracing::info!("Signing request {} signed and broadcast", request_id);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                self.store.set_signing_request_status(
                    request_id,
                    SigningRequestStatus::Failed,
                    Some(&reason),
                )?;
                tracing::error!("Signing request {} failed: {}", request_id, reason);
                Err(e)
            }
        }
    }

    async fn complete(
        &self,
        request: &SigningRequestRecord,
        items: Vec<treasury_types::SigningRequestItem>,
    ) -> Result<String, TreasuryError> {
        let base = psbt::decode_psbt(&request.unsigned_psbt)?;
        let copies = items
            .iter()
            .map(|item| psbt::decode_psbt(&item.signed_psbt))
            .collect::<Result<Vec<_>, _>>()?;

        let mut combined = psbt::combine_signed_copies(base, copies)?;
        psbt::finalize_all(&mut combined)?;
        let final_psbt = psbt::encode_psbt(&combined);

        let tx = psbt::extract_tx(combined)?;
        self.chain.broadcast(&tx).await?;

        Ok(final_psbt)
    }

    /// Listing with optional status/type filters.
    pub fn list(
        &self,
        status: Option<SigningRequestStatus>,
        request_type: Option<SigningRequestType>,
    ) -> Result<Vec<SigningRequestRecord>, TreasuryError> {
        self.store.list_signing_requests(status, request_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::psbt::tests::wallet_psbt;
    use crate::testutil::MockChain;
    use crate::wallets::tests::test_config;
    use crate::wallets::WalletBook;

    fn setup() -> (SigningRequestLedger, Arc<TreasuryStore>, Arc<MockChain>) {
        let store = Arc::new(TreasuryStore::open_in_memory().unwrap());
        let chain = Arc::new(MockChain::default());
        let ledger = SigningRequestLedger::new(Arc::clone(&store), chain.clone());
        (ledger, store, chain)
    }

    /// Sign the test PSBT at input 0 with the hot wallet key and return the
    /// copy, optionally grinding a distinct-but-valid second signature by
    /// adding derivation metadata so the serialized bytes differ.
    fn signed_copy(book: &WalletBook, base: &bitcoin::Psbt, tag: bool) -> String {
        let wallet = book.get("hot-1").unwrap();
        let key = wallet.private_key_at(0, 0, book.secp()).unwrap().unwrap();

        let mut copy = base.clone();
        psbt::sign_p2wpkh_input(&mut copy, 0, &key, book.secp()).unwrap();
        if tag {
            psbt::rebase_input_derivation(&mut copy, 0, wallet, 0, 0, book.secp()).unwrap();
        }
        psbt::encode_psbt(&copy)
    }

    #[tokio::test]
    async fn test_two_of_two_walkthrough() {
        let (ledger, store, chain) = setup();
        let book = WalletBook::from_config(&test_config(true)).unwrap();
        let base = wallet_psbt(&book, 100_000, 90_000);
        let txid = base.unsigned_tx.compute_txid().to_string();

        ledger
            .open_request(
                &txid,
                "hot-1",
                &psbt::encode_psbt(&base),
                2,
                SigningRequestType::Replenishment,
            )
            .unwrap();

        // Signer A: accepted, still Pending.
        let copy_a = signed_copy(&book, &base, false);
        ledger.submit_signature(&txid, &copy_a).await.unwrap();
        let request = store.get_signing_request(&txid).unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Pending);

        // Signer A resubmits identical bytes: rejected, no state change.
        let err = ledger.submit_signature(&txid, &copy_a).await.unwrap_err();
        assert!(err.to_string().contains("already signed by this signer"));
        let request = store.get_signing_request(&txid).unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Pending);

        // Signer B: threshold reached, combined, finalized, broadcast.
        let copy_b = signed_copy(&book, &base, true);
        ledger.submit_signature(&txid, &copy_b).await.unwrap();

        let request = store.get_signing_request(&txid).unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Signed);
        assert!(request.final_psbt.is_some());
        assert_eq!(chain.broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsigned_original_rejected() {
        let (ledger, _store, _chain) = setup();
        let book = WalletBook::from_config(&test_config(true)).unwrap();
        let base = wallet_psbt(&book, 100_000, 90_000);
        let txid = base.unsigned_tx.compute_txid().to_string();
        let encoded = psbt::encode_psbt(&base);

        ledger
            .open_request(&txid, "hot-1", &encoded, 2, SigningRequestType::Replenishment)
            .unwrap();

        let err = ledger.submit_signature(&txid, &encoded).await.unwrap_err();
        assert!(err.to_string().contains("carries no signatures"));
    }

    #[tokio::test]
    async fn test_different_transaction_rejected() {
        let (ledger, _store, _chain) = setup();
        let book = WalletBook::from_config(&test_config(true)).unwrap();
        let base = wallet_psbt(&book, 100_000, 90_000);
        let txid = base.unsigned_tx.compute_txid().to_string();

        ledger
            .open_request(
                &txid,
                "hot-1",
                &psbt::encode_psbt(&base),
                1,
                SigningRequestType::Replenishment,
            )
            .unwrap();

        let other = wallet_psbt(&book, 100_000, 80_000);
        let copy = signed_copy(&book, &other, false);
        let err = ledger.submit_signature(&txid, &copy).await.unwrap_err();
        assert!(err.to_string().contains("different transaction"));
    }

    #[tokio::test]
    async fn test_broadcast_failure_marks_failed() {
        let (ledger, store, chain) = setup();
        chain.fail_broadcast();
        let book = WalletBook::from_config(&test_config(true)).unwrap();
        let base = wallet_psbt(&book, 100_000, 90_000);
        let txid = base.unsigned_tx.compute_txid().to_string();

        ledger
            .open_request(
                &txid,
                "hot-1",
                &psbt::encode_psbt(&base),
                1,
                SigningRequestType::Replenishment,
            )
            .unwrap();

        let copy = signed_copy(&book, &base, false);
        assert!(ledger.submit_signature(&txid, &copy).await.is_err());

        let request = store.get_signing_request(&txid).unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Failed);
        assert!(request.failure_reason.is_some());

        // Terminal: no further signatures accepted.
        let err = ledger.submit_signature(&txid, &copy).await.unwrap_err();
        assert!(err.to_string().contains("not accepting signatures"));
    }

    #[tokio::test]
    async fn test_unknown_request_rejected() {
        let (ledger, _store, _chain) = setup();
        let err = ledger
            .submit_signature("no-such-id", "cHNidP8BAA==")
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::NotFound(_)));
    }
}
