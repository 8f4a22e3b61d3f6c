//! BIP78 receiver-side negotiation.
//!
//! Given a sender's signed original PSBT paying one of our deposit addresses,
//! build the counter-proposal: contribute receiver input(s), optionally fold
//! one pending withdrawal into the transaction, preserve the sender's fee
//! rate, sign and finalize our inputs, and persist the idempotency records.
//! Protocol failures surface as BIP78 error codes and never crash the
//! process; locks taken during a failed attempt are released.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::{Address, Amount, OutPoint, Psbt, ScriptBuf, Sequence, TxIn, TxOut, Witness};
use chrono::Utc;
use thiserror::Error;

use treasury_storage::TreasuryStore;
use treasury_types::{
    PayjoinConfig, PayjoinRecord, SigningRequestType, TransferRequestRecord, TransferStatus,
    TransferType, TreasuryError, DUST_LIMIT,
};

use crate::broadcaster::TransactionBroadcaster;
use crate::chain::{ChainClient, Coin};
use crate::ledger::SigningRequestLedger;
use crate::locks::CoinLockManager;
use crate::psbt::{self, estimate_vbytes, INPUT_VBYTES, OUTPUT_VBYTES};
use crate::selector::{self, UtxoSelector};
use crate::wallets::WalletBook;

/// Total lock attempts allowed while gathering batch-covering coins.
const MAX_BATCH_LOCK_ATTEMPTS: usize = 30;

/// Sender-supplied negotiation parameters from the BIP78 query string.
#[derive(Debug, Clone)]
pub struct PayjoinParams {
    /// Sats the sender allows us to take from their designated fee output.
    pub max_additional_fee_contribution: Option<u64>,
    /// Index of that fee output in the original transaction.
    pub additional_fee_output_index: Option<usize>,
    /// Sender's minimum acceptable fee rate in sat/vB; -1.0 means unset.
    pub min_fee_rate: f64,
    pub disable_output_substitution: bool,
}

impl Default for PayjoinParams {
    fn default() -> Self {
        Self {
            max_additional_fee_contribution: None,
            additional_fee_output_index: None,
            min_fee_rate: -1.0,
            disable_output_substitution: false,
        }
    }
}

/// Protocol-level negotiation failures, mapped to BIP78 wire error codes.
#[derive(Debug, Error)]
pub enum PayjoinError {
    #[error("original PSBT rejected: {0}")]
    OriginalPsbtRejected(String),

    #[error("receiver unavailable: {0}")]
    Unavailable(String),

    #[error("not enough money to satisfy the fee constraints")]
    NotEnoughMoney,

    #[error(transparent)]
    Internal(#[from] TreasuryError),
}

impl PayjoinError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PayjoinError::OriginalPsbtRejected(_) => "original-psbt-rejected",
            PayjoinError::Unavailable(_) => "unavailable",
            PayjoinError::NotEnoughMoney => "not-enough-money",
            PayjoinError::Internal(_) => "unavailable",
        }
    }
}

struct DepositMatch {
    deposit_id: String,
    wallet_id: String,
    vout: usize,
}

/// One chosen contribution: locked coins plus an optional folded withdrawal.
struct Contribution {
    coins: Vec<Coin>,
    batched: Option<TransferRequestRecord>,
}

pub struct PayjoinNegotiationEngine {
    store: Arc<TreasuryStore>,
    chain: Arc<dyn ChainClient>,
    wallets: Arc<WalletBook>,
    locks: CoinLockManager,
    selector: UtxoSelector,
    ledger: Arc<SigningRequestLedger>,
    broadcaster: Arc<TransactionBroadcaster>,
    config: PayjoinConfig,
}

impl PayjoinNegotiationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TreasuryStore>,
        chain: Arc<dyn ChainClient>,
        wallets: Arc<WalletBook>,
        locks: CoinLockManager,
        ledger: Arc<SigningRequestLedger>,
        broadcaster: Arc<TransactionBroadcaster>,
        config: PayjoinConfig,
    ) -> Self {
        let selector = UtxoSelector::new(locks.clone());
        Self {
            store,
            chain,
            wallets,
            locks,
            selector,
            ledger,
            broadcaster,
            config,
        }
    }

    /// Build the receiver counter-proposal for a sender's original PSBT.
    /// Returns the base64 proposal.
    pub async fn propose(
        &self,
        original_base64: &str,
        params: &PayjoinParams,
    ) -> Result<String, PayjoinError> {
        let original = psbt::decode_psbt(original_base64)
            .map_err(|e| PayjoinError::OriginalPsbtRejected(e.to_string()))?;

        for (i, input) in original.inputs.iter().enumerate() {
            if input.witness_utxo.is_none() {
                return Err(PayjoinError::OriginalPsbtRejected(format!(
                    "input {} is missing witness_utxo",
                    i
                )));
            }
        }

        let deposit = self.match_deposit(&original)?;
        let payment_vout = deposit.vout;
        let original_payment = original.unsigned_tx.output[payment_vout].value.to_sat();
        let original_txid = original.unsigned_tx.compute_txid();

        // Permanent replay markers: the same declared inputs can never fund
        // a second negotiation attempt.
        let sender_outpoints: Vec<OutPoint> = original
            .unsigned_tx
            .input
            .iter()
            .map(|i| i.previous_output)
            .collect();
        if self.locks.inputs_seen_before(&sender_outpoints)? {
            return Err(PayjoinError::OriginalPsbtRejected(
                "inputs were already used in a previous negotiation".to_string(),
            ));
        }

        let candidates = self.gather_candidates(&sender_outpoints).await?;

        let sender_input_amounts: Vec<u64> = original
            .inputs
            .iter()
            .filter_map(|i| i.witness_utxo.as_ref())
            .map(|u| u.value.to_sat())
            .collect();
        let other_output_amounts: Vec<u64> = original
            .unsigned_tx
            .output
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != payment_vout)
            .map(|(_, o)| o.value.to_sat())
            .collect();

        let contribution = match self
            .choose_contribution(
                candidates,
                original_payment,
                &sender_input_amounts,
                &other_output_amounts,
                params,
            )? {
            Some(c) => c,
            None => {
                // Nothing to contribute: queue the unmodified original for a
                // delayed broadcast and end the negotiation.
                self.schedule_original(&original)?;
                return Err(PayjoinError::Unavailable(
                    "no contribution available".to_string(),
                ));
            }
        };

        match self
            .build_proposal(&original, &deposit, &contribution, params)
            .await
        {
            Ok(proposal) => Ok(proposal),
            Err(e) => {
                let taken: Vec<OutPoint> =
                    contribution.coins.iter().map(|c| c.outpoint).collect();
                self.locks.try_unlock(&taken)?;
                Err(e)
            }
        }
    }

    /// Match PSBT outputs against active deposit addresses backed by a hot
    /// wallet. Several matches are ordered ascending by whether the
    /// destination is a witness program, so non-segwit destinations win.
    fn match_deposit(&self, original: &Psbt) -> Result<DepositMatch, PayjoinError> {
        let network = self.wallets.network();
        let mut matches: Vec<(bool, DepositMatch)> = Vec::new();

        for deposit in self.store.active_deposit_addresses()? {
            let usable = self
                .wallets
                .get(&deposit.wallet_id)
                .map(|w| w.enabled && w.is_hot())
                .unwrap_or(false);
            if !usable {
                continue;
            }

            let address = Address::from_str(&deposit.address)
                .and_then(|a| a.require_network(network).map_err(Into::into))
                .map_err(|e| {
                    PayjoinError::Internal(TreasuryError::Configuration(format!(
                        "bad deposit address {}: {}",
                        deposit.id, e
                    )))
                })?;
            let script = address.script_pubkey();

            for (vout, output) in original.unsigned_tx.output.iter().enumerate() {
                if output.script_pubkey == script {
                    matches.push((
                        script.is_witness_program(),
                        DepositMatch {
                            deposit_id: deposit.id.clone(),
                            wallet_id: deposit.wallet_id.clone(),
                            vout,
                        },
                    ));
                }
            }
        }

        matches.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.vout.cmp(&b.1.vout)));
        matches
            .into_iter()
            .next()
            .map(|(_, m)| m)
            .ok_or_else(|| {
                PayjoinError::OriginalPsbtRejected(
                    "no output pays an active deposit address".to_string(),
                )
            })
    }

    /// Hot-wallet coins usable for contribution: exclude the original
    /// transaction's own inputs (self-payment) and anything locked.
    async fn gather_candidates(
        &self,
        sender_outpoints: &[OutPoint],
    ) -> Result<Vec<Coin>, TreasuryError> {
        let mut coins = Vec::new();
        for wallet in self.wallets.hot() {
            coins.extend(self.chain.wallet_coins(&wallet.id).await?);
        }
        coins.retain(|c| !sender_outpoints.contains(&c.outpoint));
        self.locks.filter_out_locked(coins)
    }

    /// Pick the contribution: a batch covering one pending withdrawal when
    /// allowed, otherwise a single heuristic-checked coin.
    fn choose_contribution(
        &self,
        candidates: Vec<Coin>,
        original_payment: u64,
        sender_input_amounts: &[u64],
        other_output_amounts: &[u64],
        params: &PayjoinParams,
    ) -> Result<Option<Contribution>, TreasuryError> {
        if self.config.batching_enabled && !params.disable_output_substitution {
            if let Some(batch) = self.try_batch(&candidates, original_payment)? {
                return Ok(Some(batch));
            }
        }

        let picked = self.selector.select(
            candidates,
            sender_input_amounts,
            original_payment,
            other_output_amounts,
        )?;
        Ok(picked.map(|coin| Contribution {
            coins: vec![coin],
            batched: None,
        }))
    }

    /// Fold at most one pending external withdrawal into the negotiation:
    /// the payment output shrinks by the withdrawal amount, the withdrawal
    /// output is added, and receiver coins covering the shrink come in as
    /// inputs. Rejected outright, never retried with a smaller batch.
    fn try_batch(
        &self,
        candidates: &[Coin],
        original_payment: u64,
    ) -> Result<Option<Contribution>, TreasuryError> {
        let pending = self
            .store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::External))?;
        let transfer = match pending.into_iter().next() {
            Some(t) => t,
            None => return Ok(None),
        };

        // The shrunken payment output must stay above dust.
        if original_payment < transfer.amount_sats
            || original_payment - transfer.amount_sats < DUST_LIMIT
        {
            tracing::debug!(
                "Batch of transfer {} rejected: payment output would fall below dust",
                transfer.id
            );
            return Ok(None);
        }

        let mut ordered = candidates.to_vec();
        selector::order_candidates(&mut ordered);

        let mut taken: Vec<Coin> = Vec::new();
        let mut total = 0u64;
        let mut attempts = 0;
        for coin in ordered {
            if total >= transfer.amount_sats || attempts >= MAX_BATCH_LOCK_ATTEMPTS {
                break;
            }
            attempts += 1;
            if self.locks.try_lock(&coin.outpoint)? {
                total += coin.value;
                taken.push(coin);
            }
        }

        if total < transfer.amount_sats {
            let outpoints: Vec<OutPoint> = taken.iter().map(|c| c.outpoint).collect();
            self.locks.try_unlock(&outpoints)?;
            return Ok(None);
        }

        tracing::info!(
            "Folding withdrawal {} ({} sats) into payjoin negotiation",
            transfer.id,
            transfer.amount_sats
        );
        Ok(Some(Contribution {
            coins: taken,
            batched: Some(transfer),
        }))
    }

    fn schedule_original(&self, original: &Psbt) -> Result<(), TreasuryError> {
        let tx = psbt::extract_tx(original.clone()).map_err(|e| {
            TreasuryError::InvalidPsbt(format!("original not broadcastable: {}", e))
        })?;
        self.broadcaster
            .schedule(&tx, self.config.original_broadcast_delay_secs, None)?;
        tracing::info!(
            "No payjoin contribution; original {} queued for delayed broadcast",
            tx.compute_txid()
        );
        Ok(())
    }

    async fn build_proposal(
        &self,
        original: &Psbt,
        deposit: &DepositMatch,
        contribution: &Contribution,
        params: &PayjoinParams,
    ) -> Result<String, PayjoinError> {
        let payment_vout = deposit.vout;
        let original_payment = original.unsigned_tx.output[payment_vout].value.to_sat();
        let original_fee = psbt::psbt_fee(original)
            .map_err(|e| PayjoinError::OriginalPsbtRejected(e.to_string()))?;
        let original_vbytes = estimate_vbytes(
            original.unsigned_tx.input.len(),
            original.unsigned_tx.output.len(),
        );
        let original_rate = original_fee as f64 / original_vbytes as f64;

        let contributed: u64 = contribution.coins.iter().map(|c| c.value).sum();
        let sequence = original
            .unsigned_tx
            .input
            .first()
            .map(|i| i.sequence)
            .unwrap_or(Sequence::ENABLE_RBF_NO_LOCKTIME);

        // Topology change: add our inputs, grow the payment output by the
        // contributed amount, and fold the batched withdrawal if present.
        let mut tx = original.unsigned_tx.clone();
        let sender_input_count = tx.input.len();
        let sender_output_count = tx.output.len();
        for coin in &contribution.coins {
            tx.input.push(TxIn {
                previous_output: coin.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::default(),
            });
        }

        let mut payment_value = original_payment + contributed;
        let mut added_outputs = 0usize;
        if let Some(transfer) = &contribution.batched {
            payment_value -= transfer.amount_sats;
            let destination = Address::from_str(&transfer.destination)
                .and_then(|a| a.require_network(self.wallets.network()).map_err(Into::into))
                .map_err(|e| {
                    PayjoinError::Internal(TreasuryError::Configuration(format!(
                        "bad withdrawal destination: {}",
                        e
                    )))
                })?;
            tx.output.push(TxOut {
                value: Amount::from_sat(transfer.amount_sats),
                script_pubkey: destination.script_pubkey(),
            });
            added_outputs += 1;
        }

        // Preserve the sender's fee rate over the larger transaction.
        let added_vbytes =
            contribution.coins.len() as u64 * INPUT_VBYTES + added_outputs as u64 * OUTPUT_VBYTES;
        let fee_delta = (original_rate * added_vbytes as f64).ceil() as u64;
        let mut shortfall = fee_delta;

        // Receiver output first, floored at max(dust, original amount) so
        // the sender never receives less than they asked to pay.
        let payment_floor = original_payment.max(DUST_LIMIT);
        let reducible = payment_value.saturating_sub(payment_floor);
        let take = shortfall.min(reducible);
        payment_value -= take;
        shortfall -= take;
        tx.output[payment_vout].value = Amount::from_sat(payment_value);

        // Then the sender-designated fee output, within their stated cap.
        // The index is an offset into the sender's original outputs; anything
        // appended by the fold is ours and never a valid fee source.
        if shortfall > 0 {
            if let Some(index) = params.additional_fee_output_index {
                if index >= sender_output_count || index == payment_vout {
                    return Err(PayjoinError::OriginalPsbtRejected(
                        "additionalfeeoutputindex does not name a sender output".to_string(),
                    ));
                }
                let output_value = tx.output[index].value.to_sat();
                let cap = params
                    .max_additional_fee_contribution
                    .unwrap_or(0)
                    .min(output_value.saturating_sub(DUST_LIMIT));
                let take = shortfall.min(cap);
                tx.output[index].value = Amount::from_sat(output_value - take);
                shortfall -= take;
            }
        }

        // Residual shortfall is acceptable only while the resulting rate
        // clears both the sender's declared minimum and the relay floor.
        if shortfall > 0 {
            let fees = self.chain.fee_estimates().await?;
            let mut min_rate = fees.min_relay_fee;
            if params.min_fee_rate > min_rate {
                min_rate = params.min_fee_rate;
            }

            let total_vbytes = estimate_vbytes(tx.input.len(), tx.output.len());
            let resulting_fee = original_fee + fee_delta - shortfall;
            let resulting_rate = resulting_fee as f64 / total_vbytes as f64;
            if resulting_rate < min_rate {
                return Err(PayjoinError::NotEnoughMoney);
            }
        }

        // Rebuild the PSBT around the new topology; the sender's old
        // signatures no longer commit to this transaction.
        let mut proposal = Psbt::from_unsigned_tx(tx)
            .map_err(|e| PayjoinError::Internal(TreasuryError::InvalidPsbt(e.to_string())))?;
        for (i, input) in original.inputs.iter().enumerate() {
            proposal.inputs[i].witness_utxo = input.witness_utxo.clone();
        }
        for (offset, coin) in contribution.coins.iter().enumerate() {
            proposal.inputs[sender_input_count + offset].witness_utxo = Some(TxOut {
                value: Amount::from_sat(coin.value),
                script_pubkey: coin.script_pubkey.clone(),
            });
        }
        let unsigned_proposal = psbt::encode_psbt(&proposal);

        // Sign and finalize only our own inputs.
        let secp = self.wallets.secp();
        for (offset, coin) in contribution.coins.iter().enumerate() {
            let index = sender_input_count + offset;
            let wallet = self.wallets.get(&coin.wallet_id).ok_or_else(|| {
                PayjoinError::Internal(TreasuryError::NotFound(format!("wallet {}", coin.wallet_id)))
            })?;
            let key = wallet
                .private_key_at(coin.derivation_change, coin.derivation_index, secp)?
                .ok_or_else(|| {
                    PayjoinError::Internal(TreasuryError::SigningFailed(format!(
                        "wallet {} is not hot",
                        coin.wallet_id
                    )))
                })?;

            psbt::rebase_input_derivation(
                &mut proposal,
                index,
                wallet,
                coin.derivation_change,
                coin.derivation_index,
                secp,
            )?;
            psbt::sign_p2wpkh_input(&mut proposal, index, &key, secp)?;
            psbt::finalize_p2wpkh_input(&mut proposal, index)?;
        }
        psbt::strip_derivation_metadata(&mut proposal);

        // Witnesses do not change the txid, so the unsigned proposal already
        // fixes the final transaction hash.
        let final_txid = proposal.unsigned_tx.compute_txid().to_string();

        self.store.insert_payjoin_record(&PayjoinRecord {
            final_txid: final_txid.clone(),
            original_txid: original.unsigned_tx.compute_txid().to_string(),
            deposit_id: deposit.deposit_id.clone(),
            created_at: Utc::now(),
        })?;

        let request_type = if contribution.batched.is_some() {
            SigningRequestType::ExpressTransferPayjoin
        } else {
            SigningRequestType::DepositPayjoin
        };
        self.ledger.record_completed(
            &final_txid,
            &deposit.wallet_id,
            &unsigned_proposal,
            &psbt::encode_psbt(&proposal),
            request_type,
        )?;

        if let Some(transfer) = &contribution.batched {
            self.store
                .mark_transfers_processing(&[transfer.id], &final_txid)?;
        }

        tracing::info!(
            "Payjoin proposal {} built for deposit {} ({} contributed inputs)",
            final_txid,
            deposit.deposit_id,
            contribution.coins.len()
        );
        Ok(psbt::encode_psbt(&proposal))
    }
}
