//! Periodic withdrawal batching and wallet replenishment.
//!
//! Each cycle batches pending external withdrawals oldest-first into one
//! hot-wallet transaction, then checks the replenishment wallet's share of
//! the total enabled balance against the configured ideal band. Internal
//! transfers are never resumed across restarts; they are cancelled at
//! startup and recomputed from fresh balances.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use treasury_storage::TreasuryStore;
use treasury_types::{
    RebalanceConfig, SigningRequestStatus, SigningRequestType, TransferRequestRecord,
    TransferStatus, TransferType, TreasuryError, DUST_LIMIT,
};

use crate::chain::{ChainClient, Coin};
use crate::ledger::SigningRequestLedger;
use crate::locks::CoinLockManager;
use crate::psbt::{self, estimate_vbytes};
use crate::selector;
use crate::wallets::WalletBook;

/// Funding a withdrawal either succeeds or is an expected outcome, not an
/// error: the request simply waits for the next cycle.
#[derive(Debug, PartialEq, Eq)]
enum FundingOutcome {
    Funded,
    InsufficientFunds,
}

/// The batch transaction under construction for one cycle.
#[derive(Default)]
struct BatchDraft {
    inputs: Vec<Coin>,
    input_total: u64,
    outputs: Vec<(ScriptBuf, u64)>,
    transfers: Vec<TransferRequestRecord>,
    /// Redirected change destination; the default is the first hot wallet's
    /// change branch.
    change_script: Option<ScriptBuf>,
    /// Set when the replenishment output absorbed the residual: the batch
    /// carries no change output at all.
    suppress_change: bool,
}

impl BatchDraft {
    fn output_total(&self) -> u64 {
        self.outputs.iter().map(|(_, v)| v).sum()
    }

    fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

pub struct TreasuryRebalancer {
    store: Arc<TreasuryStore>,
    chain: Arc<dyn ChainClient>,
    wallets: Arc<WalletBook>,
    locks: CoinLockManager,
    ledger: Arc<SigningRequestLedger>,
    config: RebalanceConfig,
}

fn fee_for(rate: u64, inputs: usize, outputs: usize) -> u64 {
    rate * estimate_vbytes(inputs, outputs)
}

impl TreasuryRebalancer {
    pub fn new(
        store: Arc<TreasuryStore>,
        chain: Arc<dyn ChainClient>,
        wallets: Arc<WalletBook>,
        locks: CoinLockManager,
        ledger: Arc<SigningRequestLedger>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            store,
            chain,
            wallets,
            locks,
            ledger,
            config,
        }
    }

    /// Cancel leftover internal transfers and expire their signing requests.
    /// Balances may have shifted while the process was down, so internal
    /// rebalancing intents are recomputed, never resumed.
    pub fn startup(&self) -> Result<(), TreasuryError> {
        let linked = self.store.cancel_pending_internal_transfers()?;
        for request_id in linked {
            if let Err(e) = self.store.set_signing_request_status(
                &request_id,
                SigningRequestStatus::Expired,
                None,
            ) {
                tracing::warn!("Could not expire signing request {}: {}", request_id, e);
            }
        }
        Ok(())
    }

    /// One rebalancing pass: fund pending withdrawals, then correct the
    /// replenishment wallet's balance share, then sign and broadcast the
    /// resulting batch if one was built.
    pub async fn cycle(&self) -> Result<(), TreasuryError> {
        let fees = self.chain.fee_estimates().await?;
        let rate = fees.recommended();

        let balances = self.enabled_balances().await?;
        let mut candidates = self.hot_candidates().await?;

        let mut draft = self.fund_withdrawals(&mut candidates, rate)?;
        self.apply_replenishment(&mut draft, &mut candidates, &balances, rate)
            .await?;

        if draft.is_empty() {
            return Ok(());
        }
        match self.execute_batch(&draft, rate).await {
            Ok(txid) => {
                tracing::info!(
                    "Rebalance batch {} broadcast: {} transfers, {} inputs",
                    txid,
                    draft.transfers.len(),
                    draft.inputs.len()
                );
                Ok(())
            }
            Err(e) => {
                let taken: Vec<OutPoint> = draft.inputs.iter().map(|c| c.outpoint).collect();
                self.locks.try_unlock(&taken)?;
                Err(e)
            }
        }
    }

    async fn enabled_balances(&self) -> Result<HashMap<String, u64>, TreasuryError> {
        let mut balances = HashMap::new();
        for wallet in self.wallets.enabled() {
            let coins = self.chain.wallet_coins(&wallet.id).await?;
            balances.insert(wallet.id.clone(), coins.iter().map(|c| c.value).sum());
        }
        Ok(balances)
    }

    /// Spendable hot coins in masked-hash order, locked coins excluded.
    async fn hot_candidates(&self) -> Result<Vec<Coin>, TreasuryError> {
        let mut coins = Vec::new();
        for wallet in self.wallets.hot() {
            coins.extend(self.chain.wallet_coins(&wallet.id).await?);
        }
        let mut coins = self.locks.filter_out_locked(coins)?;
        selector::order_candidates(&mut coins);
        Ok(coins)
    }

    /// Fold pending external withdrawals into the draft, oldest first, with
    /// a monotonic amount cutoff: once a request fails to fit, every later
    /// request of equal or larger amount is skipped, while smaller ones are
    /// still tried.
    fn fund_withdrawals(
        &self,
        candidates: &mut Vec<Coin>,
        rate: u64,
    ) -> Result<BatchDraft, TreasuryError> {
        let pending = self
            .store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::External))?;

        let mut draft = BatchDraft::default();
        let mut cutoff: Option<u64> = None;

        for transfer in pending {
            if cutoff.is_some_and(|c| transfer.amount_sats >= c) {
                continue;
            }

            let destination = match Address::from_str(&transfer.destination)
                .and_then(|a| a.require_network(self.wallets.network()).map_err(Into::into))
            {
                Ok(address) => address,
                Err(e) => {
                    tracing::warn!("Transfer {} has a bad destination: {}", transfer.id, e);
                    continue;
                }
            };

            match self.extend_funding(&mut draft, candidates, transfer.amount_sats, rate)? {
                FundingOutcome::Funded => {
                    draft
                        .outputs
                        .push((destination.script_pubkey(), transfer.amount_sats));
                    draft.transfers.push(transfer);
                }
                FundingOutcome::InsufficientFunds => {
                    tracing::info!(
                        "Transfer {} ({} sats) does not fit this cycle",
                        transfer.id,
                        transfer.amount_sats
                    );
                    cutoff = Some(cutoff.map_or(transfer.amount_sats, |c| c.min(transfer.amount_sats)));
                }
            }
        }

        Ok(draft)
    }

    /// Lock additional candidates until the draft covers one more output of
    /// `amount` plus fees. On a shortfall, every coin locked for this attempt
    /// is released and returned to the candidate pool.
    fn extend_funding(
        &self,
        draft: &mut BatchDraft,
        candidates: &mut Vec<Coin>,
        amount: u64,
        rate: u64,
    ) -> Result<FundingOutcome, TreasuryError> {
        let target = draft.output_total() + amount;
        let mut added: Vec<Coin> = Vec::new();
        let mut added_total = 0u64;

        loop {
            // Outputs so far, the new one, and a change output.
            let fee = fee_for(
                rate,
                draft.inputs.len() + added.len(),
                draft.outputs.len() + 2,
            );
            if draft.input_total + added_total >= target + fee {
                for coin in added {
                    draft.input_total += coin.value;
                    draft.inputs.push(coin);
                }
                return Ok(FundingOutcome::Funded);
            }

            let coin = loop {
                if candidates.is_empty() {
                    let taken: Vec<OutPoint> = added.iter().map(|c| c.outpoint).collect();
                    self.locks.try_unlock(&taken)?;
                    for coin in added.into_iter().rev() {
                        candidates.insert(0, coin);
                    }
                    return Ok(FundingOutcome::InsufficientFunds);
                }
                let coin = candidates.remove(0);
                if self.locks.try_lock(&coin.outpoint)? {
                    break coin;
                }
                // Locked elsewhere in the meantime; drop it for this cycle.
            };
            added_total += coin.value;
            added.push(coin);
        }
    }

    /// Compare the replenishment wallet's projected share of the enabled
    /// balance against the ideal band and correct it.
    async fn apply_replenishment(
        &self,
        draft: &mut BatchDraft,
        candidates: &mut Vec<Coin>,
        balances: &HashMap<String, u64>,
        rate: u64,
    ) -> Result<(), TreasuryError> {
        let repl_id = &self.config.replenishment_wallet;
        let repl_wallet = match self.wallets.get(repl_id) {
            Some(w) if w.enabled => w,
            _ => {
                tracing::warn!("Replenishment wallet {} not configured or disabled", repl_id);
                return Ok(());
            }
        };

        // Project balances past the draft: spent coins leave their wallets,
        // change returns to the change wallet, external outputs leave the
        // treasury entirely.
        let mut projected = balances.clone();
        for coin in &draft.inputs {
            if let Some(balance) = projected.get_mut(&coin.wallet_id) {
                *balance = balance.saturating_sub(coin.value);
            }
        }
        let change = self.draft_change(draft, rate);
        if change > 0 {
            let change_wallet = self.change_wallet_id()?;
            *projected.entry(change_wallet).or_insert(0) += change;
        }

        let total: u64 = projected.values().sum();
        if total == 0 {
            return Ok(());
        }
        let repl_balance = projected.get(repl_id).copied().unwrap_or(0);
        let share_pct = repl_balance as f64 * 100.0 / total as f64;

        let low = self.config.ideal_share_pct - self.config.tolerance_pct;
        let high = self.config.ideal_share_pct + self.config.tolerance_pct;
        let ideal = (self.config.ideal_share_pct / 100.0 * total as f64) as u64;

        if share_pct < low {
            let deficit = ideal.saturating_sub(repl_balance);
            self.replenish_from_hot(draft, candidates, repl_wallet.id.clone(), deficit, change, rate)
        } else if share_pct > high {
            let excess = repl_balance.saturating_sub(ideal);
            self.distribute_excess(&projected, repl_balance, excess).await
        } else {
            Ok(())
        }
    }

    /// Change the draft would currently produce, zero when below dust.
    fn draft_change(&self, draft: &BatchDraft, rate: u64) -> u64 {
        if draft.inputs.is_empty() {
            return 0;
        }
        let fee = fee_for(rate, draft.inputs.len(), draft.outputs.len() + 1);
        let residual = draft
            .input_total
            .saturating_sub(draft.output_total())
            .saturating_sub(fee);
        if residual >= DUST_LIMIT {
            residual
        } else {
            0
        }
    }

    /// Below tolerance: either redirect the batch's own change to the
    /// replenishment wallet (when the shortfall is within 2% of it), or add
    /// an explicit replenishment output absorbing the residual, funded from
    /// hot coins and recorded as an internal transfer.
    fn replenish_from_hot(
        &self,
        draft: &mut BatchDraft,
        candidates: &mut Vec<Coin>,
        repl_wallet_id: String,
        deficit: u64,
        change: u64,
        rate: u64,
    ) -> Result<(), TreasuryError> {
        let repl_wallet = self
            .wallets
            .get(&repl_wallet_id)
            .ok_or_else(|| TreasuryError::Configuration(format!("unknown wallet {}", repl_wallet_id)))?;
        let repl_script = repl_wallet
            .address_at(0, 0, self.wallets.network())?
            .script_pubkey();

        if change > 0 && deficit.abs_diff(change) * 50 <= change {
            // Shortfall within 2% of the change amount: redirect it.
            draft.change_script = Some(repl_script);
            tracing::info!(
                "Redirecting {} sats of change to replenishment wallet {}",
                change,
                repl_wallet_id
            );
            return Ok(());
        }

        // Extend inputs until the residual covers the deficit, then hand the
        // whole residual to the replenishment wallet; no change output.
        let mut added: Vec<Coin> = Vec::new();
        let mut added_total = 0u64;
        while draft.input_total + added_total < draft.output_total() + deficit {
            let coin = loop {
                if candidates.is_empty() {
                    break None;
                }
                let coin = candidates.remove(0);
                if self.locks.try_lock(&coin.outpoint)? {
                    break Some(coin);
                }
            };
            match coin {
                Some(coin) => {
                    added_total += coin.value;
                    added.push(coin);
                }
                None => break,
            }
        }

        let fee = fee_for(
            rate,
            draft.inputs.len() + added.len(),
            draft.outputs.len() + 1,
        );
        let amount = (draft.input_total + added_total)
            .saturating_sub(draft.output_total())
            .saturating_sub(fee);
        if amount < DUST_LIMIT {
            let taken: Vec<OutPoint> = added.iter().map(|c| c.outpoint).collect();
            self.locks.try_unlock(&taken)?;
            tracing::info!("Insufficient hot funds for replenishment this cycle");
            return Ok(());
        }

        for coin in added {
            draft.input_total += coin.value;
            draft.inputs.push(coin);
        }

        let transfer = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: amount,
            destination: repl_wallet.address_at(0, 0, self.wallets.network())?.to_string(),
            status: TransferStatus::Pending,
            transfer_type: TransferType::Internal,
            signing_request_id: None,
            created_at: Utc::now(),
        };
        self.store.insert_transfer_request(&transfer)?;

        draft.outputs.push((repl_script, amount));
        draft.transfers.push(transfer);
        draft.suppress_change = true;
        tracing::info!(
            "Replenishing wallet {} with {} sats",
            repl_wallet_id,
            amount
        );
        Ok(())
    }

    /// Above tolerance: distribute the excess proportionally from the
    /// replenishment wallet to every other enabled wallet. The replenishment
    /// wallet is not assumed hot, so the transaction is left as a pending
    /// signing request awaiting one external co-signature.
    async fn distribute_excess(
        &self,
        projected: &HashMap<String, u64>,
        repl_balance: u64,
        excess: u64,
    ) -> Result<(), TreasuryError> {
        // At most one distribution is open at a time; a rebuild over the
        // same coin set would produce the same txid.
        let open = self.ledger.list(
            Some(SigningRequestStatus::Pending),
            Some(SigningRequestType::Replenishment),
        )?;
        if !open.is_empty() {
            tracing::debug!(
                "Distribution {} still awaiting co-signature; skipping",
                open[0].id
            );
            return Ok(());
        }

        let repl_id = &self.config.replenishment_wallet;
        let repl_wallet = self
            .wallets
            .get(repl_id)
            .ok_or_else(|| TreasuryError::Configuration(format!("unknown wallet {}", repl_id)))?;
        let network = self.wallets.network();

        let others_total: u64 = projected
            .iter()
            .filter(|(id, _)| id.as_str() != repl_id)
            .map(|(_, v)| v)
            .sum();

        // Destination wallets and their proportional shares.
        let mut outputs: Vec<(String, ScriptBuf, u64)> = Vec::new();
        for wallet in self.wallets.enabled() {
            if &wallet.id == repl_id {
                continue;
            }
            let balance = projected.get(&wallet.id).copied().unwrap_or(0);
            let amount = if others_total > 0 {
                (excess as u128 * balance as u128 / others_total as u128) as u64
            } else {
                excess / self.wallets.enabled().len().saturating_sub(1).max(1) as u64
            };
            if amount < DUST_LIMIT {
                continue;
            }
            let script = wallet.address_at(0, 0, network)?.script_pubkey();
            outputs.push((wallet.id.clone(), script, amount));
        }
        if outputs.is_empty() {
            return Ok(());
        }

        let fees = self.chain.fee_estimates().await?;
        let rate = fees.recommended();
        let distributed: u64 = outputs.iter().map(|(_, _, v)| v).sum();

        // Fund from the replenishment wallet's own coins.
        let mut coins = self
            .locks
            .filter_out_locked(self.chain.wallet_coins(repl_id).await?)?;
        selector::order_candidates(&mut coins);

        let mut inputs: Vec<Coin> = Vec::new();
        let mut input_total = 0u64;
        for coin in coins {
            let fee = fee_for(rate, inputs.len(), outputs.len() + 1);
            if input_total >= distributed + fee {
                break;
            }
            if self.locks.try_lock(&coin.outpoint)? {
                input_total += coin.value;
                inputs.push(coin);
            }
        }
        let fee = fee_for(rate, inputs.len(), outputs.len() + 1);
        if input_total < distributed + fee {
            let taken: Vec<OutPoint> = inputs.iter().map(|c| c.outpoint).collect();
            self.locks.try_unlock(&taken)?;
            tracing::info!(
                "Replenishment wallet {} ({} sats available) cannot fund distribution",
                repl_id,
                repl_balance
            );
            return Ok(());
        }

        let mut tx_outputs: Vec<TxOut> = outputs
            .iter()
            .map(|(_, script, amount)| TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: script.clone(),
            })
            .collect();
        let change = input_total - distributed - fee;
        if change >= DUST_LIMIT {
            tx_outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: repl_wallet.address_at(1, 0, network)?.script_pubkey(),
            });
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|coin| TxIn {
                    previous_output: coin.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: tx_outputs,
        };

        let mut unsigned = Psbt::from_unsigned_tx(tx)
            .map_err(|e| TreasuryError::InvalidPsbt(e.to_string()))?;
        for (i, coin) in inputs.iter().enumerate() {
            unsigned.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(coin.value),
                script_pubkey: coin.script_pubkey.clone(),
            });
            psbt::rebase_input_derivation(
                &mut unsigned,
                i,
                repl_wallet,
                coin.derivation_change,
                coin.derivation_index,
                self.wallets.secp(),
            )?;
        }

        let txid = unsigned.unsigned_tx.compute_txid().to_string();
        self.ledger.open_request(
            &txid,
            repl_id,
            &psbt::encode_psbt(&unsigned),
            1,
            SigningRequestType::Replenishment,
        )?;

        for (wallet_id, _, amount) in &outputs {
            let wallet = self
                .wallets
                .get(wallet_id)
                .ok_or_else(|| TreasuryError::Configuration(format!("unknown wallet {}", wallet_id)))?;
            self.store.insert_transfer_request(&TransferRequestRecord {
                id: Uuid::new_v4(),
                amount_sats: *amount,
                destination: wallet.address_at(0, 0, network)?.to_string(),
                status: TransferStatus::Pending,
                transfer_type: TransferType::Internal,
                signing_request_id: Some(txid.clone()),
                created_at: Utc::now(),
            })?;
        }

        tracing::info!(
            "Opened replenishment distribution {} for {} sats across {} wallets",
            txid,
            distributed,
            outputs.len()
        );
        Ok(())
    }

    fn change_wallet_id(&self) -> Result<String, TreasuryError> {
        self.wallets
            .hot()
            .first()
            .map(|w| w.id.clone())
            .ok_or_else(|| TreasuryError::Configuration("no hot wallet available".to_string()))
    }

    /// Sign the batch with hot keys, record it as an already-signed request,
    /// mark the fulfilled transfers, and broadcast.
    async fn execute_batch(&self, draft: &BatchDraft, rate: u64) -> Result<String, TreasuryError> {
        let network = self.wallets.network();

        let mut tx_outputs: Vec<TxOut> = draft
            .outputs
            .iter()
            .map(|(script, amount)| TxOut {
                value: Amount::from_sat(*amount),
                script_pubkey: script.clone(),
            })
            .collect();

        if !draft.suppress_change {
            let change = self.draft_change(draft, rate);
            if change > 0 {
                let script = match &draft.change_script {
                    Some(script) => script.clone(),
                    None => {
                        let change_wallet = self.change_wallet_id()?;
                        let wallet = self.wallets.get(&change_wallet).ok_or_else(|| {
                            TreasuryError::Configuration(format!("unknown wallet {}", change_wallet))
                        })?;
                        wallet.address_at(1, 0, network)?.script_pubkey()
                    }
                };
                tx_outputs.push(TxOut {
                    value: Amount::from_sat(change),
                    script_pubkey: script,
                });
            }
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: draft
                .inputs
                .iter()
                .map(|coin| TxIn {
                    previous_output: coin.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::default(),
                })
                .collect(),
            output: tx_outputs,
        };

        let mut signed = Psbt::from_unsigned_tx(tx)
            .map_err(|e| TreasuryError::InvalidPsbt(e.to_string()))?;
        let secp = self.wallets.secp();
        for (i, coin) in draft.inputs.iter().enumerate() {
            signed.inputs[i].witness_utxo = Some(TxOut {
                value: Amount::from_sat(coin.value),
                script_pubkey: coin.script_pubkey.clone(),
            });
            let wallet = self.wallets.get(&coin.wallet_id).ok_or_else(|| {
                TreasuryError::Configuration(format!("unknown wallet {}", coin.wallet_id))
            })?;
            psbt::rebase_input_derivation(
                &mut signed,
                i,
                wallet,
                coin.derivation_change,
                coin.derivation_index,
                secp,
            )?;
        }
        let unsigned_psbt = psbt::encode_psbt(&signed);

        for (i, coin) in draft.inputs.iter().enumerate() {
            let wallet = self.wallets.get(&coin.wallet_id).ok_or_else(|| {
                TreasuryError::Configuration(format!("unknown wallet {}", coin.wallet_id))
            })?;
            let key = wallet
                .private_key_at(coin.derivation_change, coin.derivation_index, secp)?
                .ok_or_else(|| {
                    TreasuryError::SigningFailed(format!("wallet {} is not hot", coin.wallet_id))
                })?;
            psbt::sign_p2wpkh_input(&mut signed, i, &key, secp)?;
            psbt::finalize_p2wpkh_input(&mut signed, i)?;
        }

        let final_psbt = psbt::encode_psbt(&signed);
        let tx = psbt::extract_tx(signed)?;
        let txid = tx.compute_txid().to_string();

        self.ledger.record_completed(
            &txid,
            &self.change_wallet_id()?,
            &unsigned_psbt,
            &final_psbt,
            SigningRequestType::HotWallet,
        )?;

        let transfer_ids: Vec<Uuid> = draft.transfers.iter().map(|t| t.id).collect();
        self.store.mark_transfers_processing(&transfer_ids, &txid)?;

        self.chain.broadcast(&tx).await?;
        Ok(txid)
    }

    /// Spawn the rebalance loop. Runs startup cleanup once, then cycles on
    /// the configured interval; cycle errors are logged and swallowed.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.startup() {
                tracing::error!("Rebalancer startup cleanup failed: {}", e);
            }
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => {
                        tracing::info!("Rebalancer shutting down");
                        return;
                    }
                }
                if *shutdown.borrow() {
                    tracing::info!("Rebalancer shutting down");
                    return;
                }
                if let Err(e) = self.cycle().await {
                    tracing::error!("Rebalance cycle failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, Txid};
    use chrono::TimeDelta;

    use crate::testutil::MockChain;
    use crate::wallets::tests::{test_xpub, TEST_XPRIV};
    use treasury_types::{
        PayjoinConfig, SigningRequestRecord, TreasuryConfig, WalletConfig, SATS_PER_BTC,
    };

    fn two_wallet_config(replenishment_wallet: &str) -> TreasuryConfig {
        TreasuryConfig {
            network: "regtest".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            store_path: ":memory:".to_string(),
            esplora_url: "http://localhost:3002".to_string(),
            payjoin: PayjoinConfig::default(),
            rebalance: RebalanceConfig {
                interval_secs: 600,
                replenishment_wallet: replenishment_wallet.to_string(),
                ideal_share_pct: 20.0,
                tolerance_pct: 2.0,
            },
            wallets: vec![
                WalletConfig {
                    id: "hot-1".to_string(),
                    xpub: test_xpub().to_string(),
                    xpriv: Some(TEST_XPRIV.to_string()),
                    enabled: true,
                },
                WalletConfig {
                    id: "reserve".to_string(),
                    xpub: test_xpub().to_string(),
                    xpriv: None,
                    enabled: true,
                },
            ],
        }
    }

    struct Fixture {
        rebalancer: TreasuryRebalancer,
        store: Arc<TreasuryStore>,
        chain: Arc<MockChain>,
        book: Arc<WalletBook>,
    }

    fn fixture(config: TreasuryConfig) -> Fixture {
        let store = Arc::new(TreasuryStore::open_in_memory().unwrap());
        let chain = Arc::new(MockChain::with_fees(20.0, 10.0, 1.0));
        let book = Arc::new(WalletBook::from_config(&config).unwrap());
        let locks = CoinLockManager::new(Arc::clone(&store));
        let ledger = Arc::new(SigningRequestLedger::new(
            Arc::clone(&store),
            chain.clone() as Arc<dyn ChainClient>,
        ));
        let rebalancer = TreasuryRebalancer::new(
            Arc::clone(&store),
            chain.clone() as Arc<dyn ChainClient>,
            Arc::clone(&book),
            locks,
            ledger,
            config.rebalance.clone(),
        );
        Fixture {
            rebalancer,
            store,
            chain,
            book,
        }
    }

    impl Fixture {
        fn add_coins(&self, wallet_id: &str, count: u8, value: u64) {
            let wallet = self.book.get(wallet_id).unwrap();
            let coins = (0..count)
                .map(|n| {
                    let index = n as u32 + 1;
                    let script = wallet
                        .address_at(0, index, Network::Regtest)
                        .unwrap()
                        .script_pubkey();
                    Coin {
                        outpoint: OutPoint {
                            txid: Txid::from_byte_array([n.wrapping_add(1); 32]),
                            vout: if wallet_id == "reserve" { 1 } else { 0 },
                        },
                        value,
                        wallet_id: wallet_id.to_string(),
                        derivation_change: 0,
                        derivation_index: index,
                        script_pubkey: script,
                    }
                })
                .collect();
            self.chain.add_coins(wallet_id, coins);
        }

        fn withdrawal(&self, amount_sats: u64, age_secs: i64) -> TransferRequestRecord {
            let destination = self
                .book
                .get("hot-1")
                .unwrap()
                .address_at(0, 60, Network::Regtest)
                .unwrap()
                .to_string();
            let transfer = TransferRequestRecord {
                id: Uuid::new_v4(),
                amount_sats,
                destination,
                status: TransferStatus::Pending,
                transfer_type: TransferType::External,
                signing_request_id: None,
                created_at: Utc::now() - TimeDelta::seconds(age_secs),
            };
            self.store.insert_transfer_request(&transfer).unwrap();
            transfer
        }
    }

    #[test]
    fn test_startup_cancels_internal_and_expires_requests() {
        let fx = fixture(two_wallet_config("reserve"));
        fx.store
            .insert_signing_request(&SigningRequestRecord {
                id: "sr-old".to_string(),
                wallet_id: "hot-1".to_string(),
                unsigned_psbt: "cHNidP8BAA==".to_string(),
                final_psbt: None,
                required_signatures: 1,
                status: SigningRequestStatus::Pending,
                request_type: SigningRequestType::Replenishment,
                failure_reason: None,
                created_at: Utc::now(),
            })
            .unwrap();
        let transfer = TransferRequestRecord {
            id: Uuid::new_v4(),
            amount_sats: 10_000,
            destination: "addr".to_string(),
            status: TransferStatus::Pending,
            transfer_type: TransferType::Internal,
            signing_request_id: Some("sr-old".to_string()),
            created_at: Utc::now(),
        };
        fx.store.insert_transfer_request(&transfer).unwrap();

        fx.rebalancer.startup().unwrap();

        let loaded = fx.store.get_transfer_request(&transfer.id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Cancelled);
        let request = fx.store.get_signing_request("sr-old").unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_fifo_with_monotonic_cutoff() {
        // The "reserve" wallet holds nothing and is below tolerance, so the
        // batch residual replenishes it instead of returning as change; the
        // withdrawal bookkeeping is unaffected.
        let fx = fixture(two_wallet_config("reserve"));
        fx.add_coins("hot-1", 4, 1_000_000);

        let t1 = fx.withdrawal(1_000_000, 50); // 0.01 BTC, oldest
        let t2 = fx.withdrawal(2_000_000, 40); // 0.02 BTC
        let t3 = fx.withdrawal(50_000_000, 30); // 0.5 BTC, does not fit
        let t4 = fx.withdrawal(60_000_000, 20); // above the cutoff, skipped
        let t5 = fx.withdrawal(500_000, 10); // smaller than the cutoff, fits

        fx.rebalancer.cycle().await.unwrap();

        let processed = |t: &TransferRequestRecord| {
            fx.store.get_transfer_request(&t.id).unwrap().unwrap().status
        };
        assert_eq!(processed(&t1), TransferStatus::Processing);
        assert_eq!(processed(&t2), TransferStatus::Processing);
        assert_eq!(processed(&t3), TransferStatus::Pending);
        assert_eq!(processed(&t4), TransferStatus::Pending);
        assert_eq!(processed(&t5), TransferStatus::Processing);

        assert_eq!(fx.chain.broadcast_count(), 1);
        let broadcasts = fx.chain.broadcasts.lock().unwrap();
        let txid = broadcasts[0].compute_txid().to_string();
        drop(broadcasts);

        let request = fx.store.get_signing_request(&txid).unwrap().unwrap();
        assert_eq!(request.status, SigningRequestStatus::Signed);
        assert_eq!(request.required_signatures, 0);
        assert_eq!(request.request_type, SigningRequestType::HotWallet);
    }

    #[tokio::test]
    async fn test_below_tolerance_creates_internal_transfer() {
        // Total enabled balance 10 BTC, reserve holds 1 BTC (10% against an
        // ideal of 20% ± 2): the deficit of 1 BTC is funded from hot coins,
        // minus fees.
        let fx = fixture(two_wallet_config("reserve"));
        fx.add_coins("hot-1", 90, SATS_PER_BTC / 10);
        fx.add_coins("reserve", 1, SATS_PER_BTC);

        let balances = fx.rebalancer.enabled_balances().await.unwrap();
        let mut candidates = fx.rebalancer.hot_candidates().await.unwrap();
        let mut draft = BatchDraft::default();
        fx.rebalancer
            .apply_replenishment(&mut draft, &mut candidates, &balances, 10)
            .await
            .unwrap();

        let internal = fx
            .store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::Internal))
            .unwrap();
        assert_eq!(internal.len(), 1);
        let amount = internal[0].amount_sats;
        assert!(amount >= 90_000_000 && amount < SATS_PER_BTC, "amount {}", amount);

        assert!(draft.suppress_change);
        assert_eq!(draft.outputs.last().unwrap().1, amount);
    }

    #[tokio::test]
    async fn test_below_tolerance_full_cycle_broadcasts_batch() {
        let fx = fixture(two_wallet_config("reserve"));
        fx.add_coins("hot-1", 90, SATS_PER_BTC / 10);
        fx.add_coins("reserve", 1, SATS_PER_BTC);

        fx.rebalancer.cycle().await.unwrap();

        assert_eq!(fx.chain.broadcast_count(), 1);
        let internal = fx
            .store
            .list_transfer_requests(Some(TransferStatus::Processing), Some(TransferType::Internal))
            .unwrap();
        assert_eq!(internal.len(), 1);
        assert!(internal[0].signing_request_id.is_some());
    }

    #[tokio::test]
    async fn test_above_tolerance_opens_cosigned_distribution() {
        // The replenishment wallet holds half of the treasury; the excess is
        // distributed to the other wallet through a request awaiting one
        // co-signature. Nothing is broadcast yet.
        let fx = fixture(two_wallet_config("hot-1"));
        fx.add_coins("hot-1", 5, SATS_PER_BTC);
        fx.add_coins("reserve", 5, SATS_PER_BTC);

        fx.rebalancer.cycle().await.unwrap();

        assert_eq!(fx.chain.broadcast_count(), 0);
        let pending = fx
            .rebalancer
            .ledger
            .list(Some(SigningRequestStatus::Pending), None)
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].required_signatures, 1);
        assert_eq!(pending[0].request_type, SigningRequestType::Replenishment);

        let internal = fx
            .store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::Internal))
            .unwrap();
        assert_eq!(internal.len(), 1);
        assert_eq!(
            internal[0].signing_request_id.as_deref(),
            Some(pending[0].id.as_str())
        );
        // Excess over the ideal 2 BTC share: 3 BTC.
        assert_eq!(internal[0].amount_sats, 3 * SATS_PER_BTC);
    }

    #[tokio::test]
    async fn test_open_distribution_is_not_rebuilt() {
        let fx = fixture(two_wallet_config("hot-1"));
        fx.add_coins("hot-1", 5, SATS_PER_BTC);
        fx.add_coins("reserve", 5, SATS_PER_BTC);

        fx.rebalancer.cycle().await.unwrap();
        // The lock sweeper may free the distribution's coins while the
        // request still awaits its co-signature; the next cycle sees the
        // same balances.
        fx.store.sweep_selection_locks(0).unwrap();
        fx.rebalancer.cycle().await.unwrap();

        let pending = fx
            .rebalancer
            .ledger
            .list(
                Some(SigningRequestStatus::Pending),
                Some(SigningRequestType::Replenishment),
            )
            .unwrap();
        assert_eq!(pending.len(), 1);

        let internal = fx
            .store
            .list_transfer_requests(Some(TransferStatus::Pending), Some(TransferType::Internal))
            .unwrap();
        assert_eq!(internal.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_is_a_no_op() {
        let fx = fixture(two_wallet_config("reserve"));
        fx.rebalancer.cycle().await.unwrap();
        assert_eq!(fx.chain.broadcast_count(), 0);
    }
}
