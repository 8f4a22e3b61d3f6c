//! Blockchain indexer access (Esplora/Blockstream compatible).
//!
//! Everything the engine needs from the chain goes through the [`ChainClient`]
//! trait: per-wallet UTXO enumeration, fee estimation, and broadcast. The
//! production implementation talks to an Esplora-style HTTP API; tests supply
//! their own implementation.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use treasury_types::TreasuryError;

use crate::wallets::WalletBook;

/// How many derivation indexes per branch the Esplora client scans when
/// enumerating a wallet's coins.
const SCAN_DEPTH: u32 = 50;

/// A spendable coin with the derivation data needed to sign it.
#[derive(Debug, Clone)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: u64,
    pub wallet_id: String,
    /// BIP32 branch: 0 = receiving, 1 = change.
    pub derivation_change: u32,
    pub derivation_index: u32,
    pub script_pubkey: ScriptBuf,
}

/// Fee estimates by confirmation target, plus the node's minimum relay rate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeeEstimates {
    #[serde(rename = "3", default)]
    pub fast: f64,
    #[serde(rename = "6", default)]
    pub medium: f64,
    /// Minimum relay fee rate (sat/vB) from the node.
    #[serde(default)]
    pub min_relay_fee: f64,
}

impl FeeEstimates {
    /// Recommended fee rate for normal transactions, never below the relay
    /// minimum or 1 sat/vB.
    pub fn recommended(&self) -> u64 {
        let base = if self.medium > 0.0 {
            self.medium.ceil() as u64
        } else if self.fast > 0.0 {
            self.fast.ceil() as u64
        } else {
            1
        };
        base.max(self.min_relay_rate()).max(1)
    }

    /// Minimum relay rate in whole sat/vB.
    pub fn min_relay_rate(&self) -> u64 {
        self.min_relay_fee.ceil() as u64
    }
}

/// Async access to the blockchain indexer.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// All spendable coins of one configured wallet.
    async fn wallet_coins(&self, wallet_id: &str) -> Result<Vec<Coin>, TreasuryError>;

    /// Current fee estimates.
    async fn fee_estimates(&self) -> Result<FeeEstimates, TreasuryError>;

    /// Broadcast a fully-signed transaction; returns the txid.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, TreasuryError>;
}

// ============================================================================
// Esplora implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

/// `ChainClient` backed by an Esplora-compatible HTTP API.
pub struct EsploraChain {
    base_url: String,
    client: reqwest::Client,
    wallets: Arc<WalletBook>,
}

impl EsploraChain {
    pub fn new(base_url: &str, wallets: Arc<WalletBook>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            wallets,
        }
    }

    async fn address_utxos(&self, address: &str) -> Result<Vec<EsploraUtxo>, TreasuryError> {
        let url = format!("{}/address/{}/utxo", self.base_url, address);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TreasuryError::Chain(format!("UTXO request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TreasuryError::Chain(format!(
                "UTXO API error {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| TreasuryError::Serialization(format!("Failed to parse UTXOs: {}", e)))
    }
}

#[async_trait]
impl ChainClient for EsploraChain {
    async fn wallet_coins(&self, wallet_id: &str) -> Result<Vec<Coin>, TreasuryError> {
        let wallet = self
            .wallets
            .get(wallet_id)
            .ok_or_else(|| TreasuryError::NotFound(format!("wallet {}", wallet_id)))?;

        let mut coins = Vec::new();
        for change in 0..2u32 {
            for index in 0..SCAN_DEPTH {
                let address = wallet.address_at(change, index, self.wallets.network())?;
                let script_pubkey = address.script_pubkey();

                for utxo in self.address_utxos(&address.to_string()).await? {
                    let txid = Txid::from_str(&utxo.txid).map_err(|e| {
                        TreasuryError::Chain(format!("invalid txid from indexer: {}", e))
                    })?;
                    coins.push(Coin {
                        outpoint: OutPoint {
                            txid,
                            vout: utxo.vout,
                        },
                        value: utxo.value,
                        wallet_id: wallet_id.to_string(),
                        derivation_change: change,
                        derivation_index: index,
                        script_pubkey: script_pubkey.clone(),
                    });
                }
            }
        }

        tracing::debug!("Wallet {} has {} spendable coins", wallet_id, coins.len());
        Ok(coins)
    }

    async fn fee_estimates(&self) -> Result<FeeEstimates, TreasuryError> {
        let url = format!("{}/fee-estimates", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TreasuryError::Chain(format!("Fee estimate failed: {}", e)))?;

        if !response.status().is_success() {
            // Conservative defaults when the indexer cannot answer.
            return Ok(FeeEstimates::default());
        }

        response
            .json()
            .await
            .map_err(|e| TreasuryError::Serialization(format!("Failed to parse fees: {}", e)))
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, TreasuryError> {
        let url = format!("{}/tx", self.base_url);

        let response = self
            .client
            .post(&url)
            .body(serialize_hex(tx))
            .send()
            .await
            .map_err(|e| TreasuryError::Chain(format!("Broadcast failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TreasuryError::Chain(format!(
                "Broadcast rejected {}: {}",
                status, body
            )));
        }

        let txid_text = response
            .text()
            .await
            .map_err(|e| TreasuryError::Chain(format!("Failed to read txid: {}", e)))?;
        Txid::from_str(txid_text.trim())
            .map_err(|e| TreasuryError::Chain(format!("Invalid txid in response: {}", e)))
    }
}
