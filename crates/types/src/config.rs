//! Runtime configuration for the treasury backend.
//!
//! Loaded once at startup from a TOML file with `TREASURY_*` environment
//! overrides, validated, then passed by reference to every component.
//! Validation failures are fatal: the process refuses to start on a missing
//! wallet set, store path, or indexer URL.

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::TreasuryError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreasuryConfig {
    /// Bitcoin network: "mainnet", "testnet", "signet", or "regtest".
    #[serde(default = "default_network")]
    pub network: String,

    /// HTTP listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SQLite database path.
    pub store_path: String,

    /// Esplora-compatible indexer base URL.
    pub esplora_url: String,

    #[serde(default)]
    pub payjoin: PayjoinConfig,

    pub rebalance: RebalanceConfig,

    /// Configured wallets. At least one must be enabled and hot.
    pub wallets: Vec<WalletConfig>,
}

/// PayJoin negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayjoinConfig {
    /// Fold at most one pending external withdrawal into a negotiation.
    #[serde(default = "default_true")]
    pub batching_enabled: bool,

    /// Delay before the unmodified original transaction is broadcast when a
    /// negotiation produced no counter-proposal.
    #[serde(default = "default_original_broadcast_delay")]
    pub original_broadcast_delay_secs: u64,
}

impl Default for PayjoinConfig {
    fn default() -> Self {
        Self {
            batching_enabled: default_true(),
            original_broadcast_delay_secs: default_original_broadcast_delay(),
        }
    }
}

/// Rebalancer loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    #[serde(default = "default_rebalance_interval")]
    pub interval_secs: u64,

    /// Wallet used as source/sink to keep others near the ideal share.
    pub replenishment_wallet: String,

    /// Ideal share of total enabled balance held by the replenishment wallet,
    /// in percent.
    #[serde(default = "default_ideal_share")]
    pub ideal_share_pct: f64,

    /// Tolerance band around the ideal share, in percentage points.
    #[serde(default = "default_tolerance")]
    pub tolerance_pct: f64,
}

/// One configured wallet account.
///
/// `xpriv` present means the wallet is hot (locally signable); xpub-only
/// wallets require external co-signing through the signing ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub id: String,
    /// Account-level extended public key.
    pub xpub: String,
    /// Account-level extended private key, hot wallets only.
    #[serde(default)]
    pub xpriv: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_original_broadcast_delay() -> u64 {
    60
}

fn default_rebalance_interval() -> u64 {
    600
}

fn default_ideal_share() -> f64 {
    20.0
}

fn default_tolerance() -> f64 {
    2.0
}

impl TreasuryConfig {
    /// Load from a TOML file plus `TREASURY_*` environment overrides.
    pub fn load(path: &str) -> Result<Self, TreasuryError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("TREASURY").separator("__"))
            .build()
            .map_err(|e| TreasuryError::Configuration(format!("Failed to load config: {}", e)))?;

        let cfg: TreasuryConfig = settings
            .try_deserialize()
            .map_err(|e| TreasuryError::Configuration(format!("Invalid config: {}", e)))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration. Called by `load`; also callable on
    /// hand-constructed configs in tests.
    pub fn validate(&self) -> Result<(), TreasuryError> {
        self.bitcoin_network()?;

        if self.store_path.is_empty() {
            return Err(TreasuryError::Configuration(
                "store_path must not be empty".to_string(),
            ));
        }
        if self.esplora_url.is_empty() {
            return Err(TreasuryError::Configuration(
                "esplora_url must not be empty".to_string(),
            ));
        }
        if self.wallets.is_empty() {
            return Err(TreasuryError::Configuration(
                "at least one wallet must be configured".to_string(),
            ));
        }
        if !self
            .wallets
            .iter()
            .any(|w| w.id == self.rebalance.replenishment_wallet)
        {
            return Err(TreasuryError::Configuration(format!(
                "replenishment wallet '{}' is not a configured wallet",
                self.rebalance.replenishment_wallet
            )));
        }
        if !(0.0..=100.0).contains(&self.rebalance.ideal_share_pct) {
            return Err(TreasuryError::Configuration(format!(
                "ideal_share_pct out of range: {}",
                self.rebalance.ideal_share_pct
            )));
        }
        Ok(())
    }

    /// Parse the configured network name.
    pub fn bitcoin_network(&self) -> Result<Network, TreasuryError> {
        match self.network.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Bitcoin),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" | "reg" => Ok(Network::Regtest),
            other => Err(TreasuryError::Configuration(format!(
                "unknown network: '{}'",
                other
            ))),
        }
    }
}
