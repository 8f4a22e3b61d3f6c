//! Configured treasury wallets and their key material.
//!
//! Each wallet carries an account-level extended public key and, for hot
//! wallets, the matching extended private key. All addresses are P2WPKH
//! derived at (change, index) below the account key. Key material is loaded
//! once at startup; rotating keys requires a restart.

use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};

use treasury_types::{TreasuryConfig, TreasuryError, WalletConfig};

/// One configured wallet account.
pub struct TreasuryWallet {
    pub id: String,
    xpub: Xpub,
    xpriv: Option<Xpriv>,
    pub enabled: bool,
}

impl TreasuryWallet {
    fn from_config(cfg: &WalletConfig, secp: &Secp256k1<All>) -> Result<Self, TreasuryError> {
        let xpub = Xpub::from_str(&cfg.xpub).map_err(|e| {
            TreasuryError::Configuration(format!("wallet {}: invalid xpub: {}", cfg.id, e))
        })?;

        let xpriv = match &cfg.xpriv {
            Some(raw) => {
                let xpriv = Xpriv::from_str(raw).map_err(|e| {
                    TreasuryError::Configuration(format!("wallet {}: invalid xpriv: {}", cfg.id, e))
                })?;
                if Xpub::from_priv(secp, &xpriv) != xpub {
                    return Err(TreasuryError::Configuration(format!(
                        "wallet {}: xpriv does not match xpub",
                        cfg.id
                    )));
                }
                Some(xpriv)
            }
            None => None,
        };

        Ok(Self {
            id: cfg.id.clone(),
            xpub,
            xpriv,
            enabled: cfg.enabled,
        })
    }

    /// Whether this wallet can sign locally.
    pub fn is_hot(&self) -> bool {
        self.xpriv.is_some()
    }

    /// Fingerprint of the account key, used in PSBT derivation metadata.
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub.fingerprint()
    }

    /// Derivation path below the account key for (change, index).
    pub fn derivation_path(change: u32, index: u32) -> Result<DerivationPath, TreasuryError> {
        let path = vec![
            ChildNumber::from_normal_idx(change)
                .map_err(|e| TreasuryError::Internal(format!("bad change branch: {}", e)))?,
            ChildNumber::from_normal_idx(index)
                .map_err(|e| TreasuryError::Internal(format!("bad address index: {}", e)))?,
        ];
        Ok(DerivationPath::from(path))
    }

    /// Public key at (change, index).
    pub fn public_key_at(
        &self,
        change: u32,
        index: u32,
        secp: &Secp256k1<All>,
    ) -> Result<CompressedPublicKey, TreasuryError> {
        let path = Self::derivation_path(change, index)?;
        let child = self
            .xpub
            .derive_pub(secp, &path)
            .map_err(|e| TreasuryError::Internal(format!("derivation failed: {}", e)))?;
        Ok(child.to_pub())
    }

    /// Private key at (change, index); `None` for cold wallets.
    pub fn private_key_at(
        &self,
        change: u32,
        index: u32,
        secp: &Secp256k1<All>,
    ) -> Result<Option<PrivateKey>, TreasuryError> {
        let xpriv = match &self.xpriv {
            Some(x) => x,
            None => return Ok(None),
        };
        let path = Self::derivation_path(change, index)?;
        let child = xpriv
            .derive_priv(secp, &path)
            .map_err(|e| TreasuryError::Internal(format!("derivation failed: {}", e)))?;
        Ok(Some(child.to_priv()))
    }

    /// P2WPKH address at (change, index).
    pub fn address_at(
        &self,
        change: u32,
        index: u32,
        network: Network,
    ) -> Result<Address, TreasuryError> {
        let secp = Secp256k1::new();
        let pk = self.public_key_at(change, index, &secp)?;
        Ok(Address::p2wpkh(&pk, network))
    }
}

/// The validated set of configured wallets.
pub struct WalletBook {
    wallets: Vec<TreasuryWallet>,
    network: Network,
    secp: Secp256k1<All>,
}

impl WalletBook {
    /// Build from validated configuration. At least one enabled hot wallet is
    /// required; the replenishment wallet must exist but need not be hot.
    pub fn from_config(cfg: &TreasuryConfig) -> Result<Self, TreasuryError> {
        let secp = Secp256k1::new();
        let network = cfg.bitcoin_network()?;

        let wallets = cfg
            .wallets
            .iter()
            .map(|w| TreasuryWallet::from_config(w, &secp))
            .collect::<Result<Vec<_>, _>>()?;

        if !wallets.iter().any(|w| w.enabled && w.is_hot()) {
            return Err(TreasuryError::Configuration(
                "at least one enabled hot wallet is required".to_string(),
            ));
        }

        Ok(Self {
            wallets,
            network,
            secp,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn get(&self, id: &str) -> Option<&TreasuryWallet> {
        self.wallets.iter().find(|w| w.id == id)
    }

    /// All enabled wallets.
    pub fn enabled(&self) -> Vec<&TreasuryWallet> {
        self.wallets.iter().filter(|w| w.enabled).collect()
    }

    /// All enabled, locally-signable wallets.
    pub fn hot(&self) -> Vec<&TreasuryWallet> {
        self.wallets
            .iter()
            .filter(|w| w.enabled && w.is_hot())
            .collect()
    }
}
