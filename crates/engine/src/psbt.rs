//! PSBT plumbing shared by the negotiation engine, ledger, and rebalancer.
//!
//! All treasury-held coins are P2WPKH, so signing computes the BIP143 sighash
//! directly and finalization writes the two-element `[signature, pubkey]`
//! witness. Size estimation uses flat vByte figures good enough for fee-rate
//! preservation: 10 base, 68 per input, 31 per output.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::bip32::Fingerprint;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{ecdsa, Amount, PrivateKey, Psbt, PublicKey, Transaction, Witness};

use treasury_types::TreasuryError;

use crate::wallets::TreasuryWallet;

pub const BASE_VBYTES: u64 = 10;
pub const INPUT_VBYTES: u64 = 68;
pub const OUTPUT_VBYTES: u64 = 31;

/// Flat P2WPKH size estimate.
pub fn estimate_vbytes(inputs: usize, outputs: usize) -> u64 {
    BASE_VBYTES + inputs as u64 * INPUT_VBYTES + outputs as u64 * OUTPUT_VBYTES
}

/// Decode a base64 PSBT.
pub fn decode_psbt(encoded: &str) -> Result<Psbt, TreasuryError> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| TreasuryError::InvalidPsbt(format!("invalid base64: {}", e)))?;
    Psbt::deserialize(&bytes).map_err(|e| TreasuryError::InvalidPsbt(e.to_string()))
}

/// Encode a PSBT as base64.
pub fn encode_psbt(psbt: &Psbt) -> String {
    BASE64.encode(psbt.serialize())
}

/// Absolute fee of a PSBT whose inputs all carry `witness_utxo`.
pub fn psbt_fee(psbt: &Psbt) -> Result<u64, TreasuryError> {
    let mut input_total: u64 = 0;
    for (i, input) in psbt.inputs.iter().enumerate() {
        let utxo = input
            .witness_utxo
            .as_ref()
            .ok_or_else(|| TreasuryError::InvalidPsbt(format!("input {} has no witness_utxo", i)))?;
        input_total = input_total.saturating_add(utxo.value.to_sat());
    }

    let output_total: u64 = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .sum();

    input_total
        .checked_sub(output_total)
        .ok_or_else(|| TreasuryError::InvalidPsbt("outputs exceed inputs".to_string()))
}

/// Attach HD derivation metadata for one input so external tooling can map it
/// back to the owning account key.
pub fn rebase_input_derivation(
    psbt: &mut Psbt,
    index: usize,
    wallet: &TreasuryWallet,
    change: u32,
    address_index: u32,
    secp: &Secp256k1<All>,
) -> Result<(), TreasuryError> {
    let pk = wallet.public_key_at(change, address_index, secp)?;
    let path = TreasuryWallet::derivation_path(change, address_index)?;
    let fingerprint: Fingerprint = wallet.fingerprint();

    psbt.inputs[index]
        .bip32_derivation
        .insert(pk.0, (fingerprint, path));
    Ok(())
}

/// Sign one P2WPKH input with a low-R grind, matching the compact encoding
/// senders use for their own inputs. The signature lands in `partial_sigs`.
pub fn sign_p2wpkh_input(
    psbt: &mut Psbt,
    index: usize,
    key: &PrivateKey,
    secp: &Secp256k1<All>,
) -> Result<(), TreasuryError> {
    let utxo = psbt.inputs[index]
        .witness_utxo
        .clone()
        .ok_or_else(|| TreasuryError::InvalidPsbt(format!("input {} has no witness_utxo", index)))?;

    let sighash = SighashCache::new(&psbt.unsigned_tx)
        .p2wpkh_signature_hash(
            index,
            &utxo.script_pubkey,
            utxo.value,
            EcdsaSighashType::All,
        )
        .map_err(|e| TreasuryError::SigningFailed(format!("sighash error: {}", e)))?;

    let message = Message::from_digest(sighash.to_byte_array());
    let signature = secp.sign_ecdsa_low_r(&message, &key.inner);

    let public_key = PublicKey::new(key.public_key(secp).inner);
    psbt.inputs[index]
        .partial_sigs
        .insert(public_key, ecdsa::Signature::sighash_all(signature));
    Ok(())
}

/// Finalize one P2WPKH input from its partial signature, clearing metadata
/// that must not survive finalization.
pub fn finalize_p2wpkh_input(psbt: &mut Psbt, index: usize) -> Result<(), TreasuryError> {
    let input = &mut psbt.inputs[index];
    if input.final_script_witness.is_some() {
        return Ok(());
    }

    let (public_key, signature) = input
        .partial_sigs
        .iter()
        .next()
        .map(|(pk, sig)| (*pk, *sig))
        .ok_or_else(|| {
            TreasuryError::SigningFailed(format!("input {} has no signatures to finalize", index))
        })?;

    input.final_script_witness = Some(Witness::p2wpkh(&signature, &public_key.inner));
    input.partial_sigs.clear();
    input.bip32_derivation.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    Ok(())
}

/// Finalize every input that carries a partial signature.
pub fn finalize_all(psbt: &mut Psbt) -> Result<(), TreasuryError> {
    for index in 0..psbt.inputs.len() {
        finalize_p2wpkh_input(psbt, index)?;
    }
    Ok(())
}

/// Strip derivation metadata from unfinalized inputs and all outputs before
/// a PSBT leaves the process.
pub fn strip_derivation_metadata(psbt: &mut Psbt) {
    for input in &mut psbt.inputs {
        if input.final_script_witness.is_none() {
            input.bip32_derivation.clear();
        }
    }
    for output in &mut psbt.outputs {
        output.bip32_derivation.clear();
    }
}

/// Merge independently-signed copies of `base` and return the combined PSBT.
pub fn combine_signed_copies(mut base: Psbt, copies: Vec<Psbt>) -> Result<Psbt, TreasuryError> {
    for copy in copies {
        base.combine(copy)
            .map_err(|e| TreasuryError::SigningFailed(format!("combine failed: {}", e)))?;
    }
    Ok(base)
}

/// Extract the final transaction from a fully-finalized PSBT.
pub fn extract_tx(psbt: Psbt) -> Result<Transaction, TreasuryError> {
    psbt.extract_tx()
        .map_err(|e| TreasuryError::SigningFailed(format!("extract failed: {}", e)))
}
