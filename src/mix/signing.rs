use bitcoin::ecdsa;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Transaction, Witness};
use std::collections::BTreeMap;

use crate::core::{BlindedMessage, SmartCoin};
use crate::error::{CoinJoinError, Result};
use crate::wallet::KeyManager;

/// Digest an input ownership proof commits to: SHA-256 over all blinded
/// output messages, in registration order.
pub fn blinded_outputs_digest(blinded: &[BlindedMessage]) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    for b in blinded {
        bitcoin::hashes::HashEngine::input(&mut engine, &b.0);
    }
    sha256::Hash::from_engine(engine).to_byte_array()
}

/// Prove control of an input over the blinded outputs it sponsors.
/// Compact ECDSA, hex.
pub fn input_proof(secret: &SecretKey, digest: [u8; 32]) -> String {
    let secp = Secp256k1::signing_only();
    let sig = secp.sign_ecdsa(&Message::from_digest(digest), secret);
    hex::encode(sig.serialize_compact())
}

/// P2WPKH witnesses for every input of `tx` that spends one of `coins`,
/// keyed by input index.
pub fn sign_own_inputs(tx: &Transaction, coins: &[SmartCoin], wallet: &dyn KeyManager) -> Result<BTreeMap<u32, Witness>> {
    let secp = Secp256k1::signing_only();
    let mut cache = SighashCache::new(tx);
    let mut witnesses = BTreeMap::new();

    for (index, input) in tx.input.iter().enumerate() {
        let Some(coin) = coins.iter().find(|c| c.outpoint == input.previous_output) else {
            continue;
        };
        if !coin.script_pubkey.is_p2wpkh() {
            return Err(CoinJoinError::Signing(format!("input {} is not P2WPKH", coin.outpoint)));
        }
        let secret = wallet
            .secret_key_for_script(&coin.script_pubkey)
            .ok_or_else(|| CoinJoinError::Wallet(format!("no key for input {}", coin.outpoint)))?;

        let sighash = cache
            .p2wpkh_signature_hash(index, &coin.script_pubkey, coin.amount, EcdsaSighashType::All)
            .map_err(|e| CoinJoinError::Signing(e.to_string()))?;
        let signature = secp.sign_ecdsa(&Message::from_digest(sighash.to_byte_array()), &secret);
        let signature = ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All };
        let pubkey = secret.public_key(&secp);

        witnesses.insert(index as u32, Witness::p2wpkh(&signature, &pubkey));
    }

    if witnesses.len() != coins.len() {
        return Err(CoinJoinError::Signing(format!(
            "signed {} of {} registered inputs",
            witnesses.len(),
            coins.len()
        )));
    }
    Ok(witnesses)
}
