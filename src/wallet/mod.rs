//! Wallet-side collaborator interface.
//!
//! The mixer never stores keys. It asks the wallet for locked internal keys
//! to receive mixed outputs and change, and for secrets when it has to prove
//! input ownership or sign the coinjoin.

use anyhow::Result;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Network, OutPoint, Script};

use crate::core::HdPubKey;

/// Key labels applied to outputs registered in a round.
pub const CHANGE_LABEL: &str = "ZeroLink Change";
pub const MIXED_LABEL: &str = "ZeroLink Mixed Coin";

pub trait KeyManager: Send + Sync {
    fn network(&self) -> Network;

    /// Internal keys reserved for mixing and not yet used on chain.
    fn locked_internal_keys(&self) -> Vec<HdPubKey>;

    /// Derive a fresh internal key in the locked state.
    fn generate_locked_key(&self, label: &str) -> Result<HdPubKey>;

    fn set_key_label(&self, key: &HdPubKey, label: &str);

    fn key_for_script(&self, script: &Script) -> Option<HdPubKey>;

    fn secret_key_for_script(&self, script: &Script) -> Option<SecretKey>;

    /// Wallet's own view of whether an outpoint has been spent.
    fn is_spent(&self, outpoint: &OutPoint) -> bool;

    fn min_gap_limit(&self) -> usize {
        21
    }
}
