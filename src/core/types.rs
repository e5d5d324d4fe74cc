use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::blinding::UnblindedSignature;

/// Unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// SHA-256 of the output script, the message a mixing-level signer signs.
pub fn output_script_hash(script: &Script) -> [u8; 32] {
    sha256::Hash::hash(script.as_bytes()).to_byte_array()
}

/// Short display form of a txid-bearing outpoint for log lines.
pub fn short_outpoint(outpoint: &OutPoint) -> String {
    let txid = outpoint.txid.to_string();
    format!("{}…:{}", &txid[..8.min(txid.len())], outpoint.vout)
}

// ── Round phases ────────────────────────────────────────────────────────────

/// Coordinator round phase. Ordered; a round only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoundPhase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    Signing,
}

impl std::fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoundPhase::InputRegistration => "InputRegistration",
            RoundPhase::ConnectionConfirmation => "ConnectionConfirmation",
            RoundPhase::OutputRegistration => "OutputRegistration",
            RoundPhase::Signing => "Signing",
        };
        f.write_str(s)
    }
}

// ── Round state ─────────────────────────────────────────────────────────────

/// Opaque signer public key for one mixing level.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SignerPubKey(pub Vec<u8>);

impl SignerPubKey {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Coordinator-published snapshot of one round.
///
/// Replaced wholesale on every poll. Fees are absolute per input/output,
/// the coordinator fee is a percentage charged per anonymity-set member.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundState {
    pub round_id: u64,
    pub phase: RoundPhase,
    /// Base (level 0) denomination. Level `i` is `denomination * 2^i`.
    pub denomination: Amount,
    /// One signer key per mixing level.
    pub signer_pub_keys: Vec<SignerPubKey>,
    pub fee_per_input: Amount,
    pub fee_per_output: Amount,
    pub coordinator_fee_percent: f64,
    pub maximum_input_count_per_peer: usize,
    /// Seconds the coordinator waits in input registration.
    pub registration_timeout: u64,
    pub registered_peer_count: usize,
    pub required_peer_count: usize,
    /// Coordinator-wide counter; unchanged across a round's removal means it failed.
    pub successful_round_count: u64,
}

impl RoundState {
    pub fn mixing_level_count(&self) -> usize {
        self.signer_pub_keys.len()
    }

    /// Denomination of mixing level `level`, saturating at `Amount::MAX`.
    pub fn level_denomination(&self, level: usize) -> Amount {
        u32::try_from(level)
            .ok()
            .and_then(|l| 1u64.checked_shl(l))
            .and_then(|factor| self.denomination.to_sat().checked_mul(factor))
            .map_or(Amount::MAX, Amount::from_sat)
    }

    pub fn signer_pub_key(&self, level: usize) -> Option<&SignerPubKey> {
        self.signer_pub_keys.get(level)
    }
}

// ── Coins ───────────────────────────────────────────────────────────────────

/// A wallet-owned unspent output as the mixer sees it.
///
/// The wallet owns spendability; the mixer only flips the in-progress flag,
/// the backend-spent flag and the ban expiry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartCoin {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub script_pubkey: ScriptBuf,
    pub confirmed: bool,
    #[serde(default)]
    pub coinjoin_in_progress: bool,
    #[serde(default)]
    pub spent_according_to_backend: bool,
    /// Unix seconds until which the coordinator refuses this input.
    #[serde(default)]
    pub banned_until: Option<u64>,
    #[serde(default)]
    pub label: String,
}

impl SmartCoin {
    pub fn new(outpoint: OutPoint, amount: Amount, script_pubkey: ScriptBuf, confirmed: bool) -> Self {
        Self {
            outpoint,
            amount,
            script_pubkey,
            confirmed,
            coinjoin_in_progress: false,
            spent_according_to_backend: false,
            banned_until: None,
            label: String::new(),
        }
    }

    pub fn is_banned(&self, at: u64) -> bool {
        self.banned_until.map_or(false, |until| until > at)
    }
}

/// An output this client registers for a mixing level, with the
/// coordinator's unblinded signature over its script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveOutput {
    pub address: Address,
    pub signature: UnblindedSignature,
    pub mixing_level: usize,
}

/// Why a coin left the mixing queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DequeueReason {
    Spent,
    Banned,
    CoordinatorFeeChanged,
    NotEnoughFundsEnqueued,
    /// The coin is committed to a round past input registration; pulling it
    /// out would stall the round.
    Mixing,
    ApplicationExit,
    UserRequested,
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Wallet public key as offered for output registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HdPubKey {
    pub pubkey: CompressedPublicKey,
    pub label: String,
}

impl HdPubKey {
    pub fn new(pubkey: CompressedPublicKey) -> Self {
        Self { pubkey, label: String::new() }
    }

    pub fn p2wpkh_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.pubkey.wpubkey_hash())
    }

    pub fn p2wpkh_address(&self, network: Network) -> Address {
        Address::p2wpkh(&self.pubkey, network)
    }
}

/// A key this client has revealed to the coordinator alongside an input,
/// and whether the coordinator still only knows it blinded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HdPubKeyBlindedPair {
    pub key: HdPubKey,
    pub is_blinded: bool,
}
