//! In-memory collaborators for tests and regtest tooling.
//!
//! None of this is secure: [`XorBlindScheme`] hides nothing and
//! [`MemoryKeyManager`] derives keys from a counter.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, Script, Transaction, Txid, Witness};
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::coordinator::alice::AliceApi;
use crate::core::*;
use crate::error::{CoinJoinError, Result as MixResult};
use crate::wallet::KeyManager;

// ── Blind signatures ────────────────────────────────────────────────────────

/// Toy blind-signature scheme: blinding is XOR with a random pad and
/// "signing" is XOR with a hash of the signer key. Verifies only what the
/// matching signer produced, for the matching message.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorBlindScheme;

impl XorBlindScheme {
    fn key_pad(signer: &SignerPubKey) -> [u8; 32] {
        sha256::Hash::hash(&signer.0).to_byte_array()
    }

    fn xor(a: &[u8], b: &[u8; 32]) -> Vec<u8> {
        a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
    }

    /// Coordinator side.
    pub fn sign_blinded(signer: &SignerPubKey, blinded: &BlindedMessage) -> BlindSignature {
        BlindSignature(Self::xor(&blinded.0, &Self::key_pad(signer)))
    }
}

impl BlindSignatureScheme for XorBlindScheme {
    fn blind(&self, _signer: &SignerPubKey, message: &[u8; 32]) -> Result<(BlindedMessage, BlindingFactor)> {
        let pad: [u8; 32] = rand::random();
        Ok((BlindedMessage(Self::xor(message, &pad)), BlindingFactor(pad.to_vec())))
    }

    fn unblind(
        &self,
        _signer: &SignerPubKey,
        signature: &BlindSignature,
        factor: &BlindingFactor,
    ) -> Result<UnblindedSignature> {
        let pad: [u8; 32] = match factor.0.as_slice().try_into() {
            Ok(p) => p,
            Err(_) => bail!("blinding factor must be 32 bytes"),
        };
        if signature.0.len() != 32 {
            bail!("blind signature must be 32 bytes, got {}", signature.0.len());
        }
        Ok(UnblindedSignature(Self::xor(&signature.0, &pad)))
    }

    fn verify(&self, signer: &SignerPubKey, message: &[u8; 32], signature: &UnblindedSignature) -> bool {
        signature.0 == Self::xor(message, &Self::key_pad(signer))
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Deterministic key pair number `n`.
pub fn test_key(n: u32) -> (SecretKey, HdPubKey) {
    let secp = Secp256k1::signing_only();
    let mut counter = n as u64;
    loop {
        let seed = sha256::Hash::hash(&counter.to_le_bytes()).to_byte_array();
        if let Ok(sk) = SecretKey::from_slice(&seed) {
            let pk = CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk));
            return (sk, HdPubKey::new(pk));
        }
        counter = counter.wrapping_add(1 << 32);
    }
}

struct KeyEntry {
    secret: SecretKey,
    key: HdPubKey,
    internal: bool,
    locked: bool,
}

#[derive(Default)]
struct Inner {
    keys: Vec<KeyEntry>,
    spent: HashSet<OutPoint>,
    next: u32,
}

impl Inner {
    fn derive(&mut self, label: &str, internal: bool, locked: bool) -> HdPubKey {
        self.next += 1;
        let (secret, mut key) = test_key(self.next);
        key.label = label.to_string();
        self.keys.push(KeyEntry { secret, key: key.clone(), internal, locked });
        key
    }
}

/// Wallet stand-in holding keys and spend status in memory.
pub struct MemoryKeyManager {
    network: Network,
    inner: Mutex<Inner>,
}

impl MemoryKeyManager {
    pub fn new(network: Network) -> Self {
        Self { network, inner: Mutex::new(Inner::default()) }
    }

    /// Pre-derive `count` locked internal keys.
    pub fn with_locked_keys(network: Network, count: usize) -> Self {
        let km = Self::new(network);
        {
            let mut inner = km.lock();
            for _ in 0..count {
                inner.derive("", true, true);
            }
        }
        km
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a receive key and a coin paying to it.
    pub fn receive_coin(&self, amount: Amount, confirmed: bool) -> SmartCoin {
        let key = self.lock().derive("receive", false, false);
        let txid = Txid::from_byte_array(sha256::Hash::hash(&key.pubkey.to_bytes()).to_byte_array());
        SmartCoin::new(OutPoint { txid, vout: 0 }, amount, key.p2wpkh_script(), confirmed)
    }

    pub fn mark_spent(&self, outpoint: OutPoint) {
        self.lock().spent.insert(outpoint);
    }

    /// The key received funds on chain and is no longer reserved.
    pub fn mark_used(&self, key: &HdPubKey) {
        for entry in self.lock().keys.iter_mut().filter(|e| e.key.pubkey == key.pubkey) {
            entry.locked = false;
        }
    }

    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn label_of(&self, script: &Script) -> Option<String> {
        self.key_for_script(script).map(|k| k.label)
    }
}

impl KeyManager for MemoryKeyManager {
    fn network(&self) -> Network {
        self.network
    }

    fn locked_internal_keys(&self) -> Vec<HdPubKey> {
        self.lock()
            .keys
            .iter()
            .filter(|e| e.internal && e.locked)
            .map(|e| e.key.clone())
            .collect()
    }

    fn generate_locked_key(&self, label: &str) -> Result<HdPubKey> {
        Ok(self.lock().derive(label, true, true))
    }

    fn set_key_label(&self, key: &HdPubKey, label: &str) {
        for entry in self.lock().keys.iter_mut().filter(|e| e.key.pubkey == key.pubkey) {
            entry.key.label = label.to_string();
        }
    }

    fn key_for_script(&self, script: &Script) -> Option<HdPubKey> {
        self.lock()
            .keys
            .iter()
            .find(|e| e.key.p2wpkh_script().as_script() == script)
            .map(|e| e.key.clone())
    }

    fn secret_key_for_script(&self, script: &Script) -> Option<SecretKey> {
        self.lock()
            .keys
            .iter()
            .find(|e| e.key.p2wpkh_script().as_script() == script)
            .map(|e| e.secret)
    }

    fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.lock().spent.contains(outpoint)
    }
}

// ── Rounds ──────────────────────────────────────────────────────────────────

pub fn signer_keys(levels: usize) -> Vec<SignerPubKey> {
    (0..levels).map(|i| SignerPubKey(vec![0x02 + i as u8; 33])).collect()
}

/// Two-level round at 0.1 BTC with small fees.
pub fn round_state(round_id: u64, phase: RoundPhase) -> RoundState {
    RoundState {
        round_id,
        phase,
        denomination: Amount::from_sat(10_000_000),
        signer_pub_keys: signer_keys(2),
        fee_per_input: Amount::from_sat(10_000),
        fee_per_output: Amount::from_sat(5_000),
        coordinator_fee_percent: 0.003,
        maximum_input_count_per_peer: 7,
        registration_timeout: 60,
        registered_peer_count: 0,
        required_peer_count: 5,
        successful_round_count: 0,
    }
}

/// Alice that is never contacted. Holds the round id and addresses only.
pub struct StubAlice {
    pub round_id: u64,
    pub addresses: Vec<Address>,
}

#[async_trait]
impl AliceApi for StubAlice {
    fn round_id(&self) -> u64 {
        self.round_id
    }

    fn unique_id(&self) -> &str {
        "stub"
    }

    fn registered_addresses(&self) -> &[Address] {
        &self.addresses
    }

    async fn post_confirmation(&self) -> MixResult<(RoundPhase, Vec<ActiveOutput>)> {
        Err(CoinJoinError::Transport("stub alice".into()))
    }

    async fn post_unconfirmation(&self) -> bool {
        true
    }

    async fn get_unsigned_coinjoin(&self) -> MixResult<Transaction> {
        Err(CoinJoinError::Transport("stub alice".into()))
    }

    async fn post_signatures(&self, _witnesses: BTreeMap<u32, Witness>) -> MixResult<()> {
        Err(CoinJoinError::Transport("stub alice".into()))
    }
}
