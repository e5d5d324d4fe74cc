use bitcoin::{OutPoint, Script};
use std::collections::HashMap;

use crate::core::{HdPubKey, HdPubKeyBlindedPair};

/// Which keys this client has revealed next to which inputs.
///
/// Entries are only ever merged. A key flips from blinded to unblinded once
/// Bob posted its output, and never back.
#[derive(Clone, Debug, Default)]
pub struct ExposedLinks {
    links: HashMap<OutPoint, Vec<HdPubKeyBlindedPair>>,
}

impl ExposedLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, coin: &OutPoint) -> Option<&[HdPubKeyBlindedPair]> {
        self.links.get(coin).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Append `pairs` to the coin's links. A key already present keeps its
    /// entry, unblinded if either side is.
    pub fn merge(&mut self, coin: OutPoint, pairs: impl IntoIterator<Item = HdPubKeyBlindedPair>) {
        let entry = self.links.entry(coin).or_default();
        for pair in pairs {
            match entry.iter_mut().find(|p| p.key.pubkey == pair.key.pubkey) {
                Some(existing) => existing.is_blinded &= pair.is_blinded,
                None => entry.push(pair),
            }
        }
    }

    /// Mark the key behind `script` as revealed for `coin`. Returns false if
    /// no such link was recorded.
    pub fn unblind(&mut self, coin: &OutPoint, script: &Script) -> bool {
        let Some(pairs) = self.links.get_mut(coin) else {
            return false;
        };
        match pairs.iter_mut().find(|p| p.key.p2wpkh_script().as_script() == script) {
            Some(pair) => {
                pair.is_blinded = false;
                true
            }
            None => false,
        }
    }

    /// Keys already linked to any of `coins`.
    pub fn keys_for(&self, coins: &[OutPoint]) -> Vec<HdPubKey> {
        let mut keys: Vec<HdPubKey> = Vec::new();
        for pair in coins.iter().filter_map(|c| self.links.get(c)).flatten() {
            if !keys.iter().any(|k| k.pubkey == pair.key.pubkey) {
                keys.push(pair.key.clone());
            }
        }
        keys
    }

    pub fn all_keys(&self) -> Vec<HdPubKey> {
        let coins: Vec<OutPoint> = self.links.keys().copied().collect();
        self.keys_for(&coins)
    }

    /// Drop keys that no longer satisfy `keep` (typically: still locked).
    pub fn retain_keys(&mut self, mut keep: impl FnMut(&HdPubKey) -> bool) {
        for pairs in self.links.values_mut() {
            pairs.retain(|p| keep(&p.key));
        }
        self.links.retain(|_, pairs| !pairs.is_empty());
    }
}
