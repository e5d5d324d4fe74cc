//! What to register: which coins, how many mixing levels, which keys.

use anyhow::Result;
use bitcoin::{Amount, OutPoint};

use crate::core::{HdPubKey, HdPubKeyBlindedPair, RoundState, SmartCoin};
use crate::error::CoinJoinError;
use crate::state::ExposedLinks;
use crate::wallet::{KeyManager, CHANGE_LABEL, MIXED_LABEL};

/// Round values come from the coordinator, so sums saturate instead of
/// wrapping. A saturated requirement is never met.
fn saturating_sum(values: impl IntoIterator<Item = Amount>) -> Amount {
    values.into_iter().fold(Amount::ZERO, |acc, v| acc.checked_add(v).unwrap_or(Amount::MAX))
}

fn saturating_mul(value: Amount, n: u64) -> Amount {
    value.checked_mul(n).unwrap_or(Amount::MAX)
}

/// Least input sum for `inputs` coins to take one level with change.
pub fn amount_needed(round: &RoundState, inputs: usize) -> Amount {
    saturating_sum([
        round.denomination,
        saturating_mul(round.fee_per_output, 2),
        saturating_mul(round.fee_per_input, inputs as u64),
    ])
}

/// Largest coins first, at most the per-peer cap, skipping coins that do
/// not even pay their own input fee. `None` if that is not enough for the
/// base denomination.
pub fn select_coins(candidates: &[SmartCoin], round: &RoundState) -> Option<Vec<SmartCoin>> {
    let mut available: Vec<&SmartCoin> = candidates.iter().filter(|c| c.amount > round.fee_per_input).collect();
    available.sort_by(|a, b| b.amount.cmp(&a.amount));
    available.truncate(round.maximum_input_count_per_peer);

    let total = saturating_sum(available.iter().map(|c| c.amount));
    if available.is_empty() || total < amount_needed(round, available.len()) {
        return None;
    }
    Some(available.into_iter().cloned().collect())
}

/// Whether these amounts could ever fund one level under the round's rules.
pub fn is_affordable(amounts: &[Amount], round: &RoundState) -> bool {
    let mut usable: Vec<Amount> = amounts.iter().copied().filter(|a| *a > round.fee_per_input).collect();
    usable.sort_by(|a, b| b.cmp(a));
    usable.truncate(round.maximum_input_count_per_peer);
    !usable.is_empty() && saturating_sum(usable.iter().copied()) >= amount_needed(round, usable.len())
}

/// Local feasibility check, before anything is sent to the coordinator.
pub fn ensure_affordable(amounts: &[Amount], round: &RoundState) -> crate::error::Result<()> {
    if is_affordable(amounts, round) {
        return Ok(());
    }
    Err(CoinJoinError::InsufficientFunds(format!(
        "{} in {} coins cannot fund denomination {} with fees",
        saturating_sum(amounts.iter().copied()),
        amounts.len(),
        round.denomination
    )))
}

/// Number of mixing levels (`d, 2d, 4d, ...`) the inputs can pay for,
/// including one output per level plus change and all input fees.
pub fn mixing_level_count(input_sum: Amount, input_count: usize, round: &RoundState) -> usize {
    let mut levels = 1;
    for candidate in 2..=round.mixing_level_count() {
        match level_cost(round, candidate, input_count) {
            Some(cost) if cost <= input_sum => levels = candidate,
            _ => break,
        }
    }
    levels
}

/// Outputs and fees for `levels` levels; `None` past `Amount::MAX`.
fn level_cost(round: &RoundState, levels: usize, input_count: usize) -> Option<Amount> {
    let fees = [
        round.fee_per_output.checked_mul(levels as u64 + 1)?,
        round.fee_per_input.checked_mul(input_count as u64)?,
    ];
    (0..levels)
        .map(|i| round.level_denomination(i))
        .chain(fees)
        .try_fold(Amount::ZERO, Amount::checked_add)
}

#[derive(Clone, Debug)]
pub struct OutputKeys {
    pub change: HdPubKey,
    /// One per mixing level.
    pub actives: Vec<HdPubKey>,
}

impl OutputKeys {
    /// Links revealed by registering these keys: change in the clear,
    /// actives only blinded.
    pub fn links(&self) -> Vec<HdPubKeyBlindedPair> {
        std::iter::once(HdPubKeyBlindedPair { key: self.change.clone(), is_blinded: false })
            .chain(self.actives.iter().map(|k| HdPubKeyBlindedPair { key: k.clone(), is_blinded: true }))
            .collect()
    }
}

/// Pick a change key and `levels` active keys among the wallet's locked
/// internal keys.
///
/// Keys already linked to these same inputs come first; keys linked to
/// other inputs are avoided unless the locked pool is small, so as not to
/// bloat the wallet. New keys are derived only for the shortfall.
pub fn choose_output_keys(
    inputs: &[OutPoint],
    links: &ExposedLinks,
    wallet: &dyn KeyManager,
    levels: usize,
) -> Result<OutputKeys> {
    let needed = levels + 1;
    let locked = wallet.locked_internal_keys();
    let is_locked = |k: &HdPubKey| locked.iter().any(|l| l.pubkey == k.pubkey);

    let surely = links.keys_for(inputs);
    let try_not: Vec<HdPubKey> = links
        .all_keys()
        .into_iter()
        .filter(|k| !surely.iter().any(|s| s.pubkey == k.pubkey))
        .collect();

    let mut chosen: Vec<HdPubKey> = surely.into_iter().filter(|k| is_locked(k)).collect();
    for key in &locked {
        let avoid = try_not.iter().any(|t| t.pubkey == key.pubkey);
        if !avoid && !chosen.iter().any(|c| c.pubkey == key.pubkey) {
            chosen.push(key.clone());
        }
    }
    if chosen.len() <= needed.max(wallet.min_gap_limit() / 2) {
        for key in try_not.into_iter().filter(|k| is_locked(k)) {
            if !chosen.iter().any(|c| c.pubkey == key.pubkey) {
                chosen.push(key);
            }
        }
    }
    while chosen.len() < needed {
        chosen.push(wallet.generate_locked_key("")?);
    }

    let mut chosen = chosen.into_iter().take(needed);
    let mut change = chosen.next().ok_or_else(|| anyhow::anyhow!("no change key"))?;
    wallet.set_key_label(&change, CHANGE_LABEL);
    change.label = CHANGE_LABEL.to_string();

    let actives = chosen
        .map(|mut k| {
            wallet.set_key_label(&k, MIXED_LABEL);
            k.label = MIXED_LABEL.to_string();
            k
        })
        .collect();
    Ok(OutputKeys { change, actives })
}
