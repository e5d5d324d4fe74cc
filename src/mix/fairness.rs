//! Checks the unsigned coinjoin before we sign anything.
//!
//! The coordinator builds the transaction. It must contain all our inputs,
//! all our active outputs, and pay us back at least:
//!
//! ```text
//!   Σ inputs
//!   - feePerInputs  × #inputs
//!   - feePerOutputs × (#registered addresses + 1)
//!   - coordinator fee, per own output in an indistinguishable group:
//!       value × percent × min(ANONSET_FEE_CAP, group size) / 100
//!   - protection allowance, only without a change output:
//!       max(MIN_PROTECTION_ALLOWANCE, 1% of the base denomination)
//! ```
//!
//! with a small rounding tolerance. Anything less is misbehavior.

use bitcoin::{Amount, ScriptBuf, Transaction};
use std::collections::BTreeMap;

use crate::core::{RoundState, SmartCoin};
use crate::error::{CoinJoinError, Result};

/// The coordinator fee stops growing past this anonymity set. A protocol
/// constant, not derived from anything.
pub const ANONSET_FEE_CAP: usize = 110;

/// Change below this is left to the coordinator rather than created.
pub const MIN_PROTECTION_ALLOWANCE: Amount = Amount::from_sat(10_000);

pub const ROUNDING_TOLERANCE: Amount = Amount::from_sat(1_000);

/// What we registered, as needed to judge the coinjoin.
pub struct OwnRegistration<'a> {
    pub coins: &'a [SmartCoin],
    pub change_script: ScriptBuf,
    pub active_scripts: Vec<ScriptBuf>,
    /// Addresses registered at input registration, one per requested level.
    pub registered_address_count: usize,
}

/// Value groups with more than one output, most populous first.
pub fn indistinguishable_outputs(tx: &Transaction) -> Vec<(Amount, usize)> {
    let mut counts: BTreeMap<Amount, usize> = BTreeMap::new();
    for out in &tx.output {
        *counts.entry(out.value).or_default() += 1;
    }
    let mut groups: Vec<(Amount, usize)> = counts.into_iter().filter(|(_, n)| *n > 1).collect();
    groups.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    groups
}

pub fn coordinator_fee(value: Amount, percent: f64, group_size: usize) -> Amount {
    let anonset = group_size.min(ANONSET_FEE_CAP) as f64;
    Amount::from_sat((value.to_sat() as f64 * percent * anonset / 100.0).round() as u64)
}

pub fn protection_allowance(base_denomination: Amount) -> Amount {
    MIN_PROTECTION_ALLOWANCE.max(Amount::from_sat(base_denomination.to_sat() / 100))
}

fn checked_sum(values: impl IntoIterator<Item = Amount>) -> Option<Amount> {
    values.into_iter().try_fold(Amount::ZERO, Amount::checked_add)
}

fn overflow() -> CoinJoinError {
    CoinJoinError::CoordinatorMisbehavior("output values overflow".into())
}

/// Validate `tx` against our registration. Returns the amount paid back to us.
pub fn validate_unsigned_coinjoin(tx: &Transaction, own: &OwnRegistration<'_>, round: &RoundState) -> Result<Amount> {
    for coin in own.coins {
        if !tx.input.iter().any(|i| i.previous_output == coin.outpoint) {
            return Err(CoinJoinError::CoordinatorMisbehavior(format!(
                "coordinator did not add our input {}",
                coin.outpoint
            )));
        }
    }
    for script in &own.active_scripts {
        if !tx.output.iter().any(|o| o.script_pubkey == *script) {
            return Err(CoinJoinError::CoordinatorMisbehavior(
                "coordinator did not add our active output".into(),
            ));
        }
    }

    let mine: Vec<&bitcoin::TxOut> = tx
        .output
        .iter()
        .filter(|o| o.script_pubkey == own.change_script || own.active_scripts.contains(&o.script_pubkey))
        .collect();
    let amount_back = checked_sum(mine.iter().map(|o| o.value)).ok_or_else(overflow)?;

    let input_sum = checked_sum(own.coins.iter().map(|c| c.amount)).ok_or_else(overflow)?;
    let network_fees = round
        .fee_per_output
        .checked_mul(own.registered_address_count as u64 + 1)
        .zip(round.fee_per_input.checked_mul(own.coins.len() as u64))
        .and_then(|(outputs, inputs)| outputs.checked_add(inputs))
        .ok_or_else(overflow)?;
    let mut deductions = network_fees;

    let groups = indistinguishable_outputs(tx);
    for (value, count) in &groups {
        let own_count = mine.iter().filter(|o| o.value == *value).count() as u64;
        deductions = coordinator_fee(*value, round.coordinator_fee_percent, *count)
            .checked_mul(own_count)
            .and_then(|fee| deductions.checked_add(fee))
            .ok_or_else(overflow)?;
    }

    let got_change = mine.iter().any(|o| o.script_pubkey == own.change_script);
    if !got_change {
        let base = groups.first().map(|(v, _)| *v).unwrap_or(round.denomination);
        deductions = deductions.checked_add(protection_allowance(base)).ok_or_else(overflow)?;
    }

    let min_amount_back = input_sum.checked_sub(deductions).unwrap_or(Amount::ZERO);
    if amount_back < min_amount_back && min_amount_back - amount_back > ROUNDING_TOLERANCE {
        return Err(CoinJoinError::CoordinatorMisbehavior(format!(
            "coordinator did not add enough value to our outputs in the coinjoin, missing {} satoshis",
            (min_amount_back - amount_back).to_sat()
        )));
    }
    Ok(amount_back)
}
