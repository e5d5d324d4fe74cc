//! Local mixing state: the waiting list and the rounds the coordinator runs.
//!
//! A queued coin is either in the waiting list or registered in exactly one
//! round, never both. The state is owned by the orchestrator and only
//! touched under its mix lock.

pub mod links;
pub mod round;

pub use links::ExposedLinks;
pub use round::{ClientRound, ClientRoundRegistration};

use bitcoin::{Amount, OutPoint};
use std::collections::{HashMap, HashSet};

use crate::core::{short_outpoint, RoundPhase, RoundState, SmartCoin};
use crate::mix::selection;

/// Seconds a coin that went through signing waits before it may be
/// registered again. It is probably spent; spend detection gets there first.
pub const SIGNED_COIN_REGISTRATION_HOLD: u64 = 60;

#[derive(Debug)]
struct WaitingCoin {
    coin: SmartCoin,
    /// Unix seconds before which the coin is not offered for registration.
    registrable_after: u64,
}

#[derive(Debug, Default)]
pub struct ClientState {
    waiting_list: Vec<WaitingCoin>,
    rounds: Vec<ClientRound>,
    /// Registration for a round the last snapshot did not include yet.
    delayed_registration: Option<(u64, ClientRoundRegistration)>,
    /// Coordinator bans outlive the queue entry.
    bans: HashMap<OutPoint, u64>,
    coordinator_fee_percent_to_check: Option<f64>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Waiting list ────────────────────────────────────────────────────

    /// Queue a coin for registration now. Returns false if it is already
    /// queued or registered.
    pub fn add_coin_to_waiting_list(&mut self, coin: SmartCoin, now: u64) -> bool {
        self.add_coin_to_waiting_list_after(coin, now)
    }

    pub fn add_coin_to_waiting_list_after(&mut self, mut coin: SmartCoin, registrable_after: u64) -> bool {
        if self.contains(&coin.outpoint) {
            return false;
        }
        if let Some(until) = self.bans.get(&coin.outpoint) {
            coin.banned_until = Some(coin.banned_until.map_or(*until, |b| b.max(*until)));
        }
        tracing::info!("Coin added to the waiting list: {}.", short_outpoint(&coin.outpoint));
        self.waiting_list.push(WaitingCoin { coin, registrable_after });
        true
    }

    pub fn remove_coin_from_waiting_list(&mut self, outpoint: &OutPoint) -> Option<SmartCoin> {
        let pos = self.waiting_list.iter().position(|w| w.coin.outpoint == *outpoint)?;
        let coin = self.waiting_list.remove(pos).coin;
        tracing::info!("Coin removed from the waiting list: {}.", short_outpoint(outpoint));
        Some(coin)
    }

    pub fn waiting_coin(&self, outpoint: &OutPoint) -> Option<&SmartCoin> {
        self.waiting_list.iter().map(|w| &w.coin).find(|c| c.outpoint == *outpoint)
    }

    pub fn waiting_coins(&self) -> impl Iterator<Item = &SmartCoin> {
        self.waiting_list.iter().map(|w| &w.coin)
    }

    pub fn waiting_list_count(&self) -> usize {
        self.waiting_list.len()
    }

    pub fn is_waiting(&self, outpoint: &OutPoint) -> bool {
        self.waiting_coin(outpoint).is_some()
    }

    /// Queued anywhere: waiting, registered, or parked for a delayed registration.
    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.is_waiting(outpoint)
            || self.registered_round_of(outpoint).is_some()
            || self.delayed_registration.as_ref().map_or(false, |(_, r)| r.contains_coin(outpoint))
    }

    pub fn all_queued_coins(&self) -> Vec<SmartCoin> {
        let mut coins: Vec<SmartCoin> = self.waiting_coins().cloned().collect();
        for round in &self.rounds {
            coins.extend(round.coins_registered().iter().cloned());
        }
        if let Some((_, reg)) = &self.delayed_registration {
            coins.extend(reg.coins_registered().iter().cloned());
        }
        coins
    }

    pub fn all_waiting_amounts(&self) -> Vec<Amount> {
        self.waiting_coins().map(|c| c.amount).collect()
    }

    /// Queued coins the backend or the wallet consider spent.
    pub fn spent_coins(&self, wallet_says_spent: impl Fn(&OutPoint) -> bool) -> Vec<OutPoint> {
        self.all_queued_coins()
            .into_iter()
            .filter(|c| c.spent_according_to_backend || wallet_says_spent(&c.outpoint))
            .map(|c| c.outpoint)
            .collect()
    }

    pub fn mark_spent_according_to_backend(&mut self, outpoint: &OutPoint) {
        if let Some(w) = self.waiting_list.iter_mut().find(|w| w.coin.outpoint == *outpoint) {
            w.coin.spent_according_to_backend = true;
        }
    }

    // ── Bans ────────────────────────────────────────────────────────────

    pub fn ban(&mut self, outpoint: OutPoint, until: u64) {
        self.bans.insert(outpoint, until);
        if let Some(w) = self.waiting_list.iter_mut().find(|w| w.coin.outpoint == outpoint) {
            w.coin.banned_until = Some(until);
        }
    }

    pub fn banned_until(&self, outpoint: &OutPoint) -> Option<u64> {
        self.bans.get(outpoint).copied()
    }

    /// Forget expired bans.
    pub fn prune_bans(&mut self, now: u64) {
        self.bans.retain(|_, until| *until > now);
    }

    // ── Registration candidates ─────────────────────────────────────────

    /// Waiting coins that may be offered to a round right now.
    pub fn registrable_candidates(&self, now: u64) -> Vec<SmartCoin> {
        self.waiting_list
            .iter()
            .filter(|w| w.registrable_after <= now)
            .filter(|w| !w.coin.is_banned(now) && self.bans.get(&w.coin.outpoint).map_or(true, |u| *u <= now))
            .filter(|w| !w.coin.spent_according_to_backend)
            .map(|w| w.coin.clone())
            .collect()
    }

    /// The coins to register into `round`: confirmed ones if they suffice,
    /// otherwise any candidate. Empty when nothing is affordable.
    pub fn get_registrable_coins(&self, round: &RoundState, now: u64) -> Vec<SmartCoin> {
        let candidates = self.registrable_candidates(now);
        let confirmed: Vec<SmartCoin> = candidates.iter().filter(|c| c.confirmed).cloned().collect();
        if let Some(selected) = selection::select_coins(&confirmed, round) {
            return selected;
        }
        selection::select_coins(&candidates, round).unwrap_or_default()
    }

    // ── Coordinator fee guard ───────────────────────────────────────────

    pub fn coordinator_fee_percent_to_check(&self) -> Option<f64> {
        self.coordinator_fee_percent_to_check
    }

    pub fn set_coordinator_fee_percent_to_check(&mut self, percent: f64) {
        self.coordinator_fee_percent_to_check = Some(percent);
    }

    /// Forget the recorded fee once nothing is queued anymore.
    pub fn reset_fee_check_if_idle(&mut self) {
        if self.all_queued_coins().is_empty() {
            self.coordinator_fee_percent_to_check = None;
        }
    }

    // ── Rounds ──────────────────────────────────────────────────────────

    pub fn rounds(&self) -> &[ClientRound] {
        &self.rounds
    }

    pub fn round(&self, round_id: u64) -> Option<&ClientRound> {
        self.rounds.iter().find(|r| r.round_id() == round_id)
    }

    pub fn round_mut(&mut self, round_id: u64) -> Option<&mut ClientRound> {
        self.rounds.iter_mut().find(|r| r.round_id() == round_id)
    }

    /// First round in input registration that we have not registered into.
    pub fn registrable_round(&self) -> Option<&ClientRound> {
        self.rounds
            .iter()
            .find(|r| r.phase() == RoundPhase::InputRegistration && !r.is_registered())
    }

    /// Registered, still in input registration.
    pub fn passively_mixing_round_ids(&self) -> Vec<u64> {
        self.rounds
            .iter()
            .filter(|r| r.is_registered() && r.phase() == RoundPhase::InputRegistration)
            .map(ClientRound::round_id)
            .collect()
    }

    /// Registered and past input registration.
    pub fn actively_mixing_round_ids(&self) -> Vec<u64> {
        self.rounds
            .iter()
            .filter(|r| r.is_registered() && r.phase() > RoundPhase::InputRegistration)
            .map(ClientRound::round_id)
            .collect()
    }

    pub fn registered_round_of(&self, outpoint: &OutPoint) -> Option<(u64, RoundPhase)> {
        self.rounds
            .iter()
            .find(|r| r.registration().map_or(false, |reg| reg.contains_coin(outpoint)))
            .map(|r| (r.round_id(), r.phase()))
    }

    /// Seconds; `None` without known rounds.
    pub fn smallest_registration_timeout(&self) -> Option<u64> {
        self.rounds.iter().map(|r| r.state.registration_timeout).min()
    }

    /// Reconcile with a fresh coordinator snapshot. Rounds that vanished
    /// give their coins back to the waiting list; new rounds are added;
    /// known rounds take the new state. Returns the removed round ids.
    pub fn update_rounds_by_states(&mut self, links: &ExposedLinks, states: Vec<RoundState>, now: u64) -> Vec<u64> {
        let running: HashSet<u64> = states.iter().map(|s| s.round_id).collect();
        let latest_successful = states.first().map(|s| s.successful_round_count);

        let (kept, gone): (Vec<ClientRound>, Vec<ClientRound>) =
            std::mem::take(&mut self.rounds).into_iter().partition(|r| running.contains(&r.round_id()));
        self.rounds = kept;

        let mut removed = Vec::with_capacity(gone.len());
        for mut round in gone {
            let round_id = round.round_id();
            let failed = latest_successful.map_or(false, |n| n == round.state.successful_round_count);
            if let Some(mut registration) = round.clear_registration() {
                let signed = registration.is_phase_actions_completed(RoundPhase::Signing);
                let revealed = registration
                    .coins_registered()
                    .iter()
                    .filter_map(|c| links.get(&c.outpoint))
                    .flatten()
                    .filter(|p| !p.is_blinded)
                    .count();
                if failed && revealed > 0 {
                    tracing::warn!(
                        "Round ({}): failed after our outputs were posted, {} revealed links remain.",
                        round_id,
                        revealed
                    );
                }
                let after = if signed { now + SIGNED_COIN_REGISTRATION_HOLD } else { now };
                for coin in registration.take_coins() {
                    self.add_coin_to_waiting_list_after(coin, after);
                }
            }
            tracing::info!("Round ({}) removed{}.", round_id, if failed { ", it failed" } else { "" });
            removed.push(round_id);
        }

        for state in states {
            match self.round_mut(state.round_id) {
                Some(round) => round.update_state(state),
                None => self.rounds.push(ClientRound::new(state)),
            }
        }

        if let Some((round_id, registration)) = self.delayed_registration.take() {
            if self.round(round_id).is_some() {
                self.attach_registration(round_id, registration, now);
            } else {
                tracing::info!("Round ({}) never showed up, releasing the delayed registration's coins.", round_id);
                self.release_registration(registration, now);
            }
        }

        removed
    }

    /// Attach a fresh registration to its round. A round the local snapshot
    /// does not know yet gets it on the next update. Returns true when
    /// attached right away.
    pub fn attach_registration(&mut self, round_id: u64, registration: ClientRoundRegistration, now: u64) -> bool {
        let Some(round) = self.round_mut(round_id) else {
            tracing::debug!("Round ({}) not in the local snapshot yet, delaying registration.", round_id);
            if let Some((old_id, old)) = self.delayed_registration.replace((round_id, registration)) {
                tracing::warn!("Round ({}): dropping stale delayed registration.", old_id);
                self.release_registration(old, now);
            }
            return false;
        };
        match round.set_registration(registration) {
            Ok(()) => true,
            Err(rejected) => {
                tracing::error!("Round ({}): already registered, releasing the new registration's coins.", round_id);
                self.release_registration(rejected, now);
                false
            }
        }
    }

    /// Detach our registration from a round and give its coins back to the
    /// waiting list. Returns the released coins.
    pub fn clear_round_registration(&mut self, round_id: u64, now: u64) -> Vec<OutPoint> {
        let Some(round) = self.round_mut(round_id) else {
            return Vec::new();
        };
        let Some(mut registration) = round.clear_registration() else {
            return Vec::new();
        };
        let coins = registration.take_coins();
        let released: Vec<OutPoint> = coins.iter().map(|c| c.outpoint).collect();
        for coin in coins {
            self.add_coin_to_waiting_list(coin, now);
        }
        tracing::info!("Round ({}) registration is cleared.", round_id);
        released
    }

    /// Take the registration parked for a round not yet in the snapshot.
    pub fn take_delayed_registration(&mut self) -> Option<(u64, ClientRoundRegistration)> {
        self.delayed_registration.take()
    }

    /// Give a detached registration's coins back to the waiting list.
    pub fn release_registration(&mut self, mut registration: ClientRoundRegistration, now: u64) {
        for coin in registration.take_coins() {
            self.add_coin_to_waiting_list(coin, now);
        }
    }

    /// Remove a coin from whichever registration holds it.
    pub fn remove_coin_from_registration(&mut self, outpoint: &OutPoint) -> Option<SmartCoin> {
        self.rounds
            .iter_mut()
            .filter_map(ClientRound::registration_mut)
            .find_map(|reg| reg.remove_coin(outpoint))
    }
}
