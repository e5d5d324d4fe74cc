use bitcoin::{Address, OutPoint, ScriptBuf};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::coordinator::AliceApi;
use crate::core::{ActiveOutput, RoundPhase, RoundState, SmartCoin};

/// This client's participation in one round.
pub struct ClientRoundRegistration {
    alice: Arc<dyn AliceApi>,
    coins_registered: Vec<SmartCoin>,
    change_address: Address,
    active_outputs: Vec<ActiveOutput>,
    completed_phases: BTreeSet<RoundPhase>,
    abandoned: Option<String>,
}

impl ClientRoundRegistration {
    pub fn new(alice: Arc<dyn AliceApi>, coins_registered: Vec<SmartCoin>, change_address: Address) -> Self {
        Self {
            alice,
            coins_registered,
            change_address,
            active_outputs: Vec::new(),
            completed_phases: BTreeSet::new(),
            abandoned: None,
        }
    }

    pub fn alice(&self) -> Arc<dyn AliceApi> {
        Arc::clone(&self.alice)
    }

    pub fn coins_registered(&self) -> &[SmartCoin] {
        &self.coins_registered
    }

    pub fn contains_coin(&self, outpoint: &OutPoint) -> bool {
        self.coins_registered.iter().any(|c| c.outpoint == *outpoint)
    }

    pub(crate) fn remove_coin(&mut self, outpoint: &OutPoint) -> Option<SmartCoin> {
        let pos = self.coins_registered.iter().position(|c| c.outpoint == *outpoint)?;
        Some(self.coins_registered.remove(pos))
    }

    pub(crate) fn take_coins(&mut self) -> Vec<SmartCoin> {
        std::mem::take(&mut self.coins_registered)
    }

    pub fn change_address(&self) -> &Address {
        &self.change_address
    }

    pub fn change_script(&self) -> ScriptBuf {
        self.change_address.script_pubkey()
    }

    pub fn active_outputs(&self) -> &[ActiveOutput] {
        &self.active_outputs
    }

    pub fn set_active_outputs(&mut self, outputs: Vec<ActiveOutput>) {
        self.active_outputs = outputs;
    }

    pub fn is_phase_actions_completed(&self, phase: RoundPhase) -> bool {
        self.completed_phases.contains(&phase)
    }

    pub fn set_phase_completed(&mut self, phase: RoundPhase) {
        self.completed_phases.insert(phase);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.is_some()
    }

    pub fn abandon_reason(&self) -> Option<&str> {
        self.abandoned.as_deref()
    }

    /// Stop acting in this round. Coins stay registered until the round
    /// leaves the coordinator's snapshot.
    pub fn abandon(&mut self, reason: impl Into<String>) {
        self.abandoned.get_or_insert_with(|| reason.into());
    }
}

impl fmt::Debug for ClientRoundRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRoundRegistration")
            .field("round_id", &self.alice.round_id())
            .field("unique_id", &self.alice.unique_id())
            .field("coins", &self.coins_registered.len())
            .field("active_outputs", &self.active_outputs.len())
            .field("completed", &self.completed_phases)
            .field("abandoned", &self.abandoned)
            .finish()
    }
}

/// A round as seen locally: the latest coordinator snapshot plus our
/// registration, if any.
#[derive(Debug)]
pub struct ClientRound {
    pub state: RoundState,
    registration: Option<ClientRoundRegistration>,
}

impl ClientRound {
    pub fn new(state: RoundState) -> Self {
        Self { state, registration: None }
    }

    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }

    pub fn phase(&self) -> RoundPhase {
        self.state.phase
    }

    pub fn registration(&self) -> Option<&ClientRoundRegistration> {
        self.registration.as_ref()
    }

    pub fn registration_mut(&mut self) -> Option<&mut ClientRoundRegistration> {
        self.registration.as_mut()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn coins_registered(&self) -> &[SmartCoin] {
        self.registration.as_ref().map_or(&[], |r| r.coins_registered())
    }

    /// Attach a registration. A round holds at most one; the rejected
    /// registration is handed back.
    pub fn set_registration(&mut self, registration: ClientRoundRegistration) -> Result<(), ClientRoundRegistration> {
        if self.registration.is_some() {
            return Err(registration);
        }
        self.registration = Some(registration);
        Ok(())
    }

    pub fn clear_registration(&mut self) -> Option<ClientRoundRegistration> {
        self.registration.take()
    }

    /// Take a new snapshot. The phase never moves backwards for the same round.
    pub fn update_state(&mut self, state: RoundState) {
        let previous = self.state.phase;
        self.state = state;
        if self.state.phase < previous {
            tracing::warn!(
                "Round ({}): coordinator reported phase {} after {}, keeping {}.",
                self.state.round_id,
                self.state.phase,
                previous,
                previous
            );
            self.state.phase = previous;
        }
    }

    /// Phase learned from a confirmation response.
    pub fn advance_phase(&mut self, phase: RoundPhase) {
        if phase > self.state.phase {
            self.state.phase = phase;
        }
    }
}
