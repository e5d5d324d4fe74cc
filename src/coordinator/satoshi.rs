use crate::core::{RoundPhase, RoundState};
use crate::error::{CoinJoinError, Result};

use super::protocol::RoundStateResponse;
use super::transport::CoordinatorTransport;

/// Read-only, unauthenticated view of the coordinator's rounds.
#[derive(Clone)]
pub struct SatoshiClient {
    transport: CoordinatorTransport,
}

impl SatoshiClient {
    pub fn new(transport: CoordinatorTransport) -> Self {
        Self { transport }
    }

    /// Every round the coordinator announces. A malformed round is left
    /// out of the snapshot; the others are still returned.
    pub async fn get_all_round_states(&self) -> Result<Vec<RoundState>> {
        let responses: Vec<RoundStateResponse> = self.transport.get_json("states/").await?;
        Ok(responses
            .into_iter()
            .filter_map(|response| {
                let round_id = response.round_id;
                response
                    .into_state()
                    .map_err(|e| tracing::warn!("Round ({}): Ignoring malformed round state: {}", round_id, e))
                    .ok()
            })
            .collect())
    }

    pub async fn get_round_state(&self, round_id: u64) -> Result<RoundState> {
        self.get_all_round_states()
            .await?
            .into_iter()
            .find(|s| s.round_id == round_id)
            .ok_or_else(|| CoinJoinError::NotFound(format!("round {} is not running", round_id)))
    }

    /// First round still accepting inputs.
    pub async fn get_registrable_round_state(&self) -> Result<RoundState> {
        self.get_all_round_states()
            .await?
            .into_iter()
            .find(|s| s.phase == RoundPhase::InputRegistration)
            .ok_or_else(|| CoinJoinError::NotFound("no round in input registration".into()))
    }
}
