//! Coordinator wire types. Amounts travel as satoshis, byte strings as hex.

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{BlindSignature, BlindedMessage, RoundPhase, RoundState, SignerPubKey, UnblindedSignature};
use crate::error::{CoinJoinError, Result};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStateResponse {
    pub round_id: u64,
    pub phase: RoundPhase,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub denomination: Amount,
    pub mixing_level_count: usize,
    pub signer_pub_keys: Vec<String>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee_per_inputs: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee_per_outputs: Amount,
    pub coordinator_fee_percent: f64,
    pub maximum_input_count_per_peer: usize,
    pub registration_timeout: u64,
    #[serde(default)]
    pub registered_peer_count: usize,
    #[serde(default)]
    pub required_peer_count: usize,
    #[serde(default)]
    pub successful_round_count: u64,
}

impl RoundStateResponse {
    pub fn into_state(self) -> Result<RoundState> {
        if self.signer_pub_keys.len() != self.mixing_level_count || self.mixing_level_count == 0 {
            return Err(CoinJoinError::ProtocolViolation(format!(
                "round {} announces {} mixing levels but {} signer keys",
                self.round_id,
                self.mixing_level_count,
                self.signer_pub_keys.len()
            )));
        }
        let signer_pub_keys = self
            .signer_pub_keys
            .iter()
            .map(|k| hex::decode(k).map(SignerPubKey))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RoundState {
            round_id: self.round_id,
            phase: self.phase,
            denomination: self.denomination,
            signer_pub_keys,
            fee_per_input: self.fee_per_inputs,
            fee_per_output: self.fee_per_outputs,
            coordinator_fee_percent: self.coordinator_fee_percent,
            maximum_input_count_per_peer: self.maximum_input_count_per_peer,
            registration_timeout: self.registration_timeout,
            registered_peer_count: self.registered_peer_count,
            required_peer_count: self.required_peer_count,
            successful_round_count: self.successful_round_count,
        })
    }

    pub fn from_state(state: &RoundState) -> Self {
        Self {
            round_id: state.round_id,
            phase: state.phase,
            denomination: state.denomination,
            mixing_level_count: state.mixing_level_count(),
            signer_pub_keys: state.signer_pub_keys.iter().map(SignerPubKey::to_hex).collect(),
            fee_per_inputs: state.fee_per_input,
            fee_per_outputs: state.fee_per_output,
            coordinator_fee_percent: state.coordinator_fee_percent,
            maximum_input_count_per_peer: state.maximum_input_count_per_peer,
            registration_timeout: state.registration_timeout,
            registered_peer_count: state.registered_peer_count,
            required_peer_count: state.required_peer_count,
            successful_round_count: state.successful_round_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputProofModel {
    /// `txid:vout`
    pub input: String,
    /// Hex compact ECDSA signature over the blinded-outputs digest.
    pub proof: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputsRequest {
    pub round_id: u64,
    pub blinded_output_scripts: Vec<BlindedMessage>,
    pub change_output_address: String,
    pub inputs: Vec<InputProofModel>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputsResponse {
    pub round_id: u64,
    pub unique_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfirmationResponse {
    pub current_phase: RoundPhase,
    #[serde(default)]
    pub blinded_output_signatures: Option<Vec<BlindSignature>>,
}

/// Input index to consensus-encoded witness hex.
pub type SignaturesRequest = BTreeMap<u32, String>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRequest {
    pub address: String,
    pub unblinded_signature: UnblindedSignature,
    pub mixing_level: usize,
}
