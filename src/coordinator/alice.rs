//! Alice: the identified half of a round registration.
//!
//! Alice registers inputs together with blinded output messages, keeps the
//! registration alive through connection confirmation, receives the blind
//! signatures, and later fetches and signs the coinjoin. Bob posts the
//! unblinded outputs separately so the two cannot be linked.

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Address, Transaction, Witness};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{ActiveOutput, BlindSignatureScheme, Requester, RoundPhase};
use crate::error::{CoinJoinError, Result};

use super::protocol::*;
use super::transport::{rejection, CoordinatorTransport};

/// Operations an input registration supports once accepted. One
/// implementation per coordinator protocol version.
#[async_trait]
pub trait AliceApi: Send + Sync {
    fn round_id(&self) -> u64;

    fn unique_id(&self) -> &str;

    /// Active-output addresses, index = mixing level.
    fn registered_addresses(&self) -> &[Address];

    /// Confirm we are still online. Returns the coordinator's current phase
    /// and, once it has signed them, our verified active outputs.
    async fn post_confirmation(&self) -> Result<(RoundPhase, Vec<ActiveOutput>)>;

    /// Withdraw the registration. Best effort and time-boxed; `false` means
    /// the coordinator did not acknowledge in time, which is treated as
    /// already confirmed (the coordinator will time us out).
    async fn post_unconfirmation(&self) -> bool;

    async fn get_unsigned_coinjoin(&self) -> Result<Transaction>;

    /// Post one witness per own input, keyed by input index.
    async fn post_signatures(&self, witnesses: BTreeMap<u32, Witness>) -> Result<()>;
}

/// Everything sent at input registration.
pub struct InputRegistration {
    pub round_id: u64,
    /// One per mixing level, aligned with `registered_addresses`.
    pub requesters: Vec<Requester>,
    pub registered_addresses: Vec<Address>,
    pub change_address: Address,
    pub inputs: Vec<InputProofModel>,
}

/// Protocol v4 Alice over HTTP.
pub struct AliceClient {
    transport: CoordinatorTransport,
    scheme: Arc<dyn BlindSignatureScheme>,
    round_id: u64,
    unique_id: String,
    registered_addresses: Vec<Address>,
    requesters: Vec<Requester>,
    unconfirmation_timeout: Duration,
}

impl AliceClient {
    pub async fn create_new(
        transport: CoordinatorTransport,
        scheme: Arc<dyn BlindSignatureScheme>,
        unconfirmation_timeout: Duration,
        registration: InputRegistration,
    ) -> Result<Self> {
        let InputRegistration { round_id, requesters, registered_addresses, change_address, inputs } = registration;
        if requesters.len() != registered_addresses.len() {
            return Err(CoinJoinError::ProtocolViolation(format!(
                "{} blinded outputs for {} addresses",
                requesters.len(),
                registered_addresses.len()
            )));
        }

        let input_count = inputs.len();
        let request = InputsRequest {
            round_id,
            blinded_output_scripts: requesters.iter().map(|r| r.blinded.clone()).collect(),
            change_output_address: change_address.to_string(),
            inputs,
        };
        let resp: InputsResponse = transport.post_json("inputs/", &request).await?;
        if resp.round_id != round_id {
            return Err(CoinJoinError::RoundMismatch { requested: round_id, acknowledged: resp.round_id });
        }

        tracing::info!("Round ({}), Alice ({}): Registered {} inputs.", round_id, resp.unique_id, input_count);
        Ok(Self {
            transport,
            scheme,
            round_id,
            unique_id: resp.unique_id,
            registered_addresses,
            requesters,
            unconfirmation_timeout,
        })
    }

    fn query(&self) -> String {
        format!("uniqueId={}&roundId={}", self.unique_id, self.round_id)
    }

    fn verify_signatures(&self, signatures: &[crate::core::BlindSignature]) -> Result<Vec<ActiveOutput>> {
        if signatures.len() > self.requesters.len() {
            return Err(CoinJoinError::CoordinatorMisbehavior(format!(
                "{} blind signatures for {} blinded outputs",
                signatures.len(),
                self.requesters.len()
            )));
        }

        let mut outputs = Vec::with_capacity(signatures.len());
        for (level, (signature, requester)) in signatures.iter().zip(&self.requesters).enumerate() {
            let unblinded = requester
                .unblind_and_verify(self.scheme.as_ref(), signature)
                .map_err(|e| CoinJoinError::CoordinatorMisbehavior(format!("unusable blind signature for level {}: {}", level, e)))?
                .ok_or_else(|| {
                    CoinJoinError::CoordinatorMisbehavior(format!(
                        "coordinator did not sign the blinded output properly for level {}",
                        level
                    ))
                })?;
            outputs.push(ActiveOutput {
                address: self.registered_addresses[level].clone(),
                signature: unblinded,
                mixing_level: level,
            });
        }
        Ok(outputs)
    }
}

#[async_trait]
impl AliceApi for AliceClient {
    fn round_id(&self) -> u64 {
        self.round_id
    }

    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn registered_addresses(&self) -> &[Address] {
        &self.registered_addresses
    }

    async fn post_confirmation(&self) -> Result<(RoundPhase, Vec<ActiveOutput>)> {
        let resp = self.transport.post::<()>(&format!("confirmation?{}", self.query()), None).await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        let conf: ConnectionConfirmationResponse = resp.json().await?;

        let outputs = match conf.blinded_output_signatures {
            Some(sigs) if !sigs.is_empty() => self.verify_signatures(&sigs)?,
            _ => Vec::new(),
        };
        tracing::debug!(
            "Round ({}), Alice ({}): Confirmed connection, phase {}.",
            self.round_id,
            self.unique_id,
            conf.current_phase
        );
        Ok((conf.current_phase, outputs))
    }

    async fn post_unconfirmation(&self) -> bool {
        let path = format!("unconfirmation?{}", self.query());
        match tokio::time::timeout(self.unconfirmation_timeout, self.transport.post::<()>(&path, None)).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                tracing::info!("Round ({}), Alice ({}): Unconfirmed connection.", self.round_id, self.unique_id);
                true
            }
            Ok(Ok(resp)) => {
                let e = rejection(resp).await;
                tracing::warn!("Round ({}), Alice ({}): Unconfirmation refused: {}", self.round_id, self.unique_id, e);
                false
            }
            Ok(Err(e)) => {
                tracing::warn!("Round ({}), Alice ({}): Unconfirmation failed: {}", self.round_id, self.unique_id, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Round ({}), Alice ({}): Unconfirmation timed out, assuming already confirmed.",
                    self.round_id,
                    self.unique_id
                );
                false
            }
        }
    }

    async fn get_unsigned_coinjoin(&self) -> Result<Transaction> {
        let tx_hex: String = self.transport.get_json(&format!("coinjoin?{}", self.query())).await?;
        let bytes = hex::decode(tx_hex)?;
        encode::deserialize(&bytes).map_err(|e| CoinJoinError::Decode(format!("unsigned coinjoin: {}", e)))
    }

    async fn post_signatures(&self, witnesses: BTreeMap<u32, Witness>) -> Result<()> {
        let body: SignaturesRequest = witnesses.iter().map(|(i, w)| (*i, encode::serialize_hex(w))).collect();
        let resp = self.transport.post(&format!("signatures?{}", self.query()), Some(&body)).await?;
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        tracing::info!(
            "Round ({}), Alice ({}): Posted {} signatures.",
            self.round_id,
            self.unique_id,
            witnesses.len()
        );
        Ok(())
    }
}
