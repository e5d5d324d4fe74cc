//! In-process fake coordinator for integration tests.
//!
//! Speaks the v4 endpoints over axum, signs blinded outputs with the toy
//! [`XorBlindScheme`] and builds a coinjoin with four strangers per level.
#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash, Witness,
};
use chaumix::config::ClientConfig;
use chaumix::coordinator::protocol::{
    ConnectionConfirmationResponse, InputsRequest, InputsResponse, OutputRequest, RoundStateResponse,
};
use chaumix::core::{
    output_script_hash, BlindSignatureScheme, BlindedMessage, RoundPhase, RoundState, SignerPubKey, SmartCoin,
};
use chaumix::mix::fairness::coordinator_fee;
use chaumix::testing::{MemoryKeyManager, XorBlindScheme};
use chaumix::CoinJoinClient;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PREFIX: &str = "/api/v4/btc/chaumiancoinjoin";
pub const STRANGERS_PER_LEVEL: u8 = 4;

#[derive(Clone, Debug)]
pub struct FakeAlice {
    pub unique_id: String,
    pub round_id: u64,
    pub inputs: Vec<OutPoint>,
    pub blinded: Vec<BlindedMessage>,
    pub change_address: String,
    pub confirmations: usize,
}

#[derive(Default)]
pub struct FakeState {
    pub rounds: Vec<RoundState>,
    pub alices: Vec<FakeAlice>,
    pub unconfirmed: Vec<String>,
    pub outputs: Vec<(u64, OutputRequest)>,
    pub signatures: Vec<(String, BTreeMap<u32, String>)>,
    /// Known coin values, needed to build the coinjoin.
    pub coins: HashMap<OutPoint, (Amount, ScriptBuf)>,
    pub input_requests: usize,
    /// Next input registration fails with this status and message.
    pub input_rejection: Option<(StatusCode, String)>,
    pub inputs_delay: Option<Duration>,
    /// Acknowledge input registrations for this round instead.
    pub acknowledged_round: Option<u64>,
    /// Sign blinded outputs with the wrong key.
    pub corrupt_signatures: bool,
    /// Satoshis withheld from our change.
    pub shortchange: u64,
    pub output_closed: bool,
    pub unconfirmation_delay: Option<Duration>,
    next_alice: u64,
}

type Shared = Arc<Mutex<FakeState>>;
type Reply<T> = Result<Json<T>, (StatusCode, Json<String>)>;

fn reject<T>(status: StatusCode, message: impl Into<String>) -> Reply<T> {
    Err((status, Json(message.into())))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AliceQuery {
    unique_id: String,
    round_id: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoundQuery {
    round_id: u64,
}

fn parse_input(s: &str) -> Option<OutPoint> {
    let (txid, vout) = s.split_once(':')?;
    Some(OutPoint { txid: Txid::from_str(txid).ok()?, vout: vout.parse().ok()? })
}

fn parse_address(s: &str) -> Option<Address> {
    Address::<NetworkUnchecked>::from_str(s).ok().map(|a| a.assume_checked())
}

fn stranger_script(level: usize, n: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([level as u8 * 16 + n + 1; 20]))
}

fn stranger_input(n: u8) -> TxIn {
    TxIn {
        previous_output: OutPoint { txid: Txid::from_byte_array([0xee - n; 32]), vout: n as u32 },
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

async fn states(State(s): State<Shared>) -> Json<Vec<RoundStateResponse>> {
    let s = s.lock().unwrap();
    Json(s.rounds.iter().map(RoundStateResponse::from_state).collect())
}

async fn inputs(State(s): State<Shared>, Json(req): Json<InputsRequest>) -> Reply<InputsResponse> {
    let delay = s.lock().unwrap().inputs_delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    let mut s = s.lock().unwrap();
    s.input_requests += 1;
    if let Some((status, message)) = s.input_rejection.take() {
        return reject(status, message);
    }
    let open = s
        .rounds
        .iter()
        .any(|r| r.round_id == req.round_id && r.phase == RoundPhase::InputRegistration);
    if !open {
        return reject(StatusCode::BAD_REQUEST, "No such running round in InputRegistration.");
    }
    let Some(inputs) = req.inputs.iter().map(|i| parse_input(&i.input)).collect::<Option<Vec<_>>>() else {
        return reject(StatusCode::BAD_REQUEST, "Invalid input reference.");
    };

    s.next_alice += 1;
    let unique_id = format!("alice-{}", s.next_alice);
    s.alices.push(FakeAlice {
        unique_id: unique_id.clone(),
        round_id: req.round_id,
        inputs,
        blinded: req.blinded_output_scripts,
        change_address: req.change_output_address,
        confirmations: 0,
    });
    let round_id = s.acknowledged_round.unwrap_or(req.round_id);
    Ok(Json(InputsResponse { round_id, unique_id }))
}

async fn confirmation(State(s): State<Shared>, Query(q): Query<AliceQuery>) -> Reply<ConnectionConfirmationResponse> {
    let mut s = s.lock().unwrap();
    let Some(phase) = s.rounds.iter().find(|r| r.round_id == q.round_id).map(|r| r.phase) else {
        return reject(StatusCode::NOT_FOUND, "Round not found.");
    };
    let signers = s.rounds.iter().find(|r| r.round_id == q.round_id).map(|r| r.signer_pub_keys.clone()).unwrap_or_default();
    let corrupt = s.corrupt_signatures;
    let Some(alice) = s.alices.iter_mut().find(|a| a.unique_id == q.unique_id) else {
        return reject(StatusCode::NOT_FOUND, "Alice not found.");
    };
    alice.confirmations += 1;

    if phase == RoundPhase::InputRegistration {
        return Ok(Json(ConnectionConfirmationResponse { current_phase: phase, blinded_output_signatures: None }));
    }
    let signatures = alice
        .blinded
        .iter()
        .enumerate()
        .map(|(level, blinded)| {
            let signer = if corrupt { SignerPubKey(vec![0xff; 33]) } else { signers[level].clone() };
            XorBlindScheme::sign_blinded(&signer, blinded)
        })
        .collect();
    Ok(Json(ConnectionConfirmationResponse { current_phase: phase, blinded_output_signatures: Some(signatures) }))
}

async fn unconfirmation(State(s): State<Shared>, Query(q): Query<AliceQuery>) -> StatusCode {
    let delay = s.lock().unwrap().unconfirmation_delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let mut s = s.lock().unwrap();
    s.alices.retain(|a| a.unique_id != q.unique_id);
    s.unconfirmed.push(q.unique_id);
    StatusCode::OK
}

async fn output(State(s): State<Shared>, Query(q): Query<RoundQuery>, Json(req): Json<OutputRequest>) -> StatusCode {
    let mut s = s.lock().unwrap();
    if s.output_closed {
        return StatusCode::CONFLICT;
    }
    let Some(round) = s.rounds.iter().find(|r| r.round_id == q.round_id) else {
        return StatusCode::NOT_FOUND;
    };
    let Some(address) = parse_address(&req.address) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(signer) = round.signer_pub_key(req.mixing_level) else {
        return StatusCode::BAD_REQUEST;
    };
    let message = output_script_hash(&address.script_pubkey());
    if !XorBlindScheme.verify(signer, &message, &req.unblinded_signature) {
        return StatusCode::BAD_REQUEST;
    }
    s.outputs.push((q.round_id, req));
    StatusCode::OK
}

async fn coinjoin(State(s): State<Shared>, Query(q): Query<AliceQuery>) -> Reply<String> {
    let s = s.lock().unwrap();
    let Some(alice) = s.alices.iter().find(|a| a.unique_id == q.unique_id) else {
        return reject(StatusCode::NOT_FOUND, "Alice not found.");
    };
    let Some(round) = s.rounds.iter().find(|r| r.round_id == q.round_id) else {
        return reject(StatusCode::NOT_FOUND, "Round not found.");
    };

    let mut input: Vec<TxIn> = (0..STRANGERS_PER_LEVEL).map(stranger_input).collect();
    let mut input_sum = Amount::ZERO;
    for op in &alice.inputs {
        let Some((amount, _)) = s.coins.get(op) else {
            return reject(StatusCode::INTERNAL_SERVER_ERROR, format!("unknown coin {}", op));
        };
        input_sum += *amount;
        input.push(TxIn { previous_output: *op, script_sig: ScriptBuf::new(), sequence: Sequence::MAX, witness: Witness::new() });
    }

    let mut output = Vec::new();
    let mut owed = input_sum
        - round.fee_per_input * alice.inputs.len() as u64
        - round.fee_per_output * (alice.blinded.len() as u64 + 1);
    let group = STRANGERS_PER_LEVEL as usize + 1;
    for (_, posted) in s.outputs.iter().filter(|(id, _)| *id == q.round_id) {
        let value = round.level_denomination(posted.mixing_level);
        let Some(address) = parse_address(&posted.address) else {
            continue;
        };
        for n in 0..STRANGERS_PER_LEVEL {
            output.push(TxOut { value, script_pubkey: stranger_script(posted.mixing_level, n) });
        }
        output.push(TxOut { value, script_pubkey: address.script_pubkey() });
        owed -= value + coordinator_fee(value, round.coordinator_fee_percent, group);
    }
    if let Some(change) = parse_address(&alice.change_address) {
        output.push(TxOut { value: owed - Amount::from_sat(s.shortchange), script_pubkey: change.script_pubkey() });
    }

    let tx = Transaction { version: Version::TWO, lock_time: absolute::LockTime::ZERO, input, output };
    Ok(Json(encode::serialize_hex(&tx)))
}

async fn signatures(
    State(s): State<Shared>,
    Query(q): Query<AliceQuery>,
    Json(witnesses): Json<BTreeMap<u32, String>>,
) -> StatusCode {
    s.lock().unwrap().signatures.push((q.unique_id, witnesses));
    StatusCode::OK
}

pub struct FakeCoordinator {
    pub url: String,
    pub state: Shared,
}

impl FakeCoordinator {
    pub async fn start(rounds: Vec<RoundState>) -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState { rounds, ..FakeState::default() }));
        let app = Router::new()
            .route(&format!("{}/states/", PREFIX), get(states))
            .route(&format!("{}/inputs/", PREFIX), post(inputs))
            .route(&format!("{}/confirmation", PREFIX), post(confirmation))
            .route(&format!("{}/unconfirmation", PREFIX), post(unconfirmation))
            .route(&format!("{}/coinjoin", PREFIX), get(coinjoin))
            .route(&format!("{}/signatures", PREFIX), post(signatures))
            .route(&format!("{}/output", PREFIX), post(output))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url: format!("http://{}", addr), state }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            coordinator_url: self.url.clone(),
            request_timeout_secs: 10,
            unconfirmation_timeout_secs: 1,
            shutdown_timeout_secs: 5,
            ..ClientConfig::default()
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_phase(&self, round_id: u64, phase: RoundPhase) {
        self.with(|s| {
            if let Some(r) = s.rounds.iter_mut().find(|r| r.round_id == round_id) {
                r.phase = phase;
            }
        });
    }

    pub fn know_coins(&self, coins: &[SmartCoin]) {
        self.with(|s| {
            for c in coins {
                s.coins.insert(c.outpoint, (c.amount, c.script_pubkey.clone()));
            }
        });
    }

    pub fn alice_count(&self) -> usize {
        self.with(|s| s.alices.len())
    }
}

/// Client against `fake` with the toy blind scheme and an in-memory wallet.
pub fn client(fake: &FakeCoordinator, wallet: Arc<MemoryKeyManager>) -> CoinJoinClient {
    CoinJoinClient::new(fake.config(), Arc::new(XorBlindScheme), wallet).unwrap()
}
