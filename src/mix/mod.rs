//! The mixing engine.
//!
//! [`CoinJoinClient`] polls the coordinator, reconciles [`ClientState`] with
//! every snapshot and, under one mix lock, moves each round we take part in
//! through its phases:
//!
//! ```text
//!   InputRegistration       register coins (Alice), keep the registration alive
//!   ConnectionConfirmation  confirm, verify the blind signatures
//!   OutputRegistration      post every active output (one Bob each)
//!   Signing                 check fairness, sign own inputs
//! ```
//!
//! Coordinator rejections turn into coin actions (ban, spent, retry later).
//! Misbehavior and protocol violations abandon the round; we never sign it.

pub mod events;
pub mod fairness;
pub mod schedule;
pub mod selection;
pub mod signing;

pub use events::{CoinJoinEvent, DequeueResult};

use bitcoin::{Address, Amount, OutPoint};
use futures::future::join_all;
use rand::seq::SliceRandom;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::ClientConfig;
use crate::coordinator::protocol::InputProofModel;
use crate::coordinator::{AliceApi, AliceClient, BobClient, CoordinatorTransport, InputRegistration, Rejection, SatoshiClient};
use crate::core::{
    now, output_script_hash, short_outpoint, BlindSignatureScheme, DequeueReason, Requester, RoundPhase, RoundState,
    SmartCoin,
};
use crate::error::{CoinJoinError, ErrorCategory, Result};
use crate::metrics::Metrics;
use crate::state::{ClientRoundRegistration, ClientState, ExposedLinks};
use crate::wallet::KeyManager;

use fairness::OwnRegistration;
use schedule::MixActivity;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Everything guarded by the mix lock.
#[derive(Debug, Default)]
pub struct MixState {
    pub state: ClientState,
    pub links: ExposedLinks,
}

impl MixState {
    fn registration(&self, round_id: u64) -> Result<&ClientRoundRegistration> {
        self.state
            .round(round_id)
            .and_then(|r| r.registration())
            .ok_or_else(|| CoinJoinError::NotFound(format!("no registration in round {}", round_id)))
    }

    fn registration_mut(&mut self, round_id: u64) -> Result<&mut ClientRoundRegistration> {
        self.state
            .round_mut(round_id)
            .and_then(|r| r.registration_mut())
            .ok_or_else(|| CoinJoinError::NotFound(format!("no registration in round {}", round_id)))
    }

    fn activity(&self) -> MixActivity {
        if !self.state.actively_mixing_round_ids().is_empty() {
            MixActivity::Active
        } else if !self.state.all_queued_coins().is_empty() {
            MixActivity::Passive
        } else {
            MixActivity::Dormant
        }
    }
}

/// Resets the re-entrancy flag however status processing ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct CoinJoinClient {
    config: Arc<ClientConfig>,
    transport: CoordinatorTransport,
    satoshi: SatoshiClient,
    scheme: Arc<dyn BlindSignatureScheme>,
    wallet: Arc<dyn KeyManager>,
    mix: Arc<Mutex<MixState>>,
    processing: Arc<AtomicBool>,
    events: broadcast::Sender<CoinJoinEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    metrics: Metrics,
}

impl CoinJoinClient {
    pub fn new(
        config: ClientConfig,
        scheme: Arc<dyn BlindSignatureScheme>,
        wallet: Arc<dyn KeyManager>,
    ) -> Result<Self> {
        let transport = CoordinatorTransport::new(&config)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            satoshi: SatoshiClient::new(transport.clone()),
            transport,
            scheme,
            wallet,
            mix: Arc::new(Mutex::new(MixState::default())),
            processing: Arc::new(AtomicBool::new(false)),
            events,
            shutdown: Arc::new(shutdown),
            metrics: Metrics::new(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoinJoinEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn satoshi(&self) -> &SatoshiClient {
        &self.satoshi
    }

    /// Read the local state under the mix lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&MixState) -> R) -> R {
        let mix = self.mix.lock().await;
        f(&mix)
    }

    fn emit(&self, event: CoinJoinEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ── Background loop ─────────────────────────────────────────────────

    /// Spawn the polling loop. Pass the handle to [`CoinJoinClient::stop`].
    pub fn start(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut metrics_tick = time::interval(Duration::from_secs(self.config.metrics_report_secs.max(1)));
        metrics_tick.tick().await;
        let poll = time::sleep(Duration::ZERO);
        tokio::pin!(poll);

        tracing::info!("CoinJoin client started, coordinator {}.", self.config.coordinator_url);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = &mut poll => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!("Failed to fetch round states: {}", e);
                    }
                    let delay = self.next_poll_delay().await;
                    tracing::debug!("Next status poll in {:?}.", delay);
                    poll.as_mut().reset(time::Instant::now() + delay);
                }
                _ = metrics_tick.tick() => self.metrics.report(),
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("CoinJoin client stopped.");
    }

    /// Fetch the coordinator's rounds and process them once.
    pub async fn poll_once(&self) -> Result<()> {
        let states = self.satoshi.get_all_round_states().await?;
        self.process_status(states).await;
        Ok(())
    }

    async fn next_poll_delay(&self) -> Duration {
        let mix = self.mix.lock().await;
        schedule::next_poll_delay(&self.config, mix.activity(), mix.state.smallest_registration_timeout())
    }

    /// One status cycle. A cycle arriving while another runs is dropped.
    pub async fn process_status(&self, states: Vec<RoundState>) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Status processing already running, skipping this update.");
            self.metrics.inc_status_cycles_skipped();
            return;
        }
        let _guard = ProcessingGuard(&self.processing);

        {
            let mut guard = self.mix.lock().await;
            let mix = &mut *guard;
            let at = now();
            mix.state.update_rounds_by_states(&mix.links, states, at);
            mix.state.prune_bans(at);
            let locked = self.wallet.locked_internal_keys();
            mix.links.retain_keys(|k| locked.iter().any(|l| l.pubkey == k.pubkey));
        }
        self.emit(CoinJoinEvent::StateUpdated);

        let delay = schedule::response_delay(&self.config);
        if !delay.is_zero() {
            let mut shutdown = self.shutdown.subscribe();
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
        if self.is_stopping() {
            return;
        }

        let mut guard = self.mix.lock().await;
        let mix = &mut *guard;

        for round_id in mix.state.actively_mixing_round_ids() {
            self.try_process_round(mix, round_id).await;
        }

        self.dequeue_spent_coins(mix).await;

        let passive = mix.state.passively_mixing_round_ids();
        if !passive.is_empty() {
            for round_id in passive {
                if mix.registration(round_id).map_or(true, |r| r.is_abandoned()) {
                    continue;
                }
                if let Err(e) = self.confirm_connection(mix, round_id).await {
                    self.handle_round_error(mix, round_id, e);
                }
            }
        } else if let Some(round) = mix.state.registrable_round().map(|r| r.state.clone()) {
            self.try_register_coins(mix, round).await;
        }
    }

    // ── Round phases ────────────────────────────────────────────────────

    async fn try_process_round(&self, mix: &mut MixState, round_id: u64) {
        let Some(round) = mix.state.round(round_id) else {
            return;
        };
        let phase = round.phase();
        let Some(registration) = round.registration() else {
            return;
        };
        if registration.is_abandoned() || registration.is_phase_actions_completed(phase) {
            return;
        }

        let result = match phase {
            RoundPhase::InputRegistration => Ok(()),
            RoundPhase::ConnectionConfirmation => self.confirm_connection(mix, round_id).await,
            RoundPhase::OutputRegistration => self.register_outputs(mix, round_id).await,
            RoundPhase::Signing => self.sign_coinjoin(mix, round_id).await,
        };
        if let Err(e) = result {
            self.handle_round_error(mix, round_id, e);
        }
    }

    async fn confirm_connection(&self, mix: &mut MixState, round_id: u64) -> Result<()> {
        let alice = mix.registration(round_id)?.alice();
        let (phase, outputs) = alice.post_confirmation().await?;
        if let Some(round) = mix.state.round_mut(round_id) {
            round.advance_phase(phase);
        }
        if outputs.is_empty() {
            return Ok(());
        }

        let count = outputs.len();
        let registration = mix.registration_mut(round_id)?;
        registration.set_active_outputs(outputs);
        registration.set_phase_completed(RoundPhase::ConnectionConfirmation);
        tracing::info!(
            "Round ({}), Alice ({}): Connection confirmed, {} active outputs.",
            round_id,
            alice.unique_id(),
            count
        );
        Ok(())
    }

    async fn register_outputs(&self, mix: &mut MixState, round_id: u64) -> Result<()> {
        if !mix.registration(round_id)?.is_phase_actions_completed(RoundPhase::ConnectionConfirmation) {
            self.confirm_connection(mix, round_id).await?;
        }

        let registration = mix.registration(round_id)?;
        let mut outputs = registration.active_outputs().to_vec();
        if outputs.is_empty() {
            return Err(CoinJoinError::ProtocolViolation(format!(
                "round {} reached output registration without signed outputs",
                round_id
            )));
        }
        let coins: Vec<OutPoint> = registration.coins_registered().iter().map(|c| c.outpoint).collect();
        outputs.shuffle(&mut rand::thread_rng());

        let mut posted = 0;
        for output in &outputs {
            let bob = BobClient::new(self.transport.isolated()?);
            if !bob.post_output(round_id, output).await? {
                tracing::info!("Round ({}): Output registration closed after {} outputs.", round_id, posted);
                break;
            }
            posted += 1;
            self.metrics.inc_outputs_registered();
            let script = output.address.script_pubkey();
            for coin in &coins {
                mix.links.unblind(coin, &script);
            }
        }

        mix.registration_mut(round_id)?.set_phase_completed(RoundPhase::OutputRegistration);
        tracing::info!("Round ({}): Registered {} outputs.", round_id, posted);
        Ok(())
    }

    async fn sign_coinjoin(&self, mix: &mut MixState, round_id: u64) -> Result<()> {
        let alice = mix.registration(round_id)?.alice();
        let tx = alice.get_unsigned_coinjoin().await?;

        let witnesses = {
            let round = mix
                .state
                .round(round_id)
                .ok_or_else(|| CoinJoinError::NotFound(format!("round {}", round_id)))?;
            let registration = mix.registration(round_id)?;
            let own = OwnRegistration {
                coins: registration.coins_registered(),
                change_script: registration.change_script(),
                active_scripts: registration.active_outputs().iter().map(|o| o.address.script_pubkey()).collect(),
                registered_address_count: alice.registered_addresses().len(),
            };
            let amount_back = fairness::validate_unsigned_coinjoin(&tx, &own, &round.state)?;
            tracing::debug!("Round ({}): Coinjoin pays back {}.", round_id, amount_back);
            signing::sign_own_inputs(&tx, registration.coins_registered(), self.wallet.as_ref())?
        };

        alice.post_signatures(witnesses).await?;
        mix.registration_mut(round_id)?.set_phase_completed(RoundPhase::Signing);

        let txid = tx.compute_txid();
        self.metrics.inc_coinjoins_signed();
        tracing::info!("Round ({}): Signed coinjoin {}.", round_id, txid);
        self.emit(CoinJoinEvent::CoinJoinSigned { round_id, txid });
        Ok(())
    }

    fn handle_round_error(&self, mix: &mut MixState, round_id: u64, err: CoinJoinError) {
        if let Some(Rejection::AliceNotFound) = Rejection::from_error(&err) {
            tracing::warn!("Round ({}): Coordinator no longer knows our registration: {}", round_id, err);
            mix.state.clear_round_registration(round_id, now());
            return;
        }
        if !err.abandons_round() {
            tracing::warn!("Round ({}): {}", round_id, err);
            return;
        }

        tracing::error!("Round ({}): {}. Abandoning the round.", round_id, err);
        if err.category() == ErrorCategory::CoordinatorMisbehavior {
            self.metrics.inc_coordinator_misbehavior();
        }
        let reason = err.to_string();
        if let Ok(registration) = mix.registration_mut(round_id) {
            registration.abandon(reason.clone());
        }
        self.emit(CoinJoinEvent::RoundAbandoned { round_id, reason });
    }

    // ── Input registration ──────────────────────────────────────────────

    async fn try_register_coins(&self, mix: &mut MixState, round: RoundState) {
        match mix.state.coordinator_fee_percent_to_check() {
            Some(expected) if round.coordinator_fee_percent > expected => {
                tracing::warn!(
                    "Round ({}): Coordinator fee rose from {}% to {}%, dequeuing all coins.",
                    round.round_id,
                    expected,
                    round.coordinator_fee_percent
                );
                let queued: Vec<OutPoint> = mix.state.all_queued_coins().iter().map(|c| c.outpoint).collect();
                self.dequeue_locked(mix, &queued, DequeueReason::CoordinatorFeeChanged).await;
                return;
            }
            Some(_) => {}
            None if mix.state.waiting_list_count() > 0 => {
                mix.state.set_coordinator_fee_percent_to_check(round.coordinator_fee_percent);
            }
            None => {}
        }

        let coins = mix.state.get_registrable_coins(&round, now());
        if coins.is_empty() {
            let waiting = mix.state.all_waiting_amounts();
            if waiting.is_empty() {
                return;
            }
            if let Err(e) = selection::ensure_affordable(&waiting, &round) {
                tracing::info!("Round ({}): {}, dequeuing waiting coins.", round.round_id, e);
                let outpoints: Vec<OutPoint> = mix.state.waiting_coins().map(|c| c.outpoint).collect();
                self.dequeue_locked(mix, &outpoints, DequeueReason::NotEnoughFundsEnqueued).await;
            }
            return;
        }

        if let Err(e) = self.register_coins(mix, &round, coins).await {
            self.handle_registration_error(mix, round.round_id, e).await;
        }
    }

    async fn register_coins(&self, mix: &mut MixState, round: &RoundState, coins: Vec<SmartCoin>) -> Result<()> {
        let outpoints: Vec<OutPoint> = coins.iter().map(|c| c.outpoint).collect();
        let input_sum: Amount = coins.iter().map(|c| c.amount).sum();
        let levels = selection::mixing_level_count(input_sum, coins.len(), round);

        let keys = selection::choose_output_keys(&outpoints, &mix.links, self.wallet.as_ref(), levels)
            .map_err(|e| CoinJoinError::Wallet(e.to_string()))?;
        let network = self.wallet.network();
        let change_address = keys.change.p2wpkh_address(network);
        let addresses: Vec<Address> = keys.actives.iter().map(|k| k.p2wpkh_address(network)).collect();

        let mut requesters = Vec::with_capacity(addresses.len());
        for (level, address) in addresses.iter().enumerate() {
            let signer = round.signer_pub_key(level).cloned().ok_or_else(|| {
                CoinJoinError::ProtocolViolation(format!("round {} has no signer key for level {}", round.round_id, level))
            })?;
            let requester = Requester::new(self.scheme.as_ref(), signer, output_script_hash(&address.script_pubkey()))
                .map_err(|e| CoinJoinError::Signing(format!("blinding level {}: {}", level, e)))?;
            requesters.push(requester);
        }

        let blinded: Vec<_> = requesters.iter().map(|r| r.blinded.clone()).collect();
        let digest = signing::blinded_outputs_digest(&blinded);
        let inputs = coins
            .iter()
            .map(|c| {
                let secret = self
                    .wallet
                    .secret_key_for_script(&c.script_pubkey)
                    .ok_or(CoinJoinError::CoinNotSpendable(c.outpoint))?;
                Ok(InputProofModel {
                    input: format!("{}:{}", c.outpoint.txid, c.outpoint.vout),
                    proof: signing::input_proof(&secret, digest),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // The coordinator learns these links with the request, accepted or not.
        for op in &outpoints {
            mix.links.merge(*op, keys.links());
        }

        let alice = AliceClient::create_new(
            self.transport.isolated()?,
            Arc::clone(&self.scheme),
            self.config.unconfirmation_timeout(),
            InputRegistration {
                round_id: round.round_id,
                requesters,
                registered_addresses: addresses,
                change_address: change_address.clone(),
                inputs,
            },
        )
        .await?;

        let mut registered = Vec::with_capacity(outpoints.len());
        for op in &outpoints {
            if let Some(mut coin) = mix.state.remove_coin_from_waiting_list(op) {
                coin.coinjoin_in_progress = true;
                registered.push(coin);
            }
        }
        let registration = ClientRoundRegistration::new(Arc::new(alice), registered, change_address);
        mix.state.attach_registration(round.round_id, registration, now());

        self.metrics.inc_rounds_registered();
        self.emit(CoinJoinEvent::RoundRegistered { round_id: round.round_id, inputs: outpoints });
        Ok(())
    }

    async fn handle_registration_error(&self, mix: &mut MixState, round_id: u64, err: CoinJoinError) {
        match Rejection::from_error(&err) {
            Some(Rejection::InputBanned { outpoint, minutes }) => {
                tracing::warn!(
                    "Round ({}): Coin {} is banned for {} minutes.",
                    round_id,
                    short_outpoint(&outpoint),
                    minutes
                );
                mix.state.ban(outpoint, now().saturating_add(minutes.saturating_mul(60)));
                self.metrics.inc_coins_banned();
                self.dequeue_locked(mix, &[outpoint], DequeueReason::Banned).await;
            }
            Some(Rejection::InputNotUnspent { outpoint }) => {
                tracing::warn!("Round ({}): Coin {} is already spent.", round_id, short_outpoint(&outpoint));
                mix.state.mark_spent_according_to_backend(&outpoint);
                self.dequeue_locked(mix, &[outpoint], DequeueReason::Spent).await;
            }
            Some(rejection) if rejection.is_retryable() => {
                tracing::info!("Round ({}): {}, trying again later.", round_id, err);
            }
            _ => tracing::error!("Round ({}): Failed to register coins: {}", round_id, err),
        }
    }

    // ── Queue ───────────────────────────────────────────────────────────

    /// Add coins to the waiting list. Fails, queueing nothing, if any coin
    /// is not spendable. Returns the newly queued outpoints.
    pub async fn queue_coins(&self, coins: Vec<SmartCoin>) -> Result<Vec<OutPoint>> {
        if let Some(coin) = coins.iter().find(|c| c.spent_according_to_backend || self.wallet.is_spent(&c.outpoint)) {
            return Err(CoinJoinError::CoinNotSpendable(coin.outpoint));
        }

        let mut mix = self.mix.lock().await;
        if mix.state.coordinator_fee_percent_to_check().is_none() {
            let known = mix.state.registrable_round().or_else(|| mix.state.rounds().first());
            if let Some(percent) = known.map(|r| r.state.coordinator_fee_percent) {
                mix.state.set_coordinator_fee_percent_to_check(percent);
            }
        }

        let at = now();
        let mut queued = Vec::with_capacity(coins.len());
        for coin in coins {
            let outpoint = coin.outpoint;
            if mix.state.add_coin_to_waiting_list(coin.clone(), at) {
                queued.push(outpoint);
                self.emit(CoinJoinEvent::CoinQueued(coin));
            }
        }
        Ok(queued)
    }

    pub async fn dequeue_coins(&self, outpoints: &[OutPoint], reason: DequeueReason) -> DequeueResult {
        let mut mix = self.mix.lock().await;
        self.dequeue_locked(&mut mix, outpoints, reason).await
    }

    /// Dequeue a single coin, failing if it is locked in a round past
    /// input registration.
    pub async fn dequeue_coin(&self, outpoint: OutPoint, reason: DequeueReason) -> Result<SmartCoin> {
        let mut result = self.dequeue_coins(&[outpoint], reason).await;
        if let Some(coin) = result
            .successful
            .values_mut()
            .find_map(|coins| coins.iter().position(|c| c.outpoint == outpoint).map(|i| coins.remove(i)))
        {
            return Ok(coin);
        }
        if result.unsuccessful_count() > 0 {
            return Err(CoinJoinError::CannotDequeueActiveRound(outpoint));
        }
        Err(CoinJoinError::NotFound(format!("coin {} is not queued", short_outpoint(&outpoint))))
    }

    pub async fn dequeue_all(&self, reason: DequeueReason) -> DequeueResult {
        let mut mix = self.mix.lock().await;
        let queued: Vec<OutPoint> = mix.state.all_queued_coins().iter().map(|c| c.outpoint).collect();
        self.dequeue_locked(&mut mix, &queued, reason).await
    }

    async fn dequeue_spent_coins(&self, mix: &mut MixState) {
        let wallet = Arc::clone(&self.wallet);
        let spent = mix.state.spent_coins(|op| wallet.is_spent(op));
        if !spent.is_empty() {
            self.dequeue_locked(mix, &spent, DequeueReason::Spent).await;
        }
    }

    async fn dequeue_locked(&self, mix: &mut MixState, outpoints: &[OutPoint], reason: DequeueReason) -> DequeueResult {
        let mut result = DequeueResult::default();
        let mut passive_rounds = BTreeSet::new();
        let mut delayed = false;

        for op in outpoints {
            match mix.state.registered_round_of(op) {
                Some((round_id, RoundPhase::InputRegistration)) => {
                    passive_rounds.insert(round_id);
                }
                Some((round_id, phase)) => {
                    let spent = reason == DequeueReason::Spent || self.wallet.is_spent(op);
                    if spent {
                        if let Some(coin) = mix.state.remove_coin_from_registration(op) {
                            tracing::info!(
                                "Round ({}): Spent coin {} leaves the registration.",
                                round_id,
                                short_outpoint(op)
                            );
                            self.emit(CoinJoinEvent::CoinDequeued { coin: coin.clone(), reason });
                            result.push_successful(reason, coin);
                        }
                    } else if let Some(coin) = mix
                        .state
                        .round(round_id)
                        .and_then(|r| r.coins_registered().iter().find(|c| c.outpoint == *op).cloned())
                    {
                        tracing::info!(
                            "Round ({}): Coin {} cannot leave a round in {}.",
                            round_id,
                            short_outpoint(op),
                            phase
                        );
                        result.push_unsuccessful(DequeueReason::Mixing, coin);
                    }
                }
                None => delayed |= !mix.state.is_waiting(op) && mix.state.contains(op),
            }
        }

        let mut withdrawals: Vec<(u64, Arc<dyn AliceApi>)> = passive_rounds
            .iter()
            .filter_map(|id| mix.registration(*id).ok().map(|r| (*id, r.alice())))
            .collect();
        if delayed {
            if let Some((round_id, registration)) = mix.state.take_delayed_registration() {
                withdrawals.push((round_id, registration.alice()));
                mix.state.release_registration(registration, now());
            }
        }
        let acknowledged = join_all(withdrawals.iter().map(|(_, alice)| alice.post_unconfirmation())).await;
        for ((round_id, _), ok) in withdrawals.iter().zip(acknowledged) {
            if !ok {
                tracing::debug!("Round ({}): Unconfirmation not acknowledged, the coordinator will time us out.", round_id);
            }
            mix.state.clear_round_registration(*round_id, now());
        }

        for op in outpoints {
            if let Some(coin) = mix.state.remove_coin_from_waiting_list(op) {
                self.emit(CoinJoinEvent::CoinDequeued { coin: coin.clone(), reason });
                result.push_successful(reason, coin);
            }
        }

        self.metrics.add_coins_dequeued(result.successful_count() as u64);
        mix.state.reset_fee_check_if_idle();
        result
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Stop the polling loop, then withdraw every coin that can still be
    /// withdrawn. Gives up after the configured shutdown timeout.
    pub async fn stop(&self, handle: JoinHandle<()>) -> DequeueResult {
        self.shutdown.send_replace(true);
        if let Err(e) = handle.await {
            tracing::error!("Mixing task ended abnormally: {}", e);
        }

        let mut total = DequeueResult::default();
        let withdraw_all = async {
            loop {
                let result = self.dequeue_all(DequeueReason::ApplicationExit).await;
                total.merge(result);
                if self.withdrawable_count().await == 0 {
                    return;
                }
                tracing::warn!("Coins still queued, retrying dequeue.");
                time::sleep(SHUTDOWN_RETRY_INTERVAL).await;
            }
        };
        if time::timeout(self.config.shutdown_timeout(), withdraw_all).await.is_err() {
            tracing::warn!("Shutdown timed out with coins still queued.");
        }
        tracing::info!(
            "Dequeued {} coins on exit, {} stay in active rounds.",
            total.successful_count(),
            total.unsuccessful.get(&DequeueReason::Mixing).map_or(0, Vec::len)
        );
        total
    }

    /// Queued coins not locked into a round past input registration.
    async fn withdrawable_count(&self) -> usize {
        let mix = self.mix.lock().await;
        mix.state
            .all_queued_coins()
            .iter()
            .filter(|c| {
                mix.state
                    .registered_round_of(&c.outpoint)
                    .map_or(true, |(_, phase)| phase == RoundPhase::InputRegistration)
            })
            .count()
    }
}
