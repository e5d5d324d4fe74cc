mod common;

use axum::http::StatusCode;
use bitcoin::{Amount, Network, OutPoint};
use chaumix::core::{now, DequeueReason, RoundPhase, SmartCoin};
use chaumix::testing::{round_state, MemoryKeyManager};
use chaumix::{CoinJoinClient, CoinJoinError, CoinJoinEvent};
use common::{client, FakeCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const ONE_BTC: u64 = 100_000_000;

struct Mixer {
    fake: FakeCoordinator,
    wallet: Arc<MemoryKeyManager>,
    client: CoinJoinClient,
}

impl Mixer {
    async fn new() -> Self {
        let fake = FakeCoordinator::start(vec![round_state(1, RoundPhase::InputRegistration)]).await;
        let wallet = Arc::new(MemoryKeyManager::new(Network::Regtest));
        let client = client(&fake, wallet.clone());
        client.poll_once().await.unwrap();
        Self { fake, wallet, client }
    }

    fn coin(&self, sats: u64) -> SmartCoin {
        let coin = self.wallet.receive_coin(Amount::from_sat(sats), true);
        self.fake.know_coins(&[coin.clone()]);
        coin
    }

    async fn step(&self, phase: RoundPhase) {
        self.fake.set_phase(1, phase);
        self.client.poll_once().await.unwrap();
    }

    async fn registered_round_of(&self, outpoint: OutPoint) -> Option<(u64, RoundPhase)> {
        self.client.inspect(|m| m.state.registered_round_of(&outpoint)).await
    }

    async fn is_waiting(&self, outpoint: OutPoint) -> bool {
        self.client.inspect(|m| m.state.is_waiting(&outpoint)).await
    }

    async fn is_abandoned(&self) -> bool {
        self.client
            .inspect(|m| m.state.round(1).and_then(|r| r.registration()).map_or(false, |r| r.is_abandoned()))
            .await
    }
}

fn drain(rx: &mut broadcast::Receiver<CoinJoinEvent>) -> Vec<CoinJoinEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn dequeued(events: &[CoinJoinEvent], reason: DequeueReason) -> Vec<OutPoint> {
    events
        .iter()
        .filter_map(|e| match e {
            CoinJoinEvent::CoinDequeued { coin, reason: r } if *r == reason => Some(coin.outpoint),
            _ => None,
        })
        .collect()
}

// ── End-to-end ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_round_signs_own_input() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    let mut events = m.client.subscribe();

    assert_eq!(m.client.queue_coins(vec![coin.clone()]).await.unwrap(), vec![coin.outpoint]);
    m.client.poll_once().await.unwrap();

    assert_eq!(m.registered_round_of(coin.outpoint).await, Some((1, RoundPhase::InputRegistration)));
    let alice = m.fake.with(|s| s.alices[0].clone());
    assert_eq!(alice.blinded.len(), 2);
    assert_eq!(alice.inputs, vec![coin.outpoint]);

    // Keep-alive while the round still takes inputs.
    m.client.poll_once().await.unwrap();
    assert!(m.fake.with(|s| s.alices[0].confirmations) >= 1);

    m.step(RoundPhase::ConnectionConfirmation).await;
    let actives = m.client.inspect(|m| m.state.round(1).unwrap().registration().unwrap().active_outputs().len()).await;
    assert_eq!(actives, 2);

    m.step(RoundPhase::OutputRegistration).await;
    assert_eq!(m.fake.with(|s| s.outputs.len()), 2);
    let levels: Vec<usize> = m.fake.with(|s| {
        let mut l: Vec<usize> = s.outputs.iter().map(|(_, o)| o.mixing_level).collect();
        l.sort();
        l
    });
    assert_eq!(levels, vec![0, 1]);

    m.step(RoundPhase::Signing).await;
    let signatures = m.fake.with(|s| s.signatures.clone());
    assert_eq!(signatures.len(), 1);
    assert_eq!(signatures[0].1.len(), 1);
    assert_eq!(m.client.metrics().coinjoins_signed(), 1);

    // A second cycle in the same phase does not sign again.
    m.client.poll_once().await.unwrap();
    assert_eq!(m.fake.with(|s| s.signatures.len()), 1);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, CoinJoinEvent::CoinQueued(c) if c.outpoint == coin.outpoint)));
    assert!(events.iter().any(|e| matches!(e, CoinJoinEvent::RoundRegistered { round_id: 1, .. })));
    assert!(events.iter().any(|e| matches!(e, CoinJoinEvent::CoinJoinSigned { round_id: 1, .. })));
}

#[tokio::test]
async fn bad_blind_signature_abandons_round() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    let mut events = m.client.subscribe();
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    m.fake.with(|s| s.corrupt_signatures = true);
    m.step(RoundPhase::ConnectionConfirmation).await;
    assert!(m.is_abandoned().await);
    assert_eq!(m.client.metrics().coordinator_misbehavior(), 1);
    let reason = m
        .client
        .inspect(|m| m.state.round(1).and_then(|r| r.registration()?.abandon_reason().map(str::to_owned)))
        .await
        .unwrap();
    assert!(reason.contains("misbehavior"));

    m.step(RoundPhase::OutputRegistration).await;
    m.step(RoundPhase::Signing).await;
    assert_eq!(m.fake.with(|s| s.outputs.len()), 0);
    assert!(m.fake.with(|s| s.signatures.is_empty()));

    // The coin stays with the round until the coordinator drops it.
    assert_eq!(m.registered_round_of(coin.outpoint).await.map(|r| r.0), Some(1));
    assert!(!m.is_waiting(coin.outpoint).await);

    m.fake.with(|s| s.rounds = vec![round_state(2, RoundPhase::InputRegistration)]);
    m.client.poll_once().await.unwrap();
    // Released with the vanished round and offered to the next one.
    assert_eq!(m.registered_round_of(coin.outpoint).await, Some((2, RoundPhase::InputRegistration)));
    assert_eq!(m.fake.with(|s| s.input_requests), 2);

    let events = drain(&mut events);
    assert!(events.iter().any(|e| matches!(e, CoinJoinEvent::RoundAbandoned { round_id: 1, .. })));
}

#[tokio::test]
async fn raised_coordinator_fee_dequeues_everything() {
    let m = Mixer::new().await;
    let a = m.coin(ONE_BTC / 2);
    let b = m.coin(ONE_BTC / 2);
    let mut events = m.client.subscribe();
    m.client.queue_coins(vec![a.clone(), b.clone()]).await.unwrap();

    m.fake.with(|s| s.rounds[0].coordinator_fee_percent = 0.004);
    m.client.poll_once().await.unwrap();

    assert_eq!(m.fake.with(|s| s.input_requests), 0);
    assert_eq!(m.client.inspect(|m| m.state.all_queued_coins().len()).await, 0);
    let mut gone = dequeued(&drain(&mut events), DequeueReason::CoordinatorFeeChanged);
    gone.sort();
    let mut expected = vec![a.outpoint, b.outpoint];
    expected.sort();
    assert_eq!(gone, expected);
    assert_eq!(m.client.inspect(|m| m.state.coordinator_fee_percent_to_check()).await, None);
}

// ── Coordinator rejections ──────────────────────────────────────────────────

#[tokio::test]
async fn banned_coin_is_dequeued_and_held_back() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    let mut events = m.client.subscribe();
    let message = format!(
        "Input is banned from participation for 30 minutes: {}:{}.",
        coin.outpoint.vout, coin.outpoint.txid
    );
    m.fake.with(|s| s.input_rejection = Some((StatusCode::BAD_REQUEST, message)));

    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    assert_eq!(dequeued(&drain(&mut events), DequeueReason::Banned), vec![coin.outpoint]);
    assert!(!m.is_waiting(coin.outpoint).await);
    let until = m.client.inspect(|m| m.state.banned_until(&coin.outpoint)).await.unwrap();
    assert!(until >= now() + 29 * 60);

    // Queued again, it waits out the ban.
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();
    assert!(m.is_waiting(coin.outpoint).await);
    assert_eq!(m.fake.with(|s| s.input_requests), 1);
}

#[tokio::test]
async fn oversized_ban_saturates() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    let mut events = m.client.subscribe();
    let message = format!(
        "Input is banned from participation for {} minutes: {}:{}.",
        u64::MAX / 10,
        coin.outpoint.vout,
        coin.outpoint.txid
    );
    m.fake.with(|s| s.input_rejection = Some((StatusCode::BAD_REQUEST, message)));

    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    assert_eq!(dequeued(&drain(&mut events), DequeueReason::Banned), vec![coin.outpoint]);
    assert_eq!(m.client.inspect(|m| m.state.banned_until(&coin.outpoint)).await, Some(u64::MAX));

    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();
    assert!(m.is_waiting(coin.outpoint).await);
    assert_eq!(m.fake.with(|s| s.input_requests), 1);
}

#[tokio::test]
async fn spent_input_is_dequeued() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    let mut events = m.client.subscribe();
    let message = format!("Provided input is not unspent: {}:{}.", coin.outpoint.vout, coin.outpoint.txid);
    m.fake.with(|s| s.input_rejection = Some((StatusCode::BAD_REQUEST, message)));

    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    assert_eq!(dequeued(&drain(&mut events), DequeueReason::Spent), vec![coin.outpoint]);
    assert_eq!(m.client.inspect(|m| m.state.all_queued_coins().len()).await, 0);
}

#[tokio::test]
async fn wallet_spend_withdraws_passive_registration() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();
    assert!(m.registered_round_of(coin.outpoint).await.is_some());

    m.wallet.mark_spent(coin.outpoint);
    m.client.poll_once().await.unwrap();

    assert_eq!(m.client.inspect(|m| m.state.all_queued_coins().len()).await, 0);
    assert_eq!(m.fake.with(|s| s.unconfirmed.len()), 1);
}

#[tokio::test]
async fn unaffordable_queue_is_dequeued() {
    let m = Mixer::new().await;
    let coin = m.coin(1_000_000);
    let mut events = m.client.subscribe();
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    assert_eq!(dequeued(&drain(&mut events), DequeueReason::NotEnoughFundsEnqueued), vec![coin.outpoint]);
    assert_eq!(m.fake.with(|s| s.input_requests), 0);
}

#[tokio::test]
async fn spent_coin_cannot_be_queued() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.wallet.mark_spent(coin.outpoint);
    assert!(matches!(
        m.client.queue_coins(vec![coin.clone()]).await,
        Err(CoinJoinError::CoinNotSpendable(op)) if op == coin.outpoint
    ));
}

// ── Dequeue ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn passive_registration_is_withdrawn_on_dequeue() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    let removed = m.client.dequeue_coin(coin.outpoint, DequeueReason::UserRequested).await.unwrap();
    assert_eq!(removed.outpoint, coin.outpoint);
    assert_eq!(m.fake.alice_count(), 0);
    assert!(!m.client.inspect(|m| m.state.contains(&coin.outpoint)).await);
    assert!(!m.client.inspect(|m| m.state.round(1).unwrap().is_registered()).await);
}

#[tokio::test]
async fn active_round_coin_cannot_be_dequeued() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();
    m.step(RoundPhase::ConnectionConfirmation).await;

    let result = m.client.dequeue_coins(&[coin.outpoint], DequeueReason::UserRequested).await;
    assert_eq!(result.successful_count(), 0);
    assert_eq!(result.unsuccessful[&DequeueReason::Mixing][0].outpoint, coin.outpoint);

    assert!(matches!(
        m.client.dequeue_coin(coin.outpoint, DequeueReason::UserRequested).await,
        Err(CoinJoinError::CannotDequeueActiveRound(op)) if op == coin.outpoint
    ));
    assert!(m.registered_round_of(coin.outpoint).await.is_some());
}

// ── Engine ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_status_cycle_is_skipped() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.fake.with(|s| s.inputs_delay = Some(Duration::from_millis(300)));

    let states = m.client.satoshi().get_all_round_states().await.unwrap();
    tokio::join!(m.client.process_status(states.clone()), m.client.process_status(states));

    assert_eq!(m.client.metrics().status_cycles_skipped(), 1);
    assert_eq!(m.fake.with(|s| s.input_requests), 1);
    assert!(m.registered_round_of(coin.outpoint).await.is_some());
}

#[tokio::test]
async fn malformed_round_does_not_stall_registered_round() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    let mut broken = round_state(2, RoundPhase::InputRegistration);
    broken.signer_pub_keys.clear();
    m.fake.with(|s| s.rounds.push(broken));
    m.step(RoundPhase::ConnectionConfirmation).await;

    assert!(m.client.inspect(|m| m.state.round(2).is_none()).await);
    let actives = m.client.inspect(|m| m.state.round(1).unwrap().registration().unwrap().active_outputs().len()).await;
    assert_eq!(actives, 2);
}

#[tokio::test]
async fn shortchanged_coinjoin_is_not_signed() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();
    m.step(RoundPhase::ConnectionConfirmation).await;
    m.step(RoundPhase::OutputRegistration).await;

    m.fake.with(|s| s.shortchange = 50_000);
    m.step(RoundPhase::Signing).await;

    assert!(m.fake.with(|s| s.signatures.is_empty()));
    assert!(m.is_abandoned().await);
    assert_eq!(m.client.metrics().coordinator_misbehavior(), 1);
    assert_eq!(m.client.metrics().coinjoins_signed(), 0);
}

#[tokio::test]
async fn vanished_alice_releases_coins() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();
    m.client.poll_once().await.unwrap();

    m.fake.with(|s| {
        s.alices.clear();
        // Keep the round but stop accepting new inputs for this test.
        s.rounds[0].phase = RoundPhase::ConnectionConfirmation;
    });
    m.client.poll_once().await.unwrap();

    assert!(m.is_waiting(coin.outpoint).await);
    assert!(!m.client.inspect(|m| m.state.round(1).unwrap().is_registered()).await);
}

#[tokio::test]
async fn stop_withdraws_queued_coins() {
    let m = Mixer::new().await;
    let coin = m.coin(ONE_BTC);
    m.client.queue_coins(vec![coin.clone()]).await.unwrap();

    let handle = m.client.start();
    let registered = async {
        while m.registered_round_of(coin.outpoint).await.is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), registered).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), m.client.stop(handle)).await.unwrap();
    assert!(result.is_dequeued(&coin.outpoint));
    assert_eq!(result.successful[&DequeueReason::ApplicationExit].len(), 1);
    assert_eq!(m.fake.alice_count(), 0);
    assert_eq!(m.client.inspect(|m| m.state.all_queued_coins().len()).await, 0);
}
