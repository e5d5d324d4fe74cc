use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    rounds_registered: Arc<AtomicU64>,
    outputs_registered: Arc<AtomicU64>,
    coinjoins_signed: Arc<AtomicU64>,
    coordinator_misbehavior: Arc<AtomicU64>,
    coins_banned: Arc<AtomicU64>,
    coins_dequeued: Arc<AtomicU64>,
    status_cycles_skipped: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_rounds_registered(&self) {
        self.rounds_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outputs_registered(&self) {
        self.outputs_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_coinjoins_signed(&self) {
        self.coinjoins_signed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_coordinator_misbehavior(&self) {
        self.coordinator_misbehavior.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_coins_banned(&self) {
        self.coins_banned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_coins_dequeued(&self, n: u64) {
        self.coins_dequeued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_status_cycles_skipped(&self) {
        self.status_cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn coinjoins_signed(&self) -> u64 {
        self.coinjoins_signed.load(Ordering::Relaxed)
    }

    pub fn coordinator_misbehavior(&self) -> u64 {
        self.coordinator_misbehavior.load(Ordering::Relaxed)
    }

    pub fn status_cycles_skipped(&self) -> u64 {
        self.status_cycles_skipped.load(Ordering::Relaxed)
    }

    pub fn report(&self) {
        tracing::info!(
            "Metrics: rounds={} outputs={} signed={} misbehavior={} banned={} dequeued={} skipped_cycles={}",
            self.rounds_registered.load(Ordering::Relaxed),
            self.outputs_registered.load(Ordering::Relaxed),
            self.coinjoins_signed.load(Ordering::Relaxed),
            self.coordinator_misbehavior.load(Ordering::Relaxed),
            self.coins_banned.load(Ordering::Relaxed),
            self.coins_dequeued.load(Ordering::Relaxed),
            self.status_cycles_skipped.load(Ordering::Relaxed),
        );
    }
}
