use bitcoin::{OutPoint, Txid};
use std::collections::BTreeMap;

use crate::core::{DequeueReason, SmartCoin};

/// Notifications for wallet and UI subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum CoinJoinEvent {
    /// A new coordinator snapshot was applied.
    StateUpdated,
    CoinQueued(SmartCoin),
    CoinDequeued { coin: SmartCoin, reason: DequeueReason },
    RoundRegistered { round_id: u64, inputs: Vec<OutPoint> },
    /// We stopped acting in a round; its coins wait for the round to end.
    RoundAbandoned { round_id: u64, reason: String },
    CoinJoinSigned { round_id: u64, txid: Txid },
}

/// Outcome of a dequeue request. Coins that could not leave are listed
/// under the reason that kept them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DequeueResult {
    pub successful: BTreeMap<DequeueReason, Vec<SmartCoin>>,
    pub unsuccessful: BTreeMap<DequeueReason, Vec<SmartCoin>>,
}

impl DequeueResult {
    pub(crate) fn push_successful(&mut self, reason: DequeueReason, coin: SmartCoin) {
        self.successful.entry(reason).or_default().push(coin);
    }

    pub(crate) fn push_unsuccessful(&mut self, reason: DequeueReason, coin: SmartCoin) {
        self.unsuccessful.entry(reason).or_default().push(coin);
    }

    /// Fold a later attempt in. Successes accumulate; the unsuccessful
    /// set is replaced by the later view.
    pub fn merge(&mut self, later: DequeueResult) {
        for (reason, coins) in later.successful {
            self.successful.entry(reason).or_default().extend(coins);
        }
        self.unsuccessful = later.unsuccessful;
    }

    pub fn successful_count(&self) -> usize {
        self.successful.values().map(Vec::len).sum()
    }

    pub fn unsuccessful_count(&self) -> usize {
        self.unsuccessful.values().map(Vec::len).sum()
    }

    pub fn is_dequeued(&self, outpoint: &OutPoint) -> bool {
        self.successful.values().flatten().any(|c| c.outpoint == *outpoint)
    }
}
