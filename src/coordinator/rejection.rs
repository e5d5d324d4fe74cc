//! Translation of coordinator rejection text into typed outcomes.
//!
//! The coordinator reports coin-level problems as free text. This is the only
//! place that looks at that text; everything else matches on [`Rejection`].

use bitcoin::{OutPoint, Txid};
use std::str::FromStr;

use crate::error::CoinJoinError;

const BANNED_PREFIX: &str = "input is banned from participation for ";
const BANNED_MINUTES: &str = " minutes: ";
const NOT_UNSPENT: &str = "provided input is not unspent: ";
const NO_SUCH_ROUND: &str = "no such running round";
const MEMPOOL_CHAIN: [&str; 2] = ["too-long-mempool-chain", "mempool chain too long"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// Coordinator will refuse this input for `minutes`.
    InputBanned { outpoint: OutPoint, minutes: u64 },
    /// Backend says this input is already spent.
    InputNotUnspent { outpoint: OutPoint },
    /// The round left input registration before our request arrived.
    NoSuchRunningRound,
    /// An input's unconfirmed ancestry is too deep for the coordinator's node.
    MempoolChainTooLong,
    /// Our Alice is unknown to the coordinator (timed out or removed).
    AliceNotFound,
    Other(String),
}

impl Rejection {
    pub fn classify(status: u16, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        if let Some(r) = parse_banned(message, &lower) {
            return r;
        }
        if let Some(pos) = lower.find(NOT_UNSPENT) {
            let rest = &message[pos + NOT_UNSPENT.len()..];
            if let Some(outpoint) = parse_txo_ref(rest) {
                return Rejection::InputNotUnspent { outpoint };
            }
        }
        if lower.contains(NO_SUCH_ROUND) {
            return Rejection::NoSuchRunningRound;
        }
        if MEMPOOL_CHAIN.iter().any(|p| lower.contains(p)) {
            return Rejection::MempoolChainTooLong;
        }
        if status == 404 || lower.starts_with("not found") {
            return Rejection::AliceNotFound;
        }
        Rejection::Other(message.to_string())
    }

    /// Classify an engine error; non-rejections map to `None`.
    pub fn from_error(err: &CoinJoinError) -> Option<Self> {
        match err {
            CoinJoinError::CoordinatorRejected { status, message } => Some(Self::classify(*status, message)),
            _ => None,
        }
    }

    /// The rejection only means "come back later".
    pub fn is_retryable(&self) -> bool {
        matches!(self, Rejection::NoSuchRunningRound | Rejection::MempoolChainTooLong)
    }
}

fn parse_banned(message: &str, lower: &str) -> Option<Rejection> {
    let start = lower.find(BANNED_PREFIX)? + BANNED_PREFIX.len();
    let mid = start + lower[start..].find(BANNED_MINUTES)?;
    let minutes = message[start..mid].trim().parse().ok()?;
    let outpoint = parse_txo_ref(&message[mid + BANNED_MINUTES.len()..])?;
    Some(Rejection::InputBanned { outpoint, minutes })
}

/// Parse the coordinator's `<vout>:<txid>` input reference, tolerating a
/// trailing period or further text.
fn parse_txo_ref(s: &str) -> Option<OutPoint> {
    let token = s.split_whitespace().next()?.trim_end_matches('.');
    let (vout, txid) = token.split_once(':')?;
    Some(OutPoint {
        txid: Txid::from_str(txid).ok()?,
        vout: vout.parse().ok()?,
    })
}
