use bitcoin::OutPoint;
use thiserror::Error;

/// Errors surfaced by the mixing engine and its coordinator clients.
#[derive(Debug, Error)]
pub enum CoinJoinError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("coordinator rejected request ({status}): {message}")]
    CoordinatorRejected { status: u16, message: String },

    /// The coordinator broke the protocol in a way that could cost us funds
    /// or privacy. The round must be abandoned.
    #[error("coordinator misbehavior: {0}")]
    CoordinatorMisbehavior(String),

    #[error("coordinator assigned us to the wrong round: {acknowledged}, requested round: {requested}")]
    RoundMismatch { requested: u64, acknowledged: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("coin {0} is registered in a round past input registration")]
    CannotDequeueActiveRound(OutPoint),

    #[error("coin {0} is not spendable")]
    CoinNotSpendable(OutPoint),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Coarse failure class, used to decide how the engine reacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry on the next cycle.
    TransportFailure,
    /// Translated into a coin-level action where recognised.
    CoordinatorRejected,
    /// Abandon the round, never sign.
    CoordinatorMisbehavior,
    /// Abandon the round.
    ProtocolInvariantViolation,
    InsufficientFunds,
    Local,
}

impl CoinJoinError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoinJoinError::Transport(_) => ErrorCategory::TransportFailure,
            CoinJoinError::CoordinatorRejected { .. } => ErrorCategory::CoordinatorRejected,
            CoinJoinError::CoordinatorMisbehavior(_) => ErrorCategory::CoordinatorMisbehavior,
            CoinJoinError::RoundMismatch { .. } | CoinJoinError::ProtocolViolation(_) => {
                ErrorCategory::ProtocolInvariantViolation
            }
            CoinJoinError::InsufficientFunds(_) => ErrorCategory::InsufficientFunds,
            CoinJoinError::NotFound(_)
            | CoinJoinError::CannotDequeueActiveRound(_)
            | CoinJoinError::CoinNotSpendable(_)
            | CoinJoinError::Signing(_)
            | CoinJoinError::Wallet(_)
            | CoinJoinError::Decode(_) => ErrorCategory::Local,
        }
    }

    /// True when the round this error came from can no longer be trusted.
    pub fn abandons_round(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::CoordinatorMisbehavior | ErrorCategory::ProtocolInvariantViolation
        )
    }
}

impl From<reqwest::Error> for CoinJoinError {
    fn from(e: reqwest::Error) -> Self {
        CoinJoinError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for CoinJoinError {
    fn from(e: serde_json::Error) -> Self {
        CoinJoinError::Decode(e.to_string())
    }
}

impl From<hex::FromHexError> for CoinJoinError {
    fn from(e: hex::FromHexError) -> Self {
        CoinJoinError::Decode(e.to_string())
    }
}

pub type Result<T, E = CoinJoinError> = std::result::Result<T, E>;
