pub mod config;
pub mod coordinator;
pub mod core;
pub mod error;
pub mod metrics;
pub mod mix;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wallet;

pub use config::ClientConfig;
pub use core::*;
pub use error::{CoinJoinError, Result};
pub use mix::{CoinJoinClient, CoinJoinEvent, DequeueResult};
