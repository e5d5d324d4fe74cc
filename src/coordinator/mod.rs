//! Coordinator clients.
//!
//! ```text
//!   SatoshiClient  GET  states/                     round snapshots
//!   AliceClient    POST inputs/                     register inputs + blinded outputs
//!                  POST confirmation?uniqueId&roundId
//!                  POST unconfirmation?uniqueId&roundId
//!                  GET  coinjoin?uniqueId&roundId    unsigned tx (hex)
//!                  POST signatures?uniqueId&roundId  {index: witness}
//!   BobClient      POST output?roundId               unblinded output, fresh circuit
//! ```

pub mod alice;
pub mod bob;
pub mod protocol;
pub mod rejection;
pub mod satoshi;
pub mod transport;

pub use alice::{AliceApi, AliceClient, InputRegistration};
pub use bob::BobClient;
pub use rejection::Rejection;
pub use satoshi::SatoshiClient;
pub use transport::CoordinatorTransport;
