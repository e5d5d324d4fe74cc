use crate::core::ActiveOutput;
use crate::error::Result;

use super::protocol::OutputRequest;
use super::transport::{is_conflict, rejection, CoordinatorTransport};

/// Anonymous output registration. Build each Bob on
/// [`CoordinatorTransport::isolated`] so it shares nothing with Alice.
pub struct BobClient {
    transport: CoordinatorTransport,
}

impl BobClient {
    pub fn new(transport: CoordinatorTransport) -> Self {
        Self { transport }
    }

    /// `Ok(false)` when the coordinator already closed output registration.
    pub async fn post_output(&self, round_id: u64, output: &ActiveOutput) -> Result<bool> {
        let request = OutputRequest {
            address: output.address.to_string(),
            unblinded_signature: output.signature.clone(),
            mixing_level: output.mixing_level,
        };
        let resp = self.transport.post(&format!("output?roundId={}", round_id), Some(&request)).await?;
        if is_conflict(&resp) {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(rejection(resp).await);
        }
        Ok(true)
    }
}
