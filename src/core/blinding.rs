//! Blind-signature interface used for output registration.
//!
//! ```text
//!   Alice (input registration)                    Coordinator
//!   m_i = SHA256(script_i)
//!   (b_i, r_i) = blind(P_i, m_i)   ── b_0..b_k ─►  s'_i = sign(b_i)
//!                                  ◄── s'_0..s'_k ─ (connection confirmation)
//!   s_i = unblind(P_i, s'_i, r_i)
//!   verify(P_i, m_i, s_i)?
//!
//!   Bob (fresh circuit)            ── script_i, s_i, i ─►  verify, accept
//! ```
//!
//! The coordinator sees `b_i` tied to Alice's inputs and `s_i` tied to Bob's
//! output, and cannot link the two. The primitive itself is pluggable; the
//! engine only relies on the three operations below.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::types::SignerPubKey;

macro_rules! hex_bytes {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub Vec<u8>);

        impl $name {
            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }

            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                hex::decode(s).map(Self)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.to_hex()
            }
        }

        impl TryFrom<String> for $name {
            type Error = hex::FromHexError;
            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_hex(&s)
            }
        }
    };
}

hex_bytes!(BlindedMessage);
hex_bytes!(BlindingFactor);
hex_bytes!(BlindSignature);
hex_bytes!(UnblindedSignature);

/// Requester-side blind-signature primitive.
pub trait BlindSignatureScheme: Send + Sync {
    /// Blind a 32-byte message for `signer`. The factor must be kept to unblind.
    fn blind(&self, signer: &SignerPubKey, message: &[u8; 32]) -> Result<(BlindedMessage, BlindingFactor)>;

    fn unblind(
        &self,
        signer: &SignerPubKey,
        signature: &BlindSignature,
        factor: &BlindingFactor,
    ) -> Result<UnblindedSignature>;

    fn verify(&self, signer: &SignerPubKey, message: &[u8; 32], signature: &UnblindedSignature) -> bool;
}

/// Blinding state for one mixing level, held between input registration
/// and connection confirmation.
#[derive(Clone, Debug)]
pub struct Requester {
    pub signer: SignerPubKey,
    pub message: [u8; 32],
    pub blinded: BlindedMessage,
    pub factor: BlindingFactor,
}

impl Requester {
    pub fn new(scheme: &dyn BlindSignatureScheme, signer: SignerPubKey, message: [u8; 32]) -> Result<Self> {
        let (blinded, factor) = scheme.blind(&signer, &message)?;
        Ok(Self { signer, message, blinded, factor })
    }

    /// Unblind the coordinator's signature and check it against our message.
    /// `None` means the coordinator signed something else, or with another key.
    pub fn unblind_and_verify(
        &self,
        scheme: &dyn BlindSignatureScheme,
        signature: &BlindSignature,
    ) -> Result<Option<UnblindedSignature>> {
        let unblinded = scheme.unblind(&self.signer, signature, &self.factor)?;
        if scheme.verify(&self.signer, &self.message, &unblinded) {
            Ok(Some(unblinded))
        } else {
            Ok(None)
        }
    }
}
