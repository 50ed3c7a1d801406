//! Signing interface abstraction.
//!
//! Cryptographic signing is out of scope for the core: the
//! reference implementation below identifies a "signature" with its signer,
//! giving every message integrity only insofar as the transport already
//! trusts its peers. A real signature scheme (ed25519, etc.) can replace
//! `Signer` without touching any consensus logic, since every call site goes
//! through this trait.

use serde::{Deserialize, Serialize};

pub type ParticipantId = usize;

/// Placeholder signature: who signed, and over what bytes. FIXME: replace
/// with a real asymmetric scheme before this touches an adversarial network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub signer: ParticipantId,
    payload: Vec<u8>,
}

pub struct Signer;

impl Signer {
    pub fn sign(signer: ParticipantId, payload: &[u8]) -> Signature {
        Signature {
            signer,
            payload: payload.to_vec(),
        }
    }

    pub fn verify(signer: ParticipantId, payload: &[u8], signature: &Signature) -> bool {
        signature.signer == signer && signature.payload == payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_own_signature() {
        let sig = Signer::sign(3, b"epoch-7-vote");
        assert!(Signer::verify(3, b"epoch-7-vote", &sig));
    }

    #[test]
    fn rejects_wrong_signer_or_payload() {
        let sig = Signer::sign(3, b"epoch-7-vote");
        assert!(!Signer::verify(4, b"epoch-7-vote", &sig));
        assert!(!Signer::verify(3, b"epoch-8-vote", &sig));
    }
}
