//! # Signature Verification
//!
//! Ed25519 verification — the backbone of every SQRL authentication. A
//! client proves possession of its identity key by signing the transmitted
//! `client‖server` concatenation; migration and unlock flows add signatures
//! under the previous identity key and the unlock request key.
//!
//! ## Why a trait?
//!
//! The protocol treats verification as an injected capability rather than
//! calling `ed25519-dalek` inline:
//!
//! 1. A single place to audit all verification call sites.
//! 2. Tests and harnesses can substitute deterministic verifiers.
//! 3. The hand-rolled big-integer Ed25519 of the legacy implementation is
//!    explicitly not welcome here — the capability boundary is where a
//!    vetted library is required to sit.

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};

use crate::config::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// Verification capability consumed by the validator.
///
/// Implementations must be pure and stateless: same inputs, same answer,
/// no side effects. Returns `false` for malformed keys or signatures —
/// the protocol does not distinguish "bad signature" from "bad key", and
/// neither should an attacker.
pub trait SignatureVerifier: Send + Sync {
    /// Verify a detached signature over `message` with `public_key`.
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// The production verifier, backed by `ed25519-dalek`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <&[u8; PUBLIC_KEY_LENGTH]>::try_from(public_key) else {
            return false;
        };
        let Ok(sig_bytes) = <&[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(key_bytes) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(sig_bytes);
        verifying_key.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    #[test]
    fn test_valid_signature_verifies() {
        let kp = keypair();
        let msg = b"client-param-bytes||server-param-bytes";
        let sig = kp.sign(msg);
        let verifier = Ed25519Verifier;
        assert!(verifier.verify(msg, &sig.to_bytes(), kp.verifying_key().as_bytes()));
    }

    #[test]
    fn test_wrong_message_fails() {
        let kp = keypair();
        let sig = kp.sign(b"the message that was signed");
        let verifier = Ed25519Verifier;
        assert!(!verifier.verify(
            b"a different message",
            &sig.to_bytes(),
            kp.verifying_key().as_bytes()
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp1 = keypair();
        let kp2 = keypair();
        let msg = b"message";
        let sig = kp1.sign(msg);
        let verifier = Ed25519Verifier;
        assert!(!verifier.verify(msg, &sig.to_bytes(), kp2.verifying_key().as_bytes()));
    }

    #[test]
    fn test_malformed_inputs_fail_closed() {
        let kp = keypair();
        let sig = kp.sign(b"m");
        let verifier = Ed25519Verifier;
        // Truncated signature.
        assert!(!verifier.verify(b"m", &sig.to_bytes()[..40], kp.verifying_key().as_bytes()));
        // Truncated key.
        assert!(!verifier.verify(b"m", &sig.to_bytes(), &[0u8; 16]));
        // All-zero key is the identity point and must be rejected.
        assert!(!verifier.verify(b"m", &sig.to_bytes(), &[0u8; 32]));
    }
}
