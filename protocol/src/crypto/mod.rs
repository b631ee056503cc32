//! # Cryptographic Capabilities
//!
//! The engine never does curve math itself. Signature verification is an
//! injected capability ([`SignatureVerifier`]) so the protocol core stays
//! testable and the cryptography stays auditable in one place. The stateless
//! token cipher lives with the codec that owns its format, not here.

pub mod signatures;

pub use signatures::{Ed25519Verifier, SignatureVerifier};
