//! # Protocol Configuration & Constants
//!
//! Every magic number in the SQRL engine lives here. If you're hardcoding a
//! constant somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Two things live in this module: compile-time protocol constants (key and
//! signature lengths, token layout offsets) and [`SqrlConfig`], the read-only
//! runtime configuration that the handler, validator, and generator consume.
//! Changing the wire-facing constants breaks compatibility with deployed SQRL
//! clients, so don't.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

/// The SQRL protocol version this server speaks. Sent as `ver` in every
/// response and matched against the `ver` the client echoes back.
pub const PROTOCOL_VERSION: &str = "1";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

/// Ed25519 public key length in bytes. Identity keys (idk/pidk), server
/// unlock keys, and verify unlock keys are all Ed25519 points.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Ed25519 signature length. Always 64 bytes. If yours isn't, something
/// has gone terribly wrong.
pub const SIGNATURE_LENGTH: usize = 64;

/// AES-256-GCM key length for the stateless nut cipher.
pub const TOKEN_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length. 96 bits is the standard and the only length
/// you should use. 12 bytes. Not 16. Not 8. Twelve.
pub const TOKEN_NONCE_LENGTH: usize = 12;

// ---------------------------------------------------------------------------
// Stateless Token Layout
// ---------------------------------------------------------------------------

/// Random prefix bytes at the head of every stateless token plaintext.
/// They make otherwise-identical tokens distinct on the wire.
pub const TOKEN_RANDOM_PREFIX_LENGTH: usize = 4;

/// Hex characters encoding the creation timestamp (unix seconds, `%08x`).
pub const TOKEN_TIMESTAMP_HEX_LENGTH: usize = 8;

/// Hex characters encoding the originating IP tag (`%08x`).
pub const TOKEN_IP_HEX_LENGTH: usize = 8;

/// Hex characters encoding the TIF action byte (`%02x`).
pub const TOKEN_TIF_HEX_LENGTH: usize = 2;

/// The fixed trailing check tag. Decryption output that does not end with
/// these four bytes is rejected as not-a-nut. Carried over from the legacy
/// token format; the AEAD tag is the real integrity check.
pub const TOKEN_CHECK_TAG: &[u8; 4] = b"sqrl";

/// Maximum embedded session identifier length in characters.
pub const MAX_SESSION_ID_LENGTH: usize = 128;

// ---------------------------------------------------------------------------
// Nonce Lifecycle
// ---------------------------------------------------------------------------

/// Default nut expiry in minutes. A nut older than this is EXPIRED and the
/// client is told to retry with the fresh one in the same response.
pub const DEFAULT_NONCE_MAX_AGE_MINUTES: i64 = 5;

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Read-only server configuration consumed by the protocol engine.
///
/// This is the `Config` collaborator of the protocol: the handler, validator,
/// and generator only ever read from it. Deployments construct one at startup
/// (the `sqrl-node` binary builds it from CLI flags); it derives serde so it
/// can also be loaded from a config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqrlConfig {
    /// Protocol versions this server accepts, as sent in the `ver` response
    /// field and expected in the client's server-echo. Currently "1".
    pub accepted_versions: String,

    /// Whether the server requires a secure transport. Requests arriving
    /// over the wrong transport fail server validation.
    pub secure: bool,

    /// The key domain, e.g. `example.com` or `example.com/app`. When it
    /// contains a path separator, the `x=` URL parameter tells clients how
    /// many characters of the path participate in key derivation.
    pub domain: String,

    /// Server-relative path of the authentication endpoint, e.g.
    /// `/sqrl/auth`. Appears in every `qry` response field.
    pub authentication_path: String,

    /// Whether unknown identity keys may create accounts via `ident`.
    pub anon_allowed: bool,

    /// Nut expiry in minutes.
    pub nonce_max_age_minutes: i64,

    /// Secret salt. Keys the stateless token cipher and the stateful nut
    /// HMAC. Treat it like a private key: losing it invalidates every
    /// outstanding nut, leaking it lets anyone mint them.
    pub nonce_salt: String,

    /// Server friendly name, sent as `sfn` in every response. What the
    /// client shows the user on the confirmation screen.
    pub friendly_name: String,
}

impl SqrlConfig {
    /// The nut expiry as a [`chrono::Duration`].
    pub fn nonce_max_age(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.nonce_max_age_minutes)
    }
}

impl Default for SqrlConfig {
    fn default() -> Self {
        Self {
            accepted_versions: PROTOCOL_VERSION.to_string(),
            secure: true,
            domain: "localhost".to_string(),
            authentication_path: "/sqrl/auth".to_string(),
            anon_allowed: true,
            nonce_max_age_minutes: DEFAULT_NONCE_MAX_AGE_MINUTES,
            nonce_salt: "change-me".to_string(),
            friendly_name: "SQRL Server".to_string(),
        }
    }
}
