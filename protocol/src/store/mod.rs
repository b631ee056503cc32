//! # Storage Capabilities
//!
//! The protocol engine owns no storage. Everything stateful is reached
//! through the capability traits in this module, injected at construction:
//!
//! - [`IdentityStore`] — identity rows (idk → SUK/VUK/disabled flag).
//! - [`NonceStore`] — nut rows, for deployments that keep a nonce table
//!   ("stateful mode").
//! - [`SessionStore`] — the explicit session capability: per-session
//!   key/value state and the ordered nonce chain. This replaces the session
//!   superglobal of the legacy implementation; the stateless codec is its
//!   only protocol-side consumer.
//! - [`NutBackend`] — the stateful-or-stateless switch the generator and
//!   validator program against.
//!
//! ## Atomicity contract
//!
//! Nonce consumption must behave like compare-and-swap: when two requests
//! race on the same nut, at most one may mint its successor. Stores enforce
//! this at [`NonceStore::store_nonce`] (refuse to supersede an
//! already-superseded predecessor) and [`SessionStore::append_nonce`]
//! (refuse to append unless the expected tail is still the tail). The
//! engine relies on the contract; it does not itself lock.

pub mod memory;

use std::net::IpAddr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::codec::NonceCodec;
use crate::config::SqrlConfig;
use crate::nut::NutRecord;
use crate::tif::Tif;

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by storage capabilities.
///
/// These are infrastructure failures, not protocol outcomes: they propagate
/// out of the handler as errors (HTTP 500 territory) and are never encoded
/// into the TIF mask, because a partially applied request must not be
/// presented as a clean protocol result.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying backend failed (I/O, serialization, corruption).
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// An identity row that was required does not exist.
    #[error("unknown identity key")]
    UnknownIdentity,

    /// Attempted to create an identity key that already exists.
    #[error("identity key already registered")]
    DuplicateIdentity,

    /// A session id that was required does not exist.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The nonce chain tail advanced concurrently; the losing request
    /// must fail rather than double-consume the nut.
    #[error("nonce chain tail advanced concurrently")]
    NonceConflict,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Registration state of an identity key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityStatus {
    /// Registered and enabled.
    Active,
    /// Registered but disabled by a `lock` command.
    Locked,
    /// Never seen (or migrated away from).
    Unknown,
}

/// One registered identity.
///
/// Keys are stored as the base64url strings the client transmitted, so
/// they round-trip to the wire byte-identically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// The identity (public) key.
    pub idk: String,
    /// Server unlock key, returned to the client for unlock/migration.
    pub suk: String,
    /// Verify unlock key, the rescue credential.
    pub vuk: String,
    /// True when locked.
    pub disabled: bool,
}

/// Persistence of identity rows.
pub trait IdentityStore: Send + Sync {
    /// Registration state of `idk`.
    fn check_identity_key(&self, idk: &str) -> StoreResult<IdentityStatus>;

    /// Register a new identity. Fails on duplicates.
    fn create_identity(&self, idk: &str, suk: &str, vuk: &str) -> StoreResult<()>;

    /// The stored SUK for `idk`, if registered.
    fn get_suk(&self, idk: &str) -> StoreResult<Option<String>>;

    /// The stored VUK for `idk`, if registered.
    fn get_vuk(&self, idk: &str) -> StoreResult<Option<String>>;

    /// Disable `idk`. Fails if unknown.
    fn lock_identity_key(&self, idk: &str) -> StoreResult<()>;

    /// Re-enable `idk`. Fails if unknown.
    fn unlock_identity_key(&self, idk: &str) -> StoreResult<()>;

    /// Wholesale migration: the row registered under `previous` is
    /// re-registered under `next` with the supplied unlock keys. The old
    /// key becomes Unknown. Fails if `previous` is unknown.
    fn update_identity_key(
        &self,
        previous: &str,
        next: &str,
        suk: &str,
        vuk: &str,
    ) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Explicit session capability: id allocation, per-session key/value state,
/// and the ordered nonce chain.
///
/// Implementations must make [`append_nonce`](SessionStore::append_nonce)
/// atomic with respect to its expected-tail check — that check *is* the
/// protocol's replay CAS.
pub trait SessionStore: Send + Sync {
    /// Allocate a fresh session and return its id.
    fn create_session(&self) -> StoreResult<String>;

    /// Whether the session exists.
    fn session_exists(&self, session: &str) -> StoreResult<bool>;

    /// Read a session value.
    fn get(&self, session: &str, key: &str) -> StoreResult<Option<String>>;

    /// Write a session value.
    fn set(&self, session: &str, key: &str, value: &str) -> StoreResult<()>;

    /// Append `nut` to the session's nonce chain iff the current tail is
    /// `expected_tail` (`None` = chain must be empty). Returns
    /// [`StoreError::NonceConflict`] when the tail has moved.
    fn append_nonce(&self, session: &str, expected_tail: Option<&str>, nut: &str)
        -> StoreResult<()>;

    /// The session's nonce chain, oldest first.
    fn nonce_chain(&self, session: &str) -> StoreResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Stateful Nonce Store
// ---------------------------------------------------------------------------

/// Persistence of nut rows for stateful deployments.
pub trait NonceStore: Send + Sync {
    /// Persist a freshly minted nut. When `record.previous` is set, the
    /// predecessor row is marked superseded in the same atomic step;
    /// if it was already superseded, the call fails with
    /// [`StoreError::NonceConflict`].
    fn store_nonce(&self, record: &NutRecord) -> StoreResult<()>;

    /// Look up a nut row. Superseded rows are still returned (the
    /// validator needs to see them to reject them); never-minted nuts
    /// return `None`.
    fn get_nut_details(&self, nut: &str) -> StoreResult<Option<NutRecord>>;

    /// The still-active (non-superseded, unconsumed) nonce most recently
    /// minted for `session`, if any.
    fn get_session_nonce(&self, session: &str) -> StoreResult<Option<String>>;

    /// Mark the chain containing `nut` as authenticated.
    fn log_session_in(&self, nut: &str) -> StoreResult<()>;

    /// Mark the chain containing `nut` as ended (logged out / killed).
    fn end_session(&self, nut: &str) -> StoreResult<()>;

    /// Whether the chain containing `nut` has authenticated and not been
    /// ended since.
    fn session_authenticated(&self, nut: &str) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// Backend Dispatch
// ---------------------------------------------------------------------------

/// The nonce backend the generator and validator program against.
///
/// Stateful deployments keep a nut table; stateless deployments delegate
/// every operation to the [`NonceCodec`], which reconstructs nut state from
/// the encrypted token plus the session chain.
#[derive(Clone)]
pub enum NutBackend {
    /// Nut rows live in a [`NonceStore`]. `session` carries the caller's
    /// session id when the transport has one (used to reuse an active
    /// login nonce on repeated page loads).
    Stateful {
        store: Arc<dyn NonceStore>,
        session: Option<String>,
    },
    /// All nut state travels inside the token.
    Stateless(NonceCodec),
}

impl NutBackend {
    /// Stateful backend without a transport session.
    pub fn stateful(store: Arc<dyn NonceStore>) -> Self {
        NutBackend::Stateful {
            store,
            session: None,
        }
    }

    /// Mint the next nut for `ip`, chained to `previous` when present.
    pub fn mint(
        &self,
        config: &SqrlConfig,
        action: Tif,
        key: Option<&str>,
        previous: Option<&str>,
        ip: IpAddr,
    ) -> StoreResult<String> {
        match self {
            NutBackend::Stateful { store, session } => {
                let mut record = NutRecord::new(stateful_nut(&config.nonce_salt), ip, action);
                record.key = key.map(str::to_string);
                record.previous = previous.map(str::to_string);
                record.session = session.clone();
                store.store_nonce(&record)?;
                Ok(record.nut)
            }
            NutBackend::Stateless(codec) => codec.encode(action, key, previous, ip),
        }
    }

    /// Look up the server-side view of a presented nut. `None` means the
    /// nut was never minted or cannot be consumed (stateless non-tail).
    pub fn lookup(&self, nut: &str) -> StoreResult<Option<NutRecord>> {
        match self {
            NutBackend::Stateful { store, .. } => store.get_nut_details(nut),
            NutBackend::Stateless(codec) => codec.decode(nut),
        }
    }

    /// An already-active session nonce, when the backend has a transport
    /// session to consult. Stateless mode never reuses nonces.
    pub fn active_session_nonce(&self) -> StoreResult<Option<String>> {
        match self {
            NutBackend::Stateful {
                store,
                session: Some(session),
            } => store.get_session_nonce(session),
            _ => Ok(None),
        }
    }

    /// Flag the session behind `nut` as authenticated.
    pub fn log_session_in(&self, nut: &str) -> StoreResult<()> {
        match self {
            NutBackend::Stateful { store, .. } => store.log_session_in(nut),
            NutBackend::Stateless(codec) => codec.log_session_in(nut),
        }
    }

    /// End the session behind `nut`.
    pub fn end_session(&self, nut: &str) -> StoreResult<()> {
        match self {
            NutBackend::Stateful { store, .. } => store.end_session(nut),
            NutBackend::Stateless(codec) => codec.end_session(nut),
        }
    }

    /// Whether the session behind `nut` is authenticated. Read-only:
    /// works for superseded nuts too, so a login page can poll with the
    /// nut it was originally issued.
    pub fn session_authenticated(&self, nut: &str) -> StoreResult<bool> {
        match self {
            NutBackend::Stateful { store, .. } => store.session_authenticated(nut),
            NutBackend::Stateless(codec) => codec.session_authenticated(nut),
        }
    }
}

// ---------------------------------------------------------------------------
// Stateful Nut Minting
// ---------------------------------------------------------------------------

/// Mints a stateful-mode nut value: `HMAC-SHA256(unique-seed, salt)`,
/// hex-encoded (64 characters). The HMAC keeps nut values unguessable even
/// if the seed source leaks; uniqueness comes from the seed.
fn stateful_nut(salt: &str) -> String {
    let seed = uuid::Uuid::new_v4();
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(salt.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(seed.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
