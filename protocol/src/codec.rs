//! # Stateless Nut Codec
//!
//! Encodes everything needed to validate the *next* protocol round directly
//! inside the nut, so the server needs no nonce table and no sticky
//! sessions — only the lightweight session map that tracks each login
//! attempt's nonce chain and authentication flag.
//!
//! ## Token Layout
//!
//! The plaintext is:
//!
//! ```text
//! [4 random bytes][%08x created][%08x ip-tag][%02x tif][session-id][4-byte check tag]
//! ```
//!
//! sealed with AES-256-GCM (12-byte random nonce prepended to the
//! ciphertext, exactly the framing the rest of our stack uses) under a key
//! derived as `SHA-256(nonce_salt)`, then base64url-encoded.
//!
//! ## Replay Protection
//!
//! Each session keeps an ordered chain of every nut minted for it. A token
//! only decodes while it is the chain's **tail**: the moment its successor
//! is appended, re-presenting it returns not-found. Two requests racing on
//! the same tail are serialized by the session store's compare-and-swap
//! append — exactly one successor wins.
//!
//! ## A note on the cipher
//!
//! Earlier deployments of this token format used a fixed-IV block cipher
//! with the bare 4-byte check tag as the only integrity check — IV reuse
//! plus no real MAC. This codec seals with an AEAD instead and keeps the
//! check tag as a cheap sanity marker inside the plaintext. The trade-off
//! is deliberate and visible: tokens minted by a fixed-IV deployment do
//! not decode here, so a migration must let outstanding nuts expire first.

use std::net::IpAddr;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::{
    MAX_SESSION_ID_LENGTH, TOKEN_CHECK_TAG, TOKEN_IP_HEX_LENGTH, TOKEN_KEY_LENGTH,
    TOKEN_NONCE_LENGTH, TOKEN_RANDOM_PREFIX_LENGTH, TOKEN_TIF_HEX_LENGTH,
    TOKEN_TIMESTAMP_HEX_LENGTH,
};
use crate::nut::{ip_from_tag, ip_tag, NutRecord};
use crate::store::{SessionStore, StoreError, StoreResult};
use crate::tif::Tif;
use crate::wire::base64url;

/// Session keys the codec maintains.
const SESSION_KEY_IDK: &str = "idk";
const SESSION_KEY_AUTHENTICATED: &str = "authenticated";
const SESSION_KEY_KILLED: &str = "killed";

/// Fields recovered from a token before any session lookups.
struct ParsedToken {
    created: DateTime<Utc>,
    ip: IpAddr,
    tif: Tif,
    session: String,
}

/// The stateless nut codec.
///
/// Cheap to clone; the session store is shared behind an `Arc`.
#[derive(Clone)]
pub struct NonceCodec {
    key: [u8; TOKEN_KEY_LENGTH],
    sessions: Arc<dyn SessionStore>,
}

impl NonceCodec {
    /// Build a codec keyed by the configured salt.
    pub fn new(nonce_salt: &str, sessions: Arc<dyn SessionStore>) -> Self {
        let digest = Sha256::digest(nonce_salt.as_bytes());
        let mut key = [0u8; TOKEN_KEY_LENGTH];
        key.copy_from_slice(&digest);
        NonceCodec { key, sessions }
    }

    /// Mint the next token.
    ///
    /// Chain continuation: when `previous` is supplied, the new token joins
    /// the predecessor's session and must win the tail CAS against it.
    /// Otherwise a fresh session is allocated. When an identity key is
    /// supplied it is recorded against the session for later rounds.
    pub fn encode(
        &self,
        tif: Tif,
        identity_key: Option<&str>,
        previous: Option<&str>,
        ip: IpAddr,
    ) -> StoreResult<String> {
        let (session, expected_tail) = match previous {
            Some(prev) => {
                let parsed = self
                    .decrypt_parse(prev)
                    .ok_or(StoreError::NonceConflict)?;
                (parsed.session, Some(prev))
            }
            None => (self.sessions.create_session()?, None),
        };

        let mut plaintext = Vec::with_capacity(
            TOKEN_RANDOM_PREFIX_LENGTH
                + TOKEN_TIMESTAMP_HEX_LENGTH
                + TOKEN_IP_HEX_LENGTH
                + TOKEN_TIF_HEX_LENGTH
                + session.len()
                + TOKEN_CHECK_TAG.len(),
        );
        let mut prefix = [0u8; TOKEN_RANDOM_PREFIX_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut prefix);
        plaintext.extend_from_slice(&prefix);
        plaintext.extend_from_slice(
            format!(
                "{:08x}{:08x}{:02x}",
                Utc::now().timestamp() as u32,
                ip_tag(ip),
                tif.bits() & 0xFF,
            )
            .as_bytes(),
        );
        plaintext.extend_from_slice(session.as_bytes());
        plaintext.extend_from_slice(TOKEN_CHECK_TAG);

        let token = self.seal(&plaintext)?;

        self.sessions.append_nonce(&session, expected_tail, &token)?;
        if let Some(key) = identity_key {
            self.sessions.set(&session, SESSION_KEY_IDK, key)?;
        }

        Ok(token)
    }

    /// Decode a presented token into the server-side nut view.
    ///
    /// Total and side-effect-free: every failure — bad base64, failed
    /// decryption, missing check tag, unknown session, or a token that is
    /// no longer its session's chain tail — returns `Ok(None)`, which the
    /// validator reports as an invalid nut. Only storage failures error.
    pub fn decode(&self, token: &str) -> StoreResult<Option<NutRecord>> {
        let Some(parsed) = self.decrypt_parse(token) else {
            return Ok(None);
        };
        if !self.sessions.session_exists(&parsed.session)? {
            return Ok(None);
        }

        // The replay guard: only the most recent nut in the chain is
        // consumable. Anything earlier has been superseded.
        let chain = self.sessions.nonce_chain(&parsed.session)?;
        if chain.last().map(String::as_str) != Some(token) {
            return Ok(None);
        }

        let key = self.sessions.get(&parsed.session, SESSION_KEY_IDK)?;
        let verified = self.flag_set(&parsed.session, SESSION_KEY_AUTHENTICATED)?;
        let killed = self.flag_set(&parsed.session, SESSION_KEY_KILLED)?;

        Ok(Some(NutRecord {
            nut: token.to_string(),
            created: parsed.created,
            ip: parsed.ip,
            action: parsed.tif,
            key,
            previous: chain.first().filter(|head| *head != token).cloned(),
            verified,
            kill_session: killed,
            session: Some(parsed.session),
            superseded: false,
        }))
    }

    /// Flag the token's session as authenticated.
    ///
    /// The token must still decode (it is the current tail at the moment a
    /// command logs the session in).
    pub fn log_session_in(&self, token: &str) -> StoreResult<()> {
        let record = self
            .decode(token)?
            .ok_or_else(|| StoreError::UnknownSession(token.to_string()))?;
        let session = record.session.expect("stateless records carry a session");
        self.sessions.set(&session, SESSION_KEY_AUTHENTICATED, "1")?;
        self.sessions.set(&session, SESSION_KEY_KILLED, "0")
    }

    /// End the token's session (logout / lock).
    pub fn end_session(&self, token: &str) -> StoreResult<()> {
        let record = self
            .decode(token)?
            .ok_or_else(|| StoreError::UnknownSession(token.to_string()))?;
        let session = record.session.expect("stateless records carry a session");
        self.sessions.set(&session, SESSION_KEY_AUTHENTICATED, "0")?;
        self.sessions.set(&session, SESSION_KEY_KILLED, "1")
    }

    /// Whether the token's session has authenticated.
    ///
    /// Read-only and deliberately tolerant of superseded tokens: a login
    /// page polls with the nut it was originally issued, which stops being
    /// the chain tail as soon as the client starts the protocol.
    pub fn session_authenticated(&self, token: &str) -> StoreResult<bool> {
        let Some(parsed) = self.decrypt_parse(token) else {
            return Ok(false);
        };
        if !self.sessions.session_exists(&parsed.session)? {
            return Ok(false);
        }
        Ok(self.flag_set(&parsed.session, SESSION_KEY_AUTHENTICATED)?
            && !self.flag_set(&parsed.session, SESSION_KEY_KILLED)?)
    }

    fn flag_set(&self, session: &str, key: &str) -> StoreResult<bool> {
        Ok(self.sessions.get(session, key)?.as_deref() == Some("1"))
    }

    /// AES-256-GCM seal: random 96-bit nonce prepended to the ciphertext,
    /// the whole thing base64url-encoded.
    fn seal(&self, plaintext: &[u8]) -> StoreResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| StoreError::Backend("token cipher init failed".into()))?;
        let mut nonce_bytes = [0u8; TOKEN_NONCE_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::Backend("token encryption failed".into()))?;

        let mut out = Vec::with_capacity(TOKEN_NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64url::encode(out))
    }

    /// Decrypt and parse a token without consulting session state.
    /// Returns `None` on any structural failure.
    fn decrypt_parse(&self, token: &str) -> Option<ParsedToken> {
        let data = base64url::decode(token).ok()?;
        if data.len() < TOKEN_NONCE_LENGTH {
            return None;
        }
        let (nonce_bytes, ciphertext) = data.split_at(TOKEN_NONCE_LENGTH);
        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()?;

        let header = TOKEN_RANDOM_PREFIX_LENGTH
            + TOKEN_TIMESTAMP_HEX_LENGTH
            + TOKEN_IP_HEX_LENGTH
            + TOKEN_TIF_HEX_LENGTH;
        if plaintext.len() < header + TOKEN_CHECK_TAG.len() {
            return None;
        }
        if !plaintext.ends_with(TOKEN_CHECK_TAG) {
            return None;
        }

        let body = &plaintext[TOKEN_RANDOM_PREFIX_LENGTH..plaintext.len() - TOKEN_CHECK_TAG.len()];
        let body = std::str::from_utf8(body).ok()?;

        let (ts_hex, rest) = body.split_at(TOKEN_TIMESTAMP_HEX_LENGTH);
        let (ip_hex, rest) = rest.split_at(TOKEN_IP_HEX_LENGTH);
        let (tif_hex, session) = rest.split_at(TOKEN_TIF_HEX_LENGTH);

        if session.is_empty() || session.len() > MAX_SESSION_ID_LENGTH {
            return None;
        }

        let created = Utc
            .timestamp_opt(i64::from(u32::from_str_radix(ts_hex, 16).ok()?), 0)
            .single()?;
        let ip = ip_from_tag(u32::from_str_radix(ip_hex, 16).ok()?);
        let tif = Tif::from_bits_truncate(u16::from_str_radix(tif_hex, 16).ok()? & 0xFF);

        Some(ParsedToken {
            created,
            ip,
            tif,
            session: session.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn codec() -> NonceCodec {
        NonceCodec::new("test-salt", Arc::new(MemoryStore::new()))
    }

    fn ip() -> IpAddr {
        "10.20.30.40".parse().unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = codec();
        let token = codec
            .encode(Tif::ID_MATCH | Tif::IP_MATCH, Some("someKey"), None, ip())
            .unwrap();

        let record = codec.decode(&token).unwrap().expect("decodes");
        assert_eq!(record.action, Tif::ID_MATCH | Tif::IP_MATCH);
        assert_eq!(record.key.as_deref(), Some("someKey"));
        assert_eq!(record.ip, ip());
        assert!(record.previous.is_none(), "initial token is the chain head");
        assert!(record.session.is_some());

        let age = Utc::now() - record.created;
        assert!(age.num_seconds() >= 0 && age.num_seconds() < 5);
    }

    #[test]
    fn test_chain_continuation_reports_head() {
        let codec = codec();
        let first = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        let second = codec
            .encode(Tif::ID_MATCH, Some("k"), Some(&first), ip())
            .unwrap();

        let record = codec.decode(&second).unwrap().expect("tail decodes");
        assert_eq!(record.previous.as_deref(), Some(first.as_str()));
        // Both tokens share one session.
        let first_parsed = codec.decrypt_parse(&first).unwrap();
        assert_eq!(record.session.as_deref(), Some(first_parsed.session.as_str()));
    }

    #[test]
    fn test_superseded_token_is_not_found() {
        let codec = codec();
        let first = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        assert!(codec.decode(&first).unwrap().is_some());

        let _second = codec
            .encode(Tif::ID_MATCH, None, Some(&first), ip())
            .unwrap();
        // The session still exists, but the old tail no longer decodes.
        assert!(codec.decode(&first).unwrap().is_none());
    }

    #[test]
    fn test_double_spend_of_a_tail_fails_the_second_minter() {
        let codec = codec();
        let first = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        codec
            .encode(Tif::ID_MATCH, None, Some(&first), ip())
            .unwrap();
        assert!(matches!(
            codec.encode(Tif::ID_MATCH, None, Some(&first), ip()),
            Err(StoreError::NonceConflict)
        ));
    }

    #[test]
    fn test_tampered_token_fails_closed() {
        let codec = codec();
        let token = codec.encode(Tif::NONE, None, None, ip()).unwrap();

        // Flip one character somewhere in the ciphertext body.
        let mut bytes: Vec<char> = token.chars().collect();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == 'A' { 'B' } else { 'A' };
        let tampered: String = bytes.into_iter().collect();

        assert!(codec.decode(&tampered).unwrap().is_none());
    }

    #[test]
    fn test_garbage_and_truncation_fail_closed() {
        let codec = codec();
        assert!(codec.decode("").unwrap().is_none());
        assert!(codec.decode("!!!!").unwrap().is_none());
        assert!(codec.decode("AAAA").unwrap().is_none());

        let token = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        assert!(codec.decode(&token[..token.len() / 2]).unwrap().is_none());
    }

    #[test]
    fn test_wrong_salt_fails_closed() {
        let sessions: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let minter = NonceCodec::new("salt-a", sessions.clone());
        let other = NonceCodec::new("salt-b", sessions);
        let token = minter.encode(Tif::NONE, None, None, ip()).unwrap();
        assert!(other.decode(&token).unwrap().is_none());
    }

    #[test]
    fn test_unknown_session_fails_closed() {
        // Same salt, different session stores: the token decrypts but its
        // session does not exist on the other side.
        let minter = NonceCodec::new("shared", Arc::new(MemoryStore::new()));
        let other = NonceCodec::new("shared", Arc::new(MemoryStore::new()));
        let token = minter.encode(Tif::NONE, None, None, ip()).unwrap();
        assert!(other.decode(&token).unwrap().is_none());
    }

    #[test]
    fn test_login_and_logout_flags() {
        let codec = codec();
        let first = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        assert!(!codec.session_authenticated(&first).unwrap());

        codec.log_session_in(&first).unwrap();
        assert!(codec.session_authenticated(&first).unwrap());

        // Mint the successor; polling with the superseded token still works.
        let second = codec
            .encode(Tif::ID_MATCH, None, Some(&first), ip())
            .unwrap();
        assert!(codec.session_authenticated(&first).unwrap());

        codec.end_session(&second).unwrap();
        assert!(!codec.session_authenticated(&first).unwrap());
        assert!(!codec.session_authenticated(&second).unwrap());
    }

    #[test]
    fn test_tokens_are_unique_per_mint() {
        let codec = codec();
        let a = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        let b = codec.encode(Tif::NONE, None, None, ip()).unwrap();
        assert_ne!(a, b);
    }
}
