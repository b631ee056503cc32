//! # SqrlDb — Persistent Storage Engine
//!
//! The durable persistence layer, built on sled's embedded key-value store.
//! Implements every storage capability the engine consumes:
//! [`IdentityStore`], [`NonceStore`], and [`SessionStore`].
//!
//! ## Tree Layout
//!
//! sled organizes data into named "trees" (analogous to column families in
//! RocksDB or tables in SQL). Each tree is an independent B+ tree with its
//! own keyspace:
//!
//! | Tree             | Key               | Value                     |
//! |------------------|-------------------|---------------------------|
//! | `identities`     | `idk` (UTF-8)     | `bincode(IdentityRecord)` |
//! | `nuts`           | `nut` (UTF-8)     | `bincode(NutRecord)`      |
//! | `sessions`       | `sid` (UTF-8)     | `bincode(SessionEntry)`   |
//! | `session_nonces` | `sid` (UTF-8)     | `nut` (UTF-8)             |
//!
//! ## Atomicity
//!
//! The two compare-and-swap contracts from the capability traits map
//! directly onto `sled::Tree::compare_and_swap`:
//!
//! - superseding a nut's predecessor swaps the predecessor row against its
//!   previously read value, so two racing consumers cannot both mark it;
//! - appending to a session's nonce chain swaps the whole session row, so
//!   two racing appends cannot both extend the same tail.
//!
//! A CAS loser reports [`StoreError::NonceConflict`] and the losing request
//! fails, which is exactly what the protocol wants.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::nut::NutRecord;
use crate::store::{
    IdentityRecord, IdentityStatus, IdentityStore, NonceStore, SessionStore, StoreError,
    StoreResult,
};

/// Per-session row: arbitrary key/value state plus the ordered nonce chain.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionEntry {
    values: HashMap<String, String>,
    chain: Vec<String>,
}

/// Durable storage engine for the SQRL server.
///
/// Wraps a sled `Db` and exposes typed accessors. All serialization uses
/// bincode for compactness and speed.
///
/// # Thread Safety
///
/// sled is inherently thread-safe — trees support lock-free concurrent
/// reads and serialized writes. `SqrlDb` can be shared via `Arc<SqrlDb>`
/// without external synchronization.
#[derive(Debug, Clone)]
pub struct SqrlDb {
    /// The underlying sled database handle.
    db: Db,
    /// Identity rows indexed by identity key.
    identities: Tree,
    /// Nut rows indexed by nut value.
    nuts: Tree,
    /// Session rows indexed by session id.
    sessions: Tree,
    /// The latest nut minted per transport session.
    session_nonces: Tree,
}

impl SqrlDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Create a temporary database that is cleaned up on drop.
    ///
    /// Ideal for tests — no filesystem side effects, no cleanup needed.
    pub fn open_temporary() -> StoreResult<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config.open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let identities = db.open_tree("identities")?;
        let nuts = db.open_tree("nuts")?;
        let sessions = db.open_tree("sessions")?;
        let session_nonces = db.open_tree("session_nonces")?;
        Ok(SqrlDb {
            db,
            identities,
            nuts,
            sessions,
            session_nonces,
        })
    }

    /// Flush all dirty buffers to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn read_identity(&self, idk: &str) -> StoreResult<Option<IdentityRecord>> {
        match self.identities.get(idk.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_identity(&self, record: &IdentityRecord) -> StoreResult<()> {
        self.identities
            .insert(record.idk.as_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    fn read_nut(&self, nut: &str) -> StoreResult<Option<NutRecord>> {
        match self.nuts.get(nut.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_session(&self, session: &str) -> StoreResult<Option<SessionEntry>> {
        match self.sessions.get(session.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walks predecessor links from `nut` to the chain head.
    fn chain_head(&self, nut: &str) -> StoreResult<Option<NutRecord>> {
        let Some(mut current) = self.read_nut(nut)? else {
            return Ok(None);
        };
        let mut guard = 0usize;
        while let Some(prev) = current.previous.clone() {
            match self.read_nut(&prev)? {
                Some(rec) => current = rec,
                None => break,
            }
            guard += 1;
            if guard > 1024 {
                break;
            }
        }
        Ok(Some(current))
    }
}

impl IdentityStore for SqrlDb {
    fn check_identity_key(&self, idk: &str) -> StoreResult<IdentityStatus> {
        Ok(match self.read_identity(idk)? {
            Some(rec) if rec.disabled => IdentityStatus::Locked,
            Some(_) => IdentityStatus::Active,
            None => IdentityStatus::Unknown,
        })
    }

    fn create_identity(&self, idk: &str, suk: &str, vuk: &str) -> StoreResult<()> {
        let record = IdentityRecord {
            idk: idk.to_string(),
            suk: suk.to_string(),
            vuk: vuk.to_string(),
            disabled: false,
        };
        // CAS against absence so a concurrent create cannot overwrite.
        self.identities
            .compare_and_swap(
                idk.as_bytes(),
                None::<&[u8]>,
                Some(bincode::serialize(&record)?),
            )?
            .map_err(|_| StoreError::DuplicateIdentity)
    }

    fn get_suk(&self, idk: &str) -> StoreResult<Option<String>> {
        Ok(self.read_identity(idk)?.map(|rec| rec.suk))
    }

    fn get_vuk(&self, idk: &str) -> StoreResult<Option<String>> {
        Ok(self.read_identity(idk)?.map(|rec| rec.vuk))
    }

    fn lock_identity_key(&self, idk: &str) -> StoreResult<()> {
        let mut record = self.read_identity(idk)?.ok_or(StoreError::UnknownIdentity)?;
        record.disabled = true;
        self.write_identity(&record)
    }

    fn unlock_identity_key(&self, idk: &str) -> StoreResult<()> {
        let mut record = self.read_identity(idk)?.ok_or(StoreError::UnknownIdentity)?;
        record.disabled = false;
        self.write_identity(&record)
    }

    fn update_identity_key(
        &self,
        previous: &str,
        next: &str,
        suk: &str,
        vuk: &str,
    ) -> StoreResult<()> {
        if self.read_identity(next)?.is_some() {
            return Err(StoreError::DuplicateIdentity);
        }
        if self.read_identity(previous)?.is_none() {
            return Err(StoreError::UnknownIdentity);
        }
        // Write the new row and drop the old one in one batch so the
        // identity never exists under both keys (or neither) on disk.
        let record = IdentityRecord {
            idk: next.to_string(),
            suk: suk.to_string(),
            vuk: vuk.to_string(),
            disabled: false,
        };
        let mut batch = sled::Batch::default();
        batch.remove(previous.as_bytes());
        batch.insert(next.as_bytes(), bincode::serialize(&record)?);
        self.identities.apply_batch(batch)?;
        Ok(())
    }
}

impl NonceStore for SqrlDb {
    fn store_nonce(&self, record: &NutRecord) -> StoreResult<()> {
        if let Some(previous) = record.previous.as_deref() {
            let Some(old_bytes) = self.nuts.get(previous.as_bytes())? else {
                return Err(StoreError::NonceConflict);
            };
            let mut prev: NutRecord = bincode::deserialize(&old_bytes)?;
            if prev.superseded {
                return Err(StoreError::NonceConflict);
            }
            prev.superseded = true;
            // The CAS is the race arbiter: whoever swaps the predecessor
            // first is the one consumer allowed to mint a successor.
            self.nuts
                .compare_and_swap(
                    previous.as_bytes(),
                    Some(old_bytes),
                    Some(bincode::serialize(&prev)?),
                )?
                .map_err(|_| StoreError::NonceConflict)?;
        }

        self.nuts
            .insert(record.nut.as_bytes(), bincode::serialize(record)?)?;

        if let Some(session) = record.session.as_deref() {
            self.session_nonces
                .insert(session.as_bytes(), record.nut.as_bytes())?;
        }
        Ok(())
    }

    fn get_nut_details(&self, nut: &str) -> StoreResult<Option<NutRecord>> {
        self.read_nut(nut)
    }

    fn get_session_nonce(&self, session: &str) -> StoreResult<Option<String>> {
        let Some(bytes) = self.session_nonces.get(session.as_bytes())? else {
            return Ok(None);
        };
        let nut = String::from_utf8(bytes.to_vec())
            .map_err(|_| StoreError::Backend("corrupt session nonce index".into()))?;
        // Only hand back a nonce that is still consumable.
        match self.read_nut(&nut)? {
            Some(rec) if !rec.superseded => Ok(Some(nut)),
            _ => Ok(None),
        }
    }

    fn log_session_in(&self, nut: &str) -> StoreResult<()> {
        let mut head = self
            .chain_head(nut)?
            .ok_or_else(|| StoreError::UnknownSession(nut.to_string()))?;
        head.verified = true;
        head.kill_session = false;
        self.nuts
            .insert(head.nut.as_bytes(), bincode::serialize(&head)?)?;
        Ok(())
    }

    fn end_session(&self, nut: &str) -> StoreResult<()> {
        let mut head = self
            .chain_head(nut)?
            .ok_or_else(|| StoreError::UnknownSession(nut.to_string()))?;
        head.verified = false;
        head.kill_session = true;
        self.nuts
            .insert(head.nut.as_bytes(), bincode::serialize(&head)?)?;
        Ok(())
    }

    fn session_authenticated(&self, nut: &str) -> StoreResult<bool> {
        Ok(match self.chain_head(nut)? {
            Some(head) => head.verified && !head.kill_session,
            None => false,
        })
    }
}

impl SessionStore for SqrlDb {
    fn create_session(&self) -> StoreResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.sessions
            .insert(id.as_bytes(), bincode::serialize(&SessionEntry::default())?)?;
        Ok(id)
    }

    fn session_exists(&self, session: &str) -> StoreResult<bool> {
        Ok(self.sessions.contains_key(session.as_bytes())?)
    }

    fn get(&self, session: &str, key: &str) -> StoreResult<Option<String>> {
        let entry = self
            .read_session(session)?
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        Ok(entry.values.get(key).cloned())
    }

    fn set(&self, session: &str, key: &str, value: &str) -> StoreResult<()> {
        // Read-modify-write CAS loop: session values race with chain
        // appends on the same row.
        loop {
            let Some(old_bytes) = self.sessions.get(session.as_bytes())? else {
                return Err(StoreError::UnknownSession(session.to_string()));
            };
            let mut entry: SessionEntry = bincode::deserialize(&old_bytes)?;
            entry.values.insert(key.to_string(), value.to_string());
            let swap = self.sessions.compare_and_swap(
                session.as_bytes(),
                Some(old_bytes),
                Some(bincode::serialize(&entry)?),
            )?;
            if swap.is_ok() {
                return Ok(());
            }
        }
    }

    fn append_nonce(
        &self,
        session: &str,
        expected_tail: Option<&str>,
        nut: &str,
    ) -> StoreResult<()> {
        let Some(old_bytes) = self.sessions.get(session.as_bytes())? else {
            return Err(StoreError::UnknownSession(session.to_string()));
        };
        let mut entry: SessionEntry = bincode::deserialize(&old_bytes)?;
        if entry.chain.last().map(String::as_str) != expected_tail {
            return Err(StoreError::NonceConflict);
        }
        entry.chain.push(nut.to_string());
        self.sessions
            .compare_and_swap(
                session.as_bytes(),
                Some(old_bytes),
                Some(bincode::serialize(&entry)?),
            )?
            .map_err(|_| StoreError::NonceConflict)
    }

    fn nonce_chain(&self, session: &str) -> StoreResult<Vec<String>> {
        let entry = self
            .read_session(session)?
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        Ok(entry.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tif::Tif;
    use std::net::IpAddr;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_identity_crud_roundtrip() {
        let db = SqrlDb::open_temporary().unwrap();
        assert_eq!(
            db.check_identity_key("alice").unwrap(),
            IdentityStatus::Unknown
        );

        db.create_identity("alice", "suk", "vuk").unwrap();
        assert_eq!(
            db.check_identity_key("alice").unwrap(),
            IdentityStatus::Active
        );
        assert_eq!(db.get_suk("alice").unwrap().as_deref(), Some("suk"));

        db.lock_identity_key("alice").unwrap();
        assert_eq!(
            db.check_identity_key("alice").unwrap(),
            IdentityStatus::Locked
        );
        db.unlock_identity_key("alice").unwrap();
        assert_eq!(
            db.check_identity_key("alice").unwrap(),
            IdentityStatus::Active
        );
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let db = SqrlDb::open_temporary().unwrap();
        db.create_identity("alice", "s", "v").unwrap();
        assert!(matches!(
            db.create_identity("alice", "s2", "v2"),
            Err(StoreError::DuplicateIdentity)
        ));
    }

    #[test]
    fn test_migration_is_atomic_on_disk() {
        let db = SqrlDb::open_temporary().unwrap();
        db.create_identity("old", "s1", "v1").unwrap();
        db.update_identity_key("old", "new", "s2", "v2").unwrap();

        assert_eq!(db.check_identity_key("old").unwrap(), IdentityStatus::Unknown);
        assert_eq!(db.check_identity_key("new").unwrap(), IdentityStatus::Active);
        assert_eq!(db.get_vuk("new").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_nonce_supersede_cas() {
        let db = SqrlDb::open_temporary().unwrap();
        let first = NutRecord::new("n1".into(), ip(), Tif::NONE);
        db.store_nonce(&first).unwrap();

        let mut second = NutRecord::new("n2".into(), ip(), Tif::ID_MATCH);
        second.previous = Some("n1".into());
        db.store_nonce(&second).unwrap();
        assert!(db.get_nut_details("n1").unwrap().unwrap().superseded);

        let mut racer = NutRecord::new("n3".into(), ip(), Tif::ID_MATCH);
        racer.previous = Some("n1".into());
        assert!(matches!(
            db.store_nonce(&racer),
            Err(StoreError::NonceConflict)
        ));

        // Chaining to a nut that never existed is a conflict too.
        let mut orphan = NutRecord::new("n4".into(), ip(), Tif::NONE);
        orphan.previous = Some("ghost".into());
        assert!(matches!(
            db.store_nonce(&orphan),
            Err(StoreError::NonceConflict)
        ));
    }

    #[test]
    fn test_session_nonce_index_tracks_active() {
        let db = SqrlDb::open_temporary().unwrap();
        let mut a = NutRecord::new("a".into(), ip(), Tif::NONE);
        a.session = Some("web".into());
        db.store_nonce(&a).unwrap();
        assert_eq!(db.get_session_nonce("web").unwrap().as_deref(), Some("a"));

        let mut b = NutRecord::new("b".into(), ip(), Tif::NONE);
        b.session = Some("web".into());
        b.previous = Some("a".into());
        db.store_nonce(&b).unwrap();
        assert_eq!(db.get_session_nonce("web").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_login_state_survives_reopen_of_handle() {
        let db = SqrlDb::open_temporary().unwrap();
        let head = NutRecord::new("head".into(), ip(), Tif::NONE);
        db.store_nonce(&head).unwrap();
        let mut next = NutRecord::new("next".into(), ip(), Tif::ID_MATCH);
        next.previous = Some("head".into());
        db.store_nonce(&next).unwrap();

        db.log_session_in("next").unwrap();
        // A cloned handle (as an API worker would hold) sees the login.
        let other = db.clone();
        assert!(other.session_authenticated("head").unwrap());

        other.end_session("head").unwrap();
        assert!(!db.session_authenticated("next").unwrap());
    }

    #[test]
    fn test_session_chain_append_cas() {
        let db = SqrlDb::open_temporary().unwrap();
        let sid = db.create_session().unwrap();
        assert!(db.session_exists(&sid).unwrap());
        assert!(!db.session_exists("nope").unwrap());

        db.append_nonce(&sid, None, "a").unwrap();
        db.append_nonce(&sid, Some("a"), "b").unwrap();
        assert!(matches!(
            db.append_nonce(&sid, Some("a"), "c"),
            Err(StoreError::NonceConflict)
        ));
        assert_eq!(db.nonce_chain(&sid).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_session_values_roundtrip() {
        let db = SqrlDb::open_temporary().unwrap();
        let sid = db.create_session().unwrap();
        assert_eq!(db.get(&sid, "idk").unwrap(), None);
        db.set(&sid, "idk", "key").unwrap();
        db.set(&sid, "authenticated", "1").unwrap();
        assert_eq!(db.get(&sid, "idk").unwrap().as_deref(), Some("key"));
        assert_eq!(db.get(&sid, "authenticated").unwrap().as_deref(), Some("1"));
    }
}
