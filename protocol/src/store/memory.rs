//! In-process store implementing every storage capability.
//!
//! Backs tests, the demo example, and ephemeral single-process deployments.
//! Identities live in a lock-free map; nut rows and sessions sit behind
//! mutexes because their contracts are compare-and-swap over multiple
//! entries, which per-entry locking can't express.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::nut::NutRecord;

use super::{
    IdentityRecord, IdentityStatus, IdentityStore, NonceStore, SessionStore, StoreError,
    StoreResult,
};

/// Per-session state: key/value pairs plus the ordered nonce chain.
#[derive(Debug, Default)]
struct SessionRecord {
    values: HashMap<String, String>,
    chain: Vec<String>,
}

/// An in-memory implementation of [`IdentityStore`], [`NonceStore`], and
/// [`SessionStore`]. Cheap to construct; share it with `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    identities: DashMap<String, IdentityRecord>,
    nuts: Mutex<HashMap<String, NutRecord>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walks predecessor links from `nut` to the chain head and returns the
    /// head's key. The head row carries the chain-wide session flags.
    fn chain_head(nuts: &HashMap<String, NutRecord>, nut: &str) -> Option<String> {
        let mut current = nuts.get(nut)?;
        let mut guard = 0usize;
        while let Some(prev) = current.previous.as_deref() {
            match nuts.get(prev) {
                Some(rec) => current = rec,
                None => break,
            }
            // A cycle would mean corrupted data; stop rather than spin.
            guard += 1;
            if guard > 1024 {
                break;
            }
        }
        Some(current.nut.clone())
    }
}

impl IdentityStore for MemoryStore {
    fn check_identity_key(&self, idk: &str) -> StoreResult<IdentityStatus> {
        Ok(match self.identities.get(idk) {
            Some(rec) if rec.disabled => IdentityStatus::Locked,
            Some(_) => IdentityStatus::Active,
            None => IdentityStatus::Unknown,
        })
    }

    fn create_identity(&self, idk: &str, suk: &str, vuk: &str) -> StoreResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.identities.entry(idk.to_string()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateIdentity),
            Entry::Vacant(slot) => {
                slot.insert(IdentityRecord {
                    idk: idk.to_string(),
                    suk: suk.to_string(),
                    vuk: vuk.to_string(),
                    disabled: false,
                });
                Ok(())
            }
        }
    }

    fn get_suk(&self, idk: &str) -> StoreResult<Option<String>> {
        Ok(self.identities.get(idk).map(|rec| rec.suk.clone()))
    }

    fn get_vuk(&self, idk: &str) -> StoreResult<Option<String>> {
        Ok(self.identities.get(idk).map(|rec| rec.vuk.clone()))
    }

    fn lock_identity_key(&self, idk: &str) -> StoreResult<()> {
        match self.identities.get_mut(idk) {
            Some(mut rec) => {
                rec.disabled = true;
                Ok(())
            }
            None => Err(StoreError::UnknownIdentity),
        }
    }

    fn unlock_identity_key(&self, idk: &str) -> StoreResult<()> {
        match self.identities.get_mut(idk) {
            Some(mut rec) => {
                rec.disabled = false;
                Ok(())
            }
            None => Err(StoreError::UnknownIdentity),
        }
    }

    fn update_identity_key(
        &self,
        previous: &str,
        next: &str,
        suk: &str,
        vuk: &str,
    ) -> StoreResult<()> {
        if self.identities.contains_key(next) {
            return Err(StoreError::DuplicateIdentity);
        }
        let (_, _old) = self
            .identities
            .remove(previous)
            .ok_or(StoreError::UnknownIdentity)?;
        self.identities.insert(
            next.to_string(),
            IdentityRecord {
                idk: next.to_string(),
                suk: suk.to_string(),
                vuk: vuk.to_string(),
                disabled: false,
            },
        );
        Ok(())
    }
}

impl NonceStore for MemoryStore {
    fn store_nonce(&self, record: &NutRecord) -> StoreResult<()> {
        let mut nuts = self.nuts.lock();
        if let Some(previous) = record.previous.as_deref() {
            match nuts.get_mut(previous) {
                Some(prev) if prev.superseded => return Err(StoreError::NonceConflict),
                Some(prev) => prev.superseded = true,
                None => return Err(StoreError::NonceConflict),
            }
        }
        nuts.insert(record.nut.clone(), record.clone());
        Ok(())
    }

    fn get_nut_details(&self, nut: &str) -> StoreResult<Option<NutRecord>> {
        Ok(self.nuts.lock().get(nut).cloned())
    }

    fn get_session_nonce(&self, session: &str) -> StoreResult<Option<String>> {
        let nuts = self.nuts.lock();
        Ok(nuts
            .values()
            .filter(|rec| rec.session.as_deref() == Some(session) && !rec.superseded)
            .max_by_key(|rec| rec.created)
            .map(|rec| rec.nut.clone()))
    }

    fn log_session_in(&self, nut: &str) -> StoreResult<()> {
        let mut nuts = self.nuts.lock();
        let head = Self::chain_head(&nuts, nut)
            .ok_or_else(|| StoreError::UnknownSession(nut.to_string()))?;
        let rec = nuts.get_mut(&head).expect("head exists");
        rec.verified = true;
        rec.kill_session = false;
        Ok(())
    }

    fn end_session(&self, nut: &str) -> StoreResult<()> {
        let mut nuts = self.nuts.lock();
        let head = Self::chain_head(&nuts, nut)
            .ok_or_else(|| StoreError::UnknownSession(nut.to_string()))?;
        let rec = nuts.get_mut(&head).expect("head exists");
        rec.verified = false;
        rec.kill_session = true;
        Ok(())
    }

    fn session_authenticated(&self, nut: &str) -> StoreResult<bool> {
        let nuts = self.nuts.lock();
        Ok(match Self::chain_head(&nuts, nut) {
            Some(head) => {
                let rec = &nuts[&head];
                rec.verified && !rec.kill_session
            }
            None => false,
        })
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self) -> StoreResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        self.sessions
            .lock()
            .insert(id.clone(), SessionRecord::default());
        Ok(id)
    }

    fn session_exists(&self, session: &str) -> StoreResult<bool> {
        Ok(self.sessions.lock().contains_key(session))
    }

    fn get(&self, session: &str, key: &str) -> StoreResult<Option<String>> {
        let sessions = self.sessions.lock();
        let rec = sessions
            .get(session)
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        Ok(rec.values.get(key).cloned())
    }

    fn set(&self, session: &str, key: &str, value: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.lock();
        let rec = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        rec.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn append_nonce(
        &self,
        session: &str,
        expected_tail: Option<&str>,
        nut: &str,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.lock();
        let rec = sessions
            .get_mut(session)
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        let tail = rec.chain.last().map(String::as_str);
        if tail != expected_tail {
            return Err(StoreError::NonceConflict);
        }
        rec.chain.push(nut.to_string());
        Ok(())
    }

    fn nonce_chain(&self, session: &str) -> StoreResult<Vec<String>> {
        let sessions = self.sessions.lock();
        let rec = sessions
            .get(session)
            .ok_or_else(|| StoreError::UnknownSession(session.to_string()))?;
        Ok(rec.chain.clone())
    }
}
