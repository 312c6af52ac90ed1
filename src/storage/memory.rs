//! In-memory storage backed by concurrent maps.
//!
//! `MemoryStore` implements every session-facing storage trait, including
//! real optimistic locking: updates race on the per-entry lock that
//! DashMap already provides, so `update` is an atomic compare-on-version.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{ApiKey, Session, SessionFilter, SessionSort};
use crate::error::{Error, Result};
use crate::storage::{ApiKeyRepository, SessionRepository, StorageEngine, TokenRepository};
use crate::utils::now_ms;

/// Session store: id → session, with a token-hash index for the
/// validation hot path.
#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<String, Session>,
    by_token_hash: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn matches(filter: &SessionFilter, session: &Session, now: i64) -> bool {
        if !filter.include_dead && !session.is_live(now) {
            return false;
        }
        if let Some(user_id) = &filter.user_id
            && &session.user_id != user_id
        {
            return false;
        }
        if let Some(device_id) = &filter.device_id
            && session.device_id.as_ref() != Some(device_id)
        {
            return false;
        }
        true
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn create(&self, session: &Session) -> Result<()> {
        // Entry API keeps the existence check and insert atomic.
        match self.sessions.entry(session.id.clone()) {
            dashmap::Entry::Occupied(_) => Err(Error::SessionConflict(session.id.clone())),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                self.by_token_hash
                    .insert(session.token_hash.clone(), session.id.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn update(&self, session: &Session, expected_version: u64) -> Result<()> {
        let Some(mut entry) = self.sessions.get_mut(&session.id) else {
            return Err(Error::SessionNotFound);
        };
        if entry.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                stored: entry.version,
            });
        }
        *entry = session.clone();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.by_token_hash.remove(&session.token_hash);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Session>, u64)> {
        let now = now_ms();
        let mut matched: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| Self::matches(filter, entry.value(), now))
            .map(|entry| entry.value().clone())
            .collect();

        match sort {
            SessionSort::CreatedAtDesc => {
                matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)))
            }
            SessionSort::CreatedAtAsc => {
                matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            }
            SessionSort::LastActiveDesc => matched
                .sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at).then(b.id.cmp(&a.id))),
        }

        let total = matched.len() as u64;
        let page = matched
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok((page, total))
    }

    async fn count_active_by_user(&self, user_id: &str) -> Result<u64> {
        let now = now_ms();
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id && entry.is_live(now))
            .count() as u64)
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_by_user(&self, user_id: &str) -> Result<u64> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.id.clone())
            .collect();
        let mut deleted = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.by_token_hash.remove(&session.token_hash);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_expired(&self, now_ms: i64) -> Result<u64> {
        let ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.expires_at <= now_ms)
            .map(|entry| entry.id.clone())
            .collect();
        let mut deleted = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                self.by_token_hash.remove(&session.token_hash);
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl TokenRepository for MemoryStore {
    async fn get_session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>> {
        let Some(id) = self.by_token_hash.get(token_hash) else {
            return Ok(None);
        };
        Ok(self.sessions.get(id.value()).map(|entry| entry.value().clone()))
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let Some(mut entry) = self.sessions.get_mut(&session.id) else {
            return Err(Error::SessionNotFound);
        };
        *entry = session.clone();
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for MemoryStore {
    async fn scan(&self, visit: &mut (dyn for<'a> FnMut(&'a Session) -> bool + Send)) -> Result<()> {
        let now = now_ms();
        for entry in self.sessions.iter() {
            if !entry.is_live(now) {
                continue;
            }
            let session = entry.value().clone();
            drop(entry);
            if !visit(&session) {
                break;
            }
        }
        Ok(())
    }

    async fn create(&self, session: &Session) -> Result<()> {
        // Migration applies are idempotent: re-delivery overwrites.
        self.sessions.insert(session.id.clone(), session.clone());
        self.by_token_hash
            .insert(session.token_hash.clone(), session.id.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        SessionRepository::delete(self, id).await
    }
}

/// API key store.
#[derive(Default)]
pub struct MemoryApiKeyStore {
    keys: DashMap<String, ApiKey>,
}

impl MemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyStore {
    async fn get(&self, id: &str) -> Result<Option<ApiKey>> {
        Ok(self.keys.get(id).map(|entry| entry.value().clone()))
    }

    async fn create(&self, key: &ApiKey) -> Result<()> {
        match self.keys.entry(key.id.clone()) {
            dashmap::Entry::Occupied(_) => Err(Error::InvalidArgument(format!(
                "api key '{}' already exists",
                key.id
            ))),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(key.clone());
                Ok(())
            }
        }
    }

    async fn update(&self, key: &ApiKey) -> Result<()> {
        let Some(mut entry) = self.keys.get_mut(&key.id) else {
            return Err(Error::ApiKeyNotFound);
        };
        *entry = key.clone();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.keys.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self.keys.iter().map(|entry| entry.value().clone()).collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(keys)
    }
}
