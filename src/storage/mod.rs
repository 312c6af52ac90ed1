//! Storage collaborator interfaces.
//!
//! The core never talks to a concrete engine directly; everything goes
//! through these traits. [`memory`] provides the in-process
//! implementation used by the single-node binary and the test suites. A
//! persistent engine plugs in by implementing the same contracts,
//! including the optimistic-locking semantics of
//! [`SessionRepository::update`].

mod memory;

pub use memory::{MemoryApiKeyStore, MemoryStore};

use async_trait::async_trait;

use crate::domain::{ApiKey, Session, SessionFilter, SessionSort};
use crate::error::Result;

/// Primary session store.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session. Fails with `SessionConflict` when the id is
    /// already taken.
    async fn create(&self, session: &Session) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Write a mutated session under optimistic lock: the write must fail
    /// with `VersionConflict` when the stored version differs from
    /// `expected_version`.
    async fn update(&self, session: &Session, expected_version: u64) -> Result<()>;

    /// Delete by id. Returns whether a row existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Filtered, sorted, offset/limit listing. Returns the page and the
    /// total match count.
    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<Session>, u64)>;

    /// Count of live sessions for a user (quota checks).
    async fn count_active_by_user(&self, user_id: &str) -> Result<u64>;

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<Session>>;

    /// Bulk delete of every session for a user. Uncapped: callers that
    /// need the revoke-by-user quota enforce it before calling.
    async fn delete_by_user(&self, user_id: &str) -> Result<u64>;

    /// Drop every session past its expiry. Returns the count removed.
    async fn delete_expired(&self, now_ms: i64) -> Result<u64>;
}

/// Token-hash lookup surface used on the validation hot path.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn get_session_by_token_hash(&self, token_hash: &str) -> Result<Option<Session>>;

    /// Unconditional write-back for touch updates. The caller has already
    /// bumped the version.
    async fn update_session(&self, session: &Session) -> Result<()>;
}

/// API key store.
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ApiKey>>;
    async fn create(&self, key: &ApiKey) -> Result<()>;
    async fn update(&self, key: &ApiKey) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<ApiKey>>;
}

/// Raw record surface the rebalance pipeline runs against.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Visit every live session. The callback returns `false` to stop
    /// the scan early.
    async fn scan(&self, visit: &mut (dyn for<'a> FnMut(&'a Session) -> bool + Send)) -> Result<()>;

    /// Insert a migrated session on the receiving side.
    async fn create(&self, session: &Session) -> Result<()>;

    /// Remove a session during source cleanup. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}
