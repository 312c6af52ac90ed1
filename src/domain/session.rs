//! Session entity and listing filters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

/// Prefix for all session identifiers.
pub const SESSION_ID_PREFIX: &str = "tmss-";

/// A user session bound to exactly one bearer token.
///
/// The token plaintext is never stored; only its hash. `version` increases
/// by one on every mutating write and backs the optimistic-locking scheme
/// in the session repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// `tmss-` + 26-char ULID.
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// `tmth_` + 64 lowercase hex chars; immutable after creation.
    pub token_hash: String,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub last_active_at: i64,
    /// Unix milliseconds; always strictly greater than `created_at`.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    /// Shard this session belongs to, derived from the session id.
    pub shard_id: u32,
}

impl Session {
    /// A session is live when it has not expired and is not soft-deleted.
    pub fn is_live(&self, now_ms: i64) -> bool {
        !self.deleted && now_ms < self.expires_at
    }

    /// Remaining lifetime in milliseconds (zero once expired).
    pub fn remaining_ttl_ms(&self, now_ms: i64) -> i64 {
        (self.expires_at - now_ms).max(0)
    }
}

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    format!("{SESSION_ID_PREFIX}{}", Ulid::new())
}

/// Validate an externally supplied session id.
///
/// Compatibility protocols may hand us their own ids; those still have to
/// match the `tmss-<ULID>` shape so shard derivation stays stable.
pub fn validate_session_id(id: &str) -> Result<()> {
    let Some(suffix) = id.strip_prefix(SESSION_ID_PREFIX) else {
        return Err(Error::InvalidArgument(format!(
            "session id must start with '{SESSION_ID_PREFIX}'"
        )));
    };
    if suffix.len() != 26 || Ulid::from_string(suffix).is_err() {
        return Err(Error::InvalidArgument(
            "session id suffix must be a 26-char ULID".into(),
        ));
    }
    Ok(())
}

/// Filter for session listings. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// When false (default), expired and soft-deleted sessions are hidden.
    pub include_dead: bool,
}

/// Sort order for session listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionSort {
    /// Newest first (default).
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
    LastActiveDesc,
}

/// One page of a session listing.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}
