//! API key entity.

use serde::{Deserialize, Serialize};

/// Role attached to an API key.
///
/// Arbitrary roles are accepted on the wire; anything outside the known
/// set carries no permissions at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ApiKeyRole {
    Admin,
    Issuer,
    Validator,
    Metrics,
    Other(String),
}

impl ApiKeyRole {
    pub fn as_str(&self) -> &str {
        match self {
            ApiKeyRole::Admin => "admin",
            ApiKeyRole::Issuer => "issuer",
            ApiKeyRole::Validator => "validator",
            ApiKeyRole::Metrics => "metrics",
            ApiKeyRole::Other(role) => role,
        }
    }
}

impl From<String> for ApiKeyRole {
    fn from(value: String) -> Self {
        match value.as_str() {
            "admin" => ApiKeyRole::Admin,
            "issuer" => ApiKeyRole::Issuer,
            "validator" => ApiKeyRole::Validator,
            "metrics" => ApiKeyRole::Metrics,
            _ => ApiKeyRole::Other(value),
        }
    }
}

impl From<ApiKeyRole> for String {
    fn from(value: ApiKeyRole) -> Self {
        value.as_str().to_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    Active,
    Disabled,
}

/// An API key record as held by the key repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub role: ApiKeyRole,
    /// Argon2id PHC string for the current secret.
    pub secret_hash: String,
    /// Previous secret hash, honored during the rotation grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_secret_hash: Option<String>,
    /// Unix milliseconds of the last rotation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<i64>,
    pub status: ApiKeyStatus,
    /// Requests per second; zero means unlimited.
    #[serde(default)]
    pub rate_limit: u32,
    /// Per-key IP allowlist entries (plain IPs or CIDR blocks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_allowlist: Vec<String>,
    /// Unix milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl ApiKey {
    pub fn is_active(&self) -> bool {
        self.status == ApiKeyStatus::Active
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }

    /// Whether the pre-rotation hash is still honored at `now_ms`.
    pub fn within_grace_period(&self, now_ms: i64, grace_ms: i64) -> bool {
        match (self.old_secret_hash.as_ref(), self.rotated_at) {
            (Some(_), Some(rotated_at)) => now_ms - rotated_at < grace_ms,
            _ => false,
        }
    }
}
