//! API-key authentication service.
//!
//! Validation is ordered cheap-to-expensive: cache hit first, then the
//! storage row's status/expiry/allowlist gates, and only then the
//! Argon2id verification. Rotated keys keep their previous hash alive
//! for a grace period so in-flight clients survive a rotation.

mod allowlist;
mod cache;
mod limiter;
mod permissions;
pub mod secret;

pub use allowlist::ip_allowed;
pub use cache::ApiKeyCache;
pub use limiter::RateLimiterRegistry;
pub use permissions::{Permission, role_grants};

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::domain::{ApiKey, ApiKeyRole, ApiKeyStatus};
use crate::error::{Error, Result};
use crate::storage::ApiKeyRepository;
use crate::utils::now_ms;

/// Prefix for API key identifiers.
pub const API_KEY_ID_PREFIX: &str = "tmak-";

#[derive(Debug, Clone)]
pub struct AuthServiceConfig {
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// How long the pre-rotation secret hash stays valid.
    pub rotation_grace: Duration,
    /// Process-level allowlist applied to every key.
    pub global_ip_allowlist: Vec<String>,
}

impl Default for AuthServiceConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl: Duration::from_secs(60),
            rotation_grace: Duration::from_secs(24 * 3600),
            global_ip_allowlist: vec![],
        }
    }
}

/// Inputs for creating a new API key.
#[derive(Debug, Clone)]
pub struct CreateApiKey {
    pub name: String,
    pub description: String,
    pub role: ApiKeyRole,
    pub rate_limit: u32,
    pub ip_allowlist: Vec<String>,
    pub expires_at: Option<i64>,
}

pub struct AuthService {
    repo: Arc<dyn ApiKeyRepository>,
    cache: ApiKeyCache,
    limiters: RateLimiterRegistry,
    config: AuthServiceConfig,
}

impl AuthService {
    pub fn new(repo: Arc<dyn ApiKeyRepository>, config: AuthServiceConfig) -> Self {
        Self {
            repo,
            cache: ApiKeyCache::new(config.cache_capacity, config.cache_ttl),
            limiters: RateLimiterRegistry::new(),
            config,
        }
    }

    /// Authenticate a key id + secret pair from `client_ip`.
    pub async fn validate_api_key(
        &self,
        key_id: &str,
        key_secret: &str,
        client_ip: Option<&str>,
    ) -> Result<ApiKey> {
        if key_id.is_empty() {
            return Err(Error::MissingArgument("key_id"));
        }
        if key_secret.is_empty() {
            return Err(Error::MissingArgument("key_secret"));
        }

        let now = now_ms();
        let grace_ms = self.config.rotation_grace.as_millis() as i64;

        // Cache fast path. A cache hit whose secret does not match falls
        // through to storage: the key may have been rotated since it was
        // cached.
        if let Some(cached) = self.cache.get(key_id) {
            if self.secret_matches(&cached, key_secret, now, grace_ms) {
                self.gate(&cached, now, client_ip)?;
                let refreshed = self.touch_last_used(cached, now).await;
                return Ok(refreshed);
            }
            debug!(key_id, "cached secret mismatch, re-reading storage");
        }

        let Some(key) = self.repo.get(key_id).await? else {
            return Err(Error::ApiKeyNotFound);
        };

        self.gate(&key, now, client_ip)?;

        if !self.secret_matches(&key, key_secret, now, grace_ms) {
            return Err(Error::ApiKeyInvalid);
        }

        let refreshed = self.touch_last_used(key, now).await;
        self.cache.set(&refreshed);
        Ok(refreshed)
    }

    /// Status, expiry, and allowlist gates, in that order.
    fn gate(&self, key: &ApiKey, now: i64, client_ip: Option<&str>) -> Result<()> {
        if !key.is_active() {
            return Err(Error::ApiKeyDisabled);
        }
        if key.is_expired(now) {
            return Err(Error::ApiKeyInvalid);
        }
        if let Some(ip) = client_ip
            && !ip_allowed(&self.config.global_ip_allowlist, &key.ip_allowlist, ip)
        {
            return Err(Error::IpNotAllowed);
        }
        Ok(())
    }

    fn secret_matches(&self, key: &ApiKey, secret: &str, now: i64, grace_ms: i64) -> bool {
        if secret::verify_secret(secret, &key.secret_hash) {
            return true;
        }
        if key.within_grace_period(now, grace_ms)
            && let Some(old_hash) = &key.old_secret_hash
        {
            return secret::verify_secret(secret, old_hash);
        }
        false
    }

    /// Best-effort last-used bump; a write failure never fails auth.
    async fn touch_last_used(&self, mut key: ApiKey, now: i64) -> ApiKey {
        key.last_used_at = Some(now);
        if let Err(e) = self.repo.update(&key).await {
            warn!(key_id = %key.id, error = %e, "failed to persist last_used_at");
        }
        key
    }

    /// Table lookup of `perm` for the key's role.
    pub fn check_permission(&self, key: &ApiKey, perm: Permission) -> Result<()> {
        if role_grants(&key.role, perm) {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "role '{}' lacks {}",
                key.role.as_str(),
                perm.as_str()
            )))
        }
    }

    /// Non-blocking per-key rate limit check.
    pub fn check_rate_limit(&self, key_id: &str, rate_limit: u32) -> Result<()> {
        self.limiters.check(key_id, rate_limit)
    }

    /// Create a key, returning the record and the plaintext secret. The
    /// secret is visible exactly once, here.
    pub async fn create_api_key(&self, req: CreateApiKey) -> Result<(ApiKey, String)> {
        if req.name.is_empty() {
            return Err(Error::MissingArgument("name"));
        }
        let plaintext = generate_secret();
        let key = ApiKey {
            id: format!("{API_KEY_ID_PREFIX}{}", Ulid::new()),
            name: req.name,
            description: req.description,
            role: req.role,
            secret_hash: secret::hash_secret(&plaintext)?,
            old_secret_hash: None,
            rotated_at: None,
            status: ApiKeyStatus::Active,
            rate_limit: req.rate_limit,
            ip_allowlist: req.ip_allowlist,
            created_at: now_ms(),
            last_used_at: None,
            expires_at: req.expires_at,
        };
        self.repo.create(&key).await?;
        info!(key_id = %key.id, role = key.role.as_str(), "api key created");
        Ok((key, plaintext))
    }

    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        self.repo.list().await
    }

    pub async fn update_api_key_status(&self, key_id: &str, status: ApiKeyStatus) -> Result<ApiKey> {
        let Some(mut key) = self.repo.get(key_id).await? else {
            return Err(Error::ApiKeyNotFound);
        };
        key.status = status;
        self.repo.update(&key).await?;
        self.cache.delete(key_id);
        info!(key_id, status = ?status, "api key status updated");
        Ok(key)
    }

    /// Swap in a fresh secret, keeping the old hash for the grace period.
    pub async fn rotate_api_key(&self, key_id: &str) -> Result<(ApiKey, String)> {
        let Some(mut key) = self.repo.get(key_id).await? else {
            return Err(Error::ApiKeyNotFound);
        };
        let plaintext = generate_secret();
        key.old_secret_hash = Some(std::mem::replace(
            &mut key.secret_hash,
            secret::hash_secret(&plaintext)?,
        ));
        key.rotated_at = Some(now_ms());
        self.repo.update(&key).await?;
        self.cache.delete(key_id);
        info!(key_id, "api key rotated");
        Ok((key, plaintext))
    }

    pub fn cache(&self) -> &ApiKeyCache {
        &self.cache
    }
}

/// 32 bytes of randomness as unpadded base64url (43 chars).
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
