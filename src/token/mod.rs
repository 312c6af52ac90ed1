//! Token validation service and replay protection.

mod nonce;

pub use nonce::NonceCache;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{Session, token};
use crate::error::{Error, Result};
use crate::storage::TokenRepository;
use crate::utils::now_ms;

/// Tunables for token validation and the nonce cache.
#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    /// Maximum tolerated distance between a request timestamp and the
    /// server clock.
    pub nonce_window: Duration,
    pub nonce_capacity: usize,
    pub nonce_ttl: Duration,
}

impl Default for TokenServiceConfig {
    fn default() -> Self {
        Self {
            nonce_window: Duration::from_secs(30),
            nonce_capacity: 100_000,
            nonce_ttl: Duration::from_secs(60),
        }
    }
}

pub struct TokenService {
    repo: Arc<dyn TokenRepository>,
    nonces: NonceCache,
    window_ms: i64,
}

impl TokenService {
    pub fn new(repo: Arc<dyn TokenRepository>, config: TokenServiceConfig) -> Self {
        Self {
            repo,
            nonces: NonceCache::new(config.nonce_capacity, config.nonce_ttl),
            window_ms: config.nonce_window.as_millis() as i64,
        }
    }

    /// Generate a fresh token, returning `(plaintext, hash)`.
    pub fn generate_token(&self) -> (String, String) {
        token::generate()
    }

    pub fn compute_token_hash(&self, plaintext: &str) -> String {
        token::compute_hash(plaintext)
    }

    /// Constant-time check of a plaintext token against a stored hash.
    pub fn verify_token_hash(&self, plaintext: &str, expected_hash: &str) -> bool {
        token::verify_hash(plaintext, expected_hash)
    }

    /// Resolve a plaintext token to its live session.
    ///
    /// With `touch` set, last-access fields are updated and the version
    /// bumped; a failure there is logged and swallowed — the validation
    /// result stands either way.
    pub async fn validate(
        &self,
        plaintext: &str,
        touch: bool,
        client_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<Session> {
        token::validate_format(plaintext)?;
        let hash = token::compute_hash(plaintext);

        let Some(mut session) = self.repo.get_session_by_token_hash(&hash).await? else {
            return Err(Error::TokenInvalid);
        };
        if session.deleted {
            return Err(Error::TokenInvalid);
        }
        let now = now_ms();
        if now >= session.expires_at {
            return Err(Error::SessionExpired);
        }

        if touch {
            session.last_active_at = now;
            if let Some(ip) = client_ip {
                session.last_client_ip = Some(ip.to_owned());
            }
            if let Some(ua) = user_agent {
                session.last_user_agent = Some(ua.to_owned());
            }
            session.version += 1;
            if let Err(e) = self.repo.update_session(&session).await {
                warn!(session_id = %session.id, error = %e, "token validate: touch write failed");
                // Hand back the pre-touch view so callers never observe a
                // version the store does not have.
                session.version -= 1;
            }
        }

        debug!(session_id = %session.id, touch, "token validated");
        Ok(session)
    }

    /// Replay defense: timestamp skew check, then atomic nonce insert.
    ///
    /// The insert is the single atomic step — there is no check-then-add
    /// window for two racing requests to slip through.
    pub fn check_nonce(&self, nonce: &str, timestamp_ms: i64) -> Result<()> {
        if nonce.is_empty() {
            return Err(Error::MissingArgument("nonce"));
        }
        if (now_ms() - timestamp_ms).abs() > self.window_ms {
            return Err(Error::TimestampSkew);
        }
        if !self.nonces.add_if_absent(nonce) {
            return Err(Error::NonceReplay);
        }
        Ok(())
    }

    /// Current number of live-or-unreclaimed nonces.
    pub fn nonce_cache_len(&self) -> usize {
        self.nonces.len()
    }

    pub fn clear_nonce_cache(&self) {
        self.nonces.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CreateSession, SessionService, SessionServiceConfig};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    fn setup() -> (SessionService, TokenService) {
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionService::new(store.clone(), SessionServiceConfig::default());
        let tokens = TokenService::new(store, TokenServiceConfig::default());
        (sessions, tokens)
    }

    #[tokio::test]
    async fn create_then_validate_returns_the_same_session() {
        let (sessions, tokens) = setup();
        let created = sessions
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::from_secs(3600)),
                ..Default::default()
            })
            .await
            .unwrap();

        let session = tokens
            .validate(&created.token, false, None, None)
            .await
            .unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.id, created.session.id);
    }

    #[tokio::test]
    async fn validate_rejects_malformed_unknown_and_expired() {
        let (sessions, tokens) = setup();

        let err = tokens.validate("garbage", false, None, None).await.unwrap_err();
        assert_eq!(err.code(), "TOKEN_MALFORMED");

        let (unknown, _) = token::generate();
        let err = tokens.validate(&unknown, false, None, None).await.unwrap_err();
        assert_eq!(err.code(), "TOKEN_INVALID");

        let created = sessions
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::from_millis(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = tokens
            .validate(&created.token, false, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");
    }

    #[tokio::test]
    async fn validate_with_touch_updates_last_access() {
        let (sessions, tokens) = setup();
        let created = sessions
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let touched = tokens
            .validate(&created.token, true, Some("10.1.1.1"), Some("cli/1.0"))
            .await
            .unwrap();
        assert_eq!(touched.version, 2);
        assert_eq!(touched.last_client_ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(touched.last_user_agent.as_deref(), Some("cli/1.0"));

        let stored = sessions.get(&created.session.id).await.unwrap();
        assert_eq!(stored.version, 2);
    }

    struct ReadOnlyRepo(Arc<MemoryStore>);

    #[async_trait]
    impl TokenRepository for ReadOnlyRepo {
        async fn get_session_by_token_hash(&self, hash: &str) -> crate::error::Result<Option<Session>> {
            self.0.get_session_by_token_hash(hash).await
        }
        async fn update_session(&self, _: &Session) -> crate::error::Result<()> {
            Err(Error::storage(anyhow::anyhow!("write path unavailable")))
        }
    }

    #[tokio::test]
    async fn touch_write_failure_does_not_invalidate_the_result() {
        let store = Arc::new(MemoryStore::new());
        let sessions = SessionService::new(store.clone(), SessionServiceConfig::default());
        let tokens = TokenService::new(
            Arc::new(ReadOnlyRepo(store)),
            TokenServiceConfig::default(),
        );

        let created = sessions
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let session = tokens
            .validate(&created.token, true, None, None)
            .await
            .unwrap();
        assert_eq!(session.user_id, "u1");
        // Version reflects what storage actually holds.
        assert_eq!(session.version, 1);
    }

    #[tokio::test]
    async fn nonce_replay_and_skew_scenarios() {
        let (_, tokens) = setup();
        let now = now_ms();

        tokens.check_nonce("n1", now).unwrap();
        let err = tokens.check_nonce("n1", now).unwrap_err();
        assert_eq!(err.code(), "NONCE_REPLAY");

        let err = tokens.check_nonce("n2", now - 60_000).unwrap_err();
        assert_eq!(err.code(), "TIMESTAMP_SKEW");

        tokens.check_nonce("n2", now).unwrap();
        assert_eq!(tokens.nonce_cache_len(), 2);

        tokens.clear_nonce_cache();
        assert_eq!(tokens.nonce_cache_len(), 0);
        tokens.check_nonce("n1", now).unwrap();
    }
}
