//! Session lifecycle service.
//!
//! Stateless over a [`SessionRepository`]; all concurrency safety comes
//! from the repository's optimistic locking on `version`. Cancellation
//! follows Rust async semantics: dropping a call future abandons the
//! operation at its next await point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cluster::shard_map::hash_key;
use crate::domain::{
    Session, SessionFilter, SessionPage, SessionSort, new_session_id, token, validate_session_id,
};
use crate::error::{Error, Result};
use crate::storage::SessionRepository;
use crate::utils::now_ms;

/// Tunables for the session service.
#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Applied when a create request carries no TTL.
    pub default_ttl: Duration,
    /// Maximum live sessions per user.
    pub max_sessions_per_user: u64,
    /// Refuse revoke-by-user beyond this many sessions.
    pub revoke_by_user_cap: u64,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(24 * 3600),
            max_sessions_per_user: 50,
            revoke_by_user_cap: 1000,
        }
    }
}

/// Inputs for session creation. `session_id` and `token` are normally
/// generated server-side; compatibility protocols may supply their own.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub user_id: String,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub device_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub ttl: Option<Duration>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_by_key: Option<String>,
}

/// Result of a successful create: the only time the plaintext token is
/// ever visible.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session: Session,
    pub token: String,
}

/// Fields a caller may change on an existing session.
#[derive(Debug, Clone, Default)]
pub struct UpdateSession {
    /// Present to reject: the user id is immutable after creation.
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    /// Full replacement of the metadata map when present.
    pub metadata: Option<HashMap<String, String>>,
    pub ttl: Option<Duration>,
}

pub struct SessionService {
    repo: Arc<dyn SessionRepository>,
    config: SessionServiceConfig,
}

impl SessionService {
    pub fn new(repo: Arc<dyn SessionRepository>, config: SessionServiceConfig) -> Self {
        Self { repo, config }
    }

    /// Create a session, generating id and token unless provided.
    pub async fn create(&self, req: CreateSession) -> Result<CreatedSession> {
        if req.user_id.is_empty() {
            return Err(Error::MissingArgument("user_id"));
        }

        let id = match req.session_id {
            Some(id) => {
                validate_session_id(&id)?;
                id
            }
            None => new_session_id(),
        };

        let (plaintext, token_hash) = match req.token {
            Some(t) => {
                token::validate_format(&t)
                    .map_err(|_| Error::InvalidArgument("malformed client-provided token".into()))?;
                let hash = token::compute_hash(&t);
                (t, hash)
            }
            None => token::generate(),
        };

        let active = self.repo.count_active_by_user(&req.user_id).await?;
        if active >= self.config.max_sessions_per_user {
            return Err(Error::QuotaExceeded(format!(
                "user '{}' has {active} active sessions (limit {})",
                req.user_id, self.config.max_sessions_per_user
            )));
        }

        let ttl = match req.ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => self.config.default_ttl,
        };

        let now = now_ms();
        let session = Session {
            shard_id: hash_key(&id),
            id,
            user_id: req.user_id,
            device_id: req.device_id,
            token_hash,
            created_at: now,
            last_active_at: now,
            expires_at: now + ttl.as_millis() as i64,
            created_by_key: req.created_by_key,
            client_ip: req.client_ip.clone(),
            last_client_ip: req.client_ip,
            user_agent: req.user_agent.clone(),
            last_user_agent: req.user_agent,
            metadata: req.metadata,
            version: 1,
            deleted: false,
        };

        self.repo.create(&session).await?;
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            shard = session.shard_id,
            "session created"
        );

        Ok(CreatedSession {
            session,
            token: plaintext,
        })
    }

    /// Fetch a session, applying lazy expiration.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let Some(session) = self.repo.get(session_id).await? else {
            return Err(Error::SessionNotFound);
        };
        if session.deleted {
            return Err(Error::SessionNotFound);
        }
        if now_ms() >= session.expires_at {
            // Lazy expiration: drop on access, best effort.
            if let Err(e) = self.repo.delete(session_id).await {
                debug!(session_id, error = %e, "failed to reap expired session");
            }
            return Err(Error::SessionExpired);
        }
        Ok(session)
    }

    /// Apply caller-visible mutations under optimistic lock.
    ///
    /// A `VersionConflict` from the repository is surfaced as-is; callers
    /// decide whether to re-read and retry.
    pub async fn update(&self, session_id: &str, update: UpdateSession) -> Result<Session> {
        if update.user_id.is_some() {
            return Err(Error::InvalidArgument(
                "user_id is immutable after creation".into(),
            ));
        }

        let mut session = self.get(session_id).await?;
        let read_version = session.version;

        if let Some(device_id) = update.device_id {
            session.device_id = Some(device_id);
        }
        if let Some(metadata) = update.metadata {
            session.metadata = metadata;
        }
        if let Some(ttl) = update.ttl {
            if ttl.is_zero() {
                return Err(Error::InvalidArgument("ttl must be positive".into()));
            }
            session.expires_at = now_ms() + ttl.as_millis() as i64;
        }
        session.version += 1;

        self.repo.update(&session, read_version).await?;
        Ok(session)
    }

    /// Extend a session's lifetime and mark it active.
    pub async fn renew(&self, session_id: &str, ttl: Duration) -> Result<Session> {
        if ttl.is_zero() {
            return Err(Error::InvalidArgument("ttl must be positive".into()));
        }

        let mut session = self.get(session_id).await?;
        let read_version = session.version;

        let now = now_ms();
        session.expires_at = now + ttl.as_millis() as i64;
        session.last_active_at = now;
        session.version += 1;

        self.repo.update(&session, read_version).await?;
        debug!(session_id, expires_at = session.expires_at, "session renewed");
        Ok(session)
    }

    /// Update last-active metadata only. Retries exactly once on a
    /// version conflict; a second failure is surfaced as a storage error.
    pub async fn touch(&self, session_id: &str, client_ip: Option<&str>) -> Result<Session> {
        match self.touch_once(session_id, client_ip).await {
            Err(Error::VersionConflict { .. }) => {
                self.touch_once(session_id, client_ip)
                    .await
                    .map_err(|e| match e {
                        Error::VersionConflict { expected, stored } => Error::storage(
                            anyhow::anyhow!(
                                "touch retry lost again (expected v{expected}, stored v{stored})"
                            ),
                        ),
                        other => other,
                    })
            }
            other => other,
        }
    }

    async fn touch_once(&self, session_id: &str, client_ip: Option<&str>) -> Result<Session> {
        let mut session = self.get(session_id).await?;
        let read_version = session.version;

        session.last_active_at = now_ms();
        if let Some(ip) = client_ip {
            session.last_client_ip = Some(ip.to_owned());
        }
        session.version += 1;

        self.repo.update(&session, read_version).await?;
        Ok(session)
    }

    /// Destroy a session. Idempotent: revoking a missing session succeeds.
    pub async fn revoke(&self, session_id: &str) -> Result<()> {
        let existed = self.repo.delete(session_id).await?;
        if existed {
            info!(session_id, "session revoked");
        }
        Ok(())
    }

    /// Destroy every session of a user. Returns the count removed.
    pub async fn revoke_by_user(&self, user_id: &str) -> Result<u64> {
        if user_id.is_empty() {
            return Err(Error::MissingArgument("user_id"));
        }
        let sessions = self.repo.list_by_user(user_id).await?;
        if sessions.len() as u64 > self.config.revoke_by_user_cap {
            return Err(Error::QuotaExceeded(format!(
                "user '{user_id}' has {} sessions, above the bulk-revoke cap of {}",
                sessions.len(),
                self.config.revoke_by_user_cap
            )));
        }
        let deleted = self.repo.delete_by_user(user_id).await?;
        info!(user_id, deleted, "bulk session revoke");
        Ok(deleted)
    }

    /// Paged listing; hides expired and soft-deleted sessions.
    pub async fn list(
        &self,
        filter: SessionFilter,
        page: u32,
        page_size: u32,
    ) -> Result<SessionPage> {
        let page = page.max(1);
        let page_size = match page_size {
            0 => 20,
            n => n.min(100),
        };
        let offset = u64::from(page - 1) * u64::from(page_size);

        let (sessions, total) = self
            .repo
            .list(&filter, SessionSort::CreatedAtDesc, offset, page_size.into())
            .await?;

        Ok(SessionPage {
            sessions,
            page,
            page_size,
            total,
        })
    }

    /// Sweep expired sessions out of storage. Returns the count removed.
    pub async fn gc(&self) -> Result<u64> {
        let removed = self.repo.delete_expired(now_ms()).await?;
        if removed > 0 {
            info!(removed, "session gc sweep");
        } else {
            debug!("session gc sweep found nothing to remove");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service() -> SessionService {
        SessionService::new(Arc::new(MemoryStore::new()), SessionServiceConfig::default())
    }

    fn service_with(config: SessionServiceConfig) -> SessionService {
        SessionService::new(Arc::new(MemoryStore::new()), config)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::from_secs(3600)),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(created.token.starts_with("tmtk_"));
        assert_eq!(created.session.version, 1);
        assert!(created.session.expires_at > created.session.created_at);

        let fetched = svc.get(&created.session.id).await.unwrap();
        assert_eq!(fetched, created.session);
    }

    #[tokio::test]
    async fn create_requires_user_id() {
        let svc = service();
        let err = svc.create(CreateSession::default()).await.unwrap_err();
        assert_eq!(err.code(), "MISSING_ARGUMENT");
    }

    #[tokio::test]
    async fn create_rejects_malformed_client_token() {
        let svc = service();
        let err = svc
            .create(CreateSession {
                user_id: "u1".into(),
                token: Some("not-a-token".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn create_with_id_surfaces_conflict() {
        let svc = service();
        let id = new_session_id();
        svc.create(CreateSession {
            user_id: "u1".into(),
            session_id: Some(id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = svc
            .create(CreateSession {
                user_id: "u2".into(),
                session_id: Some(id),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SESSION_CONFLICT");
    }

    #[tokio::test]
    async fn create_enforces_per_user_quota() {
        let svc = service_with(SessionServiceConfig {
            max_sessions_per_user: 2,
            ..Default::default()
        });
        for _ in 0..2 {
            svc.create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let err = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn zero_ttl_defaults_to_configured_ttl() {
        let svc = service_with(SessionServiceConfig {
            default_ttl: Duration::from_secs(100),
            ..Default::default()
        });
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::ZERO),
                ..Default::default()
            })
            .await
            .unwrap();
        let lifetime = created.session.expires_at - created.session.created_at;
        assert_eq!(lifetime, 100_000);
    }

    #[tokio::test]
    async fn update_rejects_user_id_change() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let err = svc
            .update(
                &created.session.id,
                UpdateSession {
                    user_id: Some("u2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn mutations_increment_version_by_one() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = created.session.id.clone();

        let updated = svc
            .update(
                &id,
                UpdateSession {
                    device_id: Some("laptop".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let renewed = svc.renew(&id, Duration::from_secs(60)).await.unwrap();
        assert_eq!(renewed.version, 3);

        let touched = svc.touch(&id, Some("10.0.0.9")).await.unwrap();
        assert_eq!(touched.version, 4);
        assert_eq!(touched.last_client_ip.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn renew_rejects_zero_ttl() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = svc
            .renew(&created.session.id, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        svc.revoke(&created.session.id).await.unwrap();
        svc.revoke(&created.session.id).await.unwrap();
        svc.revoke("tmss-01H455VB4PEX5VSKNK084SN02Q").await.unwrap();
    }

    #[tokio::test]
    async fn revoke_by_user_deletes_and_counts() {
        let svc = service();
        for _ in 0..3 {
            svc.create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        svc.create(CreateSession {
            user_id: "u2".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_eq!(svc.revoke_by_user("u1").await.unwrap(), 3);
        assert_eq!(svc.revoke_by_user("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn revoke_by_user_honors_cap() {
        let svc = service_with(SessionServiceConfig {
            revoke_by_user_cap: 2,
            ..Default::default()
        });
        for _ in 0..3 {
            svc.create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let err = svc.revoke_by_user("u1").await.unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[tokio::test]
    async fn expired_sessions_are_reaped_on_get() {
        let svc = service();
        let created = svc
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::from_millis(1)),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = svc.get(&created.session.id).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_EXPIRED");

        // Second access sees the reaped row as gone entirely.
        let err = svc.get(&created.session.id).await.unwrap_err();
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn list_defaults_and_caps_paging() {
        let svc = service();
        for _ in 0..5 {
            svc.create(CreateSession {
                user_id: "u1".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        let page = svc.list(SessionFilter::default(), 0, 0).await.unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.page_size, 20);
        assert_eq!(page.total, 5);

        let page = svc.list(SessionFilter::default(), 1, 500).await.unwrap();
        assert_eq!(page.page_size, 100);
    }

    #[tokio::test]
    async fn gc_reports_removed_count() {
        let svc = service();
        svc.create(CreateSession {
            user_id: "u1".into(),
            ttl: Some(Duration::from_millis(1)),
            ..Default::default()
        })
        .await
        .unwrap();
        svc.create(CreateSession {
            user_id: "u1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(svc.gc().await.unwrap(), 1);
        assert_eq!(svc.gc().await.unwrap(), 0);
    }
}
