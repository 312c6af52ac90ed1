//! End-to-end session and token flows against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokmesh::domain::{Session, SessionFilter, SessionSort};
use tokmesh::error::Error;
use tokmesh::session::{CreateSession, SessionService, SessionServiceConfig};
use tokmesh::storage::{MemoryStore, SessionRepository};
use tokmesh::token::{TokenService, TokenServiceConfig};
use tokmesh::utils::now_ms;

fn services() -> (Arc<MemoryStore>, SessionService, TokenService) {
    let store = Arc::new(MemoryStore::new());
    let sessions = SessionService::new(store.clone(), SessionServiceConfig::default());
    let tokens = TokenService::new(store.clone(), TokenServiceConfig::default());
    (store, sessions, tokens)
}

#[tokio::test]
async fn create_then_validate_round_trip() {
    let (_, sessions, tokens) = services();

    let created = sessions
        .create(CreateSession {
            user_id: "u1".into(),
            ttl: Some(Duration::from_secs(3600)),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(created.token.len(), 48);
    assert!(created.token.starts_with("tmtk_"));
    assert!(created.session.id.starts_with("tmss-"));

    let validated = tokens.validate(&created.token, false, None, None).await.unwrap();
    assert_eq!(validated.user_id, "u1");
    assert_eq!(validated.id, created.session.id);
}

#[tokio::test]
async fn replay_protection_scenarios() {
    let (_, _, tokens) = services();
    let now = now_ms();

    tokens.check_nonce("n1", now).unwrap();
    let replay = tokens.check_nonce("n1", now).unwrap_err();
    assert_eq!(replay.code(), "NONCE_REPLAY");

    // Twice the 30s window in the past.
    let skew = tokens.check_nonce("n2", now - 60_000).unwrap_err();
    assert_eq!(skew.code(), "TIMESTAMP_SKEW");
}

/// Repository wrapper that parks both writers at a barrier inside
/// `update`, forcing a true read-modify-write race.
struct BarrierRepo {
    inner: Arc<MemoryStore>,
    barrier: tokio::sync::Barrier,
}

#[async_trait]
impl SessionRepository for BarrierRepo {
    async fn create(&self, session: &Session) -> tokmesh::Result<()> {
        self.inner.create(session).await
    }
    async fn get(&self, id: &str) -> tokmesh::Result<Option<Session>> {
        self.inner.get(id).await
    }
    async fn update(&self, session: &Session, expected_version: u64) -> tokmesh::Result<()> {
        self.barrier.wait().await;
        self.inner.update(session, expected_version).await
    }
    async fn delete(&self, id: &str) -> tokmesh::Result<bool> {
        SessionRepository::delete(self.inner.as_ref(), id).await
    }
    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        offset: u64,
        limit: u64,
    ) -> tokmesh::Result<(Vec<Session>, u64)> {
        self.inner.list(filter, sort, offset, limit).await
    }
    async fn count_active_by_user(&self, user_id: &str) -> tokmesh::Result<u64> {
        self.inner.count_active_by_user(user_id).await
    }
    async fn list_by_user(&self, user_id: &str) -> tokmesh::Result<Vec<Session>> {
        self.inner.list_by_user(user_id).await
    }
    async fn delete_by_user(&self, user_id: &str) -> tokmesh::Result<u64> {
        self.inner.delete_by_user(user_id).await
    }
    async fn delete_expired(&self, now_ms: i64) -> tokmesh::Result<u64> {
        self.inner.delete_expired(now_ms).await
    }
}

#[tokio::test]
async fn concurrent_renews_serialize_to_exactly_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let racing = Arc::new(SessionService::new(
        Arc::new(BarrierRepo {
            inner: store.clone(),
            barrier: tokio::sync::Barrier::new(2),
        }),
        SessionServiceConfig::default(),
    ));
    let plain = SessionService::new(store.clone(), SessionServiceConfig::default());

    let created = plain
        .create(CreateSession {
            user_id: "u1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let id = created.session.id.clone();
    let initial_version = created.session.version;

    let (a, b) = tokio::join!(
        racing.renew(&id, Duration::from_secs(3600)),
        racing.renew(&id, Duration::from_secs(7200)),
    );

    let outcomes = [a, b];
    let wins = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(Error::VersionConflict { .. })))
        .count();
    assert_eq!(wins, 1, "exactly one renew must win");
    assert_eq!(conflicts, 1, "the loser must see VersionConflict");

    let stored = plain.get(&id).await.unwrap();
    assert_eq!(stored.version, initial_version + 1);
}

#[tokio::test]
async fn revoke_twice_succeeds_both_times() {
    let (_, sessions, tokens) = services();
    let created = sessions
        .create(CreateSession {
            user_id: "u1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    sessions.revoke(&created.session.id).await.unwrap();
    sessions.revoke(&created.session.id).await.unwrap();

    // The token dies with the session.
    let err = tokens.validate(&created.token, false, None, None).await.unwrap_err();
    assert_eq!(err.code(), "TOKEN_INVALID");
}

#[tokio::test]
async fn quota_blocks_session_fifty_one() {
    let (_, sessions, _) = services();
    for _ in 0..50 {
        sessions
            .create(CreateSession {
                user_id: "heavy".into(),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    let err = sessions
        .create(CreateSession {
            user_id: "heavy".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "QUOTA_EXCEEDED");

    // Other users are unaffected.
    sessions
        .create(CreateSession {
            user_id: "light".into(),
            ..Default::default()
        })
        .await
        .unwrap();
}

/// Repository wrapper that reports `VersionConflict` for the first N
/// updates, then delegates.
struct ConflictingRepo {
    inner: Arc<MemoryStore>,
    conflicts_left: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl SessionRepository for ConflictingRepo {
    async fn create(&self, session: &Session) -> tokmesh::Result<()> {
        self.inner.create(session).await
    }
    async fn get(&self, id: &str) -> tokmesh::Result<Option<Session>> {
        self.inner.get(id).await
    }
    async fn update(&self, session: &Session, expected_version: u64) -> tokmesh::Result<()> {
        use std::sync::atomic::Ordering;
        if self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::VersionConflict {
                expected: expected_version,
                stored: expected_version + 1,
            });
        }
        self.inner.update(session, expected_version).await
    }
    async fn delete(&self, id: &str) -> tokmesh::Result<bool> {
        SessionRepository::delete(self.inner.as_ref(), id).await
    }
    async fn list(
        &self,
        filter: &SessionFilter,
        sort: SessionSort,
        offset: u64,
        limit: u64,
    ) -> tokmesh::Result<(Vec<Session>, u64)> {
        self.inner.list(filter, sort, offset, limit).await
    }
    async fn count_active_by_user(&self, user_id: &str) -> tokmesh::Result<u64> {
        self.inner.count_active_by_user(user_id).await
    }
    async fn list_by_user(&self, user_id: &str) -> tokmesh::Result<Vec<Session>> {
        self.inner.list_by_user(user_id).await
    }
    async fn delete_by_user(&self, user_id: &str) -> tokmesh::Result<u64> {
        self.inner.delete_by_user(user_id).await
    }
    async fn delete_expired(&self, now_ms: i64) -> tokmesh::Result<u64> {
        self.inner.delete_expired(now_ms).await
    }
}

fn conflicting_service(conflicts: u32) -> (Arc<MemoryStore>, SessionService) {
    let store = Arc::new(MemoryStore::new());
    let service = SessionService::new(
        Arc::new(ConflictingRepo {
            inner: store.clone(),
            conflicts_left: std::sync::atomic::AtomicU32::new(conflicts),
        }),
        SessionServiceConfig::default(),
    );
    (store, service)
}

#[tokio::test]
async fn touch_survives_one_conflict_via_retry() {
    let (store, sessions) = conflicting_service(0);
    let created = sessions
        .create(CreateSession {
            user_id: "u1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Arm a single conflict, then touch: the retry path must land.
    let flaky = SessionService::new(
        Arc::new(ConflictingRepo {
            inner: store.clone(),
            conflicts_left: std::sync::atomic::AtomicU32::new(1),
        }),
        SessionServiceConfig::default(),
    );
    let touched = flaky
        .touch(&created.session.id, Some("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(touched.version, 2);
    assert_eq!(touched.last_client_ip.as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn touch_gives_up_after_the_second_conflict() {
    let (store, sessions) = conflicting_service(0);
    let created = sessions
        .create(CreateSession {
            user_id: "u1".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let flaky = SessionService::new(
        Arc::new(ConflictingRepo {
            inner: store,
            conflicts_left: std::sync::atomic::AtomicU32::new(2),
        }),
        SessionServiceConfig::default(),
    );
    let err = flaky.touch(&created.session.id, None).await.unwrap_err();
    assert_eq!(err.code(), "STORAGE");
}

#[tokio::test]
async fn listing_pages_through_live_sessions_only() {
    let (_, sessions, _) = services();
    for i in 0..7 {
        sessions
            .create(CreateSession {
                user_id: "u1".into(),
                device_id: Some(format!("device-{i}")),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    sessions
        .create(CreateSession {
            user_id: "u1".into(),
            ttl: Some(Duration::from_millis(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let page1 = sessions
        .list(
            SessionFilter {
                user_id: Some("u1".into()),
                ..Default::default()
            },
            1,
            4,
        )
        .await
        .unwrap();
    assert_eq!(page1.total, 7);
    assert_eq!(page1.sessions.len(), 4);

    let page2 = sessions
        .list(
            SessionFilter {
                user_id: Some("u1".into()),
                ..Default::default()
            },
            2,
            4,
        )
        .await
        .unwrap();
    assert_eq!(page2.sessions.len(), 3);

    // Newest first, no overlap between pages.
    let first_ids: Vec<_> = page1.sessions.iter().map(|s| s.id.clone()).collect();
    assert!(page2.sessions.iter().all(|s| !first_ids.contains(&s.id)));
}
