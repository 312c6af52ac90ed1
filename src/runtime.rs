//! Node runtime: worker supervision and shutdown.
//!
//! The node runs a small, fixed set of long-running workers (the cluster
//! server wrapper and the session GC sweep). Rather than a generic
//! service registry, the supervisor keeps them in one [`JoinSet`] and
//! hands every worker the same [`CancellationToken`]: a worker is any
//! future that runs until the token fires and then returns. The first
//! worker to return on its own — or SIGINT/SIGTERM — ends the node, and
//! the rest are drained under a single grace deadline shared by the
//! whole set.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::ClusterServer;
use crate::session::SessionService;

pub struct Supervisor {
    shutdown: CancellationToken,
    workers: JoinSet<(&'static str, anyhow::Result<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            workers: JoinSet::new(),
        }
    }

    /// Token workers watch for shutdown. Clone freely.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn a worker. The future must keep running until the shutdown
    /// token fires; returning earlier is treated as a node fault.
    pub fn spawn<F>(&mut self, name: &'static str, work: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        info!(worker = name, "worker starting");
        self.workers.spawn(async move { (name, work.await) });
    }

    /// Supervise until a signal arrives or a worker quits, then drain.
    pub async fn run(self, grace: Duration) -> ExitCode {
        if self.run_until(shutdown_signal(), grace).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    /// Returns whether the node came down clean.
    async fn run_until(
        mut self,
        trigger: impl Future<Output = &'static str>,
        grace: Duration,
    ) -> bool {
        let mut clean = true;

        tokio::select! {
            reason = trigger => {
                info!(reason, "shutdown requested");
            }
            Some(finished) = self.workers.join_next() => {
                // Workers only return once cancelled; an early return
                // means part of the node is gone and it must come down.
                clean = false;
                match finished {
                    Ok((name, Ok(()))) => warn!(worker = name, "worker exited before shutdown"),
                    Ok((name, Err(e))) => error!(worker = name, error = ?e, "worker failed"),
                    Err(e) => error!(error = %e, "worker panicked"),
                }
            }
        }

        self.shutdown.cancel();

        // One deadline for the whole set, not per worker: a slow worker
        // does not buy the others extra time.
        let deadline = Instant::now() + grace;
        loop {
            match tokio::time::timeout_at(deadline, self.workers.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((name, Ok(()))))) => info!(worker = name, "worker stopped"),
                Ok(Some(Ok((name, Err(e))))) => {
                    error!(worker = name, error = ?e, "worker failed during shutdown");
                    clean = false;
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "worker panicked during shutdown");
                    clean = false;
                }
                Err(_) => {
                    error!(
                        stragglers = self.workers.len(),
                        grace = ?grace,
                        "grace period expired, aborting remaining workers"
                    );
                    self.workers.shutdown().await;
                    clean = false;
                    break;
                }
            }
        }

        info!(clean, "node stopped");
        clean
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
        "SIGINT"
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        "SIGTERM"
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        name = ctrl_c => name,
        name = terminate => name,
    }
}

/// Worker: keep the cluster server alive, stop it on shutdown.
pub async fn run_cluster(
    server: Arc<ClusterServer>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    server.start().await?;
    shutdown.cancelled().await;
    server.stop().await?;
    Ok(())
}

/// Worker: periodic expired-session sweep.
///
/// Expiry is otherwise lazy (enforced on access); this bounds how long
/// dead rows linger in storage.
pub async fn run_session_gc(
    sessions: Arc<SessionService>,
    every: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The interval's first tick is immediate; skip it so a restart loop
    // doesn't hammer storage.
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tick.tick() => {
                if let Err(e) = sessions.gc().await {
                    warn!(error = %e, "gc sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CreateSession, SessionServiceConfig};
    use crate::storage::MemoryStore;

    fn wait_for_token(shutdown: CancellationToken) -> impl Future<Output = anyhow::Result<()>> {
        async move {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn trigger_cancels_workers_and_exits_clean() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("a", wait_for_token(supervisor.shutdown_token()));
        supervisor.spawn("b", wait_for_token(supervisor.shutdown_token()));

        let clean = supervisor
            .run_until(std::future::ready("test"), Duration::from_secs(1))
            .await;
        assert!(clean);
    }

    #[tokio::test]
    async fn early_worker_exit_fails_the_node() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("steady", wait_for_token(supervisor.shutdown_token()));
        supervisor.spawn("flaky", async { Ok(()) });

        let clean = supervisor
            .run_until(std::future::pending(), Duration::from_secs(1))
            .await;
        assert!(!clean);
    }

    #[tokio::test]
    async fn worker_error_fails_the_node() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("broken", async { Err(anyhow::anyhow!("boom")) });

        let clean = supervisor
            .run_until(std::future::pending(), Duration::from_secs(1))
            .await;
        assert!(!clean);
    }

    #[tokio::test]
    async fn stragglers_are_aborted_at_the_grace_deadline() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn("deaf", async {
            // Ignores the shutdown token entirely.
            std::future::pending::<()>().await;
            Ok(())
        });

        let start = std::time::Instant::now();
        let clean = supervisor
            .run_until(std::future::ready("test"), Duration::from_millis(50))
            .await;
        assert!(!clean);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn gc_worker_sweeps_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let sessions = Arc::new(SessionService::new(
            store.clone(),
            SessionServiceConfig::default(),
        ));
        sessions
            .create(CreateSession {
                user_id: "u1".into(),
                ttl: Some(Duration::from_millis(1)),
                ..Default::default()
            })
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_session_gc(
            sessions,
            Duration::from_millis(10),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        shutdown.cancel();
        worker.await.unwrap().unwrap();
    }
}
