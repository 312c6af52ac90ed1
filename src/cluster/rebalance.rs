//! Shard rebalance pipeline.
//!
//! When shard ownership moves, the old owner streams its live sessions
//! for that shard to the new owner under a byte-rate budget, waits for
//! the acknowledgement, then drops the local copies. At most one
//! rebalance runs at a time; callers that race the flag fail fast.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cluster::shard_map::{SHARD_COUNT, ShardMap};
use crate::error::{Error, Result};
use crate::storage::StorageEngine;
use crate::utils::now_ms;

/// Byte-rate limiter burst ceiling. A small burst smooths the stream
/// instead of front-loading a whole second of budget.
const MAX_BURST_BYTES: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub max_rate_bytes_per_sec: u32,
    /// Sessions closer to expiry than this are not worth migrating.
    pub min_ttl: Duration,
    pub concurrent_shards: usize,
    pub streaming_timeout: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_rate_bytes_per_sec: 8 * 1024 * 1024,
            min_ttl: Duration::from_secs(30),
            concurrent_shards: 4,
            streaming_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// One record on a shard transfer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferFrame {
    pub shard_id: u32,
    pub session_id: String,
    pub session_data: Vec<u8>,
}

/// Per-shard acknowledgement from the receiving node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAck {
    pub ok: bool,
    pub applied: u64,
    pub skipped: u64,
    #[serde(default)]
    pub message: String,
}

/// Client side of a shard transfer stream.
#[async_trait]
pub trait ShardStream: Send {
    async fn send(&mut self, frame: TransferFrame) -> Result<()>;

    /// Close the stream and collect the receiver's acknowledgement.
    async fn finish(self: Box<Self>) -> Result<TransferAck>;
}

impl std::fmt::Debug for dyn ShardStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStream").finish_non_exhaustive()
    }
}

/// Opens transfer streams to other nodes.
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn open(&self, target_node: &str) -> Result<Box<dyn ShardStream>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Progress record for one shard migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    pub shard_id: u32,
    pub target: String,
    pub status: TaskStatus,
    pub transferred: u64,
    pub skipped: u64,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamStats {
    transferred: u64,
    skipped: u64,
    bytes: u64,
}

type ByteLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RebalanceManager {
    storage: Arc<dyn StorageEngine>,
    transport: Arc<dyn ShardTransport>,
    config: RebalanceConfig,
    tasks: Mutex<HashMap<u32, TransferTask>>,
    running: AtomicBool,
}

/// Clears the running flag exactly once, however the rebalance exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RebalanceManager {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        transport: Arc<dyn ShardTransport>,
        config: RebalanceConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            config,
            tasks: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the last run's per-shard tasks.
    pub fn tasks(&self) -> Vec<TransferTask> {
        let mut tasks: Vec<TransferTask> = self
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .values()
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.shard_id);
        tasks
    }

    /// Migrate every shard whose owner differs between the two maps.
    ///
    /// Fails fast with `AlreadyRunning` when a rebalance is in flight.
    /// Returns the final task set of this run.
    pub async fn trigger_rebalance(
        &self,
        old_map: &ShardMap,
        new_map: &ShardMap,
    ) -> Result<Vec<TransferTask>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let migrations = compute_migrations(old_map, new_map);
        info!(
            shard_count = migrations.len(),
            "rebalance triggered, planning migrations"
        );

        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
            tasks.clear();
            for (shard_id, target) in &migrations {
                tasks.insert(
                    *shard_id,
                    TransferTask {
                        shard_id: *shard_id,
                        target: target.clone(),
                        status: TaskStatus::Pending,
                        transferred: 0,
                        skipped: 0,
                        bytes: 0,
                        error: None,
                    },
                );
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrent_shards.max(1)));
        let workers = migrations.into_iter().map(|(shard_id, target)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.run_shard(shard_id, &target).await;
            }
        });
        futures::future::join_all(workers).await;

        let tasks = self.tasks();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        if failed > 0 {
            warn!(failed, total = tasks.len(), "rebalance finished with failures");
        } else {
            info!(total = tasks.len(), "rebalance finished");
        }
        Ok(tasks)
    }

    async fn run_shard(&self, shard_id: u32, target: &str) {
        self.set_status(shard_id, TaskStatus::Running, None);

        let streamed = tokio::time::timeout(
            self.config.streaming_timeout,
            self.stream_shard(shard_id, target),
        )
        .await;

        match streamed {
            Ok(Ok(stats)) => {
                // The data is durable on the new owner; local cleanup is
                // best effort and never fails the task.
                self.cleanup_shard(shard_id).await;
                {
                    let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
                    if let Some(task) = tasks.get_mut(&shard_id) {
                        task.status = TaskStatus::Completed;
                        task.transferred = stats.transferred;
                        task.skipped = stats.skipped;
                        task.bytes = stats.bytes;
                    }
                }
                info!(
                    shard = shard_id,
                    target,
                    transferred = stats.transferred,
                    skipped = stats.skipped,
                    bytes = stats.bytes,
                    "shard migration completed"
                );
            }
            Ok(Err(e)) => {
                warn!(shard = shard_id, target, error = %e, "shard migration failed");
                self.set_status(shard_id, TaskStatus::Failed, Some(e.to_string()));
            }
            Err(_) => {
                warn!(
                    shard = shard_id,
                    target,
                    timeout = ?self.config.streaming_timeout,
                    "shard migration timed out"
                );
                self.set_status(shard_id, TaskStatus::Failed, Some("streaming timeout".into()));
            }
        }
    }

    async fn stream_shard(&self, shard_id: u32, target: &str) -> Result<StreamStats> {
        let mut stream = self.transport.open(target).await?;

        let rate = NonZeroU32::new(self.config.max_rate_bytes_per_sec.max(1))
            .expect("rate clamped to >= 1");
        let burst = NonZeroU32::new(rate.get().min(MAX_BURST_BYTES)).expect("burst >= 1");
        let limiter: ByteLimiter = RateLimiter::direct(Quota::per_second(rate).allow_burst(burst));

        let mut stats = StreamStats::default();
        let min_ttl_ms = self.config.min_ttl.as_millis() as i64;
        let now = now_ms();

        // Serialize matching sessions up front; the scan callback is
        // synchronous, the rate-limited sends are not.
        let mut outgoing: Vec<(String, Vec<u8>)> = Vec::new();
        self.storage
            .scan(&mut |session| {
                if session.shard_id != shard_id {
                    return true;
                }
                if session.expires_at <= now || session.remaining_ttl_ms(now) < min_ttl_ms {
                    stats.skipped += 1;
                    return true;
                }
                match serde_json::to_vec(session) {
                    Ok(data) => outgoing.push((session.id.clone(), data)),
                    Err(e) => {
                        warn!(session_id = %session.id, error = %e, "unserializable session skipped");
                        stats.skipped += 1;
                    }
                }
                true
            })
            .await?;

        for (session_id, data) in outgoing {
            let len = data.len();
            wait_for_bytes(&limiter, burst.get(), len).await?;
            stream
                .send(TransferFrame {
                    shard_id,
                    session_id,
                    session_data: data,
                })
                .await?;
            stats.transferred += 1;
            stats.bytes += len as u64;
        }

        let ack = stream.finish().await?;
        if !ack.ok {
            return Err(Error::Internal(format!(
                "target rejected shard {shard_id}: {}",
                ack.message
            )));
        }
        Ok(stats)
    }

    /// Best-effort delete of every local session on the migrated shard.
    async fn cleanup_shard(&self, shard_id: u32) {
        let mut ids = Vec::new();
        let scan = self
            .storage
            .scan(&mut |session| {
                if session.shard_id == shard_id {
                    ids.push(session.id.clone());
                }
                true
            })
            .await;
        if let Err(e) = scan {
            warn!(shard = shard_id, error = %e, "cleanup scan failed");
            return;
        }

        let mut failures = 0u64;
        for id in &ids {
            if let Err(e) = self.storage.delete(id).await {
                failures += 1;
                debug!(session_id = %id, error = %e, "cleanup delete failed");
            }
        }
        if failures > 0 {
            warn!(
                shard = shard_id,
                failures,
                total = ids.len(),
                "cleanup completed with failures"
            );
        }
    }

    fn set_status(&self, shard_id: u32, status: TaskStatus, error: Option<String>) {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        if let Some(task) = tasks.get_mut(&shard_id) {
            task.status = status;
            task.error = error;
        }
    }
}

/// Plan migrations across the full shard id space.
///
/// Iterates every possible shard id rather than the owner map's entries:
/// the map is sparse, and a shard moving from unassigned to assigned is
/// still a migration.
fn compute_migrations(old_map: &ShardMap, new_map: &ShardMap) -> Vec<(u32, String)> {
    let mut migrations = Vec::new();
    for shard_id in 0..SHARD_COUNT {
        if let Some(new_owner) = new_map.owner(shard_id)
            && old_map.owner(shard_id) != Some(new_owner)
        {
            migrations.push((shard_id, new_owner.to_owned()));
        }
    }
    migrations
}

/// Block until the limiter grants `len` bytes, in burst-sized chunks so
/// records larger than the burst still get through.
async fn wait_for_bytes(limiter: &ByteLimiter, burst: u32, len: usize) -> Result<()> {
    let mut remaining = len as u64;
    while remaining > 0 {
        let chunk = remaining.min(u64::from(burst)) as u32;
        let cells = NonZeroU32::new(chunk).expect("chunk is non-zero while remaining > 0");
        limiter
            .until_n_ready(cells)
            .await
            .map_err(|e| Error::Internal(format!("byte budget unsatisfiable: {e}")))?;
        remaining -= u64::from(chunk);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_plan_covers_sparse_and_new_assignments() {
        let mut old = ShardMap::new();
        old.assign_shard(5, "node-a", &[]);
        old.assign_shard(7, "node-b", &[]);

        let mut new = ShardMap::new();
        new.assign_shard(5, "node-b", &[]);
        new.assign_shard(7, "node-b", &[]);
        new.assign_shard(9, "node-c", &[]); // previously unassigned

        let migrations = compute_migrations(&old, &new);
        assert_eq!(
            migrations,
            vec![(5, "node-b".to_owned()), (9, "node-c".to_owned())]
        );
    }

    #[test]
    fn identical_maps_plan_nothing() {
        let mut map = ShardMap::new();
        map.assign_shard(1, "node-a", &[]);
        assert!(compute_migrations(&map, &map.clone()).is_empty());
    }

    #[test]
    fn unassignment_is_not_a_migration() {
        let mut old = ShardMap::new();
        old.assign_shard(3, "node-a", &[]);
        let new = ShardMap::new();
        assert!(compute_migrations(&old, &new).is_empty());
    }

    #[tokio::test]
    async fn wait_for_bytes_handles_oversized_records() {
        let rate = NonZeroU32::new(u32::MAX).unwrap();
        let burst = NonZeroU32::new(1024).unwrap();
        let limiter: ByteLimiter =
            RateLimiter::direct(Quota::per_second(rate).allow_burst(burst));
        // 10x the burst must still complete.
        wait_for_bytes(&limiter, burst.get(), 10 * 1024).await.unwrap();
    }
}
