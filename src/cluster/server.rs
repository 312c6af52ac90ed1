//! Cluster server: glues consensus, discovery, the FSM, and rebalancing.
//!
//! Owns the long-running tasks (discovery event loop, leader monitor,
//! replication health sweep) and is the only component that writes to
//! the replicated log. Discovery callbacks take effect only on the
//! current leader; followers observe the results through log application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::consensus::Consensus;
use crate::cluster::discovery::{Discovery, PeerEvent, PeerMetadata};
use crate::cluster::fsm::{LogEntry, Member, MemberJoin, MemberLeave, MeshFsm, ShardMapUpdate};
use crate::cluster::rebalance::{RebalanceManager, TransferTask};
use crate::cluster::shard_map::ShardMap;
use crate::error::{Error, Result};

/// Bound on a single log apply.
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on AddVoter/RemoveServer configuration changes.
const VOTER_CHANGE_TIMEOUT: Duration = Duration::from_secs(10);
/// How long `start` waits for an elected leader before giving up.
const LEADER_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Watchdog on background task exit during `stop`.
const STOP_WATCHDOG: Duration = Duration::from_secs(5);
/// Cadence of the leader-only replication health sweep.
const REPLICATION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub raft_addr: String,
    pub gossip_addr: String,
    /// Empty disables the cluster-id gate on joins.
    pub cluster_id: String,
    /// Where a persistent consensus runtime keeps its log and
    /// snapshots. Unused by the in-process runtime.
    pub data_dir: std::path::PathBuf,
    pub bootstrap: bool,
    pub seeds: Vec<String>,
    pub replication_factor: u32,
    /// Grace delay between gaining leadership and the automatic
    /// rebalance, letting membership settle first.
    pub rebalance_settle_delay: Duration,
    /// Whether `start` blocks until a leader is known.
    pub wait_for_leader: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".into(),
            raft_addr: "127.0.0.1:7000".into(),
            gossip_addr: "127.0.0.1:7946".into(),
            cluster_id: String::new(),
            data_dir: std::path::PathBuf::from("./data"),
            bootstrap: true,
            seeds: vec![],
            replication_factor: 1,
            rebalance_settle_delay: Duration::from_secs(5),
            wait_for_leader: true,
        }
    }
}

pub struct ClusterServer {
    config: ClusterConfig,
    fsm: Arc<MeshFsm>,
    consensus: Arc<dyn Consensus>,
    discovery: Arc<dyn Discovery>,
    rebalancer: Option<Arc<RebalanceManager>>,
    /// Shard map as of the last completed rebalance; diffed against the
    /// FSM's current map when leadership changes hands.
    last_applied_map: Mutex<ShardMap>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ClusterServer {
    pub fn new(
        config: ClusterConfig,
        fsm: Arc<MeshFsm>,
        consensus: Arc<dyn Consensus>,
        discovery: Arc<dyn Discovery>,
        rebalancer: Option<Arc<RebalanceManager>>,
    ) -> Arc<Self> {
        let last_applied_map = Mutex::new(fsm.shard_map());
        Arc::new(Self {
            config,
            fsm,
            consensus,
            discovery,
            rebalancer,
            last_applied_map,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the background loops and optionally wait for a leader.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let events = self
            .discovery
            .take_events()
            .ok_or_else(|| Error::Internal("discovery event stream already consumed".into()))?;

        {
            let mut tasks = self.tasks.lock().expect("tasks lock poisoned");

            let server = self.clone();
            tasks.push(tokio::spawn(async move {
                server.event_loop(events).await;
            }));

            let server = self.clone();
            tasks.push(tokio::spawn(async move {
                server.leader_monitor().await;
            }));

            if self.config.replication_factor > 1 {
                let server = self.clone();
                tasks.push(tokio::spawn(async move {
                    server.replication_health_loop().await;
                }));
            }
        }

        info!(
            node_id = %self.config.node_id,
            bootstrap = self.config.bootstrap,
            seeds = ?self.config.seeds,
            "cluster server started"
        );

        if self.config.wait_for_leader {
            self.wait_for_leader().await;
        }
        Ok(())
    }

    async fn wait_for_leader(&self) {
        let mut watch = self.consensus.leader_watch();
        let wait = async {
            loop {
                if self.consensus.leader_id().is_some() {
                    return;
                }
                if watch.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(LEADER_WAIT_TIMEOUT, wait).await.is_err() {
            warn!(
                timeout = ?LEADER_WAIT_TIMEOUT,
                "no leader elected before startup wait expired"
            );
        }
    }

    /// Consume discovery events until shutdown. Join/leave handling runs
    /// only while this node is the leader.
    async fn event_loop(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<PeerEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(event) => self.handle_peer_event(event).await,
                },
            }
        }
        debug!("discovery event loop exited");
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Join {
                node_id,
                addr,
                metadata,
            } => self.handle_peer_join(node_id, addr, metadata).await,
            PeerEvent::Leave { node_id } => {
                if !self.consensus.is_leader() {
                    debug!(node_id, "ignoring peer leave: not the leader");
                    return;
                }
                info!(node_id, "peer left, removing from cluster");
                if let Err(e) = self.apply_member_leave(&node_id).await {
                    self.report_apply_error("member leave", &e);
                    return;
                }
                if let Err(e) = self
                    .consensus
                    .remove_server(&node_id, VOTER_CHANGE_TIMEOUT)
                    .await
                {
                    warn!(node_id, error = %e, "failed to remove server from consensus");
                }
            }
            PeerEvent::Update { node_id } => {
                debug!(node_id, "peer metadata updated");
            }
        }
    }

    async fn handle_peer_join(&self, node_id: String, addr: String, metadata: Vec<u8>) {
        if node_id == self.config.node_id {
            return;
        }
        if !self.consensus.is_leader() {
            debug!(node_id, "ignoring peer join: not the leader");
            return;
        }

        if metadata.is_empty() {
            warn!(node_id, "peer join skipped: no metadata advertised");
            return;
        }
        let meta = match PeerMetadata::decode(&metadata) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(node_id, error = %e, "peer join skipped: unparseable metadata");
                return;
            }
        };

        if !self.config.cluster_id.is_empty() && meta.cluster_id != self.config.cluster_id {
            warn!(
                node_id,
                theirs = %meta.cluster_id,
                ours = %self.config.cluster_id,
                "peer join rejected: cluster id mismatch"
            );
            return;
        }

        // Prefer the advertised consensus address; fall back to where the
        // gossip traffic actually came from.
        let raft_addr = if meta.raft_addr.is_empty() {
            addr
        } else {
            meta.raft_addr
        };

        info!(node_id, raft_addr, "peer joined, adding to cluster");
        if let Err(e) = self.apply_member_join(&node_id, &raft_addr).await {
            self.report_apply_error("member join", &e);
            return;
        }
        if let Err(e) = self
            .consensus
            .add_voter(&node_id, &raft_addr, VOTER_CHANGE_TIMEOUT)
            .await
        {
            warn!(node_id, error = %e, "failed to add voter to consensus");
        }
    }

    /// A failed FSM apply means this replica can no longer follow the
    /// log; shut the node down rather than diverge.
    fn report_apply_error(&self, context: &str, err: &Error) {
        match err {
            Error::NotLeader => debug!(context, "apply raced a leadership change"),
            Error::Internal(_) => {
                error!(context, error = %err, "fatal apply failure, stopping replica");
                self.cancel.cancel();
            }
            other => warn!(context, error = %other, "apply failed"),
        }
    }

    /// Watch leadership transitions; gaining the lease schedules a
    /// delayed rebalance that a fast shutdown can cancel.
    async fn leader_monitor(self: Arc<Self>) {
        let mut watch = self.consensus.leader_watch();
        let mut was_leader = false;
        loop {
            let is_leader = *watch.borrow();
            if is_leader && !was_leader {
                info!(node_id = %self.config.node_id, "became cluster leader");
                self.on_become_leader();
            } else if !is_leader && was_leader {
                info!(node_id = %self.config.node_id, "lost cluster leadership");
            }
            was_leader = is_leader;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = watch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("leader monitor exited");
    }

    fn on_become_leader(self: &Arc<Self>) {
        let server = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = server.cancel.cancelled() => {
                    debug!("pending post-election rebalance aborted by shutdown");
                    return;
                }
                _ = tokio::time::sleep(server.config.rebalance_settle_delay) => {}
            }
            match server.rebalance_changed_shards().await {
                Ok(tasks) if tasks.is_empty() => {
                    debug!("post-election rebalance had nothing to move")
                }
                Ok(tasks) => info!(shards = tasks.len(), "post-election rebalance finished"),
                Err(e) => warn!(error = %e, "post-election rebalance failed"),
            }
        });
        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Leader-only sweep that reports shards running below the
    /// configured replication factor. Observability only: it never
    /// re-replicates by itself.
    async fn replication_health_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(REPLICATION_SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if !self.consensus.is_leader() {
                continue;
            }
            let map = self.fsm.shard_map();
            let under = under_replicated_shards(&map, self.config.replication_factor);
            if !under.is_empty() {
                warn!(
                    count = under.len(),
                    replication_factor = self.config.replication_factor,
                    sample = ?&under[..under.len().min(8)],
                    "under-replicated shards detected"
                );
            }
        }
        debug!("replication health loop exited");
    }

    /// Diff the FSM's current map against the last one this node
    /// rebalanced to, and migrate the difference.
    pub async fn rebalance_changed_shards(&self) -> Result<Vec<TransferTask>> {
        let Some(rebalancer) = &self.rebalancer else {
            return Err(Error::FailedPrecondition(
                "rebalancing requires a storage engine".into(),
            ));
        };
        if !self.consensus.is_leader() {
            return Err(Error::NotLeader);
        }

        let new_map = self.fsm.shard_map();
        let old_map = self
            .last_applied_map
            .lock()
            .expect("last map lock poisoned")
            .clone();

        let tasks = rebalancer.trigger_rebalance(&old_map, &new_map).await?;
        *self
            .last_applied_map
            .lock()
            .expect("last map lock poisoned") = new_map;
        Ok(tasks)
    }

    /// Idempotent shutdown: signal, broadcast leave, close consensus,
    /// then wait (bounded) for the background loops.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node_id = %self.config.node_id, "cluster server stopping");
        self.cancel.cancel();

        if let Err(e) = self.discovery.leave().await {
            warn!(error = %e, "discovery leave failed");
        }
        if let Err(e) = self.discovery.shutdown().await {
            warn!(error = %e, "discovery shutdown failed");
        }
        if let Err(e) = self.consensus.close().await {
            warn!(error = %e, "consensus close failed");
        }

        let handles = std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        if tokio::time::timeout(STOP_WATCHDOG, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(watchdog = ?STOP_WATCHDOG, "background tasks outlived the stop watchdog");
        }
        Ok(())
    }

    // -- read surface -------------------------------------------------------

    pub fn get_shard_map(&self) -> ShardMap {
        self.fsm.shard_map()
    }

    pub fn get_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.fsm.members().into_values().collect();
        members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        members
    }

    pub fn is_leader(&self) -> bool {
        self.consensus.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.consensus.leader_id()
    }

    pub fn get_shard_owner(&self, shard_id: u32) -> Option<String> {
        self.fsm.shard_map().owner(shard_id).map(str::to_owned)
    }

    /// Owner of the shard a key hashes to; falls back to the hash ring
    /// when the shard has no explicit assignment yet.
    pub fn get_key_owner(&self, key: &str) -> Option<String> {
        let map = self.fsm.shard_map();
        map.shard_owner_for_key(key)
            .or_else(|| map.node_for_key(key))
            .map(str::to_owned)
    }

    pub fn get_stats(&self) -> HashMap<String, String> {
        let map = self.fsm.shard_map();
        let mut stats = self.consensus.stats();
        stats.insert("node_id".into(), self.config.node_id.clone());
        stats.insert("members".into(), self.fsm.member_count().to_string());
        stats.insert("shard_map_version".into(), map.version().to_string());
        stats.insert("ring_nodes".into(), map.ring_nodes().len().to_string());
        stats.insert(
            "rebalance_running".into(),
            self.rebalancer
                .as_ref()
                .is_some_and(|r| r.is_running())
                .to_string(),
        );
        stats
    }

    // -- write surface ------------------------------------------------------

    /// Route a shard assignment through the replicated log.
    pub async fn apply_shard_update(
        &self,
        shard_id: u32,
        node_id: &str,
        replicas: Vec<String>,
    ) -> Result<()> {
        if !self.consensus.is_leader() {
            return Err(Error::NotLeader);
        }
        let entry = LogEntry::shard_map_update(&ShardMapUpdate {
            shard_id,
            node_id: node_id.to_owned(),
            replicas,
        });
        self.consensus.apply(&entry, APPLY_TIMEOUT).await
    }

    pub async fn apply_member_join(&self, node_id: &str, addr: &str) -> Result<()> {
        let entry = LogEntry::member_join(&MemberJoin {
            node_id: node_id.to_owned(),
            addr: addr.to_owned(),
        });
        self.consensus.apply(&entry, APPLY_TIMEOUT).await
    }

    pub async fn apply_member_leave(&self, node_id: &str) -> Result<()> {
        let entry = LogEntry::member_leave(&MemberLeave {
            node_id: node_id.to_owned(),
        });
        self.consensus.apply(&entry, APPLY_TIMEOUT).await
    }
}

/// Assigned shards whose replica count (owner included) falls short of
/// `replication_factor`.
pub fn under_replicated_shards(map: &ShardMap, replication_factor: u32) -> Vec<u32> {
    let mut under: Vec<u32> = map
        .assignments()
        .keys()
        .filter(|shard| (map.replicas(**shard).len() as u32) + 1 < replication_factor)
        .copied()
        .collect();
    under.sort_unstable();
    under
}
