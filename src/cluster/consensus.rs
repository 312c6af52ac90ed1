//! Consensus runtime interface.
//!
//! The cluster server treats consensus as a black box behind this trait:
//! any Raft/Paxos implementation with totally-ordered applies, a leader
//! signal, and voter management can plug in. [`LocalConsensus`] is the
//! in-process implementation used for single-node bootstrap and tests;
//! it applies entries straight to the FSM and is always its own leader
//! once bootstrapped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cluster::fsm::MeshFsm;
use crate::error::{Error, Result};

/// Black-box consensus runtime, per the cluster server's needs.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Replicate and apply one encoded log entry within `timeout`.
    ///
    /// An FSM decode failure surfaced here is fatal for the replica: the
    /// caller must stop the node rather than continue on divergent state.
    async fn apply(&self, entry: &[u8], timeout: Duration) -> Result<()>;

    fn is_leader(&self) -> bool;

    fn leader_id(&self) -> Option<String>;

    async fn add_voter(&self, node_id: &str, addr: &str, timeout: Duration) -> Result<()>;

    async fn remove_server(&self, node_id: &str, timeout: Duration) -> Result<()>;

    /// Leadership signal: `true` while this node is leader. Receivers see
    /// every transition.
    fn leader_watch(&self) -> watch::Receiver<bool>;

    /// Serialized FSM snapshot.
    async fn snapshot(&self) -> Result<Vec<u8>>;

    /// Current voting configuration as `(node_id, addr)` pairs.
    fn configuration(&self) -> Vec<(String, String)>;

    fn stats(&self) -> HashMap<String, String>;

    async fn close(&self) -> Result<()>;
}

/// Single-node consensus: no peers, no election, applies go straight to
/// the local FSM in call order.
pub struct LocalConsensus {
    node_id: String,
    fsm: Arc<MeshFsm>,
    leader_tx: watch::Sender<bool>,
    voters: Mutex<Vec<(String, String)>>,
    applied: AtomicU64,
}

impl LocalConsensus {
    pub fn new(node_id: &str, addr: &str, fsm: Arc<MeshFsm>, bootstrap: bool) -> Self {
        let (leader_tx, _) = watch::channel(bootstrap);
        if bootstrap {
            info!(node_id, "bootstrapping single-voter consensus");
        }
        Self {
            node_id: node_id.to_owned(),
            fsm,
            leader_tx,
            voters: Mutex::new(vec![(node_id.to_owned(), addr.to_owned())]),
            applied: AtomicU64::new(0),
        }
    }

    /// Test hook: flip leadership and notify watchers.
    pub fn set_leader(&self, is_leader: bool) {
        let _ = self.leader_tx.send(is_leader);
    }
}

#[async_trait]
impl Consensus for LocalConsensus {
    async fn apply(&self, entry: &[u8], _timeout: Duration) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        self.fsm
            .apply(entry)
            .map_err(|e| Error::Internal(format!("fsm apply failed, replica must stop: {e}")))?;
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    fn leader_id(&self) -> Option<String> {
        self.is_leader().then(|| self.node_id.clone())
    }

    async fn add_voter(&self, node_id: &str, addr: &str, _timeout: Duration) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        let mut voters = self.voters.lock().expect("voters lock poisoned");
        if !voters.iter().any(|(id, _)| id == node_id) {
            voters.push((node_id.to_owned(), addr.to_owned()));
            debug!(node_id, addr, "voter added");
        }
        Ok(())
    }

    async fn remove_server(&self, node_id: &str, _timeout: Duration) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }
        self.voters
            .lock()
            .expect("voters lock poisoned")
            .retain(|(id, _)| id != node_id);
        debug!(node_id, "server removed");
        Ok(())
    }

    fn leader_watch(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.fsm.snapshot_bytes())
    }

    fn configuration(&self) -> Vec<(String, String)> {
        self.voters.lock().expect("voters lock poisoned").clone()
    }

    fn stats(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        stats.insert("state".into(), if self.is_leader() { "leader" } else { "follower" }.into());
        stats.insert(
            "applied_entries".into(),
            self.applied.load(Ordering::Relaxed).to_string(),
        );
        stats.insert(
            "voters".into(),
            self.voters
                .lock()
                .expect("voters lock poisoned")
                .len()
                .to_string(),
        );
        stats
    }

    async fn close(&self) -> Result<()> {
        self.set_leader(false);
        Ok(())
    }
}
