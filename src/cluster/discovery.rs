//! Peer discovery interface.
//!
//! A gossip-style membership layer sits behind this trait and feeds the
//! cluster server a bounded stream of peer events, in the order the
//! membership layer observed them. Each peer advertises a small metadata
//! record; consumers (not the discovery layer) decide what to do with
//! malformed or foreign metadata.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Metadata every node gossips about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Address the node's consensus transport listens on. Empty means
    /// "derive from the observed gossip address".
    #[serde(default)]
    pub raft_addr: String,
    /// Cluster this node believes it belongs to.
    #[serde(default)]
    pub cluster_id: String,
}

impl PeerMetadata {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("peer metadata is serializable")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// One known peer, as the membership layer sees it.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: String,
    /// Observed gossip `addr:port`.
    pub addr: String,
    pub metadata: Vec<u8>,
}

/// Membership change observed by the discovery layer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Join {
        node_id: String,
        addr: String,
        metadata: Vec<u8>,
    },
    Leave {
        node_id: String,
    },
    Update {
        node_id: String,
    },
}

/// Discovery runtime: membership list plus an ordered event stream.
#[async_trait]
pub trait Discovery: Send + Sync {
    fn members(&self) -> Vec<Peer>;

    fn local_node(&self) -> Peer;

    /// Take the event receiver. Single consumer; returns `None` after the
    /// first call.
    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>>;

    /// Broadcast a graceful leave to the cluster.
    async fn leave(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Event channel depth. Discovery churn beyond this applies backpressure
/// to the membership layer rather than growing unbounded.
const EVENT_CHANNEL_DEPTH: usize = 64;

/// In-process discovery for single-node deployments and tests.
///
/// Has no real gossip transport: peers appear only via [`inject`], which
/// tests and local tooling use to simulate membership changes.
///
/// [`inject`]: StaticDiscovery::inject
pub struct StaticDiscovery {
    local: Peer,
    members: Mutex<Vec<Peer>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

impl StaticDiscovery {
    pub fn new(node_id: &str, gossip_addr: &str, metadata: PeerMetadata) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let local = Peer {
            node_id: node_id.to_owned(),
            addr: gossip_addr.to_owned(),
            metadata: metadata.encode(),
        };
        Self {
            members: Mutex::new(vec![local.clone()]),
            local,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Feed a membership event into the stream, updating the member list
    /// to match.
    pub async fn inject(&self, event: PeerEvent) -> Result<()> {
        {
            let mut members = self.members.lock().expect("members lock poisoned");
            match &event {
                PeerEvent::Join {
                    node_id,
                    addr,
                    metadata,
                } => {
                    members.retain(|p| p.node_id != *node_id);
                    members.push(Peer {
                        node_id: node_id.clone(),
                        addr: addr.clone(),
                        metadata: metadata.clone(),
                    });
                }
                PeerEvent::Leave { node_id } => {
                    members.retain(|p| p.node_id != *node_id);
                }
                PeerEvent::Update { .. } => {}
            }
        }
        self.events_tx
            .send(event)
            .await
            .map_err(|_| Error::Internal("discovery event consumer is gone".into()))
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    fn members(&self) -> Vec<Peer> {
        self.members.lock().expect("members lock poisoned").clone()
    }

    fn local_node(&self) -> Peer {
        self.local.clone()
    }

    fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events_rx
            .lock()
            .expect("events lock poisoned")
            .take()
    }

    async fn leave(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_and_tolerates_missing_fields() {
        let meta = PeerMetadata {
            raft_addr: "10.0.0.1:7000".into(),
            cluster_id: "prod".into(),
        };
        let decoded = PeerMetadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded, meta);

        let sparse = PeerMetadata::decode(b"{}").unwrap();
        assert_eq!(sparse, PeerMetadata::default());

        assert!(PeerMetadata::decode(b"not json").is_err());
    }

    #[tokio::test]
    async fn injected_events_arrive_in_order() {
        let discovery = StaticDiscovery::new("node-a", "127.0.0.1:7946", PeerMetadata::default());
        let mut events = discovery.take_events().unwrap();
        assert!(discovery.take_events().is_none());

        discovery
            .inject(PeerEvent::Join {
                node_id: "node-b".into(),
                addr: "127.0.0.1:7947".into(),
                metadata: PeerMetadata::default().encode(),
            })
            .await
            .unwrap();
        discovery
            .inject(PeerEvent::Leave {
                node_id: "node-b".into(),
            })
            .await
            .unwrap();

        assert!(matches!(events.recv().await, Some(PeerEvent::Join { .. })));
        assert!(matches!(events.recv().await, Some(PeerEvent::Leave { .. })));
    }

    #[tokio::test]
    async fn member_list_follows_joins_and_leaves() {
        let discovery = StaticDiscovery::new("node-a", "127.0.0.1:7946", PeerMetadata::default());
        let _events = discovery.take_events().unwrap();

        discovery
            .inject(PeerEvent::Join {
                node_id: "node-b".into(),
                addr: "127.0.0.1:7947".into(),
                metadata: vec![],
            })
            .await
            .unwrap();
        assert_eq!(discovery.members().len(), 2);

        discovery
            .inject(PeerEvent::Leave {
                node_id: "node-b".into(),
            })
            .await
            .unwrap();
        assert_eq!(discovery.members().len(), 1);
        assert_eq!(discovery.local_node().node_id, "node-a");
    }
}
