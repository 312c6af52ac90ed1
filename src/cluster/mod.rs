//! Cluster layer: shard placement, replicated state, and rebalancing.

pub mod consensus;
pub mod discovery;
pub mod fsm;
pub mod hash;
pub mod rebalance;
pub mod rpc;
pub mod server;
pub mod shard_map;

pub use consensus::{Consensus, LocalConsensus};
pub use discovery::{Discovery, Peer, PeerEvent, PeerMetadata, StaticDiscovery};
pub use fsm::{Member, MemberState, MeshFsm, MeshState};
pub use rebalance::{RebalanceConfig, RebalanceManager, TaskStatus, TransferTask};
pub use rpc::{InterceptorStack, LocalShardTransport, NodeAuthenticator, TransferReceiver};
pub use server::{ClusterConfig, ClusterServer};
pub use shard_map::{SHARD_COUNT, ShardMap, VNODES_PER_NODE, hash_key};
