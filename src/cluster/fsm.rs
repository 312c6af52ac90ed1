//! Replicated state machine over the shard map and membership.
//!
//! Every node applies the same totally-ordered log entries to an
//! identical state machine, so all replicas converge on one view of
//! shard ownership and membership. Apply is deterministic and touches
//! nothing outside the FSM state.
//!
//! Unknown entry types and undecodable payloads are fatal by contract:
//! they mean this replica runs a divergent schema, and continuing would
//! silently fork the cluster state. Callers must stop the replica on
//! [`FsmError`], never skip the entry.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::cluster::shard_map::ShardMap;

pub const ENTRY_SHARD_MAP_UPDATE: u8 = 1;
pub const ENTRY_MEMBER_JOIN: u8 = 2;
pub const ENTRY_MEMBER_LEAVE: u8 = 3;
pub const ENTRY_CONFIG_CHANGE: u8 = 4;

/// Wire envelope for one replicated log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub entry_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMapUpdate {
    pub shard_id: u32,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberJoin {
    pub node_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLeave {
    pub node_id: String,
}

/// Reserved for cluster-wide settings changes distributed via the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    pub value: String,
}

impl LogEntry {
    pub fn shard_map_update(update: &ShardMapUpdate) -> Vec<u8> {
        Self::encode(ENTRY_SHARD_MAP_UPDATE, update)
    }

    pub fn member_join(join: &MemberJoin) -> Vec<u8> {
        Self::encode(ENTRY_MEMBER_JOIN, join)
    }

    pub fn member_leave(leave: &MemberLeave) -> Vec<u8> {
        Self::encode(ENTRY_MEMBER_LEAVE, leave)
    }

    pub fn config_change(change: &ConfigChange) -> Vec<u8> {
        Self::encode(ENTRY_CONFIG_CHANGE, change)
    }

    fn encode<T: Serialize>(entry_type: u8, payload: &T) -> Vec<u8> {
        let entry = LogEntry {
            entry_type,
            payload: serde_json::to_vec(payload).expect("log payloads are serializable"),
        };
        serde_json::to_vec(&entry).expect("log envelope is serializable")
    }
}

/// Why an apply was refused. All variants are fatal for the replica.
#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("undecodable log envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("unknown log entry type {0}")]
    UnknownEntryType(u8),
    #[error("undecodable payload for entry type {entry_type}: {source}")]
    MalformedPayload {
        entry_type: u8,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
}

/// One cluster member as recorded in the replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: String,
    pub addr: String,
    pub state: MemberState,
    pub is_leader: bool,
}

/// The full replicated state: authoritative shard map plus membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshState {
    pub shard_map: ShardMap,
    pub members: HashMap<String, Member>,
}

/// The state machine itself. One instance per node, shared between the
/// consensus runtime (applies) and the cluster server (reads).
#[derive(Default)]
pub struct MeshFsm {
    state: RwLock<MeshState>,
}

impl MeshFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one encoded log entry. Deterministic; errors are fatal.
    pub fn apply(&self, entry_bytes: &[u8]) -> Result<(), FsmError> {
        let entry: LogEntry =
            serde_json::from_slice(entry_bytes).map_err(FsmError::MalformedEnvelope)?;

        let mut state = self.state.write().expect("fsm lock poisoned");
        match entry.entry_type {
            ENTRY_SHARD_MAP_UPDATE => {
                let update: ShardMapUpdate = Self::decode(&entry)?;
                state
                    .shard_map
                    .assign_shard(update.shard_id, &update.node_id, &update.replicas);
            }
            ENTRY_MEMBER_JOIN => {
                let join: MemberJoin = Self::decode(&entry)?;
                state.members.insert(
                    join.node_id.clone(),
                    Member {
                        node_id: join.node_id,
                        addr: join.addr,
                        state: MemberState::Alive,
                        is_leader: false,
                    },
                );
            }
            ENTRY_MEMBER_LEAVE => {
                let leave: MemberLeave = Self::decode(&entry)?;
                state.members.remove(&leave.node_id);
            }
            ENTRY_CONFIG_CHANGE => {
                // Decoded for schema validation; config distribution has
                // no observable FSM effect yet.
                let _change: ConfigChange = Self::decode(&entry)?;
            }
            other => return Err(FsmError::UnknownEntryType(other)),
        }
        Ok(())
    }

    fn decode<T: for<'de> Deserialize<'de>>(entry: &LogEntry) -> Result<T, FsmError> {
        serde_json::from_slice(&entry.payload).map_err(|source| FsmError::MalformedPayload {
            entry_type: entry.entry_type,
            source,
        })
    }

    /// Deep copy of the current state.
    pub fn snapshot(&self) -> MeshState {
        self.state.read().expect("fsm lock poisoned").clone()
    }

    /// Replace the full state from a snapshot.
    pub fn restore(&self, snapshot: MeshState) {
        *self.state.write().expect("fsm lock poisoned") = snapshot;
    }

    /// Serialized snapshot for the consensus snapshot stream.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.snapshot()).expect("fsm state is serializable")
    }

    pub fn restore_bytes(&self, bytes: &[u8]) -> Result<(), serde_json::Error> {
        let snapshot: MeshState = serde_json::from_slice(bytes)?;
        self.restore(snapshot);
        Ok(())
    }

    pub fn shard_map(&self) -> ShardMap {
        self.state.read().expect("fsm lock poisoned").shard_map.clone()
    }

    pub fn members(&self) -> HashMap<String, Member> {
        self.state.read().expect("fsm lock poisoned").members.clone()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().expect("fsm lock poisoned").members.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(fsm: &MeshFsm, node: &str, addr: &str) {
        fsm.apply(&LogEntry::member_join(&MemberJoin {
            node_id: node.into(),
            addr: addr.into(),
        }))
        .unwrap();
    }

    #[test]
    fn member_join_records_an_alive_follower() {
        let fsm = MeshFsm::new();
        join(&fsm, "node-a", "10.0.0.1:7000");

        let members = fsm.members();
        let member = &members["node-a"];
        assert_eq!(member.state, MemberState::Alive);
        assert!(!member.is_leader);
        assert_eq!(member.addr, "10.0.0.1:7000");
    }

    #[test]
    fn join_then_leave_restores_pre_join_membership() {
        let fsm = MeshFsm::new();
        join(&fsm, "node-a", "10.0.0.1:7000");
        let before = fsm.members();

        join(&fsm, "node-b", "10.0.0.2:7000");
        fsm.apply(&LogEntry::member_leave(&MemberLeave {
            node_id: "node-b".into(),
        }))
        .unwrap();

        assert_eq!(fsm.members(), before);
    }

    #[test]
    fn shard_map_update_assigns_and_bumps_version() {
        let fsm = MeshFsm::new();
        let v0 = fsm.shard_map().version();

        fsm.apply(&LogEntry::shard_map_update(&ShardMapUpdate {
            shard_id: 5,
            node_id: "node-a".into(),
            replicas: vec!["node-b".into()],
        }))
        .unwrap();

        let map = fsm.shard_map();
        assert_eq!(map.owner(5), Some("node-a"));
        assert_eq!(map.replicas(5), ["node-b".to_owned()]);
        assert_eq!(map.version(), v0 + 1);
    }

    #[test]
    fn unknown_entry_type_is_fatal() {
        let fsm = MeshFsm::new();
        let bogus = serde_json::to_vec(&LogEntry {
            entry_type: 9,
            payload: b"{}".to_vec(),
        })
        .unwrap();

        match fsm.apply(&bogus) {
            Err(FsmError::UnknownEntryType(9)) => {}
            other => panic!("expected UnknownEntryType, got {other:?}"),
        }
    }

    #[test]
    fn undecodable_payload_on_known_type_is_fatal() {
        let fsm = MeshFsm::new();
        let bogus = serde_json::to_vec(&LogEntry {
            entry_type: ENTRY_MEMBER_JOIN,
            payload: b"not json".to_vec(),
        })
        .unwrap();

        assert!(matches!(
            fsm.apply(&bogus),
            Err(FsmError::MalformedPayload { entry_type: 2, .. })
        ));
    }

    #[test]
    fn malformed_envelope_is_fatal() {
        let fsm = MeshFsm::new();
        assert!(matches!(
            fsm.apply(b"\x00\x01garbage"),
            Err(FsmError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn snapshot_restore_is_identity() {
        let fsm = MeshFsm::new();
        join(&fsm, "node-a", "10.0.0.1:7000");
        fsm.apply(&LogEntry::shard_map_update(&ShardMapUpdate {
            shard_id: 1,
            node_id: "node-a".into(),
            replicas: vec![],
        }))
        .unwrap();

        let bytes = fsm.snapshot_bytes();
        let other = MeshFsm::new();
        other.restore_bytes(&bytes).unwrap();

        assert_eq!(other.snapshot(), fsm.snapshot());
    }

    #[test]
    fn config_change_entries_apply_cleanly() {
        let fsm = MeshFsm::new();
        fsm.apply(&LogEntry::config_change(&ConfigChange {
            key: "replication_factor".into(),
            value: "3".into(),
        }))
        .unwrap();
    }
}
