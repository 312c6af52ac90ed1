//! Configuration for the tokmesh node.
//!
//! Loaded through figment from an optional TOML file merged with
//! `TOKMESH_`-prefixed environment variables. Duration fields accept
//! either bare numbers (seconds) or strings with units, from "1500ms"
//! up to "1d".

use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::auth::AuthServiceConfig;
use crate::cluster::{ClusterConfig, RebalanceConfig};
use crate::session::SessionServiceConfig;
use crate::token::TokenServiceConfig;

/// Main node configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Level for this crate's own log target; everything else stays at
    /// warn. One of "trace", "debug", "info", "warn", "error".
    /// `RUST_LOG` overrides the whole filter when set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Stable identity of this node in the cluster.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Consensus transport listen address.
    #[serde(default = "default_raft_addr")]
    pub raft_addr: String,
    /// Gossip/membership listen address.
    #[serde(default = "default_gossip_addr")]
    pub gossip_addr: String,
    /// Cluster identity gate for joins; empty disables the check.
    #[serde(default)]
    pub cluster_id: String,
    /// Where a persistent consensus runtime keeps its state.
    #[serde(default = "default_data_dir")]
    pub data_dir: std::path::PathBuf,
    /// Start as the sole voter of a fresh cluster. All other nodes join
    /// via `seeds`.
    #[serde(default = "default_true")]
    pub bootstrap: bool,
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
    /// Grace the supervisor gives workers on shutdown before aborting
    /// the stragglers.
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
    /// Cadence of the expired-session GC sweep.
    #[serde(
        default = "default_gc_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub gc_interval: Duration,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub tokens: TokensSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub rebalance: RebalanceSection,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_raft_addr() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_gossip_addr() -> String {
    "127.0.0.1:7946".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./data")
}

fn default_replication_factor() -> u32 {
    1
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

/// Session service tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(
        default = "default_session_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub default_ttl: Duration,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_per_user: u64,
    #[serde(default = "default_revoke_cap")]
    pub revoke_by_user_cap: u64,
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_max_sessions_per_user() -> u64 {
    50
}

fn default_revoke_cap() -> u64 {
    1000
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            default_ttl: default_session_ttl(),
            max_per_user: default_max_sessions_per_user(),
            revoke_by_user_cap: default_revoke_cap(),
        }
    }
}

impl From<&SessionsSection> for SessionServiceConfig {
    fn from(section: &SessionsSection) -> Self {
        Self {
            default_ttl: section.default_ttl,
            max_sessions_per_user: section.max_per_user,
            revoke_by_user_cap: section.revoke_by_user_cap,
        }
    }
}

/// Token validation and replay-defense tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct TokensSection {
    /// Accepted distance between request timestamps and the server clock.
    #[serde(
        default = "default_nonce_window",
        deserialize_with = "deserialize_duration"
    )]
    pub nonce_window: Duration,
    #[serde(default = "default_nonce_capacity")]
    pub nonce_capacity: usize,
    #[serde(
        default = "default_nonce_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub nonce_ttl: Duration,
}

fn default_nonce_window() -> Duration {
    Duration::from_secs(30)
}

fn default_nonce_capacity() -> usize {
    100_000
}

fn default_nonce_ttl() -> Duration {
    Duration::from_secs(60)
}

impl Default for TokensSection {
    fn default() -> Self {
        Self {
            nonce_window: default_nonce_window(),
            nonce_capacity: default_nonce_capacity(),
            nonce_ttl: default_nonce_ttl(),
        }
    }
}

impl From<&TokensSection> for TokenServiceConfig {
    fn from(section: &TokensSection) -> Self {
        Self {
            nonce_window: section.nonce_window,
            nonce_capacity: section.nonce_capacity,
            nonce_ttl: section.nonce_ttl,
        }
    }
}

/// API-key authentication tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_key_cache_capacity")]
    pub key_cache_capacity: usize,
    #[serde(
        default = "default_key_cache_ttl",
        deserialize_with = "deserialize_duration"
    )]
    pub key_cache_ttl: Duration,
    /// How long a rotated-out secret keeps working.
    #[serde(
        default = "default_rotation_grace",
        deserialize_with = "deserialize_duration"
    )]
    pub rotation_grace: Duration,
    /// Process-level IP allowlist applied to every key (IPs or CIDRs).
    #[serde(default)]
    pub global_ip_allowlist: Vec<String>,
}

fn default_key_cache_capacity() -> usize {
    10_000
}

fn default_key_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_rotation_grace() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            key_cache_capacity: default_key_cache_capacity(),
            key_cache_ttl: default_key_cache_ttl(),
            rotation_grace: default_rotation_grace(),
            global_ip_allowlist: vec![],
        }
    }
}

impl From<&AuthSection> for AuthServiceConfig {
    fn from(section: &AuthSection) -> Self {
        Self {
            cache_capacity: section.key_cache_capacity,
            cache_ttl: section.key_cache_ttl,
            rotation_grace: section.rotation_grace,
            global_ip_allowlist: section.global_ip_allowlist.clone(),
        }
    }
}

/// Shard migration tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_rate")]
    pub max_rate_bytes_per_sec: u32,
    /// Sessions closer to expiry than this are left behind.
    #[serde(default = "default_min_ttl", deserialize_with = "deserialize_duration")]
    pub min_ttl: Duration,
    #[serde(default = "default_concurrent_shards")]
    pub concurrent_shards: usize,
    #[serde(
        default = "default_streaming_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub streaming_timeout: Duration,
}

fn default_max_rate() -> u32 {
    8 * 1024 * 1024
}

fn default_min_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_concurrent_shards() -> usize {
    4
}

fn default_streaming_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for RebalanceSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rate_bytes_per_sec: default_max_rate(),
            min_ttl: default_min_ttl(),
            concurrent_shards: default_concurrent_shards(),
            streaming_timeout: default_streaming_timeout(),
        }
    }
}

impl From<&RebalanceSection> for RebalanceConfig {
    fn from(section: &RebalanceSection) -> Self {
        Self {
            max_rate_bytes_per_sec: section.max_rate_bytes_per_sec,
            min_ttl: section.min_ttl,
            concurrent_shards: section.concurrent_shards,
            streaming_timeout: section.streaming_timeout,
        }
    }
}

impl Config {
    /// Cluster server config derived from the top-level sections.
    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self.node_id.clone(),
            raft_addr: self.raft_addr.clone(),
            gossip_addr: self.gossip_addr.clone(),
            cluster_id: self.cluster_id.clone(),
            data_dir: self.data_dir.clone(),
            bootstrap: self.bootstrap,
            seeds: self.seeds.clone(),
            replication_factor: self.replication_factor,
            rebalance_settle_delay: Duration::from_secs(5),
            wait_for_leader: true,
        }
    }
}

/// Unit table for duration strings. TokMesh settings span four orders
/// of magnitude — millisecond nonce windows up to day-long session TTLs
/// and rotation grace periods — so ms through d are all accepted, with
/// bare numbers meaning seconds. No fractions, exponents, or infinity.
const DURATION_UNITS: DurationParser<'static> = DurationParser::builder()
    .time_units(&[
        TimeUnit::MilliSecond,
        TimeUnit::Second,
        TimeUnit::Minute,
        TimeUnit::Hour,
        TimeUnit::Day,
    ])
    .default_unit(TimeUnit::Second)
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .build();

/// Accepts `30`, `"90s"`, `"1500ms"`, `"2m"`, `"12h"`, or `"1d"`.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => DURATION_UNITS
            .parse(&text)
            .map_err(|e| serde::de::Error::custom(format!("bad duration '{text}': {e}")))?
            .try_into()
            .map_err(|e| {
                serde::de::Error::custom(format!("duration '{text}' out of range: {e}"))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Figment;
    use figment::providers::Serialized;

    #[test]
    fn empty_figment_yields_all_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(serde_json::json!({})))
            .extract()
            .unwrap();

        assert_eq!(config.node_id, "node-1");
        assert!(config.bootstrap);
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.sessions.max_per_user, 50);
        assert_eq!(config.tokens.nonce_window, Duration::from_secs(30));
        assert_eq!(config.auth.key_cache_capacity, 10_000);
        assert_eq!(config.rebalance.streaming_timeout, Duration::from_secs(600));
    }

    #[test]
    fn durations_parse_from_numbers_and_strings() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(serde_json::json!({
                "shutdown_timeout": 3,
                "gc_interval": "90s",
                "sessions": { "default_ttl": "2m" },
                "tokens": { "nonce_window": "1500ms" },
                "auth": { "rotation_grace": "1d" },
            })))
            .extract()
            .unwrap();

        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.gc_interval, Duration::from_secs(90));
        assert_eq!(config.sessions.default_ttl, Duration::from_secs(120));
        assert_eq!(config.tokens.nonce_window, Duration::from_millis(1500));
        assert_eq!(config.auth.rotation_grace, Duration::from_secs(86_400));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result: Result<Config, _> = Figment::new()
            .merge(Serialized::defaults(serde_json::json!({
                "shutdown_timeout": -5,
            })))
            .extract();
        assert!(result.is_err());
    }

    #[test]
    fn section_conversions_carry_values_through() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(serde_json::json!({
                "sessions": { "max_per_user": 10 },
                "rebalance": { "concurrent_shards": 2 },
            })))
            .extract()
            .unwrap();

        let sessions = SessionServiceConfig::from(&config.sessions);
        assert_eq!(sessions.max_sessions_per_user, 10);

        let rebalance = RebalanceConfig::from(&config.rebalance);
        assert_eq!(rebalance.concurrent_shards, 2);
    }
}
