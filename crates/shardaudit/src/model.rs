//! Core data model: identifiers, RPC payload types, cluster configuration,
//! team and server-list value codecs, and process-class fitness.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::keys::{Key, KeyRange, CONFIG_PREFIX};
use crate::rpc::ReplicaInterface;

/// Stable identity for replicas, transaction logs, and on-disk stores.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Uid(pub u64);

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub type ReplicaId = Uid;

/// Network endpoint of a storage replica or worker process.
pub type ReplicaAddress = SocketAddr;

/// Monotone read version from the transactional client. A range read at one
/// version observes a single snapshot.
pub type Version = i64;

/// One key/value row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn expected_size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// Paginated range read request served by storage replicas.
#[derive(Debug, Clone)]
pub struct GetKeyValuesRequest {
    pub begin: Key,
    pub end: Key,
    pub limit: usize,
    pub limit_bytes: usize,
    pub version: Version,
}

/// Range read reply; `more` signals the page was cut short by a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetKeyValuesReply {
    pub data: Vec<KeyValue>,
    pub more: bool,
}

impl GetKeyValuesReply {
    /// Serialized payload size used for read-rate accounting.
    pub fn expected_size(&self) -> usize {
        self.data.iter().map(KeyValue::expected_size).sum()
    }
}

/// Size metrics reported by a storage replica for one key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetrics {
    pub bytes: i64,
}

/// Key-value store engine tag reported by replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    Memory,
    Ssd,
}

impl std::fmt::Display for StoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreType::Memory => write!(f, "memory"),
            StoreType::Ssd => write!(f, "ssd"),
        }
    }
}

/// One shard of the directory: its range and the replica teams serving it.
/// `dest` is non-empty only while the shard is being relocated.
#[derive(Debug, Clone)]
pub struct ShardAssignment {
    pub range: KeyRange,
    pub source: Vec<ReplicaInterface>,
    pub dest: Vec<ReplicaInterface>,
}

/// Recognized cluster configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub storage_team_size: usize,
    pub storage_server_store_type: StoreType,
    pub excluded: BTreeSet<ReplicaAddress>,
}

impl Default for ClusterConfiguration {
    fn default() -> Self {
        Self {
            storage_team_size: 1,
            storage_server_store_type: StoreType::Ssd,
            excluded: BTreeSet::new(),
        }
    }
}

impl ClusterConfiguration {
    /// Apply one raw configuration row. Unrecognized options are ignored so
    /// newer clusters stay auditable.
    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        let Some(option) = key.strip_prefix(CONFIG_PREFIX) else {
            return;
        };
        let value = String::from_utf8_lossy(value);
        if option == b"storage_team_size".as_slice() {
            if let Ok(n) = value.trim().parse::<usize>() {
                self.storage_team_size = n;
            }
        } else if option == b"storage_engine".as_slice() {
            match value.trim() {
                "memory" => self.storage_server_store_type = StoreType::Memory,
                "ssd" => self.storage_server_store_type = StoreType::Ssd,
                _ => {}
            }
        } else if let Some(addr) = option.strip_prefix(b"excluded/".as_slice()) {
            if let Ok(addr) = String::from_utf8_lossy(addr).parse::<SocketAddr>() {
                self.excluded.insert(addr);
            }
        }
    }

    pub fn is_excluded(&self, addr: &ReplicaAddress) -> bool {
        self.excluded.contains(addr)
    }
}

#[derive(Serialize, Deserialize)]
struct TeamValue {
    src: Vec<ReplicaId>,
    dest: Vec<ReplicaId>,
}

/// Encode a shard directory value naming the current and (optional)
/// destination teams.
pub fn encode_key_servers_value(src: &[ReplicaId], dest: &[ReplicaId]) -> Vec<u8> {
    serde_json::to_vec(&TeamValue {
        src: src.to_vec(),
        dest: dest.to_vec(),
    })
    .expect("team value serializes")
}

/// Decode a shard directory value. The empty value (terminating range marker)
/// decodes to empty teams.
pub fn decode_key_servers_value(
    value: &[u8],
) -> Result<(Vec<ReplicaId>, Vec<ReplicaId>), ClusterError> {
    if value.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }
    let team: TeamValue = serde_json::from_slice(value)
        .map_err(|err| ClusterError::Decode(format!("key servers value: {err}")))?;
    Ok((team.src, team.dest))
}

/// Registration record stored under `\xff/serverList/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDescriptor {
    pub id: ReplicaId,
    pub address: ReplicaAddress,
}

pub fn encode_server_list_value(descriptor: &ReplicaDescriptor) -> Vec<u8> {
    serde_json::to_vec(descriptor).expect("server list value serializes")
}

pub fn decode_server_list_value(value: &[u8]) -> Result<ReplicaDescriptor, ClusterError> {
    serde_json::from_slice(value)
        .map_err(|err| ClusterError::Decode(format!("server list value: {err}")))
}

/// Permitted size window for one shard, derived from the database size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSizeBounds {
    pub min_bytes: i64,
    pub max_bytes: i64,
    pub permitted_error_bytes: i64,
}

/// Declared class of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessClass {
    Unset,
    Storage,
    Transaction,
    Resolution,
    Proxy,
    Master,
    Stateless,
    Tester,
}

/// Cluster roles whose placement the auditor validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterRole {
    ClusterController,
    Master,
    Proxy,
    Resolver,
    TLog,
    Storage,
}

/// Ordinal rank of how well a class can serve a role; lower is better.
/// `ExcludeFit` is the fallback tier used when only excluded processes can
/// ever host a role; `NeverAssign` is the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Fitness {
    BestFit,
    GoodFit,
    UnsetFit,
    WorstFit,
    ExcludeFit,
    NeverAssign,
}

impl ProcessClass {
    /// Rank this class for a cluster role.
    pub fn machine_class_fitness(self, role: ClusterRole) -> Fitness {
        use ClusterRole as Role;
        use Fitness::*;
        use ProcessClass as Class;

        if self == Class::Tester {
            return NeverAssign;
        }
        match role {
            Role::ClusterController => match self {
                Class::Stateless => BestFit,
                Class::Master => GoodFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
            Role::Master => match self {
                Class::Master => BestFit,
                Class::Stateless => GoodFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
            Role::Proxy => match self {
                Class::Proxy => BestFit,
                Class::Stateless => GoodFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
            Role::Resolver => match self {
                Class::Resolution => BestFit,
                Class::Stateless => GoodFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
            Role::TLog => match self {
                Class::Transaction => BestFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
            Role::Storage => match self {
                Class::Storage => BestFit,
                Class::Unset => UnsetFit,
                _ => WorstFit,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::with_prefix;

    #[test]
    fn configuration_parses_recognized_rows() {
        let mut config = ClusterConfiguration::default();
        config.set(&with_prefix(CONFIG_PREFIX, b"storage_team_size"), b"3");
        config.set(&with_prefix(CONFIG_PREFIX, b"storage_engine"), b"memory");
        config.set(
            &with_prefix(CONFIG_PREFIX, b"excluded/10.0.0.7:4500"),
            b"",
        );
        config.set(&with_prefix(CONFIG_PREFIX, b"unknown_option"), b"x");

        assert_eq!(config.storage_team_size, 3);
        assert_eq!(config.storage_server_store_type, StoreType::Memory);
        assert!(config.is_excluded(&"10.0.0.7:4500".parse().unwrap()));
        assert!(!config.is_excluded(&"10.0.0.8:4500".parse().unwrap()));
    }

    #[test]
    fn team_value_round_trips_and_empty_decodes_to_empty_teams() {
        let src = vec![Uid(1), Uid(2)];
        let dest = vec![Uid(9)];
        let encoded = encode_key_servers_value(&src, &dest);
        assert_eq!(decode_key_servers_value(&encoded).unwrap(), (src, dest));
        assert_eq!(
            decode_key_servers_value(b"").unwrap(),
            (Vec::new(), Vec::new())
        );
    }

    #[test]
    fn fitness_prefers_declared_class_and_bans_testers() {
        assert_eq!(
            ProcessClass::Proxy.machine_class_fitness(ClusterRole::Proxy),
            Fitness::BestFit
        );
        assert!(
            ProcessClass::Stateless.machine_class_fitness(ClusterRole::Proxy)
                < ProcessClass::Storage.machine_class_fitness(ClusterRole::Proxy)
        );
        assert_eq!(
            ProcessClass::Tester.machine_class_fitness(ClusterRole::Master),
            Fitness::NeverAssign
        );
        assert!(Fitness::BestFit < Fitness::NeverAssign);
    }
}
