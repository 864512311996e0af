pub mod listener;
pub mod role;
pub mod secret;
pub mod security;

use std::{
    fmt::{self, Formatter},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::model::role::{KafkaRole, ProcessRoles};

pub const APP_NAME: &str = "kafka";
pub const OPERATOR_NAME: &str = "kafka-reconciler";
// config files
pub const SERVER_PROPERTIES_FILE: &str = "server.properties";
pub const CLIENT_PROPERTIES_FILE: &str = "client.properties";
pub const KAFKA_ENV_FILE: &str = "kafka.env";
pub const KAFKA_START_SCRIPT: &str = "start-kafka.sh";
pub const KEYSTORE_PEM_FILE: &str = "keystore.pem";
pub const TRUSTSTORE_PEM_FILE: &str = "truststore.pem";
pub const CLIENT_TRUSTSTORE_PEM_FILE: &str = "client-truststore.pem";
// directories
pub const DEFAULT_KAFKA_HOME: &str = "/opt/kafka";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/kafka";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/kafka";
pub const DEFAULT_LOG_DIR: &str = "/var/log/kafka";

/// Stable cluster member id, used verbatim as the Kafka `node.id`.
///
/// Ids are handed out once and never reused for the lifetime of a cluster, see
/// [`crate::peer_directory::PeerDirectory::remove`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct MemberId(pub u32);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MemberHealth {
    #[default]
    Starting,
    Healthy,
    Degraded,
    Unreachable,
}

impl MemberHealth {
    /// Whether the member can currently take part in a quorum.
    pub fn is_live(&self) -> bool {
        !matches!(self, MemberHealth::Unreachable)
    }
}

/// A single Kafka process taking part in the cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMember {
    pub id: MemberId,
    pub address: MemberAddress,
    pub roles: ProcessRoles,
    #[serde(default)]
    pub health: MemberHealth,
    /// Incremented every time a configuration change has been applied to this member.
    #[serde(default)]
    pub generation: u64,
}

impl ClusterMember {
    pub fn new(id: MemberId, address: MemberAddress, roles: ProcessRoles) -> Self {
        Self {
            id,
            address,
            roles,
            health: MemberHealth::Starting,
            generation: 0,
        }
    }

    pub fn has_role(&self, role: &KafkaRole) -> bool {
        self.roles.contains(role)
    }

    /// Build the KRaft initial controller string used when formatting the storage directories.
    /// See: <https://kafka.apache.org/40/documentation.html#kraft_storage_voters>
    /// Example: 0@controller-0:9097:0000000000-00000000000
    ///   * 0 is the node id
    ///   * 0000000000-00000000000 is the directory id, derived from the node id so that a
    ///     re-format produces the same voter set
    ///   * controller-0 is the member's host,
    ///   * 9097 is the controller listener port.
    pub fn as_initial_controller(&self, controller_port: u16) -> String {
        format!(
            "{node_id}@{host}:{controller_port}:0000000000-{node_id:0>11}",
            node_id = self.id,
            host = self.address.host,
        )
    }

    pub fn as_bootstrap_server(&self, port: u16) -> String {
        format!("{host}:{port}", host = self.address.host)
    }
}

/// Wall clock time in milliseconds since the unix epoch.
///
/// Lock heartbeats are compared across machines, so this is deliberately not a monotonic
/// [`std::time::Instant`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_millis() as u64)
                .unwrap_or_default(),
        )
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }
}
