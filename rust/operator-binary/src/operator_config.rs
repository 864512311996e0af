//! Configuration of the reconciler daemon and the dynamic inputs it watches.
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use crate::{
    model::{
        role::ProcessRoles,
        security::{RelationData, RelationKind, Relations},
        MemberAddress, MemberId, DEFAULT_CONFIG_DIR, DEFAULT_DATA_DIR, DEFAULT_KAFKA_HOME,
        DEFAULT_LOG_DIR,
    },
    product_logging::LoggingConfig,
};

pub const DEFAULT_LOCK_TIMEOUT_SECONDS: u64 = 30 * 60;
pub const DEFAULT_HEALTH_CHECK_RETRIES: u32 = 20;
pub const DEFAULT_TICK_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_PRODUCT_VERSION: &str = "3.9.1";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse {}", path.display()))]
    ParseFile {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("cluster id must not be empty"))]
    EmptyClusterId,

    #[snafu(display("{field} must be greater than zero"))]
    ZeroValue { field: &'static str },
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub member: LocalMember,
    /// KRaft cluster id, shared by all members.
    pub cluster_id: String,
    #[serde(default = "default_product_version")]
    pub product_version: String,
    #[serde(default)]
    pub directories: Directories,
    pub inputs_file: PathBuf,
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    #[serde(default = "default_health_check_retries")]
    pub health_check_retries: u32,
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default)]
    pub commands: Commands,
    #[serde(default)]
    pub broker: BrokerSettings,
}

impl OperatorConfig {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        let config: OperatorConfig =
            serde_yaml::from_str(&contents).context(ParseFileSnafu { path })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        ensure!(!self.cluster_id.trim().is_empty(), EmptyClusterIdSnafu);
        ensure!(
            self.lock_timeout_seconds > 0,
            ZeroValueSnafu {
                field: "lockTimeoutSeconds"
            }
        );
        ensure!(
            self.health_check_retries > 0,
            ZeroValueSnafu {
                field: "healthCheckRetries"
            }
        );
        ensure!(
            self.tick_interval_seconds > 0,
            ZeroValueSnafu {
                field: "tickIntervalSeconds"
            }
        );
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds)
    }
}

/// The member this daemon runs on.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMember {
    /// Fixed member id. When unset, an id is allocated from the peer directory on first start
    /// and kept in the local state.
    #[serde(default)]
    pub id: Option<MemberId>,
    pub host: String,
    #[serde(default = "default_client_port")]
    pub port: u16,
    pub roles: ProcessRoles,
}

impl LocalMember {
    pub fn address(&self) -> MemberAddress {
        MemberAddress {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directories {
    /// Shared store, the same directory for every member.
    pub store: PathBuf,
    /// Member-local state: persisted controller state, secret store and certificate exchange.
    pub state: PathBuf,
    /// Where the rendered Kafka configuration is written.
    pub config: PathBuf,
    /// `log.dirs` of the Kafka process.
    pub data: PathBuf,
    /// Kafka's own log files.
    pub log: PathBuf,
    pub kafka_home: PathBuf,
}

impl Default for Directories {
    fn default() -> Self {
        Self {
            store: PathBuf::from("/var/lib/kafka-reconciler/shared"),
            state: PathBuf::from("/var/lib/kafka-reconciler/state"),
            config: PathBuf::from(DEFAULT_CONFIG_DIR),
            data: PathBuf::from(DEFAULT_DATA_DIR),
            log: PathBuf::from(DEFAULT_LOG_DIR),
            kafka_home: PathBuf::from(DEFAULT_KAFKA_HOME),
        }
    }
}

impl Directories {
    pub fn secrets(&self) -> PathBuf {
        self.state.join("secrets")
    }

    pub fn certificates(&self) -> PathBuf {
        self.state.join("certificates")
    }
}

/// Commands run against the local Kafka process and the rebalancer. Each is a program followed
/// by its arguments.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Commands {
    #[serde(default)]
    pub restart: Vec<String>,
    #[serde(default)]
    pub health: Vec<String>,
    #[serde(default)]
    pub stop: Vec<String>,
    /// Receives the target version as its last argument.
    #[serde(default)]
    pub upgrade: Vec<String>,
    /// Receives `<user>=<password>` pairs on stdin.
    #[serde(default)]
    pub update_credentials: Vec<String>,
    /// Receives the users to delete as arguments.
    #[serde(default)]
    pub delete_credentials: Vec<String>,
    /// Receives a subcommand (`propose`, `execute`, `status`, `partitions`) and answers in JSON.
    #[serde(default)]
    pub rebalancer: Vec<String>,
}

/// Kafka tunables.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSettings {
    /// Memory available to the Kafka JVM, the heap gets a fixed share of it.
    #[serde(default)]
    pub memory_limit_mib: Option<u32>,
    #[serde(default)]
    pub jvm_arguments: Vec<String>,
    #[serde(default = "default_num_partitions")]
    pub num_partitions: u32,
    /// Overrides applied on top of the rendered `server.properties`.
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            memory_limit_mib: None,
            jvm_arguments: vec![],
            num_partitions: default_num_partitions(),
            config_overrides: BTreeMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Dynamic state the reconciler reacts to: relations of this cluster and operator intents.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInputs {
    #[serde(default)]
    pub relations: BTreeSet<RelationKind>,
    #[serde(default)]
    pub relation_data: RelationData,
    #[serde(default)]
    pub intents: Intents,
}

impl ControllerInputs {
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents).context(ParseFileSnafu { path }),
            // no inputs yet means no relations and no intents
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(Error::ReadFile {
                source,
                path: path.to_path_buf(),
            }),
        }
    }

    pub fn relations(&self) -> &Relations {
        &self.relations
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Intents {
    /// Evacuate and remove this member.
    #[serde(default)]
    pub scale_down: bool,
    /// Kafka version to upgrade to in place.
    #[serde(default)]
    pub upgrade_to: Option<String>,
    /// Bumping this value rotates the cluster-wide internal user password.
    #[serde(default)]
    pub rotate_password_token: u64,
    /// Bumping this value rotates this member's TLS keypair.
    #[serde(default)]
    pub rotate_certificate_token: u64,
    /// Bumping this value clears a blocked status and retries.
    #[serde(default)]
    pub retry_token: u64,
}

fn default_product_version() -> String {
    DEFAULT_PRODUCT_VERSION.to_string()
}

fn default_lock_timeout_seconds() -> u64 {
    DEFAULT_LOCK_TIMEOUT_SECONDS
}

fn default_health_check_retries() -> u32 {
    DEFAULT_HEALTH_CHECK_RETRIES
}

fn default_tick_interval_seconds() -> u64 {
    DEFAULT_TICK_INTERVAL_SECONDS
}

fn default_client_port() -> u16 {
    9092
}

fn default_num_partitions() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let input = indoc! {"
            member:
              host: kafka-0.internal
              roles: broker,controller
            clusterId: MkU3OEVBNTcwNTJENDM2Qk
            inputsFile: /etc/kafka-reconciler/inputs.yaml
        "};
        let config: OperatorConfig = serde_yaml::from_str(input).expect("illegal test input");
        config.validate().expect("valid config");

        assert_eq!(config.member.id, None);
        assert_eq!(config.member.port, 9092);
        assert_eq!(config.member.roles, ProcessRoles::Combined);
        assert_eq!(config.lock_timeout(), Duration::from_secs(1800));
        assert_eq!(config.health_check_retries, 20);
        assert_eq!(config.tick_interval(), Duration::from_secs(15));
        assert_eq!(config.product_version, "3.9.1");
        assert_eq!(config.directories.config, PathBuf::from("/etc/kafka"));
        assert_eq!(config.broker.num_partitions, 1);
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        let input = indoc! {"
            member:
              id: 3
              host: kafka-3
              roles: controller
            clusterId: abc
            inputsFile: inputs.yaml
            lockTimeoutSeconds: 0
        "};
        let config: OperatorConfig = serde_yaml::from_str(input).expect("illegal test input");

        assert!(matches!(
            config.validate(),
            Err(Error::ZeroValue {
                field: "lockTimeoutSeconds"
            })
        ));
    }

    #[test]
    fn test_inputs_file() {
        let input = indoc! {"
            relations: [certificates, client, oauth]
            relationData:
              oauth:
                jwksEndpoint: https://idp.example.com/jwks
                issuerUrl: https://idp.example.com
            intents:
              scaleDown: true
              upgradeTo: 3.9.2
              rotatePasswordToken: 2
        "};
        let inputs: ControllerInputs = serde_yaml::from_str(input).expect("illegal test input");

        assert_eq!(
            inputs.relations().iter().copied().collect::<Vec<_>>(),
            vec![
                RelationKind::Certificates,
                RelationKind::Client,
                RelationKind::Oauth
            ]
        );
        assert!(inputs.intents.scale_down);
        assert_eq!(inputs.intents.upgrade_to.as_deref(), Some("3.9.2"));
        assert_eq!(inputs.intents.rotate_password_token, 2);
        assert_eq!(inputs.intents.retry_token, 0);
        assert!(inputs.relation_data.oauth.is_some());
    }

    #[test]
    fn test_missing_inputs_file_means_no_relations() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = ControllerInputs::from_file(&dir.path().join("absent.yaml")).unwrap();

        assert_eq!(inputs, ControllerInputs::default());
    }
}
