//! Renders the on-disk configuration of one Kafka process.
//!
//! [`render`] is a pure function of its inputs. Writing the artifact is left to the
//! [`crate::external::ProcessSupervisor`].
pub mod command;
pub mod jvm;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Formatter},
};

use product_config::writer::{to_java_properties_string, PropertiesWriterError};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::{
    model::{
        listener::{
            controller_listener, get_kafka_listener_config, KafkaListenerError, KafkaListenerName,
            ListenerSpec,
        },
        role::{KafkaRole, ProcessRoles},
        secret::{
            Secret, SecretKind, SecretState, ADMIN_PASSWORD_KEY, CA_CHAIN_KEY, CERTIFICATE_KEY,
            PRIVATE_KEY_KEY, SYNC_PASSWORD_KEY, TRUSTSTORE_KEY,
        },
        security::{InternalUsers, KafkaSecurity, RelationData},
        ClusterMember, MemberId, CLIENT_PROPERTIES_FILE, CLIENT_TRUSTSTORE_PEM_FILE,
        KAFKA_ENV_FILE, KAFKA_START_SCRIPT, KEYSTORE_PEM_FILE, SERVER_PROPERTIES_FILE,
        TRUSTSTORE_PEM_FILE,
    },
    operations::graceful_shutdown::graceful_shutdown_config_properties,
    operator_config::{BrokerSettings, Directories},
    product_logging::{create_log4j_config, KAFKA_LOG_FILE, LOG4J_CONFIG_FILE},
};

// server.properties keys
pub const KAFKA_NODE_ID: &str = "node.id";
pub const KAFKA_PROCESS_ROLES: &str = "process.roles";
pub const KAFKA_LISTENERS: &str = "listeners";
pub const KAFKA_ADVERTISED_LISTENERS: &str = "advertised.listeners";
pub const KAFKA_LISTENER_SECURITY_PROTOCOL_MAP: &str = "listener.security.protocol.map";
pub const KAFKA_CONTROLLER_LISTENER_NAMES: &str = "controller.listener.names";
pub const KAFKA_CONTROLLER_QUORUM_BOOTSTRAP_SERVERS: &str = "controller.quorum.bootstrap.servers";
pub const KAFKA_LOG_DIRS: &str = "log.dirs";
pub const KAFKA_NUM_PARTITIONS: &str = "num.partitions";
pub const KAFKA_DEFAULT_REPLICATION_FACTOR: &str = "default.replication.factor";
pub const KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR: &str = "offsets.topic.replication.factor";
pub const KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR: &str =
    "transaction.state.log.replication.factor";
pub const KAFKA_TRANSACTION_STATE_LOG_MIN_ISR: &str = "transaction.state.log.min.isr";
pub const KAFKA_MIN_INSYNC_REPLICAS: &str = "min.insync.replicas";
pub const KAFKA_AUTO_CREATE_TOPICS_ENABLE: &str = "auto.create.topics.enable";

const MAX_REPLICATION_FACTOR: usize = 3;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("listeners {first} and {second} are both bound to port {port}"))]
    DuplicateListenerPort {
        port: u16,
        first: KafkaListenerName,
        second: KafkaListenerName,
    },

    #[snafu(display("invalid listener set"))]
    InvalidListeners { source: KafkaListenerError },

    #[snafu(display("secret {kind} version {version} has been retired and must not be referenced"))]
    RetiredSecret { kind: SecretKind, version: u64 },

    #[snafu(display("the resolved listeners need a {kind} secret"))]
    MissingSecret { kind: SecretKind },

    #[snafu(display("secret {kind} has no {field:?} entry"))]
    IncompleteSecret { kind: SecretKind, field: String },

    #[snafu(display("no member has the controller role"))]
    NoControllers,

    #[snafu(display("member {member} is not part of the rendered member list"))]
    UnknownMember { member: MemberId },

    #[snafu(display("failed to serialize {file}"))]
    SerializeProperties {
        source: PropertiesWriterError,
        file: String,
    },
}

impl Error {
    /// Structural conflicts in the inputs. Retrying with the same inputs cannot succeed.
    pub fn is_invalid_configuration(&self) -> bool {
        !matches!(self, Error::SerializeProperties { .. })
    }
}

/// Which member is being rendered and the roles it runs with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoleAssignment {
    pub member: MemberId,
    pub roles: ProcessRoles,
    pub advertised_host: String,
}

/// The secret versions a member renders its configuration with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedSecrets {
    pub internal_users: Option<Secret>,
    pub keypair: Option<Secret>,
    pub truststore: Option<Secret>,
}

impl ResolvedSecrets {
    pub fn iter(&self) -> impl Iterator<Item = &Secret> {
        [&self.internal_users, &self.keypair, &self.truststore]
            .into_iter()
            .flatten()
    }
}

pub struct RenderInputs<'a> {
    pub cluster_id: &'a str,
    pub members: &'a [ClusterMember],
    pub listeners: &'a BTreeSet<ListenerSpec>,
    pub role_assignment: &'a RoleAssignment,
    pub secrets: &'a ResolvedSecrets,
    pub relation_data: &'a RelationData,
    pub settings: &'a BrokerSettings,
    pub directories: &'a Directories,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub contents: String,
    /// Contains credentials and must only be readable by the Kafka user.
    pub sensitive: bool,
}

/// Everything written to the Kafka configuration directory.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigArtifact {
    pub files: BTreeMap<String, ConfigFile>,
}

impl ConfigArtifact {
    fn add(&mut self, name: &str, contents: String, sensitive: bool) {
        self.files
            .insert(name.to_string(), ConfigFile { contents, sensitive });
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(|file| file.contents.as_str())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Fnv64::default();
        for (name, file) in &self.files {
            hasher.write(name.as_bytes());
            hasher.write(&[0]);
            hasher.write(file.contents.as_bytes());
            hasher.write(&[0]);
        }
        Fingerprint(format!("{:016x}", hasher.finish()))
    }
}

/// Content hash of a [`ConfigArtifact`], used to tell whether a member runs the desired config.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Simple FNV-1a hash impl
struct Fnv64(u64);

impl Default for Fnv64 {
    fn default() -> Self {
        Self(0xcbf29ce484222325)
    }
}

impl Fnv64 {
    const FNV_PRIME: u64 = 0x100000001b3;

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Render the configuration of the member named in the role assignment.
pub fn render(inputs: &RenderInputs) -> Result<ConfigArtifact, Error> {
    let config_dir = inputs.directories.config.to_string_lossy();
    let security = KafkaSecurity::new(inputs.listeners, inputs.relation_data, &config_dir);

    for secret in inputs.secrets.iter() {
        ensure!(
            secret.state != SecretState::Retired,
            RetiredSecretSnafu {
                kind: secret.key.kind,
                version: secret.version
            }
        );
    }

    let internal_users = inputs
        .secrets
        .internal_users
        .as_ref()
        .context(MissingSecretSnafu {
            kind: SecretKind::InternalUserPassword,
        })?;
    let sync_password = secret_field(internal_users, SYNC_PASSWORD_KEY)?;
    let admin_password = secret_field(internal_users, ADMIN_PASSWORD_KEY)?;
    let users = KafkaSecurity::internal_users(internal_users.version);

    let server_properties = server_properties(inputs, &security, users, sync_password)?;

    let mut artifact = ConfigArtifact::default();
    artifact.add(
        SERVER_PROPERTIES_FILE,
        to_properties(SERVER_PROPERTIES_FILE, &server_properties)?,
        true,
    );
    artifact.add(
        CLIENT_PROPERTIES_FILE,
        to_properties(
            CLIENT_PROPERTIES_FILE,
            &security.client_properties(users, admin_password),
        )?,
        true,
    );

    if security.tls_enabled() {
        let keypair = inputs.secrets.keypair.as_ref().context(MissingSecretSnafu {
            kind: SecretKind::TlsKeypair,
        })?;
        let truststore = inputs
            .secrets
            .truststore
            .as_ref()
            .context(MissingSecretSnafu {
                kind: SecretKind::TlsTruststore,
            })?;

        artifact.add(
            KEYSTORE_PEM_FILE,
            [
                secret_field(keypair, PRIVATE_KEY_KEY)?,
                secret_field(keypair, CERTIFICATE_KEY)?,
                secret_field(keypair, CA_CHAIN_KEY)?,
            ]
            .iter()
            .map(|pem| pem_block(pem))
            .collect(),
            true,
        );
        artifact.add(
            TRUSTSTORE_PEM_FILE,
            pem_block(secret_field(truststore, TRUSTSTORE_KEY)?),
            false,
        );
    }

    if security.has_mtls_listener() {
        artifact.add(
            CLIENT_TRUSTSTORE_PEM_FILE,
            security
                .trusted_client_cas()
                .iter()
                .map(|pem| pem_block(pem))
                .collect(),
            false,
        );
    }

    artifact.add(
        LOG4J_CONFIG_FILE,
        create_log4j_config(
            &inputs.directories.log.to_string_lossy(),
            KAFKA_LOG_FILE,
            &inputs.settings.logging,
        ),
        false,
    );
    artifact.add(KAFKA_ENV_FILE, kafka_env(inputs), false);

    let controllers = controllers(inputs.members);
    artifact.add(
        KAFKA_START_SCRIPT,
        command::kafka_start_script(
            &inputs.directories.kafka_home.to_string_lossy(),
            &config_dir,
            inputs.cluster_id,
            &controllers,
            &[
                (users.sync, sync_password),
                (users.admin, admin_password),
            ],
        ),
        true,
    );

    tracing::debug!(
        member = %inputs.role_assignment.member,
        files = artifact.files.len(),
        fingerprint = %artifact.fingerprint(),
        "rendered config artifact"
    );
    Ok(artifact)
}

/// The `server.properties` of the member named in the role assignment.
pub fn server_properties(
    inputs: &RenderInputs,
    security: &KafkaSecurity,
    users: InternalUsers,
    internal_password: &str,
) -> Result<BTreeMap<String, String>, Error> {
    let assignment = inputs.role_assignment;
    ensure!(
        inputs
            .members
            .iter()
            .any(|member| member.id == assignment.member),
        UnknownMemberSnafu {
            member: assignment.member
        }
    );

    let controllers = controllers(inputs.members);
    ensure!(!controllers.is_empty(), NoControllersSnafu);

    let controller = controller_listener(inputs.listeners);
    let listener_config = get_kafka_listener_config(
        inputs.listeners,
        &controller,
        assignment.roles,
        &assignment.advertised_host,
    )
    .map_err(|error| match error {
        KafkaListenerError::DuplicatePort {
            port,
            first,
            second,
        } => Error::DuplicateListenerPort {
            port,
            first,
            second,
        },
        source => Error::InvalidListeners { source },
    })?;

    let mut config = BTreeMap::new();
    config.insert(KAFKA_NODE_ID.to_string(), assignment.member.to_string());
    config.insert(
        KAFKA_PROCESS_ROLES.to_string(),
        assignment.roles.to_string(),
    );
    config.insert(KAFKA_LISTENERS.to_string(), listener_config.listeners());
    config.insert(
        KAFKA_ADVERTISED_LISTENERS.to_string(),
        listener_config.advertised_listeners(),
    );
    config.insert(
        KAFKA_LISTENER_SECURITY_PROTOCOL_MAP.to_string(),
        listener_config.listener_security_protocol_map(),
    );
    config.insert(
        KAFKA_CONTROLLER_LISTENER_NAMES.to_string(),
        KafkaListenerName::Controller.to_string(),
    );
    config.insert(
        KAFKA_CONTROLLER_QUORUM_BOOTSTRAP_SERVERS.to_string(),
        command::to_bootstrap_servers(&controllers),
    );
    config.insert(
        KAFKA_LOG_DIRS.to_string(),
        inputs.directories.data.to_string_lossy().into_owned(),
    );

    if assignment.roles.contains(&KafkaRole::Broker) {
        config.extend(replication_defaults(inputs.members));
        config.insert(
            KAFKA_NUM_PARTITIONS.to_string(),
            inputs.settings.num_partitions.to_string(),
        );
        config.insert(
            KAFKA_AUTO_CREATE_TOPICS_ENABLE.to_string(),
            "false".to_string(),
        );
        config.extend(graceful_shutdown_config_properties());
    }

    config.extend(security.config_settings(
        assignment.roles,
        &controller,
        users,
        internal_password,
    ));
    config.extend(inputs.settings.config_overrides.clone());

    Ok(config)
}

/// Replication defaults derived from the number of brokers, see [`MAX_REPLICATION_FACTOR`].
pub fn replication_defaults(members: &[ClusterMember]) -> BTreeMap<String, String> {
    let brokers = members
        .iter()
        .filter(|member| member.has_role(&KafkaRole::Broker))
        .count();
    let replication_factor = brokers.clamp(1, MAX_REPLICATION_FACTOR);
    let min_insync = replication_factor.saturating_sub(1).max(1);

    BTreeMap::from([
        (
            KAFKA_DEFAULT_REPLICATION_FACTOR.to_string(),
            replication_factor.to_string(),
        ),
        (
            KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR.to_string(),
            replication_factor.to_string(),
        ),
        (
            KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR.to_string(),
            replication_factor.to_string(),
        ),
        (
            KAFKA_TRANSACTION_STATE_LOG_MIN_ISR.to_string(),
            min_insync.to_string(),
        ),
        (KAFKA_MIN_INSYNC_REPLICAS.to_string(), min_insync.to_string()),
    ])
}

fn controllers(members: &[ClusterMember]) -> Vec<&ClusterMember> {
    members
        .iter()
        .filter(|member| member.has_role(&KafkaRole::Controller))
        .collect()
}

fn kafka_env(inputs: &RenderInputs) -> String {
    let config_dir = inputs.directories.config.to_string_lossy();
    [
        (
            "KAFKA_HEAP_OPTS",
            jvm::construct_heap_jvm_args(inputs.settings),
        ),
        ("KAFKA_OPTS", jvm::construct_non_heap_jvm_args(inputs.settings)),
        (
            "KAFKA_LOG4J_OPTS",
            format!("-Dlog4j.configuration=file:{config_dir}/{LOG4J_CONFIG_FILE}"),
        ),
        (
            "LOG_DIR",
            inputs.directories.log.to_string_lossy().into_owned(),
        ),
    ]
    .iter()
    .map(|(name, value)| format!("{name}=\"{value}\"\n"))
    .collect()
}

fn secret_field<'a>(secret: &'a Secret, field: &str) -> Result<&'a str, Error> {
    secret.get(field).context(IncompleteSecretSnafu {
        kind: secret.key.kind,
        field,
    })
}

fn pem_block(pem: &str) -> String {
    let pem = pem.trim();
    if pem.is_empty() {
        String::new()
    } else {
        format!("{pem}\n")
    }
}

fn to_properties(file: &str, properties: &BTreeMap<String, String>) -> Result<String, Error> {
    let properties = properties
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect::<Vec<_>>();
    to_java_properties_string(properties.iter().map(|(k, v)| (k, v)))
        .context(SerializePropertiesSnafu { file })
}
