use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
};

use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};
use strum::{EnumDiscriminants, EnumString};

use crate::model::{
    role::{KafkaRole, ProcessRoles},
    security::{KafkaSecurity, RelationKind, Relations},
};

const LISTENER_LOCAL_ADDRESS: &str = "0.0.0.0";

#[derive(Snafu, Debug, EnumDiscriminants)]
pub enum KafkaListenerError {
    #[snafu(display("listeners {first} and {second} are both bound to port {port}"))]
    DuplicatePort {
        port: u16,
        first: KafkaListenerName,
        second: KafkaListenerName,
    },

    #[snafu(display("listener {name} is declared more than once"))]
    DuplicateName { name: KafkaListenerName },

    #[snafu(display("no internal listener in listener set"))]
    MissingInternalListener,
}

#[derive(
    strum::Display,
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum KafkaListenerProtocol {
    /// Unencrypted and unauthenticated connections
    #[serde(rename = "PLAINTEXT")]
    #[strum(serialize = "PLAINTEXT")]
    Plaintext,

    /// SASL authenticated connections without encryption
    #[serde(rename = "SASL_PLAINTEXT")]
    #[strum(serialize = "SASL_PLAINTEXT")]
    SaslPlaintext,

    /// SASL authenticated connections over TLS
    #[serde(rename = "SASL_SSL")]
    #[strum(serialize = "SASL_SSL")]
    SaslSsl,

    /// TLS connections authenticated by client certificate (mTLS)
    #[serde(rename = "SSL")]
    #[strum(serialize = "SSL")]
    Ssl,
}

impl KafkaListenerProtocol {
    pub fn is_tls(&self) -> bool {
        matches!(
            self,
            KafkaListenerProtocol::SaslSsl | KafkaListenerProtocol::Ssl
        )
    }
}

#[derive(
    strum::Display,
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum KafkaListenerName {
    #[serde(rename = "INTERNAL")]
    #[strum(serialize = "INTERNAL")]
    Internal,
    #[serde(rename = "CLIENT")]
    #[strum(serialize = "CLIENT")]
    Client,
    #[serde(rename = "CLIENT_MTLS")]
    #[strum(serialize = "CLIENT_MTLS")]
    ClientMtls,
    #[serde(rename = "CLIENT_OAUTH")]
    #[strum(serialize = "CLIENT_OAUTH")]
    ClientOauth,
    #[serde(rename = "CONTROLLER")]
    #[strum(serialize = "CONTROLLER")]
    Controller,
}

impl KafkaListenerName {
    fn prefix(&self) -> String {
        format!(
            "listener.name.{listener_name}",
            listener_name = self.to_string().to_lowercase()
        )
    }

    pub fn listener_ssl_keystore_location(&self) -> String {
        format!("{}.ssl.keystore.location", self.prefix())
    }

    pub fn listener_ssl_keystore_type(&self) -> String {
        format!("{}.ssl.keystore.type", self.prefix())
    }

    pub fn listener_ssl_truststore_location(&self) -> String {
        format!("{}.ssl.truststore.location", self.prefix())
    }

    pub fn listener_ssl_truststore_type(&self) -> String {
        format!("{}.ssl.truststore.type", self.prefix())
    }

    pub fn listener_ssl_client_auth(&self) -> String {
        format!("{}.ssl.client.auth", self.prefix())
    }

    pub fn listener_sasl_enabled_mechanisms(&self) -> String {
        format!("{}.sasl.enabled.mechanisms", self.prefix())
    }

    pub fn listener_sasl_jaas_config(&self, mechanism: &SaslMechanism) -> String {
        format!(
            "{}.{mechanism}.sasl.jaas.config",
            self.prefix(),
            mechanism = mechanism.to_string().to_lowercase()
        )
    }

    pub fn listener_sasl_server_callback_handler(&self, mechanism: &SaslMechanism) -> String {
        format!(
            "{}.{mechanism}.sasl.server.callback.handler.class",
            self.prefix(),
            mechanism = mechanism.to_string().to_lowercase()
        )
    }
}

#[derive(
    strum::Display,
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum SaslMechanism {
    #[serde(rename = "SCRAM-SHA-512")]
    #[strum(serialize = "SCRAM-SHA-512")]
    ScramSha512,
    #[serde(rename = "OAUTHBEARER")]
    #[strum(serialize = "OAUTHBEARER")]
    OauthBearer,
    #[serde(rename = "PLAIN")]
    #[strum(serialize = "PLAIN")]
    Plain,
}

#[derive(
    strum::Display,
    Clone,
    Copy,
    Debug,
    Deserialize,
    EnumString,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ListenerScope {
    /// broker-broker and controller-broker traffic
    Internal,
    /// client-facing
    External,
}

/// A network listener the Kafka process must open.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub name: KafkaListenerName,
    pub protocol: KafkaListenerProtocol,
    pub mechanism: Option<SaslMechanism>,
    pub port: u16,
    pub scope: ListenerScope,
    /// Relations that must be present for this listener to be legal.
    pub requires: BTreeSet<RelationKind>,
}

impl ListenerSpec {
    fn new(
        name: KafkaListenerName,
        protocol: KafkaListenerProtocol,
        mechanism: Option<SaslMechanism>,
        port: u16,
        scope: ListenerScope,
        requires: &[RelationKind],
    ) -> Self {
        Self {
            name,
            protocol,
            mechanism,
            port,
            scope,
            requires: requires.iter().copied().collect(),
        }
    }

    /// Whether every relation this listener depends on is present.
    pub fn is_legal(&self, relations: &Relations) -> bool {
        self.requires.is_subset(relations)
    }
}

/// Compute the listeners that must be open for the given set of active relations.
///
/// The internal listener always exists. Client-facing listeners only exist while a qualifying
/// relation is active, so an empty relation set opens nothing but the internal listener.
pub fn resolve(relations: &Relations) -> BTreeSet<ListenerSpec> {
    let mut listeners = BTreeSet::new();
    let certificates = relations.contains(&RelationKind::Certificates);

    // INTERNAL
    listeners.insert(if certificates {
        ListenerSpec::new(
            KafkaListenerName::Internal,
            KafkaListenerProtocol::SaslSsl,
            Some(SaslMechanism::ScramSha512),
            KafkaSecurity::SECURE_INTERNAL_PORT,
            ListenerScope::Internal,
            &[RelationKind::Certificates],
        )
    } else {
        ListenerSpec::new(
            KafkaListenerName::Internal,
            KafkaListenerProtocol::SaslPlaintext,
            Some(SaslMechanism::ScramSha512),
            KafkaSecurity::INTERNAL_PORT,
            ListenerScope::Internal,
            &[],
        )
    });

    // CLIENT
    if relations.contains(&RelationKind::Client) {
        listeners.insert(if certificates {
            ListenerSpec::new(
                KafkaListenerName::Client,
                KafkaListenerProtocol::SaslSsl,
                Some(SaslMechanism::ScramSha512),
                KafkaSecurity::SECURE_CLIENT_PORT,
                ListenerScope::External,
                &[RelationKind::Client, RelationKind::Certificates],
            )
        } else {
            ListenerSpec::new(
                KafkaListenerName::Client,
                KafkaListenerProtocol::SaslPlaintext,
                Some(SaslMechanism::ScramSha512),
                KafkaSecurity::CLIENT_PORT,
                ListenerScope::External,
                &[RelationKind::Client],
            )
        });
    }

    // CLIENT_MTLS: an SSL listener cannot be opened without a member keypair
    if relations.contains(&RelationKind::TrustedCa) && certificates {
        listeners.insert(ListenerSpec::new(
            KafkaListenerName::ClientMtls,
            KafkaListenerProtocol::Ssl,
            None,
            KafkaSecurity::CLIENT_MTLS_PORT,
            ListenerScope::External,
            &[RelationKind::TrustedCa, RelationKind::Certificates],
        ));
    }

    // CLIENT_OAUTH: fails closed without certificates
    if relations.contains(&RelationKind::Oauth) && certificates {
        listeners.insert(ListenerSpec::new(
            KafkaListenerName::ClientOauth,
            KafkaListenerProtocol::SaslSsl,
            Some(SaslMechanism::OauthBearer),
            KafkaSecurity::CLIENT_OAUTH_PORT,
            ListenerScope::External,
            &[RelationKind::Oauth, RelationKind::Certificates],
        ));
    }

    listeners
}

/// The KRaft controller listener. It follows the internal listener's transport security and
/// authenticates with SASL/PLAIN.
pub fn controller_listener(listeners: &BTreeSet<ListenerSpec>) -> ListenerSpec {
    let internal_tls = listeners.iter().any(|listener| {
        listener.name == KafkaListenerName::Internal && listener.protocol.is_tls()
    });
    if internal_tls {
        ListenerSpec::new(
            KafkaListenerName::Controller,
            KafkaListenerProtocol::SaslSsl,
            Some(SaslMechanism::Plain),
            KafkaSecurity::CONTROLLER_PORT,
            ListenerScope::Internal,
            &[RelationKind::Certificates],
        )
    } else {
        ListenerSpec::new(
            KafkaListenerName::Controller,
            KafkaListenerProtocol::SaslPlaintext,
            Some(SaslMechanism::Plain),
            KafkaSecurity::CONTROLLER_PORT,
            ListenerScope::Internal,
            &[],
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct KafkaListenerConfig {
    listeners: Vec<KafkaListener>,
    advertised_listeners: Vec<KafkaListener>,
    listener_security_protocol_map: BTreeMap<KafkaListenerName, KafkaListenerProtocol>,
}

impl KafkaListenerConfig {
    /// Returns the `listeners` for the Kafka `server.properties` config.
    pub fn listeners(&self) -> String {
        self.listeners
            .iter()
            .map(|listener| listener.to_string())
            .collect::<Vec<String>>()
            .join(",")
    }

    /// Returns the `advertised.listeners` for the Kafka `server.properties` config.
    pub fn advertised_listeners(&self) -> String {
        self.advertised_listeners
            .iter()
            .map(|listener| listener.to_string())
            .collect::<Vec<String>>()
            .join(",")
    }

    /// Returns the `listener.security.protocol.map` for the Kafka `server.properties` config.
    pub fn listener_security_protocol_map(&self) -> String {
        self.listener_security_protocol_map
            .iter()
            .map(|(name, protocol)| format!("{name}:{protocol}"))
            .collect::<Vec<String>>()
            .join(",")
    }

    /// Returns the `listener.security.protocol.map` entry of a single listener.
    pub fn listener_security_protocol_map_for_listener(
        &self,
        listener_name: &KafkaListenerName,
    ) -> Option<String> {
        self.listener_security_protocol_map
            .get(listener_name)
            .map(|protocol| format!("{listener_name}:{protocol}"))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct KafkaListener {
    name: KafkaListenerName,
    host: String,
    port: u16,
}

impl Display for KafkaListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.name, self.host, self.port)
    }
}

/// Reject listener sets Kafka would refuse to start with.
pub fn validate_listeners<'a>(
    listeners: impl IntoIterator<Item = &'a ListenerSpec>,
) -> Result<(), KafkaListenerError> {
    let mut ports: BTreeMap<u16, KafkaListenerName> = BTreeMap::new();
    let mut names = BTreeSet::new();
    let mut has_internal = false;

    for listener in listeners {
        ensure!(
            names.insert(listener.name),
            DuplicateNameSnafu {
                name: listener.name
            }
        );
        if let Some(first) = ports.insert(listener.port, listener.name) {
            return DuplicatePortSnafu {
                port: listener.port,
                first,
                second: listener.name,
            }
            .fail();
        }
        has_internal |= listener.name == KafkaListenerName::Internal;
    }

    ensure!(has_internal, MissingInternalListenerSnafu);
    Ok(())
}

/// Build the listener strings for one member.
///
/// Brokers bind and advertise every resolved listener, controllers bind and advertise the
/// controller listener. Every process needs the protocol of the controller listener.
pub fn get_kafka_listener_config(
    listeners: &BTreeSet<ListenerSpec>,
    controller: &ListenerSpec,
    roles: ProcessRoles,
    advertised_host: &str,
) -> Result<KafkaListenerConfig, KafkaListenerError> {
    let mut bound: Vec<&ListenerSpec> = vec![];
    if roles.contains(&KafkaRole::Broker) {
        bound.extend(listeners.iter());
    }
    if roles.contains(&KafkaRole::Controller) {
        bound.push(controller);
    }
    validate_listeners(listeners.iter().chain([controller]))?;

    let mut kafka_listeners = vec![];
    let mut advertised_listeners = vec![];
    let mut listener_security_protocol_map = BTreeMap::new();

    for listener in bound {
        kafka_listeners.push(KafkaListener {
            name: listener.name,
            host: LISTENER_LOCAL_ADDRESS.to_string(),
            port: listener.port,
        });
        advertised_listeners.push(KafkaListener {
            name: listener.name,
            host: advertised_host.to_string(),
            port: listener.port,
        });
        listener_security_protocol_map.insert(listener.name, listener.protocol);
    }
    listener_security_protocol_map.insert(controller.name, controller.protocol);

    Ok(KafkaListenerConfig {
        listeners: kafka_listeners,
        advertised_listeners,
        listener_security_protocol_map,
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn relations(kinds: &[RelationKind]) -> Relations {
        kinds.iter().copied().collect()
    }

    fn summary(listeners: &BTreeSet<ListenerSpec>) -> Vec<(KafkaListenerName, KafkaListenerProtocol, u16)> {
        listeners
            .iter()
            .map(|listener| (listener.name, listener.protocol, listener.port))
            .collect()
    }

    #[rstest]
    #[case::secure_by_default(
        &[],
        vec![(KafkaListenerName::Internal, KafkaListenerProtocol::SaslPlaintext, 19092)]
    )]
    #[case::client(
        &[RelationKind::Client],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslPlaintext, 19092),
            (KafkaListenerName::Client, KafkaListenerProtocol::SaslPlaintext, 9092),
        ]
    )]
    #[case::client_tls(
        &[RelationKind::Client, RelationKind::Certificates],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslSsl, 19093),
            (KafkaListenerName::Client, KafkaListenerProtocol::SaslSsl, 9093),
        ]
    )]
    #[case::client_tls_oauth(
        &[RelationKind::Client, RelationKind::Certificates, RelationKind::Oauth],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslSsl, 19093),
            (KafkaListenerName::Client, KafkaListenerProtocol::SaslSsl, 9093),
            (KafkaListenerName::ClientOauth, KafkaListenerProtocol::SaslSsl, 9095),
        ]
    )]
    #[case::oauth_without_certificates_fails_closed(
        &[RelationKind::Oauth],
        vec![(KafkaListenerName::Internal, KafkaListenerProtocol::SaslPlaintext, 19092)]
    )]
    #[case::certificates_only(
        &[RelationKind::Certificates],
        vec![(KafkaListenerName::Internal, KafkaListenerProtocol::SaslSsl, 19093)]
    )]
    #[case::mtls_without_client_relation(
        &[RelationKind::TrustedCa, RelationKind::Certificates],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslSsl, 19093),
            (KafkaListenerName::ClientMtls, KafkaListenerProtocol::Ssl, 9094),
        ]
    )]
    #[case::mtls_without_certificates_fails_closed(
        &[RelationKind::TrustedCa, RelationKind::Client],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslPlaintext, 19092),
            (KafkaListenerName::Client, KafkaListenerProtocol::SaslPlaintext, 9092),
        ]
    )]
    #[case::everything(
        &[RelationKind::Client, RelationKind::Certificates, RelationKind::Oauth, RelationKind::TrustedCa],
        vec![
            (KafkaListenerName::Internal, KafkaListenerProtocol::SaslSsl, 19093),
            (KafkaListenerName::Client, KafkaListenerProtocol::SaslSsl, 9093),
            (KafkaListenerName::ClientMtls, KafkaListenerProtocol::Ssl, 9094),
            (KafkaListenerName::ClientOauth, KafkaListenerProtocol::SaslSsl, 9095),
        ]
    )]
    fn test_resolve_rule_table(
        #[case] active: &[RelationKind],
        #[case] expected: Vec<(KafkaListenerName, KafkaListenerProtocol, u16)>,
    ) {
        let active = relations(active);
        let resolved = resolve(&active);

        assert_eq!(summary(&resolved), expected);
        // idempotent
        assert_eq!(resolve(&active), resolved);
        // every listener is legal for the relations it was resolved from
        assert!(resolved.iter().all(|listener| listener.is_legal(&active)));
        validate_listeners(&resolved).expect("resolved listeners never share a port");
    }

    #[test]
    fn test_get_kafka_listener_config_for_broker() {
        let active = relations(&[RelationKind::Client, RelationKind::Certificates]);
        let listeners = resolve(&active);
        let config = get_kafka_listener_config(
            &listeners,
            &controller_listener(&listeners),
            ProcessRoles::Broker,
            "kafka-0.internal",
        )
        .expect("valid listeners");

        assert_eq!(
            config.listeners(),
            "INTERNAL://0.0.0.0:19093,CLIENT://0.0.0.0:9093"
        );
        assert_eq!(
            config.advertised_listeners(),
            "INTERNAL://kafka-0.internal:19093,CLIENT://kafka-0.internal:9093"
        );
        assert_eq!(
            config.listener_security_protocol_map(),
            "INTERNAL:SASL_SSL,CLIENT:SASL_SSL,CONTROLLER:SASL_SSL"
        );
        assert_eq!(
            config.listener_security_protocol_map_for_listener(&KafkaListenerName::Controller),
            Some("CONTROLLER:SASL_SSL".to_string())
        );
    }

    #[test]
    fn test_get_kafka_listener_config_for_controller() {
        let active = relations(&[RelationKind::Client]);
        let listeners = resolve(&active);
        let config = get_kafka_listener_config(
            &listeners,
            &controller_listener(&listeners),
            ProcessRoles::Controller,
            "kafka-3.internal",
        )
        .expect("valid listeners");

        assert_eq!(config.listeners(), "CONTROLLER://0.0.0.0:9097");
        assert_eq!(
            config.advertised_listeners(),
            "CONTROLLER://kafka-3.internal:9097"
        );
        assert_eq!(
            config.listener_security_protocol_map(),
            "CONTROLLER:SASL_PLAINTEXT"
        );
    }

    #[test]
    fn test_duplicate_port_is_rejected() {
        let mut listeners = resolve(&relations(&[RelationKind::Client]));
        listeners.insert(ListenerSpec::new(
            KafkaListenerName::ClientOauth,
            KafkaListenerProtocol::SaslSsl,
            Some(SaslMechanism::OauthBearer),
            KafkaSecurity::CLIENT_PORT,
            ListenerScope::External,
            &[],
        ));

        let error = validate_listeners(&listeners).expect_err("duplicate port");
        assert_eq!(
            KafkaListenerErrorDiscriminants::from(&error),
            KafkaListenerErrorDiscriminants::DuplicatePort
        );
    }
}
