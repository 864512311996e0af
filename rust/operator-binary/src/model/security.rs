//! A helper module to process Apache Kafka security configuration
//!
//! Relations to external collaborators (certificate provider, clients, OAuth issuer, trusted
//! client CAs) decide which listeners are opened, see [`crate::model::listener::resolve`]. This
//! module turns the resolved listener set into the SASL and TLS settings of `server.properties`
//! and `client.properties`.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::model::{
    listener::{KafkaListenerName, KafkaListenerProtocol, ListenerSpec, SaslMechanism},
    role::{KafkaRole, ProcessRoles},
    CLIENT_TRUSTSTORE_PEM_FILE, KEYSTORE_PEM_FILE, TRUSTSTORE_PEM_FILE,
};

/// A declared integration link whose presence drives the listener configuration.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
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
pub enum RelationKind {
    /// A certificate provider signs the member keypairs.
    Certificates,
    /// Client applications want to produce and consume.
    Client,
    /// A CA whose signed client certificates are accepted on the mTLS listener.
    TrustedCa,
    /// An OAuth issuer whose bearer tokens are accepted.
    Oauth,
}

/// The set of currently active relation kinds.
pub type Relations = BTreeSet<RelationKind>;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OauthProvider {
    pub jwks_endpoint: String,
    pub issuer_url: String,
    #[serde(default)]
    pub audience: Option<String>,
}

/// Data carried by the active relations.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationData {
    #[serde(default)]
    pub oauth: Option<OauthProvider>,
    /// PEM encoded CA certificates trusted for mTLS client authentication.
    #[serde(default)]
    pub trusted_client_cas: Vec<String>,
}

/// SCRAM user names of one internal password version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InternalUsers {
    pub sync: &'static str,
    pub admin: &'static str,
}

impl InternalUsers {
    pub fn names(&self) -> Vec<String> {
        vec![self.sync.to_string(), self.admin.to_string()]
    }
}

/// Helper struct combining the resolved listeners with the relation data they depend on.
pub struct KafkaSecurity<'a> {
    listeners: &'a BTreeSet<ListenerSpec>,
    relation_data: &'a RelationData,
    config_dir: &'a str,
}

impl<'a> KafkaSecurity<'a> {
    // ports
    pub const CLIENT_PORT: u16 = 9092;
    pub const SECURE_CLIENT_PORT: u16 = 9093;
    pub const CLIENT_MTLS_PORT: u16 = 9094;
    pub const CLIENT_OAUTH_PORT: u16 = 9095;
    pub const CONTROLLER_PORT: u16 = 9097;
    pub const INTERNAL_PORT: u16 = 19092;
    pub const SECURE_INTERNAL_PORT: u16 = 19093;
    // internal users, odd and even password versions
    pub const INTERNAL_USER: &'static str = "sync";
    pub const ADMIN_USER: &'static str = "admin";
    pub const INTERNAL_USER_ALT: &'static str = "sync-alt";
    pub const ADMIN_USER_ALT: &'static str = "admin-alt";
    // common
    pub const INTER_BROKER_LISTENER_NAME: &'static str = "inter.broker.listener.name";
    pub const SASL_INTER_BROKER_MECHANISM: &'static str = "sasl.mechanism.inter.broker.protocol";
    pub const SASL_CONTROLLER_MECHANISM: &'static str = "sasl.mechanism.controller.protocol";
    pub const SASL_ENABLED_MECHANISMS: &'static str = "sasl.enabled.mechanisms";
    pub const AUTHORIZER_CLASS_NAME: &'static str = "authorizer.class.name";
    pub const SUPER_USERS: &'static str = "super.users";
    pub const ALLOW_EVERYONE_IF_NO_ACL_FOUND: &'static str = "allow.everyone.if.no.acl.found";
    pub const STANDARD_AUTHORIZER: &'static str =
        "org.apache.kafka.metadata.authorizer.StandardAuthorizer";
    // oauth
    pub const OAUTH_JWKS_ENDPOINT_URL: &'static str = "sasl.oauthbearer.jwks.endpoint.url";
    pub const OAUTH_EXPECTED_ISSUER: &'static str = "sasl.oauthbearer.expected.issuer";
    pub const OAUTH_EXPECTED_AUDIENCE: &'static str = "sasl.oauthbearer.expected.audience";
    pub const OAUTH_VALIDATOR_CALLBACK_HANDLER: &'static str =
        "org.apache.kafka.common.security.oauthbearer.OAuthBearerValidatorCallbackHandler";
    // store type
    pub const PEM_STORE_TYPE: &'static str = "PEM";

    pub fn new(
        listeners: &'a BTreeSet<ListenerSpec>,
        relation_data: &'a RelationData,
        config_dir: &'a str,
    ) -> Self {
        Self {
            listeners,
            relation_data,
            config_dir,
        }
    }

    /// Whether any resolved listener terminates TLS and therefore needs the member keypair.
    pub fn tls_enabled(&self) -> bool {
        self.listeners
            .iter()
            .any(|listener| listener.protocol.is_tls())
    }

    pub fn has_mtls_listener(&self) -> bool {
        self.listener(&KafkaListenerName::ClientMtls).is_some()
    }

    pub fn has_oauth_listener(&self) -> bool {
        self.listener(&KafkaListenerName::ClientOauth).is_some()
    }

    pub fn trusted_client_cas(&self) -> &[String] {
        &self.relation_data.trusted_client_cas
    }

    fn listener(&self, name: &KafkaListenerName) -> Option<&ListenerSpec> {
        self.listeners.iter().find(|listener| &listener.name == name)
    }

    fn keystore_location(&self) -> String {
        format!("{}/{KEYSTORE_PEM_FILE}", self.config_dir)
    }

    fn truststore_location(&self) -> String {
        format!("{}/{TRUSTSTORE_PEM_FILE}", self.config_dir)
    }

    fn client_truststore_location(&self) -> String {
        format!("{}/{CLIENT_TRUSTSTORE_PEM_FILE}", self.config_dir)
    }

    /// Consecutive password versions use different users, so the users of a draining version
    /// keep working for members that have not restarted onto the next one yet.
    pub fn internal_users(password_version: u64) -> InternalUsers {
        if password_version % 2 == 0 {
            InternalUsers {
                sync: Self::INTERNAL_USER_ALT,
                admin: Self::ADMIN_USER_ALT,
            }
        } else {
            InternalUsers {
                sync: Self::INTERNAL_USER,
                admin: Self::ADMIN_USER,
            }
        }
    }

    /// Returns required Kafka configuration settings for the `server.properties` file
    /// depending on the resolved listeners.
    ///
    /// `controller_listener` is the KRaft controller listener every process needs to talk to
    /// (controllers bind it, brokers connect to it).
    pub fn config_settings(
        &self,
        roles: ProcessRoles,
        controller_listener: &ListenerSpec,
        users: InternalUsers,
        internal_password: &str,
    ) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();

        let bound: Vec<&ListenerSpec> = if roles.contains(&KafkaRole::Broker) {
            self.listeners.iter().collect()
        } else {
            vec![]
        };

        let mut mechanisms = BTreeSet::new();
        for listener in bound.iter().copied().chain([controller_listener]) {
            if let Some(mechanism) = &listener.mechanism {
                mechanisms.insert(mechanism.to_string());
                config.insert(
                    listener.name.listener_sasl_enabled_mechanisms(),
                    mechanism.to_string(),
                );
                config.insert(
                    listener.name.listener_sasl_jaas_config(mechanism),
                    self.server_jaas_config(listener, mechanism, users, internal_password),
                );
                if *mechanism == SaslMechanism::OauthBearer {
                    config.insert(
                        listener.name.listener_sasl_server_callback_handler(mechanism),
                        Self::OAUTH_VALIDATOR_CALLBACK_HANDLER.to_string(),
                    );
                }
            }

            if listener.protocol.is_tls() {
                config.insert(
                    listener.name.listener_ssl_keystore_location(),
                    self.keystore_location(),
                );
                config.insert(
                    listener.name.listener_ssl_keystore_type(),
                    Self::PEM_STORE_TYPE.to_string(),
                );
                config.insert(
                    listener.name.listener_ssl_truststore_type(),
                    Self::PEM_STORE_TYPE.to_string(),
                );
                if listener.name == KafkaListenerName::ClientMtls {
                    // Only the CAs of the trusted-CA relation may authenticate clients here.
                    config.insert(
                        listener.name.listener_ssl_truststore_location(),
                        self.client_truststore_location(),
                    );
                    config.insert(
                        listener.name.listener_ssl_client_auth(),
                        "required".to_string(),
                    );
                } else {
                    config.insert(
                        listener.name.listener_ssl_truststore_location(),
                        self.truststore_location(),
                    );
                }
            }
        }

        config.insert(
            Self::SASL_ENABLED_MECHANISMS.to_string(),
            mechanisms.into_iter().collect::<Vec<_>>().join(","),
        );
        config.insert(
            Self::SASL_CONTROLLER_MECHANISM.to_string(),
            SaslMechanism::Plain.to_string(),
        );

        if roles.contains(&KafkaRole::Broker) {
            config.insert(
                Self::INTER_BROKER_LISTENER_NAME.to_string(),
                KafkaListenerName::Internal.to_string(),
            );
            config.insert(
                Self::SASL_INTER_BROKER_MECHANISM.to_string(),
                SaslMechanism::ScramSha512.to_string(),
            );
        }

        if let (true, Some(oauth)) = (self.has_oauth_listener(), &self.relation_data.oauth) {
            config.insert(
                Self::OAUTH_JWKS_ENDPOINT_URL.to_string(),
                oauth.jwks_endpoint.clone(),
            );
            config.insert(
                Self::OAUTH_EXPECTED_ISSUER.to_string(),
                oauth.issuer_url.clone(),
            );
            if let Some(audience) = &oauth.audience {
                config.insert(Self::OAUTH_EXPECTED_AUDIENCE.to_string(), audience.clone());
            }
        }

        // authorization
        config.insert(
            Self::AUTHORIZER_CLASS_NAME.to_string(),
            Self::STANDARD_AUTHORIZER.to_string(),
        );
        config.insert(
            Self::SUPER_USERS.to_string(),
            [
                Self::INTERNAL_USER,
                Self::ADMIN_USER,
                Self::INTERNAL_USER_ALT,
                Self::ADMIN_USER_ALT,
            ]
            .map(|user| format!("User:{user}"))
            .join(";"),
        );
        config.insert(
            Self::ALLOW_EVERYONE_IF_NO_ACL_FOUND.to_string(),
            "false".to_string(),
        );

        tracing::debug!(
            listeners = bound.len(),
            tls = self.tls_enabled(),
            "security settings rendered"
        );

        config
    }

    /// Settings for the admin tooling talking to the internal listener of this member.
    pub fn client_properties(
        &self,
        users: InternalUsers,
        admin_password: &str,
    ) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        let internal = self.listener(&KafkaListenerName::Internal);

        config.insert(
            "security.protocol".to_string(),
            internal
                .map(|listener| listener.protocol.to_string())
                .unwrap_or_else(|| KafkaListenerProtocol::SaslPlaintext.to_string()),
        );
        config.insert(
            "sasl.mechanism".to_string(),
            SaslMechanism::ScramSha512.to_string(),
        );
        config.insert(
            "sasl.jaas.config".to_string(),
            scram_login(users.admin, admin_password),
        );
        if internal.is_some_and(|listener| listener.protocol.is_tls()) {
            config.insert(
                "ssl.truststore.location".to_string(),
                self.truststore_location(),
            );
            config.insert(
                "ssl.truststore.type".to_string(),
                Self::PEM_STORE_TYPE.to_string(),
            );
        }

        config
    }

    fn server_jaas_config(
        &self,
        listener: &ListenerSpec,
        mechanism: &SaslMechanism,
        users: InternalUsers,
        internal_password: &str,
    ) -> String {
        match mechanism {
            SaslMechanism::ScramSha512 if listener.name == KafkaListenerName::Internal => {
                scram_login(users.sync, internal_password)
            }
            SaslMechanism::ScramSha512 => {
                "org.apache.kafka.common.security.scram.ScramLoginModule required;".to_string()
            }
            SaslMechanism::Plain => format!(
                "org.apache.kafka.common.security.plain.PlainLoginModule required \
                 username=\"{user}\" password=\"{internal_password}\" \
                 user_{user}=\"{internal_password}\";",
                user = users.sync,
            ),
            SaslMechanism::OauthBearer => {
                "org.apache.kafka.common.security.oauthbearer.OAuthBearerLoginModule required;"
                    .to_string()
            }
        }
    }
}

fn scram_login(user: &str, password: &str) -> String {
    format!(
        "org.apache.kafka.common.security.scram.ScramLoginModule required \
         username=\"{user}\" password=\"{password}\";"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::listener::{controller_listener, resolve};

    fn relations(kinds: &[RelationKind]) -> Relations {
        kinds.iter().copied().collect()
    }

    #[test]
    fn test_plaintext_broker_settings() {
        let listeners = resolve(&relations(&[RelationKind::Client]));
        let data = RelationData::default();
        let security = KafkaSecurity::new(&listeners, &data, "/etc/kafka");
        let controller = controller_listener(&listeners);

        let config = security.config_settings(
            ProcessRoles::Broker,
            &controller,
            KafkaSecurity::internal_users(1),
            "s3cret",
        );

        assert!(!security.tls_enabled());
        assert_eq!(
            config.get("sasl.enabled.mechanisms"),
            Some(&"PLAIN,SCRAM-SHA-512".to_string())
        );
        assert_eq!(
            config.get("inter.broker.listener.name"),
            Some(&"INTERNAL".to_string())
        );
        assert_eq!(
            config.get("listener.name.internal.scram-sha-512.sasl.jaas.config"),
            Some(&"org.apache.kafka.common.security.scram.ScramLoginModule required username=\"sync\" password=\"s3cret\";".to_string())
        );
        assert!(config.contains_key("listener.name.client.scram-sha-512.sasl.jaas.config"));
        assert!(!config.keys().any(|key| key.contains("ssl.keystore")));
        assert_eq!(
            config.get("super.users"),
            Some(&"User:sync;User:admin;User:sync-alt;User:admin-alt".to_string())
        );
    }

    #[test]
    fn test_consecutive_password_versions_use_distinct_users() {
        let listeners = resolve(&relations(&[RelationKind::Client]));
        let data = RelationData::default();
        let security = KafkaSecurity::new(&listeners, &data, "/etc/kafka");
        let controller = controller_listener(&listeners);

        let v1 = KafkaSecurity::internal_users(1);
        let v2 = KafkaSecurity::internal_users(2);
        assert_ne!(v1.sync, v2.sync);
        assert_ne!(v1.admin, v2.admin);
        assert_eq!(KafkaSecurity::internal_users(3), v1);

        let config = security.config_settings(ProcessRoles::Broker, &controller, v2, "new");
        assert_eq!(
            config.get("listener.name.internal.scram-sha-512.sasl.jaas.config"),
            Some(&"org.apache.kafka.common.security.scram.ScramLoginModule required username=\"sync-alt\" password=\"new\";".to_string())
        );
        let client = security.client_properties(v2, "adminpw");
        assert!(client
            .get("sasl.jaas.config")
            .is_some_and(|jaas| jaas.contains("username=\"admin-alt\"")));
        // every version's users stay super users, whichever the member runs with
        let before = security.config_settings(ProcessRoles::Broker, &controller, v1, "old");
        assert_eq!(before.get("super.users"), config.get("super.users"));
    }

    #[test]
    fn test_tls_mtls_and_oauth_settings() {
        let active = relations(&[
            RelationKind::Certificates,
            RelationKind::Client,
            RelationKind::TrustedCa,
            RelationKind::Oauth,
        ]);
        let listeners = resolve(&active);
        let data = RelationData {
            oauth: Some(OauthProvider {
                jwks_endpoint: "https://idp/jwks".to_string(),
                issuer_url: "https://idp".to_string(),
                audience: Some("kafka".to_string()),
            }),
            trusted_client_cas: vec!["-----BEGIN CERTIFICATE-----".to_string()],
        };
        let security = KafkaSecurity::new(&listeners, &data, "/etc/kafka");
        let config = security.config_settings(
            ProcessRoles::Combined,
            &controller_listener(&listeners),
            KafkaSecurity::internal_users(1),
            "pw",
        );

        assert!(security.tls_enabled());
        assert!(security.has_mtls_listener());
        assert_eq!(
            config.get("listener.name.client_mtls.ssl.client.auth"),
            Some(&"required".to_string())
        );
        assert_eq!(
            config.get("listener.name.client_mtls.ssl.truststore.location"),
            Some(&"/etc/kafka/client-truststore.pem".to_string())
        );
        assert_eq!(
            config.get("listener.name.internal.ssl.keystore.location"),
            Some(&"/etc/kafka/keystore.pem".to_string())
        );
        assert_eq!(
            config.get("listener.name.controller.ssl.keystore.type"),
            Some(&"PEM".to_string())
        );
        assert_eq!(
            config.get("sasl.oauthbearer.jwks.endpoint.url"),
            Some(&"https://idp/jwks".to_string())
        );
        assert_eq!(
            config.get("sasl.enabled.mechanisms"),
            Some(&"OAUTHBEARER,PLAIN,SCRAM-SHA-512".to_string())
        );
    }

    #[test]
    fn test_controller_only_binds_no_broker_listeners() {
        let active = relations(&[RelationKind::Client]);
        let listeners = resolve(&active);
        let data = RelationData::default();
        let security = KafkaSecurity::new(&listeners, &data, "/etc/kafka");
        let config = security.config_settings(
            ProcessRoles::Controller,
            &controller_listener(&listeners),
            KafkaSecurity::internal_users(1),
            "pw",
        );

        assert!(!config.contains_key("inter.broker.listener.name"));
        assert!(!config.keys().any(|key| key.starts_with("listener.name.client.")));
        assert!(config.contains_key("listener.name.controller.plain.sasl.jaas.config"));
        assert_eq!(config.get("sasl.enabled.mechanisms"), Some(&"PLAIN".to_string()));
    }

    #[test]
    fn test_client_properties_follow_internal_listener() {
        let active = relations(&[RelationKind::Certificates]);
        let listeners = resolve(&active);
        let data = RelationData::default();
        let security = KafkaSecurity::new(&listeners, &data, "/etc/kafka");

        let config = security.client_properties(KafkaSecurity::internal_users(1), "adminpw");
        assert_eq!(config.get("security.protocol"), Some(&"SASL_SSL".to_string()));
        assert_eq!(
            config.get("ssl.truststore.location"),
            Some(&"/etc/kafka/truststore.pem".to_string())
        );
    }
}
