//! Connection data handed to client relations.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::{
    model::{
        listener::{
            KafkaListenerName, KafkaListenerProtocol, ListenerScope, ListenerSpec, SaslMechanism,
        },
        role::KafkaRole,
        ClusterMember,
    },
    store::{self, SharedStore},
};

pub const DISCOVERY_KEY: &str = "client-connection";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to publish the client connection data"))]
    Publish { source: store::Error },
}

/// How clients reach the cluster through one external listener.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEndpoint {
    pub listener: KafkaListenerName,
    pub protocol: KafkaListenerProtocol,
    pub mechanism: Option<SaslMechanism>,
    /// `{host1}:{port1},{host2}:{port2},...` as Kafka clients expect it.
    pub bootstrap_servers: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnection {
    #[serde(default)]
    pub endpoints: Vec<ClientEndpoint>,
}

impl ClientConnection {
    pub fn endpoint(&self, listener: KafkaListenerName) -> Option<&ClientEndpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.listener == listener)
    }
}

/// Build the connection data for every external listener. Without external listeners there is
/// nothing for clients to connect to.
pub fn build_client_connection(
    members: &[ClusterMember],
    listeners: &BTreeSet<ListenerSpec>,
) -> ClientConnection {
    let brokers: Vec<&ClusterMember> = members
        .iter()
        .filter(|member| member.has_role(&KafkaRole::Broker))
        .collect();

    let endpoints = listeners
        .iter()
        .filter(|listener| listener.scope == ListenerScope::External)
        .map(|listener| ClientEndpoint {
            listener: listener.name,
            protocol: listener.protocol,
            mechanism: listener.mechanism,
            bootstrap_servers: brokers
                .iter()
                .map(|broker| broker.as_bootstrap_server(listener.port))
                .collect::<Vec<_>>()
                .join(","),
        })
        .collect();

    ClientConnection { endpoints }
}

/// Store the connection data for the client relations. Returns whether it changed.
pub fn publish(store: &dyn SharedStore, connection: &ClientConnection) -> Result<bool, Error> {
    store::update(
        store,
        DISCOVERY_KEY,
        |published: &mut ClientConnection| -> Result<bool, std::convert::Infallible> {
            let changed = *published != *connection;
            published.clone_from(connection);
            Ok(changed)
        },
    )
    .context(PublishSnafu)
    .map(|changed| changed.unwrap_or_else(|never| match never {}))
}
