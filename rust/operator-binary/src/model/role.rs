use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    EnumString,
)]
pub enum KafkaRole {
    #[serde(rename = "broker")]
    #[strum(serialize = "broker")]
    Broker,
    #[serde(rename = "controller")]
    #[strum(serialize = "controller")]
    Controller,
}

impl KafkaRole {
    pub fn roles() -> Vec<String> {
        let mut roles = vec![];
        for role in Self::iter() {
            roles.push(role.to_string())
        }
        roles
    }
}

/// The roles a single Kafka process runs with, written verbatim to `process.roles`.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize, EnumString)]
pub enum ProcessRoles {
    #[serde(rename = "broker")]
    #[strum(serialize = "broker")]
    Broker,
    #[serde(rename = "controller")]
    #[strum(serialize = "controller")]
    Controller,
    #[serde(rename = "broker,controller", alias = "controller,broker")]
    #[strum(to_string = "broker,controller", serialize = "controller,broker")]
    Combined,
}

impl ProcessRoles {
    pub fn contains(&self, role: &KafkaRole) -> bool {
        match self {
            ProcessRoles::Broker => *role == KafkaRole::Broker,
            ProcessRoles::Controller => *role == KafkaRole::Controller,
            ProcessRoles::Combined => true,
        }
    }

    pub fn roles(&self) -> Vec<KafkaRole> {
        KafkaRole::iter().filter(|role| self.contains(role)).collect()
    }
}
