use std::{
    collections::BTreeMap,
    fmt::{self, Formatter},
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::model::MemberId;

// content keys
pub const SYNC_PASSWORD_KEY: &str = "sync-password";
pub const ADMIN_PASSWORD_KEY: &str = "admin-password";
pub const CERTIFICATE_KEY: &str = "certificate";
pub const PRIVATE_KEY_KEY: &str = "private-key";
pub const CA_CHAIN_KEY: &str = "ca-chain";
pub const TRUSTSTORE_KEY: &str = "truststore";

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
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
pub enum SecretKind {
    InternalUserPassword,
    TlsKeypair,
    TlsTruststore,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretOwner {
    /// Shared by all members.
    Cluster,
    Member(MemberId),
}

impl fmt::Display for SecretOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SecretOwner::Cluster => write!(f, "cluster"),
            SecretOwner::Member(id) => write!(f, "member-{id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKey {
    pub kind: SecretKind,
    pub owner: SecretOwner,
}

impl SecretKey {
    pub fn new(kind: SecretKind, owner: SecretOwner) -> Self {
        Self { kind, owner }
    }

    /// Label under which the secret store keeps this secret.
    pub fn label(&self, version: u64) -> String {
        format!("kafka-{}-{}-v{version}", self.kind, self.owner)
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.owner)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SecretState {
    #[default]
    Current,
    /// Issued keypair waiting for every live member to trust its CA before it becomes current.
    Staged,
    /// Superseded but still valid until every member adopted the successor.
    Draining,
    Retired,
}

/// Opaque handle returned by the secret store.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct SecretRef(pub String);

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One revision of a secret as tracked in the cluster-wide ledger.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVersion {
    pub version: u64,
    pub state: SecretState,
    pub secret_ref: SecretRef,
    /// For a keypair, the CA chain that signed it. For a truststore, the bundle it holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_chain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

/// A keypair version whose certificate has been requested but not yet issued.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCertificate {
    pub version: u64,
    pub request_id: String,
    /// The private key stays in the secret store until the certificate arrives.
    pub key_ref: SecretRef,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretHistory {
    pub key: SecretKey,
    #[serde(default)]
    pub versions: Vec<SecretVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingCertificate>,
}

impl SecretHistory {
    pub fn new(key: SecretKey) -> Self {
        Self {
            key,
            versions: vec![],
            pending: None,
        }
    }

    pub fn current(&self) -> Option<&SecretVersion> {
        self.versions
            .iter()
            .rev()
            .find(|version| version.state == SecretState::Current)
    }

    pub fn staged(&self) -> Option<&SecretVersion> {
        self.versions
            .iter()
            .find(|version| version.state == SecretState::Staged)
    }

    pub fn has_draining(&self) -> bool {
        self.versions
            .iter()
            .any(|version| version.state == SecretState::Draining)
    }

    pub fn get(&self, version: u64) -> Option<&SecretVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn get_mut(&mut self, version: u64) -> Option<&mut SecretVersion> {
        self.versions.iter_mut().find(|v| v.version == version)
    }

    pub fn next_version(&self) -> u64 {
        let highest = self.versions.iter().map(|v| v.version).max().unwrap_or(0);
        let pending = self.pending.as_ref().map(|p| p.version).unwrap_or(0);
        highest.max(pending) + 1
    }

    /// Versions that are still valid (staged, current or draining).
    pub fn valid_versions(&self) -> impl Iterator<Item = &SecretVersion> {
        self.versions
            .iter()
            .filter(|version| version.state != SecretState::Retired)
    }
}

/// A member's reference to the secret version it currently runs with.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVersionRef {
    pub key: SecretKey,
    pub version: u64,
}

/// A resolved secret version including its content.
#[derive(Clone, Eq, PartialEq)]
pub struct Secret {
    pub key: SecretKey,
    pub version: u64,
    pub state: SecretState,
    pub content: BTreeMap<String, String>,
}

impl Secret {
    pub fn version_ref(&self) -> SecretVersionRef {
        SecretVersionRef {
            key: self.key,
            version: self.version,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.content.get(key).map(String::as_str)
    }
}

// Secret content must never end up in logs.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("content", &self.content.keys().collect::<Vec<_>>())
            .finish()
    }
}
