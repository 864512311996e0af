//! Collaborators the reconciler drives but does not implement: the certificate authority, the
//! secret store, the partition rebalancer and the supervisor of the Kafka process itself.
pub mod command;
pub mod local;
#[cfg(test)]
pub mod memory;

use std::{
    collections::BTreeMap,
    fmt::Debug,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};
use tokio::io::AsyncWriteExt;

use crate::{
    config::ConfigArtifact,
    model::{secret::SecretRef, MemberHealth, MemberId},
};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to access {}", path.display()))]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to spawn {command:?}"))]
    SpawnCommand {
        source: std::io::Error,
        command: String,
    },

    #[snafu(display("{command:?} exited with {status}: {stderr}"))]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[snafu(display("{command:?} returned unparsable output"))]
    ParseOutput {
        source: serde_json::Error,
        command: String,
    },

    #[snafu(display("failed to (de)serialize {what}"))]
    Serialization {
        source: serde_json::Error,
        what: String,
    },

    #[snafu(display("secret {secret_ref} does not exist"))]
    SecretNotFound { secret_ref: SecretRef },

    #[snafu(display("no command configured for {operation}"))]
    NoCommand { operation: String },
}

/// A certificate signing request for one member keypair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub csr_pem: String,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    pub certificate_id: String,
    pub certificate: String,
    pub ca_chain: String,
}

#[async_trait]
pub trait CertificateAuthority: Debug + Send + Sync {
    /// Submit a request; the returned id is polled with [`CertificateAuthority::fetch`].
    async fn request(&self, request: CertificateRequest) -> Result<String, Error>;

    /// `None` while the certificate has not been issued yet.
    async fn fetch(&self, request_id: &str) -> Result<Option<IssuedCertificate>, Error>;

    async fn revoke(&self, certificate_id: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait SecretStore: Debug + Send + Sync {
    async fn put(&self, label: &str, content: BTreeMap<String, String>)
        -> Result<SecretRef, Error>;

    async fn get(&self, secret_ref: &SecretRef) -> Result<BTreeMap<String, String>, Error>;

    async fn grant(&self, secret_ref: &SecretRef, principal: &str) -> Result<(), Error>;
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RebalanceMode {
    /// Move every partition replica off the target member.
    Remove,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalancePlan {
    pub id: String,
    pub mode: RebalanceMode,
    pub target: MemberId,
    #[serde(default)]
    pub partition_moves: u64,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RebalanceStatus {
    Running,
    Completed,
    Failed,
}

#[async_trait]
pub trait Rebalancer: Debug + Send + Sync {
    /// Dry-run a reassignment.
    async fn propose(&self, mode: RebalanceMode, target: MemberId) -> Result<RebalancePlan, Error>;

    async fn execute(&self, plan: &RebalancePlan) -> Result<(), Error>;

    async fn status(&self) -> Result<RebalanceStatus, Error>;

    /// Number of partition replicas currently assigned to `member`.
    async fn partitions_on(&self, member: MemberId) -> Result<u64, Error>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProcessHealth {
    Healthy,
    Starting,
    Unhealthy { reason: String },
}

impl From<&ProcessHealth> for MemberHealth {
    fn from(health: &ProcessHealth) -> Self {
        match health {
            ProcessHealth::Healthy => MemberHealth::Healthy,
            ProcessHealth::Starting => MemberHealth::Starting,
            ProcessHealth::Unhealthy { .. } => MemberHealth::Degraded,
        }
    }
}

/// The local Kafka process.
#[async_trait]
pub trait ProcessSupervisor: Debug + Send + Sync {
    async fn write_config(&self, artifact: &ConfigArtifact) -> Result<(), Error>;

    /// Restart the process. Returns once the restart has been issued, not once it is healthy.
    async fn restart(&self) -> Result<(), Error>;

    async fn health(&self) -> Result<ProcessHealth, Error>;

    /// Swap the Kafka distribution to `version`; takes effect on the next restart.
    async fn upgrade(&self, version: &str) -> Result<(), Error>;

    /// Store SCRAM credentials (user to password) in the cluster metadata.
    async fn update_credentials(&self, users: &BTreeMap<String, String>) -> Result<(), Error>;

    /// Remove SCRAM users from the cluster metadata.
    async fn delete_credentials(&self, users: &[String]) -> Result<(), Error>;

    async fn stop(&self) -> Result<(), Error>;
}

/// Replace `path` atomically with `contents`. The file is created with `mode` and is never
/// readable with wider permissions, not even briefly.
pub(crate) async fn write_file(path: &Path, contents: &str, mode: u32) -> Result<(), Error> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    match tokio::fs::remove_file(&tmp).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => return Err(Error::Io { source, path: tmp }),
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&tmp)
        .await
        .context(IoSnafu { path: &tmp })?;
    file.write_all(contents.as_bytes())
        .await
        .context(IoSnafu { path: &tmp })?;
    file.sync_all().await.context(IoSnafu { path: &tmp })?;
    drop(file);

    tokio::fs::rename(&tmp, path)
        .await
        .context(IoSnafu { path })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[tokio::test]
    async fn test_write_file_never_widens_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.keystore.pem");
        let tmp = dir.path().join("server.keystore.pem.tmp");

        // leftover from an interrupted write, world readable
        std::fs::write(&tmp, "old").unwrap();
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_file(&path, "secret", 0o600).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret");
        assert!(!tmp.exists());

        write_file(&path, "rotated", 0o600).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "rotated");
    }
}
