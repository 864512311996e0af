//! File-based collaborators for deployments without a platform secret store or CA service.
//!
//! Both keep one JSON document per entry below a member-local directory.
use std::{
    collections::{BTreeMap, BTreeSet},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::{
    external::{
        write_file, CertificateAuthority, CertificateRequest, Error, IoSnafu, IssuedCertificate,
        SecretNotFoundSnafu, SecretStore, SerializationSnafu,
    },
    model::secret::SecretRef,
};

const SECRET_FILE_MODE: u32 = 0o600;
const EXCHANGE_FILE_MODE: u32 = 0o644;

const REQUESTS_DIR: &str = "requests";
const ISSUED_DIR: &str = "issued";
const REVOKED_DIR: &str = "revoked";

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredSecret {
    content: BTreeMap<String, String>,
    #[serde(default)]
    grants: BTreeSet<String>,
}

/// Keeps secrets as owner-only readable files.
#[derive(Clone, Debug)]
pub struct DirectorySecretStore {
    dir: PathBuf,
}

impl DirectorySecretStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path(&self, secret_ref: &SecretRef) -> PathBuf {
        self.dir.join(format!("{secret_ref}.json"))
    }

    async fn load(&self, secret_ref: &SecretRef) -> Result<StoredSecret, Error> {
        read_json(&self.path(secret_ref))
            .await?
            .with_context(|| SecretNotFoundSnafu {
                secret_ref: secret_ref.clone(),
            })
    }

    async fn save(&self, secret_ref: &SecretRef, secret: &StoredSecret) -> Result<(), Error> {
        write_json(&self.dir, &self.path(secret_ref), secret, SECRET_FILE_MODE).await
    }
}

#[async_trait]
impl SecretStore for DirectorySecretStore {
    async fn put(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
    ) -> Result<SecretRef, Error> {
        let secret_ref = SecretRef(label.to_string());
        self.save(
            &secret_ref,
            &StoredSecret {
                content,
                grants: BTreeSet::new(),
            },
        )
        .await?;
        Ok(secret_ref)
    }

    async fn get(&self, secret_ref: &SecretRef) -> Result<BTreeMap<String, String>, Error> {
        Ok(self.load(secret_ref).await?.content)
    }

    async fn grant(&self, secret_ref: &SecretRef, principal: &str) -> Result<(), Error> {
        let mut secret = self.load(secret_ref).await?;
        if secret.grants.insert(principal.to_string()) {
            self.save(secret_ref, &secret).await?;
        }
        Ok(())
    }
}

/// Hands certificate requests to an out-of-band signer through a shared directory.
///
/// Requests are written to `requests/<id>.json`. The signer answers with `issued/<id>.json`
/// containing an [`IssuedCertificate`]. Revocations are recorded as `revoked/<certificate id>`.
#[derive(Clone, Debug)]
pub struct DirectoryCertificateAuthority {
    dir: PathBuf,
}

impl DirectoryCertificateAuthority {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl CertificateAuthority for DirectoryCertificateAuthority {
    async fn request(&self, request: CertificateRequest) -> Result<String, Error> {
        let suffix: String = OsRng
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let request_id = format!("{}-{}", request.common_name, suffix.to_lowercase());

        let dir = self.dir.join(REQUESTS_DIR);
        write_json(
            &dir,
            &dir.join(format!("{request_id}.json")),
            &request,
            EXCHANGE_FILE_MODE,
        )
        .await?;
        tracing::info!(request_id = %request_id, "certificate requested");
        Ok(request_id)
    }

    async fn fetch(&self, request_id: &str) -> Result<Option<IssuedCertificate>, Error> {
        read_json(&self.dir.join(ISSUED_DIR).join(format!("{request_id}.json"))).await
    }

    async fn revoke(&self, certificate_id: &str) -> Result<(), Error> {
        let dir = self.dir.join(REVOKED_DIR);
        tokio::fs::create_dir_all(&dir)
            .await
            .context(IoSnafu { path: &dir })?;
        write_file(&dir.join(certificate_id), "", EXCHANGE_FILE_MODE).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error).context(IoSnafu { path }),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .with_context(|_| SerializationSnafu {
            what: path.display().to_string(),
        })
}

async fn write_json<T: Serialize>(
    dir: &Path,
    path: &Path,
    value: &T,
    mode: u32,
) -> Result<(), Error> {
    tokio::fs::create_dir_all(dir)
        .await
        .context(IoSnafu { path: dir })?;
    let contents = serde_json::to_string_pretty(value).with_context(|_| SerializationSnafu {
        what: path.display().to_string(),
    })?;
    write_file(path, &contents, mode).await
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[tokio::test]
    async fn test_secret_store_roundtrip_and_grants() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySecretStore::new(dir.path().to_path_buf());

        let secret_ref = store
            .put(
                "kafka-internal-user-password-cluster-v1",
                BTreeMap::from([("sync-password".to_string(), "s3cret".to_string())]),
            )
            .await
            .unwrap();
        store.grant(&secret_ref, "member-0").await.unwrap();
        store.grant(&secret_ref, "member-0").await.unwrap();

        assert_eq!(
            store.get(&secret_ref).await.unwrap()["sync-password"],
            "s3cret"
        );
        let stored: StoredSecret = read_json(&store.path(&secret_ref)).await.unwrap().unwrap();
        assert_eq!(stored.grants.len(), 1);

        let mode = std::fs::metadata(store.path(&secret_ref))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_unknown_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectorySecretStore::new(dir.path().to_path_buf());

        assert!(matches!(
            store.get(&SecretRef("missing".to_string())).await,
            Err(Error::SecretNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_certificate_handoff() {
        let dir = tempfile::tempdir().unwrap();
        let ca = DirectoryCertificateAuthority::new(dir.path().to_path_buf());

        let request_id = ca
            .request(CertificateRequest {
                common_name: "kafka-1".to_string(),
                subject_alt_names: vec!["kafka-1".to_string()],
                csr_pem: "-----BEGIN CERTIFICATE REQUEST-----".to_string(),
            })
            .await
            .unwrap();
        assert!(request_id.starts_with("kafka-1-"));
        assert!(dir
            .path()
            .join(REQUESTS_DIR)
            .join(format!("{request_id}.json"))
            .exists());
        assert_eq!(ca.fetch(&request_id).await.unwrap(), None);

        let issued = IssuedCertificate {
            certificate_id: "serial-1".to_string(),
            certificate: "cert".to_string(),
            ca_chain: "ca".to_string(),
        };
        std::fs::create_dir_all(dir.path().join(ISSUED_DIR)).unwrap();
        std::fs::write(
            dir.path().join(ISSUED_DIR).join(format!("{request_id}.json")),
            serde_json::to_string(&issued).unwrap(),
        )
        .unwrap();
        assert_eq!(ca.fetch(&request_id).await.unwrap(), Some(issued));

        ca.revoke("serial-1").await.unwrap();
        assert!(dir.path().join(REVOKED_DIR).join("serial-1").exists());
    }
}
