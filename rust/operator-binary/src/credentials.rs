//! Credential & secret manager.
//!
//! Secret contents live in the [`SecretStore`]; which version of each secret is current,
//! draining or retired is tracked in a cluster-wide ledger record in the shared store, together
//! with the versions every member currently runs with.
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    sync::Arc,
};

use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use rcgen::{CertificateParams, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use crate::{
    external::{self, CertificateAuthority, CertificateRequest, SecretStore},
    model::{
        secret::{
            PendingCertificate, Secret, SecretHistory, SecretKey, SecretKind, SecretOwner,
            SecretRef, SecretState, SecretVersion, SecretVersionRef, ADMIN_PASSWORD_KEY,
            CA_CHAIN_KEY, CERTIFICATE_KEY, PRIVATE_KEY_KEY, SYNC_PASSWORD_KEY, TRUSTSTORE_KEY,
        },
        MemberId,
    },
    peer_directory::{self, PeerDirectory},
    store::{self, SharedStore},
};

pub const LEDGER_KEY: &str = "secret-ledger";
const PASSWORD_LENGTH: usize = 32;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to access the secret ledger"))]
    Store { source: store::Error },

    #[snafu(display("failed to look up the certificate subject"))]
    PeerDirectory { source: peer_directory::Error },

    #[snafu(display("secret store operation on {key} failed"))]
    SecretStore {
        source: external::Error,
        key: SecretKey,
    },

    #[snafu(display("certificate authority operation for {key} failed"))]
    CertificateAuthority {
        source: external::Error,
        key: SecretKey,
    },

    #[snafu(display("failed to generate a keypair for {key}"))]
    GenerateKey { source: rcgen::Error, key: SecretKey },

    #[snafu(display("waiting on TLS certificate for {key}"))]
    CertificatePending { key: SecretKey },

    #[snafu(display("{kind} secrets cannot be owned by {owner}"))]
    InvalidOwner { kind: SecretKind, owner: SecretOwner },

    #[snafu(display("member {id} is not registered, cannot mint its certificate"))]
    UnknownMember { id: MemberId },

    #[snafu(display("{key} has no version {version}"))]
    UnknownVersion { key: SecretKey, version: u64 },

    #[snafu(display("{key} cannot be rotated while the previous version is still draining"))]
    RotationInProgress { key: SecretKey },

    #[snafu(display("{key} version {version} is current and cannot be retired"))]
    RetireCurrentVersion { key: SecretKey, version: u64 },

    #[snafu(display("{key} version {version} is still referenced by members {members:?}"))]
    StillReferenced {
        key: SecretKey,
        version: u64,
        members: Vec<MemberId>,
    },

    #[snafu(display("secret {key} version {version} is missing {field:?}"))]
    IncompleteSecret {
        key: SecretKey,
        version: u64,
        field: String,
    },
}

impl Error {
    /// Refused to protect a member that still depends on the version.
    pub fn is_still_referenced(&self) -> bool {
        matches!(self, Error::StillReferenced { .. })
    }
}

/// The secret versions a member depends on.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Adoption {
    pub member: MemberId,
    /// Written to disk or loaded by the running process.
    pub versions: BTreeSet<SecretVersionRef>,
    /// Loaded by the running process.
    #[serde(default)]
    pub running: BTreeSet<SecretVersionRef>,
}

#[derive(Debug, PartialEq)]
enum Promotion {
    NothingStaged,
    Waiting(Vec<MemberId>),
    Promoted(u64),
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretLedger {
    #[serde(default)]
    pub histories: Vec<SecretHistory>,
    #[serde(default)]
    pub adoptions: Vec<Adoption>,
}

impl SecretLedger {
    pub fn history(&self, key: &SecretKey) -> Option<&SecretHistory> {
        self.histories.iter().find(|history| &history.key == key)
    }

    fn history_mut(&mut self, key: SecretKey) -> &mut SecretHistory {
        match self.histories.iter().position(|history| history.key == key) {
            Some(index) => &mut self.histories[index],
            None => {
                self.histories.push(SecretHistory::new(key));
                self.histories.sort_by_key(|history| history.key);
                let index = self
                    .histories
                    .iter()
                    .position(|history| history.key == key)
                    .unwrap_or_default();
                &mut self.histories[index]
            }
        }
    }

    /// Members whose adopted versions include `key` at `version`.
    pub fn referencing(&self, key: SecretKey, version: u64) -> Vec<MemberId> {
        let version_ref = SecretVersionRef { key, version };
        self.adoptions
            .iter()
            .filter(|adoption| adoption.versions.contains(&version_ref))
            .map(|adoption| adoption.member)
            .collect()
    }

    /// CA chains of every keypair version that is still valid somewhere in the cluster.
    pub fn trusted_ca_chains(&self) -> BTreeSet<String> {
        self.histories
            .iter()
            .filter(|history| history.key.kind == SecretKind::TlsKeypair)
            .flat_map(|history| history.valid_versions())
            .filter_map(|version| version.ca_chain.clone())
            .collect()
    }

    /// Whether `member` runs with a truststore that includes `ca_chain`. Members running
    /// without any truststore do not verify TLS peers and count as trusting.
    fn trusts(&self, member: MemberId, ca_chain: &str) -> bool {
        let Some(adoption) = self.adoptions.iter().find(|adoption| adoption.member == member)
        else {
            return true;
        };
        let mut truststores = adoption
            .running
            .iter()
            .filter(|version_ref| version_ref.key.kind == SecretKind::TlsTruststore)
            .peekable();
        if truststores.peek().is_none() {
            return true;
        }
        truststores.any(|version_ref| {
            self.history(&version_ref.key)
                .and_then(|history| history.get(version_ref.version))
                .and_then(|version| version.ca_chain.as_deref())
                .is_some_and(|bundle| bundle.contains(ca_chain))
        })
    }

    /// Turn the current version (if any) into a draining one and append `version` as current.
    fn push_current(&mut self, key: SecretKey, version: SecretVersion) {
        let history = self.history_mut(key);
        for previous in &mut history.versions {
            if previous.state == SecretState::Current {
                previous.state = SecretState::Draining;
            }
        }
        history.versions.push(version);
    }
}

#[derive(Clone, Debug)]
pub struct CredentialManager {
    store: Arc<dyn SharedStore>,
    secrets: Arc<dyn SecretStore>,
    ca: Arc<dyn CertificateAuthority>,
    directory: PeerDirectory,
}

impl CredentialManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        secrets: Arc<dyn SecretStore>,
        ca: Arc<dyn CertificateAuthority>,
        directory: PeerDirectory,
    ) -> Self {
        Self {
            store,
            secrets,
            ca,
            directory,
        }
    }

    pub fn ledger(&self) -> Result<SecretLedger, Error> {
        Ok(store::load::<SecretLedger>(self.store.as_ref(), LEDGER_KEY)
            .context(StoreSnafu)?
            .map(|record| record.value)
            .unwrap_or_default())
    }

    /// Return the current version of a secret, creating it first if needed.
    ///
    /// Keypairs are issued asynchronously by the certificate authority: until the first
    /// certificate arrives this fails with [`Error::CertificatePending`]. A certificate issued
    /// for a pending rotation is promoted here as well.
    #[tracing::instrument(skip(self))]
    pub async fn ensure(&self, kind: SecretKind, owner: SecretOwner) -> Result<Secret, Error> {
        let key = SecretKey::new(kind, owner);
        check_owner(&key)?;

        match kind {
            SecretKind::InternalUserPassword => {
                if let Some(current) = self.current(&key)? {
                    return self.resolve(key, &current).await;
                }
                self.create_password(key).await
            }
            SecretKind::TlsKeypair => self.ensure_keypair(key).await,
            SecretKind::TlsTruststore => self.ensure_truststore(key, false).await,
        }
    }

    /// Create a new version, leaving the previous one draining until every member moved on.
    ///
    /// A rotated keypair is staged first and only replaces the current one once every live
    /// member trusts its CA. A password is not rotated again while an older version drains.
    #[tracing::instrument(skip(self))]
    pub async fn rotate(&self, kind: SecretKind, owner: SecretOwner) -> Result<Secret, Error> {
        let key = SecretKey::new(kind, owner);
        check_owner(&key)?;

        match kind {
            SecretKind::InternalUserPassword => {
                // the previous users are still in use until the draining version is retired
                let draining = self
                    .ledger()?
                    .history(&key)
                    .is_some_and(SecretHistory::has_draining);
                ensure!(!draining, RotationInProgressSnafu { key });
                self.create_password(key).await
            }
            SecretKind::TlsKeypair => {
                let in_flight = self
                    .ledger()?
                    .history(&key)
                    .is_some_and(|history| history.pending.is_some() || history.staged().is_some());
                if !in_flight {
                    self.request_certificate(key).await?;
                }
                self.ensure_keypair(key).await
            }
            SecretKind::TlsTruststore => self.ensure_truststore(key, true).await,
        }
    }

    /// Mark a draining version as retired. Retired certificates are revoked.
    #[tracing::instrument(skip(self))]
    pub async fn retire(
        &self,
        kind: SecretKind,
        owner: SecretOwner,
        version: u64,
    ) -> Result<(), Error> {
        let key = SecretKey::new(kind, owner);
        let certificate_id = store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<Option<String>, Error> {
                let members = ledger.referencing(key, version);
                let entry = ledger
                    .history_mut(key)
                    .get_mut(version)
                    .context(UnknownVersionSnafu { key, version })?;
                ensure!(
                    entry.state != SecretState::Current,
                    RetireCurrentVersionSnafu { key, version }
                );
                ensure!(
                    members.is_empty(),
                    StillReferencedSnafu {
                        key,
                        version,
                        members
                    }
                );
                entry.state = SecretState::Retired;
                Ok(entry.certificate_id.clone())
            },
        )
        .context(StoreSnafu)??;

        if let Some(certificate_id) = certificate_id {
            self.ca
                .revoke(&certificate_id)
                .await
                .context(CertificateAuthoritySnafu { key })?;
        }
        tracing::info!(%key, version, "retired secret version");
        Ok(())
    }

    /// Record the secret versions `member` has written and the ones its process runs with.
    pub fn record_adoption(
        &self,
        member: MemberId,
        written: &BTreeSet<SecretVersionRef>,
        running: &BTreeSet<SecretVersionRef>,
    ) -> Result<(), Error> {
        let adoption = Adoption {
            member,
            versions: written.union(running).copied().collect(),
            running: running.clone(),
        };
        store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<(), Infallible> {
                match ledger
                    .adoptions
                    .iter_mut()
                    .find(|existing| existing.member == member)
                {
                    Some(existing) => existing.clone_from(&adoption),
                    None => {
                        ledger.adoptions.push(adoption.clone());
                        ledger.adoptions.sort_by_key(|adoption| adoption.member);
                    }
                }
                Ok(())
            },
        )
        .context(StoreSnafu)?
        .unwrap_or(());
        Ok(())
    }

    /// Draining versions no member references anymore.
    pub fn retirement_candidates(&self) -> Result<Vec<SecretVersionRef>, Error> {
        let ledger = self.ledger()?;
        Ok(ledger
            .histories
            .iter()
            .flat_map(|history| {
                history
                    .versions
                    .iter()
                    .filter(|version| version.state == SecretState::Draining)
                    .map(|version| SecretVersionRef {
                        key: history.key,
                        version: version.version,
                    })
            })
            .filter(|version_ref| {
                ledger
                    .referencing(version_ref.key, version_ref.version)
                    .is_empty()
            })
            .collect())
    }

    /// Retire every draining version no member references anymore.
    pub async fn retire_unreferenced(&self) -> Result<Vec<SecretVersionRef>, Error> {
        let mut retired = vec![];
        for candidate in self.retirement_candidates()? {
            match self
                .retire(candidate.key.kind, candidate.key.owner, candidate.version)
                .await
            {
                Ok(()) => retired.push(candidate),
                // adopted again in the meantime
                Err(error) if error.is_still_referenced() => {}
                Err(error) => return Err(error),
            }
        }
        Ok(retired)
    }

    /// Drop the adoption record and retire all secrets of a removed member.
    pub async fn forget_member(&self, member: MemberId) -> Result<(), Error> {
        let certificate_ids = store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<Vec<String>, Infallible> {
                ledger.adoptions.retain(|adoption| adoption.member != member);
                let mut certificate_ids = vec![];
                for history in &mut ledger.histories {
                    if history.key.owner != SecretOwner::Member(member) {
                        continue;
                    }
                    history.pending = None;
                    for version in &mut history.versions {
                        if version.state != SecretState::Retired {
                            version.state = SecretState::Retired;
                            certificate_ids.extend(version.certificate_id.clone());
                        }
                    }
                }
                Ok(certificate_ids)
            },
        )
        .context(StoreSnafu)?
        .unwrap_or_default();

        for certificate_id in certificate_ids {
            self.ca
                .revoke(&certificate_id)
                .await
                .context(CertificateAuthoritySnafu {
                    key: SecretKey::new(SecretKind::TlsKeypair, SecretOwner::Member(member)),
                })?;
        }
        tracing::info!(%member, "forgot secrets of removed member");
        Ok(())
    }

    pub fn current_version(
        &self,
        kind: SecretKind,
        owner: SecretOwner,
    ) -> Result<Option<u64>, Error> {
        Ok(self
            .current(&SecretKey::new(kind, owner))?
            .map(|version| version.version))
    }

    fn current(&self, key: &SecretKey) -> Result<Option<SecretVersion>, Error> {
        Ok(self
            .ledger()?
            .history(key)
            .and_then(SecretHistory::current)
            .cloned())
    }

    async fn resolve(&self, key: SecretKey, version: &SecretVersion) -> Result<Secret, Error> {
        let content = self
            .secrets
            .get(&version.secret_ref)
            .await
            .context(SecretStoreSnafu { key })?;
        Ok(Secret {
            key,
            version: version.version,
            state: version.state,
            content,
        })
    }

    async fn put(
        &self,
        key: SecretKey,
        label: &str,
        content: BTreeMap<String, String>,
    ) -> Result<SecretRef, Error> {
        let secret_ref = self
            .secrets
            .put(label, content)
            .await
            .context(SecretStoreSnafu { key })?;
        self.secrets
            .grant(&secret_ref, &key.owner.to_string())
            .await
            .context(SecretStoreSnafu { key })?;
        Ok(secret_ref)
    }

    /// Store a new version and make it current. Returns the version that is current afterwards.
    async fn publish(
        &self,
        key: SecretKey,
        content: BTreeMap<String, String>,
        ca_chain: Option<String>,
        certificate_id: Option<String>,
        replace_current: bool,
    ) -> Result<Secret, Error> {
        let version = self.ledger()?.history(&key).map_or(1, SecretHistory::next_version);
        let secret_ref = self.put(key, &key.label(version), content).await?;

        let current = store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<SecretVersion, Infallible> {
                let history = ledger.history_mut(key);
                if let Some(current) = history.current() {
                    // another member won the race to create the first version
                    if !replace_current {
                        return Ok(current.clone());
                    }
                }
                let next = SecretVersion {
                    version: history.next_version().max(version),
                    state: SecretState::Current,
                    secret_ref: secret_ref.clone(),
                    ca_chain: ca_chain.clone(),
                    certificate_id: certificate_id.clone(),
                };
                ledger.push_current(key, next.clone());
                Ok(next)
            },
        )
        .context(StoreSnafu)?
        .unwrap_or_else(|never| match never {});

        tracing::info!(%key, version = current.version, "published secret version");
        self.resolve(key, &current).await
    }

    async fn create_password(&self, key: SecretKey) -> Result<Secret, Error> {
        let replace_current = self.current(&key)?.is_some();
        let content = BTreeMap::from([
            (SYNC_PASSWORD_KEY.to_string(), generate_password()),
            (ADMIN_PASSWORD_KEY.to_string(), generate_password()),
        ]);
        self.publish(key, content, None, None, replace_current).await
    }

    async fn ensure_keypair(&self, key: SecretKey) -> Result<Secret, Error> {
        let history = self.ledger()?.history(&key).cloned();
        match history.as_ref().and_then(|history| history.pending.clone()) {
            Some(pending) => self.collect_certificate(key, &pending).await?,
            None if history.as_ref().and_then(SecretHistory::current).is_none() => {
                self.request_certificate(key).await?
            }
            None => {}
        }

        match self.promote_staged(key)? {
            Promotion::Waiting(members) => {
                tracing::debug!(%key, ?members, "staged certificate waits for peers to trust its CA");
            }
            Promotion::Promoted(version) => {
                tracing::info!(%key, version, "staged certificate is now current");
            }
            Promotion::NothingStaged => {}
        }

        match self.current(&key)? {
            Some(current) => self.resolve(key, &current).await,
            None => CertificatePendingSnafu { key }.fail(),
        }
    }

    /// Generate a keypair, park the private key in the secret store and submit the CSR.
    async fn request_certificate(&self, key: SecretKey) -> Result<(), Error> {
        let SecretOwner::Member(id) = key.owner else {
            return InvalidOwnerSnafu {
                kind: key.kind,
                owner: key.owner,
            }
            .fail();
        };
        let member = self
            .directory
            .get(id)
            .context(PeerDirectorySnafu)?
            .context(UnknownMemberSnafu { id })?;

        let (csr_pem, key_pem) = generate_csr(&member.address.host).context(GenerateKeySnafu { key })?;
        let version = self.ledger()?.history(&key).map_or(1, SecretHistory::next_version);
        let key_ref = self
            .put(
                key,
                &format!("{}-key", key.label(version)),
                BTreeMap::from([(PRIVATE_KEY_KEY.to_string(), key_pem)]),
            )
            .await?;

        let request_id = self
            .ca
            .request(CertificateRequest {
                common_name: member.address.host.clone(),
                subject_alt_names: vec![member.address.host.clone()],
                csr_pem,
            })
            .await
            .context(CertificateAuthoritySnafu { key })?;

        store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<(), Infallible> {
                let history = ledger.history_mut(key);
                if history.pending.is_none() {
                    history.pending = Some(PendingCertificate {
                        version,
                        request_id: request_id.clone(),
                        key_ref: key_ref.clone(),
                    });
                }
                Ok(())
            },
        )
        .context(StoreSnafu)?
        .unwrap_or(());

        tracing::info!(%key, version, request_id = %request_id, "requested certificate");
        Ok(())
    }

    /// Store a certificate once the CA issued it.
    ///
    /// The first certificate of a member becomes current right away. A replacement is staged.
    async fn collect_certificate(
        &self,
        key: SecretKey,
        pending: &PendingCertificate,
    ) -> Result<(), Error> {
        let Some(issued) = self
            .ca
            .fetch(&pending.request_id)
            .await
            .context(CertificateAuthoritySnafu { key })?
        else {
            tracing::debug!(%key, request_id = %pending.request_id, "certificate not issued yet");
            return Ok(());
        };

        let private_key = self
            .secrets
            .get(&pending.key_ref)
            .await
            .context(SecretStoreSnafu { key })?
            .remove(PRIVATE_KEY_KEY)
            .context(IncompleteSecretSnafu {
                key,
                version: pending.version,
                field: PRIVATE_KEY_KEY,
            })?;
        let content = BTreeMap::from([
            (PRIVATE_KEY_KEY.to_string(), private_key),
            (CERTIFICATE_KEY.to_string(), issued.certificate),
            (CA_CHAIN_KEY.to_string(), issued.ca_chain.clone()),
        ]);
        let secret_ref = self.put(key, &key.label(pending.version), content).await?;

        let request_id = pending.request_id.clone();
        let collected = store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<Option<SecretState>, Infallible> {
                let history = ledger.history_mut(key);
                // collected concurrently
                if history
                    .pending
                    .as_ref()
                    .map_or(true, |pending| pending.request_id != request_id)
                {
                    return Ok(None);
                }
                history.pending = None;
                let state = if history.current().is_some() {
                    SecretState::Staged
                } else {
                    SecretState::Current
                };
                history.versions.push(SecretVersion {
                    version: pending.version,
                    state,
                    secret_ref: secret_ref.clone(),
                    ca_chain: Some(issued.ca_chain.clone()),
                    certificate_id: Some(issued.certificate_id.clone()),
                });
                Ok(Some(state))
            },
        )
        .context(StoreSnafu)?
        .unwrap_or_else(|never| match never {});

        if let Some(state) = collected {
            tracing::info!(%key, version = pending.version, %state, "certificate issued");
        }
        Ok(())
    }

    /// Make the staged keypair current once every live member trusts the CA that signed it.
    fn promote_staged(&self, key: SecretKey) -> Result<Promotion, Error> {
        let live: Vec<MemberId> = self
            .directory
            .list()
            .context(PeerDirectorySnafu)?
            .into_iter()
            .filter(|member| member.health.is_live())
            .map(|member| member.id)
            .collect();

        store::update(
            self.store.as_ref(),
            LEDGER_KEY,
            |ledger: &mut SecretLedger| -> Result<Promotion, Infallible> {
                let Some(staged) = ledger.history(&key).and_then(SecretHistory::staged) else {
                    return Ok(Promotion::NothingStaged);
                };
                let version = staged.version;
                let ca_chain = staged.ca_chain.as_deref().unwrap_or_default().trim().to_string();
                let waiting: Vec<MemberId> = live
                    .iter()
                    .copied()
                    .filter(|member| !ledger.trusts(*member, &ca_chain))
                    .collect();
                if !waiting.is_empty() {
                    return Ok(Promotion::Waiting(waiting));
                }

                let history = ledger.history_mut(key);
                for entry in &mut history.versions {
                    match entry.state {
                        SecretState::Current => entry.state = SecretState::Draining,
                        SecretState::Staged if entry.version == version => {
                            entry.state = SecretState::Current
                        }
                        _ => {}
                    }
                }
                Ok(Promotion::Promoted(version))
            },
        )
        .context(StoreSnafu)
        .map(|promotion| promotion.unwrap_or_else(|never| match never {}))
    }

    /// The truststore holds the CA chains of all valid keypairs, staged ones included, so members
    /// running an old and a new certificate keep trusting each other during a rollover.
    async fn ensure_truststore(&self, key: SecretKey, force: bool) -> Result<Secret, Error> {
        let ledger = self.ledger()?;
        let bundle = ledger
            .trusted_ca_chains()
            .iter()
            .map(|chain| chain.trim())
            .collect::<Vec<_>>()
            .join("\n");

        if let Some(current) = ledger.history(&key).and_then(SecretHistory::current) {
            let secret = self.resolve(key, current).await?;
            if !force && secret.get(TRUSTSTORE_KEY) == Some(bundle.as_str()) {
                return Ok(secret);
            }
        }

        self.publish(
            key,
            BTreeMap::from([(TRUSTSTORE_KEY.to_string(), bundle.clone())]),
            Some(bundle),
            None,
            true,
        )
        .await
    }
}

fn check_owner(key: &SecretKey) -> Result<(), Error> {
    let valid = match key.kind {
        SecretKind::TlsKeypair => matches!(key.owner, SecretOwner::Member(_)),
        SecretKind::InternalUserPassword | SecretKind::TlsTruststore => {
            key.owner == SecretOwner::Cluster
        }
    };
    ensure!(
        valid,
        InvalidOwnerSnafu {
            kind: key.kind,
            owner: key.owner
        }
    );
    Ok(())
}

fn generate_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Returns the PEM encoded CSR and private key.
fn generate_csr(host: &str) -> Result<(String, String), rcgen::Error> {
    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name.push(DnType::CommonName, host);
    let csr = params.serialize_request(&key_pair)?;
    Ok((csr.pem()?, key_pair.serialize_pem()))
}
