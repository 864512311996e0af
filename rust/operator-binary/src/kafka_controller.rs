//! Drives the local cluster member towards its desired state.
//!
//! Every event runs one reconciliation pass: observe the member and the cluster, compute a
//! [`ReconciliationPlan`] and execute it. Local progress is persisted in the state directory so a
//! restarted reconciler resumes the state machine where it left off.
use std::{
    collections::{BTreeMap, BTreeSet},
    convert::Infallible,
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use const_format::concatcp;
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    config::{self, ConfigArtifact, RenderInputs, ResolvedSecrets, RoleAssignment},
    credentials::{self, CredentialManager},
    discovery,
    external::{
        self, write_file, CertificateAuthority, ProcessSupervisor, RebalanceMode, RebalancePlan,
        RebalanceStatus, Rebalancer, SecretStore,
    },
    model::{
        listener,
        role::KafkaRole,
        secret::{
            Secret, SecretKind, SecretOwner, SecretState, SecretVersionRef, ADMIN_PASSWORD_KEY,
            SYNC_PASSWORD_KEY,
        },
        security::{KafkaSecurity, RelationKind},
        ClusterMember, MemberHealth, MemberId, Timestamp, OPERATOR_NAME,
    },
    operations::upgrade::{check_upgrade, UpgradeDecision},
    operator_config::{ControllerInputs, Intents, OperatorConfig},
    peer_directory::{self, DirectoryChange, PeerDirectory, Roster},
    reconcile::{
        compute_plan, Action, Desired, DrainView, LockView, MemberState, MemberStatus, Observed,
        ReconciliationPlan, UpgradeView,
    },
    rolling_lock::{self, LockReason, RollingLockCoordinator},
    store::{self, SharedStore},
};

pub const MEMBER_CONTROLLER_NAME: &str = "member";
pub const FULL_CONTROLLER_NAME: &str = concatcp!(MEMBER_CONTROLLER_NAME, '.', OPERATOR_NAME);

pub const STATE_FILE: &str = concatcp!(MEMBER_CONTROLLER_NAME, "-state.json");
pub const PASSWORD_ROTATION_KEY: &str = "password-rotation";

const STATE_FILE_MODE: u32 = 0o600;
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

pub struct Ctx {
    pub config: OperatorConfig,
    pub store: Arc<dyn SharedStore>,
    pub directory: PeerDirectory,
    pub lock: RollingLockCoordinator,
    pub credentials: CredentialManager,
    pub supervisor: Arc<dyn ProcessSupervisor>,
    pub rebalancer: Arc<dyn Rebalancer>,
}

impl Ctx {
    pub fn new(
        config: OperatorConfig,
        store: Arc<dyn SharedStore>,
        secrets: Arc<dyn SecretStore>,
        ca: Arc<dyn CertificateAuthority>,
        supervisor: Arc<dyn ProcessSupervisor>,
        rebalancer: Arc<dyn Rebalancer>,
    ) -> Self {
        let lock = RollingLockCoordinator::new(store.clone(), config.lock_timeout());
        let directory = PeerDirectory::new(store.clone());
        let credentials = CredentialManager::new(store.clone(), secrets, ca, directory.clone());
        Self {
            config,
            store,
            directory,
            lock,
            credentials,
            supervisor,
            rebalancer,
        }
    }
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("failed to read the controller inputs"))]
    ReadInputs {
        source: crate::operator_config::Error,
    },

    #[snafu(display("failed to allocate a member id"))]
    AllocateMemberId { source: peer_directory::Error },

    #[snafu(display("failed to read the peer directory"))]
    ReadPeerDirectory { source: peer_directory::Error },

    #[snafu(display("failed to update the peer directory entry of member {member}"))]
    UpdatePeerDirectory {
        source: peer_directory::Error,
        member: MemberId,
    },

    #[snafu(display("rolling lock operation failed"))]
    RollingLock { source: rolling_lock::Error },

    #[snafu(display("failed to ensure the {kind} secret"))]
    EnsureSecret {
        source: credentials::Error,
        kind: SecretKind,
    },

    #[snafu(display("failed to rotate the {kind} secret"))]
    RotateSecret {
        source: credentials::Error,
        kind: SecretKind,
    },

    #[snafu(display("failed to update the secret ledger"))]
    SecretLedger { source: credentials::Error },

    #[snafu(display("failed to claim the password rotation"))]
    ClaimRotation { source: store::Error },

    #[snafu(display("failed to render the configuration"))]
    RenderConfig { source: config::Error },

    #[snafu(display("planned to write a configuration that was not rendered"))]
    NoDesiredConfig,

    #[snafu(display("failed to {operation} the kafka process"))]
    Supervise {
        source: external::Error,
        operation: &'static str,
    },

    #[snafu(display("partition rebalancer request failed"))]
    Rebalance { source: external::Error },

    #[snafu(display("failed to read local state from {}", path.display()))]
    ReadState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse local state {}", path.display()))]
    ParseState {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create the state directory {}", path.display()))]
    CreateStateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize local state"))]
    SerializeState { source: serde_json::Error },

    #[snafu(display("failed to write local state"))]
    WriteState { source: external::Error },

    #[snafu(display("failed to publish the client connection data"))]
    PublishDiscovery { source: discovery::Error },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// What to do after a failed reconciliation pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Requeue {
    /// Only retry once something changed.
    AwaitChange,
    After(Duration),
}

/// `attempt` counts the consecutive failed passes, starting at 0.
pub fn error_policy(error: &Error, attempt: u32) -> Requeue {
    match error {
        // an unparsable inputs file stays broken until somebody edits it
        Error::ReadInputs { .. } => Requeue::AwaitChange,
        _ => Requeue::After(backoff(attempt)),
    }
}

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_MAX)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Tick,
    InputsChanged,
    PeerChanged(DirectoryChange),
    /// The roster changed without a local notification, e.g. by a member in another process.
    RosterRevised,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenIntents {
    #[serde(default)]
    pub rotate_certificate_token: u64,
    #[serde(default)]
    pub retry_token: u64,
}

/// Everything the controller remembers about its member between passes.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalState {
    pub member: Option<MemberId>,
    pub state: MemberState,
    pub status: MemberStatus,
    /// Generation last recorded in the peer directory.
    pub generation: u64,
    pub written: Option<config::Fingerprint>,
    pub written_secrets: BTreeSet<SecretVersionRef>,
    pub running: Option<config::Fingerprint>,
    pub running_secrets: BTreeSet<SecretVersionRef>,
    /// Kafka version installed by the last upgrade.
    pub running_version: Option<String>,
    pub health_failures: u32,
    pub failed: bool,
    pub rebalance: Option<RebalancePlan>,
    pub rebalance_failed: bool,
    pub seen: SeenIntents,
}

impl LocalState {
    pub fn load(path: &Path) -> Result<Self, Error> {
        match std::fs::read(path) {
            Ok(contents) => serde_json::from_slice(&contents).context(ParseStateSnafu { path }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error).context(ReadStateSnafu { path }),
        }
    }

    async fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context(CreateStateDirSnafu { path: dir })?;
        }
        let contents = serde_json::to_string_pretty(self).context(SerializeStateSnafu)?;
        write_file(path, &contents, STATE_FILE_MODE)
            .await
            .context(WriteStateSnafu)
    }
}

/// Cluster-wide record of password rotation tokens. One member claims a token and only marks it
/// done once the rotation succeeded, so a failed attempt is retried.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PasswordRotation {
    /// Last token whose rotation completed.
    token: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pending: Option<PendingRotation>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PendingRotation {
    token: u64,
    member: MemberId,
    claimed_at: Timestamp,
    /// Password version that was current when the token was first claimed.
    from_version: Option<u64>,
}

/// The rendered configuration and what it was rendered from.
struct DesiredConfig {
    artifact: ConfigArtifact,
    secrets: BTreeSet<SecretVersionRef>,
    /// Internal SCRAM users and their passwords.
    users: BTreeMap<String, String>,
}

enum Outcome {
    Completed,
    /// The plan stopped early without an error, e.g. because another member won the lock.
    Halted(MemberStatus),
}

pub struct Controller {
    ctx: Arc<Ctx>,
    state: LocalState,
    state_file: PathBuf,
}

impl Controller {
    pub fn new(ctx: Arc<Ctx>) -> Result<Self, Error> {
        let state_file = ctx.config.directories.state.join(STATE_FILE);
        let state = LocalState::load(&state_file)?;
        tracing::info!(
            state_file = %state_file.display(),
            member = ?state.member,
            state = %state.state,
            "loaded local state"
        );
        Ok(Self {
            ctx,
            state,
            state_file,
        })
    }

    pub fn state(&self) -> &LocalState {
        &self.state
    }

    /// Run one reconciliation pass.
    #[tracing::instrument(skip(self), fields(member = ?self.state.member))]
    pub async fn reconcile(&mut self, now: Timestamp) -> Result<ReconciliationPlan, Error> {
        let inputs = ControllerInputs::from_file(&self.ctx.config.inputs_file)
            .context(ReadInputsSnafu)?;
        let id = self.member_id()?;

        if self.state.state != MemberState::Removed {
            self.apply_intents(id, &inputs, now).await?;
        }
        let (observed, desired) = self.observe(id, &inputs, now).await?;
        let plan = compute_plan(&observed);
        if !plan.actions.is_empty() {
            tracing::debug!(actions = ?plan.actions, target = %plan.target, "computed plan");
        }

        let status = match self.execute(id, &plan, desired.as_ref(), now).await {
            Ok(Outcome::Completed) => {
                self.transition(plan.target);
                plan.status.clone()
            }
            Ok(Outcome::Halted(status)) => status,
            Err(error) => {
                tracing::warn!(
                    category = error.category(),
                    "plan aborted, releasing the rolling lock"
                );
                if let Err(release_error) = self.ctx.lock.release(id) {
                    tracing::warn!(error = %release_error, "failed to release the rolling lock");
                }
                self.state.save(&self.state_file).await?;
                return Err(error);
            }
        };

        if status != self.state.status {
            tracing::info!(status = %status, "member status changed");
        }
        self.state.status = status;
        self.state.save(&self.state_file).await?;
        self.publish_discovery(&inputs)?;
        Ok(plan)
    }

    fn transition(&mut self, target: MemberState) {
        if self.state.state != target {
            tracing::info!(from = %self.state.state, to = %target, "member state changed");
            self.state.state = target;
        }
    }

    fn member_id(&mut self) -> Result<MemberId, Error> {
        let id = match self.ctx.config.member.id.or(self.state.member) {
            Some(id) => id,
            None => self
                .ctx
                .directory
                .allocate_id()
                .context(AllocateMemberIdSnafu)?,
        };
        self.state.member = Some(id);
        Ok(id)
    }

    fn local_member(&self, id: MemberId) -> ClusterMember {
        ClusterMember::new(
            id,
            self.ctx.config.member.address(),
            self.ctx.config.member.roles,
        )
    }

    async fn apply_intents(
        &mut self,
        id: MemberId,
        inputs: &ControllerInputs,
        now: Timestamp,
    ) -> Result<(), Error> {
        let Intents {
            rotate_password_token,
            rotate_certificate_token,
            retry_token,
            ..
        } = inputs.intents;

        if retry_token > self.state.seen.retry_token {
            tracing::info!(retry_token, "retry requested, clearing failures");
            self.state.failed = false;
            self.state.health_failures = 0;
            self.state.rebalance_failed = false;
            self.state.seen.retry_token = retry_token;
        }

        if rotate_password_token > 0 {
            self.rotate_passwords(id, rotate_password_token, now).await?;
        }

        if rotate_certificate_token > self.state.seen.rotate_certificate_token {
            let tls = inputs
                .relations()
                .contains(&RelationKind::Certificates);
            if tls && self.state.state != MemberState::Unregistered {
                tracing::info!(rotate_certificate_token, "rotating the member keypair");
                match self
                    .ctx
                    .credentials
                    .rotate(SecretKind::TlsKeypair, SecretOwner::Member(id))
                    .await
                {
                    // the replacement is picked up once it has been issued
                    Ok(_) | Err(credentials::Error::CertificatePending { .. }) => {}
                    Err(error) => {
                        return Err(error).context(RotateSecretSnafu {
                            kind: SecretKind::TlsKeypair,
                        })
                    }
                }
            }
            self.state.seen.rotate_certificate_token = rotate_certificate_token;
        }
        Ok(())
    }

    /// Rotate the internal user passwords once per token, on whichever member claims it first.
    ///
    /// The claim stays with the member until the rotation went through. If that member stops
    /// reconciling, another one takes over after the lock timeout.
    async fn rotate_passwords(&self, id: MemberId, token: u64, now: Timestamp) -> Result<(), Error> {
        let (kind, owner) = (SecretKind::InternalUserPassword, SecretOwner::Cluster);
        let current = self
            .ctx
            .credentials
            .current_version(kind, owner)
            .context(SecretLedgerSnafu)?;
        let Some(claim) = self.claim_password_rotation(id, token, now, current)? else {
            return Ok(());
        };

        if current > claim.from_version {
            tracing::info!(token = claim.token, "password rotation already took effect");
        } else {
            tracing::info!(token = claim.token, "rotating the internal user passwords");
            match self.ctx.credentials.rotate(kind, owner).await {
                Ok(_) => {}
                Err(credentials::Error::RotationInProgress { .. }) => {
                    tracing::info!(
                        token = claim.token,
                        "previous passwords are still in use, rotation deferred"
                    );
                    return Ok(());
                }
                Err(error) => return Err(error).context(RotateSecretSnafu { kind }),
            }
        }
        self.complete_password_rotation(id)
    }

    fn claim_password_rotation(
        &self,
        id: MemberId,
        token: u64,
        now: Timestamp,
        from_version: Option<u64>,
    ) -> Result<Option<PendingRotation>, Error> {
        let timeout = self.ctx.lock.timeout();
        store::update(
            self.ctx.store.as_ref(),
            PASSWORD_ROTATION_KEY,
            |record: &mut PasswordRotation| -> Result<Option<PendingRotation>, Infallible> {
                if token <= record.token {
                    return Ok(None);
                }
                let claim = match record.pending.take() {
                    Some(mut pending)
                        if pending.member == id
                            || now.saturating_since(pending.claimed_at) > timeout =>
                    {
                        if pending.member != id {
                            tracing::warn!(from = %pending.member, "taking over stalled password rotation");
                        }
                        pending.member = id;
                        pending.claimed_at = now;
                        pending.token = pending.token.max(token);
                        pending
                    }
                    Some(other) => {
                        record.pending = Some(other);
                        return Ok(None);
                    }
                    None => PendingRotation {
                        token,
                        member: id,
                        claimed_at: now,
                        from_version,
                    },
                };
                record.pending = Some(claim.clone());
                Ok(Some(claim))
            },
        )
        .context(ClaimRotationSnafu)
        .map(|claimed| claimed.unwrap_or_else(|never| match never {}))
    }

    fn complete_password_rotation(&self, id: MemberId) -> Result<(), Error> {
        store::update(
            self.ctx.store.as_ref(),
            PASSWORD_ROTATION_KEY,
            |record: &mut PasswordRotation| -> Result<(), Infallible> {
                if let Some(pending) = record.pending.as_ref().filter(|pending| pending.member == id) {
                    record.token = record.token.max(pending.token);
                    record.pending = None;
                }
                Ok(())
            },
        )
        .context(ClaimRotationSnafu)
        .map(|completed| completed.unwrap_or_else(|never| match never {}))
    }

    async fn observe(
        &mut self,
        id: MemberId,
        inputs: &ControllerInputs,
        now: Timestamp,
    ) -> Result<(Observed, Option<DesiredConfig>), Error> {
        let roster = self
            .ctx
            .directory
            .roster()
            .context(ReadPeerDirectorySnafu)?;
        let entry = roster.get(id);
        let registered = entry.is_some();
        let reported_health = entry.map(|member| member.health).unwrap_or_default();

        let (desired, config) = if registered && self.state.state != MemberState::Removed {
            self.desired(id, &roster, inputs).await?
        } else {
            (Desired::Blocked(MemberStatus::Registering), None)
        };

        let health = match self.state.state {
            MemberState::Restarting | MemberState::Healthy => Some(
                self.ctx
                    .supervisor
                    .health()
                    .await
                    .context(SuperviseSnafu {
                        operation: "check the health of",
                    })?,
            ),
            _ => None,
        };
        if self.state.state == MemberState::Restarting
            && health != Some(external::ProcessHealth::Healthy)
        {
            self.state.health_failures += 1;
            tracing::debug!(
                failures = self.state.health_failures,
                ?health,
                "member not healthy yet"
            );
        }

        let lock = match self.ctx.lock.holder().context(RollingLockSnafu)? {
            None => LockView::Free,
            Some(holder) if holder.member == id => LockView::HeldBySelf,
            Some(holder) => LockView::HeldByOther {
                holder: holder.member,
                expired: holder.is_expired(now, self.ctx.lock.timeout()),
            },
        };

        let drain = if self.state.state == MemberState::Draining && inputs.intents.scale_down {
            self.observe_drain(id).await?
        } else {
            DrainView::NotStarted
        };

        let draining_secrets = self.state.state == MemberState::Healthy
            && self
                .ctx
                .credentials
                .ledger()
                .context(SecretLedgerSnafu)?
                .histories
                .iter()
                .flat_map(|history| &history.versions)
                .any(|version| version.state == SecretState::Draining);

        let observed = Observed {
            member: id,
            state: self.state.state,
            registered,
            desired,
            written: self.state.written.clone(),
            running: self.state.running.clone(),
            lock,
            health,
            reported_health,
            health_failures: self.state.health_failures,
            health_check_retries: self.ctx.config.health_check_retries,
            failed: self.state.failed,
            scale_down: inputs.intents.scale_down,
            drain,
            upgrade: self.upgrade_view(inputs.intents.upgrade_to.as_deref()),
            draining_secrets,
        };
        Ok((observed, config))
    }

    fn upgrade_view(&self, target: Option<&str>) -> UpgradeView {
        let Some(target) = target else {
            return UpgradeView::UpToDate;
        };
        let current = self
            .state
            .running_version
            .clone()
            .unwrap_or_else(|| self.ctx.config.product_version.clone());

        match check_upgrade(&current, target) {
            Ok(UpgradeDecision::UpToDate) => UpgradeView::UpToDate,
            Ok(UpgradeDecision::Upgrade { to, .. }) => UpgradeView::Pending {
                version: to.to_string(),
            },
            Err(error) => {
                tracing::warn!(error = %error, "refusing upgrade");
                UpgradeView::Incompatible {
                    current,
                    target: target.to_string(),
                }
            }
        }
    }

    async fn observe_drain(&mut self, id: MemberId) -> Result<DrainView, Error> {
        if !self.ctx.config.member.roles.contains(&KafkaRole::Broker) {
            return Ok(DrainView::NotNeeded);
        }
        if self.state.rebalance_failed {
            return Ok(DrainView::Failed);
        }

        let rebalancer = &self.ctx.rebalancer;
        let Some(plan) = &self.state.rebalance else {
            let remaining = rebalancer.partitions_on(id).await.context(RebalanceSnafu)?;
            return Ok(if remaining == 0 {
                DrainView::Completed { remaining }
            } else {
                DrainView::NotStarted
            });
        };

        match rebalancer.status().await.context(RebalanceSnafu)? {
            RebalanceStatus::Running => Ok(DrainView::Running {
                remaining: rebalancer.partitions_on(id).await.context(RebalanceSnafu)?,
            }),
            RebalanceStatus::Completed => {
                tracing::info!(plan = %plan.id, "partition rebalance completed");
                self.state.rebalance = None;
                Ok(DrainView::Completed {
                    remaining: rebalancer.partitions_on(id).await.context(RebalanceSnafu)?,
                })
            }
            RebalanceStatus::Failed => {
                tracing::warn!(plan = %plan.id, "partition rebalance failed");
                self.state.rebalance = None;
                self.state.rebalance_failed = true;
                Ok(DrainView::Failed)
            }
        }
    }

    /// Resolve the listeners and secrets and render the configuration the member should run.
    async fn desired(
        &self,
        id: MemberId,
        roster: &Roster,
        inputs: &ControllerInputs,
    ) -> Result<(Desired, Option<DesiredConfig>), Error> {
        let listeners = listener::resolve(inputs.relations());
        let tls = inputs
            .relations()
            .contains(&RelationKind::Certificates);

        let Some(secrets) = self.resolve_secrets(id, tls).await? else {
            return Ok((Desired::Blocked(MemberStatus::WaitingOnCertificate), None));
        };

        let role_assignment = RoleAssignment {
            member: id,
            roles: self.ctx.config.member.roles,
            advertised_host: self.ctx.config.member.host.clone(),
        };
        let rendered = config::render(&RenderInputs {
            cluster_id: &self.ctx.config.cluster_id,
            members: &roster.members,
            listeners: &listeners,
            role_assignment: &role_assignment,
            secrets: &secrets,
            relation_data: &inputs.relation_data,
            settings: &self.ctx.config.broker,
            directories: &self.ctx.config.directories,
        });
        let artifact = match rendered {
            Ok(artifact) => artifact,
            Err(error) if error.is_invalid_configuration() => {
                let reason = error_chain(&error);
                tracing::warn!(reason = %reason, "configuration cannot be rendered");
                return Ok((
                    Desired::Blocked(MemberStatus::InvalidConfiguration { reason }),
                    None,
                ));
            }
            Err(error) => return Err(error).context(RenderConfigSnafu),
        };

        let versions: BTreeSet<SecretVersionRef> =
            secrets.iter().map(Secret::version_ref).collect();
        let changed_since_restart = |kind: SecretKind| {
            self.state.running.is_some()
                && version_of(&versions, kind) != version_of(&self.state.running_secrets, kind)
        };
        let reason = if changed_since_restart(SecretKind::TlsKeypair) {
            LockReason::CertRotation
        } else {
            LockReason::Restart
        };
        let credentials_changed = changed_since_restart(SecretKind::InternalUserPassword);

        let users = secrets
            .internal_users
            .iter()
            .flat_map(|secret| {
                let names = KafkaSecurity::internal_users(secret.version);
                [
                    (names.sync, SYNC_PASSWORD_KEY),
                    (names.admin, ADMIN_PASSWORD_KEY),
                ]
                .into_iter()
                .filter_map(|(user, field)| {
                    secret
                        .get(field)
                        .map(|password| (user.to_string(), password.to_string()))
                })
            })
            .collect();

        let desired = Desired::Ready {
            fingerprint: artifact.fingerprint(),
            reason,
            credentials_changed,
        };
        Ok((
            desired,
            Some(DesiredConfig {
                artifact,
                secrets: versions,
                users,
            }),
        ))
    }

    /// `None` while the member keypair has not been issued yet.
    async fn resolve_secrets(
        &self,
        id: MemberId,
        tls: bool,
    ) -> Result<Option<ResolvedSecrets>, Error> {
        let credentials = &self.ctx.credentials;
        let (internal_users, keypair) = futures::join!(
            credentials.ensure(SecretKind::InternalUserPassword, SecretOwner::Cluster),
            async {
                if tls {
                    Some(
                        credentials
                            .ensure(SecretKind::TlsKeypair, SecretOwner::Member(id))
                            .await,
                    )
                } else {
                    None
                }
            }
        );
        let internal_users = internal_users.context(EnsureSecretSnafu {
            kind: SecretKind::InternalUserPassword,
        })?;

        let keypair = match keypair {
            None => {
                return Ok(Some(ResolvedSecrets {
                    internal_users: Some(internal_users),
                    ..ResolvedSecrets::default()
                }))
            }
            Some(Ok(keypair)) => keypair,
            Some(Err(credentials::Error::CertificatePending { key })) => {
                tracing::info!(%key, "waiting on TLS certificate");
                return Ok(None);
            }
            Some(Err(error)) => {
                return Err(error).context(EnsureSecretSnafu {
                    kind: SecretKind::TlsKeypair,
                })
            }
        };
        // after the keypair, so the bundle includes its CA chain
        let truststore = credentials
            .ensure(SecretKind::TlsTruststore, SecretOwner::Cluster)
            .await
            .context(EnsureSecretSnafu {
                kind: SecretKind::TlsTruststore,
            })?;

        Ok(Some(ResolvedSecrets {
            internal_users: Some(internal_users),
            keypair: Some(keypair),
            truststore: Some(truststore),
        }))
    }

    async fn execute(
        &mut self,
        id: MemberId,
        plan: &ReconciliationPlan,
        desired: Option<&DesiredConfig>,
        now: Timestamp,
    ) -> Result<Outcome, Error> {
        let ctx = self.ctx.clone();

        for action in &plan.actions {
            tracing::debug!(?action, "executing action");
            match action {
                Action::Register => {
                    ctx.directory
                        .register(self.local_member(id))
                        .context(UpdatePeerDirectorySnafu { member: id })?;
                }
                Action::WriteConfig { fingerprint } => {
                    let desired = desired.context(NoDesiredConfigSnafu)?;
                    ctx.supervisor
                        .write_config(&desired.artifact)
                        .await
                        .context(SuperviseSnafu {
                            operation: "configure",
                        })?;
                    tracing::info!(fingerprint = %fingerprint, "wrote configuration");
                    self.state.written = Some(fingerprint.clone());
                    self.state.written_secrets = desired.secrets.clone();
                    self.record_adoption(id)?;
                }
                Action::RequestLock { reason } => {
                    if !ctx
                        .lock
                        .try_acquire(id, *reason, now)
                        .context(RollingLockSnafu)?
                    {
                        let holder = ctx
                            .lock
                            .holder()
                            .context(RollingLockSnafu)?
                            .map(|holder| holder.member);
                        return Ok(Outcome::Halted(MemberStatus::OtherUnitRestarting {
                            holder,
                        }));
                    }
                }
                Action::StealLock { holder } => {
                    if let Some(stolen) =
                        ctx.lock.steal_if_expired(now).context(RollingLockSnafu)?
                    {
                        tracing::warn!(from = %stolen, expected = %holder, "took over expired rolling lock");
                    }
                }
                Action::Heartbeat => match ctx.lock.heartbeat(id, now) {
                    Ok(()) => {}
                    Err(rolling_lock::Error::LockStolen { holder, .. }) => {
                        tracing::warn!(?holder, "rolling lock was taken over, stopping this pass");
                        return Ok(Outcome::Halted(MemberStatus::OtherUnitRestarting {
                            holder,
                        }));
                    }
                    Err(error) => return Err(error).context(RollingLockSnafu),
                },
                Action::UpdateCredentials => {
                    let desired = desired.context(NoDesiredConfigSnafu)?;
                    ctx.supervisor
                        .update_credentials(&desired.users)
                        .await
                        .context(SuperviseSnafu {
                            operation: "update credentials of",
                        })?;
                }
                Action::Upgrade { version } => {
                    ctx.supervisor
                        .upgrade(version)
                        .await
                        .context(SuperviseSnafu {
                            operation: "upgrade",
                        })?;
                    tracing::info!(version = %version, "upgraded kafka");
                    self.state.running_version = Some(version.clone());
                }
                Action::Restart => {
                    ctx.supervisor.restart().await.context(SuperviseSnafu {
                        operation: "restart",
                    })?;
                    self.state.running = self.state.written.clone();
                    self.state.running_secrets = self.state.written_secrets.clone();
                    self.state.health_failures = 0;
                    self.record_adoption(id)?;
                }
                Action::MarkHealthy => {
                    ctx.directory
                        .update_health(id, MemberHealth::Healthy)
                        .context(UpdatePeerDirectorySnafu { member: id })?;
                    self.state.generation = ctx
                        .directory
                        .advance_generation(id)
                        .context(UpdatePeerDirectorySnafu { member: id })?;
                    self.state.health_failures = 0;
                    self.state.failed = false;
                }
                Action::MarkFailed { reason } => {
                    tracing::warn!(reason = %reason, "member did not become healthy");
                    self.state.failed = true;
                    // a retry restarts again
                    self.state.running = None;
                    ctx.directory
                        .update_health(id, MemberHealth::Degraded)
                        .context(UpdatePeerDirectorySnafu { member: id })?;
                }
                Action::ReportHealth(health) => {
                    ctx.directory
                        .update_health(id, *health)
                        .context(UpdatePeerDirectorySnafu { member: id })?;
                }
                Action::ReleaseLock => {
                    ctx.lock.release(id).context(RollingLockSnafu)?;
                }
                Action::StartRebalance => {
                    let rebalance = ctx
                        .rebalancer
                        .propose(RebalanceMode::Remove, id)
                        .await
                        .context(RebalanceSnafu)?;
                    tracing::info!(
                        plan = %rebalance.id,
                        moves = rebalance.partition_moves,
                        "evacuating partitions"
                    );
                    ctx.rebalancer
                        .execute(&rebalance)
                        .await
                        .context(RebalanceSnafu)?;
                    self.state.rebalance = Some(rebalance);
                }
                Action::RemoveMember => {
                    match ctx.directory.remove(id) {
                        Ok(_) => {}
                        Err(error) if error.is_precondition_failed() => {
                            tracing::warn!(error = %error, "member cannot be removed yet");
                            ctx.lock.release(id).context(RollingLockSnafu)?;
                            return Ok(Outcome::Halted(MemberStatus::QuorumWouldBreak));
                        }
                        Err(error) => {
                            return Err(error).context(UpdatePeerDirectorySnafu { member: id })
                        }
                    }
                    ctx.supervisor.stop().await.context(SuperviseSnafu {
                        operation: "stop",
                    })?;
                    ctx.credentials
                        .forget_member(id)
                        .await
                        .context(SecretLedgerSnafu)?;
                }
                Action::RetireSecrets => {
                    // users of a retired password version go first, the next rotation reuses them
                    let stale_users: Vec<String> = ctx
                        .credentials
                        .retirement_candidates()
                        .context(SecretLedgerSnafu)?
                        .into_iter()
                        .filter(|candidate| candidate.key.kind == SecretKind::InternalUserPassword)
                        .flat_map(|candidate| KafkaSecurity::internal_users(candidate.version).names())
                        .collect();
                    if !stale_users.is_empty() {
                        ctx.supervisor
                            .delete_credentials(&stale_users)
                            .await
                            .context(SuperviseSnafu {
                                operation: "delete credentials of",
                            })?;
                    }
                    let retired = ctx
                        .credentials
                        .retire_unreferenced()
                        .await
                        .context(SecretLedgerSnafu)?;
                    if !retired.is_empty() {
                        tracing::info!(?retired, "retired unreferenced secret versions");
                    }
                }
            }
        }
        Ok(Outcome::Completed)
    }

    /// The member depends on the secrets on disk as well as those the process runs with.
    fn record_adoption(&self, id: MemberId) -> Result<(), Error> {
        self.ctx
            .credentials
            .record_adoption(id, &self.state.written_secrets, &self.state.running_secrets)
            .context(SecretLedgerSnafu)
    }

    fn publish_discovery(&self, inputs: &ControllerInputs) -> Result<(), Error> {
        let roster = self
            .ctx
            .directory
            .roster()
            .context(ReadPeerDirectorySnafu)?;
        let connection = discovery::build_client_connection(
            &roster.members,
            &listener::resolve(inputs.relations()),
        );
        if discovery::publish(self.ctx.store.as_ref(), &connection).context(PublishDiscoverySnafu)? {
            tracing::info!(endpoints = connection.endpoints.len(), "published client connection data");
        }
        Ok(())
    }

    /// Reconcile on every tick, peer directory change and inputs change until `shutdown`
    /// resolves.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        let mut changes = self.ctx.directory.subscribe();
        let mut ticker = tokio::time::interval(self.ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let inputs_file = self.ctx.config.inputs_file.clone();
        let mut inputs_stamp = modified(&inputs_file).await;
        let mut roster_revision = self.ctx.directory.revision().ok();

        let mut failures = 0u32;
        let mut paused: Option<Requeue> = None;
        let mut paused_at = Instant::now();
        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let stamp = modified(&inputs_file).await;
                    let revision = self.ctx.directory.revision().ok();
                    if stamp != inputs_stamp {
                        inputs_stamp = stamp;
                        Event::InputsChanged
                    } else if revision != roster_revision {
                        roster_revision = revision;
                        Event::RosterRevised
                    } else {
                        Event::Tick
                    }
                }
                change = changes.recv() => match change {
                    Ok(change) => Event::PeerChanged(change),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "missed peer directory changes");
                        Event::RosterRevised
                    }
                    Err(RecvError::Closed) => Event::Tick,
                },
            };

            match (paused, &event) {
                (Some(Requeue::AwaitChange), Event::Tick) => continue,
                (Some(Requeue::After(delay)), Event::Tick) if paused_at.elapsed() < delay => {
                    continue
                }
                _ => {}
            }

            tracing::debug!(?event, "reconciling");
            match self.reconcile(Timestamp::now()).await {
                Ok(_) => {
                    failures = 0;
                    paused = None;
                }
                Err(error) => {
                    let requeue = error_policy(&error, failures);
                    tracing::error!(
                        controller = FULL_CONTROLLER_NAME,
                        category = error.category(),
                        error = &error as &dyn std::error::Error,
                        ?requeue,
                        "failed to reconcile"
                    );
                    failures = failures.saturating_add(1);
                    paused = Some(requeue);
                    paused_at = Instant::now();
                }
            }
        }
        tracing::info!(controller = FULL_CONTROLLER_NAME, "shutting down");
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .and_then(|metadata| metadata.modified())
        .ok()
}

fn version_of(versions: &BTreeSet<SecretVersionRef>, kind: SecretKind) -> Option<u64> {
    versions
        .iter()
        .find(|version| version.key.kind == kind)
        .map(|version| version.version)
}

/// The error followed by all its sources, for the member status.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
