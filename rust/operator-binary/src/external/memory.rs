//! In-memory collaborators for tests.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    config::{ConfigArtifact, Fingerprint},
    external::{
        CertificateAuthority, CertificateRequest, CommandFailedSnafu, Error, IssuedCertificate,
        ProcessHealth, ProcessSupervisor, RebalanceMode, RebalancePlan, RebalanceStatus,
        Rebalancer, SecretNotFoundSnafu, SecretStore,
    },
    model::{secret::SecretRef, MemberId},
};

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<SecretRef, BTreeMap<String, String>>>,
    grants: Mutex<Vec<(SecretRef, String)>>,
    fail_puts: Mutex<bool>,
}

impl MemorySecretStore {
    pub fn grants(&self) -> Vec<(SecretRef, String)> {
        self.grants.lock().clone()
    }

    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.lock() = fail;
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn put(
        &self,
        label: &str,
        content: BTreeMap<String, String>,
    ) -> Result<SecretRef, Error> {
        if *self.fail_puts.lock() {
            return CommandFailedSnafu {
                command: "put",
                status: "exit status: 1",
                stderr: "secret backend unavailable",
            }
            .fail();
        }
        let secret_ref = SecretRef(label.to_string());
        self.secrets.lock().insert(secret_ref.clone(), content);
        Ok(secret_ref)
    }

    async fn get(&self, secret_ref: &SecretRef) -> Result<BTreeMap<String, String>, Error> {
        self.secrets
            .lock()
            .get(secret_ref)
            .cloned()
            .ok_or_else(|| {
                SecretNotFoundSnafu {
                    secret_ref: secret_ref.clone(),
                }
                .build()
            })
    }

    async fn grant(&self, secret_ref: &SecretRef, principal: &str) -> Result<(), Error> {
        self.grants
            .lock()
            .push((secret_ref.clone(), principal.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CaState {
    ca_chain: String,
    requests: Vec<(String, CertificateRequest)>,
    issued: BTreeMap<String, IssuedCertificate>,
    revoked: Vec<String>,
    serial: u64,
}

/// Certificates are only issued when the test calls [`MemoryCertificateAuthority::issue_all`].
#[derive(Debug, Default)]
pub struct MemoryCertificateAuthority {
    state: Mutex<CaState>,
}

impl MemoryCertificateAuthority {
    pub fn new(ca_chain: &str) -> Self {
        Self {
            state: Mutex::new(CaState {
                ca_chain: ca_chain.to_string(),
                ..CaState::default()
            }),
        }
    }

    pub fn set_ca_chain(&self, ca_chain: &str) {
        self.state.lock().ca_chain = ca_chain.to_string();
    }

    pub fn requests(&self) -> Vec<CertificateRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn revoked(&self) -> Vec<String> {
        self.state.lock().revoked.clone()
    }

    /// Sign every outstanding request with the current CA chain.
    pub fn issue_all(&self) {
        let mut state = self.state.lock();
        let outstanding: Vec<_> = state
            .requests
            .iter()
            .filter(|(id, _)| !state.issued.contains_key(id))
            .map(|(id, request)| (id.clone(), request.common_name.clone()))
            .collect();
        for (id, common_name) in outstanding {
            state.serial += 1;
            let issued = IssuedCertificate {
                certificate_id: format!("cert-{}", state.serial),
                certificate: format!("-----BEGIN CERTIFICATE----- {common_name}"),
                ca_chain: state.ca_chain.clone(),
            };
            state.issued.insert(id, issued);
        }
    }
}

#[async_trait]
impl CertificateAuthority for MemoryCertificateAuthority {
    async fn request(&self, request: CertificateRequest) -> Result<String, Error> {
        let mut state = self.state.lock();
        let id = format!("request-{}", state.requests.len() + 1);
        state.requests.push((id.clone(), request));
        Ok(id)
    }

    async fn fetch(&self, request_id: &str) -> Result<Option<IssuedCertificate>, Error> {
        Ok(self.state.lock().issued.get(request_id).cloned())
    }

    async fn revoke(&self, certificate_id: &str) -> Result<(), Error> {
        self.state.lock().revoked.push(certificate_id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RebalancerState {
    partitions: BTreeMap<MemberId, u64>,
    running: Option<RebalancePlan>,
    /// `status` polls left before a running plan completes.
    remaining_polls: u32,
    polls_per_plan: u32,
    executed: Vec<RebalancePlan>,
}

/// Moves partitions off the target member a fixed number of status polls after `execute`.
#[derive(Debug, Default)]
pub struct MemoryRebalancer {
    state: Mutex<RebalancerState>,
}

impl MemoryRebalancer {
    pub fn new(partitions: impl IntoIterator<Item = (MemberId, u64)>, polls_per_plan: u32) -> Self {
        Self {
            state: Mutex::new(RebalancerState {
                partitions: partitions.into_iter().collect(),
                polls_per_plan,
                ..RebalancerState::default()
            }),
        }
    }

    pub fn executed(&self) -> Vec<RebalancePlan> {
        self.state.lock().executed.clone()
    }
}

#[async_trait]
impl Rebalancer for MemoryRebalancer {
    async fn propose(&self, mode: RebalanceMode, target: MemberId) -> Result<RebalancePlan, Error> {
        let state = self.state.lock();
        Ok(RebalancePlan {
            id: format!("{mode}-{target}-{}", state.executed.len() + 1),
            mode,
            target,
            partition_moves: state.partitions.get(&target).copied().unwrap_or_default(),
        })
    }

    async fn execute(&self, plan: &RebalancePlan) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.remaining_polls = state.polls_per_plan;
        state.running = Some(plan.clone());
        state.executed.push(plan.clone());
        Ok(())
    }

    async fn status(&self) -> Result<RebalanceStatus, Error> {
        let mut state = self.state.lock();
        let Some(plan) = state.running.clone() else {
            return Ok(RebalanceStatus::Completed);
        };
        if state.remaining_polls > 0 {
            state.remaining_polls -= 1;
            return Ok(RebalanceStatus::Running);
        }

        let moved = state.partitions.remove(&plan.target).unwrap_or_default();
        let receivers: Vec<MemberId> = state.partitions.keys().copied().collect();
        if let Some(receiver) = receivers.first() {
            *state.partitions.entry(*receiver).or_default() += moved;
        }
        state.running = None;
        Ok(RebalanceStatus::Completed)
    }

    async fn partitions_on(&self, member: MemberId) -> Result<u64, Error> {
        Ok(self
            .state
            .lock()
            .partitions
            .get(&member)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SupervisorEvent {
    ConfigWritten {
        member: MemberId,
        fingerprint: Fingerprint,
    },
    Restarted(MemberId),
    Healthy(MemberId),
    Upgraded {
        member: MemberId,
        version: String,
    },
    CredentialsUpdated(MemberId),
    CredentialsDeleted {
        member: MemberId,
        users: Vec<String>,
    },
    Stopped(MemberId),
}

/// Supervisor events of all members in the order they happened, and the SCRAM users the
/// members share through the cluster metadata.
#[derive(Clone, Debug, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SupervisorEvent>>>,
    users: Arc<Mutex<BTreeMap<String, String>>>,
}

impl EventLog {
    pub fn push(&self, event: SupervisorEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.events.lock().clone()
    }

    pub fn users(&self) -> BTreeMap<String, String> {
        self.users.lock().clone()
    }
}

#[derive(Debug, Default)]
struct SupervisorState {
    artifact: Option<ConfigArtifact>,
    /// What the process loaded on its last restart.
    running_artifact: Option<ConfigArtifact>,
    running: bool,
    /// Health results handed out before anything else, front first.
    scripted_health: VecDeque<ProcessHealth>,
    /// `health` polls answered with `Starting` after a restart.
    starting_polls: u32,
    remaining_starting: u32,
    awaiting_healthy: bool,
    fail_restart: bool,
    version: Option<String>,
}

#[derive(Debug)]
pub struct MemorySupervisor {
    member: MemberId,
    log: EventLog,
    state: Mutex<SupervisorState>,
}

impl MemorySupervisor {
    pub fn new(member: MemberId, log: EventLog, starting_polls: u32) -> Self {
        Self {
            member,
            log,
            state: Mutex::new(SupervisorState {
                starting_polls,
                ..SupervisorState::default()
            }),
        }
    }

    pub fn artifact(&self) -> Option<ConfigArtifact> {
        self.state.lock().artifact.clone()
    }

    pub fn running_artifact(&self) -> Option<ConfigArtifact> {
        self.state.lock().running_artifact.clone()
    }

    pub fn version(&self) -> Option<String> {
        self.state.lock().version.clone()
    }

    pub fn script_health(&self, health: impl IntoIterator<Item = ProcessHealth>) {
        self.state.lock().scripted_health.extend(health);
    }

    pub fn fail_restarts(&self, fail: bool) {
        self.state.lock().fail_restart = fail;
    }
}

#[async_trait]
impl ProcessSupervisor for MemorySupervisor {
    async fn write_config(&self, artifact: &ConfigArtifact) -> Result<(), Error> {
        self.state.lock().artifact = Some(artifact.clone());
        self.log.push(SupervisorEvent::ConfigWritten {
            member: self.member,
            fingerprint: artifact.fingerprint(),
        });
        Ok(())
    }

    async fn restart(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.fail_restart {
            return CommandFailedSnafu {
                command: "restart",
                status: "exit status: 1",
                stderr: "kafka did not stop in time",
            }
            .fail();
        }
        state.running = true;
        state.running_artifact = state.artifact.clone();
        state.remaining_starting = state.starting_polls;
        state.awaiting_healthy = true;
        self.log.push(SupervisorEvent::Restarted(self.member));
        Ok(())
    }

    async fn health(&self) -> Result<ProcessHealth, Error> {
        let mut state = self.state.lock();
        if let Some(health) = state.scripted_health.pop_front() {
            return Ok(health);
        }
        if !state.running {
            return Ok(ProcessHealth::Unhealthy {
                reason: "not running".to_string(),
            });
        }
        if state.remaining_starting > 0 {
            state.remaining_starting -= 1;
            return Ok(ProcessHealth::Starting);
        }
        if std::mem::take(&mut state.awaiting_healthy) {
            self.log.push(SupervisorEvent::Healthy(self.member));
        }
        Ok(ProcessHealth::Healthy)
    }

    async fn upgrade(&self, version: &str) -> Result<(), Error> {
        self.state.lock().version = Some(version.to_string());
        self.log.push(SupervisorEvent::Upgraded {
            member: self.member,
            version: version.to_string(),
        });
        Ok(())
    }

    async fn update_credentials(&self, users: &BTreeMap<String, String>) -> Result<(), Error> {
        self.log.users.lock().extend(users.clone());
        self.log
            .push(SupervisorEvent::CredentialsUpdated(self.member));
        Ok(())
    }

    async fn delete_credentials(&self, users: &[String]) -> Result<(), Error> {
        let mut registered = self.log.users.lock();
        for user in users {
            registered.remove(user);
        }
        self.log.push(SupervisorEvent::CredentialsDeleted {
            member: self.member,
            users: users.to_vec(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.state.lock().running = false;
        self.log.push(SupervisorEvent::Stopped(self.member));
        Ok(())
    }
}
