//! The per-member reconciliation state machine.
//!
//! [`compute_plan`] is a pure function from what a member observed to the ordered actions that
//! move it one step closer to its desired state. Executing the plan is the job of
//! [`crate::kafka_controller`].
use std::fmt::{self, Formatter};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    config::Fingerprint,
    external::ProcessHealth,
    model::{MemberHealth, MemberId},
    rolling_lock::LockReason,
};

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MemberState {
    #[default]
    Unregistered,
    Provisioning,
    AwaitingRestart,
    Restarting,
    Healthy,
    Draining,
    Removed,
}

/// The condition a member reports to operators. Always names what currently blocks progress.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "condition")]
pub enum MemberStatus {
    #[default]
    Registering,
    WaitingOnCertificate,
    InvalidConfiguration {
        reason: String,
    },
    WaitingToRestart,
    OtherUnitRestarting {
        holder: Option<MemberId>,
    },
    Restarting,
    HealthCheckFailed {
        reason: String,
    },
    Active,
    DrainingPartitions {
        remaining: Option<u64>,
    },
    RebalanceFailed,
    QuorumWouldBreak,
    UpgradeIncompatible {
        current: String,
        target: String,
    },
    Removed,
}

impl MemberStatus {
    /// Whether the member needs operator attention.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            MemberStatus::InvalidConfiguration { .. }
                | MemberStatus::HealthCheckFailed { .. }
                | MemberStatus::RebalanceFailed
                | MemberStatus::UpgradeIncompatible { .. }
        )
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Registering => write!(f, "registering with peers"),
            MemberStatus::WaitingOnCertificate => write!(f, "waiting on TLS certificate"),
            MemberStatus::InvalidConfiguration { reason } => {
                write!(f, "invalid configuration: {reason}")
            }
            MemberStatus::WaitingToRestart => write!(f, "waiting to restart"),
            MemberStatus::OtherUnitRestarting { .. } => write!(f, "other unit restarting first"),
            MemberStatus::Restarting => write!(f, "restarting"),
            MemberStatus::HealthCheckFailed { reason } => {
                write!(f, "health check failed: {reason}")
            }
            MemberStatus::Active => write!(f, "active"),
            MemberStatus::DrainingPartitions {
                remaining: Some(remaining),
            } => write!(f, "draining partitions ({remaining} left)"),
            MemberStatus::DrainingPartitions { remaining: None } => {
                write!(f, "draining partitions")
            }
            MemberStatus::RebalanceFailed => write!(f, "partition rebalance failed"),
            MemberStatus::QuorumWouldBreak => {
                write!(f, "removal would break the controller quorum")
            }
            MemberStatus::UpgradeIncompatible { .. } => {
                write!(f, "upgrade incompatible — rollback required")
            }
            MemberStatus::Removed => write!(f, "removed"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Desired {
    /// The configuration this member should run.
    Ready {
        fingerprint: Fingerprint,
        /// Lock reason of a restart that applies this configuration.
        reason: LockReason,
        /// The internal user passwords differ from the ones the member runs with.
        credentials_changed: bool,
    },
    /// The configuration cannot be produced yet.
    Blocked(MemberStatus),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LockView {
    Free,
    HeldBySelf,
    HeldByOther { holder: MemberId, expired: bool },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpgradeView {
    UpToDate,
    Pending { version: String },
    Incompatible { current: String, target: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainView {
    /// The member holds no partitions (controller-only).
    NotNeeded,
    NotStarted,
    Running { remaining: u64 },
    Completed { remaining: u64 },
    Failed,
}

/// Everything [`compute_plan`] decides on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Observed {
    pub member: MemberId,
    pub state: MemberState,
    pub registered: bool,
    pub desired: Desired,
    /// Fingerprint of the configuration on disk.
    pub written: Option<Fingerprint>,
    /// Fingerprint of the configuration the process was last restarted with.
    pub running: Option<Fingerprint>,
    pub lock: LockView,
    pub health: Option<ProcessHealth>,
    pub reported_health: MemberHealth,
    /// Consecutive health polls that did not report healthy since the last restart.
    pub health_failures: u32,
    pub health_check_retries: u32,
    /// The last restart exhausted its health checks.
    pub failed: bool,
    pub scale_down: bool,
    pub drain: DrainView,
    pub upgrade: UpgradeView,
    pub draining_secrets: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Register,
    WriteConfig { fingerprint: Fingerprint },
    RequestLock { reason: LockReason },
    StealLock { holder: MemberId },
    Heartbeat,
    UpdateCredentials,
    Upgrade { version: String },
    Restart,
    MarkHealthy,
    MarkFailed { reason: String },
    ReportHealth(MemberHealth),
    ReleaseLock,
    StartRebalance,
    RemoveMember,
    RetireSecrets,
}

impl Action {
    /// Actions that take capacity away from the cluster.
    pub fn is_disruptive(&self) -> bool {
        matches!(self, Action::Restart | Action::RemoveMember)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReconciliationPlan {
    pub actions: Vec<Action>,
    /// State of the member once every action succeeded.
    pub target: MemberState,
    pub status: MemberStatus,
}

impl ReconciliationPlan {
    fn new(target: MemberState, status: MemberStatus) -> Self {
        Self {
            actions: vec![],
            target,
            status,
        }
    }

    fn push(&mut self, action: Action) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn disruptive_actions(&self) -> usize {
        self.actions
            .iter()
            .filter(|action| action.is_disruptive())
            .count()
    }
}

/// Compute the next step for one member.
pub fn compute_plan(observed: &Observed) -> ReconciliationPlan {
    let mut plan = match observed.state {
        MemberState::Unregistered => {
            let mut plan =
                ReconciliationPlan::new(MemberState::Provisioning, MemberStatus::Registering);
            plan.push(Action::Register);
            plan
        }
        MemberState::Provisioning => provisioning(observed),
        MemberState::AwaitingRestart => awaiting_restart(observed),
        MemberState::Restarting => restarting(observed),
        MemberState::Healthy => healthy(observed),
        MemberState::Draining => draining(observed),
        MemberState::Removed => {
            ReconciliationPlan::new(MemberState::Removed, MemberStatus::Removed)
        }
    };

    // the directory lost our record, e.g. after the shared store was restored
    if !observed.registered
        && !matches!(
            observed.state,
            MemberState::Unregistered | MemberState::Removed
        )
    {
        plan.actions.insert(0, Action::Register);
    }
    plan
}

fn provisioning(observed: &Observed) -> ReconciliationPlan {
    match &observed.desired {
        Desired::Blocked(status) => {
            ReconciliationPlan::new(MemberState::Provisioning, status.clone())
        }
        Desired::Ready { fingerprint, .. } => {
            let mut plan = ReconciliationPlan::new(
                MemberState::AwaitingRestart,
                MemberStatus::WaitingToRestart,
            );
            if observed.written.as_ref() != Some(fingerprint) {
                plan.push(Action::WriteConfig {
                    fingerprint: fingerprint.clone(),
                });
            }
            plan
        }
    }
}

fn awaiting_restart(observed: &Observed) -> ReconciliationPlan {
    let mut plan =
        ReconciliationPlan::new(MemberState::AwaitingRestart, MemberStatus::WaitingToRestart);
    let (fingerprint, reason, credentials_changed) = match &observed.desired {
        Desired::Ready {
            fingerprint,
            reason,
            credentials_changed,
        } => (fingerprint, *reason, *credentials_changed),
        Desired::Blocked(status) => {
            plan.status = status.clone();
            release_if_held(observed, &mut plan);
            return plan;
        }
    };

    if observed.written.as_ref() != Some(fingerprint) {
        plan.push(Action::WriteConfig {
            fingerprint: fingerprint.clone(),
        });
    }

    if let UpgradeView::Incompatible { current, target } = &observed.upgrade {
        plan.status = MemberStatus::UpgradeIncompatible {
            current: current.clone(),
            target: target.clone(),
        };
        release_if_held(observed, &mut plan);
        return plan;
    }
    if observed.failed {
        plan.status = MemberStatus::HealthCheckFailed {
            reason: format!(
                "not healthy after {} checks, waiting for a retry",
                observed.health_check_retries
            ),
        };
        release_if_held(observed, &mut plan);
        return plan;
    }

    let upgrade_to = match &observed.upgrade {
        UpgradeView::Pending { version } => Some(version.clone()),
        _ => None,
    };
    if observed.running.as_ref() == Some(fingerprint) && upgrade_to.is_none() {
        // already running the desired configuration, e.g. after the controller itself restarted
        release_if_held(observed, &mut plan);
        plan.target = MemberState::Healthy;
        plan.status = MemberStatus::Active;
        return plan;
    }

    let reason = if upgrade_to.is_some() {
        LockReason::Upgrade
    } else {
        reason
    };
    if !acquire(observed, reason, &mut plan) {
        return plan;
    }
    if credentials_changed {
        plan.push(Action::UpdateCredentials);
    }
    if let Some(version) = upgrade_to {
        plan.push(Action::Upgrade { version });
    }
    plan.push(Action::Restart);
    plan.target = MemberState::Restarting;
    plan.status = MemberStatus::Restarting;
    plan
}

fn restarting(observed: &Observed) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::new(MemberState::Restarting, MemberStatus::Restarting);

    match &observed.health {
        Some(ProcessHealth::Healthy) => {
            plan.push(Action::MarkHealthy);
            release_if_held(observed, &mut plan);
            plan.target = MemberState::Healthy;
            plan.status = MemberStatus::Active;
        }
        health if observed.health_failures >= observed.health_check_retries => {
            let reason = match health {
                Some(ProcessHealth::Unhealthy { reason }) => reason.clone(),
                _ => format!(
                    "still starting after {} checks",
                    observed.health_failures
                ),
            };
            release_if_held(observed, &mut plan);
            plan.push(Action::MarkFailed {
                reason: reason.clone(),
            });
            plan.target = MemberState::AwaitingRestart;
            plan.status = MemberStatus::HealthCheckFailed { reason };
        }
        _ => {
            if observed.lock == LockView::HeldBySelf {
                plan.push(Action::Heartbeat);
            }
        }
    }
    plan
}

fn healthy(observed: &Observed) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::new(MemberState::Healthy, MemberStatus::Active);

    if let Some(health) = &observed.health {
        let health = MemberHealth::from(health);
        if health != observed.reported_health {
            plan.push(Action::ReportHealth(health));
        }
    }

    if observed.scale_down {
        if acquire(observed, LockReason::Scale, &mut plan) {
            plan.target = MemberState::Draining;
            plan.status = MemberStatus::DrainingPartitions { remaining: None };
        }
        return plan;
    }

    release_if_held(observed, &mut plan);
    match &observed.desired {
        Desired::Blocked(status) => plan.status = status.clone(),
        Desired::Ready { fingerprint, .. } => {
            let upgrade_pending = matches!(observed.upgrade, UpgradeView::Pending { .. });
            if let UpgradeView::Incompatible { current, target } = &observed.upgrade {
                plan.status = MemberStatus::UpgradeIncompatible {
                    current: current.clone(),
                    target: target.clone(),
                };
            } else if observed.written.as_ref() != Some(fingerprint)
                || observed.running.as_ref() != Some(fingerprint)
                || upgrade_pending
            {
                if observed.written.as_ref() != Some(fingerprint) {
                    plan.push(Action::WriteConfig {
                        fingerprint: fingerprint.clone(),
                    });
                }
                plan.target = MemberState::AwaitingRestart;
                plan.status = MemberStatus::WaitingToRestart;
                return plan;
            }
        }
    }

    if observed.draining_secrets {
        plan.push(Action::RetireSecrets);
    }
    plan
}

fn draining(observed: &Observed) -> ReconciliationPlan {
    let mut plan = ReconciliationPlan::new(
        MemberState::Draining,
        MemberStatus::DrainingPartitions { remaining: None },
    );

    if !observed.scale_down {
        // scale-down was withdrawn, moved partitions stay where they are
        release_if_held(observed, &mut plan);
        plan.target = MemberState::Healthy;
        plan.status = MemberStatus::Active;
        return plan;
    }

    match observed.drain {
        DrainView::NotNeeded | DrainView::Completed { remaining: 0 } => {
            // the removal itself is disruptive, it happens under the scale lock
            if !acquire(observed, LockReason::Scale, &mut plan) {
                return plan;
            }
            plan.push(Action::RemoveMember).push(Action::ReleaseLock);
            plan.target = MemberState::Removed;
            plan.status = MemberStatus::Removed;
        }
        DrainView::Running { remaining } => {
            if observed.lock == LockView::HeldBySelf {
                plan.push(Action::Heartbeat);
            }
            plan.status = MemberStatus::DrainingPartitions {
                remaining: Some(remaining),
            };
        }
        DrainView::Failed => {
            // needs a retry intent
            release_if_held(observed, &mut plan);
            plan.status = MemberStatus::RebalanceFailed;
        }
        DrainView::NotStarted | DrainView::Completed { .. } => {
            if let DrainView::Completed { remaining } = observed.drain {
                plan.status = MemberStatus::DrainingPartitions {
                    remaining: Some(remaining),
                };
            }
            if acquire(observed, LockReason::Scale, &mut plan) {
                plan.push(Action::StartRebalance);
            }
        }
    }
    plan
}

/// Push the actions that make this member the lock holder. Returns `false` (and sets the
/// status) if another member holds a live lock.
fn acquire(observed: &Observed, reason: LockReason, plan: &mut ReconciliationPlan) -> bool {
    match observed.lock {
        LockView::HeldBySelf => {
            plan.push(Action::Heartbeat);
        }
        LockView::Free => {
            plan.push(Action::RequestLock { reason });
        }
        LockView::HeldByOther {
            holder,
            expired: true,
        } => {
            plan.push(Action::StealLock { holder })
                .push(Action::RequestLock { reason });
        }
        LockView::HeldByOther {
            holder,
            expired: false,
        } => {
            plan.status = MemberStatus::OtherUnitRestarting {
                holder: Some(holder),
            };
            return false;
        }
    }
    true
}

fn release_if_held(observed: &Observed, plan: &mut ReconciliationPlan) {
    if observed.lock == LockView::HeldBySelf {
        plan.push(Action::ReleaseLock);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn fingerprint(value: &str) -> Fingerprint {
        Fingerprint(value.to_string())
    }

    fn ready(value: &str) -> Desired {
        Desired::Ready {
            fingerprint: fingerprint(value),
            reason: LockReason::Restart,
            credentials_changed: false,
        }
    }

    fn observed(state: MemberState) -> Observed {
        Observed {
            member: MemberId(1),
            state,
            registered: true,
            desired: ready("b"),
            written: Some(fingerprint("b")),
            running: Some(fingerprint("a")),
            lock: LockView::Free,
            health: None,
            reported_health: MemberHealth::Healthy,
            health_failures: 0,
            health_check_retries: 3,
            failed: false,
            scale_down: false,
            drain: DrainView::NotStarted,
            upgrade: UpgradeView::UpToDate,
            draining_secrets: false,
        }
    }

    #[test]
    fn test_unregistered_member_registers() {
        let plan = compute_plan(&observed(MemberState::Unregistered));
        assert_eq!(plan.actions, vec![Action::Register]);
        assert_eq!(plan.target, MemberState::Provisioning);
    }

    #[test]
    fn test_provisioning_waits_for_certificate() {
        let mut observed = observed(MemberState::Provisioning);
        observed.desired = Desired::Blocked(MemberStatus::WaitingOnCertificate);

        let plan = compute_plan(&observed);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.target, MemberState::Provisioning);
        assert_eq!(plan.status.to_string(), "waiting on TLS certificate");
    }

    #[test]
    fn test_provisioning_writes_config() {
        let mut observed = observed(MemberState::Provisioning);
        observed.written = None;

        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![Action::WriteConfig {
                fingerprint: fingerprint("b")
            }]
        );
        assert_eq!(plan.target, MemberState::AwaitingRestart);
    }

    #[rstest]
    #[case::free(
        LockView::Free,
        vec![Action::RequestLock { reason: LockReason::Restart }, Action::Restart],
        MemberState::Restarting
    )]
    #[case::own(LockView::HeldBySelf, vec![Action::Heartbeat, Action::Restart], MemberState::Restarting)]
    #[case::other(
        LockView::HeldByOther { holder: MemberId(4), expired: false },
        vec![],
        MemberState::AwaitingRestart
    )]
    #[case::expired(
        LockView::HeldByOther { holder: MemberId(4), expired: true },
        vec![
            Action::StealLock { holder: MemberId(4) },
            Action::RequestLock { reason: LockReason::Restart },
            Action::Restart,
        ],
        MemberState::Restarting
    )]
    fn test_restart_requires_lock(
        #[case] lock: LockView,
        #[case] actions: Vec<Action>,
        #[case] target: MemberState,
    ) {
        let mut observed = observed(MemberState::AwaitingRestart);
        observed.lock = lock;

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, actions);
        assert_eq!(plan.target, target);
        if target == MemberState::AwaitingRestart {
            assert_eq!(plan.status.to_string(), "other unit restarting first");
        }
    }

    #[test]
    fn test_upgrade_and_credentials_are_applied_with_the_restart() {
        let mut observed = observed(MemberState::AwaitingRestart);
        observed.desired = Desired::Ready {
            fingerprint: fingerprint("b"),
            reason: LockReason::Restart,
            credentials_changed: true,
        };
        observed.upgrade = UpgradeView::Pending {
            version: "3.9.1".to_string(),
        };

        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![
                Action::RequestLock {
                    reason: LockReason::Upgrade
                },
                Action::UpdateCredentials,
                Action::Upgrade {
                    version: "3.9.1".to_string()
                },
                Action::Restart,
            ]
        );
    }

    #[test]
    fn test_incompatible_upgrade_blocks_restart() {
        let mut observed = observed(MemberState::AwaitingRestart);
        observed.lock = LockView::HeldBySelf;
        observed.upgrade = UpgradeView::Incompatible {
            current: "3.9.1".to_string(),
            target: "3.8.0".to_string(),
        };

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::ReleaseLock]);
        assert_eq!(
            plan.status.to_string(),
            "upgrade incompatible — rollback required"
        );
        assert!(plan.status.is_blocked());
    }

    #[test]
    fn test_already_running_config_needs_no_restart() {
        let mut observed = observed(MemberState::AwaitingRestart);
        observed.running = Some(fingerprint("b"));

        let plan = compute_plan(&observed);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.target, MemberState::Healthy);
    }

    #[test]
    fn test_healthy_restart_releases_lock() {
        let mut observed = observed(MemberState::Restarting);
        observed.lock = LockView::HeldBySelf;
        observed.health = Some(ProcessHealth::Healthy);

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::MarkHealthy, Action::ReleaseLock]);
        assert_eq!(plan.target, MemberState::Healthy);
    }

    #[test]
    fn test_health_check_failures_are_bounded() {
        let mut observed = observed(MemberState::Restarting);
        observed.lock = LockView::HeldBySelf;
        observed.health = Some(ProcessHealth::Unhealthy {
            reason: "broker not registered".to_string(),
        });

        observed.health_failures = 2;
        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::Heartbeat]);
        assert_eq!(plan.target, MemberState::Restarting);

        observed.health_failures = 3;
        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![
                Action::ReleaseLock,
                Action::MarkFailed {
                    reason: "broker not registered".to_string()
                }
            ]
        );
        assert_eq!(plan.target, MemberState::AwaitingRestart);

        // not retried automatically
        let mut observed = self::observed(MemberState::AwaitingRestart);
        observed.failed = true;
        let plan = compute_plan(&observed);
        assert!(plan.actions.is_empty());
        assert!(plan.status.is_blocked());
    }

    #[test]
    fn test_config_change_on_healthy_member() {
        let mut observed = observed(MemberState::Healthy);
        observed.desired = ready("c");

        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![Action::WriteConfig {
                fingerprint: fingerprint("c")
            }]
        );
        assert_eq!(plan.target, MemberState::AwaitingRestart);
    }

    #[test]
    fn test_idle_healthy_member_retires_secrets() {
        let mut observed = observed(MemberState::Healthy);
        observed.running = Some(fingerprint("b"));
        observed.draining_secrets = true;
        observed.health = Some(ProcessHealth::Starting);

        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![
                Action::ReportHealth(MemberHealth::Starting),
                Action::RetireSecrets
            ]
        );
        assert_eq!(plan.target, MemberState::Healthy);
    }

    #[test]
    fn test_scale_down_drains_before_removal() {
        let mut observed = observed(MemberState::Healthy);
        observed.scale_down = true;
        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![Action::RequestLock {
                reason: LockReason::Scale
            }]
        );
        assert_eq!(plan.target, MemberState::Draining);

        let mut observed = self::observed(MemberState::Draining);
        observed.scale_down = true;
        observed.lock = LockView::HeldBySelf;
        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::Heartbeat, Action::StartRebalance]);

        observed.drain = DrainView::Running { remaining: 12 };
        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::Heartbeat]);
        assert_eq!(plan.status.to_string(), "draining partitions (12 left)");

        observed.drain = DrainView::Completed { remaining: 0 };
        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![Action::Heartbeat, Action::RemoveMember, Action::ReleaseLock]
        );
        assert_eq!(plan.target, MemberState::Removed);
    }

    #[test]
    fn test_removal_waits_for_the_lock() {
        let mut observed = observed(MemberState::Draining);
        observed.scale_down = true;
        observed.drain = DrainView::NotNeeded;
        observed.lock = LockView::HeldByOther {
            holder: MemberId(3),
            expired: false,
        };

        let plan = compute_plan(&observed);
        assert!(plan.actions.is_empty());
        assert_eq!(plan.target, MemberState::Draining);
        assert_eq!(
            plan.status,
            MemberStatus::OtherUnitRestarting {
                holder: Some(MemberId(3))
            }
        );

        observed.lock = LockView::Free;
        let plan = compute_plan(&observed);
        assert_eq!(
            plan.actions,
            vec![
                Action::RequestLock {
                    reason: LockReason::Scale
                },
                Action::RemoveMember,
                Action::ReleaseLock
            ]
        );
    }

    #[test]
    fn test_failed_rebalance_waits_for_retry() {
        let mut observed = observed(MemberState::Draining);
        observed.scale_down = true;
        observed.lock = LockView::HeldBySelf;
        observed.drain = DrainView::Failed;

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::ReleaseLock]);
        assert_eq!(plan.target, MemberState::Draining);
        assert_eq!(plan.status, MemberStatus::RebalanceFailed);
    }

    #[test]
    fn test_withdrawn_scale_down_returns_to_healthy() {
        let mut observed = observed(MemberState::Draining);
        observed.lock = LockView::HeldBySelf;

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::ReleaseLock]);
        assert_eq!(plan.target, MemberState::Healthy);
    }

    #[test]
    fn test_lost_directory_record_is_restored() {
        let mut observed = observed(MemberState::Healthy);
        observed.registered = false;
        observed.running = Some(fingerprint("b"));

        let plan = compute_plan(&observed);
        assert_eq!(plan.actions, vec![Action::Register]);
    }

    fn all_observations() -> Vec<Observed> {
        let states = [
            MemberState::Unregistered,
            MemberState::Provisioning,
            MemberState::AwaitingRestart,
            MemberState::Restarting,
            MemberState::Healthy,
            MemberState::Draining,
            MemberState::Removed,
        ];
        let locks = [
            LockView::Free,
            LockView::HeldBySelf,
            LockView::HeldByOther {
                holder: MemberId(7),
                expired: false,
            },
            LockView::HeldByOther {
                holder: MemberId(7),
                expired: true,
            },
        ];
        let drains = [
            DrainView::NotNeeded,
            DrainView::NotStarted,
            DrainView::Running { remaining: 3 },
            DrainView::Completed { remaining: 0 },
            DrainView::Completed { remaining: 3 },
            DrainView::Failed,
        ];
        let healths = [
            None,
            Some(ProcessHealth::Healthy),
            Some(ProcessHealth::Starting),
        ];
        let upgrades = [
            UpgradeView::UpToDate,
            UpgradeView::Pending {
                version: "3.9.1".to_string(),
            },
        ];

        let mut all = vec![];
        for state in states {
            for lock in &locks {
                for drain in drains {
                    for health in &healths {
                        for upgrade in &upgrades {
                            for flags in 0..8u8 {
                                let mut observed = observed(state);
                                observed.lock = lock.clone();
                                observed.drain = drain;
                                observed.health = health.clone();
                                observed.upgrade = upgrade.clone();
                                observed.scale_down = flags & 1 != 0;
                                observed.registered = flags & 2 != 0;
                                observed.health_failures = if flags & 4 != 0 { 5 } else { 0 };
                                all.push(observed);
                            }
                        }
                    }
                }
            }
        }
        all
    }

    #[test]
    fn test_plans_hold_the_safety_invariants() {
        for observed in all_observations() {
            let plan = compute_plan(&observed);

            assert!(
                plan.disruptive_actions() <= 1,
                "{observed:?} produced {plan:?}"
            );

            // restarts only ever happen while holding the lock
            if plan.actions.contains(&Action::Restart) {
                assert!(
                    observed.lock == LockView::HeldBySelf
                        || plan
                            .actions
                            .iter()
                            .any(|action| matches!(action, Action::RequestLock { .. })),
                    "{observed:?} produced {plan:?}"
                );
            }

            // removal only under the lock, once the partitions are gone
            if let Some(remove) = plan
                .actions
                .iter()
                .position(|action| *action == Action::RemoveMember)
            {
                assert!(matches!(
                    observed.drain,
                    DrainView::NotNeeded | DrainView::Completed { remaining: 0 }
                ));
                assert!(!plan.actions[..remove].contains(&Action::ReleaseLock));
                assert!(plan.actions[remove..].contains(&Action::ReleaseLock));
                assert!(
                    observed.lock == LockView::HeldBySelf
                        || plan.actions[..remove].iter().any(|action| matches!(
                            action,
                            Action::RequestLock {
                                reason: LockReason::Scale
                            }
                        )),
                    "{observed:?} produced {plan:?}"
                );
            }
            if plan.target == MemberState::Removed && observed.state == MemberState::Draining {
                assert!(!matches!(
                    observed.drain,
                    DrainView::Running { .. } | DrainView::Completed { remaining: 3 }
                ));
            }
        }
    }
}
