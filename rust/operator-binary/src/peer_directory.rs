//! The set of known cluster members, kept as one versioned roster record in the shared store.
use std::{collections::BTreeSet, sync::Arc};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tokio::sync::broadcast;

use crate::{
    model::{role::KafkaRole, ClusterMember, MemberHealth, MemberId},
    rolling_lock::{LockReason, LockRecord, LOCK_KEY},
    store::{self, SharedStore},
};

pub const ROSTER_KEY: &str = "peer-roster";
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to access the peer roster"))]
    Store { source: store::Error },

    #[snafu(display("member id {id} belonged to a removed member and cannot be reused"))]
    IdRetired { id: MemberId },

    #[snafu(display("member {id} is not registered"))]
    UnknownMember { id: MemberId },

    #[snafu(display("member {id} still holds the rolling lock ({reason})"))]
    MemberHoldsLock { id: MemberId, reason: LockReason },

    #[snafu(display(
        "removing member {id} would leave {remaining} live controllers, the quorum needs {required}"
    ))]
    QuorumTooSmall {
        id: MemberId,
        remaining: usize,
        required: usize,
    },
}

impl Error {
    /// Whether the operation was refused to protect a cluster invariant and may succeed later.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(
            self,
            Error::MemberHoldsLock { .. } | Error::QuorumTooSmall { .. }
        )
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Roster {
    /// Sorted by member id.
    #[serde(default)]
    pub members: Vec<ClusterMember>,
    /// Ids of removed members, never handed out again.
    #[serde(default)]
    pub retired: BTreeSet<MemberId>,
    #[serde(default)]
    pub next_id: u32,
}

impl Roster {
    pub fn get(&self, id: MemberId) -> Option<&ClusterMember> {
        self.members.iter().find(|member| member.id == id)
    }

    fn get_mut(&mut self, id: MemberId) -> Option<&mut ClusterMember> {
        self.members.iter_mut().find(|member| member.id == id)
    }

    pub fn controllers(&self) -> impl Iterator<Item = &ClusterMember> {
        self.members
            .iter()
            .filter(|member| member.has_role(&KafkaRole::Controller))
    }

    /// Majority of the controller-role members currently registered.
    ///
    /// The count shrinks with every removal, so a 3-controller roster may drop to 2 but never to
    /// 1: each step has to keep a majority of the set it starts from, live.
    pub fn quorum_size(&self) -> usize {
        self.controllers().count() / 2 + 1
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DirectoryChange {
    Registered(MemberId),
    HealthChanged { id: MemberId, health: MemberHealth },
    GenerationAdvanced { id: MemberId, generation: u64 },
    Removed(MemberId),
}

#[derive(Clone, Debug)]
pub struct PeerDirectory {
    store: Arc<dyn SharedStore>,
    changes: broadcast::Sender<DirectoryChange>,
}

impl PeerDirectory {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { store, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: DirectoryChange) {
        tracing::debug!(?change, "peer directory changed");
        // nobody listening is fine
        let _ = self.changes.send(change);
    }

    pub fn roster(&self) -> Result<Roster, Error> {
        Ok(store::load::<Roster>(self.store.as_ref(), ROSTER_KEY)
            .context(StoreSnafu)?
            .map(|record| record.value)
            .unwrap_or_default())
    }

    /// Revision of the roster record, changes whenever any member mutates the directory.
    pub fn revision(&self) -> Result<u64, Error> {
        Ok(self
            .store
            .get(ROSTER_KEY)
            .context(StoreSnafu)?
            .map(|record| record.revision)
            .unwrap_or(0))
    }

    /// Reserve a fresh member id.
    pub fn allocate_id(&self) -> Result<MemberId, Error> {
        let id = store::update(
            self.store.as_ref(),
            ROSTER_KEY,
            |roster: &mut Roster| -> Result<MemberId, Error> {
                let id = MemberId(roster.next_id);
                roster.next_id += 1;
                Ok(id)
            },
        )
        .context(StoreSnafu)??;
        tracing::info!(%id, "allocated member id");
        Ok(id)
    }

    /// Register a member. Registering an already known id refreshes its address and roles and
    /// keeps health and generation.
    #[tracing::instrument(skip(self, member), fields(id = %member.id))]
    pub fn register(&self, member: ClusterMember) -> Result<ClusterMember, Error> {
        let (registered, is_new) = store::update(
            self.store.as_ref(),
            ROSTER_KEY,
            |roster: &mut Roster| -> Result<(ClusterMember, bool), Error> {
                ensure!(
                    !roster.retired.contains(&member.id),
                    IdRetiredSnafu { id: member.id }
                );
                roster.next_id = roster.next_id.max(member.id.0 + 1);

                if let Some(known) = roster.get_mut(member.id) {
                    known.address = member.address.clone();
                    known.roles = member.roles;
                    return Ok((known.clone(), false));
                }

                roster.members.push(member.clone());
                roster.members.sort_by_key(|member| member.id);
                Ok((member.clone(), true))
            },
        )
        .context(StoreSnafu)??;

        if is_new {
            tracing::info!(address = %registered.address, roles = %registered.roles, "member registered");
            self.notify(DirectoryChange::Registered(registered.id));
        }
        Ok(registered)
    }

    pub fn update_health(&self, id: MemberId, health: MemberHealth) -> Result<(), Error> {
        let changed = store::update(
            self.store.as_ref(),
            ROSTER_KEY,
            |roster: &mut Roster| -> Result<bool, Error> {
                let member = roster.get_mut(id).context(UnknownMemberSnafu { id })?;
                let changed = member.health != health;
                member.health = health;
                Ok(changed)
            },
        )
        .context(StoreSnafu)??;

        if changed {
            tracing::info!(%id, %health, "member health changed");
            self.notify(DirectoryChange::HealthChanged { id, health });
        }
        Ok(())
    }

    /// Record that a new configuration has been applied to the member.
    pub fn advance_generation(&self, id: MemberId) -> Result<u64, Error> {
        let generation = store::update(
            self.store.as_ref(),
            ROSTER_KEY,
            |roster: &mut Roster| -> Result<u64, Error> {
                let member = roster.get_mut(id).context(UnknownMemberSnafu { id })?;
                member.generation += 1;
                Ok(member.generation)
            },
        )
        .context(StoreSnafu)??;

        self.notify(DirectoryChange::GenerationAdvanced { id, generation });
        Ok(generation)
    }

    /// Remove a member for good. Its id is retired.
    ///
    /// Refused while the member holds the rolling lock for anything but the scale-down that
    /// removes it, or when the remaining live controllers would no longer form a majority of the
    /// current controller set. The lock is checked in the same atomic write as the removal.
    #[tracing::instrument(skip(self))]
    pub fn remove(&self, id: MemberId) -> Result<Option<ClusterMember>, Error> {
        let removed = store::update_guarded(
            self.store.as_ref(),
            ROSTER_KEY,
            LOCK_KEY,
            |roster: &mut Roster, lock: &LockRecord| -> Result<Option<ClusterMember>, Error> {
                let Some(member) = roster.get(id) else {
                    return Ok(None);
                };

                if let Some(holder) = lock.holder.as_ref().filter(|holder| holder.member == id) {
                    ensure!(
                        holder.reason == LockReason::Scale,
                        MemberHoldsLockSnafu {
                            id,
                            reason: holder.reason
                        }
                    );
                }

                if member.has_role(&KafkaRole::Controller) {
                    let required = roster.quorum_size();
                    let remaining = roster
                        .controllers()
                        .filter(|controller| controller.id != id && controller.health.is_live())
                        .count();
                    ensure!(
                        remaining >= required,
                        QuorumTooSmallSnafu {
                            id,
                            remaining,
                            required
                        }
                    );
                }

                let removed = member.clone();
                roster.members.retain(|member| member.id != id);
                roster.retired.insert(id);
                Ok(Some(removed))
            },
        )
        .context(StoreSnafu)??;

        if removed.is_some() {
            tracing::info!(%id, "member removed");
            self.notify(DirectoryChange::Removed(id));
        }
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<ClusterMember>, Error> {
        Ok(self.roster()?.members)
    }

    pub fn get(&self, id: MemberId) -> Result<Option<ClusterMember>, Error> {
        Ok(self.roster()?.get(id).cloned())
    }

    pub fn quorum_size(&self) -> Result<usize, Error> {
        Ok(self.roster()?.quorum_size())
    }
}
