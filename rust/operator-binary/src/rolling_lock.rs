//! The rolling operation coordinator.
//!
//! A single token record in the shared store names the one member that may currently disrupt
//! the cluster (restart, scale, upgrade or certificate rotation). Holders heartbeat while
//! they work; a holder that stops heartbeating for longer than the configured timeout can have
//! the lock stolen by any other member.
use std::{convert::Infallible, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use strum::{Display, EnumString};

use crate::{
    model::{MemberId, Timestamp},
    store::{self, SharedStore},
};

pub const LOCK_KEY: &str = "rolling-lock";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to access the rolling lock record"))]
    Store { source: store::Error },

    #[snafu(display("rolling lock of member {member} was taken over, now held by {holder:?}"))]
    LockStolen {
        member: MemberId,
        holder: Option<MemberId>,
    },
}

#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LockReason {
    Restart,
    Scale,
    Upgrade,
    CertRotation,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    pub member: MemberId,
    pub reason: LockReason,
    pub acquired_at: Timestamp,
    pub heartbeat: Timestamp,
}

impl LockHolder {
    pub fn is_expired(&self, now: Timestamp, timeout: Duration) -> bool {
        now.saturating_since(self.heartbeat) > timeout
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub holder: Option<LockHolder>,
}

#[derive(Clone, Debug)]
pub struct RollingLockCoordinator {
    store: Arc<dyn SharedStore>,
    timeout: Duration,
}

impl RollingLockCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn holder(&self) -> Result<Option<LockHolder>, Error> {
        Ok(store::load::<LockRecord>(self.store.as_ref(), LOCK_KEY)
            .context(StoreSnafu)?
            .and_then(|record| record.value.holder))
    }

    /// Take the lock if nobody holds it. A holder re-acquiring refreshes its heartbeat and reason.
    #[tracing::instrument(skip(self))]
    pub fn try_acquire(
        &self,
        member: MemberId,
        reason: LockReason,
        now: Timestamp,
    ) -> Result<bool, Error> {
        let acquired = store::update(
            self.store.as_ref(),
            LOCK_KEY,
            |record: &mut LockRecord| -> Result<bool, Infallible> {
                match &mut record.holder {
                    Some(holder) if holder.member == member => {
                        holder.reason = reason;
                        holder.heartbeat = now;
                        Ok(true)
                    }
                    Some(_) => Ok(false),
                    None => {
                        record.holder = Some(LockHolder {
                            member,
                            reason,
                            acquired_at: now,
                            heartbeat: now,
                        });
                        Ok(true)
                    }
                }
            },
        )
        .context(StoreSnafu)?
        .unwrap_or(false);

        if acquired {
            tracing::info!(%member, %reason, "rolling lock acquired");
        }
        Ok(acquired)
    }

    /// Record progress of the current holder.
    pub fn heartbeat(&self, member: MemberId, now: Timestamp) -> Result<(), Error> {
        store::update(
            self.store.as_ref(),
            LOCK_KEY,
            |record: &mut LockRecord| -> Result<(), Error> {
                match &mut record.holder {
                    Some(holder) if holder.member == member => {
                        holder.heartbeat = now;
                        Ok(())
                    }
                    other => LockStolenSnafu {
                        member,
                        holder: other.as_ref().map(|holder| holder.member),
                    }
                    .fail(),
                }
            },
        )
        .context(StoreSnafu)?
    }

    /// Release the lock if `member` holds it. Returns whether anything was released.
    #[tracing::instrument(skip(self))]
    pub fn release(&self, member: MemberId) -> Result<bool, Error> {
        let released = store::update(
            self.store.as_ref(),
            LOCK_KEY,
            |record: &mut LockRecord| -> Result<bool, Infallible> {
                let is_holder = record
                    .holder
                    .as_ref()
                    .is_some_and(|holder| holder.member == member);
                if is_holder {
                    record.holder = None;
                }
                Ok(is_holder)
            },
        )
        .context(StoreSnafu)?
        .unwrap_or(false);

        if released {
            tracing::info!(%member, "rolling lock released");
        } else {
            tracing::debug!(%member, "rolling lock not held, nothing to release");
        }
        Ok(released)
    }

    /// Clear a lock whose holder has not heartbeated within the timeout.
    ///
    /// Returns the member the lock was taken from. A slow holder that is still alive will find
    /// out on its next heartbeat ([`Error::LockStolen`]).
    #[tracing::instrument(skip(self))]
    pub fn steal_if_expired(&self, now: Timestamp) -> Result<Option<MemberId>, Error> {
        let timeout = self.timeout;
        let stolen = store::update(
            self.store.as_ref(),
            LOCK_KEY,
            |record: &mut LockRecord| -> Result<Option<LockHolder>, Infallible> {
                let expired = record
                    .holder
                    .as_ref()
                    .is_some_and(|holder| holder.is_expired(now, timeout));
                Ok(if expired { record.holder.take() } else { None })
            },
        )
        .context(StoreSnafu)?
        .unwrap_or(None);

        if let Some(holder) = &stolen {
            tracing::warn!(
                member = %holder.member,
                reason = %holder.reason,
                silent_for = ?now.saturating_since(holder.heartbeat),
                "rolling lock expired, taking it over"
            );
        }
        Ok(stolen.map(|holder| holder.member))
    }
}
