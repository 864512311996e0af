//! In-place upgrades of the Kafka distribution.
//!
//! An upgrade runs like a restart under the rolling lock (reason `upgrade`), so at most one
//! member is ever on its way to the new version.
use semver::Version;
use snafu::{ensure, ResultExt, Snafu};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("{version:?} is not a valid Kafka version"))]
    ParseVersion {
        source: semver::Error,
        version: String,
    },

    #[snafu(display("downgrading from {current} to {target} is not supported"))]
    Downgrade { current: Version, target: Version },

    #[snafu(display("upgrading across major versions ({current} to {target}) is not supported in place"))]
    MajorVersionChange { current: Version, target: Version },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeDecision {
    UpToDate,
    Upgrade { from: Version, to: Version },
}

pub fn parse_version(version: &str) -> Result<Version, Error> {
    Version::parse(version.trim()).context(ParseVersionSnafu { version })
}

/// Decide whether `target` can be rolled out in place on a member running `current`.
pub fn check_upgrade(current: &str, target: &str) -> Result<UpgradeDecision, Error> {
    let current = parse_version(current)?;
    let target = parse_version(target)?;

    if current == target {
        return Ok(UpgradeDecision::UpToDate);
    }
    ensure!(
        target > current,
        DowngradeSnafu {
            current: current.clone(),
            target: target.clone()
        }
    );
    ensure!(
        target.major == current.major,
        MajorVersionChangeSnafu {
            current: current.clone(),
            target: target.clone()
        }
    );

    Ok(UpgradeDecision::Upgrade {
        from: current,
        to: target,
    })
}
