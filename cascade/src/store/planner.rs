//! Read planning: translates (version, stable) into an execution strategy
//! before the store touches any data. The same planning runs for point
//! gets, size probes and prefix listings.

use std::time::Duration;

use crate::frontier::FrontierTracker;
use crate::object::{Version, CURRENT_VERSION};

/// How a read request will be served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadPlan {
    /// Serve from the live map without taking the commit latch.
    Lockless,
    /// Serve from the version log at this (possibly adjusted) version.
    AtVersion(Version),
    /// The requested version lies beyond everything this replica knows;
    /// the read resolves to null without touching data.
    FutureVersion,
}

/// Resolves the requested version against the frontiers.
///
/// Stable reads pin themselves to the global persistence frontier: a request
/// for the current version is rewritten to that frontier, and a request for
/// a concrete version waits until the frontier covers it. A wait that times
/// out is only fatal to the read if the version is beyond the local log too;
/// a lagging frontier over an already-local version is served from the log.
pub(crate) fn plan_read(
    requested: Version,
    stable: bool,
    frontier: &FrontierTracker,
    log_latest: Version,
    stable_wait_timeout: Duration,
) -> ReadPlan {
    let mut version = requested;

    if stable {
        if version == CURRENT_VERSION {
            // Whatever is globally persistent right now. If nothing is, the
            // log lookup below naturally resolves to null.
            version = frontier.global_persistent();
        } else if !frontier.wait_for_global_persistent(version, stable_wait_timeout)
            && version > log_latest
        {
            log::debug!(
                "requested version {} is beyond the latest atomic broadcast version",
                version
            );
            return ReadPlan::FutureVersion;
        }
        return ReadPlan::AtVersion(version);
    }

    if version == CURRENT_VERSION {
        ReadPlan::Lockless
    } else {
        ReadPlan::AtVersion(version)
    }
}
