//! Tracking of the three version frontiers a shard replica reconciles:
//! what it has applied itself, what every replica has delivered, and what
//! every replica has persisted. Stable reads block on the last one.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::object::{Version, INVALID_VERSION};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrontierSnapshot {
    pub local_latest: Version,
    pub global_stable: Version,
    pub global_persistent: Version,
    pub global_stable_ts_ns: u64,
}

struct Frontiers {
    /// The greatest version this replica has applied.
    local_latest: Version,
    /// The greatest version every replica has delivered.
    global_stable: Version,
    /// The greatest version every replica has persisted to its log.
    global_persistent: Version,
    /// The wall-clock stability frontier, in nanoseconds.
    global_stable_ts_ns: u64,
}

/// Observes the frontiers the substrate advances. All counters are monotone
/// non-decreasing; advancing backwards is ignored. Waiters park on a condvar
/// and are woken by every advance.
pub struct FrontierTracker {
    inner: Mutex<Frontiers>,
    cond: Condvar,
}

impl Default for FrontierTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FrontierTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Frontiers {
                local_latest: INVALID_VERSION,
                global_stable: INVALID_VERSION,
                global_persistent: INVALID_VERSION,
                global_stable_ts_ns: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn local_latest(&self) -> Version {
        self.inner.lock().local_latest
    }

    pub fn global_stable(&self) -> Version {
        self.inner.lock().global_stable
    }

    pub fn global_persistent(&self) -> Version {
        self.inner.lock().global_persistent
    }

    /// The stability frontier in nanoseconds.
    pub fn global_stable_ts_ns(&self) -> u64 {
        self.inner.lock().global_stable_ts_ns
    }

    /// The stability frontier in microseconds, for time-indexed reads.
    pub fn global_stable_ts_us(&self) -> u64 {
        self.global_stable_ts_ns() / 1000
    }

    pub fn snapshot(&self) -> FrontierSnapshot {
        let inner = self.inner.lock();
        FrontierSnapshot {
            local_latest: inner.local_latest,
            global_stable: inner.global_stable,
            global_persistent: inner.global_persistent,
            global_stable_ts_ns: inner.global_stable_ts_ns,
        }
    }

    pub fn advance_local(&self, version: Version) {
        let mut inner = self.inner.lock();
        if version > inner.local_latest {
            inner.local_latest = version;
            self.cond.notify_all();
        }
    }

    pub fn advance_global_stable(&self, version: Version, ts_ns: u64) {
        let mut inner = self.inner.lock();
        if version > inner.global_stable {
            inner.global_stable = version;
        }
        if ts_ns > inner.global_stable_ts_ns {
            inner.global_stable_ts_ns = ts_ns;
        }
        self.cond.notify_all();
    }

    pub fn advance_global_persistent(&self, version: Version) {
        let mut inner = self.inner.lock();
        if version > inner.global_persistent {
            inner.global_persistent = version;
            self.cond.notify_all();
        }
    }

    /// Blocks until the persistence frontier reaches `version` or `timeout`
    /// expires. A timeout is an ordinary "not yet stable" outcome, reported
    /// as false.
    pub fn wait_for_global_persistent(&self, version: Version, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.global_persistent >= version {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        while inner.global_persistent < version {
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.global_persistent >= version;
            }
        }
        true
    }
}
