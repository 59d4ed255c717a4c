//! The seam to the totally-ordered atomic-broadcast substrate.
//!
//! The substrate owns delivery order, version assignment and the advancement
//! of the replication frontiers; the store only reacts to it. The trait below
//! captures the surface the store needs. [`LoopbackSubstrate`] is the
//! in-process implementation backing a single-replica shard, used by the CLI
//! and the tests: delivery, stability and persistence coincide.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};

use crate::error::CResult;
use crate::frontier::FrontierTracker;
use crate::object::Version;

/// The apply step of one ordered delivery. Receives the assigned version and
/// timestamp; returns whether the mutation produced a delta (reads and
/// rejected mutations do not).
pub type OrderedApply<'a> = &'a mut dyn FnMut(Version, u64) -> bool;

/// Invoked by the substrate once a delivered mutation is confirmed durable,
/// tied to the version it committed at. An error here means the delta could
/// not be persisted; the substrate propagates it to the sender.
pub type PersistenceCallback = Box<dyn Fn(Version) -> CResult<()> + Send + Sync>;

pub trait TotalOrderSubstrate: Send + Sync {
    /// Delivers one ordered message: assigns the next (version, ts_us), runs
    /// `apply` serially with respect to every other delivery, and on
    /// acceptance drives the persistence callback. Returns the assigned pair.
    fn ordered_send(&self, apply: OrderedApply<'_>) -> CResult<(Version, u64)>;

    /// The (version, ts_us) assigned to the message currently delivering.
    fn current_version(&self) -> (Version, u64);

    /// Blocks until the global persistence frontier covers `version`.
    fn wait_for_global_persistence_frontier(&self, version: Version, timeout: Duration) -> bool;

    fn global_persistence_frontier(&self) -> Version;

    /// The wall-clock stability frontier, in nanoseconds.
    fn global_stability_frontier_ns(&self) -> u64;

    /// The frontier tracker this substrate advances.
    fn frontier(&self) -> Arc<FrontierTracker>;

    /// Registers the hook that appends the pending deltas of a committed
    /// mutation to the version log.
    fn register_persistence_callback(&self, callback: PersistenceCallback);
}

struct OrderState {
    next_version: Version,
    last_ts_us: u64,
}

/// Single-replica substrate: a serial delivery lane in the local process.
/// The frontiers advance in lockstep with delivery, since the only replica
/// is this one.
pub struct LoopbackSubstrate {
    frontier: Arc<FrontierTracker>,
    /// Held for the whole of one delivery; this is the ordered lane.
    order: Mutex<OrderState>,
    /// Published separately so it stays readable from within a delivery.
    current: Mutex<(Version, u64)>,
    persist_cb: RwLock<Option<PersistenceCallback>>,
}

impl LoopbackSubstrate {
    /// `resume_after` is the newest version already in the log, so assigned
    /// versions continue the persisted timeline after a restart.
    pub fn new(resume_after: Version) -> Self {
        Self {
            frontier: Arc::new(FrontierTracker::new()),
            order: Mutex::new(OrderState { next_version: resume_after + 1, last_ts_us: 0 }),
            current: Mutex::new((resume_after, 0)),
            persist_cb: RwLock::new(None),
        }
    }

    fn now_us(last_ts_us: u64) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        // Commit timestamps must move forward with versions.
        now.max(last_ts_us + 1)
    }
}

impl TotalOrderSubstrate for LoopbackSubstrate {
    fn ordered_send(&self, apply: OrderedApply<'_>) -> CResult<(Version, u64)> {
        let mut order = self.order.lock();
        let version = order.next_version;
        let ts_us = Self::now_us(order.last_ts_us);
        order.next_version += 1;
        order.last_ts_us = ts_us;
        *self.current.lock() = (version, ts_us);

        let accepted = apply(version, ts_us);

        // Delivered locally; with one replica that is also global stability.
        self.frontier.advance_local(version);
        self.frontier.advance_global_stable(version, ts_us * 1000);

        if accepted {
            if let Some(cb) = self.persist_cb.read().as_ref() {
                cb(version)?;
            }
        }
        self.frontier.advance_global_persistent(version);

        Ok((version, ts_us))
    }

    fn current_version(&self) -> (Version, u64) {
        *self.current.lock()
    }

    fn wait_for_global_persistence_frontier(&self, version: Version, timeout: Duration) -> bool {
        self.frontier.wait_for_global_persistent(version, timeout)
    }

    fn global_persistence_frontier(&self) -> Version {
        self.frontier.global_persistent()
    }

    fn global_stability_frontier_ns(&self) -> u64 {
        self.frontier.global_stable_ts_ns()
    }

    fn frontier(&self) -> Arc<FrontierTracker> {
        Arc::clone(&self.frontier)
    }

    fn register_persistence_callback(&self, callback: PersistenceCallback) {
        *self.persist_cb.write() = Some(callback);
    }
}
