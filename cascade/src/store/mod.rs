//! The shard store engine: glues the broadcast substrate, the delta core,
//! the version log and the observer dispatcher together.
//!
//! Every mutating operation has two faces: the client variant sends through
//! the substrate, and the `ordered_*` twin runs on the delivery path with
//! the version and timestamp the substrate assigned. Reads either take the
//! lockless path over the live map or are planned against the version log;
//! see [`planner`].

mod planner;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ShardConfig;
use crate::delta::DeltaStoreCore;
use crate::error::{CResult, Error};
use crate::frontier::{FrontierSnapshot, FrontierTracker};
use crate::object::{ObjectKey, Version, VersionedObject, INVALID_VERSION};
use crate::observer::{
    ObserverDispatcher, ObserverEvent, ObserverHandle, ShardContext, StoreObserver,
};
use crate::storage::version_log::VersionLog;
use crate::storage::Status;
use crate::store::planner::ReadPlan;
use crate::substrate::{LoopbackSubstrate, TotalOrderSubstrate};
use crate::tlog::{tag, TimestampLogger};

/// A replicated, versioned key-value shard persisted as a delta log.
pub struct ShardStore<K: ObjectKey> {
    core: Arc<DeltaStoreCore<K>>,
    log: Arc<Mutex<VersionLog<K>>>,
    substrate: Arc<dyn TotalOrderSubstrate>,
    dispatcher: Arc<ObserverDispatcher<K>>,
    frontier: Arc<FrontierTracker>,
    tlog: Arc<TimestampLogger>,
    context: ShardContext,
    stable_wait_timeout: Duration,
}

impl<K: ObjectKey> Clone for ShardStore<K> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            log: Arc::clone(&self.log),
            substrate: Arc::clone(&self.substrate),
            dispatcher: Arc::clone(&self.dispatcher),
            frontier: Arc::clone(&self.frontier),
            tlog: Arc::clone(&self.tlog),
            context: self.context,
            stable_wait_timeout: self.stable_wait_timeout,
        }
    }
}

impl<K: ObjectKey> std::fmt::Display for ShardStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {}/{}", self.context.subgroup_index, self.context.shard_num)
    }
}

impl<K: ObjectKey> ShardStore<K> {
    /// Opens a single-replica shard: replays the version log into a fresh
    /// delta core and binds a loopback substrate resuming the persisted
    /// timeline.
    pub fn open(config: &ShardConfig) -> CResult<Self> {
        let mut log = VersionLog::new(config.get_log_path(), config.get_sync_on_append())?;
        let state = log.replay_all()?;
        let latest = log.latest_version();
        let core = DeltaStoreCore::from_map(state);
        let substrate = Arc::new(LoopbackSubstrate::new(latest));
        Self::with_substrate(config, log, core, substrate)
    }

    /// Binds a store to an externally driven substrate. The persistence
    /// callback is registered here: it appends the pending deltas of the
    /// committing mutation and fans the committed events out to the
    /// observers, in delivery order.
    pub fn with_substrate(
        config: &ShardConfig,
        log: VersionLog<K>,
        core: DeltaStoreCore<K>,
        substrate: Arc<dyn TotalOrderSubstrate>,
    ) -> CResult<Self> {
        let core = Arc::new(core);
        let log = Arc::new(Mutex::new(log));
        let frontier = substrate.frontier();
        let dispatcher = Arc::new(ObserverDispatcher::new(
            config.get_observer_workers(),
            config.get_observer_queue_capacity(),
            config.get_observer_backpressure(),
        ));
        let context = ShardContext {
            subgroup_index: config.get_subgroup_index(),
            shard_num: config.get_shard_num(),
            node_id: config.get_node_id(),
        };

        {
            let core = Arc::clone(&core);
            let log = Arc::clone(&log);
            let dispatcher = Arc::clone(&dispatcher);
            substrate.register_persistence_callback(Box::new(move |version| {
                let deltas = core.pending_deltas();
                if deltas.is_empty() {
                    return Ok(());
                }
                if let Err(err) = log.lock().append(&deltas) {
                    core.rollback_pending();
                    return Err(err);
                }
                core.commit_pending();
                for delta in deltas {
                    dispatcher.notify(ObserverEvent {
                        subgroup_index: context.subgroup_index,
                        shard_num: context.shard_num,
                        caller_id: context.node_id,
                        key: delta.value.key.clone(),
                        value: Arc::new(delta.value),
                        version,
                        context,
                        is_trigger: false,
                    });
                }
                Ok(())
            }));
        }

        Ok(Self {
            core,
            log,
            substrate,
            dispatcher,
            frontier,
            tlog: Arc::new(TimestampLogger::new(false)),
            context,
            stable_wait_timeout: config.get_stable_wait_timeout(),
        })
    }

    pub fn frontier(&self) -> &FrontierTracker {
        &self.frontier
    }

    pub fn frontier_snapshot(&self) -> FrontierSnapshot {
        self.frontier.snapshot()
    }

    pub fn register_observer(&self, observer: Arc<dyn StoreObserver<K>>) -> ObserverHandle {
        self.dispatcher.register(observer)
    }

    pub fn unregister_observer(&self, handle: ObserverHandle) {
        self.dispatcher.unregister(handle)
    }

    /// Enables the timestamp tracing buffer for this shard.
    pub fn enable_tracing(&mut self) {
        self.tlog = Arc::new(TimestampLogger::new(true));
    }

    // --- mutations -------------------------------------------------------

    /// Stores `value`, assigning it the next version on the shard timeline.
    /// Returns the (version, timestamp) pair the put committed at, or
    /// ([`INVALID_VERSION`], 0) when the optimistic precondition failed.
    pub fn put(&self, value: VersionedObject<K>) -> CResult<(Version, u64)> {
        if !value.key.is_valid() {
            return Err(Error::Value(format!("invalid key: {}", value.key)));
        }
        let mut reply = (INVALID_VERSION, 0);
        self.substrate.ordered_send(&mut |version, ts_us| {
            reply = self.ordered_put(value.clone(), version, ts_us);
            reply.0 != INVALID_VERSION
        })?;
        Ok(reply)
    }

    /// Fire-and-forget put: the caller learns nothing, a rejected put is
    /// silently dropped. Observer backpressure policy applies unchanged.
    pub fn put_and_forget(&self, value: VersionedObject<K>) -> CResult<()> {
        if !value.key.is_valid() {
            return Err(Error::Value(format!("invalid key: {}", value.key)));
        }
        self.substrate.ordered_send(&mut |version, ts_us| {
            self.ordered_put_and_forget(value.clone(), version, ts_us)
        })?;
        Ok(())
    }

    /// Removes `key` by committing a tombstone. Returns the (version,
    /// timestamp) of the remove, or ([`INVALID_VERSION`], 0) when the key
    /// is absent.
    pub fn remove(&self, key: &K) -> CResult<(Version, u64)> {
        let mut reply = (INVALID_VERSION, 0);
        self.substrate.ordered_send(&mut |version, ts_us| {
            reply = self.ordered_remove(key, version, ts_us);
            reply.0 != INVALID_VERSION
        })?;
        Ok(reply)
    }

    /// Hands `value` to the observers with the trigger flag set, without
    /// storing it or assigning a version.
    pub fn trigger_put(&self, value: VersionedObject<K>) {
        self.dispatcher.notify(ObserverEvent {
            subgroup_index: self.context.subgroup_index,
            shard_num: self.context.shard_num,
            caller_id: self.context.node_id,
            key: value.key.clone(),
            version: value.version,
            value: Arc::new(value),
            context: self.context,
            is_trigger: true,
        });
    }

    /// Ordered twin of [`ShardStore::put`], invoked with the delivered
    /// version and timestamp.
    pub fn ordered_put(
        &self,
        mut value: VersionedObject<K>,
        version: Version,
        ts_us: u64,
    ) -> (Version, u64) {
        self.tlog.log(tag::ORDERED_PUT_START, version);
        value.stamp(version, ts_us);
        // The optimistic check runs against the last committed version, not
        // the delivery frontier: rejected deliveries commit nothing.
        let latest_committed = self.log.lock().latest_version();
        let accepted = self.core.ordered_put(value, latest_committed);
        self.tlog.log(tag::ORDERED_PUT_END, version);
        if accepted {
            (version, ts_us)
        } else {
            (INVALID_VERSION, 0)
        }
    }

    /// Ordered twin of [`ShardStore::put_and_forget`]. Returns whether a
    /// delta was produced.
    pub fn ordered_put_and_forget(
        &self,
        value: VersionedObject<K>,
        version: Version,
        ts_us: u64,
    ) -> bool {
        self.ordered_put(value, version, ts_us).0 != INVALID_VERSION
    }

    /// Ordered twin of [`ShardStore::remove`].
    pub fn ordered_remove(&self, key: &K, version: Version, ts_us: u64) -> (Version, u64) {
        self.tlog.log(tag::ORDERED_REMOVE_START, version);
        let mut tombstone = VersionedObject::null_for(key.clone());
        tombstone.stamp(version, ts_us);
        let latest_committed = self.log.lock().latest_version();
        let accepted = self.core.ordered_remove(tombstone, latest_committed);
        self.tlog.log(tag::ORDERED_REMOVE_END, version);
        if accepted {
            (version, ts_us)
        } else {
            (INVALID_VERSION, 0)
        }
    }

    // --- reads -----------------------------------------------------------

    /// Reads `key` at `version` ([`crate::object::CURRENT_VERSION`] for the
    /// freshest). `stable` pins the read to the global persistence frontier;
    /// `exact` demands a delta committed at exactly that version. Returns
    /// the object (possibly a tombstone) or `None`.
    pub fn get(
        &self,
        key: &K,
        version: Version,
        stable: bool,
        exact: bool,
    ) -> CResult<Option<Arc<VersionedObject<K>>>> {
        match self.plan(version, stable) {
            ReadPlan::FutureVersion => Ok(None),
            ReadPlan::Lockless => Ok(self.core.lockless_get(key)),
            ReadPlan::AtVersion(version) => self.read_versioned(key, version, exact),
        }
    }

    /// The serialized size of the value of `key`, 0 when absent or null.
    pub fn get_size(
        &self,
        key: &K,
        version: Version,
        stable: bool,
        exact: bool,
    ) -> CResult<u64> {
        match self.plan(version, stable) {
            ReadPlan::FutureVersion => Ok(0),
            ReadPlan::Lockless => Ok(self.core.lockless_get_size(key)),
            ReadPlan::AtVersion(version) => {
                Ok(self
                    .read_versioned(key, version, exact)?
                    .filter(|obj| !obj.is_null())
                    .map_or(0, |obj| obj.bytes_size()))
            }
        }
    }

    /// Lists the live keys whose printed form starts with `prefix`, as of
    /// `version`.
    pub fn list_keys(&self, prefix: &str, version: Version, stable: bool) -> CResult<Vec<K>> {
        match self.plan(version, stable) {
            ReadPlan::FutureVersion => Ok(Vec::new()),
            ReadPlan::Lockless => Ok(self.core.lockless_list_keys(prefix)),
            ReadPlan::AtVersion(version) => {
                let state = self.log.lock().reconstruct(version)?;
                Ok(state
                    .iter()
                    .filter(|(k, v)| !v.is_null() && k.matches_prefix(prefix))
                    .map(|(k, _)| k.clone())
                    .collect())
            }
        }
    }

    /// Reads `key` as of the wall-clock instant `ts_us`. Instants beyond the
    /// stability frontier are in the future and resolve to `None`.
    pub fn get_by_time(
        &self,
        key: &K,
        ts_us: u64,
        stable: bool,
    ) -> CResult<Option<Arc<VersionedObject<K>>>> {
        match self.version_at_time_checked(ts_us) {
            None => Ok(None),
            Some(version) => self.get(key, version, stable, false),
        }
    }

    pub fn get_size_by_time(&self, key: &K, ts_us: u64, stable: bool) -> CResult<u64> {
        match self.version_at_time_checked(ts_us) {
            None => Ok(0),
            Some(version) => self.get_size(key, version, stable, false),
        }
    }

    pub fn list_keys_by_time(
        &self,
        prefix: &str,
        ts_us: u64,
        stable: bool,
    ) -> CResult<Vec<K>> {
        match self.version_at_time_checked(ts_us) {
            None => Ok(Vec::new()),
            Some(version) => self.list_keys(prefix, version, stable),
        }
    }

    /// Ordered twin of `get`: reads the live map from within the ordered
    /// lane, observing post-commit state.
    pub fn ordered_get(&self, key: &K) -> Option<Arc<VersionedObject<K>>> {
        self.core.ordered_get(key)
    }

    pub fn ordered_get_size(&self, key: &K) -> u64 {
        self.core.ordered_get_size(key)
    }

    pub fn ordered_list_keys(&self, prefix: &str) -> Vec<K> {
        self.core.ordered_list_keys(prefix)
    }

    /// A read routed through the substrate so it linearizes with every
    /// write: the reply reflects all mutations delivered before it.
    pub fn multi_get(&self, key: &K) -> CResult<Option<Arc<VersionedObject<K>>>> {
        let mut result = None;
        self.substrate.ordered_send(&mut |_, _| {
            result = self.ordered_get(key);
            false
        })?;
        Ok(result)
    }

    pub fn multi_get_size(&self, key: &K) -> CResult<u64> {
        let mut result = 0;
        self.substrate.ordered_send(&mut |_, _| {
            result = self.ordered_get_size(key);
            false
        })?;
        Ok(result)
    }

    pub fn multi_list_keys(&self, prefix: &str) -> CResult<Vec<K>> {
        let mut result = Vec::new();
        self.substrate.ordered_send(&mut |_, _| {
            result = self.ordered_list_keys(prefix);
            false
        })?;
        Ok(result)
    }

    // --- introspection ---------------------------------------------------

    pub fn status(&self) -> CResult<Status> {
        let mut log = self.log.lock();
        Ok(Status {
            name: self.to_string(),
            keys: self.core.live_keys(),
            size: self.core.live_size(),
            disk_size: log.disk_size()?,
            deltas: log.delta_count(),
            latest_version: log.latest_version(),
        })
    }

    /// Flushes the timestamp tracing buffer, routed through the ordered
    /// lane so every replica flushes at the same point of the timeline.
    pub fn dump_timestamp_log(&self, path: &std::path::Path) -> CResult<()> {
        let mut result = Ok(());
        self.substrate.ordered_send(&mut |_, _| {
            result = self.ordered_dump_timestamp_log(path);
            false
        })?;
        result
    }

    pub fn ordered_dump_timestamp_log(&self, path: &std::path::Path) -> CResult<()> {
        self.tlog.flush(path)
    }

    // --- internals -------------------------------------------------------

    fn plan(&self, version: Version, stable: bool) -> ReadPlan {
        let log_latest = self.log.lock().latest_version();
        planner::plan_read(
            version,
            stable,
            &self.frontier,
            log_latest,
            self.stable_wait_timeout,
        )
    }

    /// The versioned read path: a delta hit answers directly; an inexact
    /// miss on the key falls through to reconstruction.
    fn read_versioned(
        &self,
        key: &K,
        version: Version,
        exact: bool,
    ) -> CResult<Option<Arc<VersionedObject<K>>>> {
        let mut log = self.log.lock();
        let delta = match log.read_delta(version, exact)? {
            Some(delta) => delta,
            None => return Ok(None),
        };
        if delta.value.key == *key {
            return Ok(Some(Arc::new(delta.value)));
        }
        if exact {
            return Ok(None);
        }
        let state = log.reconstruct(version)?;
        Ok(state.get(key).cloned().map(Arc::new))
    }

    fn version_at_time_checked(&self, ts_us: u64) -> Option<Version> {
        if ts_us > self.frontier.global_stable_ts_us() {
            log::warn!("Cannot get data at a time in the future.");
            return None;
        }
        let version = self.log.lock().version_at_time(ts_us);
        if version == INVALID_VERSION {
            return None;
        }
        Some(version)
    }
}
