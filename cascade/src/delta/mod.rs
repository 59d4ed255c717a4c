//! The delta core: the live key→object mapping plus the buffer of deltas
//! produced by the in-flight ordered mutation.
//!
//! Exactly one logical thread (the ordered path) mutates the core; any number
//! of reader threads call the `lockless_*` family concurrently. Values are
//! published whole behind `Arc`, so a reader observes either the pre-commit
//! or the post-commit object, never a torn one. The map latch is held only
//! for the pointer install, not for the duration of the mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};

use crate::object::{ObjectKey, Version, VersionedObject, INVALID_VERSION};

/// What a delta records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Put,
    Remove,
}

impl DeltaKind {
    pub fn as_u8(self) -> u8 {
        match self {
            DeltaKind::Put => 0,
            DeltaKind::Remove => 1,
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DeltaKind::Put),
            1 => Some(DeltaKind::Remove),
            _ => None,
        }
    }
}

/// A single mutation record, the unit appended to the version log.
/// For removes the value is the null object stamped with the commit version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Delta<K: ObjectKey> {
    pub kind: DeltaKind,
    pub version: Version,
    pub timestamp_us: u64,
    pub value: VersionedObject<K>,
}

/// A buffered delta plus the pre-mutation entry, kept until the substrate
/// confirms durability so the live map can be rolled back on reject.
struct PendingDelta<K: ObjectKey> {
    delta: Delta<K>,
    pre_image: Option<Arc<VersionedObject<K>>>,
}

/// Applies a committed delta to a plain map. Used by log replay, where every
/// delta has already passed the optimistic check once.
pub fn replay_into<K: ObjectKey>(map: &mut BTreeMap<K, VersionedObject<K>>, delta: &Delta<K>) {
    match delta.kind {
        DeltaKind::Put | DeltaKind::Remove => {
            map.insert(delta.value.key.clone(), delta.value.clone());
        }
    }
}

/// The live mapping and the pending delta buffer for one shard replica.
pub struct DeltaStoreCore<K: ObjectKey> {
    kv_map: RwLock<BTreeMap<K, Arc<VersionedObject<K>>>>,
    pending: Mutex<Vec<PendingDelta<K>>>,
}

impl<K: ObjectKey> Default for DeltaStoreCore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ObjectKey> DeltaStoreCore<K> {
    pub fn new() -> Self {
        Self { kv_map: RwLock::new(BTreeMap::new()), pending: Mutex::new(Vec::new()) }
    }

    /// Rebuilds a core from replayed state, e.g. on replica restart.
    pub fn from_map(map: BTreeMap<K, VersionedObject<K>>) -> Self {
        let kv_map = map.into_iter().map(|(k, v)| (k, Arc::new(v))).collect();
        Self { kv_map: RwLock::new(kv_map), pending: Mutex::new(Vec::new()) }
    }

    /// The latest committed version for `key`, or [`INVALID_VERSION`].
    /// Tombstones count: a removed key's latest version is the remove's.
    pub fn latest_version_by_key(&self, key: &K) -> Version {
        self.kv_map.read().get(key).map_or(INVALID_VERSION, |v| v.version)
    }

    /// Applies a put on the ordered path. `value` must already be stamped
    /// with the commit version and timestamp. Returns false (and stays
    /// side-effect free) if the optimistic precondition fails.
    pub fn ordered_put(&self, value: VersionedObject<K>, latest_version: Version) -> bool {
        let mut map = self.kv_map.write();
        let latest_by_key = map.get(&value.key).map_or(INVALID_VERSION, |v| v.version);
        if !value.verify_previous_version(latest_version, latest_by_key) {
            return false;
        }

        let delta = Delta {
            kind: DeltaKind::Put,
            version: value.version,
            timestamp_us: value.timestamp_us,
            value: value.clone(),
        };
        let pre_image = map.insert(value.key.clone(), Arc::new(value));
        self.pending.lock().push(PendingDelta { delta, pre_image });
        true
    }

    /// Applies a remove on the ordered path. `tombstone` must be the stamped
    /// null object for the key. Removing an absent or already-removed key is
    /// a no-op returning false: no delta, no rollback entry.
    pub fn ordered_remove(&self, tombstone: VersionedObject<K>, latest_version: Version) -> bool {
        let mut map = self.kv_map.write();
        let latest_by_key = match map.get(&tombstone.key) {
            None => return false,
            Some(existing) if existing.is_null() => return false,
            Some(existing) => existing.version,
        };
        if !tombstone.verify_previous_version(latest_version, latest_by_key) {
            return false;
        }

        let delta = Delta {
            kind: DeltaKind::Remove,
            version: tombstone.version,
            timestamp_us: tombstone.timestamp_us,
            value: tombstone.clone(),
        };
        let pre_image = map.insert(tombstone.key.clone(), Arc::new(tombstone));
        self.pending.lock().push(PendingDelta { delta, pre_image });
        true
    }

    /// Reads the live mapping from within an ordered mutation context: the
    /// ordered path has already applied its own writes, so this sees
    /// post-commit state.
    pub fn ordered_get(&self, key: &K) -> Option<Arc<VersionedObject<K>>> {
        self.kv_map.read().get(key).cloned()
    }

    pub fn ordered_get_size(&self, key: &K) -> u64 {
        self.lockless_get_size(key)
    }

    pub fn ordered_list_keys(&self, prefix: &str) -> Vec<K> {
        self.lockless_list_keys(prefix)
    }

    /// Reads the current mapping without taking the commit latch. The entry
    /// is published whole; the read synchronizes only on the map structure.
    pub fn lockless_get(&self, key: &K) -> Option<Arc<VersionedObject<K>>> {
        self.kv_map.read().get(key).cloned()
    }

    /// The serialized size of the current value, 0 if absent or null.
    pub fn lockless_get_size(&self, key: &K) -> u64 {
        match self.kv_map.read().get(key) {
            Some(obj) if !obj.is_null() => obj.bytes_size(),
            _ => 0,
        }
    }

    /// A point-in-time listing of live (non-tombstoned) keys whose printed
    /// form starts with `prefix`.
    pub fn lockless_list_keys(&self, prefix: &str) -> Vec<K> {
        self.kv_map
            .read()
            .iter()
            .filter(|(k, v)| !v.is_null() && k.matches_prefix(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// The deltas buffered by the in-flight mutation, in apply order.
    /// Cloned out so the buffer survives until commit or rollback.
    pub fn pending_deltas(&self) -> Vec<Delta<K>> {
        self.pending.lock().iter().map(|p| p.delta.clone()).collect()
    }

    /// Commit point: the substrate confirmed durability, drop the buffer.
    pub fn commit_pending(&self) {
        self.pending.lock().clear();
    }

    /// The substrate rejected the mutation: restore the pre-mutation entries
    /// and drop the buffer.
    pub fn rollback_pending(&self) {
        let mut pending = self.pending.lock();
        let mut map = self.kv_map.write();
        for entry in pending.drain(..).rev() {
            match entry.pre_image {
                Some(prev) => {
                    map.insert(entry.delta.value.key.clone(), prev);
                }
                None => {
                    map.remove(&entry.delta.value.key);
                }
            }
        }
    }

    /// Number of live (non-tombstoned) keys.
    pub fn live_keys(&self) -> u64 {
        self.kv_map.read().values().filter(|v| !v.is_null()).count() as u64
    }

    /// Logical size of live payloads in bytes.
    pub fn live_size(&self) -> u64 {
        self.kv_map.read().values().filter(|v| !v.is_null()).map(|v| v.blob.len() as u64).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stamped(key: &str, payload: &[u8], version: Version) -> VersionedObject<String> {
        let mut obj = VersionedObject::new(key.to_string(), payload);
        obj.stamp(version, version as u64 * 1000);
        obj
    }

    fn stamped_tombstone(key: &str, version: Version) -> VersionedObject<String> {
        let mut obj = VersionedObject::null_for(key.to_string());
        obj.stamp(version, version as u64 * 1000);
        obj
    }

    #[test]
    fn put_then_get() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("a/x", b"v1", 1), INVALID_VERSION));
        core.commit_pending();

        let got = core.lockless_get(&"a/x".to_string()).unwrap();
        assert_eq!(got.blob.as_slice(), b"v1");
        assert_eq!(got.version, 1);
        assert_eq!(core.latest_version_by_key(&"a/x".to_string()), 1);
    }

    #[test]
    fn optimistic_reject_leaves_no_trace() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("k", b"v1", 10), INVALID_VERSION));
        core.commit_pending();

        // Writer claims it last saw version 5 for this key; actual is 10.
        let mut stale = stamped("k", b"v2", 11);
        stale.previous_version_by_key = 5;
        assert!(!core.ordered_put(stale, 10));

        assert!(core.pending_deltas().is_empty());
        assert_eq!(core.lockless_get(&"k".to_string()).unwrap().blob.as_slice(), b"v1");
    }

    #[test]
    fn remove_absent_is_noop() {
        let core: DeltaStoreCore<String> = DeltaStoreCore::new();
        assert!(!core.ordered_remove(stamped_tombstone("ghost", 1), INVALID_VERSION));
        assert!(core.pending_deltas().is_empty());
    }

    #[test]
    fn remove_installs_tombstone() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("k", b"v", 1), INVALID_VERSION));
        core.commit_pending();
        assert!(core.ordered_remove(stamped_tombstone("k", 2), 1));
        core.commit_pending();

        // The tombstone stays visible for history lookups.
        let got = core.lockless_get(&"k".to_string()).unwrap();
        assert!(got.is_null());
        assert_eq!(got.version, 2);
        assert_eq!(core.lockless_get_size(&"k".to_string()), 0);

        // Removing again is a no-op.
        assert!(!core.ordered_remove(stamped_tombstone("k", 3), 2));
    }

    #[test]
    fn list_keys_skips_tombstones() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("a/x", b"1", 1), INVALID_VERSION));
        assert!(core.ordered_put(stamped("a/y", b"2", 2), 1));
        assert!(core.ordered_put(stamped("b/z", b"3", 3), 2));
        core.commit_pending();
        assert!(core.ordered_remove(stamped_tombstone("a/y", 4), 3));
        core.commit_pending();

        let mut keys = core.lockless_list_keys("a/");
        keys.sort();
        assert_eq!(keys, vec!["a/x".to_string()]);
        assert_eq!(core.lockless_list_keys("").len(), 2);
    }

    #[test]
    fn rollback_restores_pre_image() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("k", b"v1", 1), INVALID_VERSION));
        core.commit_pending();

        assert!(core.ordered_put(stamped("k", b"v2", 2), 1));
        assert!(core.ordered_put(stamped("fresh", b"f", 2), 1));
        core.rollback_pending();

        assert_eq!(core.lockless_get(&"k".to_string()).unwrap().blob.as_slice(), b"v1");
        assert!(core.lockless_get(&"fresh".to_string()).is_none());
        assert!(core.pending_deltas().is_empty());
    }

    #[test]
    fn pending_deltas_in_apply_order() {
        let core = DeltaStoreCore::new();
        assert!(core.ordered_put(stamped("a", b"1", 5), INVALID_VERSION));
        assert!(core.ordered_remove(stamped_tombstone("a", 5), 5));
        let pending = core.pending_deltas();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, DeltaKind::Put);
        assert_eq!(pending[1].kind, DeltaKind::Remove);
    }

    #[test]
    fn replay_matches_live_application() {
        let core = DeltaStoreCore::new();
        let mut replayed = BTreeMap::new();

        for (i, (key, payload)) in
            [("a", b"1".as_slice()), ("b", b"2".as_slice()), ("a", b"3".as_slice())]
                .iter()
                .enumerate()
        {
            let obj = stamped(key, payload, i as Version + 1);
            assert!(core.ordered_put(obj, i as Version));
            for delta in core.pending_deltas() {
                replay_into(&mut replayed, &delta);
            }
            core.commit_pending();
        }
        assert!(core.ordered_remove(stamped_tombstone("b", 4), 3));
        for delta in core.pending_deltas() {
            replay_into(&mut replayed, &delta);
        }
        core.commit_pending();

        let rebuilt = DeltaStoreCore::from_map(replayed);
        assert_eq!(rebuilt.live_keys(), core.live_keys());
        assert_eq!(
            rebuilt.lockless_get(&"a".to_string()).unwrap().blob,
            core.lockless_get(&"a".to_string()).unwrap().blob
        );
        assert!(rebuilt.lockless_get(&"b".to_string()).unwrap().is_null());
    }
}
