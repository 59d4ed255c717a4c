//! The versioned object model: opaque payloads ([`Blob`]), the key
//! capability trait ([`ObjectKey`]) with its two concrete families (u64 and
//! hierarchical path string), and the versioned value ([`VersionedObject`])
//! whose header carries the commit version, commit timestamp and the
//! writer-observed previous versions used by the optimistic check.

use serde_derive::{Deserialize, Serialize};

/// A commit version assigned by the atomic-broadcast substrate.
/// Versions are strictly increasing along the shard timeline.
pub type Version = i64;

/// "No such version", also used to report rejected mutations and absent keys.
pub const INVALID_VERSION: Version = -1;

/// Request sentinel: "the freshest version available under the chosen
/// consistency mode". Shares the numeric value of [`INVALID_VERSION`]; the
/// two names keep call sites readable.
pub const CURRENT_VERSION: Version = -1;

/// The path separator recognized by prefix listing on string keys.
pub const PATH_SEPARATOR: char = '/';

/// An opaque byte payload. An empty blob marks a null object (tombstone).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    #[serde(with = "serde_bytes")]
    bytes: Vec<u8>,
}

impl Blob {
    pub fn new(bytes: &[u8]) -> Self {
        Self { bytes: bytes.to_vec() }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// The empty blob, i.e. the payload of a tombstone.
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// The capability set a key type must provide: ordered, hashable, printable,
/// serializable, and carrying an explicit invalid sentinel in lieu of a
/// nullable pointer.
pub trait ObjectKey:
    Clone
    + Ord
    + std::hash::Hash
    + std::fmt::Debug
    + std::fmt::Display
    + serde::Serialize
    + for<'de> serde::Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// The sentinel key. Objects carrying it are invalid.
    fn invalid() -> Self;

    fn is_valid(&self) -> bool {
        *self != Self::invalid()
    }

    /// Whether the printed form of this key starts with `prefix`.
    /// Used by prefix listing; the printed form of path keys uses
    /// [`PATH_SEPARATOR`] as the hierarchy separator.
    fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_string().starts_with(prefix)
    }
}

/// 64-bit unsigned keys; the maximum value is reserved as the sentinel.
impl ObjectKey for u64 {
    fn invalid() -> Self {
        u64::MAX
    }
}

/// Hierarchical path-string keys; the empty string is the sentinel.
impl ObjectKey for String {
    fn invalid() -> Self {
        String::new()
    }
}

/// A versioned object: an opaque payload plus the header the store engine
/// stamps at commit time.
///
/// `previous_version` / `previous_version_by_key` are written by the client
/// before submission and record the versions the writer last observed
/// (globally and for this key). The ordered path verifies them against the
/// actual committed state; see [`VersionedObject::verify_previous_version`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct VersionedObject<K: ObjectKey> {
    /// Commit version, [`INVALID_VERSION`] until stamped on the ordered path.
    pub version: Version,

    /// Commit wall-clock time in microseconds, 0 until stamped.
    pub timestamp_us: u64,

    /// The global version the writer last observed, or [`INVALID_VERSION`]
    /// to skip the global optimistic check.
    pub previous_version: Version,

    /// The version the writer last observed for this key, or
    /// [`INVALID_VERSION`] to skip the per-key optimistic check.
    pub previous_version_by_key: Version,

    pub key: K,

    pub blob: Blob,
}

impl<K: ObjectKey> VersionedObject<K> {
    /// A fresh, unstamped object with no optimistic preconditions.
    pub fn new(key: K, bytes: &[u8]) -> Self {
        Self {
            version: INVALID_VERSION,
            timestamp_us: 0,
            previous_version: INVALID_VERSION,
            previous_version_by_key: INVALID_VERSION,
            key,
            blob: Blob::new(bytes),
        }
    }

    /// A fresh object carrying optimistic preconditions.
    pub fn new_with_previous(
        key: K,
        bytes: &[u8],
        previous_version: Version,
        previous_version_by_key: Version,
    ) -> Self {
        Self {
            version: INVALID_VERSION,
            timestamp_us: 0,
            previous_version,
            previous_version_by_key,
            key,
            blob: Blob::new(bytes),
        }
    }

    /// The null object for `key`: an empty payload recording a remove.
    pub fn null_for(key: K) -> Self {
        Self {
            version: INVALID_VERSION,
            timestamp_us: 0,
            previous_version: INVALID_VERSION,
            previous_version_by_key: INVALID_VERSION,
            key,
            blob: Blob::empty(),
        }
    }

    /// Null objects are tombstones.
    pub fn is_null(&self) -> bool {
        self.blob.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.key.is_valid()
    }

    /// Stamps the commit version and timestamp assigned by the substrate.
    pub fn stamp(&mut self, version: Version, timestamp_us: u64) {
        self.version = version;
        self.timestamp_us = timestamp_us;
    }

    /// The optimistic concurrency check. A sentinel previous version skips
    /// the corresponding half of the check; otherwise the writer must have
    /// observed a state at least as new as the committed one.
    pub fn verify_previous_version(
        &self,
        latest_version: Version,
        latest_version_by_key: Version,
    ) -> bool {
        let global_ok = self.previous_version == INVALID_VERSION
            || self.previous_version >= latest_version;
        let by_key_ok = self.previous_version_by_key == INVALID_VERSION
            || self.previous_version_by_key >= latest_version_by_key;
        global_ok && by_key_ok
    }

    /// The serialized size of this object, as reported to `get_size` callers.
    pub fn bytes_size(&self) -> u64 {
        // Serialization of these fields cannot fail.
        bincode::serialized_size(self).unwrap_or(0)
    }
}
