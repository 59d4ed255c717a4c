use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use crate::codec::DeltaCodec;
use crate::delta::{replay_into, Delta, DeltaKind};
use crate::error::{CResult, Error};
use crate::object::{ObjectKey, Version, VersionedObject, INVALID_VERSION};
use crate::storage::log::{FrameMeta, Log};
use crate::storage::VersionIndex;

/// The persisted version timeline of one shard: an append-only sequence of
/// deltas framed by [`Log`], indexed in memory by version and by commit
/// timestamp so any past state can be located and replayed.
///
/// The append order, the version order and the broadcast delivery order are
/// the same order; the indexes rely on it.
pub struct VersionLog<K: ObjectKey> {
    log: Log,
    codec: DeltaCodec,

    /// Every intact frame in append order, for replay.
    frames: Vec<FrameMeta>,

    /// version -> the last frame committed at that version.
    version_index: VersionIndex,

    /// Strictly ascending commit timestamps don't need a map: binary search
    /// over (timestamp_us, version) pairs in append order.
    time_index: Vec<(u64, Version)>,

    latest_version: Version,

    /// Whether append syncs the file before returning.
    sync_on_append: bool,

    _marker: PhantomData<K>,
}

impl<K: ObjectKey> VersionLog<K> {
    /// Opens or creates the version log at `path`, scanning it to rebuild
    /// the in-memory indexes. Tail recovery happens here; see
    /// [`Log::recover_frames`].
    pub fn new(path: PathBuf, sync_on_append: bool) -> CResult<Self> {
        Self::new_with_lock(path, sync_on_append, true)
    }

    pub fn new_with_lock(path: PathBuf, sync_on_append: bool, try_lock: bool) -> CResult<Self> {
        let mut log = Log::new_with_lock(path, try_lock)?;
        let frames = log.recover_frames()?;

        let mut version_index = VersionIndex::new();
        let mut time_index = Vec::with_capacity(frames.len());
        let mut latest_version = INVALID_VERSION;
        for meta in &frames {
            if meta.version < latest_version {
                return Err(Error::Corruption(format!(
                    "version {} out of order after {} in {:?}",
                    meta.version, latest_version, log.path
                )));
            }
            version_index.insert(meta.version, *meta);
            match time_index.last() {
                Some(&(ts, _)) if ts == meta.timestamp_us => {
                    // Same commit instant, keep the later version.
                    *time_index.last_mut().unwrap() = (meta.timestamp_us, meta.version);
                }
                _ => time_index.push((meta.timestamp_us, meta.version)),
            }
            latest_version = meta.version;
        }

        Ok(Self {
            log,
            codec: DeltaCodec::new(),
            frames,
            version_index,
            time_index,
            latest_version,
            sync_on_append,
            _marker: PhantomData,
        })
    }

    /// The greatest version present in the log, or [`INVALID_VERSION`].
    pub fn latest_version(&self) -> Version {
        self.latest_version
    }

    pub fn delta_count(&self) -> u64 {
        self.frames.len() as u64
    }

    pub fn disk_size(&mut self) -> CResult<u64> {
        self.log.disk_size()
    }

    pub fn path(&self) -> &std::path::Path {
        &self.log.path
    }

    /// Appends the deltas of one committed mutation as a single atomic
    /// append: all frames are written, then the file is synced once.
    /// Versions must not move backwards.
    pub fn append(&mut self, deltas: &[Delta<K>]) -> CResult<()> {
        for delta in deltas {
            if delta.version < self.latest_version {
                return Err(Error::Value(format!(
                    "append of version {} behind latest {}",
                    delta.version, self.latest_version
                )));
            }
            let payload = self.codec.encode(&delta.value)?;
            let meta = self.log.append_frame(
                delta.version,
                delta.timestamp_us,
                delta.kind.as_u8(),
                &payload,
            )?;
            self.version_index.insert(meta.version, meta);
            match self.time_index.last() {
                Some(&(ts, _)) if ts == meta.timestamp_us => {
                    *self.time_index.last_mut().unwrap() = (meta.timestamp_us, meta.version);
                }
                _ => self.time_index.push((meta.timestamp_us, meta.version)),
            }
            self.latest_version = meta.version;
            self.frames.push(meta);
        }
        if self.sync_on_append {
            self.log.sync()?;
        }
        Ok(())
    }

    /// Returns the delta committed exactly at `version`, or, when `exact` is
    /// false, the latest delta at or before `version`. `None` if no such
    /// delta exists.
    pub fn read_delta(&mut self, version: Version, exact: bool) -> CResult<Option<Delta<K>>> {
        let meta = if exact {
            self.version_index.get(&version).copied()
        } else {
            self.version_index.range(..=version).next_back().map(|(_, m)| *m)
        };
        let meta = match meta {
            Some(meta) => meta,
            None => return Ok(None),
        };

        let payload = self.log.read_payload(&meta)?;
        let value: VersionedObject<K> = self.codec.decode(&payload)?;
        let kind = DeltaKind::from_u8(meta.kind).ok_or_else(|| {
            Error::Corruption(format!("unknown delta kind {} at offset {}", meta.kind, meta.pos))
        })?;
        Ok(Some(Delta { kind, version: meta.version, timestamp_us: meta.timestamp_us, value }))
    }

    /// Materializes the state after applying every delta with version ≤
    /// `version`, by replaying the log from the start.
    pub fn reconstruct(&mut self, version: Version) -> CResult<BTreeMap<K, VersionedObject<K>>> {
        self.reconstruct_from(BTreeMap::new(), INVALID_VERSION, version)
    }

    /// Replay starting from a checkpointed base state: applies every delta
    /// with version in (`after`, `upto`] on top of `base`.
    pub fn reconstruct_from(
        &mut self,
        mut base: BTreeMap<K, VersionedObject<K>>,
        after: Version,
        upto: Version,
    ) -> CResult<BTreeMap<K, VersionedObject<K>>> {
        let start = self.frames.partition_point(|m| m.version <= after);
        let end = self.frames.partition_point(|m| m.version <= upto);
        for i in start..end {
            let meta = self.frames[i];
            let payload = self.log.read_payload(&meta)?;
            let value: VersionedObject<K> = self.codec.decode(&payload)?;
            let kind = DeltaKind::from_u8(meta.kind).ok_or_else(|| {
                Error::Corruption(format!(
                    "unknown delta kind {} at offset {}",
                    meta.kind, meta.pos
                ))
            })?;
            let delta =
                Delta { kind, version: meta.version, timestamp_us: meta.timestamp_us, value };
            replay_into(&mut base, &delta);
        }
        Ok(base)
    }

    /// The state after the newest committed version, for replica restart.
    pub fn replay_all(&mut self) -> CResult<BTreeMap<K, VersionedObject<K>>> {
        let latest = self.latest_version;
        self.reconstruct(latest)
    }

    /// The greatest version whose commit timestamp is at or before `ts_us`,
    /// or [`INVALID_VERSION`] if the log holds nothing that old.
    pub fn version_at_time(&self, ts_us: u64) -> Version {
        let idx = self.time_index.partition_point(|&(ts, _)| ts <= ts_us);
        if idx == 0 {
            INVALID_VERSION
        } else {
            self.time_index[idx - 1].1
        }
    }

    pub fn sync(&mut self) -> CResult<()> {
        self.log.sync()
    }
}
