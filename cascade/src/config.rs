use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::observer::BackpressureMode;

const DEFAULT_DATA_DIR: &str = "storage/cascadedb";
pub const DEFAULT_LOG_FILE: &str = "shard.log";
const DEFAULT_STABLE_WAIT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_OBSERVER_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_OBSERVER_WORKERS: usize = 1;

/// Per-shard configuration, loaded from a TOML file with every field
/// optional and defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    version: u8,

    /// Where the shard keeps its version log, default 'storage/cascadedb'.
    data_dir: Option<PathBuf>,

    /// How long a stable read waits for the persistence frontier before
    /// reporting the version as not yet stable.
    stable_wait_timeout_ms: Option<u64>,

    /// Bound of the observer event queue.
    observer_queue_capacity: Option<usize>,

    /// Observer worker threads. Events of one shard stay on one worker.
    observer_workers: Option<usize>,

    /// Commit-path policy when the observer queue is full.
    observer_backpressure: Option<BackpressureMode>,

    /// Whether every log append syncs the file before acking. Turning this
    /// off trades durability for throughput.
    sync_on_append: Option<bool>,

    /// Identity stamped into observer events.
    pub subgroup_index: Option<u32>,
    pub shard_num: Option<u32>,
    pub node_id: Option<u64>,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            version: 0,
            data_dir: None,
            stable_wait_timeout_ms: Some(DEFAULT_STABLE_WAIT_TIMEOUT_MS),
            observer_queue_capacity: Some(DEFAULT_OBSERVER_QUEUE_CAPACITY),
            observer_workers: Some(DEFAULT_OBSERVER_WORKERS),
            observer_backpressure: Some(BackpressureMode::Block),
            sync_on_append: Some(true),
            subgroup_index: Some(0),
            shard_num: Some(0),
            node_id: Some(0),
        }
    }
}

impl ShardConfig {
    /// Loads the configuration from a TOML file, falling back to defaults
    /// when the file does not exist yet.
    pub fn load(path: &std::path::Path) -> CResult<Self> {
        confy::load_path(path).map_err(|err| Error::Value(err.to_string()))
    }

    pub fn store(&self, path: &std::path::Path) -> CResult<()> {
        confy::store_path(path, self).map_err(|err| Error::Value(err.to_string()))
    }

    pub fn get_data_dir(&self) -> PathBuf {
        match self.data_dir.as_ref() {
            None => PathBuf::from(DEFAULT_DATA_DIR),
            Some(dir) => dir.clone(),
        }
    }

    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.data_dir = Some(dir);
    }

    /// The log file inside the data dir.
    pub fn get_log_path(&self) -> PathBuf {
        self.get_data_dir().join(DEFAULT_LOG_FILE)
    }

    pub fn get_stable_wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.stable_wait_timeout_ms.unwrap_or(DEFAULT_STABLE_WAIT_TIMEOUT_MS),
        )
    }

    pub fn get_observer_queue_capacity(&self) -> usize {
        self.observer_queue_capacity.unwrap_or(DEFAULT_OBSERVER_QUEUE_CAPACITY)
    }

    pub fn get_observer_workers(&self) -> usize {
        self.observer_workers.unwrap_or(DEFAULT_OBSERVER_WORKERS)
    }

    pub fn get_observer_backpressure(&self) -> BackpressureMode {
        self.observer_backpressure.unwrap_or_default()
    }

    pub fn get_sync_on_append(&self) -> bool {
        self.sync_on_append.unwrap_or(true)
    }

    pub fn get_subgroup_index(&self) -> u32 {
        self.subgroup_index.unwrap_or(0)
    }

    pub fn get_shard_num(&self) -> u32 {
        self.shard_num.unwrap_or(0)
    }

    pub fn get_node_id(&self) -> u64 {
        self.node_id.unwrap_or(0)
    }

    /// change cmd:
    /// stable_wait_timeout_ms、observer_queue_capacity、observer_workers、
    /// observer_backpressure、sync_on_append
    pub fn inject_cmd(&mut self, cmd_name: &str, cmd_value: &str) -> CResult<()> {
        match cmd_name {
            "stable_wait_timeout_ms" => self.stable_wait_timeout_ms = Some(cmd_value.parse()?),
            "observer_queue_capacity" => self.observer_queue_capacity = Some(cmd_value.parse()?),
            "observer_workers" => self.observer_workers = Some(cmd_value.parse()?),
            "observer_backpressure" => {
                self.observer_backpressure = Some(match cmd_value {
                    "block" => BackpressureMode::Block,
                    "drop" => BackpressureMode::Drop,
                    ms => BackpressureMode::BoundedWaitMs(ms.parse()?),
                })
            }
            "sync_on_append" => {
                self.sync_on_append = Some(cmd_value.parse().map_err(|_| {
                    Error::Value(format!("not a boolean: {}", cmd_value))
                })?)
            }
            _ => return Err(Error::Value(format!("Unknown command: {}", cmd_name))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ShardConfig::default();
        assert_eq!(cfg.get_data_dir(), PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(cfg.get_stable_wait_timeout(), std::time::Duration::from_millis(2_000));
        assert_eq!(cfg.get_observer_backpressure(), BackpressureMode::Block);
        assert!(cfg.get_sync_on_append());
        assert_eq!(cfg.get_observer_workers(), 1);
    }

    #[test]
    fn inject_cmd_overrides() -> CResult<()> {
        let mut cfg = ShardConfig::default();
        cfg.inject_cmd("stable_wait_timeout_ms", "50")?;
        cfg.inject_cmd("observer_backpressure", "drop")?;
        cfg.inject_cmd("sync_on_append", "false")?;
        assert_eq!(cfg.get_stable_wait_timeout(), std::time::Duration::from_millis(50));
        assert_eq!(cfg.get_observer_backpressure(), BackpressureMode::Drop);
        assert!(!cfg.get_sync_on_append());

        cfg.inject_cmd("observer_backpressure", "250")?;
        assert_eq!(cfg.get_observer_backpressure(), BackpressureMode::BoundedWaitMs(250));

        assert!(cfg.inject_cmd("no_such_setting", "1").is_err());
        Ok(())
    }

    #[test]
    fn roundtrips_through_file() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let path = dir.path().join("shard.toml");

        let mut cfg = ShardConfig::default();
        cfg.inject_cmd("observer_queue_capacity", "64")?;
        cfg.store(&path)?;

        let loaded = ShardConfig::load(&path)?;
        assert_eq!(loaded.get_observer_queue_capacity(), 64);
        Ok(())
    }
}
