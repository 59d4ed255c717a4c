pub mod log;
pub mod version_log;

use serde_derive::{Deserialize, Serialize};

use crate::object::Version;
use crate::storage::log::FrameMeta;

/// VersionIndex是一个内存当中的map：key为提交版本号，value为该版本的delta在日志
/// 文件当中的帧位置（FrameMeta），用于按版本做偏移读取。始终保存每个版本的最后一帧。
/// BTreeMap便于做 "小于等于某版本的最近一帧" 的range查询。
pub type VersionIndex = std::collections::BTreeMap<Version, FrameMeta>;

/// A snapshot of the shard store's state, for introspection and the CLI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The name of the store.
    pub name: String,

    /// The number of live (non-tombstoned) keys.
    pub keys: u64,

    /// The logical size of live payloads.
    pub size: u64,

    /// The on-disk size of the version log.
    pub disk_size: u64,

    /// The number of deltas in the version log.
    pub deltas: u64,

    /// The latest version committed to the log.
    pub latest_version: Version,
}

#[cfg(test)]
mod tests {

    #[test]
    fn test() {
        assert_eq!(1, 1);
    }
}
