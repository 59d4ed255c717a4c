//! `cascade-rs` is a replicated, versioned key-value shard store. Mutations
//! arrive in a total order, every commit appends a delta to an append-only
//! log, and reads resolve against any point of the version timeline: the
//! live map answers current-state reads without locking, while historical
//! reads replay the log. Two consistency modes are offered; stable reads
//! wait for the global persistence frontier so they can never observe data
//! that a membership change could roll back.
//!
//! ## Getting started
//!
//! ```rust
//! use cascade_rs::config::ShardConfig;
//! use cascade_rs::error::CResult;
//! use cascade_rs::object::{VersionedObject, CURRENT_VERSION};
//! use cascade_rs::store::ShardStore;
//!
//! fn main() -> CResult<()> {
//!     let dir = tempdir::TempDir::new("cascade")?;
//!     let mut config = ShardConfig::default();
//!     config.set_data_dir(dir.path().to_path_buf());
//!
//!     let store: ShardStore<String> = ShardStore::open(&config)?;
//!
//!     let (version, _ts_us) = store.put(VersionedObject::new("pool/obj-1".to_string(), b"hello"))?;
//!
//!     // The freshest state, served locklessly from the live map.
//!     let current = store.get(&"pool/obj-1".to_string(), CURRENT_VERSION, false, false)?.unwrap();
//!     assert_eq!(current.blob.as_slice(), b"hello");
//!
//!     // The same object, read back from the log at its commit version.
//!     let historical = store.get(&"pool/obj-1".to_string(), version, false, true)?.unwrap();
//!     assert_eq!(historical.version, version);
//!
//!     store.remove(&"pool/obj-1".to_string())?;
//!     assert!(store.get(&"pool/obj-1".to_string(), CURRENT_VERSION, false, false)?.unwrap().is_null());
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod object;
pub mod delta;
pub mod storage;
pub mod codec;
pub mod frontier;
pub mod substrate;
pub mod store;
pub mod observer;
pub mod config;
pub mod tlog;

#[cfg(test)]
mod test {
    use crate::config::ShardConfig;
    use crate::error::CResult;
    use crate::object::{VersionedObject, CURRENT_VERSION};
    use crate::store::ShardStore;

    #[test]
    fn run() -> CResult<()> {
        let dir = tempdir::TempDir::new("cascade")?;
        let mut config = ShardConfig::default();
        config.set_data_dir(dir.path().to_path_buf());

        let store: ShardStore<String> = ShardStore::open(&config)?;

        store.put(VersionedObject::new("b".to_string(), &[0x01]))?;
        store.put(VersionedObject::new("b".to_string(), &[0x02]))?;

        store.put(VersionedObject::new("e".to_string(), &[0x05]))?;
        store.remove(&"e".to_string())?;

        store.put(VersionedObject::new("c".to_string(), &[0x00]))?;
        store.remove(&"c".to_string())?;
        store.put(VersionedObject::new("c".to_string(), &[0x03]))?;

        store.put(VersionedObject::new("a".to_string(), &[0x01]))?;

        store.remove(&"f".to_string())?;

        store.remove(&"d".to_string())?;
        store.put(VersionedObject::new("d".to_string(), &[0x04]))?;

        // Make sure the listing yields the live keys.
        let mut keys = store.list_keys("", CURRENT_VERSION, false)?;
        keys.sort();
        assert_eq!(
            keys,
            vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
        );

        // And the values are the newest committed ones.
        assert_eq!(
            store.get(&"b".to_string(), CURRENT_VERSION, false, false)?.unwrap().blob.as_slice(),
            &[0x02],
        );
        assert_eq!(
            store.get(&"c".to_string(), CURRENT_VERSION, false, false)?.unwrap().blob.as_slice(),
            &[0x03],
        );

        Ok(())
    }
}
