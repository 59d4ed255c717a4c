use std::sync::Arc;

use cascade_rs::config::ShardConfig;
use cascade_rs::error::Error;
use cascade_rs::object::{VersionedObject, CURRENT_VERSION};
use cascade_rs::observer::ObserverEvent;
use cascade_rs::store::ShardStore;

fn main() {
    println!("Hello, cascade!");

    run().unwrap();

    println!("Bye~");
}

fn run() -> Result<(), Error> {
    let dir = tempdir::TempDir::new("cascade-example")?;
    let mut config = ShardConfig::default();
    config.set_data_dir(dir.path().join("shard0"));

    let store: ShardStore<String> = ShardStore::open(&config)?;

    // A demo observer forwarding every committed mutation downstream; the
    // trigger flag marks events that bypassed storage.
    store.register_observer(Arc::new(|event: &ObserverEvent<String>| {
        println!(
            "observer: key={} version={} trigger={} null={}",
            event.key,
            event.version,
            event.is_trigger,
            event.value.is_null()
        );
    }));

    let (v1, ts1) = store.put(VersionedObject::new("farm/cow-1".to_string(), b"photo-a"))?;
    println!("committed farm/cow-1 at version {} ts {}", v1, ts1);

    let (v2, _) = store.put(VersionedObject::new("farm/cow-1".to_string(), b"photo-b"))?;
    store.put(VersionedObject::new("farm/cow-2".to_string(), b"photo-c"))?;

    // Current state, locklessly.
    let current = store.get(&"farm/cow-1".to_string(), CURRENT_VERSION, false, false)?.unwrap();
    assert_eq!(current.blob.as_slice(), b"photo-b");

    // History: the first photo is still there at its commit version.
    let old = store.get(&"farm/cow-1".to_string(), v1, false, true)?.unwrap();
    assert_eq!(old.blob.as_slice(), b"photo-a");

    // Time travel to the instant of the second commit.
    let by_time = store.get_by_time(&"farm/cow-1".to_string(), ts1, false)?.unwrap();
    assert_eq!(by_time.version, v1);

    // Prefix listing at a historical version.
    let keys = store.list_keys("farm/", v2, false)?;
    assert_eq!(keys.len(), 1);

    // A stable read: with the loopback substrate, persistence keeps pace.
    let stable = store.get(&"farm/cow-2".to_string(), CURRENT_VERSION, true, false)?.unwrap();
    assert_eq!(stable.blob.as_slice(), b"photo-c");

    // Removes leave a tombstone in the timeline.
    store.remove(&"farm/cow-2".to_string())?;
    assert!(store.get(&"farm/cow-2".to_string(), CURRENT_VERSION, false, false)?.unwrap().is_null());

    // Trigger path: observers see it, the store does not.
    store.trigger_put(VersionedObject::new("farm/alert".to_string(), b"loose cow"));
    assert!(store.get(&"farm/alert".to_string(), CURRENT_VERSION, false, false)?.is_none());

    let status = store.status()?;
    println!("{}: {} live keys, {} deltas", status.name, status.keys, status.deltas);

    Ok(())
}
