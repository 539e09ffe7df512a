//! Assembly of the data plane: ordered index, write-ahead log, and the
//! epoch collector, plus crash recovery.
//!
//! Recovery runs before the server accepts any connection: the log file is
//! replayed sequentially, each OBJ record inserted and each TOMB record
//! removed through the same skip-list operations the service handlers use,
//! then the log is reopened for appending with any torn trailing record
//! discarded.

use std::sync::Arc;

use crate::cleaner::{Cleaner, EpochRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::log::{Log, LogEntry, Record, Replay};
use crate::skiplist::{AddOutcome, NodeRef, RetiredNode, RetiredValue, SkipList, UnlinkOutcome, ValueObject};

pub struct Store {
    pub list: SkipList,
    pub log: Log,
    pub cleaner: Cleaner,
}

impl Store {
    /// Opens the WAL (replaying it first when `recover` is set), starts the
    /// log writer and collector threads, and returns the assembled store.
    pub fn open(config: &Config, registry: Arc<EpochRegistry>) -> Result<Store> {
        let path = config
            .log_file_path
            .as_deref()
            .ok_or_else(|| Error::Config("server requires a log file path".into()))?;

        let list = SkipList::new();
        let cleaner = Cleaner::start(registry);

        let preserve_len = if config.recover && path.exists() {
            let mut replay = Replay::open(path)?;
            let mut objects = 0u64;
            let mut tombstones = 0u64;
            for record in replay.by_ref() {
                match record? {
                    Record::Object { key, value } => {
                        objects += 1;
                        apply_object(&list, &cleaner, key, &value);
                    }
                    Record::Tombstone { key } => {
                        tombstones += 1;
                        apply_tombstone(&list, &cleaner, key);
                    }
                }
            }
            tracing::info!(
                objects,
                tombstones,
                live = list.size(),
                valid_bytes = replay.valid_len(),
                "write-ahead log replayed"
            );
            Some(replay.valid_len())
        } else {
            None
        };

        let log = Log::open(path, config.segment_size, preserve_len)?;
        Ok(Store { list, log, cleaner })
    }

    /// Appends an object record, returning the caller's durability barrier.
    pub fn log_object(&self, key: u64, value: &[u8]) -> u64 {
        self.log.append(&LogEntry::Object { key, value })
    }

    /// Appends a tombstone record, returning the caller's durability
    /// barrier.
    pub fn log_tombstone(&self, key: u64) -> u64 {
        self.log.append(&LogEntry::Tombstone { key })
    }

    /// Stamps and queues an unlinked node for deferred destruction.
    pub fn retire_node(&self, node: RetiredNode) {
        let stamp = self.list.advance_epoch();
        self.cleaner.collect_node(stamp, node);
    }

    /// Stamps and queues a superseded value for deferred destruction.
    pub fn retire_value(&self, value: RetiredValue) {
        let stamp = self.list.advance_epoch();
        self.cleaner.collect_value(stamp, value);
    }
}

/// Recovery-time insert-or-replace. Single-threaded, so the retry arms are
/// spin-outs at worst.
fn apply_object(list: &SkipList, cleaner: &Cleaner, key: u64, value: &[u8]) {
    let node = loop {
        match list.add_or_get(key) {
            AddOutcome::Found(node) | AddOutcome::Created(node) => break node,
            AddOutcome::Retry => std::hint::spin_loop(),
        }
    };
    while !node.try_lock() {
        std::hint::spin_loop();
    }
    let old = node.set_value(ValueObject::new(value));
    node.unlock();
    if let Some(old) = old {
        cleaner.collect_value(0, old);
    }
}

fn apply_tombstone(list: &SkipList, cleaner: &Cleaner, key: u64) {
    let Some(candidate) = list.delete_candidate(key) else {
        return; // erase of an absent key was already a no-op when logged
    };
    mark_candidate(candidate);
    while list.unlink(candidate) == UnlinkOutcome::Retry {
        std::hint::spin_loop();
    }
    cleaner.collect_node(0, RetiredNode(candidate));
}

fn mark_candidate(candidate: NodeRef) {
    while !candidate.try_lock() {
        std::hint::spin_loop();
    }
    candidate.set_marked();
    candidate.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::time::{Duration, Instant};

    fn test_config(path: &std::path::Path, recover: bool) -> Config {
        Config::default().log_file_path(path).recover(recover)
    }

    fn await_sync(store: &Store, barrier: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.log.sync(barrier) {
            assert!(Instant::now() < deadline, "durability barrier never reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn read(store: &Store, key: u64) -> Option<Vec<u8>> {
        store.list.find(key).and_then(|node| node.read_value(|v| v.to_vec()))
    }

    #[test]
    fn open_requires_log_path() {
        let config = Config::default();
        assert!(matches!(
            Store::open(&config, EpochRegistry::new(1)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn fresh_open_truncates() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"stale bytes").unwrap();
        let store = Store::open(&test_config(file.path(), false), EpochRegistry::new(1)).unwrap();
        assert_eq!(store.log.appended_len(), 0);
        assert!(store.list.is_empty());
    }

    #[test]
    fn recovery_round_trip() {
        let file = NamedTempFile::new().unwrap();
        {
            let store =
                Store::open(&test_config(file.path(), false), EpochRegistry::new(1)).unwrap();
            apply_object(&store.list, &store.cleaner, 1, b"x");
            let b1 = store.log_object(1, b"x");
            apply_object(&store.list, &store.cleaner, 2, b"y");
            let b2 = store.log_object(2, b"y");
            apply_tombstone(&store.list, &store.cleaner, 1);
            let b3 = store.log_tombstone(1);
            assert!(b1 < b2 && b2 < b3);
            await_sync(&store, b3);
        }

        let store = Store::open(&test_config(file.path(), true), EpochRegistry::new(1)).unwrap();
        assert_eq!(read(&store, 1), None);
        assert_eq!(read(&store, 2), Some(b"y".to_vec()));
        assert_eq!(store.list.size(), 1);

        // New appends land after the replayed tail.
        let barrier = store.log_object(3, b"z");
        assert!(barrier > 0);
        await_sync(&store, barrier);
    }

    #[test]
    fn recovery_applies_overwrites_in_order() {
        let file = NamedTempFile::new().unwrap();
        {
            let store =
                Store::open(&test_config(file.path(), false), EpochRegistry::new(1)).unwrap();
            let mut last = 0;
            for value in [b"v1", b"v2", b"v3"] {
                last = store.log_object(9, value);
            }
            await_sync(&store, last);
        }
        let store = Store::open(&test_config(file.path(), true), EpochRegistry::new(1)).unwrap();
        assert_eq!(read(&store, 9), Some(b"v3".to_vec()));
        assert_eq!(store.list.size(), 1);
    }

    #[test]
    fn retire_advances_epoch() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(&test_config(file.path(), false), EpochRegistry::new(1)).unwrap();
        let before = store.list.current_epoch();
        apply_object(&store.list, &store.cleaner, 4, b"a");
        let node = store.list.find(4).unwrap();
        assert!(node.try_lock());
        let old = node.set_value(ValueObject::new(b"b")).unwrap();
        node.unlock();
        store.retire_value(old);
        assert!(store.list.current_epoch() > before);
    }
}
