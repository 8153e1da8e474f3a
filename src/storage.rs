#![forbid(unsafe_code)]

// Storage collaborator for shared-file payloads

use crate::error::RelayResult;
use crate::room::history::FileRecord;
use tracing::debug;

/// Where uploaded file bytes go. The relay only keeps metadata.
///
/// Called without any room lock held.
pub trait FileStore: Send + Sync {
    /// Persist `data` for `record`; returns a storage key when the bytes are
    /// retained somewhere.
    fn persist(&self, room_id: &str, record: &FileRecord, data: &str) -> RelayResult<Option<String>>;

    /// Drop bytes persisted under `storage_key` that never became visible.
    fn discard(&self, storage_key: &str) -> RelayResult<()>;
}

/// Default store: payloads are relayed to participants but never retained.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardingFileStore;

impl FileStore for DiscardingFileStore {
    fn persist(&self, room_id: &str, record: &FileRecord, _data: &str) -> RelayResult<Option<String>> {
        debug!("Not retaining {} ({} bytes) shared in room {}", record.filename, record.size, room_id);
        Ok(None)
    }

    fn discard(&self, _storage_key: &str) -> RelayResult<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::RelayError;
    use std::sync::Mutex;

    /// Keeps payloads in memory so tests can inspect what was stored.
    #[derive(Default)]
    pub(crate) struct MemoryFileStore {
        pub(crate) stored: Mutex<Vec<(String, String, String)>>,
        pub(crate) fail: bool,
    }

    impl FileStore for MemoryFileStore {
        fn persist(&self, room_id: &str, record: &FileRecord, data: &str) -> RelayResult<Option<String>> {
            if self.fail {
                return Err(RelayError::Internal("storage unavailable".into()));
            }
            let key = format!("{room_id}/{}", record.id);
            self.stored
                .lock()
                .unwrap()
                .push((key.clone(), record.filename.clone(), data.to_string()));
            Ok(Some(key))
        }

        fn discard(&self, storage_key: &str) -> RelayResult<()> {
            self.stored.lock().unwrap().retain(|(key, _, _)| key != storage_key);
            Ok(())
        }
    }

    #[test]
    fn test_discarding_store_keeps_nothing() {
        let record = FileRecord {
            id: "f1".into(),
            filename: "a.txt".into(),
            size: 3,
            uploader_id: "u".into(),
            uploader_name: "U".into(),
            uploaded_at: 0,
            storage_key: None,
        };
        assert_eq!(DiscardingFileStore.persist("abc", &record, "abc").unwrap(), None);
        assert!(DiscardingFileStore.discard("abc/f1").is_ok());
    }

    #[test]
    fn test_memory_store_discard() {
        let store = MemoryFileStore::default();
        let record = FileRecord {
            id: "f1".into(),
            filename: "a.txt".into(),
            size: 3,
            uploader_id: "u".into(),
            uploader_name: "U".into(),
            uploaded_at: 0,
            storage_key: None,
        };
        let key = store.persist("abc", &record, "abc").unwrap().unwrap();
        store.discard(&key).unwrap();
        assert!(store.stored.lock().unwrap().is_empty());
    }
}
