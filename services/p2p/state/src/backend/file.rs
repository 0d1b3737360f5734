//! File-based store backend: an append-only log replayed on open

use crate::{MetadataFilter, PersistedState, StateError, StateStore};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const LOG_FILE: &str = "state.log";
const COMPACT_FILE: &str = "state.log.compact";

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Fsync frequency (1 = every write, N = every N writes)
    pub fsync_every: u32,
    /// Minimum number of superseded records before compaction is considered
    pub compact_min_dead: usize,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./p2pdata"),
            fsync_every: 1,
            compact_min_dead: 1024,
        }
    }
}

/// One log entry
#[derive(Serialize, Deserialize, Debug)]
enum LogRecord {
    Put(PersistedState),
    Delete { key: String },
}

/// Log record header
#[derive(Debug)]
struct RecordHeader {
    len: u32,    // Body length (not including header)
    crc32c: u32, // CRC32 over body
}

impl RecordHeader {
    const SIZE: usize = 4 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc32c);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, StateError> {
        if buf.remaining() < Self::SIZE {
            return Err(StateError::Corruption("Incomplete record header".to_string()));
        }

        Ok(Self {
            len: buf.get_u32_le(),
            crc32c: buf.get_u32_le(),
        })
    }

    fn compute_crc(body: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(body);
        hasher.finalize()
    }
}

fn frame(record: &LogRecord, buf: &mut BytesMut) -> Result<(), StateError> {
    let body = serde_json::to_vec(record)?;
    let header = RecordHeader {
        len: body.len() as u32,
        crc32c: RecordHeader::compute_crc(&body),
    };
    buf.reserve(RecordHeader::SIZE + body.len());
    header.encode(buf);
    buf.extend_from_slice(&body);
    Ok(())
}

struct LogState {
    file: File,
    states: HashMap<String, PersistedState>,
    writes_since_sync: u32,
    dead_records: usize,
}

/// File-backed versioned store
pub struct FileStateStore {
    config: FileStoreConfig,
    inner: Mutex<LogState>,
}

impl FileStateStore {
    /// Open (or create) the store, replaying the existing log
    pub async fn open(config: FileStoreConfig) -> Result<Self, StateError> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        let log_path = config.data_dir.join(LOG_FILE);
        let (states, records, valid_len) = if log_path.exists() {
            Self::replay(&std::fs::read(&log_path)?)?
        } else {
            (HashMap::new(), 0, 0)
        };

        if log_path.exists() && std::fs::metadata(&log_path)?.len() > valid_len {
            warn!(
                "Truncating torn tail of {:?} at offset {}",
                log_path, valid_len
            );
            OpenOptions::new()
                .write(true)
                .open(&log_path)?
                .set_len(valid_len)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        info!(
            "Opened state log {:?}: {} live states from {} records",
            log_path,
            states.len(),
            records
        );

        let dead_records = records.saturating_sub(states.len());
        Ok(Self {
            config,
            inner: Mutex::new(LogState {
                file,
                states,
                writes_since_sync: 0,
                dead_records,
            }),
        })
    }

    /// Rebuild the key space from log bytes; returns (states, record count, valid length)
    fn replay(buf: &[u8]) -> Result<(HashMap<String, PersistedState>, usize, u64), StateError> {
        let total = buf.len();
        let mut bytes = Bytes::copy_from_slice(buf);
        let mut states = HashMap::new();
        let mut records = 0;
        let mut valid_len = 0u64;

        while bytes.remaining() >= RecordHeader::SIZE {
            let header = RecordHeader::decode(&mut bytes)?;

            if bytes.remaining() < header.len as usize {
                warn!("Incomplete record at offset {}", valid_len);
                break;
            }

            let body = bytes.split_to(header.len as usize);

            // Verify CRC
            if header.crc32c != RecordHeader::compute_crc(&body) {
                error!("CRC mismatch in state log at offset {}", valid_len);
                return Err(StateError::Corruption(format!(
                    "CRC mismatch at offset {}",
                    valid_len
                )));
            }

            match serde_json::from_slice::<LogRecord>(&body)? {
                LogRecord::Put(state) => {
                    states.insert(state.key.clone(), state);
                }
                LogRecord::Delete { key } => {
                    states.remove(&key);
                }
            }
            records += 1;
            valid_len = (total - bytes.remaining()) as u64;
        }

        Ok((states, records, valid_len))
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>, StateError> {
        self.inner
            .lock()
            .map_err(|_| StateError::Invalid("state log lock poisoned".to_string()))
    }

    /// Append framed records, honouring the fsync batching policy
    fn append(&self, log: &mut LogState, records: &[LogRecord]) -> Result<(), StateError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = BytesMut::new();
        for record in records {
            frame(record, &mut buf)?;
        }
        log.file.write_all(&buf)?;

        log.writes_since_sync += 1;
        if log.writes_since_sync >= self.config.fsync_every {
            log.file.sync_all()?;
            log.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Rewrite the log with only live records once superseded ones dominate
    fn maybe_compact(&self, log: &mut LogState) -> Result<(), StateError> {
        if log.dead_records < self.config.compact_min_dead || log.dead_records <= log.states.len()
        {
            return Ok(());
        }

        let log_path = self.config.data_dir.join(LOG_FILE);
        let compact_path = self.config.data_dir.join(COMPACT_FILE);

        let mut buf = BytesMut::new();
        for state in log.states.values() {
            frame(&LogRecord::Put(state.clone()), &mut buf)?;
        }

        let mut compacted = File::create(&compact_path)?;
        compacted.write_all(&buf)?;
        compacted.sync_all()?;
        std::fs::rename(&compact_path, &log_path)?;

        log.file = OpenOptions::new().append(true).open(&log_path)?;
        info!(
            "Compacted state log: dropped {} records, {} live",
            log.dead_records,
            log.states.len()
        );
        log.dead_records = 0;
        log.writes_since_sync = 0;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, PersistedState>, StateError> {
        let log = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|key| log.states.get(key).map(|s| (key.clone(), s.clone())))
            .collect())
    }

    async fn find_by_metadata_matching_any(
        &self,
        filters: &[MetadataFilter],
    ) -> Result<HashMap<String, PersistedState>, StateError> {
        let log = self.lock()?;
        Ok(log
            .states
            .values()
            .filter(|s| filters.iter().any(|f| s.metadata.matches(f)))
            .map(|s| (s.key.clone(), s.clone()))
            .collect())
    }

    async fn create(&self, states: Vec<PersistedState>) -> Result<HashSet<String>, StateError> {
        let mut log = self.lock()?;
        let mut failed = HashSet::new();
        let mut accepted: HashMap<String, PersistedState> = HashMap::new();

        for mut state in states {
            if log.states.contains_key(&state.key) || accepted.contains_key(&state.key) {
                failed.insert(state.key);
            } else {
                state.version = 0;
                accepted.insert(state.key.clone(), state);
            }
        }

        let records: Vec<LogRecord> = accepted.values().cloned().map(LogRecord::Put).collect();
        self.append(&mut log, &records)?;
        debug!("FileStore create accepted={} failed={}", accepted.len(), failed.len());
        log.states.extend(accepted);

        Ok(failed)
    }

    async fn update(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let mut log = self.lock()?;
        let mut failed = HashMap::new();
        let mut accepted: HashMap<String, PersistedState> = HashMap::new();

        for mut state in states {
            match log.states.get(&state.key) {
                Some(current) if current.version == state.version && !accepted.contains_key(&state.key) => {
                    state.version += 1;
                    accepted.insert(state.key.clone(), state);
                }
                Some(current) => {
                    failed.insert(state.key, Some(current.clone()));
                }
                None => {
                    failed.insert(state.key, None);
                }
            }
        }

        let records: Vec<LogRecord> = accepted.values().cloned().map(LogRecord::Put).collect();
        self.append(&mut log, &records)?;
        log.dead_records += accepted.len();
        log.states.extend(accepted);
        self.maybe_compact(&mut log)?;

        Ok(failed)
    }

    async fn delete(
        &self,
        states: Vec<PersistedState>,
    ) -> Result<HashMap<String, Option<PersistedState>>, StateError> {
        let mut log = self.lock()?;
        let mut failed = HashMap::new();
        let mut removed = HashSet::new();

        for state in states {
            match log.states.get(&state.key) {
                Some(current) if current.version == state.version => {
                    removed.insert(state.key);
                }
                Some(current) => {
                    failed.insert(state.key, Some(current.clone()));
                }
                None => {
                    failed.insert(state.key, None);
                }
            }
        }

        let records: Vec<LogRecord> = removed
            .iter()
            .map(|key| LogRecord::Delete { key: key.clone() })
            .collect();
        self.append(&mut log, &records)?;
        for key in &removed {
            log.states.remove(key);
        }
        // The put and the delete record both become dead
        log.dead_records += removed.len() * 2;
        self.maybe_compact(&mut log)?;

        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;

    fn config(dir: &std::path::Path) -> FileStoreConfig {
        FileStoreConfig {
            data_dir: dir.to_path_buf(),
            fsync_every: 1,
            compact_min_dead: 4,
        }
    }

    fn state(key: &str, serial: u64) -> PersistedState {
        PersistedState::new(key, vec![1, 2, 3], Metadata::new().with("serial", serial))
    }

    #[tokio::test]
    async fn test_file_store_replay() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = FileStateStore::open(config(dir.path())).await.unwrap();
            store.create(vec![state("a", 1), state("b", 1)]).await.unwrap();

            let mut a = store.get(&["a".to_string()]).await.unwrap()["a"].clone();
            a.metadata.insert("serial", 2u64);
            assert!(store.update(vec![a]).await.unwrap().is_empty());

            let b = store.get(&["b".to_string()]).await.unwrap()["b"].clone();
            assert!(store.delete(vec![b]).await.unwrap().is_empty());
        }

        let store = FileStateStore::open(config(dir.path())).await.unwrap();
        let all = store
            .get(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["a"].version, 1);
        assert_eq!(all["a"].metadata.get_u64("serial"), Some(2));
    }

    #[tokio::test]
    async fn test_file_store_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStateStore::open(config(dir.path())).await.unwrap();
            store.create(vec![state("a", 1)]).await.unwrap();
        }

        // Simulate a crash mid-append
        let log_path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2, 3, 4, b'{']).unwrap();
        drop(file);

        let store = FileStateStore::open(config(dir.path())).await.unwrap();
        assert_eq!(store.get(&["a".to_string()]).await.unwrap().len(), 1);

        // Appends after truncation replay cleanly
        store.create(vec![state("b", 1)]).await.unwrap();
        drop(store);
        let store = FileStateStore::open(config(dir.path())).await.unwrap();
        assert_eq!(
            store
                .get(&["a".to_string(), "b".to_string()])
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_file_store_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(config(dir.path())).await.unwrap();
        store.create(vec![state("a", 0)]).await.unwrap();

        for serial in 1..=10u64 {
            let mut a = store.get(&["a".to_string()]).await.unwrap()["a"].clone();
            a.metadata.insert("serial", serial);
            assert!(store.update(vec![a]).await.unwrap().is_empty());
        }

        drop(store);
        let bytes = std::fs::read(dir.path().join(LOG_FILE)).unwrap();
        let (states, records, _) = FileStateStore::replay(&bytes).unwrap();
        assert!(records < 11);
        assert_eq!(states["a"].version, 10);
        assert_eq!(states["a"].metadata.get_u64("serial"), Some(10));
    }
}
