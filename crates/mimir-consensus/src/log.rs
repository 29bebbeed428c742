use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::path::Path;

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{Entry, LogId, OptionalSend, RaftLogReader, StorageError, StorageIOError, Vote};
use serde::de::DeserializeOwned;
use serde::Serialize;

use mimir_types::MimirError;

use crate::{NodeId, TypeConfig};

// Stable-store keys. Votes and watermarks live in `stable/`, entries in `log/`.
const KEY_VOTE: &[u8] = b"vote";
const KEY_COMMITTED: &[u8] = b"committed";
const KEY_LAST_PURGED: &[u8] = b"last_purged";

/// Consensus log and stable store, one sled database per directory.
///
/// Entries are keyed by big-endian log index, so sled's byte order is the
/// log order. Entries, votes, and watermarks are stored as JSON.
#[derive(Debug, Clone)]
pub struct LogStore {
    log: sled::Db,
    stable: sled::Db,
}

impl LogStore {
    pub fn open(log_dir: &Path, stable_dir: &Path) -> Result<Self, MimirError> {
        let log = sled::open(log_dir)
            .map_err(|e| MimirError::Io(format!("opening log store: {e}")))?;
        let stable = sled::open(stable_dir)
            .map_err(|e| MimirError::Io(format!("opening stable store: {e}")))?;
        Ok(LogStore { log, stable })
    }

    // Insert without the flush/callback dance; the trait methods flush.
    fn put_entries(&self, entries: Vec<Entry<TypeConfig>>) -> Result<(), StorageError<NodeId>> {
        for entry in entries {
            let bytes = serde_json::to_vec(&entry).map_err(write_logs_err)?;
            self.log
                .insert(entry.log_id.index.to_be_bytes(), bytes)
                .map_err(write_logs_err)?;
        }
        Ok(())
    }

    fn remove_range(
        &self,
        from: Bound<u64>,
        to: Bound<u64>,
    ) -> Result<(), StorageError<NodeId>> {
        let start = match from {
            Bound::Included(i) => i,
            Bound::Excluded(i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let mut doomed = Vec::new();
        for kv in self.log.range(start.to_be_bytes()..) {
            let (key, value) = kv.map_err(read_logs_err)?;
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(read_logs_err)?;
            let index = entry.log_id.index;
            let in_range = match to {
                Bound::Included(i) => index <= i,
                Bound::Excluded(i) => index < i,
                Bound::Unbounded => true,
            };
            if !in_range {
                break;
            }
            doomed.push(key);
        }
        for key in doomed {
            self.log.remove(key).map_err(write_logs_err)?;
        }
        Ok(())
    }

    fn read_meta<T: DeserializeOwned>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StorageError<NodeId>> {
        match self.stable.get(key).map_err(read_logs_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(read_logs_err)?)),
            None => Ok(None),
        }
    }

    async fn write_meta<T: Serialize>(
        &self,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError<NodeId>> {
        let raw = serde_json::to_vec(value).map_err(write_logs_err)?;
        self.stable.insert(key, raw).map_err(write_logs_err)?;
        self.stable.flush_async().await.map_err(write_logs_err)?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let mut entries = Vec::new();
        for kv in self.log.range(start.to_be_bytes()..) {
            let (_, value) = kv.map_err(read_logs_err)?;
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(read_logs_err)?;
            if !range.contains(&entry.log_id.index) {
                break;
            }
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id: Option<LogId<NodeId>> = self.read_meta(KEY_LAST_PURGED)?;
        let last_log_id = match self.log.last().map_err(read_logs_err)? {
            Some((_, value)) => {
                let entry: Entry<TypeConfig> =
                    serde_json::from_slice(&value).map_err(read_logs_err)?;
                Some(entry.log_id)
            }
            None => last_purged_log_id,
        };
        Ok(LogState { last_purged_log_id, last_log_id })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let raw = serde_json::to_vec(vote).map_err(vote_write_err)?;
        self.stable.insert(KEY_VOTE, raw).map_err(vote_write_err)?;
        self.stable.flush_async().await.map_err(vote_write_err)?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self.stable.get(KEY_VOTE).map_err(vote_read_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(vote_read_err)?)),
            None => Ok(None),
        }
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_meta(KEY_COMMITTED, &committed).await
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.read_meta::<Option<LogId<NodeId>>>(KEY_COMMITTED)?.flatten())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        self.put_entries(entries.into_iter().collect())?;
        self.log.flush_async().await.map_err(write_logs_err)?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        tracing::debug!(from = log_id.index, "truncating conflicting log suffix");
        self.remove_range(Bound::Included(log_id.index), Bound::Unbounded)?;
        self.log.flush_async().await.map_err(write_logs_err)?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        // Watermark first: a purge interrupted mid-delete must still report
        // the purged prefix as gone.
        self.write_meta(KEY_LAST_PURGED, &log_id).await?;
        self.remove_range(Bound::Unbounded, Bound::Included(log_id.index))?;
        self.log.flush_async().await.map_err(write_logs_err)?;
        Ok(())
    }
}

fn read_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_logs(&e) }
}

fn write_logs_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_logs(&e) }
}

fn vote_read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_vote(&e) }
}

fn vote_write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_vote(&e) }
}
