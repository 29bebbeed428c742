use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership,
};

use mimir_storage::{KvStore, SnapshotDir};
use mimir_types::{Command, CommandOutcome, MimirError, ACTION_DELETE, ACTION_SET};

use crate::{Member, NodeId, TypeConfig};

/// Snapshot wrapper persisted in the ring: consensus metadata plus the
/// encoded map bytes. The data half is byte-identical to `data.json`.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, Member>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
struct Applied {
    last_log_id: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, Member>,
}

/// The deterministic state machine over the on-disk map.
///
/// `apply` is a pure function of the prior file contents and the entry
/// payload: no clock, no randomness, no node identity. Every replica that
/// applies the same committed prefix ends with a byte-identical `data.json`.
///
/// Applied-state bookkeeping lives in memory, re-seeded from the newest ring
/// snapshot at startup; committed entries past that point are replayed on
/// restart, which also rebuilds an emptied `data.json` from the log.
#[derive(Debug, Clone)]
pub struct StateMachineStore {
    kv: KvStore,
    snaps: SnapshotDir,
    applied: Arc<Mutex<Applied>>,
}

impl StateMachineStore {
    pub fn open(data_file: &Path, snaps_dir: &Path) -> Result<Self, MimirError> {
        let kv = KvStore::open(data_file);
        let snaps = SnapshotDir::open(snaps_dir)?;
        let applied = match snaps.latest()? {
            Some(raw) => {
                let stored = decode_stored(&raw)?;
                Applied {
                    last_log_id: stored.meta.last_log_id,
                    last_membership: stored.meta.last_membership,
                }
            }
            None => Applied::default(),
        };
        Ok(StateMachineStore { kv, snaps, applied: Arc::new(Mutex::new(applied)) })
    }

    /// Non-consensus read straight from the on-disk map. Absent keys read as
    /// empty values.
    pub fn local_get(&self, key: &str) -> Result<Vec<u8>, MimirError> {
        self.kv.get(key)
    }

    fn apply_command(&self, cmd: &Command) -> Result<(), MimirError> {
        match cmd.action.as_str() {
            ACTION_SET => {
                let mut map = self.kv.load()?;
                map.insert(cmd.key.clone(), cmd.value.clone());
                self.kv.save(&map)
            }
            ACTION_DELETE => {
                let mut map = self.kv.load()?;
                map.remove(&cmd.key);
                self.kv.save(&map)
            }
            other => {
                // A newer binary's commands must not wedge this replica, and
                // every replica must make the same call, so: a logged no-op.
                tracing::warn!(action = other, key = %cmd.key, "ignoring unknown command action");
                Ok(())
            }
        }
    }

    fn store_snapshot(
        &self,
        meta: &SnapshotMeta<NodeId, Member>,
        data: &[u8],
    ) -> Result<(), MimirError> {
        let stored = StoredSnapshot { meta: meta.clone(), data: data.to_vec() };
        let raw = bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| MimirError::Encode(e.to_string()))?;
        let (index, term) = meta
            .last_log_id
            .map(|id| (id.index, id.leader_id.term))
            .unwrap_or((0, 0));
        self.snaps.save(index, term, &raw)
    }
}

fn decode_stored(raw: &[u8]) -> Result<StoredSnapshot, MimirError> {
    bincode::serde::decode_from_slice(raw, bincode::config::standard())
        .map(|(snap, _)| snap)
        .map_err(|e| MimirError::Decode(e.to_string()))
}

impl RaftSnapshotBuilder<TypeConfig> for StateMachineStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // Reading the encoded file under the C1 lock is the point-in-time
        // capture; later applies cannot bleed into these bytes.
        let data = self.kv.load_bytes().map_err(sm_read_err)?;
        let (last_log_id, last_membership) = {
            let applied = self.applied.lock().unwrap();
            (applied.last_log_id, applied.last_membership.clone())
        };
        let meta = SnapshotMeta {
            last_log_id,
            last_membership,
            snapshot_id: uuid::Uuid::new_v4().to_string(),
        };
        self.store_snapshot(&meta, &data).map_err(sm_write_err)?;
        tracing::info!(snapshot_id = %meta.snapshot_id, "state-machine snapshot captured");
        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }
}

impl RaftStateMachine<TypeConfig> for StateMachineStore {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Member>), StorageError<NodeId>>
    {
        let applied = self.applied.lock().unwrap();
        Ok((applied.last_log_id, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut outcomes = Vec::new();
        for entry in entries {
            tracing::debug!(index = entry.log_id.index, "applying committed entry");
            let outcome = match &entry.payload {
                EntryPayload::Blank => CommandOutcome::default(),
                EntryPayload::Normal(cmd) => match self.apply_command(cmd) {
                    Ok(()) => CommandOutcome::default(),
                    Err(e) => {
                        // Surfaced to the leader's submit path; the entry
                        // itself stays consumed.
                        tracing::error!(error = %e, key = %cmd.key, "command application failed");
                        CommandOutcome { error: Some(e.to_string()) }
                    }
                },
                EntryPayload::Membership(membership) => {
                    let mut applied = self.applied.lock().unwrap();
                    applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    CommandOutcome::default()
                }
            };
            self.applied.lock().unwrap().last_log_id = Some(entry.log_id);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Member>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();
        // save_bytes validates the payload decodes before replacing the file.
        self.kv.save_bytes(&data).map_err(sm_write_err)?;
        self.store_snapshot(meta, &data).map_err(sm_write_err)?;
        let mut applied = self.applied.lock().unwrap();
        applied.last_log_id = meta.last_log_id;
        applied.last_membership = meta.last_membership.clone();
        tracing::info!(snapshot_id = %meta.snapshot_id, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match self.snaps.latest().map_err(sm_read_err)? {
            Some(raw) => {
                let stored = decode_stored(&raw).map_err(sm_read_err)?;
                Ok(Some(Snapshot {
                    meta: stored.meta,
                    snapshot: Box::new(Cursor::new(stored.data)),
                }))
            }
            None => Ok(None),
        }
    }
}

fn sm_read_err(e: MimirError) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::read_state_machine(&e) }
}

fn sm_write_err(e: MimirError) -> StorageError<NodeId> {
    StorageError::IO { source: StorageIOError::write_state_machine(&e) }
}

#[cfg(test)]
mod tests {
    use openraft::CommittedLeaderId;

    use super::*;
    use mimir_storage::decode;

    fn open_sm(dir: &Path) -> StateMachineStore {
        StateMachineStore::open(&dir.join("data.json"), &dir.join("snaps")).unwrap()
    }

    fn normal(index: u64, cmd: Command) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    #[tokio::test]
    async fn apply_set_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());

        let outcomes = sm
            .apply(vec![
                normal(1, Command::set("foo", b"bar".to_vec())),
                normal(2, Command::set("baz", vec![0x00, 0xff])),
            ])
            .await
            .unwrap();
        assert!(outcomes.iter().all(|o| o.error.is_none()));
        assert_eq!(sm.local_get("foo").unwrap(), b"bar");
        assert_eq!(sm.local_get("baz").unwrap(), vec![0x00, 0xff]);

        sm.apply(vec![normal(3, Command::delete("foo"))]).await.unwrap();
        assert!(sm.local_get("foo").unwrap().is_empty());
        assert_eq!(sm.local_get("baz").unwrap(), vec![0x00, 0xff]);

        let (last, _) = sm.applied_state().await.unwrap();
        assert_eq!(last.unwrap().index, 3);
    }

    #[tokio::test]
    async fn unknown_action_is_a_tolerated_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());
        sm.apply(vec![normal(1, Command::set("k", b"v".to_vec()))]).await.unwrap();

        let cmd = Command { action: "compact".into(), key: "k".into(), value: Vec::new() };
        let outcomes = sm.apply(vec![normal(2, cmd)]).await.unwrap();

        assert!(outcomes[0].error.is_none());
        assert_eq!(sm.local_get("k").unwrap(), b"v");
        let (last, _) = sm.applied_state().await.unwrap();
        assert_eq!(last.unwrap().index, 2);
    }

    #[tokio::test]
    async fn replay_is_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut a = open_sm(dir_a.path());
        let mut b = open_sm(dir_b.path());

        let script = vec![
            normal(1, Command::set("x", b"1".to_vec())),
            normal(2, Command::set("y", b"2".to_vec())),
            normal(3, Command::delete("x")),
            normal(4, Command::set("y", b"3".to_vec())),
        ];
        a.apply(script.clone()).await.unwrap();
        b.apply(script).await.unwrap();

        let bytes_a = std::fs::read(dir_a.path().join("data.json")).unwrap();
        let bytes_b = std::fs::read(dir_b.path().join("data.json")).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[tokio::test]
    async fn snapshot_build_install_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open_sm(dir.path());
        sm.apply(vec![
            normal(1, Command::set("a", b"1".to_vec())),
            normal(2, Command::set("b", b"2".to_vec())),
        ])
        .await
        .unwrap();

        let snapshot = sm.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.unwrap().index, 2);

        // The payload is exactly the on-disk encoding.
        let map = decode(snapshot.snapshot.get_ref()).unwrap();
        assert_eq!(map.get("a").unwrap(), b"1");

        // Install into a fresh machine; contents and applied state follow.
        let other_dir = tempfile::tempdir().unwrap();
        let mut other = open_sm(other_dir.path());
        other.install_snapshot(&snapshot.meta, snapshot.snapshot).await.unwrap();
        assert_eq!(other.local_get("a").unwrap(), b"1");
        assert_eq!(other.local_get("b").unwrap(), b"2");
        let (last, _) = other.applied_state().await.unwrap();
        assert_eq!(last.unwrap().index, 2);

        // A reopened machine seeds its applied state from the ring.
        drop(other);
        let mut reopened = open_sm(other_dir.path());
        let (last, _) = reopened.applied_state().await.unwrap();
        assert_eq!(last.unwrap().index, 2);
        let current = reopened.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.last_log_id.unwrap().index, 2);
    }
}
