//! On-disk state owned by a single node: the replicated key-value map
//! (`data.json`, guarded by an advisory file lock) and the bounded ring of
//! state-machine snapshots.

pub mod kv;
pub mod snapshot;

pub use kv::{decode, encode, KvStore, DEFAULT_LOCK_DEADLINE};
pub use snapshot::{SnapshotDir, SNAPSHOT_RETENTION};
