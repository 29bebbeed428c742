use std::fs;
use std::io::Write;
use std::path::PathBuf;

use mimir_types::MimirError;

/// Number of snapshots retained on disk before the oldest are deleted.
pub const SNAPSHOT_RETENTION: usize = 5;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".bin";

/// Bounded on-disk ring of state-machine snapshots.
///
/// Files are named `snapshot-{index}-{term}.bin`; "newest" means the greatest
/// `(index, term)` pair parsed back out of the name. Writing past the
/// retention limit prunes from the oldest end.
#[derive(Debug, Clone)]
pub struct SnapshotDir {
    dir: PathBuf,
}

impl SnapshotDir {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, MimirError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err)?;
        Ok(SnapshotDir { dir })
    }

    /// Persist one snapshot payload and prune past the retention limit.
    pub fn save(&self, index: u64, term: u64, payload: &[u8]) -> Result<(), MimirError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        tmp.write_all(payload).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(self.dir.join(file_name(index, term)))
            .map_err(|e| MimirError::Io(e.to_string()))?;
        self.prune()
    }

    /// The newest snapshot payload, if any exist.
    pub fn latest(&self) -> Result<Option<Vec<u8>>, MimirError> {
        match self.list()?.pop() {
            Some((_, _, path)) => fs::read(path).map(Some).map_err(io_err),
            None => Ok(None),
        }
    }

    // All snapshots, oldest first.
    fn list(&self) -> Result<Vec<(u64, u64, PathBuf)>, MimirError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name();
            let Some((index, term)) = name.to_str().and_then(parse_name) else {
                continue;
            };
            found.push((index, term, entry.path()));
        }
        found.sort_unstable_by_key(|(index, term, _)| (*index, *term));
        Ok(found)
    }

    fn prune(&self) -> Result<(), MimirError> {
        let snapshots = self.list()?;
        let excess = snapshots.len().saturating_sub(SNAPSHOT_RETENTION);
        for (index, term, path) in snapshots.into_iter().take(excess) {
            tracing::debug!(index, term, "pruning old snapshot");
            fs::remove_file(path).map_err(io_err)?;
        }
        Ok(())
    }
}

fn file_name(index: u64, term: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{index}-{term}{SNAPSHOT_SUFFIX}")
}

fn parse_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_prefix(SNAPSHOT_PREFIX)?.strip_suffix(SNAPSHOT_SUFFIX)?;
    let (index, term) = stem.split_once('-')?;
    Some((index.parse().ok()?, term.parse().ok()?))
}

fn io_err(e: std::io::Error) -> MimirError {
    MimirError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_of_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotDir::open(dir.path()).unwrap();
        assert!(snaps.latest().unwrap().is_none());
    }

    #[test]
    fn latest_picks_greatest_index() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotDir::open(dir.path()).unwrap();
        snaps.save(3, 1, b"old").unwrap();
        snaps.save(10, 2, b"new").unwrap();
        snaps.save(7, 2, b"mid").unwrap();
        assert_eq!(snaps.latest().unwrap().unwrap(), b"new");
    }

    #[test]
    fn retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotDir::open(dir.path()).unwrap();
        for i in 1..=(SNAPSHOT_RETENTION as u64 + 3) {
            snaps.save(i, 1, format!("s{i}").as_bytes()).unwrap();
        }
        let remaining = snaps.list().unwrap();
        assert_eq!(remaining.len(), SNAPSHOT_RETENTION);
        assert_eq!(remaining.first().unwrap().0, 4);
        assert_eq!(snaps.latest().unwrap().unwrap(), b"s8");
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let snaps = SnapshotDir::open(dir.path()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        snaps.save(1, 1, b"only").unwrap();
        assert_eq!(snaps.latest().unwrap().unwrap(), b"only");
    }
}
