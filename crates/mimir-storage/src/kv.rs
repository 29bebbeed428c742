use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use mimir_types::{KvMap, MimirError};

/// Polling interval while contending for the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default bound on lock acquisition. Callers with tighter needs construct
/// the store through [`KvStore::with_lock_deadline`].
pub const DEFAULT_LOCK_DEADLINE: Duration = Duration::from_secs(5);

/// The single data file holding the replicated map.
///
/// Every `load`/`save` takes an exclusive `flock(2)` on the file for the
/// duration of the operation, so applies, snapshot captures, and local reads
/// within one process never interleave on the bytes, and a second process
/// pointed at the same file cannot corrupt it.
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
    lock_deadline: Duration,
}

impl KvStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_lock_deadline(path, DEFAULT_LOCK_DEADLINE)
    }

    pub fn with_lock_deadline(path: impl Into<PathBuf>, lock_deadline: Duration) -> Self {
        KvStore { path: path.into(), lock_deadline }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current map. A missing or empty file reads as the empty map
    /// and is materialized on disk so later opens see the encoded form.
    pub fn load(&self) -> Result<KvMap, MimirError> {
        decode(&self.load_bytes()?)
    }

    /// The raw encoded form of the map, exactly as persisted. This is also
    /// the snapshot payload format.
    pub fn load_bytes(&self) -> Result<Vec<u8>, MimirError> {
        let _guard = self.acquire_lock()?;
        let data = fs::read(&self.path).map_err(io_err)?;
        if data.is_empty() {
            let empty = encode(&KvMap::new())?;
            self.replace_locked(&empty)?;
            return Ok(empty);
        }
        Ok(data)
    }

    /// Atomically replace the file contents with the encoding of `map`.
    pub fn save(&self, map: &KvMap) -> Result<(), MimirError> {
        let bytes = encode(map)?;
        let _guard = self.acquire_lock()?;
        self.replace_locked(&bytes)
    }

    /// Atomically replace the file with pre-encoded contents (the snapshot
    /// restore path). Payloads that do not decode are rejected up front so a
    /// truncated snapshot can never leave the file unreadable.
    pub fn save_bytes(&self, bytes: &[u8]) -> Result<(), MimirError> {
        decode(bytes)?;
        let _guard = self.acquire_lock()?;
        self.replace_locked(bytes)
    }

    /// Read a single key. Absent keys read as the empty value; this layer
    /// does not distinguish absent from empty.
    pub fn get(&self, key: &str) -> Result<Vec<u8>, MimirError> {
        Ok(self.load()?.remove(key).unwrap_or_default())
    }

    fn acquire_lock(&self) -> Result<Flock<File>, MimirError> {
        use std::os::unix::fs::MetadataExt;

        let deadline = Instant::now() + self.lock_deadline;
        let mut file = self.open_data_file()?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(guard) => {
                    // `save` replaces the file by rename, so the inode this
                    // fd was opened on may no longer be the one at the path.
                    // A lock on the stale inode excludes nobody; reopen.
                    let held = guard.metadata().map_err(io_err)?;
                    let current = fs::metadata(&self.path).map_err(io_err)?;
                    if held.ino() == current.ino() && held.dev() == current.dev() {
                        return Ok(guard);
                    }
                    drop(guard);
                    file = self.open_data_file()?;
                }
                Err((unlocked, e)) if e == Errno::EWOULDBLOCK => {
                    if Instant::now() >= deadline {
                        return Err(MimirError::Lock(format!(
                            "could not lock {} within {:?}",
                            self.path.display(),
                            self.lock_deadline
                        )));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                    file = unlocked;
                }
                Err((_, e)) => return Err(MimirError::Lock(e.to_string())),
            }
        }
    }

    fn open_data_file(&self) -> Result<File, MimirError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)
    }

    // Write-to-sibling-then-rename, so a crash mid-save leaves the previous
    // contents intact. Caller holds the lock.
    fn replace_locked(&self, bytes: &[u8]) -> Result<(), MimirError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir.unwrap_or(Path::new("."))).map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| MimirError::Io(e.to_string()))?;
        Ok(())
    }
}

fn io_err(e: std::io::Error) -> MimirError {
    MimirError::Io(e.to_string())
}

/// Encode a map as a JSON object whose keys and values are each base64url
/// (RFC 4648 §5, padded) strings. Arbitrary value bytes survive the trip
/// through JSON, and the `BTreeMap` ordering keeps the output canonical.
pub fn encode(map: &KvMap) -> Result<Vec<u8>, MimirError> {
    let mut wire = BTreeMap::new();
    for (key, value) in map {
        wire.insert(URL_SAFE.encode(key.as_bytes()), URL_SAFE.encode(value));
    }
    serde_json::to_vec(&wire).map_err(|e| MimirError::Encode(e.to_string()))
}

/// Inverse of [`encode`]. `decode(encode(m)) == m` for any map.
pub fn decode(bytes: &[u8]) -> Result<KvMap, MimirError> {
    let wire: BTreeMap<String, String> =
        serde_json::from_slice(bytes).map_err(|e| MimirError::Decode(e.to_string()))?;
    let mut map = KvMap::new();
    for (key, value) in wire {
        let key = URL_SAFE
            .decode(&key)
            .map_err(|e| MimirError::Decode(format!("key {key:?}: {e}")))?;
        let key = String::from_utf8(key)
            .map_err(|e| MimirError::Decode(format!("key is not utf-8: {e}")))?;
        let value = URL_SAFE
            .decode(&value)
            .map_err(|e| MimirError::Decode(e.to_string()))?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> KvStore {
        KvStore::open(dir.join("data.json"))
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut map = KvMap::new();
        map.insert("a".into(), b"1".to_vec());
        map.insert("b".into(), vec![0x00, 0xff]);

        let encoded = encode(&map).unwrap();
        // base64url keys/values inside a plain JSON object
        let wire: BTreeMap<String, String> = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(wire.get("YQ==").map(String::as_str), Some("MQ=="));

        assert_eq!(decode(&encoded).unwrap(), map);
    }

    #[test]
    fn encoding_is_canonical() {
        let mut a = KvMap::new();
        a.insert("z".into(), b"1".to_vec());
        a.insert("a".into(), b"2".to_vec());
        let mut b = KvMap::new();
        b.insert("a".into(), b"2".to_vec());
        b.insert("z".into(), b"1".to_vec());
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            decode(br#"{"!!!":"MQ=="}"#),
            Err(MimirError::Decode(_))
        ));
    }

    #[test]
    fn load_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.load().unwrap().is_empty());
        // The file now holds the encoded empty map, not zero bytes.
        assert_eq!(fs::read(store.path()).unwrap(), b"{}");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let mut map = KvMap::new();
        map.insert("foo".into(), b"bar".to_vec());
        store.save(&map).unwrap();
        assert_eq!(store.load().unwrap(), map);
        assert_eq!(store.get("foo").unwrap(), b"bar");
        assert!(store.get("missing").unwrap().is_empty());
    }

    #[test]
    fn save_bytes_rejects_undecodable_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut map = KvMap::new();
        map.insert("keep".into(), b"me".to_vec());
        store.save(&map).unwrap();

        assert!(store.save_bytes(b"not json").is_err());
        // Previous contents are untouched.
        assert_eq!(store.get("keep").unwrap(), b"me");
    }

    #[test]
    fn lock_contention_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::with_lock_deadline(
            dir.path().join("data.json"),
            Duration::from_millis(50),
        );
        store.save(&KvMap::new()).unwrap();

        let _held = store.acquire_lock().unwrap();
        let contender = KvStore::with_lock_deadline(
            dir.path().join("data.json"),
            Duration::from_millis(50),
        );
        assert!(matches!(contender.load(), Err(MimirError::Lock(_))));
    }
}
