//! Linearizable shared substrate for cluster-wide coordination state.
//!
//! Only the peer directory roster, the rolling lock and the secret ledger live here. Every
//! record carries a revision and is only ever replaced through [`SharedStore::compare_and_swap`].
use std::{
    collections::BTreeMap,
    fmt::Debug,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use tokio::runtime::{Handle, RuntimeFlavor};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

/// Number of optimistic retries before an update gives up.
const MAX_CAS_ATTEMPTS: usize = 32;
/// A lock file older than this is considered left behind by a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: usize = 500;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to serialize record {key:?}"))]
    SerializeRecord {
        source: serde_json::Error,
        key: String,
    },

    #[snafu(display("failed to deserialize record {key:?}"))]
    DeserializeRecord {
        source: serde_json::Error,
        key: String,
    },

    #[snafu(display("failed to read record from {}", path.display()))]
    ReadRecord { source: io::Error, path: PathBuf },

    #[snafu(display("failed to write record to {}", path.display()))]
    WriteRecord { source: io::Error, path: PathBuf },

    #[snafu(display("failed to create store directory {}", path.display()))]
    CreateStoreDirectory { source: io::Error, path: PathBuf },

    #[snafu(display("record {key:?} is locked by another writer"))]
    StoreBusy { key: String },

    #[snafu(display("failed to take over stale lock {}", path.display()))]
    BreakStaleLock { source: io::Error, path: PathBuf },

    #[snafu(display("gave up updating record {key:?} after {attempts} conflicting writes"))]
    Contention { key: String, attempts: usize },

    #[snafu(display("illegal record key {key:?}, only [a-z0-9-_] are allowed"))]
    InvalidKey { key: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RawRecord {
    pub revision: u64,
    pub value: serde_json::Value,
}

/// A record decoded into its typed form.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<T> {
    pub revision: u64,
    pub value: T,
}

/// A second record that must still be at `revision` for a guarded swap to go through.
#[derive(Clone, Copy, Debug)]
pub struct Guard<'a> {
    pub key: &'a str,
    pub revision: Option<u64>,
}

pub trait SharedStore: Debug + Send + Sync {
    fn get(&self, key: &str) -> Result<Option<RawRecord>, Error>;

    /// Replace `key` with `value` if its current revision is `expected` (`None` meaning absent).
    ///
    /// Returns the new revision, or `None` if another writer got there first.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<Option<u64>, Error>;

    /// Like [`SharedStore::compare_and_swap`], but also fails if `guard.key` has moved away
    /// from `guard.revision`. Both checks and the write happen atomically.
    fn compare_and_swap_guarded(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
        guard: Guard<'_>,
    ) -> Result<Option<u64>, Error>;
}

pub fn load<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<Versioned<T>>, Error> {
    store
        .get(key)?
        .map(|record| -> Result<Versioned<T>, Error> {
            Ok(Versioned {
                revision: record.revision,
                value: serde_json::from_value(record.value)
                    .context(DeserializeRecordSnafu { key })?,
            })
        })
        .transpose()
}

/// Apply `f` to the record at `key` and write it back atomically.
///
/// `f` runs against a fresh copy on every attempt and must not have side effects. If it
/// returns an error, nothing is written and the error is handed back in the inner result.
/// Unchanged records are not rewritten.
pub fn update<T, R, E, F>(
    store: &dyn SharedStore,
    key: &str,
    mut f: F,
) -> Result<Result<R, E>, Error>
where
    T: DeserializeOwned + Serialize + Default + PartialEq + Clone,
    F: FnMut(&mut T) -> Result<R, E>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let (expected, original) = match load::<T>(store, key)? {
            Some(record) => (Some(record.revision), record.value),
            None => (None, T::default()),
        };

        let mut value = original.clone();
        let outcome = match f(&mut value) {
            Ok(outcome) => outcome,
            Err(error) => return Ok(Err(error)),
        };
        if expected.is_some() && value == original {
            return Ok(Ok(outcome));
        }

        let raw = serde_json::to_value(&value).context(SerializeRecordSnafu { key })?;
        if store.compare_and_swap(key, expected, raw)?.is_some() {
            return Ok(Ok(outcome));
        }
        tracing::debug!(key, "conflicting write, retrying update");
    }

    ContentionSnafu {
        key,
        attempts: MAX_CAS_ATTEMPTS,
    }
    .fail()
}

/// Like [`update`], but `f` also sees the record at `guard_key`, and the write only succeeds if
/// that record is unchanged by the time it lands.
pub fn update_guarded<T, G, R, E, F>(
    store: &dyn SharedStore,
    key: &str,
    guard_key: &str,
    mut f: F,
) -> Result<Result<R, E>, Error>
where
    T: DeserializeOwned + Serialize + Default + PartialEq + Clone,
    G: DeserializeOwned + Default,
    F: FnMut(&mut T, &G) -> Result<R, E>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let (guard_revision, guard_value) = match load::<G>(store, guard_key)? {
            Some(record) => (Some(record.revision), record.value),
            None => (None, G::default()),
        };
        let (expected, original) = match load::<T>(store, key)? {
            Some(record) => (Some(record.revision), record.value),
            None => (None, T::default()),
        };

        let mut value = original.clone();
        let outcome = match f(&mut value, &guard_value) {
            Ok(outcome) => outcome,
            Err(error) => return Ok(Err(error)),
        };
        if expected.is_some() && value == original {
            return Ok(Ok(outcome));
        }

        let raw = serde_json::to_value(&value).context(SerializeRecordSnafu { key })?;
        let guard = Guard {
            key: guard_key,
            revision: guard_revision,
        };
        if store
            .compare_and_swap_guarded(key, expected, raw, guard)?
            .is_some()
        {
            return Ok(Ok(outcome));
        }
        tracing::debug!(key, guard_key, "conflicting write, retrying guarded update");
    }

    ContentionSnafu {
        key,
        attempts: MAX_CAS_ATTEMPTS,
    }
    .fail()
}

/// Process-local store, used for tests and single-process simulations.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<String, RawRecord>>,
}

impl SharedStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<RawRecord>, Error> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<Option<u64>, Error> {
        let mut records = self.records.lock();
        let current = records.get(key).map(|record| record.revision);
        if current != expected {
            return Ok(None);
        }
        let revision = current.unwrap_or(0) + 1;
        records.insert(key.to_string(), RawRecord { revision, value });
        Ok(Some(revision))
    }

    fn compare_and_swap_guarded(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
        guard: Guard<'_>,
    ) -> Result<Option<u64>, Error> {
        let mut records = self.records.lock();
        if records.get(guard.key).map(|record| record.revision) != guard.revision {
            return Ok(None);
        }
        let current = records.get(key).map(|record| record.revision);
        if current != expected {
            return Ok(None);
        }
        let revision = current.unwrap_or(0) + 1;
        records.insert(key.to_string(), RawRecord { revision, value });
        Ok(Some(revision))
    }
}

/// Store backed by one JSON file per record in a directory shared by all members
/// (a local disk for single-host clusters, or a shared filesystem).
///
/// Writers serialize on an exclusive `<key>.lock` file and replace the record through a rename.
#[derive(Debug)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(CreateStoreDirectorySnafu { path: &dir })?;
        Ok(Self { dir })
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, Error> {
        ensure!(
            !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'),
            InvalidKeySnafu { key }
        );
        Ok(self.dir.join(format!("{key}.json")))
    }

    /// Take the exclusive writer lock of `key`.
    ///
    /// The lock file holds a random owner token, so a stale lock is only ever cleared by the
    /// writer that saw it stale, and a live writer's lock is never removed by someone else.
    fn lock(&self, key: &str) -> Result<LockFile, Error> {
        let path = self.dir.join(format!("{key}.lock"));
        let token = owner_token();
        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(source) = file.write_all(token.as_bytes()).and_then(|()| file.sync_all()) {
                        if let Err(error) = fs::remove_file(&path) {
                            tracing::warn!(lock = %path.display(), %error, "failed to remove store lock");
                        }
                        return Err(Error::WriteRecord { source, path });
                    }
                    return Ok(LockFile { path, token });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&path)? {
                        continue;
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(source) => return Err(Error::WriteRecord { source, path }),
            }
        }
        StoreBusySnafu { key }.fail()
    }

    /// Clear `path` if it is older than [`STALE_LOCK_AGE`]. Returns whether it was cleared.
    ///
    /// The lock is first renamed to a private name. If what was renamed is not the lock that was
    /// judged stale, it is put back untouched.
    fn break_if_stale(&self, path: &Path) -> Result<bool, Error> {
        if !is_stale(path) {
            return Ok(false);
        }
        let observed = match fs::read_to_string(path) {
            Ok(observed) => observed,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => return Err(Error::BreakStaleLock { source, path: path.into() }),
        };

        let moved = PathBuf::from(format!("{}.stale-{}", path.display(), owner_token()));
        match fs::rename(path, &moved) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(source) => return Err(Error::BreakStaleLock { source, path: path.into() }),
        }

        let taken = fs::read_to_string(&moved).context(BreakStaleLockSnafu { path: &moved })?;
        if taken != observed {
            tracing::debug!(lock = %path.display(), "lock changed hands while breaking it, restoring");
            match fs::hard_link(&moved, path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => {
                    return Err(Error::BreakStaleLock {
                        source,
                        path: path.into(),
                    })
                }
            }
            fs::remove_file(&moved).context(BreakStaleLockSnafu { path: &moved })?;
            return Ok(false);
        }

        tracing::warn!(lock = %path.display(), owner = %observed, "removed stale store lock");
        fs::remove_file(&moved).context(BreakStaleLockSnafu { path: &moved })?;
        Ok(true)
    }

    fn swap_locked(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<Option<u64>, Error> {
        let path = self.record_path(key)?;
        let current = self.read(key)?.map(|record| record.revision);
        if current != expected {
            return Ok(None);
        }

        let revision = current.unwrap_or(0) + 1;
        let bytes = serde_json::to_vec_pretty(&RawRecord { revision, value })
            .context(SerializeRecordSnafu { key })?;
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        write_synced(&tmp, &bytes).context(WriteRecordSnafu { path: &tmp })?;
        fs::rename(&tmp, &path).context(WriteRecordSnafu { path: &path })?;
        Ok(Some(revision))
    }

    fn read(&self, key: &str) -> Result<Option<RawRecord>, Error> {
        let path = self.record_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context(DeserializeRecordSnafu { key })?,
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::ReadRecord { source, path }),
        }
    }
}

fn owner_token() -> String {
    let nonce: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("{}-{nonce}", std::process::id())
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Run blocking filesystem work without stalling the other tasks of a multi-threaded runtime.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

struct LockFile {
    path: PathBuf,
    token: String,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                if let Err(error) = fs::remove_file(&self.path) {
                    tracing::warn!(lock = %self.path.display(), %error, "failed to remove store lock");
                }
            }
            Ok(_) => {
                tracing::warn!(lock = %self.path.display(), "store lock was taken over, leaving it");
            }
            Err(error) => {
                tracing::warn!(lock = %self.path.display(), %error, "failed to read store lock");
            }
        }
    }
}

impl SharedStore for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<RawRecord>, Error> {
        blocking(|| self.read(key))
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
    ) -> Result<Option<u64>, Error> {
        blocking(|| {
            self.record_path(key)?;
            let _lock = self.lock(key)?;
            self.swap_locked(key, expected, value)
        })
    }

    fn compare_and_swap_guarded(
        &self,
        key: &str,
        expected: Option<u64>,
        value: serde_json::Value,
        guard: Guard<'_>,
    ) -> Result<Option<u64>, Error> {
        blocking(|| {
            self.record_path(key)?;
            self.record_path(guard.key)?;
            // Locks are always taken in key order.
            let (first, second) = if key < guard.key {
                (key, guard.key)
            } else {
                (guard.key, key)
            };
            let _first = self.lock(first)?;
            let _second = if first == second {
                None
            } else {
                Some(self.lock(second)?)
            };

            if self.read(guard.key)?.map(|record| record.revision) != guard.revision {
                return Ok(None);
            }
            self.swap_locked(key, expected, value)
        })
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
