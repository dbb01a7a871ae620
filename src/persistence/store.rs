//! Transactional nested-bucket key/value store on SQLite
//!
//! Buckets form a tree rooted at [`BucketId::ROOT`]; each bucket holds
//! byte-string keys and values and may contain child buckets. All access goes
//! through a [`Transaction`], which holds the connection for its whole
//! lifetime and rolls back on drop unless committed.

use super::PersistenceError;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Duration;

const SCHEMA: &str = include_str!("schema.sql");

/// How long to wait for a lock held by another connection before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to a bucket inside the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketId(i64);

impl BucketId {
    pub const ROOT: BucketId = BucketId(0);
}

/// Read-only connections kept open per file-backed store
const READER_POOL_SIZE: usize = 4;

/// SQLite-backed bucket store
///
/// Writers are serialized through a single connection. File-backed stores
/// keep a small pool of read-only connections in WAL mode, so concurrent
/// readers each see a consistent snapshot without waiting for the writer or
/// for one another.
pub struct Store {
    writer: Option<Mutex<Connection>>,
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    path: Option<PathBuf>,
}

impl Store {
    /// Open or create a store at the specified path
    ///
    /// Failure here is not recoverable: the caller cannot track anything
    /// without a store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let connect = || -> rusqlite::Result<(Connection, Vec<Mutex<Connection>>)> {
            let writer = Connection::open(path)?;
            writer.busy_timeout(BUSY_TIMEOUT)?;
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            writer.execute_batch(SCHEMA)?;

            let readers = open_readers(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            Ok((writer, readers))
        };

        let (writer, readers) = connect().map_err(|source| PersistenceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        log::debug!("Opened store at {:?}", path);
        Ok(Store {
            writer: Some(Mutex::new(writer)),
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing store for queries only
    ///
    /// Nothing is created: a missing file or directory is an `Open` error.
    /// Write transactions fail with `ReadOnly`, and readers never take the
    /// writer lock of another process.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        // READ_WRITE without CREATE lets the connection maintain the WAL
        // index; query_only keeps it from changing the data.
        let readers = open_readers(path, OpenFlags::SQLITE_OPEN_READ_WRITE).map_err(|source| {
            PersistenceError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        log::debug!("Opened store at {:?} read-only", path);
        Ok(Store {
            writer: None,
            readers,
            next_reader: AtomicUsize::new(0),
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory store (useful for testing)
    ///
    /// Readers and the writer share one connection, so a thread must not
    /// begin a read while it holds a write transaction.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory().map_err(|source| PersistenceError::Open {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute_batch(SCHEMA)?;

        Ok(Store {
            writer: Some(Mutex::new(conn)),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    /// Begin a read-write transaction, waiting for any other writer
    pub fn begin_write(&self) -> Result<Transaction<'_>, PersistenceError> {
        let conn = self
            .writer
            .as_ref()
            .ok_or(PersistenceError::ReadOnly)?
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Transaction::begin(conn, true)
    }

    /// Begin a read-only transaction over a consistent snapshot
    ///
    /// Takes the first idle pooled reader; when all are busy, waits on one
    /// picked round-robin.
    pub fn begin_read(&self) -> Result<Transaction<'_>, PersistenceError> {
        if self.readers.is_empty() {
            let conn = self
                .writer
                .as_ref()
                .ok_or(PersistenceError::ReadOnly)?
                .lock()
                .map_err(|_| PersistenceError::LockPoisoned)?;
            return Transaction::begin(conn, false);
        }

        for reader in &self.readers {
            match reader.try_lock() {
                Ok(conn) => return Transaction::begin(conn, false),
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(_)) => return Err(PersistenceError::LockPoisoned),
            }
        }

        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[slot]
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Transaction::begin(conn, false)
    }

    /// Run `f` in a write transaction, committing only if it succeeds
    pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<PersistenceError>,
    {
        let tx = self.begin_write()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` in a read transaction
    pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<PersistenceError>,
    {
        let tx = self.begin_read()?;
        let value = f(&tx)?;
        tx.rollback()?;
        Ok(value)
    }
}

fn open_readers(path: &Path, mode: OpenFlags) -> rusqlite::Result<Vec<Mutex<Connection>>> {
    (0..READER_POOL_SIZE)
        .map(|_| {
            let conn = Connection::open_with_flags(path, mode | OpenFlags::SQLITE_OPEN_NO_MUTEX)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            if mode.contains(OpenFlags::SQLITE_OPEN_READ_WRITE) {
                conn.pragma_update(None, "query_only", true)?;
            }
            Ok(Mutex::new(conn))
        })
        .collect()
}

/// A scoped transaction
///
/// Owns the connection lock until it is committed, rolled back or dropped.
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction<'a> {
    conn: MutexGuard<'a, Connection>,
    writable: bool,
    finished: bool,
}

impl<'a> Transaction<'a> {
    fn begin(conn: MutexGuard<'a, Connection>, writable: bool) -> Result<Self, PersistenceError> {
        // IMMEDIATE takes the write lock up front so a writer never fails
        // halfway through on a lock upgrade.
        conn.execute_batch(if writable { "BEGIN IMMEDIATE" } else { "BEGIN DEFERRED" })?;
        Ok(Transaction {
            conn,
            writable,
            finished: false,
        })
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn commit(mut self) -> Result<(), PersistenceError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), PersistenceError> {
        self.finished = true;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), PersistenceError> {
        if self.writable {
            Ok(())
        } else {
            Err(PersistenceError::ReadOnly)
        }
    }

    // =====================
    // Buckets
    // =====================

    /// Look up a child bucket by name
    pub fn bucket(&self, parent: BucketId, name: &str) -> Result<Option<BucketId>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM buckets WHERE parent = ? AND name = ?")?;
        let id = stmt
            .query_row(params![parent.0, name], |row| row.get(0))
            .optional()?;
        Ok(id.map(BucketId))
    }

    /// Walk a bucket path from the root
    pub fn bucket_path(&self, path: &[&str]) -> Result<Option<BucketId>, PersistenceError> {
        let mut current = BucketId::ROOT;
        for name in path {
            match self.bucket(current, name)? {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn create_bucket_if_absent(
        &self,
        parent: BucketId,
        name: &str,
    ) -> Result<BucketId, PersistenceError> {
        self.ensure_writable()?;
        if let Some(id) = self.bucket(parent, name)? {
            return Ok(id);
        }

        self.conn
            .prepare_cached("INSERT INTO buckets (parent, name) VALUES (?, ?)")?
            .execute(params![parent.0, name])?;
        Ok(BucketId(self.conn.last_insert_rowid()))
    }

    /// Names of the direct child buckets, in ascending order
    pub fn child_buckets(&self, parent: BucketId) -> Result<Vec<String>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT name FROM buckets WHERE parent = ? ORDER BY name ASC")?;
        let names = stmt
            .query_map(params![parent.0], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Current value of the bucket's sequence, without advancing it
    pub fn sequence(&self, bucket: BucketId) -> Result<u64, PersistenceError> {
        let seq: Option<i64> = self
            .conn
            .prepare_cached("SELECT sequence FROM buckets WHERE id = ?")?
            .query_row(params![bucket.0], |row| row.get(0))
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Next value of the bucket's monotonically increasing sequence
    pub fn next_sequence(&self, bucket: BucketId) -> Result<u64, PersistenceError> {
        self.ensure_writable()?;
        self.conn
            .prepare_cached("UPDATE buckets SET sequence = sequence + 1 WHERE id = ?")?
            .execute(params![bucket.0])?;
        let seq: i64 = self
            .conn
            .prepare_cached("SELECT sequence FROM buckets WHERE id = ?")?
            .query_row(params![bucket.0], |row| row.get(0))?;
        Ok(seq as u64)
    }

    // =====================
    // Entries
    // =====================

    pub fn get(&self, bucket: BucketId, key: &[u8]) -> Result<Option<Vec<u8>>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM entries WHERE bucket = ? AND key = ?")?;
        let value = stmt
            .query_row(params![bucket.0, key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, bucket: BucketId, key: &[u8], value: &[u8]) -> Result<(), PersistenceError> {
        self.ensure_writable()?;
        self.conn
            .prepare_cached(
                "INSERT INTO entries (bucket, key, value) VALUES (?, ?, ?)
                 ON CONFLICT (bucket, key) DO UPDATE SET value = excluded.value",
            )?
            .execute(params![bucket.0, key, value])?;
        Ok(())
    }

    /// Remove a key, returning whether it existed
    pub fn delete(&self, bucket: BucketId, key: &[u8]) -> Result<bool, PersistenceError> {
        self.ensure_writable()?;
        let removed = self
            .conn
            .prepare_cached("DELETE FROM entries WHERE bucket = ? AND key = ?")?
            .execute(params![bucket.0, key])?;
        Ok(removed > 0)
    }

    /// Visit every entry of a bucket in ascending key order
    ///
    /// The scan stops as soon as `f` returns `ControlFlow::Break` or an error.
    pub fn ascending_iterate<F>(&self, bucket: BucketId, mut f: F) -> Result<(), PersistenceError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>, PersistenceError>,
    {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM entries WHERE bucket = ? ORDER BY key ASC")?;
        let mut rows = stmt.query(params![bucket.0])?;

        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            let value: Vec<u8> = row.get(1)?;
            if f(&key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            log::warn!("Failed to roll back abandoned transaction: {}", e);
        }
    }
}
