//! KTM persistence: ordered history collections in a single SQLite file.
//!
//! Every collection (`pods`, `nodes`, `snapshots/<cluster>`) is a bucket in one
//! `WITHOUT ROWID` table whose primary key is `(bucket, key)`, so SQLite's
//! B-tree gives ordered forward and reverse cursors with byte-range seeks.

#![forbid(unsafe_code)]

pub mod keys;

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ktm_core::{ClusterSnapshot, Record, Resource};
use metrics::{counter, histogram};
use rusqlite::{types::Value, Connection, OpenFlags};
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid entity name {0:?}: must be non-empty and must not contain '#'")]
    InvalidName(String),
    #[error("malformed key {0:?}")]
    MalformedKey(String),
    #[error("record {0:?} has neither an event time nor a creation time")]
    MissingTimestamp(String),
    #[error("timestamp {0} does not fit the fixed-width key format")]
    UnencodableTimestamp(DateTime<Utc>),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("database path {0:?} is not a plain file path")]
    InvalidPath(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

const SNAPSHOTS_PREFIX: &str = "snapshots/";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_READERS: usize = 8;

const SCAN_FWD: &str = "SELECT key, value FROM history WHERE bucket = ?1 AND key >= ?2 ORDER BY key ASC";
const SCAN_FWD_BOUNDED: &str =
    "SELECT key, value FROM history WHERE bucket = ?1 AND key >= ?2 AND key < ?3 ORDER BY key ASC";
const SCAN_REV: &str = "SELECT key, value FROM history WHERE bucket = ?1 AND key >= ?2 ORDER BY key DESC";
const SCAN_REV_BOUNDED: &str =
    "SELECT key, value FROM history WHERE bucket = ?1 AND key >= ?2 AND key < ?3 ORDER BY key DESC";

/// Bucket holding one cluster's snapshot timeline.
pub fn snapshot_bucket(cluster_id: &str) -> String {
    format!("{}{}", SNAPSHOTS_PREFIX, cluster_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Half-open key range `[lower, upper)`; no upper bound runs to the bucket's end.
struct KeyRange {
    lower: Vec<u8>,
    upper: Option<Vec<u8>>,
}

impl KeyRange {
    fn all() -> Self {
        Self { lower: Vec::new(), upper: None }
    }

    fn prefix(prefix: Vec<u8>) -> Self {
        let upper = keys::prefix_upper_bound(&prefix);
        Self { lower: prefix, upper }
    }
}

/// Persistent, ordered history of pods, nodes and cluster snapshots.
///
/// One writer connection serializes writes; reads check out pooled read-only
/// connections and see a consistent view for the duration of one scan.
pub struct HistoryStore {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl HistoryStore {
    /// Open at `KTM_DB_PATH`, else `~/.ktm/history.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var_os("KTM_DB_PATH").map(PathBuf::from).unwrap_or_else(default_db_path);
        Self::open(path)
    }

    /// Open or create the database at `path`.
    ///
    /// Readers reopen the same file, so `path` must name a file on disk;
    /// `:memory:` and `file:` URIs are rejected.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let started = Instant::now();
        let path = path.as_ref().to_path_buf();
        if !is_plain_file_path(&path) {
            return Err(StoreError::InvalidPath(path));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&path)?;
        db.busy_timeout(BUSY_TIMEOUT)?;
        match db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
            Ok(mode) => warn!(mode = %mode, "WAL unavailable; readers may wait on writers"),
            Err(e) => warn!(error = %e, "failed to enable WAL"),
        }
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS history (
                bucket TEXT NOT NULL,
                key    BLOB NOT NULL,
                value  BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            ) WITHOUT ROWID",
            [],
        )?;
        let me = Self { path, writer: Mutex::new(db), readers: Mutex::new(Vec::new()) };
        histogram!("history_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path = %me.path.display(), "history store opened");
        Ok(me)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close every connection, surfacing errors that a plain drop would swallow.
    pub fn close(self) -> Result<()> {
        let Self { path, writer, readers } = self;
        for conn in readers.into_inner().unwrap_or_else(PoisonError::into_inner) {
            conn.close().map_err(|(_, e)| e)?;
        }
        writer.into_inner().unwrap_or_else(PoisonError::into_inner).close().map_err(|(_, e)| e)?;
        info!(path = %path.display(), "history store closed");
        Ok(())
    }

    // ---- entity history ----

    /// Append a history record under `<name>#<event time or creation time>`.
    ///
    /// A record landing on an existing key replaces it: both describe the same
    /// nanosecond, so they are the same logical event.
    pub fn put<R: Resource>(&self, record: &Record<R>) -> Result<()> {
        let name = record.name().unwrap_or_default();
        let ts = record.resolve_timestamp().ok_or_else(|| StoreError::MissingTimestamp(name.to_string()))?;
        let key = keys::encode_entity_key(name, ts)?;
        let value = serde_json::to_vec(record)?;
        self.write(R::COLLECTION, &key, &value)?;
        debug!(bucket = R::COLLECTION, key = %String::from_utf8_lossy(&key), kind = ?record.kind(), "history record stored");
        Ok(())
    }

    /// All records of `name`, oldest first. Unknown names yield an empty list.
    pub fn get_by_name<R: Resource>(&self, name: &str) -> Result<Vec<Record<R>>> {
        self.history(name, None)
    }

    /// Records of `name` strictly newer than `cutoff`, oldest first.
    pub fn get_by_name_since<R: Resource>(&self, name: &str, cutoff: DateTime<Utc>) -> Result<Vec<Record<R>>> {
        self.history(name, Some(cutoff))
    }

    fn history<R: Resource>(&self, name: &str, cutoff: Option<DateTime<Utc>>) -> Result<Vec<Record<R>>> {
        let range = KeyRange::prefix(keys::entity_prefix(name)?);
        let mut out: Vec<Record<R>> = Vec::new();
        self.scan(R::COLLECTION, &range, Direction::Forward, |key, value| {
            let (_, ts) = keys::split_entity_key(key)?;
            if cutoff.map_or(true, |c| ts > c) {
                out.push(serde_json::from_slice(value)?);
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(out)
    }

    /// Newest record of `name` if it is newer than `cutoff`; reads a single key.
    pub fn latest_by_name<R: Resource>(&self, name: &str, cutoff: DateTime<Utc>) -> Result<Option<Record<R>>> {
        let range = KeyRange::prefix(keys::entity_prefix(name)?);
        let mut found: Option<Record<R>> = None;
        self.scan(R::COLLECTION, &range, Direction::Reverse, |key, value| {
            let (_, ts) = keys::split_entity_key(key)?;
            if ts > cutoff {
                found = Some(serde_json::from_slice(value)?);
            }
            Ok(ControlFlow::Break(()))
        })?;
        Ok(found)
    }

    /// Newest record per distinct name, for names with a record newer than `cutoff`.
    ///
    /// Scans the whole bucket backwards. Within one name keys descend in time,
    /// so the first key met for a name settles it; later keys of that name are
    /// skipped. Names interleave in key order, so the scan always runs to the
    /// start of the bucket. Result is newest first.
    pub fn get_all_since<R: Resource>(&self, cutoff: DateTime<Utc>) -> Result<Vec<Record<R>>> {
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut hits: Vec<(DateTime<Utc>, Record<R>)> = Vec::new();
        self.scan(R::COLLECTION, &KeyRange::all(), Direction::Reverse, |key, value| {
            let (name, ts) = keys::split_entity_key(key)?;
            if seen.contains(name) {
                return Ok(ControlFlow::Continue(()));
            }
            seen.insert(name.to_string());
            if ts > cutoff {
                hits.push((ts, serde_json::from_slice(value)?));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(newest_first(hits))
    }

    /// Every record newer than `cutoff` across all names, newest first.
    pub fn events_since<R: Resource>(&self, cutoff: DateTime<Utc>) -> Result<Vec<Record<R>>> {
        let mut hits: Vec<(DateTime<Utc>, Record<R>)> = Vec::new();
        self.scan(R::COLLECTION, &KeyRange::all(), Direction::Reverse, |key, value| {
            let (_, ts) = keys::split_entity_key(key)?;
            if ts > cutoff {
                hits.push((ts, serde_json::from_slice(value)?));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(newest_first(hits))
    }

    // ---- cluster snapshots ----

    pub fn put_snapshot(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        if snapshot.cluster_id.is_empty() {
            return Err(StoreError::InvalidName(String::new()));
        }
        let bucket = snapshot_bucket(&snapshot.cluster_id);
        let key = keys::encode_snapshot_key(snapshot.taken_at)?;
        let value = serde_json::to_vec(snapshot)?;
        self.write(&bucket, &key, &value)?;
        info!(
            cluster = %snapshot.cluster_id,
            nodes = snapshot.nodes.len(),
            pods = snapshot.pods.len(),
            key = %String::from_utf8_lossy(&key),
            "cluster snapshot stored"
        );
        Ok(())
    }

    /// Newest snapshot of `cluster_id` taken strictly after `cutoff`.
    ///
    /// This is the snapshot closest to now inside the lookback window, not the
    /// one preceding the window.
    pub fn latest_snapshot_since(&self, cluster_id: &str, cutoff: DateTime<Utc>) -> Result<Option<ClusterSnapshot>> {
        let bucket = snapshot_bucket(cluster_id);
        let mut found: Option<ClusterSnapshot> = None;
        self.scan(&bucket, &KeyRange::all(), Direction::Reverse, |key, value| {
            let ts = keys::decode_snapshot_key(key)?;
            if ts > cutoff {
                found = Some(serde_json::from_slice(value)?);
            }
            // keys descend: the first one decides
            Ok(ControlFlow::Break(()))
        })?;
        Ok(found)
    }

    /// Cluster ids with at least one stored snapshot, ascending.
    pub fn clusters(&self) -> Result<Vec<String>> {
        let upper = keys::prefix_upper_bound(SNAPSHOTS_PREFIX.as_bytes()).unwrap_or_default();
        let upper = String::from_utf8_lossy(&upper).into_owned();
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT bucket FROM history WHERE bucket >= ?1 AND bucket < ?2 ORDER BY bucket ASC",
            )?;
            let mut rows = stmt.query((SNAPSHOTS_PREFIX, upper.as_str()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let bucket: String = row.get(0)?;
                if let Some(id) = bucket.strip_prefix(SNAPSHOTS_PREFIX) {
                    out.push(id.to_string());
                }
            }
            Ok(out)
        })
    }

    // ---- plumbing ----

    fn write(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let started = Instant::now();
        let mut db = self.lock_writer();
        let tx = db.transaction()?;
        tx.execute("INSERT OR REPLACE INTO history(bucket, key, value) VALUES (?1, ?2, ?3)", (bucket, key, value))?;
        tx.commit()?;
        histogram!("history_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("history_put_total", 1u64);
        Ok(())
    }

    /// Ordered cursor over one bucket. `visit` sees raw key/value bytes and may
    /// stop the scan early; any error aborts the whole scan.
    fn scan<F>(&self, bucket: &str, range: &KeyRange, dir: Direction, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<ControlFlow<()>>,
    {
        let started = Instant::now();
        let sql = match (dir, range.upper.is_some()) {
            (Direction::Forward, false) => SCAN_FWD,
            (Direction::Forward, true) => SCAN_FWD_BOUNDED,
            (Direction::Reverse, false) => SCAN_REV,
            (Direction::Reverse, true) => SCAN_REV_BOUNDED,
        };
        let mut params = vec![Value::Text(bucket.to_string()), Value::Blob(range.lower.clone())];
        if let Some(upper) = &range.upper {
            params.push(Value::Blob(upper.clone()));
        }
        let mut visited = 0usize;
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            while let Some(row) = rows.next()? {
                let key: Vec<u8> = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                visited += 1;
                if visit(&key, &value)?.is_break() {
                    break;
                }
            }
            Ok(())
        })?;
        histogram!("history_scan_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(bucket, ?dir, visited, "scan finished");
        Ok(())
    }

    /// Run `f` on a pooled read-only connection; the connection goes back to
    /// the pool whatever `f` returns.
    fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let pooled = self.lock_readers().pop();
        let conn = match pooled {
            Some(c) => c,
            None => self.open_reader()?,
        };
        let out = f(&conn);
        let mut pool = self.lock_readers();
        if pool.len() < MAX_IDLE_READERS {
            pool.push(conn);
        }
        out
    }

    fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_readers(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn newest_first<R>(mut hits: Vec<(DateTime<Utc>, R)>) -> Vec<R> {
    hits.sort_by(|a, b| b.0.cmp(&a.0));
    hits.into_iter().map(|(_, r)| r).collect()
}

fn is_plain_file_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    !(s.is_empty() || s == ":memory:" || s.starts_with("file:"))
}

fn default_db_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".ktm");
        p.push("history.db");
        return p;
    }
    // Fallback to current directory
    PathBuf::from("ktm_history.db")
}
