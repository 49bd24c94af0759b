//! SQLite persistence for the relay: diff history, current file versions,
//! soft locks, and conflict records. Single `sync.db` file in WAL mode.
//!
//! The relay owns the database exclusively; clients never touch it.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use sync_core::constants::MAX_DIFF_HISTORY;
use sync_core::{AuthorKind, ConflictEvent, FileDiff, FileVersion, LockKind, LockState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS diffs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file TEXT NOT NULL,
    patch TEXT NOT NULL,
    author TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'human',
    timestamp INTEGER NOT NULL,
    version TEXT NOT NULL,
    previous_version TEXT NOT NULL,
    compressed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_diffs_file ON diffs(file);
CREATE INDEX IF NOT EXISTS idx_diffs_timestamp ON diffs(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_diffs_file_version ON diffs(file, version);

CREATE TABLE IF NOT EXISTS locks (
    file TEXT PRIMARY KEY,
    locked_by TEXT NOT NULL,
    lock_type TEXT NOT NULL DEFAULT 'editing',
    since INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS file_versions (
    file TEXT PRIMARY KEY,
    hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file TEXT NOT NULL,
    conflict_file TEXT NOT NULL,
    author_a TEXT NOT NULL,
    author_b TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conflicts_file ON conflicts(file);
";

const DIFF_COLUMNS: &str = "id, file, patch, author, type, timestamp, version, previous_version, compressed";

pub struct SyncStore {
    conn: Connection,
}

impl SyncStore {
    /// Open or create the database, applying pragmas and schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    // ── Diffs ───────────────────────────────────────────────────────

    /// Append a diff; returns the store-assigned monotonic id.
    pub fn insert_diff(&self, diff: &FileDiff) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO diffs (file, patch, author, type, timestamp, version, previous_version, compressed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                diff.file,
                diff.patch,
                diff.author,
                diff.author_kind.as_str(),
                diff.timestamp,
                diff.version,
                diff.previous_version,
                diff.compressed as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn diffs_by_file(&self, file: &str, limit: usize) -> Result<Vec<FileDiff>> {
        let sql = format!(
            "SELECT {DIFF_COLUMNS} FROM diffs WHERE file = ?1 ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![file, limit as i64], row_to_diff)?;
        collect_diffs(rows)
    }

    /// Every diff after the newest row whose `version` matches, oldest first.
    /// All diffs for the file when no row matches (or the version is unknown).
    pub fn diffs_since(&self, file: &str, version: &str) -> Result<Vec<FileDiff>> {
        let anchor: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(id) FROM diffs WHERE file = ?1 AND version = ?2",
                params![file, version],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let sql =
            format!("SELECT {DIFF_COLUMNS} FROM diffs WHERE file = ?1 AND id > ?2 ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![file, anchor.unwrap_or(-1)], row_to_diff)?;
        collect_diffs(rows)
    }

    /// Newest first, across all files.
    pub fn recent(&self, limit: usize) -> Result<Vec<FileDiff>> {
        let sql = format!("SELECT {DIFF_COLUMNS} FROM diffs ORDER BY id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], row_to_diff)?;
        collect_diffs(rows)
    }

    pub fn by_id(&self, id: i64) -> Result<Option<FileDiff>> {
        let sql = format!("SELECT {DIFF_COLUMNS} FROM diffs WHERE id = ?1");
        let diff = self
            .conn
            .query_row(&sql, params![id], row_to_diff)
            .optional()?;
        Ok(diff)
    }

    /// Drop rows for `file` outside the newest `keep` by timestamp.
    pub fn prune(&self, file: &str, keep: usize) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM diffs WHERE file = ?1 AND id NOT IN (
                 SELECT id FROM diffs WHERE file = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2
             )",
            params![file, keep as i64],
        )?;
        if removed > 0 {
            debug!(file, removed, "pruned diff history");
        }
        Ok(removed)
    }

    /// Convenience: insert, bump the version row, prune to the retention bound.
    pub fn accept_diff(&self, diff: &FileDiff) -> Result<i64> {
        let id = self.insert_diff(diff)?;
        self.upsert_version(&diff.file, &diff.version, diff.timestamp)?;
        self.prune(&diff.file, MAX_DIFF_HISTORY)?;
        Ok(id)
    }

    // ── File versions ───────────────────────────────────────────────

    pub fn upsert_version(&self, file: &str, hash: &str, timestamp: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO file_versions (file, hash, timestamp) VALUES (?1, ?2, ?3)",
            params![file, hash, timestamp],
        )?;
        Ok(())
    }

    pub fn get_version(&self, file: &str) -> Result<Option<FileVersion>> {
        let version = self
            .conn
            .query_row(
                "SELECT file, hash, timestamp FROM file_versions WHERE file = ?1",
                params![file],
                |row| {
                    Ok(FileVersion {
                        file: row.get(0)?,
                        hash: row.get(1)?,
                        timestamp: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(version)
    }

    pub fn all_versions(&self) -> Result<Vec<FileVersion>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file, hash, timestamp FROM file_versions ORDER BY file")?;
        let rows = stmt.query_map([], |row| {
            Ok(FileVersion {
                file: row.get(0)?,
                hash: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // ── Locks ───────────────────────────────────────────────────────

    pub fn put_lock(&self, lock: &LockState) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO locks (file, locked_by, lock_type, since) VALUES (?1, ?2, ?3, ?4)",
            params![lock.file, lock.locked_by, lock.lock_kind.as_str(), lock.since],
        )?;
        Ok(())
    }

    pub fn delete_lock(&self, file: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM locks WHERE file = ?1", params![file])?;
        Ok(())
    }

    pub fn all_locks(&self) -> Result<Vec<LockState>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file, locked_by, lock_type, since FROM locks")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut locks = Vec::new();
        for row in rows {
            let (file, locked_by, kind, since) = row?;
            let lock_kind = kind
                .parse::<LockKind>()
                .map_err(StoreError::CorruptRow)?;
            locks.push(LockState {
                file,
                locked_by,
                lock_kind,
                since,
            });
        }
        Ok(locks)
    }

    // ── Conflicts ───────────────────────────────────────────────────

    pub fn insert_conflict(&self, event: &ConflictEvent) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO conflicts (file, conflict_file, author_a, author_b, timestamp, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.file,
                event.conflict_file,
                event.author_a,
                event.author_b,
                event.timestamp,
                event.resolved as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn recent_conflicts(&self, limit: usize) -> Result<Vec<ConflictEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file, conflict_file, author_a, author_b, timestamp, resolved
             FROM conflicts ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(ConflictEvent {
                id: Some(row.get(0)?),
                file: row.get(1)?,
                conflict_file: row.get(2)?,
                author_a: row.get(3)?,
                author_b: row.get(4)?,
                timestamp: row.get(5)?,
                resolved: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    // ── Health ──────────────────────────────────────────────────────

    pub fn total_diffs(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM diffs", [], |row| row.get(0))?)
    }

    pub fn total_files(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM file_versions", [], |row| row.get(0))?)
    }

    pub fn db_size_bytes(&self) -> Result<i64> {
        let page_count: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }
}

fn row_to_diff(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileDiff> {
    let kind: String = row.get(4)?;
    Ok(FileDiff {
        id: Some(row.get(0)?),
        file: row.get(1)?,
        patch: row.get(2)?,
        author: row.get(3)?,
        author_kind: kind.parse::<AuthorKind>().unwrap_or(AuthorKind::Human),
        timestamp: row.get(5)?,
        version: row.get(6)?,
        previous_version: row.get(7)?,
        compressed: row.get::<_, i64>(8)? != 0,
    })
}

fn collect_diffs(
    rows: impl Iterator<Item = rusqlite::Result<FileDiff>>,
) -> Result<Vec<FileDiff>> {
    let mut diffs = Vec::new();
    for row in rows {
        diffs.push(row?);
    }
    Ok(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(file: &str, ts: i64, prev: &str, ver: &str) -> FileDiff {
        FileDiff {
            id: None,
            file: file.into(),
            patch: format!("@@ -1 +1 @@\n-{prev}\n+{ver}\n"),
            author: "alice".into(),
            author_kind: AuthorKind::Human,
            timestamp: ts,
            version: ver.into(),
            previous_version: prev.into(),
            compressed: false,
        }
    }

    #[test]
    fn insert_assigns_monotonic_ids() {
        let store = SyncStore::open_in_memory().unwrap();
        let a = store.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        let b = store.insert_diff(&diff("a.txt", 2, "v1", "v2")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn by_id_round_trips() {
        let store = SyncStore::open_in_memory().unwrap();
        let id = store.insert_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        let got = store.by_id(id).unwrap().unwrap();
        assert_eq!(got.file, "a.txt");
        assert_eq!(got.version, "v1");
        assert_eq!(got.id, Some(id));
        assert!(store.by_id(id + 100).unwrap().is_none());
    }

    #[test]
    fn diffs_by_file_is_newest_first() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_diff(&diff("a.txt", i, &format!("v{i}"), &format!("v{}", i + 1)))
                .unwrap();
        }
        store.insert_diff(&diff("b.txt", 99, "x", "y")).unwrap();

        let diffs = store.diffs_by_file("a.txt", 100).unwrap();
        assert_eq!(diffs.len(), 5);
        assert_eq!(diffs[0].version, "v5");
        assert_eq!(diffs[4].version, "v1");
    }

    #[test]
    fn diffs_since_anchors_on_matching_version() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..4 {
            store
                .insert_diff(&diff("a.txt", i, &format!("v{i}"), &format!("v{}", i + 1)))
                .unwrap();
        }

        // Client is at v2: it needs the diffs producing v3 and v4.
        let missing = store.diffs_since("a.txt", "v2").unwrap();
        assert_eq!(
            missing.iter().map(|d| d.version.as_str()).collect::<Vec<_>>(),
            vec!["v3", "v4"]
        );

        // Unknown version: everything, oldest first.
        let all = store.diffs_since("a.txt", "zzzz").unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].version, "v1");

        // Up to date: nothing.
        assert!(store.diffs_since("a.txt", "v4").unwrap().is_empty());
    }

    #[test]
    fn prune_keeps_newest_by_timestamp() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .insert_diff(&diff("a.txt", i, "p", &format!("v{i}")))
                .unwrap();
        }
        let removed = store.prune("a.txt", 3).unwrap();
        assert_eq!(removed, 7);

        let left = store.diffs_by_file("a.txt", 100).unwrap();
        assert_eq!(left.len(), 3);
        assert_eq!(left[0].timestamp, 9);
        assert_eq!(left[2].timestamp, 7);
    }

    #[test]
    fn accept_diff_updates_version_and_bounds_history() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..(MAX_DIFF_HISTORY as i64 + 20) {
            store
                .accept_diff(&diff("a.txt", i, "p", &format!("v{i}")))
                .unwrap();
        }
        let count = store.diffs_by_file("a.txt", 1_000).unwrap().len();
        assert_eq!(count, MAX_DIFF_HISTORY);

        let version = store.get_version("a.txt").unwrap().unwrap();
        assert_eq!(version.hash, format!("v{}", MAX_DIFF_HISTORY as i64 + 19));
    }

    #[test]
    fn upsert_version_replaces_single_row() {
        let store = SyncStore::open_in_memory().unwrap();
        store.upsert_version("a.txt", "h1", 1).unwrap();
        store.upsert_version("a.txt", "h2", 2).unwrap();

        let all = store.all_versions().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hash, "h2");
    }

    #[test]
    fn locks_persist_and_delete() {
        let store = SyncStore::open_in_memory().unwrap();
        store
            .put_lock(&LockState {
                file: "x.ts".into(),
                locked_by: "alice".into(),
                lock_kind: LockKind::AgentWriting,
                since: 5,
            })
            .unwrap();

        let locks = store.all_locks().unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].lock_kind, LockKind::AgentWriting);

        store.delete_lock("x.ts").unwrap();
        assert!(store.all_locks().unwrap().is_empty());
    }

    #[test]
    fn conflicts_are_recorded_newest_first() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..3 {
            store
                .insert_conflict(&ConflictEvent {
                    id: None,
                    file: "a.txt".into(),
                    conflict_file: format!("a.conflict-{i}.txt"),
                    author_a: "alice".into(),
                    author_b: "bob".into(),
                    timestamp: i,
                    resolved: false,
                })
                .unwrap();
        }
        let recent = store.recent_conflicts(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, 2);
        assert!(!recent[0].resolved);
    }

    #[test]
    fn health_counters() {
        let store = SyncStore::open_in_memory().unwrap();
        store.accept_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        store.accept_diff(&diff("b.txt", 2, "v0", "v1")).unwrap();
        assert_eq!(store.total_diffs().unwrap(), 2);
        assert_eq!(store.total_files().unwrap(), 2);
        assert!(store.db_size_bytes().unwrap() > 0);
    }

    #[test]
    fn reopen_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        {
            let store = SyncStore::open(&path).unwrap();
            store.accept_diff(&diff("a.txt", 1, "v0", "v1")).unwrap();
        }
        let store = SyncStore::open(&path).unwrap();
        assert_eq!(store.total_diffs().unwrap(), 1);
    }
}
