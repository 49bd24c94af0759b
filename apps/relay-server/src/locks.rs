/// Soft per-file locks: an in-memory map mirrored to the `locks` table.
///
/// The map is authoritative at runtime; the table exists so locks survive a
/// relay restart. Connection bindings are runtime-only and never persisted.
use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use relay_store::{Result as StoreResult, SyncStore};
use sync_core::constants::LOCK_EXPIRY_MS;
use sync_core::{ConnectionId, LockKind, LockState};

struct LockEntry {
    state: LockState,
    conn: Option<ConnectionId>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    /// A different holder owns a non-expired lock.
    Denied { existing: LockState },
}

pub struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
    expiry_ms: i64,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(LOCK_EXPIRY_MS)
    }
}

impl LockTable {
    /// `expiry_ms` is injectable so takeover tests need not wait five minutes.
    pub fn new(expiry_ms: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry_ms,
        }
    }

    /// Same holder refreshes; a live foreign lock denies; expired or absent
    /// installs. Expired locks are taken over silently.
    pub fn acquire(
        &self,
        store: &SyncStore,
        file: &str,
        holder: &str,
        kind: LockKind,
        conn: ConnectionId,
        now_ms: i64,
    ) -> StoreResult<Acquire> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(file) {
            if entry.state.locked_by == holder {
                entry.state.lock_kind = kind;
                entry.state.since = now_ms;
                entry.conn = Some(conn);
                store.put_lock(&entry.state)?;
                return Ok(Acquire::Granted);
            }
            if !entry.state.is_expired(now_ms, self.expiry_ms) {
                return Ok(Acquire::Denied {
                    existing: entry.state.clone(),
                });
            }
            debug!(file, previous = %entry.state.locked_by, "expired lock taken over");
        }

        let state = LockState {
            file: file.to_string(),
            locked_by: holder.to_string(),
            lock_kind: kind,
            since: now_ms,
        };
        store.put_lock(&state)?;
        entries.insert(
            file.to_string(),
            LockEntry {
                state,
                conn: Some(conn),
            },
        );
        Ok(Acquire::Granted)
    }

    /// Remove the lock on `file`. With a holder given, only that holder's
    /// lock is removed; returns whether anything changed.
    pub fn release(
        &self,
        store: &SyncStore,
        file: &str,
        holder: Option<&str>,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.lock();
        match entries.get(file) {
            None => Ok(false),
            Some(entry) => {
                if let Some(holder) = holder {
                    if entry.state.locked_by != holder {
                        return Ok(false);
                    }
                }
                entries.remove(file);
                store.delete_lock(file)?;
                Ok(true)
            }
        }
    }

    /// Drop every lock held by `holder`, or bound to `conn` when provided.
    /// Returns the released files.
    pub fn release_for_client(
        &self,
        store: &SyncStore,
        holder: &str,
        conn: Option<ConnectionId>,
    ) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock();
        let files: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.state.locked_by == holder || (conn.is_some() && entry.conn == conn)
            })
            .map(|(file, _)| file.clone())
            .collect();

        for file in &files {
            entries.remove(file);
            store.delete_lock(file)?;
        }
        Ok(files)
    }

    pub fn get(&self, file: &str) -> Option<LockState> {
        self.entries.lock().get(file).map(|e| e.state.clone())
    }

    pub fn snapshot(&self) -> Vec<LockState> {
        let mut locks: Vec<LockState> = self
            .entries
            .lock()
            .values()
            .map(|e| e.state.clone())
            .collect();
        locks.sort_by(|a, b| a.file.cmp(&b.file));
        locks
    }

    /// Remove everything past expiry. Returns the swept files.
    pub fn sweep_expired(&self, store: &SyncStore, now_ms: i64) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.state.is_expired(now_ms, self.expiry_ms))
            .map(|(file, _)| file.clone())
            .collect();

        for file in &expired {
            entries.remove(file);
            store.delete_lock(file)?;
        }
        Ok(expired)
    }

    /// Load persisted locks at startup, dropping any already expired.
    /// No connection bindings are fabricated.
    pub fn restore_from_store(&self, store: &SyncStore, now_ms: i64) -> StoreResult<usize> {
        let mut entries = self.entries.lock();
        let mut restored = 0;
        for lock in store.all_locks()? {
            if lock.is_expired(now_ms, self.expiry_ms) {
                store.delete_lock(&lock.file)?;
                continue;
            }
            entries.insert(
                lock.file.clone(),
                LockEntry {
                    state: lock,
                    conn: None,
                },
            );
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "restored persisted locks");
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SyncStore {
        SyncStore::open_in_memory().unwrap()
    }

    #[test]
    fn acquire_then_refresh_same_holder() {
        let table = LockTable::new(300_000);
        let store = store();
        let conn = ConnectionId::new();

        let first = table
            .acquire(&store, "x.ts", "alice", LockKind::Editing, conn, 1_000)
            .unwrap();
        assert_eq!(first, Acquire::Granted);

        let again = table
            .acquire(&store, "x.ts", "alice", LockKind::AgentWriting, conn, 5_000)
            .unwrap();
        assert_eq!(again, Acquire::Granted);

        let lock = table.get("x.ts").unwrap();
        assert_eq!(lock.since, 5_000);
        assert_eq!(lock.lock_kind, LockKind::AgentWriting);
    }

    #[test]
    fn live_foreign_lock_is_denied_and_untouched() {
        let table = LockTable::new(300_000);
        let store = store();

        table
            .acquire(&store, "x.ts", "alice", LockKind::Editing, ConnectionId::new(), 0)
            .unwrap();

        let denied = table
            .acquire(&store, "x.ts", "bob", LockKind::Editing, ConnectionId::new(), 299_999)
            .unwrap();
        match denied {
            Acquire::Denied { existing } => assert_eq!(existing.locked_by, "alice"),
            Acquire::Granted => panic!("expected denial"),
        }
        assert_eq!(table.get("x.ts").unwrap().locked_by, "alice");
        assert_eq!(table.get("x.ts").unwrap().since, 0);
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let table = LockTable::new(300_000);
        let store = store();

        table
            .acquire(&store, "x.ts", "alice", LockKind::Editing, ConnectionId::new(), 0)
            .unwrap();

        let taken = table
            .acquire(&store, "x.ts", "bob", LockKind::Editing, ConnectionId::new(), 300_001)
            .unwrap();
        assert_eq!(taken, Acquire::Granted);
        assert_eq!(table.get("x.ts").unwrap().locked_by, "bob");
    }

    #[test]
    fn release_respects_holder_scope() {
        let table = LockTable::new(300_000);
        let store = store();

        table
            .acquire(&store, "x.ts", "alice", LockKind::Editing, ConnectionId::new(), 0)
            .unwrap();

        assert!(!table.release(&store, "x.ts", Some("bob")).unwrap());
        assert!(table.get("x.ts").is_some());

        assert!(table.release(&store, "x.ts", Some("alice")).unwrap());
        assert!(table.get("x.ts").is_none());
        assert!(!table.release(&store, "x.ts", None).unwrap());
    }

    #[test]
    fn release_for_client_matches_holder_or_connection() {
        let table = LockTable::new(300_000);
        let store = store();
        let conn_a = ConnectionId::new();

        table
            .acquire(&store, "a.ts", "alice", LockKind::Editing, conn_a, 0)
            .unwrap();
        table
            .acquire(&store, "b.ts", "alice", LockKind::Editing, conn_a, 0)
            .unwrap();
        table
            .acquire(&store, "c.ts", "bob", LockKind::Editing, ConnectionId::new(), 0)
            .unwrap();

        let mut released = table
            .release_for_client(&store, "alice", Some(conn_a))
            .unwrap();
        released.sort();
        assert_eq!(released, vec!["a.ts", "b.ts"]);
        assert!(table.get("c.ts").is_some());
        assert_eq!(store.all_locks().unwrap().len(), 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let table = LockTable::new(300_000);
        let store = store();

        table
            .acquire(&store, "old.ts", "alice", LockKind::Editing, ConnectionId::new(), 0)
            .unwrap();
        table
            .acquire(&store, "new.ts", "bob", LockKind::Editing, ConnectionId::new(), 250_000)
            .unwrap();

        let swept = table.sweep_expired(&store, 300_000).unwrap();
        assert_eq!(swept, vec!["old.ts"]);
        assert!(table.get("old.ts").is_none());
        assert!(table.get("new.ts").is_some());
    }

    #[test]
    fn restore_drops_expired_rows() {
        let store = store();
        store
            .put_lock(&LockState {
                file: "live.ts".into(),
                locked_by: "alice".into(),
                lock_kind: LockKind::Editing,
                since: 200_000,
            })
            .unwrap();
        store
            .put_lock(&LockState {
                file: "stale.ts".into(),
                locked_by: "bob".into(),
                lock_kind: LockKind::Editing,
                since: 0,
            })
            .unwrap();

        let table = LockTable::new(300_000);
        let restored = table.restore_from_store(&store, 310_000).unwrap();
        assert_eq!(restored, 1);
        assert!(table.get("live.ts").is_some());
        assert!(table.get("stale.ts").is_none());
        assert_eq!(store.all_locks().unwrap().len(), 1);
    }
}
