/// The client sync loop: debounced watcher events become outbound diffs,
/// inbound diffs become filesystem writes, and a fingerprint-based echo
/// guard keeps the two from feeding back into each other.
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use diff_engine::{apply_patch, fingerprint, has_changed, make_patch};
use sync_core::constants::{DEFAULT_IGNORE, HANDSHAKE_TIMEOUT_MS, LOCK_IDLE_RELEASE_MS};
use sync_core::{
    now_ms, BurstDetector, FileDiff, FullFilePayload, PendingQueue, SyncHandshake, WireMessage,
};

use crate::transport::NetEvent;

/// Expected post-write fingerprints kept per file for echo suppression.
const ECHO_CAPACITY: usize = 8;

pub struct SyncEngine {
    root: PathBuf,
    name: String,
    project_id: String,
    ignore: GlobSet,

    /// Last-known text per synced file.
    contents: HashMap<String, String>,
    /// Fingerprint of `contents`.
    versions: HashMap<String, String>,

    pending: PendingQueue,
    burst: BurstDetector,

    /// Echo guard: fingerprints we expect the watcher to observe because we
    /// wrote them ourselves.
    expected: HashMap<String, VecDeque<String>>,
    /// Files we deleted on behalf of a peer; their removal events are ours.
    expected_removals: HashSet<String>,

    connected: bool,
    handshake_sent_at: Option<i64>,
    /// file -> last refresh; idle locks are released after 30s.
    held_locks: HashMap<String, i64>,

    debounce_tasks: HashMap<String, JoinHandle<()>>,
    debounce_tx: UnboundedSender<String>,
    debounce_rx: Option<UnboundedReceiver<String>>,

    net_tx: UnboundedSender<WireMessage>,
}

impl SyncEngine {
    pub fn new(
        root: PathBuf,
        name: String,
        extra_ignore: Vec<String>,
        net_tx: UnboundedSender<WireMessage>,
    ) -> anyhow::Result<Self> {
        let project_id = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string());
        let (debounce_tx, debounce_rx) = mpsc::unbounded_channel();

        Ok(Self {
            root,
            name,
            project_id,
            ignore: build_ignore(&extra_ignore)?,
            contents: HashMap::new(),
            versions: HashMap::new(),
            pending: PendingQueue::new(),
            burst: BurstDetector::new(),
            expected: HashMap::new(),
            expected_removals: HashSet::new(),
            connected: false,
            handshake_sent_at: None,
            held_locks: HashMap::new(),
            debounce_tasks: HashMap::new(),
            debounce_tx,
            debounce_rx: Some(debounce_rx),
            net_tx,
        })
    }

    /// Prime the caches from disk without sending anything.
    pub fn initial_scan(&mut self) {
        let mut scanned = 0usize;
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Some(rel) = self.rel_path(entry.path()) else {
                continue;
            };
            if let Some(text) = read_utf8(entry.path()) {
                self.versions.insert(rel.clone(), fingerprint(&text));
                self.contents.insert(rel, text);
                scanned += 1;
            }
        }
        info!(files = scanned, "initial scan complete");
    }

    pub async fn run(
        mut self,
        mut watch_rx: UnboundedReceiver<PathBuf>,
        mut net_rx: UnboundedReceiver<NetEvent>,
    ) {
        let Some(mut debounce_rx) = self.debounce_rx.take() else {
            warn!("sync engine already running");
            return;
        };
        let mut tick = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Some(path) = watch_rx.recv() => self.handle_watch_path(path),
                Some(event) = net_rx.recv() => self.handle_net(event),
                Some(file) = debounce_rx.recv() => self.flush_file(&file),
                _ = tick.tick() => self.on_tick(),
            }
        }
    }

    // ── Filesystem → outbound ───────────────────────────────────────

    fn handle_watch_path(&mut self, path: PathBuf) {
        if path.is_dir() {
            return;
        }
        let Some(rel) = self.rel_path(&path) else {
            return;
        };

        if !path.exists() {
            self.handle_removed(&rel);
            return;
        }

        self.burst.record_write(now_ms());
        self.restart_debounce(rel);
    }

    fn handle_removed(&mut self, rel: &str) {
        if let Some(task) = self.debounce_tasks.remove(rel) {
            task.abort();
        }

        if self.expected_removals.remove(rel) {
            // Our own unlink on behalf of a peer.
            self.contents.remove(rel);
            self.versions.remove(rel);
            return;
        }

        if self.contents.remove(rel).is_some() {
            self.versions.remove(rel);
            if self.connected {
                self.send(WireMessage::Delete {
                    file: rel.to_string(),
                    author: self.name.clone(),
                });
            } else {
                // Deletes are best-effort; not queued across reconnects.
                debug!(file = rel, "offline delete dropped");
            }
        }
    }

    fn restart_debounce(&mut self, rel: String) {
        if let Some(task) = self.debounce_tasks.remove(&rel) {
            task.abort();
        }
        let delay = self.burst.debounce_ms(now_ms());
        let tx = self.debounce_tx.clone();
        let file = rel.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = tx.send(file);
        });
        self.debounce_tasks.insert(rel, task);
    }

    /// Debounce expired: read the file and emit a diff or full-file send.
    fn flush_file(&mut self, rel: &str) {
        self.debounce_tasks.remove(rel);

        let Some(text) = read_utf8(&self.abs_path(rel)) else {
            // Gone again, or not UTF-8 text; either way not ours to sync.
            return;
        };
        let now = now_ms();
        let new_version = fingerprint(&text);

        if self.consume_expected(rel, &new_version) {
            // The write we just made applying a peer's change.
            self.versions.insert(rel.to_string(), new_version);
            self.contents.insert(rel.to_string(), text);
            return;
        }

        let old = self.contents.get(rel).cloned().unwrap_or_default();
        if !has_changed(&old, &text) {
            return;
        }

        if old.is_empty() {
            // New to this client; peers need the whole content.
            if self.connected {
                self.send(WireMessage::FullFile {
                    file: rel.to_string(),
                    content: text.clone(),
                    hash: new_version.clone(),
                });
            } else {
                debug!(file = rel, "offline full-file send dropped");
            }
        } else {
            let previous_version = self
                .versions
                .get(rel)
                .cloned()
                .unwrap_or_else(|| fingerprint(&old));
            let diff = FileDiff {
                id: None,
                file: rel.to_string(),
                patch: make_patch(&old, &text),
                author: self.name.clone(),
                author_kind: self.burst.author_kind(now),
                timestamp: now,
                version: new_version.clone(),
                previous_version,
                compressed: false,
            };
            if self.connected {
                self.send(WireMessage::Diff(diff));
            } else {
                self.pending.enqueue(diff);
                debug!(file = rel, queued = self.pending.len(), "diff queued offline");
            }
        }

        self.versions.insert(rel.to_string(), new_version);
        self.contents.insert(rel.to_string(), text);

        // Every edit refreshes our soft lock.
        if self.connected {
            self.send(WireMessage::Lock {
                file: rel.to_string(),
                lock_kind: self.burst.lock_kind(now),
            });
            self.held_locks.insert(rel.to_string(), now);
        }
    }

    // ── Incoming → filesystem ───────────────────────────────────────

    fn handle_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connected => {
                self.connected = true;
                self.send_handshake();
            }
            NetEvent::Disconnected => {
                self.connected = false;
                self.handshake_sent_at = None;
                self.held_locks.clear();
            }
            NetEvent::Incoming(msg) => self.handle_incoming(msg),
        }
    }

    fn send_handshake(&mut self) {
        self.handshake_sent_at = Some(now_ms());
        self.send(WireMessage::Handshake(SyncHandshake {
            client_id: self.name.clone(),
            project_id: self.project_id.clone(),
            file_versions: self.versions.clone(),
        }));
    }

    fn handle_incoming(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::HandshakeResponse(response) => {
                self.handshake_sent_at = None;
                info!(
                    missing = response.missing_diffs.len(),
                    locks = response.locks.len(),
                    "handshake complete"
                );
                for diff in response.missing_diffs {
                    self.apply_incoming_diff(diff);
                }
                for full in response.full_files {
                    let FullFilePayload { file, content } = full;
                    self.apply_full_file(&file, &content);
                }
                for diff in self.pending.drain() {
                    self.send(WireMessage::Diff(diff));
                }
            }
            WireMessage::Diff(diff) => self.apply_incoming_diff(diff),
            WireMessage::ApplyFullFile { file, content, .. } => {
                self.apply_full_file(&file, &content)
            }
            WireMessage::Delete { file, .. } => {
                let path = self.abs_path(&file);
                if path.exists() {
                    self.expected_removals.insert(file.clone());
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(file, %err, "failed to remove file");
                        self.expected_removals.remove(&file);
                    }
                }
                self.contents.remove(&file);
                self.versions.remove(&file);
            }
            WireMessage::Rename {
                old_file, new_file, ..
            } => self.apply_rename(&old_file, &new_file),
            WireMessage::Conflict(event) => {
                warn!(
                    file = %event.file,
                    authors = format!("{} / {}", event.author_a, event.author_b),
                    suggested = %event.conflict_file,
                    "edit conflict detected"
                );
            }
            WireMessage::LockChanged { locks } => {
                for lock in &locks {
                    if self.held_locks.contains_key(&lock.file) && lock.locked_by != self.name {
                        warn!(file = %lock.file, holder = %lock.locked_by, "file locked by peer");
                    }
                }
                debug!(locks = locks.len(), "lock table updated");
            }
            other => debug!(event = other.event_name(), "ignoring message"),
        }
    }

    /// Apply a peer's diff, preferring convergence over fidelity: the
    /// best-effort result is always written, even on partial application.
    fn apply_incoming_diff(&mut self, diff: FileDiff) {
        let rel = diff.file.clone();
        let current = read_utf8(&self.abs_path(&rel))
            .or_else(|| self.contents.get(&rel).cloned())
            .unwrap_or_default();

        let outcome = apply_patch(&diff.patch, &current);
        let new_version = if outcome.ok {
            diff.version.clone()
        } else {
            warn!(
                file = rel,
                applied = outcome.hunks_applied,
                total = outcome.hunks_total,
                "partial patch application"
            );
            fingerprint(&outcome.result)
        };

        self.register_expected(&rel, fingerprint(&outcome.result));
        if let Err(err) = self.write_file(&rel, &outcome.result) {
            warn!(file = rel, %err, "failed to write incoming diff");
            return;
        }

        self.contents.insert(rel.clone(), outcome.result);
        self.versions.insert(rel, new_version);
    }

    fn apply_full_file(&mut self, file: &str, content: &str) {
        let hash = fingerprint(content);
        self.register_expected(file, hash.clone());
        if let Err(err) = self.write_file(file, content) {
            warn!(file, %err, "failed to write full file");
            return;
        }
        self.contents.insert(file.to_string(), content.to_string());
        self.versions.insert(file.to_string(), hash);
    }

    fn apply_rename(&mut self, old_file: &str, new_file: &str) {
        let from = self.abs_path(old_file);
        let to = self.abs_path(new_file);

        if from.exists() {
            if let Some(parent) = to.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            self.expected_removals.insert(old_file.to_string());
            if let Err(err) = std::fs::rename(&from, &to) {
                warn!(old_file, new_file, %err, "rename failed");
                self.expected_removals.remove(old_file);
                return;
            }
        }

        if let Some(text) = self.contents.remove(old_file) {
            self.contents.insert(new_file.to_string(), text);
        }
        if let Some(version) = self.versions.remove(old_file) {
            self.versions.insert(new_file.to_string(), version);
        }
        // The move lands as a fresh watcher event on the new path.
        if let Some(text) = read_utf8(&to) {
            self.register_expected(new_file, fingerprint(&text));
        }
    }

    // ── Periodic upkeep ─────────────────────────────────────────────

    fn on_tick(&mut self) {
        let now = now_ms();

        if self.connected {
            if let Some(sent) = self.handshake_sent_at {
                if now - sent >= HANDSHAKE_TIMEOUT_MS as i64 {
                    warn!("handshake timed out, retrying");
                    self.send_handshake();
                }
            }
        }

        let idle: Vec<String> = self
            .held_locks
            .iter()
            .filter(|(_, &refreshed)| now - refreshed >= LOCK_IDLE_RELEASE_MS as i64)
            .map(|(file, _)| file.clone())
            .collect();
        for file in idle {
            self.held_locks.remove(&file);
            if self.connected {
                debug!(file, "releasing idle lock");
                self.send(WireMessage::Unlock { file });
            }
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn send(&self, msg: WireMessage) {
        let _ = self.net_tx.send(msg);
    }

    fn register_expected(&mut self, rel: &str, fp: String) {
        let slot = self.expected.entry(rel.to_string()).or_default();
        slot.push_back(fp);
        while slot.len() > ECHO_CAPACITY {
            slot.pop_front();
        }
    }

    fn consume_expected(&mut self, rel: &str, fp: &str) -> bool {
        let Some(slot) = self.expected.get_mut(rel) else {
            return false;
        };
        let Some(pos) = slot.iter().position(|e| e == fp) else {
            return false;
        };
        slot.remove(pos);
        if slot.is_empty() {
            self.expected.remove(rel);
        }
        true
    }

    fn rel_path(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let joined = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if joined.is_empty() || self.ignore.is_match(&joined) {
            return None;
        }
        Some(joined)
    }

    fn abs_path(&self, rel: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in rel.split('/') {
            path.push(part);
        }
        path
    }

    fn write_file(&self, rel: &str, content: &str) -> std::io::Result<()> {
        let path = self.abs_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }
}

fn build_ignore(extra: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_IGNORE.iter().map(|s| s.to_string()).chain(extra.iter().cloned()) {
        builder.add(Glob::new(&pattern)?);
    }
    Ok(builder.build()?)
}

/// UTF-8 file contents, or None for missing/binary files (never synced).
fn read_utf8(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    String::from_utf8(bytes).ok()
}
