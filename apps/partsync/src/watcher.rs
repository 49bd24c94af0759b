/// Filesystem watching with a short stability window.
///
/// Raw events are debounced for 100ms by the notify debouncer; the engine
/// layers its own per-file debounce (300ms human / 100ms agent) on top.
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use sync_core::constants::WATCH_STABILITY_MS;

/// Start watching `root` recursively. Paths land on `tx` as they settle;
/// the engine classifies them as added/changed/removed against its caches.
pub fn start_watcher(
    root: &Path,
    tx: UnboundedSender<PathBuf>,
) -> anyhow::Result<Debouncer<notify::RecommendedWatcher>> {
    let mut debouncer = new_debouncer(
        Duration::from_millis(WATCH_STABILITY_MS),
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    let _ = tx.send(event.path);
                }
            }
            Err(err) => warn!(%err, "watch error"),
        },
    )?;

    debouncer
        .watcher()
        .watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}
