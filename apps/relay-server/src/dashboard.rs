/// Periodic rollup pushed to dashboard subscribers.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use sync_core::constants::{
    DASHBOARD_RECENT_CONFLICTS, DASHBOARD_RECENT_DIFFS, DASHBOARD_UPDATE_INTERVAL_MS,
    LOCK_SWEEP_INTERVAL_MS,
};
use sync_core::{now_ms, DashboardState, HealthMetrics, WireMessage};

use crate::state::RelayState;

pub fn snapshot(state: &RelayState) -> anyhow::Result<DashboardState> {
    let (recent_diffs, recent_conflicts, db_size_bytes, total_diffs, total_files) = {
        let store = state.store.lock();
        (
            store.recent(DASHBOARD_RECENT_DIFFS)?,
            store.recent_conflicts(DASHBOARD_RECENT_CONFLICTS)?,
            store.db_size_bytes()?,
            store.total_diffs()?,
            store.total_files()?,
        )
    };

    Ok(DashboardState {
        clients: state.client_infos(),
        locks: state.locks.snapshot(),
        recent_diffs,
        recent_conflicts,
        health: HealthMetrics {
            uptime_ms: state.uptime_ms(),
            db_size_bytes,
            total_diffs,
            total_files,
        },
    })
}

/// Push a snapshot to every subscriber every two seconds.
pub fn spawn_dashboard_task(state: Arc<RelayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(DASHBOARD_UPDATE_INTERVAL_MS));
        loop {
            interval.tick().await;
            if state.dashboard_subscribers.is_empty() {
                continue;
            }
            match snapshot(&state) {
                Ok(snap) => {
                    let msg = WireMessage::State(snap);
                    let subscribers: Vec<_> = state
                        .dashboard_subscribers
                        .iter()
                        .map(|e| *e.key())
                        .collect();
                    for id in subscribers {
                        state.send_to(id, &msg);
                    }
                }
                Err(err) => warn!(%err, "dashboard snapshot failed"),
            }
        }
    })
}

/// Sweep expired locks every thirty seconds, broadcasting when any fall.
pub fn spawn_lock_sweeper(state: Arc<RelayState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(LOCK_SWEEP_INTERVAL_MS));
        loop {
            interval.tick().await;
            let swept = {
                let store = state.store.lock();
                state.locks.sweep_expired(&store, now_ms())
            };
            match swept {
                Ok(files) if !files.is_empty() => {
                    warn!(files = files.len(), "expired locks swept");
                    state.broadcast_locks();
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "lock sweep failed"),
            }
        }
    })
}
