/// Per-connection WebSocket handling and message dispatch.
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use diff_engine::invert_patch;
use sync_core::{
    conflict_file_name, now_ms, patches_overlap, AuthorKind, ConflictEvent, ConnectionId,
    FileDiff, LockKind, SyncHandshake, SyncHandshakeResponse, WireMessage,
};

use crate::dashboard;
use crate::locks::Acquire;
use crate::state::RelayState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "clientName")]
    client_name: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    let name = query
        .client_name
        .unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, name))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, name: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register_client(&name, tx.clone());
    info!(%conn_id, client = %name, "client connected");

    // Forward the outbound channel to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(%conn_id, %err, "websocket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                state.touch(conn_id);

                match WireMessage::decode(&text) {
                    Ok(wire) => {
                        if let Err(err) = handle_message(&state, conn_id, &name, wire) {
                            // Storage failure is fatal to this connection;
                            // the client reconnects and handshakes.
                            error!(%conn_id, %err, "handler failed, closing connection");
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%conn_id, %err, "malformed message ignored");
                    }
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                debug!(%conn_id, "client requested close");
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect.
    state.remove_client(conn_id);
    let released = {
        let store = state.store.lock();
        state
            .locks
            .release_for_client(&store, &name, Some(conn_id))
            .unwrap_or_default()
    };
    if !released.is_empty() {
        debug!(%conn_id, files = released.len(), "released locks on disconnect");
        state.broadcast_locks();
    }
    send_task.abort();
    info!(%conn_id, client = %name, "client disconnected");
}

fn handle_message(
    state: &Arc<RelayState>,
    conn: ConnectionId,
    name: &str,
    msg: WireMessage,
) -> anyhow::Result<()> {
    match msg {
        WireMessage::Diff(diff) => handle_diff(state, conn, diff),
        WireMessage::Lock { file, lock_kind } => handle_lock(state, conn, name, file, lock_kind),
        WireMessage::Unlock { file } => {
            let changed = {
                let store = state.store.lock();
                state.locks.release(&store, &file, Some(name))?
            };
            if !changed {
                debug!(client = %name, file, "unlock did not match a held lock");
            }
            state.broadcast_locks();
            Ok(())
        }
        WireMessage::Delete { file, author } => {
            let released = {
                let store = state.store.lock();
                state.locks.release(&store, &file, None)?
            };
            state.broadcast(&WireMessage::Delete { file, author }, Some(conn));
            if released {
                state.broadcast_locks();
            }
            Ok(())
        }
        WireMessage::Rename {
            old_file,
            new_file,
            author,
        } => {
            let released = {
                let store = state.store.lock();
                state.locks.release(&store, &old_file, None)?
            };
            state.broadcast(
                &WireMessage::Rename {
                    old_file,
                    new_file,
                    author,
                },
                Some(conn),
            );
            if released {
                state.broadcast_locks();
            }
            Ok(())
        }
        WireMessage::FullFile {
            file,
            content,
            hash,
        } => {
            {
                let store = state.store.lock();
                store.upsert_version(&file, &hash, now_ms())?;
            }
            state.broadcast(
                &WireMessage::ApplyFullFile {
                    file,
                    content,
                    hash,
                },
                Some(conn),
            );
            Ok(())
        }
        WireMessage::Handshake(handshake) => handle_handshake(state, conn, handshake),
        WireMessage::Undo { file, diff_id } => handle_undo(state, name, file, diff_id),
        WireMessage::DashboardSubscribe => {
            state.dashboard_subscribers.insert(conn, ());
            let snapshot = dashboard::snapshot(state)?;
            state.send_to(conn, &WireMessage::State(snapshot));
            Ok(())
        }
        other => {
            warn!(client = %name, event = other.event_name(), "unexpected inbound event ignored");
            Ok(())
        }
    }
}

/// Validate against the version chain, record a conflict when two live
/// patches overlap, store, and re-broadcast with the assigned id.
fn handle_diff(state: &Arc<RelayState>, conn: ConnectionId, diff: FileDiff) -> anyhow::Result<()> {
    let mut conflict: Option<ConflictEvent> = None;

    let stored = {
        let store = state.store.lock();

        if let Some(current) = store.get_version(&diff.file)? {
            if current.hash != diff.previous_version {
                let last = store.diffs_by_file(&diff.file, 1)?.into_iter().next();
                if let Some(existing) = last {
                    if patches_overlap(&existing.patch, &diff.patch) {
                        let ts = now_ms();
                        let mut event = ConflictEvent {
                            id: None,
                            file: diff.file.clone(),
                            conflict_file: conflict_file_name(&diff.file, ts),
                            author_a: existing.author.clone(),
                            author_b: diff.author.clone(),
                            timestamp: ts,
                            resolved: false,
                        };
                        event.id = Some(store.insert_conflict(&event)?);
                        conflict = Some(event);
                    }
                }
            }
        }

        // Stored regardless: the relay is a coherence point, not an arbiter.
        let id = store.accept_diff(&diff)?;
        FileDiff {
            id: Some(id),
            ..diff
        }
    };

    if let Some(event) = conflict {
        warn!(file = %event.file, a = %event.author_a, b = %event.author_b, "conflict detected");
        state.broadcast(&WireMessage::Conflict(event), None);
    }

    debug!(file = %stored.file, id = ?stored.id, "diff accepted");
    state.broadcast(&WireMessage::Diff(stored), Some(conn));
    Ok(())
}

fn handle_lock(
    state: &Arc<RelayState>,
    conn: ConnectionId,
    name: &str,
    file: String,
    lock_kind: LockKind,
) -> anyhow::Result<()> {
    let result = {
        let store = state.store.lock();
        state
            .locks
            .acquire(&store, &file, name, lock_kind, conn, now_ms())?
    };
    match result {
        Acquire::Granted => debug!(client = %name, file, "lock granted"),
        Acquire::Denied { existing } => {
            debug!(client = %name, file, holder = %existing.locked_by, "lock denied")
        }
    }
    state.broadcast_locks();
    Ok(())
}

/// Deliver every diff the client is missing, oldest first per file.
fn handle_handshake(
    state: &Arc<RelayState>,
    conn: ConnectionId,
    handshake: SyncHandshake,
) -> anyhow::Result<()> {
    let mut missing_diffs = Vec::new();
    {
        let store = state.store.lock();
        for known in store.all_versions()? {
            match handshake.file_versions.get(&known.file) {
                Some(hash) if *hash == known.hash => continue,
                Some(hash) => missing_diffs.extend(store.diffs_since(&known.file, hash)?),
                None => missing_diffs.extend(store.diffs_since(&known.file, "")?),
            }
        }
    }

    info!(
        %conn,
        client = %handshake.client_id,
        project = %handshake.project_id,
        missing = missing_diffs.len(),
        "handshake"
    );

    state.send_to(
        conn,
        &WireMessage::HandshakeResponse(SyncHandshakeResponse {
            missing_diffs,
            // Reserved for future use; clients iterate it regardless.
            full_files: Vec::new(),
            locks: state.locks.snapshot(),
        }),
    );
    Ok(())
}

/// Synthesize an inverse diff with swapped version hashes and broadcast it to
/// everyone, the sender included. The inverse is stored so the version chain
/// stays coherent after the revert.
fn handle_undo(
    state: &Arc<RelayState>,
    name: &str,
    file: String,
    diff_id: i64,
) -> anyhow::Result<()> {
    let stored = {
        let store = state.store.lock();
        let Some(original) = store.by_id(diff_id)? else {
            warn!(file, diff_id, "undo requested for unknown diff");
            return Ok(());
        };
        let patch = match invert_patch(&original.patch) {
            Ok(patch) => patch,
            Err(err) => {
                warn!(file, diff_id, %err, "undo skipped: patch not invertible");
                return Ok(());
            }
        };

        let inverse = FileDiff {
            id: None,
            file: original.file.clone(),
            patch,
            author: name.to_string(),
            author_kind: AuthorKind::Human,
            timestamp: now_ms(),
            version: original.previous_version.clone(),
            previous_version: original.version.clone(),
            compressed: false,
        };
        let id = store.accept_diff(&inverse)?;
        FileDiff {
            id: Some(id),
            ..inverse
        }
    };

    info!(file = %stored.file, undone = diff_id, "undo broadcast");
    state.broadcast(&WireMessage::Diff(stored), None);
    Ok(())
}
