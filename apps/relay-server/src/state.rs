/// Shared relay state: store handle, lock table, connection registry.
///
/// All of it lives behind one value with an init-on-start lifecycle; handlers
/// only see `Arc<RelayState>`.
use std::time::Instant;

use axum::extract::ws::Message;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_store::SyncStore;
use sync_core::{now_ms, ClientInfo, ConnectionId, WireMessage};

use crate::locks::LockTable;

pub struct ClientHandle {
    pub info: ClientInfo,
    pub tx: mpsc::UnboundedSender<Message>,
}

pub struct RelayState {
    pub store: Mutex<SyncStore>,
    pub locks: LockTable,
    pub clients: DashMap<ConnectionId, ClientHandle>,
    pub dashboard_subscribers: DashMap<ConnectionId, ()>,
    pub port: u16,
    started: Instant,
}

impl RelayState {
    pub fn new(store: SyncStore, port: u16) -> Self {
        Self {
            store: Mutex::new(store),
            locks: LockTable::default(),
            clients: DashMap::new(),
            dashboard_subscribers: DashMap::new(),
            port,
            started: Instant::now(),
        }
    }

    pub fn uptime_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    pub fn register_client(
        &self,
        display_name: &str,
        tx: mpsc::UnboundedSender<Message>,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let now = now_ms();
        self.clients.insert(
            id,
            ClientHandle {
                info: ClientInfo {
                    connection_id: id,
                    display_name: display_name.to_string(),
                    connected_since: now,
                    last_activity: now,
                },
                tx,
            },
        );
        id
    }

    pub fn remove_client(&self, id: ConnectionId) {
        self.clients.remove(&id);
        self.dashboard_subscribers.remove(&id);
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut handle) = self.clients.get_mut(&id) {
            handle.info.last_activity = now_ms();
        }
    }

    pub fn client_infos(&self) -> Vec<ClientInfo> {
        self.clients.iter().map(|e| e.info.clone()).collect()
    }

    /// Send one message to one connection. A dead channel prunes the client.
    pub fn send_to(&self, id: ConnectionId, msg: &WireMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, event = msg.event_name(), "failed to serialize message");
                return;
            }
        };
        let dead = match self.clients.get(&id) {
            Some(handle) => handle.tx.send(Message::Text(json)).is_err(),
            None => false,
        };
        if dead {
            debug!(%id, "send channel closed, pruning client");
            self.remove_client(id);
        }
    }

    /// Broadcast to every connection except `exclude`, preserving relay
    /// arrival order per connection.
    pub fn broadcast(&self, msg: &WireMessage, exclude: Option<ConnectionId>) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, event = msg.event_name(), "failed to serialize broadcast");
                return;
            }
        };

        let mut dead = Vec::new();
        for entry in self.clients.iter() {
            let id = *entry.key();
            if Some(id) == exclude {
                continue;
            }
            if entry.tx.send(Message::Text(json.clone())).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            debug!(%id, "send channel closed, pruning client");
            self.remove_client(id);
        }
    }

    /// Push the current lock snapshot to everyone.
    pub fn broadcast_locks(&self) {
        let locks = self.locks.snapshot();
        self.broadcast(&WireMessage::LockChanged { locks }, None);
    }
}
