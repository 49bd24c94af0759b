/// Shared protocol layer for diff-based project synchronization.
/// Entities, wire envelopes, and the client/relay logic that both sides agree on.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod types;
pub use types::*;

mod messages;
pub use messages::*;

mod conflict;
pub use conflict::*;

mod burst;
pub use burst::*;

mod offline;
pub use offline::*;

pub mod constants;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Runtime identity of one relay connection. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
