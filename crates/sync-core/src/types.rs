/// Entities shared between relay storage and the wire.
use serde::{Deserialize, Serialize};

use crate::ConnectionId;

/// Who produced a change: a person typing or a code-generating agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Human,
    Agent,
}

impl AuthorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorKind::Human => "human",
            AuthorKind::Agent => "agent",
        }
    }
}

impl std::str::FromStr for AuthorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(AuthorKind::Agent),
            "human" => Ok(AuthorKind::Human),
            other => Err(format!("unknown author kind: {other}")),
        }
    }
}

/// Advisory lock flavor; agent writes announce themselves distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    Editing,
    AgentWriting,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockKind::Editing => "editing",
            LockKind::AgentWriting => "agent-writing",
        }
    }
}

impl std::str::FromStr for LockKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "editing" => Ok(LockKind::Editing),
            "agent-writing" => Ok(LockKind::AgentWriting),
            other => Err(format!("unknown lock kind: {other}")),
        }
    }
}

/// One change to one file by one author.
///
/// `id` is assigned by the relay store; a diff leaving a client carries `None`
/// and comes back in broadcasts with the stored id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Project-relative path, forward-slash normalized.
    pub file: String,

    /// Unified-format patch text.
    pub patch: String,

    /// Display name of the producing client.
    pub author: String,

    #[serde(rename = "type", default = "default_author_kind")]
    pub author_kind: AuthorKind,

    /// Milliseconds since epoch at the producer.
    pub timestamp: i64,

    /// Fingerprint of the content after the patch applies cleanly.
    pub version: String,

    /// Fingerprint before.
    pub previous_version: String,

    /// Reserved in the schema; never set by this implementation.
    #[serde(default)]
    pub compressed: bool,
}

fn default_author_kind() -> AuthorKind {
    AuthorKind::Human
}

/// Current content fingerprint for one file at the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub file: String,
    pub hash: String,
    pub timestamp: i64,
}

/// Soft advisory lock. At most one per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    pub file: String,
    pub locked_by: String,
    pub lock_kind: LockKind,
    /// Milliseconds since epoch of the last acquire or refresh.
    pub since: i64,
}

impl LockState {
    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool {
        now_ms - self.since >= expiry_ms
    }
}

/// Record of two overlapping patches against the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub file: String,

    /// Suggested `<base>.conflict-<ts>.<ext>` name; the relay never writes it.
    pub conflict_file: String,

    pub author_a: String,
    pub author_b: String,
    pub timestamp: i64,

    /// Flipped externally; never auto-cleared.
    #[serde(default)]
    pub resolved: bool,
}

/// Relay-side view of a connected peer. Memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub connected_since: i64,
    pub last_activity: i64,
}

/// Rollup pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub clients: Vec<ClientInfo>,
    pub locks: Vec<LockState>,
    pub recent_diffs: Vec<FileDiff>,
    pub recent_conflicts: Vec<ConflictEvent>,
    pub health: HealthMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub uptime_ms: i64,
    pub db_size_bytes: i64,
    pub total_diffs: i64,
    pub total_files: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_kind_wire_names() {
        assert_eq!(serde_json::to_string(&AuthorKind::Agent).unwrap(), "\"agent\"");
        assert_eq!(serde_json::to_string(&AuthorKind::Human).unwrap(), "\"human\"");
    }

    #[test]
    fn lock_kind_wire_names() {
        assert_eq!(serde_json::to_string(&LockKind::Editing).unwrap(), "\"editing\"");
        assert_eq!(
            serde_json::to_string(&LockKind::AgentWriting).unwrap(),
            "\"agent-writing\""
        );
    }

    #[test]
    fn diff_round_trips_with_type_field() {
        let diff = FileDiff {
            id: Some(7),
            file: "src/main.rs".into(),
            patch: "@@ -1,1 +1,1 @@\n-a\n+b\n".into(),
            author: "alice".into(),
            author_kind: AuthorKind::Agent,
            timestamp: 1_700_000_000_000,
            version: "aa".repeat(8),
            previous_version: "bb".repeat(8),
            compressed: false,
        };

        let json = serde_json::to_value(&diff).unwrap();
        assert_eq!(json["type"], "agent");
        assert_eq!(json["previousVersion"], "bb".repeat(8));

        let back: FileDiff = serde_json::from_value(json).unwrap();
        assert_eq!(back.author_kind, AuthorKind::Agent);
        assert_eq!(back.id, Some(7));
    }

    #[test]
    fn lock_expiry_boundary() {
        let lock = LockState {
            file: "x.ts".into(),
            locked_by: "a".into(),
            lock_kind: LockKind::Editing,
            since: 1_000,
        };
        assert!(!lock.is_expired(1_000 + 299_999, 300_000));
        assert!(lock.is_expired(1_000 + 300_000, 300_000));
    }
}
