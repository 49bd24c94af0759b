/// Wire envelopes exchanged between client and relay.
///
/// JSON objects tagged by event name, e.g. `{"event": "file:diff", ...}`.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ConflictEvent, DashboardState, FileDiff, LockKind, LockState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireMessage {
    // Client -> relay
    #[serde(rename = "file:diff")]
    Diff(FileDiff),

    #[serde(rename = "file:lock")]
    Lock {
        file: String,
        #[serde(rename = "lockType")]
        lock_kind: LockKind,
    },

    #[serde(rename = "file:unlock")]
    Unlock { file: String },

    #[serde(rename = "file:delete")]
    Delete { file: String, author: String },

    #[serde(rename = "file:rename")]
    Rename {
        #[serde(rename = "oldFile")]
        old_file: String,
        #[serde(rename = "newFile")]
        new_file: String,
        author: String,
    },

    #[serde(rename = "sync:handshake")]
    Handshake(SyncHandshake),

    #[serde(rename = "sync:full-file")]
    FullFile {
        file: String,
        content: String,
        hash: String,
    },

    #[serde(rename = "dashboard:subscribe")]
    DashboardSubscribe,

    #[serde(rename = "diff:undo")]
    Undo {
        file: String,
        #[serde(rename = "diffId")]
        diff_id: i64,
    },

    // Relay -> client
    #[serde(rename = "sync:handshake-response")]
    HandshakeResponse(SyncHandshakeResponse),

    #[serde(rename = "file:lock-changed")]
    LockChanged { locks: Vec<LockState> },

    #[serde(rename = "file:conflict")]
    Conflict(ConflictEvent),

    #[serde(rename = "sync:apply-full-file")]
    ApplyFullFile {
        file: String,
        content: String,
        hash: String,
    },

    #[serde(rename = "dashboard:state")]
    State(DashboardState),
}

impl WireMessage {
    /// Parse one wire frame, enforcing the payload cap.
    pub fn decode(text: &str) -> crate::Result<Self> {
        if text.len() > crate::constants::MAX_PAYLOAD_BYTES {
            return Err(crate::SyncError::PayloadTooLarge(text.len()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Event tag, for log lines.
    pub fn event_name(&self) -> &'static str {
        match self {
            WireMessage::Diff(_) => "file:diff",
            WireMessage::Lock { .. } => "file:lock",
            WireMessage::Unlock { .. } => "file:unlock",
            WireMessage::Delete { .. } => "file:delete",
            WireMessage::Rename { .. } => "file:rename",
            WireMessage::Handshake(_) => "sync:handshake",
            WireMessage::FullFile { .. } => "sync:full-file",
            WireMessage::DashboardSubscribe => "dashboard:subscribe",
            WireMessage::Undo { .. } => "diff:undo",
            WireMessage::HandshakeResponse(_) => "sync:handshake-response",
            WireMessage::LockChanged { .. } => "file:lock-changed",
            WireMessage::Conflict(_) => "file:conflict",
            WireMessage::ApplyFullFile { .. } => "sync:apply-full-file",
            WireMessage::State(_) => "dashboard:state",
        }
    }
}

/// Sent once per connection; the relay answers with the missing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHandshake {
    pub client_id: String,
    pub project_id: String,
    /// file -> fingerprint as the client last saw it.
    pub file_versions: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHandshakeResponse {
    /// Oldest-first per file; the client applies them in order.
    pub missing_diffs: Vec<FileDiff>,

    /// Reserved; the relay sends it empty but clients must iterate it.
    pub full_files: Vec<FullFilePayload>,

    pub locks: Vec<LockState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullFilePayload {
    pub file: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthorKind;

    #[test]
    fn envelope_tag_is_event_name() {
        let msg = WireMessage::Unlock { file: "a.txt".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "file:unlock");
        assert_eq!(json["file"], "a.txt");
    }

    #[test]
    fn diff_envelope_keeps_inner_type_field() {
        let msg = WireMessage::Diff(FileDiff {
            id: None,
            file: "a.txt".into(),
            patch: String::new(),
            author: "bob".into(),
            author_kind: AuthorKind::Human,
            timestamp: 1,
            version: "0".repeat(16),
            previous_version: "1".repeat(16),
            compressed: false,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["event"], "file:diff");
        assert_eq!(json["type"], "human");

        let back: WireMessage = serde_json::from_value(json).unwrap();
        assert!(matches!(back, WireMessage::Diff(d) if d.file == "a.txt"));
    }

    #[test]
    fn lock_uses_wire_field_names() {
        let msg = WireMessage::Lock {
            file: "m.ts".into(),
            lock_kind: LockKind::AgentWriting,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["lockType"], "agent-writing");
    }

    #[test]
    fn unknown_event_fails_to_parse() {
        let err = serde_json::from_str::<WireMessage>("{\"event\":\"no:such\"}");
        assert!(err.is_err());
    }

    #[test]
    fn decode_rejects_oversized_payloads() {
        let padding = "x".repeat(crate::constants::MAX_PAYLOAD_BYTES + 1);
        let err = WireMessage::decode(&padding).unwrap_err();
        assert!(matches!(err, crate::SyncError::PayloadTooLarge(_)));
    }

    #[test]
    fn decode_parses_valid_frames() {
        let msg = WireMessage::decode("{\"event\":\"file:unlock\",\"file\":\"a\"}").unwrap();
        assert!(matches!(msg, WireMessage::Unlock { file } if file == "a"));
    }

    #[test]
    fn handshake_round_trip() {
        let mut versions = HashMap::new();
        versions.insert("src/a.rs".to_string(), "ab".repeat(8));
        let msg = WireMessage::Handshake(SyncHandshake {
            client_id: "c1".into(),
            project_id: "p1".into(),
            file_versions: versions,
        });
        let text = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&text).unwrap();
        match back {
            WireMessage::Handshake(h) => {
                assert_eq!(h.file_versions.len(), 1);
                assert_eq!(h.project_id, "p1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
