//! Client → daemon frames
//!
//! Every inbound frame is decoded through [`decode_client_frame`], which
//! rejects unknown frame types, unknown fields, and out-of-range values
//! before anything reaches session state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PermissionDecision, TurnMode};

/// Longest accepted turn prompt, in bytes.
pub const MAX_CONTENT_BYTES: usize = 256 * 1024;
/// Longest accepted identifier (client, writer, session, turn, request ids).
pub const MAX_ID_LEN: usize = 128;

pub const MAX_METADATA_KEYS: usize = 64;
pub const MAX_METADATA_KEY_LEN: usize = 128;
pub const MAX_METADATA_DEPTH: usize = 8;

/// Frames a client may send over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase", deny_unknown_fields)]
pub enum ClientFrame {
    #[serde(rename = "hello")]
    Hello {
        client_id: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_seq: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    #[serde(rename = "turn.submit")]
    TurnSubmit {
        client_id: String,
        writer_id: String,
        session_id: String,
        content: String,
        #[serde(default)]
        mode: TurnMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    #[serde(rename = "permission.resolve")]
    PermissionResolve {
        session_id: String,
        request_id: String,
        decision: PermissionDecision,
        decided_by: String,
    },
    #[serde(rename = "turn.cancel")]
    TurnCancel {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        writer_id: Option<String>,
    },
    #[serde(rename = "background.start")]
    BackgroundStart {
        session_id: String,
        command: String,
        cwd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    #[serde(rename = "background.kill")]
    BackgroundKill {
        process_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::TurnSubmit { .. } => "turn.submit",
            Self::PermissionResolve { .. } => "permission.resolve",
            Self::TurnCancel { .. } => "turn.cancel",
            Self::BackgroundStart { .. } => "background.start",
            Self::BackgroundKill { .. } => "background.kill",
        }
    }

    /// Semantic checks that the schema alone cannot express.
    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        match self {
            Self::Hello {
                client_id,
                session_id,
                ..
            } => {
                check_id("clientId", client_id)?;
                check_id("sessionId", session_id)
            }
            Self::TurnSubmit {
                client_id,
                writer_id,
                session_id,
                content,
                metadata,
                ..
            } => {
                check_id("clientId", client_id)?;
                check_id("writerId", writer_id)?;
                check_id("sessionId", session_id)?;
                if content.trim().is_empty() {
                    return Err(ProtocolViolation::InvalidField {
                        field: "content",
                        reason: "must not be empty".into(),
                    });
                }
                if content.len() > MAX_CONTENT_BYTES {
                    return Err(ProtocolViolation::InvalidField {
                        field: "content",
                        reason: format!("exceeds {MAX_CONTENT_BYTES} bytes"),
                    });
                }
                match metadata {
                    Some(metadata) => metadata.validate(),
                    None => Ok(()),
                }
            }
            Self::PermissionResolve {
                session_id,
                request_id,
                decided_by,
                ..
            } => {
                check_id("sessionId", session_id)?;
                check_id("requestId", request_id)?;
                check_id("decidedBy", decided_by)
            }
            Self::TurnCancel {
                session_id,
                turn_id,
                writer_id,
            } => {
                check_id("sessionId", session_id)?;
                match (turn_id, writer_id) {
                    (Some(turn_id), None) => check_id("turnId", turn_id),
                    (None, Some(writer_id)) => check_id("writerId", writer_id),
                    _ => Err(ProtocolViolation::InvalidField {
                        field: "turnId",
                        reason: "exactly one of turnId or writerId is required".into(),
                    }),
                }
            }
            Self::BackgroundStart {
                session_id,
                command,
                cwd,
                timeout_ms,
                ..
            } => {
                check_id("sessionId", session_id)?;
                if command.trim().is_empty() {
                    return Err(ProtocolViolation::InvalidField {
                        field: "command",
                        reason: "must not be empty".into(),
                    });
                }
                if cwd.trim().is_empty() {
                    return Err(ProtocolViolation::InvalidField {
                        field: "cwd",
                        reason: "must not be empty".into(),
                    });
                }
                if *timeout_ms == Some(0) {
                    return Err(ProtocolViolation::InvalidField {
                        field: "timeoutMs",
                        reason: "must be greater than zero".into(),
                    });
                }
                Ok(())
            }
            Self::BackgroundKill { process_id, .. } => check_id("processId", process_id),
        }
    }
}

fn check_id(field: &'static str, value: &str) -> Result<(), ProtocolViolation> {
    if value.trim().is_empty() {
        return Err(ProtocolViolation::InvalidField {
            field,
            reason: "must not be empty".into(),
        });
    }
    if value.len() > MAX_ID_LEN {
        return Err(ProtocolViolation::InvalidField {
            field,
            reason: format!("longer than {MAX_ID_LEN} bytes"),
        });
    }
    Ok(())
}

/// Why an inbound frame was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("frame is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
    #[error("frame does not match its schema: {0}")]
    Schema(String),
    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl ProtocolViolation {
    pub const CODE: &'static str = "protocol-violation";
}

const KNOWN_TYPES: &[&str] = &[
    "hello",
    "turn.submit",
    "permission.resolve",
    "turn.cancel",
    "background.start",
    "background.kill",
];

/// Single entry point for inbound frames.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, ProtocolViolation> {
    let raw: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolViolation::MalformedJson(e.to_string()))?;

    let kind = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolViolation::Schema("missing string field `type`".into()))?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(ProtocolViolation::UnknownType(kind.to_string()));
    }

    let frame: ClientFrame =
        serde_json::from_value(raw).map_err(|e| ProtocolViolation::Schema(e.to_string()))?;
    frame.validate()?;
    Ok(frame)
}

/// Closed set of values allowed in turn metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetaValue>),
    Map(BTreeMap<String, MetaValue>),
}

impl MetaValue {
    fn depth(&self) -> usize {
        match self {
            Self::List(items) => 1 + items.iter().map(Self::depth).max().unwrap_or(0),
            Self::Map(entries) => 1 + entries.values().map(Self::depth).max().unwrap_or(0),
            _ => 1,
        }
    }
}

/// Free-form key/value bag attached to a turn submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, MetaValue>);

impl Metadata {
    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        if self.0.len() > MAX_METADATA_KEYS {
            return Err(ProtocolViolation::InvalidField {
                field: "metadata",
                reason: format!("more than {MAX_METADATA_KEYS} keys"),
            });
        }
        for (key, value) in &self.0 {
            if key.is_empty() || key.len() > MAX_METADATA_KEY_LEN {
                return Err(ProtocolViolation::InvalidField {
                    field: "metadata",
                    reason: format!("key length must be 1..={MAX_METADATA_KEY_LEN}"),
                });
            }
            if value.depth() > MAX_METADATA_DEPTH {
                return Err(ProtocolViolation::InvalidField {
                    field: "metadata",
                    reason: format!("`{key}` nests deeper than {MAX_METADATA_DEPTH}"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hello_with_cursor() {
        let json = r#"{"type":"hello","clientId":"cli-1","sessionId":"s-1","afterSeq":41}"#;
        match decode_client_frame(json).expect("decode hello") {
            ClientFrame::Hello {
                client_id,
                session_id,
                after_seq,
                ..
            } => {
                assert_eq!(client_id, "cli-1");
                assert_eq!(session_id, "s-1");
                assert_eq!(after_seq, Some(41));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn decodes_submit_with_metadata() {
        let json = r#"{
          "type":"turn.submit",
          "clientId":"cli-1",
          "writerId":"w-1",
          "sessionId":"s-1",
          "content":"list the files",
          "mode":"do",
          "metadata":{"cwd":"/tmp","retries":2,"tags":["a","b"],"opts":{"fast":true},"note":null}
        }"#;
        match decode_client_frame(json).expect("decode submit") {
            ClientFrame::TurnSubmit { mode, metadata, .. } => {
                assert_eq!(mode, TurnMode::Do);
                let metadata = metadata.expect("metadata present");
                assert_eq!(metadata.get("retries"), Some(&MetaValue::Int(2)));
                assert_eq!(metadata.get("note"), Some(&MetaValue::Null));
                assert!(matches!(metadata.get("opts"), Some(MetaValue::Map(_))));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn mode_defaults_to_chat() {
        let json = r#"{"type":"turn.submit","clientId":"c","writerId":"w","sessionId":"s","content":"hi"}"#;
        match decode_client_frame(json).unwrap() {
            ClientFrame::TurnSubmit { mode, .. } => assert_eq!(mode, TurnMode::Chat),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_frame_type() {
        let err = decode_client_frame(r#"{"type":"session.nuke","sessionId":"s"}"#).unwrap_err();
        assert_eq!(err, ProtocolViolation::UnknownType("session.nuke".into()));
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = r#"{"type":"hello","clientId":"c","sessionId":"s","sneaky":true}"#;
        assert!(matches!(
            decode_client_frame(json),
            Err(ProtocolViolation::Schema(_))
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            decode_client_frame("{\"type\":"),
            Err(ProtocolViolation::MalformedJson(_))
        ));
    }

    #[test]
    fn rejects_empty_content() {
        let json = r#"{"type":"turn.submit","clientId":"c","writerId":"w","sessionId":"s","content":"   "}"#;
        assert!(matches!(
            decode_client_frame(json),
            Err(ProtocolViolation::InvalidField {
                field: "content",
                ..
            })
        ));
    }

    #[test]
    fn cancel_needs_exactly_one_target() {
        let both = r#"{"type":"turn.cancel","sessionId":"s","turnId":"t","writerId":"w"}"#;
        let neither = r#"{"type":"turn.cancel","sessionId":"s"}"#;
        let by_writer = r#"{"type":"turn.cancel","sessionId":"s","writerId":"w"}"#;

        assert!(decode_client_frame(both).is_err());
        assert!(decode_client_frame(neither).is_err());
        assert!(decode_client_frame(by_writer).is_ok());
    }

    #[test]
    fn rejects_metadata_nested_too_deep() {
        let mut value = MetaValue::Int(1);
        for _ in 0..MAX_METADATA_DEPTH {
            value = MetaValue::List(vec![value]);
        }
        let mut map = BTreeMap::new();
        map.insert("deep".to_string(), value);
        assert!(Metadata(map).validate().is_err());
    }

    #[test]
    fn rejects_bad_permission_decision() {
        let json = r#"{"type":"permission.resolve","sessionId":"s","requestId":"p","decision":"maybe","decidedBy":"me"}"#;
        assert!(matches!(
            decode_client_frame(json),
            Err(ProtocolViolation::Schema(_))
        ));
    }
}
