//! Room protocol: frame envelope, event names and inbound payload validation.
//!
//! Every websocket text frame is a JSON object `{"event": "...", "data": {...}}`.
//! Room payloads use snake_case keys (`lead_id`); the camelCase spelling used
//! by the GraphQL API is accepted on inbound comments as well, since payload
//! shapes vary between backend revisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::comment::{parse_timestamp, Comment};
use crate::error::{Result, SyncError};

pub const JOIN_LEAD: &str = "join_lead";
pub const LEAVE_LEAD: &str = "leave_lead";
pub const NEW_COMMENT: &str = "new_comment";
/// Client → server; the server relays the data to the room as [`NEW_COMMENT`].
pub const ADD_COMMENT: &str = "add_comment";

/// One protocol message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn join(lead_id: &str) -> Self {
        Self::new(JOIN_LEAD, serde_json::json!({ "lead_id": lead_id }))
    }

    pub fn leave(lead_id: &str) -> Self {
        Self::new(LEAVE_LEAD, serde_json::json!({ "lead_id": lead_id }))
    }

    /// Relay request carrying a server-confirmed comment, id included.
    pub fn add_comment(comment: &Comment) -> Self {
        Self::new(
            ADD_COMMENT,
            serde_json::json!({
                "id": comment.id,
                "lead_id": comment.lead_id,
                "user_id": comment.user_id,
                "content": comment.content,
                "created_at": comment.created_at.to_rfc3339(),
            }),
        )
    }

    /// The `lead_id` this frame is addressed to, if any.
    pub fn lead_id(&self) -> Option<String> {
        self.data
            .get("lead_id")
            .or_else(|| self.data.get("leadId"))
            .and_then(id_to_string)
    }
}

/// Ids arrive as strings or as bare integers depending on the backend revision.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

fn id_to_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default, alias = "leadId")]
    lead_id: Option<WireId>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    id: Option<WireId>,
    #[serde(default, alias = "userId")]
    user_id: Option<WireId>,
    #[serde(default, alias = "createdAt")]
    created_at: Option<String>,
}

/// The inbound comment schemas seen on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundComment {
    /// `{lead_id, content}` only. Carries no server id and cannot be stored.
    Minimal { lead_id: String, content: String },
    /// Carries the server id; author and timestamp may still be missing.
    Identified {
        id: String,
        lead_id: String,
        content: String,
        user_id: Option<String>,
        created_at: Option<DateTime<Utc>>,
    },
}

impl InboundComment {
    /// Classify a raw `new_comment` payload.
    ///
    /// Fails when the payload is not an object, has no `lead_id`, or carries
    /// an unparseable timestamp.
    pub fn parse(payload: &serde_json::Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(SyncError::protocol("payload is not a JSON object"));
        }
        let raw: RawInbound = serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::protocol(format!("malformed payload: {e}")))?;

        let lead_id = raw
            .lead_id
            .map(WireId::into_string)
            .ok_or_else(|| SyncError::protocol("payload has no lead_id"))?;
        let content = raw.content.unwrap_or_default();

        match raw.id {
            None => Ok(InboundComment::Minimal { lead_id, content }),
            Some(id) => {
                let created_at = raw
                    .created_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()
                    .map_err(|e| SyncError::protocol(e.to_string()))?;
                Ok(InboundComment::Identified {
                    id: id.into_string(),
                    lead_id,
                    content,
                    user_id: raw.user_id.map(WireId::into_string),
                    created_at,
                })
            }
        }
    }

    pub fn lead_id(&self) -> &str {
        match self {
            InboundComment::Minimal { lead_id, .. } => lead_id,
            InboundComment::Identified { lead_id, .. } => lead_id,
        }
    }

    /// Normalize into a canonical [`Comment`] for the room it arrived on.
    ///
    /// A missing id is a contract violation. Missing author or timestamp
    /// yield a provisional comment stamped with `received_at`.
    pub fn into_comment(self, room: &str, received_at: DateTime<Utc>) -> Result<Comment> {
        if self.lead_id() != room {
            return Err(SyncError::protocol(format!(
                "payload lead_id '{}' does not match room '{room}'",
                self.lead_id()
            )));
        }
        match self {
            InboundComment::Minimal { .. } => {
                Err(SyncError::protocol("comment payload has no id"))
            }
            InboundComment::Identified {
                id,
                lead_id,
                content,
                user_id,
                created_at,
            } => {
                if id.trim().is_empty() {
                    return Err(SyncError::protocol("comment payload has an empty id"));
                }
                if content.trim().is_empty() {
                    return Err(SyncError::protocol(format!("comment '{id}' has empty content")));
                }
                let provisional = created_at.is_none() || user_id.is_none();
                Ok(Comment {
                    id,
                    lead_id,
                    user_id,
                    content,
                    created_at: created_at.unwrap_or(received_at),
                    provisional,
                })
            }
        }
    }
}
