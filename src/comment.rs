//! The canonical lead comment and its display ordering.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;

use crate::error::{Result, SyncError};

/// A comment attached to exactly one lead.
///
/// Field names follow the GraphQL API (`leadId`, `userId`, `createdAt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub lead_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    /// Set when a broadcast lacked `createdAt` or `userId` and the local
    /// receive time stands in for the server timestamp. Never serialized.
    #[serde(skip)]
    pub provisional: bool,
}

impl Comment {
    pub fn new(
        id: impl Into<String>,
        lead_id: impl Into<String>,
        user_id: Option<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            lead_id: lead_id.into(),
            user_id,
            content: content.into(),
            created_at,
            provisional: false,
        }
    }
}

/// Display order: `created_at` ascending, ties broken by `id`.
pub fn display_order(a: &Comment, b: &Comment) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Parse a backend timestamp.
///
/// The API emits Python `isoformat()` strings without an offset
/// (`2024-05-01T12:30:00.123456`); those are read as UTC. RFC 3339 strings
/// with an explicit offset are accepted as well.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| SyncError::Json {
            field: "createdAt".into(),
            detail: format!("'{raw}': {e}"),
        })
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}
