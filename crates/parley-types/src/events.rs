use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codes::Code;
use crate::models::{ChatLogRecord, ContentKind};

/// A plain text message sent FROM a client over a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    /// Client-side correlation id, not used by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub author_id: String,
    /// Peer conversations address the counterpart here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Group conversations address the group here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Participant identity -> push token for members the client knows to be offline.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub push_tokens: HashMap<String, String>,
    pub body: String,
}

/// Metadata half of a binary frame; the blobs travel alongside it,
/// one per entry in `filenames`, in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub author_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content_kind: ContentKind,
    #[serde(default)]
    pub filenames: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub push_tokens: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// The single message shape sent TO clients, for both peer and group conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub error: bool,
    pub code: Code,
    pub message: String,
    pub content_kind: ContentKind,
    pub record_id: String,
    pub author_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author_name: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnails: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl OutboundMessage {
    /// Project a freshly built record into the message every recipient sees.
    pub fn from_record(record: &ChatLogRecord) -> Self {
        Self {
            error: false,
            code: Code::Ok,
            message: String::new(),
            content_kind: record.content_kind,
            record_id: record.id.clone(),
            author_id: record.author_id.to_string(),
            author_name: record.author_name.clone(),
            body: record.body.clone(),
            media: record.media.clone(),
            thumbnails: record.placeholders.clone(),
            created_at: Some(record.created_at),
        }
    }

    pub fn failure(code: Code, content_kind: ContentKind, err: impl fmt::Display) -> Self {
        Self {
            error: true,
            code,
            message: err.to_string(),
            content_kind,
            record_id: String::new(),
            author_id: String::new(),
            author_name: String::new(),
            body: String::new(),
            media: Vec::new(),
            thumbnails: Vec::new(),
            created_at: None,
        }
    }
}
