use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Identity;

/// Content id stored on records that have no provider-side content.
pub const NO_CONTENT_ID: &str = "N/A";

/// Snapshot of a user taken when a session connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Identity,
    pub name: String,
    pub email: Option<String>,
    pub push_token: Option<String>,
}

/// Snapshot of a group taken when a group session connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: Identity,
    pub name: String,
    pub participants: Vec<Identity>,
    /// Participant identity -> push token, for members that have one stored.
    #[serde(default)]
    pub push_tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Video,
    ImageSet,
    File,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Video => "video",
            Self::ImageSet => "image_set",
            Self::File => "file",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "video" => Some(Self::Video),
            "image_set" => Some(Self::ImageSet),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// Durable representation of one message.
///
/// The id is minted when the record is built, before any persistence attempt,
/// and is echoed verbatim to every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogRecord {
    pub id: String,
    pub target_id: Identity,
    pub author_id: Identity,
    pub author_name: String,
    pub content_kind: ContentKind,
    pub content_id: String,
    pub body: String,
    pub media: Vec<String>,
    pub placeholders: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatLogRecord {
    pub fn text(target_id: Identity, author: &UserProfile, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_id,
            author_id: author.id.clone(),
            author_name: author.name.clone(),
            content_kind: ContentKind::Text,
            content_id: NO_CONTENT_ID.to_string(),
            body: body.into(),
            media: Vec::new(),
            placeholders: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn content(
        target_id: Identity,
        author: &UserProfile,
        content_kind: ContentKind,
        body: impl Into<String>,
        content_id: impl Into<String>,
        media: Vec<String>,
        placeholders: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target_id,
            author_id: author.id.clone(),
            author_name: author.name.clone(),
            content_kind,
            content_id: content_id.into(),
            body: body.into(),
            media,
            placeholders,
            created_at: Utc::now(),
        }
    }
}
