use std::collections::HashMap;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::warn;

use parley_types::Identity;
use parley_types::models::{ChatLogRecord, ContentKind, GroupSnapshot, UserProfile};

use crate::Database;
use crate::models::{ChatLogRow, UserRow};
use crate::queries::LogTable;

/// The persistence port the gateway talks to.
///
/// Calls are blocking; async callers go through `tokio::task::spawn_blocking`.
pub trait ChatStore: Send + Sync + 'static {
    /// Resolve an identity (user id or email) to a profile.
    fn find_user(&self, identity: &Identity) -> Result<Option<UserProfile>>;

    /// Persist a peer conversation record. Returns the stored record id.
    fn insert_peer_log(&self, record: &ChatLogRecord) -> Result<String>;

    /// Persist a group conversation record. Returns the stored record id.
    fn insert_group_log(&self, record: &ChatLogRecord) -> Result<String>;

    fn get_group(&self, id: &Identity) -> Result<Option<GroupSnapshot>>;
}

impl ChatStore for Database {
    fn find_user(&self, identity: &Identity) -> Result<Option<UserProfile>> {
        self.get_user(identity.as_str())?
            .map(user_from_row)
            .transpose()
    }

    fn insert_peer_log(&self, record: &ChatLogRecord) -> Result<String> {
        self.insert_log(LogTable::Peer, record)?;
        Ok(record.id.clone())
    }

    fn insert_group_log(&self, record: &ChatLogRecord) -> Result<String> {
        self.insert_log(LogTable::Group, record)?;
        Ok(record.id.clone())
    }

    fn get_group(&self, id: &Identity) -> Result<Option<GroupSnapshot>> {
        let Some((group, members)) = self.get_group_with_members(id.as_str())? else {
            return Ok(None);
        };

        let mut participants = Vec::with_capacity(members.len());
        let mut push_tokens = HashMap::new();
        for member in members {
            match Identity::parse(&member.user_id) {
                Ok(identity) => participants.push(identity),
                Err(e) => {
                    warn!("Corrupt member id '{}' in group '{}': {}", member.user_id, group.id, e);
                    continue;
                }
            }
            if let Some(token) = member.push_token.filter(|t| !t.is_empty()) {
                push_tokens.insert(member.user_id, token);
            }
        }

        Ok(Some(GroupSnapshot {
            id: Identity::parse(&group.id).with_context(|| format!("corrupt group id '{}'", group.id))?,
            name: group.name,
            participants,
            push_tokens,
        }))
    }
}

impl Database {
    /// Read a stored record back as a domain value.
    pub fn get_record(&self, table: LogTable, id: &str) -> Result<Option<ChatLogRecord>> {
        self.get_log(table, id)?.map(record_from_row).transpose()
    }
}

fn user_from_row(row: UserRow) -> Result<UserProfile> {
    Ok(UserProfile {
        id: Identity::parse(&row.id).with_context(|| format!("corrupt user id '{}'", row.id))?,
        name: row.name,
        email: row.email,
        push_token: row.push_token.filter(|t| !t.is_empty()),
    })
}

fn record_from_row(row: ChatLogRow) -> Result<ChatLogRecord> {
    let content_kind = ContentKind::parse(&row.content_kind)
        .ok_or_else(|| anyhow!("corrupt content kind '{}' on log '{}'", row.content_kind, row.id))?;
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .with_context(|| format!("corrupt created_at '{}' on log '{}'", row.created_at, row.id))?
        .with_timezone(&Utc);

    Ok(ChatLogRecord {
        target_id: Identity::parse(&row.target_id)?,
        author_id: Identity::parse(&row.author_id)?,
        author_name: row.author_name,
        content_kind,
        content_id: row.content_id,
        body: row.body,
        media: serde_json::from_str(&row.media)?,
        placeholders: serde_json::from_str(&row.placeholders)?,
        created_at,
        id: row.id,
    })
}
