use crate::models::{ChatLogRow, GroupRow, MemberRow, UserRow};
use crate::Database;
use anyhow::Result;
use parley_types::models::ChatLogRecord;
use rusqlite::Connection;

/// Which conversation topology a chat log belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTable {
    Peer,
    Group,
}

impl LogTable {
    fn name(self) -> &'static str {
        match self {
            Self::Peer => "peer_logs",
            Self::Group => "group_logs",
        }
    }
}

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        name: &str,
        email: Option<&str>,
        push_token: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, name, email, push_token) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, name, email, push_token],
            )?;
            Ok(())
        })
    }

    /// Look a user up by id, falling back to email.
    pub fn get_user(&self, identity: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, identity))
    }

    // -- Groups --

    pub fn create_group(&self, id: &str, name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_groups (id, name) VALUES (?1, ?2)",
                (id, name),
            )?;
            Ok(())
        })
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                (group_id, user_id),
            )?;
            Ok(())
        })
    }

    /// Group row plus its members in join order.
    pub fn get_group_with_members(&self, id: &str) -> Result<Option<(GroupRow, Vec<MemberRow>)>> {
        self.with_conn(|conn| {
            let Some(group) = query_group(conn, id)? else {
                return Ok(None);
            };
            let members = query_members(conn, id)?;
            Ok(Some((group, members)))
        })
    }

    // -- Chat logs --

    pub fn insert_log(&self, table: LogTable, record: &ChatLogRecord) -> Result<()> {
        let media = serde_json::to_string(&record.media)?;
        let placeholders = serde_json::to_string(&record.placeholders)?;
        let sql = format!(
            "INSERT INTO {} (id, target_id, author_id, author_name, content_kind, content_id, body, media, placeholders, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            table.name()
        );

        self.with_conn(|conn| {
            conn.execute(
                &sql,
                rusqlite::params![
                    record.id,
                    record.target_id.as_str(),
                    record.author_id.as_str(),
                    record.author_name,
                    record.content_kind.as_str(),
                    record.content_id,
                    record.body,
                    media,
                    placeholders,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_log(&self, table: LogTable, id: &str) -> Result<Option<ChatLogRow>> {
        self.with_conn(|conn| query_log(conn, table, id))
    }

    pub fn count_logs(&self, table: LogTable) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", table.name()),
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn query_user(conn: &Connection, identity: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, email, push_token FROM users
         WHERE id = ?1 OR email = ?1
         ORDER BY (id = ?1) DESC
         LIMIT 1",
    )?;

    let row = stmt
        .query_row([identity], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                email: row.get(2)?,
                push_token: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_group(conn: &Connection, id: &str) -> Result<Option<GroupRow>> {
    let row = conn
        .query_row("SELECT id, name FROM chat_groups WHERE id = ?1", [id], |row| {
            Ok(GroupRow {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_members(conn: &Connection, group_id: &str) -> Result<Vec<MemberRow>> {
    // JOIN users so push tokens come back with the membership in one query
    let mut stmt = conn.prepare(
        "SELECT m.user_id, u.push_token
         FROM group_members m
         LEFT JOIN users u ON m.user_id = u.id
         WHERE m.group_id = ?1
         ORDER BY m.rowid",
    )?;

    let rows = stmt
        .query_map([group_id], |row| {
            Ok(MemberRow {
                user_id: row.get(0)?,
                push_token: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn query_log(conn: &Connection, table: LogTable, id: &str) -> Result<Option<ChatLogRow>> {
    let sql = format!(
        "SELECT id, target_id, author_id, author_name, content_kind, content_id, body, media, placeholders, created_at
         FROM {} WHERE id = ?1",
        table.name()
    );

    let row = conn
        .query_row(&sql, [id], |row| {
            Ok(ChatLogRow {
                id: row.get(0)?,
                target_id: row.get(1)?,
                author_id: row.get(2)?,
                author_name: row.get(3)?,
                content_kind: row.get(4)?,
                content_id: row.get(5)?,
                body: row.get(6)?,
                media: row.get(7)?,
                placeholders: row.get(8)?,
                created_at: row.get(9)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
