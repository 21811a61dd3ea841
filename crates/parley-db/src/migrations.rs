use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            email       TEXT UNIQUE,
            push_token  TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chat_groups (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS group_members (
            group_id    TEXT NOT NULL REFERENCES chat_groups(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(group_id, user_id)
        );

        -- Chat logs are append-only documents; targets are not foreign keys
        -- so history survives account and group removal.
        CREATE TABLE IF NOT EXISTS peer_logs (
            id              TEXT PRIMARY KEY,
            target_id       TEXT NOT NULL,
            author_id       TEXT NOT NULL,
            author_name     TEXT NOT NULL,
            content_kind    TEXT NOT NULL,
            content_id      TEXT NOT NULL,
            body            TEXT NOT NULL,
            media           TEXT NOT NULL DEFAULT '[]',
            placeholders    TEXT NOT NULL DEFAULT '[]',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_peer_logs_pair
            ON peer_logs(target_id, author_id, created_at);

        CREATE TABLE IF NOT EXISTS group_logs (
            id              TEXT PRIMARY KEY,
            target_id       TEXT NOT NULL,
            author_id       TEXT NOT NULL,
            author_name     TEXT NOT NULL,
            content_kind    TEXT NOT NULL,
            content_id      TEXT NOT NULL,
            body            TEXT NOT NULL,
            media           TEXT NOT NULL DEFAULT '[]',
            placeholders    TEXT NOT NULL DEFAULT '[]',
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_group_logs_group
            ON group_logs(target_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
