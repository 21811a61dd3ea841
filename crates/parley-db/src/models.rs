/// Database row types. These map directly to SQLite rows.
/// Distinct from parley-types models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub push_token: Option<String>,
}

pub struct GroupRow {
    pub id: String,
    pub name: String,
}

pub struct MemberRow {
    pub user_id: String,
    pub push_token: Option<String>,
}

pub struct ChatLogRow {
    pub id: String,
    pub target_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content_kind: String,
    pub content_id: String,
    pub body: String,
    pub media: String,
    pub placeholders: String,
    pub created_at: String,
}
