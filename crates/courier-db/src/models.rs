//! Database row types — these map directly to SQLite rows.
//! Distinct from the courier-types wire models to keep the DB layer independent.

use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
    pub last_seen: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub user_id: i64,
    pub display_name: String,
    pub about: String,
    pub phone: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FriendRequestRow {
    pub id: i64,
    pub from_user: i64,
    pub to_user: i64,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl FriendRequestRow {
    pub const PENDING: &'static str = "pending";
    pub const ACCEPTED: &'static str = "accepted";
    pub const DECLINED: &'static str = "declined";
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: i64,
    pub sender: i64,
    pub receiver: i64,
    pub content: String,
    pub timestamp: String,
    /// Stored object name under the chat attachments directory.
    pub attachment: Option<String>,
    /// Original client filename, kept for display and MIME guessing.
    pub attachment_name: Option<String>,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ReactionRow {
    pub id: i64,
    pub message_id: i64,
    pub user_id: i64,
    pub emoji: String,
    pub created_at: String,
}

/// Parse a stored RFC 3339 timestamp, falling back to the epoch on corrupt
/// data rather than failing the whole projection.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}
