use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// JWT claims shared across courier-api (REST middleware) and courier-gateway
/// (WebSocket authentication). Canonical definition lives here in courier-types
/// to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    /// Username or email address.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user_id: i64,
    pub username: String,
    pub token: String,
}

/// Short-lived token for the WebSocket handshake query string.
#[derive(Debug, Serialize, Deserialize)]
pub struct WsTokenResponse {
    pub ws_token: String,
    pub expires_in_secs: u64,
}

// -- Users & profiles --

/// Sender/receiver projection embedded in every message document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub about: String,
    pub phone: String,
    pub avatar_url: Option<String>,
}

/// Directory entry: a user plus the caller's relationship to them.
#[derive(Debug, Serialize)]
pub struct DirectoryEntry {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub friend_status: FriendStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendStatus {
    None,
    Outgoing,
    Incoming,
    Friends,
    Declined,
}

// -- Friend requests --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateFriendRequest {
    pub to_user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RespondFriendRequest {
    /// "accept" or "decline".
    pub action: String,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestView {
    pub id: i64,
    pub from_user: UserSummary,
    pub to_user: UserSummary,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FriendRequestsResponse {
    pub incoming: Vec<FriendRequestView>,
    pub outgoing: Vec<FriendRequestView>,
}

// -- Messages --

/// Canonical wire projection of a message. The realtime fan-out path and the
/// HTTP history path both emit exactly this shape for a given message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDocument {
    pub id: i64,
    pub sender: UserSummary,
    pub receiver: UserSummary,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_type: Option<String>,
    pub reactions: Vec<ReactionGroup>,
}

/// Reactions grouped by emoji, in first-seen order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<i64>,
}
