//! Canonical message projection.
//!
//! The realtime fan-out path and the HTTP history path both go through
//! `document_from_parts`, so a given message serializes to exactly the same
//! JSON on both. URL absolutization needs an origin: HTTP handlers derive it
//! from the request's Host header, sessions from the WebSocket handshake's.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::http::{HeaderMap, header};

use courier_db::Database;
use courier_db::attachments::{AVATARS, AttachmentStore, CHAT_ATTACHMENTS};
use courier_db::models::{MessageRow, ProfileRow, ReactionRow, UserRow, parse_timestamp};
use courier_types::api::{MessageDocument, ReactionGroup, UserSummary};

const FALLBACK_ORIGIN: &str = "http://127.0.0.1:8000";

/// Reconstruct the request origin from a Host header and configured scheme.
pub fn origin_from_headers(headers: &HeaderMap, scheme: &str) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if host.is_empty() {
        FALLBACK_ORIGIN.to_string()
    } else {
        format!("{}://{}", scheme, host)
    }
}

pub fn absolutize(origin: &str, path: &str) -> String {
    let base = origin.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Project a user (plus optional profile) into the summary embedded in
/// message documents. Display name falls back to the username.
pub fn user_summary(user: &UserRow, profile: Option<&ProfileRow>, origin: &str) -> UserSummary {
    let display_name = profile
        .map(|p| p.display_name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| user.username.clone());

    let avatar_url = profile
        .and_then(|p| p.avatar.as_deref())
        .map(|stored| absolutize(origin, &AttachmentStore::public_path(AVATARS, stored)));

    UserSummary {
        id: user.id,
        username: user.username.clone(),
        display_name,
        avatar_url,
    }
}

/// Group reactions by emoji in first-seen order.
pub fn group_reactions(rows: &[ReactionRow]) -> Vec<ReactionGroup> {
    let mut groups: Vec<ReactionGroup> = Vec::new();
    for row in rows {
        match groups.iter_mut().find(|g| g.emoji == row.emoji) {
            Some(group) => {
                group.count += 1;
                group.users.push(row.user_id);
            }
            None => groups.push(ReactionGroup {
                emoji: row.emoji.clone(),
                count: 1,
                users: vec![row.user_id],
            }),
        }
    }
    groups
}

fn document_from_parts(
    row: &MessageRow,
    sender: UserSummary,
    receiver: UserSummary,
    reactions: Vec<ReactionGroup>,
    origin: &str,
) -> MessageDocument {
    let attachment_url = row
        .attachment
        .as_deref()
        .map(|stored| absolutize(origin, &AttachmentStore::public_path(CHAT_ATTACHMENTS, stored)));
    let attachment_name = row.attachment.as_ref().and_then(|_| row.attachment_name.clone());
    let attachment_type = attachment_name
        .as_deref()
        .and_then(|name| mime_guess::from_path(name).first_raw())
        .map(str::to_string);

    MessageDocument {
        id: row.id,
        sender,
        receiver,
        content: row.content.clone(),
        timestamp: parse_timestamp(&row.timestamp),
        is_edited: row.is_edited,
        edited_at: row.edited_at.as_deref().map(parse_timestamp),
        is_deleted: row.is_deleted,
        attachment_url,
        attachment_name,
        attachment_type,
        reactions,
    }
}

/// Synchronous projection, for callers already on the blocking pool.
pub fn blocking_message_document(
    db: &Database,
    row: &MessageRow,
    origin: &str,
) -> Result<MessageDocument> {
    let sender = load_summary(db, row.sender, origin)?;
    let receiver = load_summary(db, row.receiver, origin)?;
    let reactions = group_reactions(&db.reactions_for_messages(&[row.id])?);
    Ok(document_from_parts(row, sender, receiver, reactions, origin))
}

/// Async projection for the realtime path.
pub async fn message_document(
    db: &Arc<Database>,
    row: MessageRow,
    origin: String,
) -> Result<MessageDocument> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || blocking_message_document(&db, &row, &origin))
        .await
        .context("projection task failed")?
}

/// Batch projection for a conversation listing: user summaries are fetched
/// once per participant and reactions once for the whole page.
pub fn blocking_conversation_documents(
    db: &Database,
    rows: &[MessageRow],
    origin: &str,
) -> Result<Vec<MessageDocument>> {
    let mut summaries: HashMap<i64, UserSummary> = HashMap::new();
    for row in rows {
        for user_id in [row.sender, row.receiver] {
            if !summaries.contains_key(&user_id) {
                summaries.insert(user_id, load_summary(db, user_id, origin)?);
            }
        }
    }

    let message_ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let mut by_message: HashMap<i64, Vec<ReactionRow>> = HashMap::new();
    for reaction in db.reactions_for_messages(&message_ids)? {
        by_message.entry(reaction.message_id).or_default().push(reaction);
    }

    rows.iter()
        .map(|row| {
            let sender = summaries
                .get(&row.sender)
                .cloned()
                .ok_or_else(|| anyhow!("missing summary for user {}", row.sender))?;
            let receiver = summaries
                .get(&row.receiver)
                .cloned()
                .ok_or_else(|| anyhow!("missing summary for user {}", row.receiver))?;
            let reactions = group_reactions(
                by_message.get(&row.id).map(Vec::as_slice).unwrap_or_default(),
            );
            Ok(document_from_parts(row, sender, receiver, reactions, origin))
        })
        .collect()
}

fn load_summary(db: &Database, user_id: i64, origin: &str) -> Result<UserSummary> {
    let user = db
        .get_user_by_id(user_id)?
        .ok_or_else(|| anyhow!("user {} referenced by message is missing", user_id))?;
    let profile = db.get_profile(user_id)?;
    Ok(user_summary(&user, profile.as_ref(), origin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_db::now_string;

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        let now = now_string();
        db.create_user("alice", "", "hash", &now).unwrap();
        db.create_user("bob", "", "hash", &now).unwrap();
        db.create_profile(1, &now).unwrap();
        db.create_profile(2, &now).unwrap();
        db
    }

    #[test]
    fn origin_reconstruction_and_fallback() {
        let mut headers = HeaderMap::new();
        assert_eq!(origin_from_headers(&headers, "http"), FALLBACK_ORIGIN);

        headers.insert(header::HOST, "chat.example.com:8443".parse().unwrap());
        assert_eq!(
            origin_from_headers(&headers, "https"),
            "https://chat.example.com:8443"
        );
    }

    #[test]
    fn summary_prefers_profile_display_name_and_absolutizes_avatar() {
        let db = seeded();
        db.update_profile(1, Some("Alice W."), None, None).unwrap();
        db.set_avatar(1, "a1.png").unwrap();

        let doc = {
            let row = db.insert_message(1, 2, "hi", None, &now_string()).unwrap();
            blocking_message_document(&db, &row, "http://h.test").unwrap()
        };
        assert_eq!(doc.sender.display_name, "Alice W.");
        assert_eq!(
            doc.sender.avatar_url.as_deref(),
            Some("http://h.test/media/avatars/a1.png")
        );
        // Bob has no profile customization.
        assert_eq!(doc.receiver.display_name, "bob");
        assert!(doc.receiver.avatar_url.is_none());
    }

    #[test]
    fn attachment_fields_are_null_or_fully_populated() {
        let db = seeded();
        let now = now_string();

        let plain = db.insert_message(1, 2, "text only", None, &now).unwrap();
        let doc = blocking_message_document(&db, &plain, "http://h.test").unwrap();
        assert!(doc.attachment_url.is_none());
        assert!(doc.attachment_name.is_none());
        assert!(doc.attachment_type.is_none());

        let with_file = db
            .insert_message(1, 2, "", Some(("x9.png", "cat.png")), &now)
            .unwrap();
        let doc = blocking_message_document(&db, &with_file, "http://h.test").unwrap();
        assert_eq!(
            doc.attachment_url.as_deref(),
            Some("http://h.test/media/chat/attachments/x9.png")
        );
        assert_eq!(doc.attachment_name.as_deref(), Some("cat.png"));
        assert_eq!(doc.attachment_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn reactions_group_in_first_seen_order() {
        let db = seeded();
        let now = now_string();
        let msg = db.insert_message(1, 2, "hi", None, &now).unwrap();
        db.toggle_reaction(msg.id, 1, "👍", &now).unwrap();
        db.toggle_reaction(msg.id, 2, "❤️", &now).unwrap();
        db.toggle_reaction(msg.id, 2, "👍", &now).unwrap();

        let doc = blocking_message_document(&db, &msg, "http://h.test").unwrap();
        assert_eq!(doc.reactions.len(), 2);
        assert_eq!(doc.reactions[0].emoji, "👍");
        assert_eq!(doc.reactions[0].count, 2);
        assert_eq!(doc.reactions[0].users, vec![1, 2]);
        assert_eq!(doc.reactions[1].emoji, "❤️");
        assert_eq!(doc.reactions[1].users, vec![2]);
    }

    #[test]
    fn single_and_batch_projections_are_byte_identical() {
        let db = seeded();
        let now = now_string();
        let a = db.insert_message(1, 2, "one", None, &now).unwrap();
        let b = db
            .insert_message(2, 1, "two", Some(("f.pdf", "file.pdf")), &now)
            .unwrap();
        db.toggle_reaction(a.id, 2, "👍", &now).unwrap();

        let origin = "http://h.test";
        let rows = db.conversation(1, 2).unwrap();
        let batch = blocking_conversation_documents(&db, &rows, origin).unwrap();

        for (row, batched) in [a, b].iter().zip(&batch) {
            let single = blocking_message_document(&db, row, origin).unwrap();
            assert_eq!(
                serde_json::to_string(&single).unwrap(),
                serde_json::to_string(batched).unwrap()
            );
        }
    }
}
