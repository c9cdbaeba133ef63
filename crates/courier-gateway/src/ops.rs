//! Message lifecycle operations: create, edit, soft-delete, toggle-reaction.
//!
//! Every operation is scoped to the acting user and runs its storage work on
//! the blocking pool so a slow query never stalls the runtime. Fan-out of the
//! result is the caller's responsibility.

use std::sync::Arc;

use anyhow::anyhow;
use thiserror::Error;
use tracing::warn;

use courier_db::attachments::{AttachmentStore, CHAT_ATTACHMENTS};
use courier_db::models::MessageRow;
use courier_db::{Database, now_string};
use courier_types::events::ReactionAction;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("referenced record not found")]
    NotFound,
    #[error("actor does not own this message")]
    Forbidden,
    #[error("validation failed")]
    Validation,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

async fn blocking<T, F>(f: F) -> Result<T, OpError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, OpError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OpError::Storage(anyhow!("blocking task failed: {e}")))?
}

/// Create a message from `sender` to `receiver`. `text` is stored as given
/// (callers trim); it must be non-empty unless an attachment is present.
/// `attachment` is `(stored_name, original_name)`.
pub async fn create_message(
    db: &Arc<Database>,
    sender: i64,
    receiver: i64,
    text: &str,
    attachment: Option<(String, String)>,
) -> Result<MessageRow, OpError> {
    if text.trim().is_empty() && attachment.is_none() {
        return Err(OpError::Validation);
    }

    let db = db.clone();
    let text = text.to_string();
    blocking(move || {
        db.get_user_by_id(receiver)?.ok_or(OpError::NotFound)?;
        let attachment_ref = attachment
            .as_ref()
            .map(|(stored, original)| (stored.as_str(), original.as_str()));
        let row = db.insert_message(sender, receiver, &text, attachment_ref, &now_string())?;
        Ok(row)
    })
    .await
}

/// Edit a message's content. Only the original sender may edit. Empty content
/// is accepted here; non-empty validation lives at the inbound-frame layer.
pub async fn edit_message(
    db: &Arc<Database>,
    actor: i64,
    message_id: i64,
    new_text: &str,
) -> Result<MessageRow, OpError> {
    let db = db.clone();
    let new_text = new_text.to_string();
    blocking(move || {
        let msg = db.get_message(message_id)?.ok_or(OpError::NotFound)?;
        if msg.sender != actor {
            return Err(OpError::Forbidden);
        }
        db.edit_message(message_id, &new_text, &now_string())?
            .ok_or(OpError::NotFound)
    })
    .await
}

/// Soft-delete: tombstone the content and release every stored attachment
/// object. Each release is attempted independently; a failed release is
/// logged and never blocks the rest of the mutation.
pub async fn soft_delete_message(
    db: &Arc<Database>,
    store: &Arc<AttachmentStore>,
    actor: i64,
    message_id: i64,
) -> Result<MessageRow, OpError> {
    let db = db.clone();
    let store = store.clone();
    blocking(move || {
        let msg = db.get_message(message_id)?.ok_or(OpError::NotFound)?;
        if msg.sender != actor {
            return Err(OpError::Forbidden);
        }

        // Fixed schema of attachment-bearing fields on a message.
        let stored_objects = [msg.attachment.as_deref()];
        for stored in stored_objects.into_iter().flatten() {
            if let Err(e) = store.delete(CHAT_ATTACHMENTS, stored) {
                warn!("failed to release attachment {} of message {}: {}", stored, message_id, e);
            }
        }

        db.soft_delete_message(message_id, &now_string())?
            .ok_or(OpError::NotFound)
    })
    .await
}

/// Toggle an emoji reaction. Only a participant (sender or receiver) of the
/// message may react. The read-then-write window between lookup and toggle is
/// a known consistency boundary; the unique (message, user, emoji) constraint
/// keeps the added/removed outcome correct if two toggles race.
pub async fn toggle_reaction(
    db: &Arc<Database>,
    actor: i64,
    message_id: i64,
    emoji: &str,
) -> Result<ReactionAction, OpError> {
    let db = db.clone();
    let emoji = emoji.to_string();
    blocking(move || {
        let msg = db.get_message(message_id)?.ok_or(OpError::NotFound)?;
        if actor != msg.sender && actor != msg.receiver {
            return Err(OpError::Forbidden);
        }
        let added = db.toggle_reaction(message_id, actor, &emoji, &now_string())?;
        Ok(if added {
            ReactionAction::Added
        } else {
            ReactionAction::Removed
        })
    })
    .await
}

/// (sender, receiver) of a message, for delivery-ack targeting.
pub async fn message_participants(
    db: &Arc<Database>,
    message_id: i64,
) -> Result<(i64, i64), OpError> {
    let db = db.clone();
    blocking(move || {
        let msg = db.get_message(message_id)?.ok_or(OpError::NotFound)?;
        Ok((msg.sender, msg.receiver))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_db::TOMBSTONE;

    fn seeded_db() -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        let now = now_string();
        db.create_user("alice", "", "hash", &now).unwrap();
        db.create_user("bob", "", "hash", &now).unwrap();
        db.create_user("mallory", "", "hash", &now).unwrap();
        Arc::new(db)
    }

    fn temp_store() -> Arc<AttachmentStore> {
        let root = std::env::temp_dir().join(format!("courier-ops-{}", uuid::Uuid::new_v4()));
        Arc::new(AttachmentStore::open(&root).unwrap())
    }

    #[tokio::test]
    async fn create_rejects_empty_text_without_attachment() {
        let db = seeded_db();
        let err = create_message(&db, 1, 2, "   ", None).await.unwrap_err();
        assert!(matches!(err, OpError::Validation));

        // Attachment-only sends are fine.
        let row = create_message(&db, 1, 2, "", Some(("abc.png".into(), "cat.png".into())))
            .await
            .unwrap();
        assert_eq!(row.attachment.as_deref(), Some("abc.png"));
    }

    #[tokio::test]
    async fn create_requires_existing_receiver() {
        let db = seeded_db();
        let err = create_message(&db, 1, 99, "hi", None).await.unwrap_err();
        assert!(matches!(err, OpError::NotFound));
    }

    #[tokio::test]
    async fn only_sender_may_edit_or_delete() {
        let db = seeded_db();
        let store = temp_store();
        let msg = create_message(&db, 1, 2, "original", None).await.unwrap();

        let err = edit_message(&db, 2, msg.id, "hacked").await.unwrap_err();
        assert!(matches!(err, OpError::Forbidden));
        let err = soft_delete_message(&db, &store, 2, msg.id).await.unwrap_err();
        assert!(matches!(err, OpError::Forbidden));

        // Record unchanged after the rejected attempts.
        let unchanged = db.get_message(msg.id).unwrap().unwrap();
        assert_eq!(unchanged.content, "original");
        assert!(!unchanged.is_edited);
        assert!(!unchanged.is_deleted);

        let edited = edit_message(&db, 1, msg.id, "fixed").await.unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "fixed");

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn soft_delete_releases_attachment_and_is_idempotent() {
        let db = seeded_db();
        let store = temp_store();
        let stored = store.save(CHAT_ATTACHMENTS, "doc.pdf", b"pdf bytes").unwrap();
        let msg = create_message(&db, 1, 2, "", Some((stored.clone(), "doc.pdf".into())))
            .await
            .unwrap();

        let deleted = soft_delete_message(&db, &store, 1, msg.id).await.unwrap();
        assert_eq!(deleted.content, TOMBSTONE);
        assert!(deleted.is_deleted);
        assert!(deleted.attachment.is_none());
        assert!(!store.root().join(CHAT_ATTACHMENTS).join(&stored).exists());

        // Second delete: same tombstone state, no error from re-clearing.
        let again = soft_delete_message(&db, &store, 1, msg.id).await.unwrap();
        assert_eq!(again.content, TOMBSTONE);
        assert!(again.is_deleted);

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn toggle_reaction_inverse_and_participant_gate() {
        let db = seeded_db();
        let msg = create_message(&db, 1, 2, "react to me", None).await.unwrap();

        assert_eq!(
            toggle_reaction(&db, 2, msg.id, "🔥").await.unwrap(),
            ReactionAction::Added
        );
        assert_eq!(
            toggle_reaction(&db, 2, msg.id, "🔥").await.unwrap(),
            ReactionAction::Removed
        );

        // Mallory is neither sender nor receiver.
        let err = toggle_reaction(&db, 3, msg.id, "🔥").await.unwrap_err();
        assert!(matches!(err, OpError::Forbidden));
        assert!(db.reactions_for_messages(&[msg.id]).unwrap().is_empty());

        let err = toggle_reaction(&db, 1, 999, "🔥").await.unwrap_err();
        assert!(matches!(err, OpError::NotFound));
    }
}
