use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, params};

use crate::Database;
use crate::models::{FriendRequestRow, MessageRow, ProfileRow, ReactionRow, UserRow};

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        now: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (username, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![username, email, password_hash, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, email, password, last_seen, created_at
                     FROM users WHERE id = ?1",
                    [id],
                    map_user,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Login lookup: the handle may be a username or an email address.
    pub fn get_user_by_handle(&self, handle: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, email, password, last_seen, created_at
                     FROM users
                     WHERE username = ?1 OR (email != '' AND email = ?1 COLLATE NOCASE)",
                    [handle],
                    map_user,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn list_users_except(&self, id: i64) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, email, password, last_seen, created_at
                 FROM users WHERE id != ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([id], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn touch_last_seen(&self, id: i64, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET last_seen = ?2 WHERE id = ?1", params![id, now])?;
            Ok(())
        })
    }

    // -- Profiles --

    pub fn create_profile(&self, user_id: i64, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, created_at) VALUES (?1, ?2)",
                params![user_id, now],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, user_id: i64) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, user_id))
    }

    pub fn update_profile(
        &self,
        user_id: i64,
        display_name: Option<&str>,
        about: Option<&str>,
        phone: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            if let Some(v) = display_name {
                conn.execute(
                    "UPDATE profiles SET display_name = ?2 WHERE user_id = ?1",
                    params![user_id, v],
                )?;
            }
            if let Some(v) = about {
                conn.execute(
                    "UPDATE profiles SET about = ?2 WHERE user_id = ?1",
                    params![user_id, v],
                )?;
            }
            if let Some(v) = phone {
                conn.execute(
                    "UPDATE profiles SET phone = ?2 WHERE user_id = ?1",
                    params![user_id, v],
                )?;
            }
            Ok(())
        })
    }

    pub fn set_avatar(&self, user_id: i64, stored_name: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE profiles SET avatar = ?2 WHERE user_id = ?1",
                params![user_id, stored_name],
            )?;
            Ok(())
        })
    }

    // -- Friend requests --

    /// Latest request between the unordered pair, in either direction.
    pub fn find_request_between(&self, a: i64, b: i64) -> Result<Option<FriendRequestRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, from_user, to_user, status, created_at, updated_at
                     FROM friend_requests
                     WHERE (from_user = ?1 AND to_user = ?2)
                        OR (from_user = ?2 AND to_user = ?1)
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![a, b],
                    map_friend_request,
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn create_friend_request(&self, from: i64, to: i64, now: &str) -> Result<FriendRequestRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friend_requests (from_user, to_user, status, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)",
                params![from, to, now],
            )?;
            let id = conn.last_insert_rowid();
            Ok(FriendRequestRow {
                id,
                from_user: from,
                to_user: to,
                status: FriendRequestRow::PENDING.to_string(),
                created_at: now.to_string(),
                updated_at: now.to_string(),
            })
        })
    }

    pub fn set_request_status(
        &self,
        id: i64,
        status: &str,
        now: &str,
    ) -> Result<Option<FriendRequestRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE friend_requests SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status, now],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let row = conn
                .query_row(
                    "SELECT id, from_user, to_user, status, created_at, updated_at
                     FROM friend_requests WHERE id = ?1",
                    [id],
                    map_friend_request,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Respond path: the request must be addressed to `to_user`.
    pub fn get_request_for_target(&self, id: i64, to_user: i64) -> Result<Option<FriendRequestRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, from_user, to_user, status, created_at, updated_at
                     FROM friend_requests WHERE id = ?1 AND to_user = ?2",
                    params![id, to_user],
                    map_friend_request,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Cancel path: only the requester may delete, and only while pending.
    pub fn delete_pending_request(&self, id: i64, from_user: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM friend_requests
                 WHERE id = ?1 AND from_user = ?2 AND status = 'pending'",
                params![id, from_user],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Remove a request outright, regardless of status. Used when a declined
    /// request is superseded by a fresh one between the same pair.
    pub fn remove_request(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM friend_requests WHERE id = ?1", [id])?;
            Ok(deleted > 0)
        })
    }

    pub fn pending_incoming(&self, user: i64) -> Result<Vec<FriendRequestRow>> {
        self.with_conn(|conn| query_pending(conn, "to_user", user))
    }

    pub fn pending_outgoing(&self, user: i64) -> Result<Vec<FriendRequestRow>> {
        self.with_conn(|conn| query_pending(conn, "from_user", user))
    }

    pub fn list_friends(&self, user: i64) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.email, u.password, u.last_seen, u.created_at
                 FROM friend_requests fr
                 JOIN users u ON u.id = CASE WHEN fr.from_user = ?1 THEN fr.to_user
                                             ELSE fr.from_user END
                 WHERE fr.status = 'accepted'
                   AND (fr.from_user = ?1 OR fr.to_user = ?1)
                 ORDER BY u.id",
            )?;
            let rows = stmt
                .query_map([user], map_user)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// True iff an accepted request exists between the pair in either direction.
    pub fn are_friends(&self, a: i64, b: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM friend_requests
                     WHERE status = 'accepted'
                       AND ((from_user = ?1 AND to_user = ?2)
                         OR (from_user = ?2 AND to_user = ?1))
                     LIMIT 1",
                    params![a, b],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        sender: i64,
        receiver: i64,
        content: &str,
        attachment: Option<(&str, &str)>,
        now: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let (stored, original) = match attachment {
                Some((s, o)) => (Some(s), Some(o)),
                None => (None, None),
            };
            conn.execute(
                "INSERT INTO messages (sender, receiver, content, timestamp, attachment, attachment_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![sender, receiver, content, now, stored, original],
            )?;
            let id = conn.last_insert_rowid();
            query_message(conn, id)?
                .ok_or_else(|| anyhow::anyhow!("message {} vanished after insert", id))
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// All messages between the pair, oldest first.
    pub fn conversation(&self, a: i64, b: i64) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender, receiver, content, timestamp, attachment, attachment_name,
                        is_edited, edited_at, is_deleted
                 FROM messages
                 WHERE (sender = ?1 AND receiver = ?2) OR (sender = ?2 AND receiver = ?1)
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![a, b], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn edit_message(&self, id: i64, content: &str, now: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1",
                params![id, content, now],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    /// Tombstone the message and clear every attachment reference. Releasing
    /// the stored objects themselves is the caller's job.
    pub fn soft_delete_message(&self, id: i64, now: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET content = ?2, is_deleted = 1, edited_at = ?3,
                     attachment = NULL, attachment_name = NULL
                 WHERE id = ?1",
                params![id, crate::TOMBSTONE, now],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if present, inserts if not.
    /// Returns true if inserted, false if removed. The UNIQUE(message, user,
    /// emoji) constraint absorbs a concurrent duplicate insert, and deleting
    /// an already-removed row is a no-op, so the outcome stays correct under
    /// racing toggles.
    pub fn toggle_reaction(
        &self,
        message_id: i64,
        user_id: i64,
        emoji: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                params![message_id, user_id, emoji],
            )?;
            if removed > 0 {
                return Ok(false);
            }
            conn.execute(
                "INSERT OR IGNORE INTO reactions (message_id, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![message_id, user_id, emoji, now],
            )?;
            Ok(true)
        })
    }

    /// Batch-fetch reactions for a set of message ids, in insertion order so
    /// emoji grouping preserves first-seen order.
    pub fn reactions_for_messages(&self, message_ids: &[i64]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at
                 FROM reactions WHERE message_id IN ({}) ORDER BY id",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(bind.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password: row.get(3)?,
        last_seen: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn map_friend_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRequestRow> {
    Ok(FriendRequestRow {
        id: row.get(0)?,
        from_user: row.get(1)?,
        to_user: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        receiver: row.get(2)?,
        content: row.get(3)?,
        timestamp: row.get(4)?,
        attachment: row.get(5)?,
        attachment_name: row.get(6)?,
        is_edited: row.get(7)?,
        edited_at: row.get(8)?,
        is_deleted: row.get(9)?,
    })
}

fn query_message(conn: &Connection, id: i64) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(
            "SELECT id, sender, receiver, content, timestamp, attachment, attachment_name,
                    is_edited, edited_at, is_deleted
             FROM messages WHERE id = ?1",
            [id],
            map_message,
        )
        .optional()?;
    Ok(row)
}

fn query_profile(conn: &Connection, user_id: i64) -> Result<Option<ProfileRow>> {
    let row = conn
        .query_row(
            "SELECT user_id, display_name, about, phone, avatar
             FROM profiles WHERE user_id = ?1",
            [user_id],
            |row| {
                Ok(ProfileRow {
                    user_id: row.get(0)?,
                    display_name: row.get(1)?,
                    about: row.get(2)?,
                    phone: row.get(3)?,
                    avatar: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn query_pending(conn: &Connection, column: &str, user: i64) -> Result<Vec<FriendRequestRow>> {
    let sql = format!(
        "SELECT id, from_user, to_user, status, created_at, updated_at
         FROM friend_requests WHERE {} = ?1 AND status = 'pending' ORDER BY id",
        column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user], map_friend_request)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
