//! Per-connection WebSocket session for a one-to-one conversation.
//!
//! Lifecycle: authenticate from the handshake query string, verify the
//! friendship gate, join the conversation room plus the personal and presence
//! groups, then run split send/receive tasks until either side closes.
//! Application close codes: 4401 (bad credential), 4403 (not friends).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use courier_db::Database;
use courier_db::attachments::AttachmentStore;
use courier_types::events::{ClientFrame, ServerEvent};

use crate::auth::{self, AuthError, CLOSE_NOT_FRIENDS, CLOSE_UNAUTHENTICATED};
use crate::bus::{Bus, PRESENCE_GROUP, personal_group, room_for_users};
use crate::ops::{self, OpError};
use crate::presence::PresenceRegistry;
use crate::serialize;

/// Internal-error close code (RFC 6455).
const CLOSE_INTERNAL: u16 = 1011;

/// Shared realtime state, cloned into every session and into the HTTP
/// handlers that publish events.
#[derive(Clone)]
pub struct Gateway {
    pub db: Arc<Database>,
    pub store: Arc<AttachmentStore>,
    pub bus: Bus,
    pub presence: PresenceRegistry,
    pub jwt_secret: String,
    pub public_scheme: String,
}

/// Drive an upgraded socket for a conversation with `other_user_id`.
/// `params` is the handshake query string; `origin` absolutizes media URLs in
/// outbound documents.
pub async fn handle_socket(
    socket: WebSocket,
    gateway: Gateway,
    other_user_id: i64,
    params: HashMap<String, String>,
    origin: String,
) {
    let user_id = match auth::authenticate(&gateway.jwt_secret, &params) {
        Ok(id) => id,
        Err(AuthError::Unauthenticated | AuthError::NotFriends) => {
            warn!("rejecting unauthenticated socket for conversation with {}", other_user_id);
            close_with(socket, CLOSE_UNAUTHENTICATED, "unauthenticated").await;
            return;
        }
    };

    let username = {
        let db = gateway.db.clone();
        match tokio::task::spawn_blocking(move || db.get_user_by_id(user_id)).await {
            Ok(Ok(Some(user))) => user.username,
            Ok(Ok(None)) => {
                warn!("token maps to missing user {}", user_id);
                close_with(socket, CLOSE_UNAUTHENTICATED, "unauthenticated").await;
                return;
            }
            Ok(Err(e)) => {
                error!("user lookup failed for {}: {}", user_id, e);
                close_with(socket, CLOSE_INTERNAL, "internal error").await;
                return;
            }
            Err(e) => {
                error!("user lookup task failed: {}", e);
                close_with(socket, CLOSE_INTERNAL, "internal error").await;
                return;
            }
        }
    };

    let friends = {
        let db = gateway.db.clone();
        match tokio::task::spawn_blocking(move || db.are_friends(user_id, other_user_id)).await {
            Ok(Ok(friends)) => friends,
            Ok(Err(e)) => {
                error!("friendship check failed for {} <-> {}: {}", user_id, other_user_id, e);
                close_with(socket, CLOSE_INTERNAL, "internal error").await;
                return;
            }
            Err(e) => {
                error!("friendship check task failed: {}", e);
                close_with(socket, CLOSE_INTERNAL, "internal error").await;
                return;
            }
        }
    };
    if !friends {
        info!("{} ({}) refused conversation with {}: not friends", username, user_id, other_user_id);
        close_with(socket, CLOSE_NOT_FRIENDS, "not friends").await;
        return;
    }

    let room = room_for_users(user_id, other_user_id);
    info!("{} ({}) connected to {}", username, user_id, room);

    // Membership is fixed for the life of the session: the conversation room,
    // this user's personal group, and the global presence group.
    let mut room_rx = gateway.bus.join(&room).await;
    let mut personal_rx = gateway.bus.join(&personal_group(user_id)).await;
    let mut presence_rx = gateway.bus.join(PRESENCE_GROUP).await;

    gateway.presence.add(user_id).await;
    gateway
        .bus
        .publish(PRESENCE_GROUP, ServerEvent::Presence { user: user_id, online: true })
        .await;

    let (mut sender, receiver) = socket.split();

    // Snapshot goes only to the joining connection, before any live events.
    let sync = ServerEvent::PresenceSync {
        users: gateway.presence.snapshot().await,
    };
    if send_event(&mut sender, &sync).await.is_err() {
        disconnect(&gateway, user_id, &username).await;
        return;
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                result = room_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("room receiver lagged by {} events", n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = personal_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("personal receiver lagged by {} events", n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = presence_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(RecvError::Lagged(n)) => {
                            warn!("presence receiver lagged by {} events", n);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let session = Session {
        gateway: gateway.clone(),
        user_id,
        username: username.clone(),
        other_user_id,
        room,
        origin,
    };
    let mut recv_task = tokio::spawn(run_recv_loop(receiver, session));

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    disconnect(&gateway, user_id, &username).await;
}

async fn run_recv_loop(mut receiver: SplitStream<WebSocket>, session: Session) {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => session.handle_frame(frame).await,
                Err(e) => {
                    // Older clients send untagged `{"content": "..."}` frames.
                    let fallback = serde_json::from_str::<serde_json::Value>(&text)
                        .ok()
                        .and_then(|v| v.get("content")?.as_str().map(str::to_string));
                    match fallback {
                        Some(content) => session.handle_frame(ClientFrame::Content { content }).await,
                        None => {
                            warn!(
                                "{} ({}) bad frame: {} -- raw: {}",
                                session.username,
                                session.user_id,
                                e,
                                truncate_for_log(&text, 200)
                            );
                        }
                    }
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
}

struct Session {
    gateway: Gateway,
    user_id: i64,
    username: String,
    other_user_id: i64,
    room: String,
    origin: String,
}

impl Session {
    async fn handle_frame(&self, frame: ClientFrame) {
        match frame {
            ClientFrame::Typing => {
                self.publish_room(ServerEvent::Typing { user: self.user_id }).await;
            }

            ClientFrame::Delivered { message_id } => {
                // The room ack goes out unconditionally; only the
                // personal-group copies need the participant lookup.
                let event = ServerEvent::Delivered { user: self.user_id, message_id };
                self.publish_room(event.clone()).await;
                match ops::message_participants(&self.gateway.db, message_id).await {
                    Ok((sender, receiver)) => {
                        for target in [sender, receiver] {
                            self.gateway.bus.publish(&personal_group(target), event.clone()).await;
                        }
                    }
                    Err(e) => self.log_op_error("delivered", e),
                }
            }

            ClientFrame::Read { last_read } => {
                let event = ServerEvent::Read { user: self.user_id, last_read };
                self.publish_room(event.clone()).await;
                for target in [self.user_id, self.other_user_id] {
                    self.gateway.bus.publish(&personal_group(target), event.clone()).await;
                }
            }

            ClientFrame::Edit { message_id, content } => {
                let content = content.trim();
                if content.is_empty() {
                    debug!("{} ({}) sent empty edit for {}", self.username, self.user_id, message_id);
                    return;
                }
                match ops::edit_message(&self.gateway.db, self.user_id, message_id, content).await {
                    Ok(row) => self.publish_updated(row).await,
                    Err(e) => self.log_op_error("edit", e),
                }
            }

            ClientFrame::Delete { message_id } => {
                match ops::soft_delete_message(
                    &self.gateway.db,
                    &self.gateway.store,
                    self.user_id,
                    message_id,
                )
                .await
                {
                    Ok(row) => self.publish_updated(row).await,
                    Err(e) => self.log_op_error("delete", e),
                }
            }

            ClientFrame::React { message_id, emoji } => {
                let emoji = emoji.trim().to_string();
                if emoji.is_empty() {
                    return;
                }
                match ops::toggle_reaction(&self.gateway.db, self.user_id, message_id, &emoji).await
                {
                    Ok(action) => {
                        self.publish_room(ServerEvent::Reaction {
                            message_id,
                            emoji,
                            user: self.user_id,
                            action,
                        })
                        .await;
                    }
                    Err(e) => self.log_op_error("react", e),
                }
            }

            ClientFrame::Content { content } => {
                let content = content.trim();
                let row = match ops::create_message(
                    &self.gateway.db,
                    self.user_id,
                    self.other_user_id,
                    content,
                    None,
                )
                .await
                {
                    Ok(row) => row,
                    Err(e) => return self.log_op_error("send", e),
                };
                let doc = match serialize::message_document(
                    &self.gateway.db,
                    row,
                    self.origin.clone(),
                )
                .await
                {
                    Ok(doc) => doc,
                    Err(e) => {
                        error!("failed to project message: {}", e);
                        return;
                    }
                };
                self.publish_room(ServerEvent::Message { data: doc.clone() }).await;
                self.gateway
                    .bus
                    .publish(
                        &personal_group(self.other_user_id),
                        ServerEvent::Sidebar { data: doc },
                    )
                    .await;
            }
        }
    }

    /// Re-serialize the mutated message and fan the full document out to the
    /// room, so every client converges on the same state.
    async fn publish_updated(&self, row: courier_db::models::MessageRow) {
        match serialize::message_document(&self.gateway.db, row, self.origin.clone()).await {
            Ok(doc) => self.publish_room(ServerEvent::MessageUpdated { data: doc }).await,
            Err(e) => error!("failed to project updated message: {}", e),
        }
    }

    async fn publish_room(&self, event: ServerEvent) {
        self.gateway.bus.publish(&self.room, event).await;
    }

    fn log_op_error(&self, op: &str, err: OpError) {
        match err {
            OpError::Storage(e) => {
                error!("{} ({}) {} failed: {}", self.username, self.user_id, op, e);
            }
            other => {
                debug!("{} ({}) {} rejected: {}", self.username, self.user_id, op, other);
            }
        }
    }
}

/// Teardown is best-effort: each step runs even if an earlier one fails.
async fn disconnect(gateway: &Gateway, user_id: i64, username: &str) {
    gateway.presence.remove(user_id).await;
    gateway
        .bus
        .publish(PRESENCE_GROUP, ServerEvent::Presence { user: user_id, online: false })
        .await;

    let db = gateway.db.clone();
    let result =
        tokio::task::spawn_blocking(move || db.touch_last_seen(user_id, &courier_db::now_string()))
            .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("failed to record last_seen for {}: {}", user_id, e),
        Err(e) => warn!("last_seen task failed for {}: {}", user_id, e),
    }

    info!("{} ({}) disconnected", username, user_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).expect("events serialize");
    sender.send(Message::Text(text.into())).await
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    // The peer may already be gone; nothing to do about a failed close.
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Truncate on a char boundary so multi-byte input can't panic the logger.
fn truncate_for_log(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
