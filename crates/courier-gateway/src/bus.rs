//! In-process broadcast bus: named publish/subscribe groups.
//!
//! Each group is backed by a `tokio::sync::broadcast` channel, so every
//! subscriber of a group sees that group's publishes in the same order.
//! No ordering holds across different groups. A distributed deployment would
//! swap this type for one backed by a shared external bus; everything above
//! it only touches `join` and `publish`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};

use courier_types::events::ServerEvent;

/// Global group every connection joins for online/offline updates.
pub const PRESENCE_GROUP: &str = "presence";

const GROUP_CAPACITY: usize = 256;

/// Conversation room name for an unordered user pair. Both participants'
/// sessions compute the same name regardless of connection order.
pub fn room_for_users(a: i64, b: i64) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("chat_{}_{}", lo, hi)
}

/// Per-user group for notifications outside the active room (sidebar
/// updates, delivery/read acks, friend requests).
pub fn personal_group(user_id: i64) -> String {
    format!("user_{}", user_id)
}

#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    groups: RwLock<HashMap<String, broadcast::Sender<ServerEvent>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Join a group. Membership lasts as long as the returned receiver lives;
    /// leaving is dropping it.
    pub async fn join(&self, group: &str) -> broadcast::Receiver<ServerEvent> {
        let mut groups = self.inner.groups.write().await;
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to every current member of a group. Publishing to a
    /// group with no members is a no-op.
    pub async fn publish(&self, group: &str, event: ServerEvent) {
        let delivered = {
            let groups = self.inner.groups.read().await;
            match groups.get(group) {
                Some(tx) => tx.send(event).is_ok(),
                None => return,
            }
        };

        if !delivered {
            // Last member left; drop the empty group.
            let mut groups = self.inner.groups.write().await;
            if groups.get(group).is_some_and(|tx| tx.receiver_count() == 0) {
                groups.remove(group);
            }
        }
    }

    /// Number of live groups, used by tests and diagnostics.
    pub async fn group_count(&self) -> usize {
        self.inner.groups.read().await.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
