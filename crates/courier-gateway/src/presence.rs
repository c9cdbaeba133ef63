//! Process-wide online-user registry.
//!
//! Owned by the server at startup and handed to every session; mutated only
//! through the connect/disconnect lifecycle. Membership is a plain set, not a
//! per-user connection count: if a user holds two connections and one closes,
//! they are marked offline even though the other is still live. Known
//! limitation, kept to match the existing client contract.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone)]
pub struct PresenceRegistry {
    online: Arc<Mutex<HashSet<i64>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            online: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn add(&self, user_id: i64) {
        self.online.lock().await.insert(user_id);
    }

    /// Idempotent; removing an absent user is a no-op.
    pub async fn remove(&self, user_id: i64) {
        self.online.lock().await.remove(&user_id);
    }

    /// Consistent snapshot of everyone currently online, sorted for
    /// deterministic output.
    pub async fn snapshot(&self) -> Vec<i64> {
        let guard = self.online.lock().await;
        let mut users: Vec<i64> = guard.iter().copied().collect();
        users.sort_unstable();
        users
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
