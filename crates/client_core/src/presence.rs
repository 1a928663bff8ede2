//! Last-known online/offline state per peer.
//!
//! The cache is eventually consistent: batch queries and push events both
//! overwrite it, last write wins by local arrival order, and entries stay
//! valid until overwritten. A peer never observed is reported offline.

use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::UserId,
    protocol::{ServerPush, UserStatus},
};
use tokio::{
    sync::{broadcast, RwLock},
    task::JoinHandle,
};
use tracing::warn;

use crate::{router::PushRouter, transport::Transport};

const PRESENCE_CHANNEL_CAPACITY: usize = 256;

pub struct PresenceTracker {
    transport: Arc<Transport>,
    cache: RwLock<HashMap<UserId, bool>>,
    changes: broadcast::Sender<UserStatus>,
}

impl PresenceTracker {
    pub fn new(transport: Arc<Transport>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(PRESENCE_CHANNEL_CAPACITY);
        Arc::new(Self {
            transport,
            cache: RwLock::new(HashMap::new()),
            changes,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserStatus> {
        self.changes.subscribe()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.cache
            .read()
            .await
            .get(&user_id)
            .copied()
            .unwrap_or(false)
    }

    /// Cached statuses for `user_ids`, defaulting to offline.
    pub async fn snapshot(&self, user_ids: &[UserId]) -> HashMap<UserId, bool> {
        let cache = self.cache.read().await;
        user_ids
            .iter()
            .map(|id| (*id, cache.get(id).copied().unwrap_or(false)))
            .collect()
    }

    /// Batch-refresh presence over the duplex channel, then report the
    /// cache. A failed batch call is logged and swallowed, leaving the
    /// affected entries at their prior value.
    pub async fn refresh(&self, user_ids: &[UserId]) -> HashMap<UserId, bool> {
        if self.transport.is_connected() && !user_ids.is_empty() {
            match self.transport.users_status(user_ids).await {
                Ok(statuses) => {
                    let mut cache = self.cache.write().await;
                    for status in statuses {
                        cache.insert(status.user_id, status.is_online);
                    }
                }
                Err(err) => warn!("presence: batch status refresh failed: {err}"),
            }
        }
        self.snapshot(user_ids).await
    }

    pub(crate) async fn apply(&self, user_id: UserId, is_online: bool) {
        self.cache.write().await.insert(user_id, is_online);
        let _ = self.changes.send(UserStatus { user_id, is_online });
    }

    /// Fold `user_status_changed` pushes into the cache, whoever originally
    /// populated the entries.
    pub fn spawn_push_listener(self: &Arc<Self>, router: &PushRouter) -> JoinHandle<()> {
        let mut events = router.subscribe();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ServerPush::UserStatusChanged { user_id, is_online }) => {
                        tracker.apply(user_id, is_online).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence: push stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
