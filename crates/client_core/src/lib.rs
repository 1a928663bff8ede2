//! Realtime conversation synchronization client.
//!
//! Keeps a user's conversation list, unread counters, and peer presence
//! consistent across a persistent duplex connection, a REST fallback path,
//! and locally applied optimistic state.

use std::sync::Arc;

use shared::domain::UserId;
use tokio::task::JoinHandle;
use tracing::info;

pub mod auth;
pub mod conversations;
pub mod error;
pub mod presence;
pub mod request;
pub mod rest;
pub mod router;
pub mod transport;

pub use auth::{PersistentTokenStore, SessionTokenStore, TokenStore};
pub use conversations::{
    AvatarDescriptor, ConversationEntry, ConversationList, ListUpdate, LoadState,
    DELETED_USER_NAME, NO_MESSAGE_PLACEHOLDER,
};
pub use error::ClientError;
pub use presence::PresenceTracker;
pub use rest::RestClient;
pub use router::PushRouter;
pub use transport::Transport;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
}

/// Process-wide context holding the shared resources every consumer needs:
/// the one transport session, the push router, the presence cache, and the
/// REST fallback. Constructed once and passed by reference; never ambient.
pub struct RealtimeContext {
    pub transport: Arc<Transport>,
    pub router: PushRouter,
    pub presence: Arc<PresenceTracker>,
    pub rest: Arc<RestClient>,
    tokens: Arc<dyn TokenStore>,
    presence_task: JoinHandle<()>,
}

impl RealtimeContext {
    /// Must be called from within a tokio runtime: the presence tracker's
    /// push listener starts here.
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenStore>) -> Arc<Self> {
        let router = PushRouter::new();
        let transport = Transport::new(&config.server_url, Arc::clone(&tokens), router.clone());
        let presence = PresenceTracker::new(Arc::clone(&transport));
        let presence_task = presence.spawn_push_listener(&router);
        let rest = Arc::new(RestClient::new(&config.server_url, Arc::clone(&tokens)));
        Arc::new(Self {
            transport,
            router,
            presence,
            rest,
            tokens,
            presence_task,
        })
    }

    /// Open the duplex channel for the signed-in user.
    pub async fn sign_in(&self, user_id: UserId) -> Result<(), ClientError> {
        self.transport.connect(user_id).await
    }

    /// Explicit teardown: close the channel and forget the credentials.
    pub async fn sign_out(&self) {
        self.transport.disconnect().await;
        self.tokens.clear();
        info!("context: signed out");
    }
}

impl Drop for RealtimeContext {
    fn drop(&mut self) {
        self.presence_task.abort();
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

