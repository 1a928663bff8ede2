//! Correlated request/response over the duplex channel.
//!
//! Each call is tagged with a monotonically increasing id, parked in a
//! pending map, and raced against a fixed timeout. The transport's read
//! loop completes the matching slot when the server echoes the id back.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, EventId, UserId},
    protocol::{
        CallFrame, CallResult, ClientCall, ConversationRecord, MessagePayload, UnreadCount,
        UserStatus,
    },
};
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::{error::ClientError, transport::Transport};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a correlation id and the slot its response will resolve.
    pub(crate) async fn register(&self) -> (u64, oneshot::Receiver<CallResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        (id, rx)
    }

    /// Resolve the pending slot for a server response, if one is still live.
    pub(crate) async fn complete(&self, result: CallResult) {
        let Some(tx) = self.pending.lock().await.remove(&result.id) else {
            warn!(
                request_id = result.id,
                "request: response arrived for no pending call"
            );
            return;
        };
        let _ = tx.send(result);
    }

    /// Drop a slot whose caller gave up (timeout or failed send).
    pub(crate) async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }
}

impl Transport {
    /// Issue a correlated call and await its result.
    ///
    /// Fails fast with [`ClientError::NotConnected`] when there is no live
    /// channel; otherwise the call either resolves with the server's data
    /// payload, rejects with the server's failure message, or times out.
    /// A timed-out call is abandoned locally; any server-side effect it had
    /// is not cancelled.
    pub async fn call(&self, call: ClientCall) -> Result<serde_json::Value, ClientError> {
        self.call_with_timeout(call, CALL_TIMEOUT).await
    }

    pub async fn call_with_timeout(
        &self,
        call: ClientCall,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let outbound = self.outbound().await.ok_or(ClientError::NotConnected)?;
        let (id, rx) = self.correlator.register().await;
        let frame = CallFrame { id, call };
        let text = serde_json::to_string(&frame)?;

        if outbound.send(Message::Text(text)).await.is_err() {
            self.correlator.forget(id).await;
            return Err(ClientError::NotConnected);
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(ClientError::NotConnected),
            Err(_) => {
                self.correlator.forget(id).await;
                return Err(ClientError::Timeout(timeout));
            }
        };

        if !result.success {
            let message = result
                .message
                .unwrap_or_else(|| "unspecified server error".to_string());
            return Err(ClientError::ServerRejected(message));
        }

        Ok(result.data.unwrap_or(serde_json::Value::Null))
    }

    async fn call_as<T: DeserializeOwned>(&self, call: ClientCall) -> Result<T, ClientError> {
        let data = self.call(call).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub(crate) async fn join_user_room(&self, user_id: UserId) -> Result<(), ClientError> {
        self.call(ClientCall::JoinUserRoom { user_id }).await?;
        Ok(())
    }

    pub async fn create_private_conversation(
        &self,
        peer_id: UserId,
    ) -> Result<ConversationRecord, ClientError> {
        self.call_as(ClientCall::CreatePrivateConversation { peer_id })
            .await
    }

    pub async fn create_event_conversation(
        &self,
        event_id: EventId,
    ) -> Result<ConversationRecord, ClientError> {
        self.call_as(ClientCall::CreateEventConversation { event_id })
            .await
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        self.call_as(ClientCall::SendMessage {
            conversation_id,
            content: content.to_string(),
        })
        .await
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationRecord, ClientError> {
        self.call_as(ClientCall::GetConversation { conversation_id })
            .await
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationRecord>, ClientError> {
        self.call_as(ClientCall::ListConversations).await
    }

    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ClientError> {
        self.call(ClientCall::MarkConversationRead { conversation_id })
            .await?;
        Ok(())
    }

    pub async fn unread_counts(&self) -> Result<Vec<UnreadCount>, ClientError> {
        self.call_as(ClientCall::GetUnreadCounts).await
    }

    pub async fn total_unread_count(&self) -> Result<u32, ClientError> {
        self.call_as(ClientCall::GetTotalUnreadCount).await
    }

    pub async fn users_status(&self, user_ids: &[UserId]) -> Result<Vec<UserStatus>, ClientError> {
        self.call_as(ClientCall::GetUsersStatus {
            user_ids: user_ids.to_vec(),
        })
        .await
    }
}

#[cfg(test)]
#[path = "tests/request_tests.rs"]
mod tests;
