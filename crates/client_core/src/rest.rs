//! REST mirror of the read operations the duplex channel exposes, used
//! whenever the realtime session is down. No retries, no caching; source
//! selection is the view model's job.

use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
    protocol::{ConversationRecord, MessagePayload, UnreadCount, UserSummary},
};

use crate::{auth::TokenStore, error::ClientError};

pub struct RestClient {
    http: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            tokens,
        }
    }

    pub async fn list_friends(&self) -> Result<Vec<UserSummary>, ClientError> {
        let response = self.get("/users/me/friends").send().await?;
        decode(response).await
    }

    /// Look a user up by id. A 404 maps to [`ClientError::NotFound`] so the
    /// caller can substitute a deleted-user sentinel instead of failing.
    pub async fn user(&self, user_id: UserId) -> Result<UserSummary, ClientError> {
        let response = self.get(&format!("/users/{}", user_id.0)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("user {}", user_id.0)));
        }
        decode(response).await
    }

    pub async fn list_conversations(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, ClientError> {
        let response = self
            .get("/conversations")
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn unread_counts(&self) -> Result<Vec<UnreadCount>, ClientError> {
        let response = self.get("/conversations/unread-counts").send().await?;
        decode(response).await
    }

    pub async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let response = self
            .get(&format!("/conversations/{}/messages", conversation_id.0))
            .query(&[("page", page), ("limit", limit)])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!(
                "conversation {}",
                conversation_id.0
            )));
        }
        decode(response).await
    }

    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ClientError> {
        let response = self
            .post(&format!("/conversations/{}/read", conversation_id.0))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.http.get(format!("{}{path}", self.base_url)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.http.post(format!("{}{path}", self.base_url)))
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.tokens.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// A non-success status with a decodable [`ApiError`] body is an explicit
/// server rejection; anything else is a plain network failure.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(api) => Err(ClientError::ServerRejected(api.message)),
        Err(_) => Err(ClientError::Network(format!("unexpected status {status}"))),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let response = check(response).await?;
    Ok(response.json().await?)
}

#[cfg(test)]
#[path = "tests/rest_tests.rs"]
mod tests;
