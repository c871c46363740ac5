/// REST client over hyper
use super::{PageRequest, RestApi};
use crate::error::{Result, SyncError};
use crate::http_client::{authorized_request, new_client, read_body, status_error, HttpClient};
use crate::model::{Conversation, Credential, Message};
use async_trait::async_trait;
use http::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Deserialize)]
struct ConversationsResponse {
    conversations: Vec<Conversation>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct MessageResponse {
    message: Message,
}

#[derive(Deserialize)]
struct ConversationResponse {
    conversation: Conversation,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    content: &'a str,
}

#[derive(Serialize)]
struct CreateConversationRequest<'a> {
    other_user_id: &'a str,
}

pub struct HttpRestClient {
    base_url: String,
    client: HttpClient,
}

impl HttpRestClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: new_client(),
        }
    }

    fn messages_url(&self, conversation_id: &str, page: Option<&PageRequest>) -> String {
        let mut url = format!(
            "{}/conversations/{}/messages",
            self.base_url,
            urlencoding::encode(conversation_id)
        );
        if let Some(page) = page {
            url.push_str(&format!("?limit={}", page.limit));
            if let Some(before) = page.before {
                url.push_str("&before=");
                url.push_str(&urlencoding::encode(&before.to_rfc3339()));
            }
        }
        url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        credential: &Credential,
        body: Option<Vec<u8>>,
    ) -> Result<T> {
        debug!("{} {}", method, url);
        let req = authorized_request(method, url, credential, "application/json", body)?;
        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| SyncError::Network(format!("{}: {}", url, e)))?;
        let status = resp.status();
        let bytes = read_body(resp.into_body()).await?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Protocol(format!("Invalid response from {}: {}", url, e)))
    }
}

#[async_trait]
impl RestApi for HttpRestClient {
    async fn list_conversations(&self, credential: &Credential) -> Result<Vec<Conversation>> {
        let url = format!("{}/conversations", self.base_url);
        let resp: ConversationsResponse = self.call(Method::GET, &url, credential, None).await?;
        Ok(resp.conversations)
    }

    async fn fetch_messages(
        &self,
        credential: &Credential,
        conversation_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Message>> {
        let url = self.messages_url(conversation_id, Some(page));
        let resp: MessagesResponse = self.call(Method::GET, &url, credential, None).await?;
        Ok(resp.messages)
    }

    async fn create_message(
        &self,
        credential: &Credential,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message> {
        let url = self.messages_url(conversation_id, None);
        let body = serde_json::to_vec(&SendRequest { content })?;
        let resp: MessageResponse = self
            .call(Method::POST, &url, credential, Some(body))
            .await?;
        Ok(resp.message)
    }

    async fn create_conversation(
        &self,
        credential: &Credential,
        other_user_id: &str,
    ) -> Result<Conversation> {
        let url = format!("{}/conversations", self.base_url);
        let body = serde_json::to_vec(&CreateConversationRequest { other_user_id })?;
        let resp: ConversationResponse = self
            .call(Method::POST, &url, credential, Some(body))
            .await?;
        Ok(resp.conversation)
    }
}
