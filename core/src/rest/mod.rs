/// REST collaborator seam
pub mod client;
pub mod memory;

pub use client::HttpRestClient;
pub use memory::MemoryBackend;

use crate::error::Result;
use crate::model::{Conversation, Credential, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// One backfill page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Only messages at or older than this; `None` for the newest page
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[async_trait]
pub trait RestApi: Send + Sync + 'static {
    /// `GET /conversations` for the credential's user
    async fn list_conversations(&self, credential: &Credential) -> Result<Vec<Conversation>>;

    /// `GET /conversations/{id}/messages`; order of the returned page is unspecified
    async fn fetch_messages(
        &self,
        credential: &Credential,
        conversation_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Message>>;

    /// `POST /conversations/{id}/messages`
    async fn create_message(
        &self,
        credential: &Credential,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message>;

    /// `POST /conversations`
    async fn create_conversation(
        &self,
        credential: &Credential,
        other_user_id: &str,
    ) -> Result<Conversation>;
}
