/// Push/subscribe transport seam
pub mod memory;
pub mod sse;

pub use memory::MemoryTransport;
pub use sse::SseTransport;

use crate::error::Result;
use crate::event::PushEvent;
use crate::model::Credential;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Named topic on the realtime collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

/// What a topic carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    ConversationList { user_id: String },
    Messages { conversation_id: String },
    Heartbeat,
    Other,
}

impl Topic {
    pub fn conversation_list(user_id: &str) -> Self {
        Topic(format!("conversations:{}", user_id))
    }

    pub fn messages(conversation_id: &str) -> Self {
        Topic(format!("messages:{}", conversation_id))
    }

    pub fn heartbeat() -> Self {
        Topic(format!("heartbeat:{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> TopicKind {
        match self.0.split_once(':') {
            Some(("conversations", user)) => TopicKind::ConversationList {
                user_id: user.to_string(),
            },
            Some(("messages", conv)) => TopicKind::Messages {
                conversation_id: conv.to_string(),
            },
            Some(("heartbeat", _)) => TopicKind::Heartbeat,
            _ => TopicKind::Other,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confirmed subscription. The stream ends when the transport drops the topic;
/// an `Err` item reports why the topic failed.
pub struct Subscription {
    pub topic: Topic,
    pub events: mpsc::Receiver<Result<PushEvent>>,
}

/// Realtime collaborator: at-least-once, unordered delivery per topic
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    /// Open `topic`; resolves once the server confirmed the subscription
    async fn subscribe(&self, topic: &Topic, credential: &Credential) -> Result<Subscription>;

    /// Release `topic`; unknown topics are ignored
    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_kinds() {
        assert_eq!(
            Topic::conversation_list("u1").kind(),
            TopicKind::ConversationList {
                user_id: "u1".to_string()
            }
        );
        assert_eq!(
            Topic::messages("c9").kind(),
            TopicKind::Messages {
                conversation_id: "c9".to_string()
            }
        );
        assert_eq!(Topic::heartbeat().kind(), TopicKind::Heartbeat);
        assert_ne!(Topic::heartbeat(), Topic::heartbeat());
    }
}
