/// Push events from the realtime collaborator and change events for the UI
use crate::error::{Result, SyncError};
use crate::model::{ConnectionStatus, Conversation, Message};
use serde::{Deserialize, Serialize};

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Inserted,
}

/// Which table the entity lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Conversation,
    Message,
}

/// Raw entity-change event as delivered on a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub entity: EntityKind,
    pub payload: serde_json::Value,
}

impl PushEvent {
    /// Parse one event from its JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("Invalid push event: {}", e)))
    }

    pub fn conversation(kind: EventKind, conversation: &Conversation) -> Result<Self> {
        Ok(Self {
            kind,
            entity: EntityKind::Conversation,
            payload: serde_json::to_value(conversation)?,
        })
    }

    pub fn message_inserted(message: &Message) -> Result<Self> {
        Ok(Self {
            kind: EventKind::Inserted,
            entity: EntityKind::Message,
            payload: serde_json::to_value(message)?,
        })
    }

    pub fn into_conversation_event(self) -> Result<ConversationEvent> {
        if self.entity != EntityKind::Conversation {
            return Err(SyncError::Protocol(format!(
                "Expected conversation event, got {:?}",
                self.entity
            )));
        }
        let conversation: Conversation = serde_json::from_value(self.payload)
            .map_err(|e| SyncError::Protocol(format!("Invalid conversation payload: {}", e)))?;
        match self.kind {
            EventKind::Created => Ok(ConversationEvent::Created(conversation)),
            EventKind::Updated => Ok(ConversationEvent::Updated(conversation)),
            EventKind::Inserted => Err(SyncError::Protocol(
                "Conversations are created or updated, not inserted".to_string(),
            )),
        }
    }

    pub fn into_message_event(self) -> Result<MessageEvent> {
        if self.entity != EntityKind::Message {
            return Err(SyncError::Protocol(format!(
                "Expected message event, got {:?}",
                self.entity
            )));
        }
        if self.kind != EventKind::Inserted {
            // No edit path exists for messages
            return Err(SyncError::Protocol(format!(
                "Unsupported message event type {:?}",
                self.kind
            )));
        }
        let message: Message = serde_json::from_value(self.payload)
            .map_err(|e| SyncError::Protocol(format!("Invalid message payload: {}", e)))?;
        Ok(MessageEvent::Inserted(message))
    }
}

/// Live change to the conversation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    Created(Conversation),
    Updated(Conversation),
}

impl ConversationEvent {
    pub fn conversation(&self) -> &Conversation {
        match self {
            ConversationEvent::Created(c) | ConversationEvent::Updated(c) => c,
        }
    }
}

/// Live change to one conversation's messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    Inserted(Message),
}

/// Where a live message landed in its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Newest message so far
    Trailing,
    /// Older than already visible messages (history correction)
    Retroactive,
}

/// Change notifications for the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Conversation list snapshot changed
    ConversationsChanged,
    /// A conversation's message list was rebuilt (backfill settled or older page merged)
    MessagesReset { conversation_id: String },
    /// A live message was merged into a live stream
    MessageReceived {
        conversation_id: String,
        message: Message,
        placement: Placement,
    },
    /// Aggregated connection status changed
    StatusChanged { status: ConnectionStatus },
}
