/// Shared types for the sync engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Summary of one conversation thread between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    #[serde(default)]
    pub participant_a_name: Option<String>,
    #[serde(default)]
    pub participant_b_name: Option<String>,
    /// Preview text of the last message
    #[serde(default)]
    pub last_message_text: Option<String>,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    /// The participant that is not `user_id`
    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.participant_a == user_id {
            &self.participant_b
        } else {
            &self.participant_a
        }
    }

    /// Display name of the participant that is not `user_id`, if known
    pub fn other_participant_name(&self, user_id: &str) -> Option<&str> {
        if self.participant_a == user_id {
            self.participant_b_name.as_deref()
        } else {
            self.participant_a_name.as_deref()
        }
    }

    pub fn has_participants(&self, a: &str, b: &str) -> bool {
        (self.participant_a == a && self.participant_b == b)
            || (self.participant_a == b && self.participant_b == a)
    }

    /// List order: newest activity first, ties by ascending id
    pub fn list_order(a: &Conversation, b: &Conversation) -> Ordering {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Stream order key: `(created_at, id)`
    pub fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Resume point for paging older history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub conversation_id: String,
    pub oldest_loaded_at: Option<DateTime<Utc>>,
    /// No older messages exist on the server
    pub exhausted: bool,
}

impl SyncCursor {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            oldest_loaded_at: None,
            exhausted: false,
        }
    }
}

/// Connection state of one logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not subscribed and not trying
    Disconnected,
    /// First subscribe attempt in progress
    Connecting,
    /// Transport confirmed the subscription
    Subscribed,
    /// Lost or failed, retrying with backoff
    Reconnecting,
    /// Still retrying, but past the failure budget
    Degraded,
}

/// Connection status as shown to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Degraded,
}

impl ConnectionStatus {
    /// Worst status over a set of channel states
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = ConnectionState>,
    {
        let mut status = ConnectionStatus::Connected;
        let mut any = false;
        for state in states {
            any = true;
            match state {
                ConnectionState::Degraded => return ConnectionStatus::Degraded,
                ConnectionState::Subscribed => {}
                _ => status = ConnectionStatus::Reconnecting,
            }
        }
        if any {
            status
        } else {
            ConnectionStatus::Reconnecting
        }
    }
}

/// Monotonic selection counter used to recognise stale async results
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// Tag for session-scoped work that no selection can supersede
    pub const SESSION: Generation = Generation(0);

    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Session credential supplied by the auth collaborator
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

/// Custom Debug impl to keep the bearer token out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Conversation as presented to the UI, relative to the signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationView {
    pub id: String,
    pub peer_id: String,
    pub peer_name: Option<String>,
    pub last_message_text: Option<String>,
    pub last_message_at: DateTime<Utc>,
}

impl ConversationView {
    pub fn from_conversation(conversation: &Conversation, user_id: &str) -> Self {
        Self {
            id: conversation.id.clone(),
            peer_id: conversation.other_participant(user_id).to_string(),
            peer_name: conversation
                .other_participant_name(user_id)
                .map(str::to_string),
            last_message_text: conversation.last_message_text.clone(),
            last_message_at: conversation.last_message_at,
        }
    }

    /// Name to show in lists
    pub fn title(&self) -> &str {
        self.peer_name.as_deref().unwrap_or(&self.peer_id)
    }
}

/// Message as presented to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Sent by the signed-in user
    pub outgoing: bool,
}

impl MessageView {
    pub fn from_message(message: &Message, user_id: &str) -> Self {
        Self {
            id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            outgoing: message.sender_id == user_id,
        }
    }
}
