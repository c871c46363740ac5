/// In-memory REST backend that echoes writes through a `MemoryTransport`
use super::{PageRequest, RestApi};
use crate::error::{Result, SyncError};
use crate::event::{EventKind, PushEvent};
use crate::model::{Conversation, Credential, Message};
use crate::transport::{MemoryTransport, Topic};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct BackendState {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<Message>>,
    /// Backfills for these conversations wait until the flag flips to true
    holds: HashMap<String, watch::Sender<bool>>,
    scripted_failures: VecDeque<SyncError>,
    required_token: Option<String>,
    echo_delay: Duration,
    fetches: HashMap<String, usize>,
}

/// Backend for tests and the offline demo. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<BackendState>>,
    transport: Option<MemoryTransport>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose writes are pushed to subscribers of `transport`
    pub fn with_transport(transport: MemoryTransport) -> Self {
        Self {
            state: Arc::default(),
            transport: Some(transport),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.lock()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Store a message without pushing anything
    pub fn insert_message(&self, message: Message) {
        self.lock()
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }

    /// Store a message authored elsewhere and push it like the server would
    pub fn deliver_message(&self, message: Message) {
        let updated = {
            let mut state = self.lock();
            state
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message.clone());
            touch_conversation(&mut state, &message)
        };
        self.push_message(&message, updated.as_ref());
    }

    /// Delay between a successful `create_message` and its live echo
    pub fn set_echo_delay(&self, delay: Duration) {
        self.lock().echo_delay = delay;
    }

    /// Reject calls whose bearer token differs
    pub fn require_token(&self, token: impl Into<String>) {
        self.lock().required_token = Some(token.into());
    }

    /// Make the next REST calls fail with these errors, in order
    pub fn fail_next<I>(&self, errors: I)
    where
        I: IntoIterator<Item = SyncError>,
    {
        self.lock().scripted_failures.extend(errors);
    }

    /// Park message fetches for `conversation_id` until `release_backfill`
    pub fn hold_backfill(&self, conversation_id: &str) {
        let (tx, _) = watch::channel(false);
        self.lock().holds.insert(conversation_id.to_string(), tx);
    }

    pub fn release_backfill(&self, conversation_id: &str) {
        if let Some(tx) = self.lock().holds.remove(conversation_id) {
            let _ = tx.send(true);
        }
    }

    /// Message fetches started for `conversation_id`
    pub fn fetch_count(&self, conversation_id: &str) -> usize {
        self.lock().fetches.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn stored_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self, credential: &Credential) -> Result<()> {
        let mut state = self.lock();
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        match &state.required_token {
            Some(token) if token != &credential.token => {
                Err(SyncError::Auth("invalid token".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn push_message(&self, message: &Message, conversation: Option<&Conversation>) {
        let Some(transport) = &self.transport else {
            return;
        };
        match PushEvent::message_inserted(message) {
            Ok(event) => {
                transport.publish(&Topic::messages(&message.conversation_id), event);
            }
            Err(e) => warn!("Failed to encode message event: {}", e),
        }
        if let Some(conversation) = conversation {
            self.push_conversation(EventKind::Updated, conversation);
        }
    }

    fn push_conversation(&self, kind: EventKind, conversation: &Conversation) {
        let Some(transport) = &self.transport else {
            return;
        };
        match PushEvent::conversation(kind, conversation) {
            Ok(event) => {
                for user in [&conversation.participant_a, &conversation.participant_b] {
                    transport.publish(&Topic::conversation_list(user), event.clone());
                }
            }
            Err(e) => warn!("Failed to encode conversation event: {}", e),
        }
    }
}

fn touch_conversation(state: &mut BackendState, message: &Message) -> Option<Conversation> {
    let conversation = state.conversations.get_mut(&message.conversation_id)?;
    if message.created_at >= conversation.last_message_at {
        conversation.last_message_at = message.created_at;
        conversation.last_message_text = Some(message.content.clone());
    }
    Some(conversation.clone())
}

#[async_trait]
impl RestApi for MemoryBackend {
    async fn list_conversations(&self, credential: &Credential) -> Result<Vec<Conversation>> {
        self.check(credential)?;
        let state = self.lock();
        let mut list: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| {
                c.participant_a == credential.user_id || c.participant_b == credential.user_id
            })
            .cloned()
            .collect();
        list.sort_by(Conversation::list_order);
        Ok(list)
    }

    async fn fetch_messages(
        &self,
        credential: &Credential,
        conversation_id: &str,
        page: &PageRequest,
    ) -> Result<Vec<Message>> {
        self.check(credential)?;
        let hold = {
            let mut state = self.lock();
            *state.fetches.entry(conversation_id.to_string()).or_insert(0) += 1;
            state.holds.get(conversation_id).map(|tx| tx.subscribe())
        };
        if let Some(mut rx) = hold {
            debug!("Backfill for {} parked", conversation_id);
            // Sender dropped means released
            let _ = rx.wait_for(|released| *released).await;
        }

        let state = self.lock();
        let mut page_messages: Vec<Message> = state
            .messages
            .get(conversation_id)
            .map(|all| {
                all.iter()
                    .filter(|m| page.before.map_or(true, |before| m.created_at <= before))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Newest first, like the real endpoint
        page_messages.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        page_messages.truncate(page.limit);
        Ok(page_messages)
    }

    async fn create_message(
        &self,
        credential: &Credential,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message> {
        self.check(credential)?;
        let (message, updated, delay) = {
            let mut state = self.lock();
            if !state.conversations.contains_key(conversation_id) {
                return Err(SyncError::Rejected {
                    status: 404,
                    message: format!("conversation {} not found", conversation_id),
                });
            }
            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: credential.user_id.clone(),
                content: content.to_string(),
                created_at: Utc::now(),
            };
            state
                .messages
                .entry(conversation_id.to_string())
                .or_default()
                .push(message.clone());
            let updated = touch_conversation(&mut state, &message);
            (message, updated, state.echo_delay)
        };

        let backend = self.clone();
        let echoed = message.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            backend.push_message(&echoed, updated.as_ref());
        });
        Ok(message)
    }

    async fn create_conversation(
        &self,
        credential: &Credential,
        other_user_id: &str,
    ) -> Result<Conversation> {
        self.check(credential)?;
        if other_user_id == credential.user_id {
            return Err(SyncError::Rejected {
                status: 422,
                message: "cannot start a conversation with yourself".to_string(),
            });
        }
        let conversation = {
            let mut state = self.lock();
            if let Some(existing) = state
                .conversations
                .values()
                .find(|c| c.has_participants(&credential.user_id, other_user_id))
            {
                return Ok(existing.clone());
            }
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                participant_a: credential.user_id.clone(),
                participant_b: other_user_id.to_string(),
                participant_a_name: None,
                participant_b_name: None,
                last_message_text: None,
                last_message_at: Utc::now(),
            };
            state
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
            conversation
        };
        self.push_conversation(EventKind::Created, &conversation);
        Ok(conversation)
    }
}
