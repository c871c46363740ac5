/// Conversation list cache: REST snapshot merged with live updates
use crate::event::ConversationEvent;
use crate::model::{Conversation, Message};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LOAD: AtomicU64 = AtomicU64::new(1);

/// Result of merging one change into the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Inserted,
    Updated,
    Unchanged,
}

impl IndexChange {
    pub fn is_change(self) -> bool {
        self != IndexChange::Unchanged
    }
}

/// Identifies one snapshot load between `begin_snapshot` and its
/// `load_snapshot` or `abort_snapshot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotTicket(u64);

#[derive(Debug, Default)]
pub struct ConversationIndex {
    by_id: HashMap<String, Conversation>,
    /// Sorted view, rebuilt on every mutation
    ordered: Arc<Vec<Conversation>>,
    /// Snapshot loads in flight
    loading: HashSet<SnapshotTicket>,
    /// Live events seen while a snapshot load was in flight
    replay: Vec<ConversationEvent>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording live events so they survive the matching `load_snapshot`
    pub fn begin_snapshot(&mut self) -> SnapshotTicket {
        let ticket = SnapshotTicket(NEXT_LOAD.fetch_add(1, Ordering::Relaxed));
        self.loading.insert(ticket);
        ticket
    }

    /// Give up on a snapshot load. Unknown or finished tickets are ignored.
    pub fn abort_snapshot(&mut self, ticket: SnapshotTicket) {
        self.finish(ticket);
    }

    /// Replace the whole cache with a REST snapshot. `None` when the ticket
    /// is no longer pending (aborted, or the index was reset meanwhile).
    pub fn load_snapshot(
        &mut self,
        ticket: SnapshotTicket,
        conversations: Vec<Conversation>,
    ) -> Option<Arc<Vec<Conversation>>> {
        if !self.loading.contains(&ticket) {
            return None;
        }
        self.by_id = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        // Live state newer than the snapshot wins again
        for event in &self.replay {
            Self::merge(&mut self.by_id, event);
        }
        self.finish(ticket);
        self.rebuild();
        Some(self.snapshot())
    }

    /// Whether live events are being kept for an in-flight snapshot
    pub fn is_recording(&self) -> bool {
        !self.loading.is_empty()
    }

    fn finish(&mut self, ticket: SnapshotTicket) {
        self.loading.remove(&ticket);
        if self.loading.is_empty() {
            self.replay.clear();
        }
    }

    /// Merge a live `created`/`updated` event by id
    pub fn apply_live_event(&mut self, event: ConversationEvent) -> IndexChange {
        let change = Self::merge(&mut self.by_id, &event);
        if self.is_recording() {
            self.replay.push(event);
        }
        if change.is_change() {
            self.rebuild();
        }
        change
    }

    fn merge(by_id: &mut HashMap<String, Conversation>, event: &ConversationEvent) -> IndexChange {
        match event {
            ConversationEvent::Created(incoming) => {
                if by_id.contains_key(&incoming.id) {
                    IndexChange::Unchanged
                } else {
                    by_id.insert(incoming.id.clone(), incoming.clone());
                    IndexChange::Inserted
                }
            }
            ConversationEvent::Updated(incoming) => match by_id.get_mut(&incoming.id) {
                None => {
                    by_id.insert(incoming.id.clone(), incoming.clone());
                    IndexChange::Inserted
                }
                Some(cached) if incoming.last_message_at < cached.last_message_at => {
                    IndexChange::Unchanged
                }
                Some(cached) if cached == incoming => IndexChange::Unchanged,
                Some(cached) => {
                    *cached = incoming.clone();
                    IndexChange::Updated
                }
            },
        }
    }

    /// Advance a conversation's preview from a live message if it is newer
    pub fn note_message(&mut self, message: &Message) -> IndexChange {
        let Some(cached) = self.by_id.get_mut(&message.conversation_id) else {
            return IndexChange::Unchanged;
        };
        if message.created_at < cached.last_message_at
            || (message.created_at == cached.last_message_at
                && cached.last_message_text.as_deref() == Some(message.content.as_str()))
        {
            return IndexChange::Unchanged;
        }
        cached.last_message_at = message.created_at;
        cached.last_message_text = Some(message.content.clone());
        if !self.loading.is_empty() {
            self.replay.push(ConversationEvent::Updated(cached.clone()));
        }
        self.rebuild();
        IndexChange::Updated
    }

    /// Ordered read-only view
    pub fn snapshot(&self) -> Arc<Vec<Conversation>> {
        self.ordered.clone()
    }

    pub fn filter<P>(&self, predicate: P) -> Vec<Conversation>
    where
        P: Fn(&Conversation) -> bool,
    {
        self.ordered.iter().filter(|c| predicate(c)).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.by_id.get(id)
    }

    /// Existing thread between the two users, if cached
    pub fn find_with_participant(&self, user_id: &str, other_user_id: &str) -> Option<&Conversation> {
        self.ordered
            .iter()
            .find(|c| c.has_participants(user_id, other_user_id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn rebuild(&mut self) {
        let mut list: Vec<Conversation> = self.by_id.values().cloned().collect();
        list.sort_by(Conversation::list_order);
        self.ordered = Arc::new(list);
    }
}
