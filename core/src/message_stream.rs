/// Per-conversation message log: paginated backfill merged with live inserts
use crate::event::Placement;
use crate::model::{Message, SyncCursor};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Whether the initial backfill has settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    /// Initial backfill in flight; live events are buffered
    Backfilling,
    /// Live events go straight into sorted position
    Live,
}

/// What `append_live` did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    /// Held until `finalize_backfill`
    Buffered,
    /// Newest message in the stream
    Appended,
    /// Landed before already visible messages
    RetroactiveInsert { position: usize },
    /// Id already known
    Duplicate,
    /// Belongs to a different conversation
    Ignored,
}

impl LiveOutcome {
    pub fn placement(self) -> Option<Placement> {
        match self {
            LiveOutcome::Appended => Some(Placement::Trailing),
            LiveOutcome::RetroactiveInsert { .. } => Some(Placement::Retroactive),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MessageStream {
    conversation_id: String,
    /// Sorted by `(created_at, id)`
    messages: Vec<Message>,
    ids: HashSet<String>,
    /// Live messages that arrived during the initial backfill, in arrival order
    buffer: Vec<Message>,
    mode: StreamMode,
    cursor: SyncCursor,
}

impl MessageStream {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            cursor: SyncCursor::new(conversation_id.clone()),
            conversation_id,
            messages: Vec::new(),
            ids: HashSet::new(),
            buffer: Vec::new(),
            mode: StreamMode::Backfilling,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_live(&self) -> bool {
        self.mode == StreamMode::Live
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Loaded messages sharing the cursor's oldest timestamp. An inclusive
    /// `before` page returns them again, so the next page must be this much larger.
    pub fn loaded_at_oldest(&self) -> usize {
        let Some(oldest) = self.cursor.oldest_loaded_at else {
            return 0;
        };
        self.messages
            .iter()
            .take_while(|m| m.created_at <= oldest)
            .filter(|m| m.created_at == oldest)
            .count()
    }

    /// Ordered read-only view
    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Merge one REST page (any order) and advance the cursor.
    /// Returns how many messages were new. A short page, or a full one
    /// that adds nothing, marks history as exhausted.
    pub fn apply_backfill(&mut self, page: Vec<Message>, requested: usize) -> usize {
        let fetched = page.len();
        let mut added = 0;
        for message in page {
            if message.conversation_id != self.conversation_id {
                warn!(
                    "Backfill for {} returned message {} of {}",
                    self.conversation_id, message.id, message.conversation_id
                );
                continue;
            }
            self.cursor.oldest_loaded_at = Some(match self.cursor.oldest_loaded_at {
                Some(oldest) => oldest.min(message.created_at),
                None => message.created_at,
            });
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
                added += 1;
            }
        }
        if fetched < requested || added == 0 {
            self.cursor.exhausted = true;
        }
        self.sort();
        debug!(
            "Backfilled {} of {} messages into {}",
            added, fetched, self.conversation_id
        );
        added
    }

    /// Apply an `inserted` push event
    pub fn append_live(&mut self, message: Message) -> LiveOutcome {
        if message.conversation_id != self.conversation_id {
            return LiveOutcome::Ignored;
        }
        if self.ids.contains(&message.id) {
            return LiveOutcome::Duplicate;
        }

        match self.mode {
            StreamMode::Backfilling => {
                if self.buffer.iter().any(|m| m.id == message.id) {
                    return LiveOutcome::Duplicate;
                }
                self.buffer.push(message);
                LiveOutcome::Buffered
            }
            StreamMode::Live => {
                let position = match self
                    .messages
                    .binary_search_by(|m| m.sort_key().cmp(&message.sort_key()))
                {
                    Ok(_) => return LiveOutcome::Duplicate,
                    Err(position) => position,
                };
                let retroactive = position < self.messages.len();
                self.ids.insert(message.id.clone());
                self.messages.insert(position, message);
                if retroactive {
                    LiveOutcome::RetroactiveInsert { position }
                } else {
                    LiveOutcome::Appended
                }
            }
        }
    }

    /// Merge buffered live messages into the backfilled set and go live.
    /// Backfilled copies win over buffered duplicates. Returns how many
    /// buffered messages were kept.
    pub fn finalize_backfill(&mut self) -> usize {
        if self.mode == StreamMode::Live {
            return 0;
        }
        let mut kept = 0;
        for message in std::mem::take(&mut self.buffer) {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
                kept += 1;
            }
        }
        self.sort();
        self.mode = StreamMode::Live;
        kept
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    fn msg(id: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c".to_string(),
            sender_id: "u".to_string(),
            content: format!("body of {}", id),
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn ids(stream: &MessageStream) -> Vec<&str> {
        stream.all().iter().map(|m| m.id.as_str()).collect()
    }

    fn assert_sorted_unique(stream: &MessageStream) {
        let all = stream.all();
        for pair in all.windows(2) {
            assert!(pair[0].sort_key() < pair[1].sort_key());
        }
        let unique: HashSet<_> = all.iter().map(|m| &m.id).collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn test_merge_on_finalize_scenario() {
        let mut stream = MessageStream::new("c");
        assert_eq!(stream.append_live(msg("m2", 20)), LiveOutcome::Buffered);
        assert_eq!(stream.append_live(msg("m3", 15)), LiveOutcome::Buffered);
        stream.apply_backfill(vec![msg("m1", 10), msg("m2", 20)], 50);
        assert_eq!(stream.finalize_backfill(), 1);

        assert_eq!(ids(&stream), vec!["m1", "m3", "m2"]);
        assert!(stream.is_live());
    }

    #[test]
    fn test_backfilled_copy_wins() {
        let mut stream = MessageStream::new("c");
        let mut live_copy = msg("m1", 10);
        live_copy.content = "partial".to_string();
        stream.append_live(live_copy);
        stream.apply_backfill(vec![msg("m1", 10)], 50);
        stream.finalize_backfill();
        assert_eq!(stream.all()[0].content, "body of m1");
    }

    #[test]
    fn test_live_insert_positions() {
        let mut stream = MessageStream::new("c");
        stream.apply_backfill(vec![msg("m1", 10), msg("m3", 30)], 50);
        stream.finalize_backfill();

        assert_eq!(stream.append_live(msg("m4", 40)), LiveOutcome::Appended);
        assert_eq!(
            stream.append_live(msg("m2", 20)),
            LiveOutcome::RetroactiveInsert { position: 1 }
        );
        assert_eq!(stream.append_live(msg("m2", 20)), LiveOutcome::Duplicate);
        assert_eq!(ids(&stream), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(
            LiveOutcome::RetroactiveInsert { position: 1 }.placement(),
            Some(Placement::Retroactive)
        );
    }

    #[test]
    fn test_equal_timestamps_order_by_id() {
        let mut stream = MessageStream::new("c");
        stream.finalize_backfill();
        stream.append_live(msg("b", 10));
        assert_eq!(
            stream.append_live(msg("a", 10)),
            LiveOutcome::RetroactiveInsert { position: 0 }
        );
        assert_eq!(ids(&stream), vec!["a", "b"]);
    }

    #[test]
    fn test_foreign_messages_are_ignored() {
        let mut stream = MessageStream::new("c");
        let mut other = msg("x", 1);
        other.conversation_id = "elsewhere".to_string();
        assert_eq!(stream.append_live(other.clone()), LiveOutcome::Ignored);
        assert_eq!(stream.apply_backfill(vec![other], 50), 0);
        assert!(stream.is_empty());
    }

    #[test]
    fn test_cursor_tracks_oldest_and_exhaustion() {
        let mut stream = MessageStream::new("c");
        stream.apply_backfill(vec![msg("m5", 50), msg("m4", 40)], 2);
        assert_eq!(
            stream.cursor().oldest_loaded_at,
            Some(Utc.timestamp_opt(40, 0).unwrap())
        );
        assert!(!stream.cursor().exhausted);
        stream.finalize_backfill();

        stream.apply_backfill(vec![msg("m3", 30)], 2);
        assert!(stream.cursor().exhausted);
        assert_eq!(ids(&stream), vec!["m3", "m4", "m5"]);
    }

    #[test]
    fn test_overlapping_page_counts_only_new_ids() {
        let mut stream = MessageStream::new("c");
        stream.apply_backfill(vec![msg("m4", 30), msg("m3", 20)], 2);
        stream.finalize_backfill();
        assert_eq!(stream.loaded_at_oldest(), 1);

        // Inclusive page: m3 again plus two older ones
        let added = stream.apply_backfill(vec![msg("m3", 20), msg("m2", 20), msg("m1", 10)], 3);
        assert_eq!(added, 2);
        assert!(!stream.cursor().exhausted);
        assert_eq!(ids(&stream), vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(stream.loaded_at_oldest(), 1);

        // Only already known messages: nothing left to page in
        assert_eq!(stream.apply_backfill(vec![msg("m1", 10)], 1), 0);
        assert!(stream.cursor().exhausted);
    }

    #[test]
    fn test_any_interleaving_is_sorted_and_unique() {
        let mut rng = StdRng::seed_from_u64(7);
        let universe: Vec<Message> = (0..40)
            .map(|i| msg(&format!("m{:02}", i), rng.gen_range(0..15)))
            .collect();

        for _ in 0..200 {
            let mut stream = MessageStream::new("c");
            let split = rng.gen_range(0..=universe.len());
            let mut backfill: Vec<Message> = universe[..split].to_vec();
            let mut live: Vec<Message> = universe.to_vec();
            live.shuffle(&mut rng);
            // at-least-once delivery: some events arrive twice
            let dups: Vec<Message> = live.iter().take(5).cloned().collect();
            live.extend(dups);
            backfill.shuffle(&mut rng);

            let finalize_at = rng.gen_range(0..=live.len());
            for (i, message) in live.into_iter().enumerate() {
                if i == finalize_at {
                    stream.apply_backfill(std::mem::take(&mut backfill), 100);
                    stream.finalize_backfill();
                }
                stream.append_live(message);
            }
            if !stream.is_live() {
                stream.apply_backfill(backfill, 100);
                stream.finalize_backfill();
            }

            assert_sorted_unique(&stream);
            assert_eq!(stream.len(), universe.len());
        }
    }
}
