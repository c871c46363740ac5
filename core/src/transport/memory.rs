/// In-process topic hub used by tests and the offline demo
use super::{ChannelTransport, Subscription, Topic};
use crate::error::{Result, SyncError};
use crate::event::PushEvent;
use crate::model::Credential;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STREAM_BUFFER: usize = 256;

#[derive(Default)]
struct HubState {
    subscribers: HashMap<Topic, Vec<mpsc::Sender<Result<PushEvent>>>>,
    /// Errors returned by the next subscribe calls, in order
    scripted_failures: VecDeque<SyncError>,
    /// Subscribe never confirms while set
    unresponsive: bool,
    attempts: HashMap<Topic, usize>,
}

/// Transport whose topics live in memory. Clones share the same hub.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<HubState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        // A panic while holding the guard cannot leave the maps half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deliver `event` to every live subscriber of `topic`, returns how many got it
    pub fn publish(&self, topic: &Topic, event: PushEvent) -> usize {
        let mut state = self.lock();
        let Some(senders) = state.subscribers.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            match tx.try_send(Ok(event.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Memory transport dropped event on {}: {}", topic, e),
            }
        }
        delivered
    }

    /// Make the next subscribe calls fail with these errors, in order
    pub fn fail_next_subscribes<I>(&self, errors: I)
    where
        I: IntoIterator<Item = SyncError>,
    {
        self.lock().scripted_failures.extend(errors);
    }

    /// While set, subscribe calls never confirm
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.lock().unresponsive = unresponsive;
    }

    /// Push `error` to every subscriber of `topic` and close their streams
    pub fn fail_topic(&self, topic: &Topic, error: impl Fn() -> SyncError) {
        let senders = self.lock().subscribers.remove(topic).unwrap_or_default();
        for tx in senders {
            let _ = tx.try_send(Err(error()));
        }
    }

    /// Close every stream of `topic` without an error
    pub fn drop_topic(&self, topic: &Topic) {
        self.lock().subscribers.remove(topic);
    }

    /// Live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.lock()
            .subscribers
            .get(topic)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Topics with at least one live subscription, sorted
    pub fn active_topics(&self) -> Vec<Topic> {
        let state = self.lock();
        let mut topics: Vec<Topic> = state
            .subscribers
            .iter()
            .filter(|(_, senders)| senders.iter().any(|tx| !tx.is_closed()))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Subscribe calls seen for `topic`, failed ones included
    pub fn subscribe_attempts(&self, topic: &Topic) -> usize {
        self.lock().attempts.get(topic).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    async fn subscribe(&self, topic: &Topic, _credential: &Credential) -> Result<Subscription> {
        let unresponsive = {
            let mut state = self.lock();
            *state.attempts.entry(topic.clone()).or_insert(0) += 1;
            if let Some(err) = state.scripted_failures.pop_front() {
                debug!("Memory transport failing subscribe to {}: {}", topic, err);
                return Err(err);
            }
            state.unresponsive
        };
        if unresponsive {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.lock()
            .subscribers
            .entry(topic.clone())
            .or_default()
            .push(tx);
        Ok(Subscription {
            topic: topic.clone(),
            events: rx,
        })
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        self.lock().subscribers.remove(topic);
        Ok(())
    }
}
