/// Sync coordinator: UI-facing API over the caches, the REST collaborator
/// and the connection supervisor
use crate::backoff::Backoff;
use crate::config::Config;
use crate::conversation_index::{ConversationIndex, SnapshotTicket};
use crate::error::{Result, SyncError};
use crate::event::{ConversationEvent, MessageEvent, SyncEvent};
use crate::message_stream::{LiveOutcome, MessageStream};
use crate::model::{
    ConnectionStatus, Conversation, ConversationView, Credential, Generation, Message,
};
use crate::rest::{PageRequest, RestApi};
use crate::session::SessionWatch;
use crate::supervisor::{ConnectionSupervisor, Inbound, SubscriptionHandle};
use crate::transport::{ChannelTransport, Topic, TopicKind};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of `select_conversation`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Backfill settled for this selection
    Loaded {
        generation: Generation,
        messages: Vec<Message>,
    },
    /// A newer selection took over before this one settled
    Superseded,
}

impl SelectOutcome {
    pub fn is_superseded(&self) -> bool {
        matches!(self, SelectOutcome::Superseded)
    }
}

/// Message cache of one selection
struct Slot {
    generation: Generation,
    stream: MessageStream,
}

#[derive(Default)]
struct SyncState {
    index: ConversationIndex,
    slots: HashMap<String, Slot>,
}

struct ActiveConversation {
    conversation_id: String,
    handle: SubscriptionHandle,
}

struct CoordinatorInner {
    config: Config,
    backoff: Backoff,
    rest: Arc<dyn RestApi>,
    supervisor: ConnectionSupervisor,
    session: SessionWatch,
    state: RwLock<SyncState>,
    generation: AtomicU64,
    /// Switch lock, held across close-then-open of the message topic
    active: Mutex<Option<ActiveConversation>>,
    events: broadcast::Sender<SyncEvent>,
    inbound: std::sync::Mutex<Option<mpsc::Receiver<Inbound>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Aborts a snapshot load whose future was dropped before it settled
struct PendingSnapshot {
    inner: Option<Arc<CoordinatorInner>>,
    ticket: SnapshotTicket,
}

impl PendingSnapshot {
    fn new(inner: Arc<CoordinatorInner>, ticket: SnapshotTicket) -> Self {
        Self {
            inner: Some(inner),
            ticket,
        }
    }

    /// The caller finishes the ticket itself
    fn settled(mut self) {
        self.inner = None;
    }
}

impl Drop for PendingSnapshot {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let ticket = self.ticket;
        debug!("Conversation snapshot load cancelled");
        let aborted = match inner.state.try_write() {
            Ok(mut state) => {
                state.index.abort_snapshot(ticket);
                true
            }
            Err(_) => false,
        };
        if !aborted {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    inner.state.write().await.index.abort_snapshot(ticket);
                });
            }
        }
    }
}

/// Keeps the conversation list and the open conversation in sync
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    pub fn new(
        config: Config,
        rest: Arc<dyn RestApi>,
        transport: Arc<dyn ChannelTransport>,
        session: SessionWatch,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.event_buffer);
        let (events, _) = broadcast::channel(config.event_buffer);
        let supervisor = ConnectionSupervisor::new(transport, &config, inbound_tx);
        Self {
            inner: Arc::new(CoordinatorInner {
                backoff: Backoff::from_config(&config),
                config,
                rest,
                supervisor,
                session,
                state: RwLock::new(SyncState::default()),
                generation: AtomicU64::new(Generation::SESSION.0),
                active: Mutex::new(None),
                events,
                inbound: std::sync::Mutex::new(Some(inbound_rx)),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the inbound event loop, session watcher, status forwarder and
    /// supervisor background tasks, then open the session topic if signed in.
    pub async fn start(&self) {
        let Some(inbound) = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            debug!("Coordinator already started");
            return;
        };

        let mut tasks = self.inner.supervisor.spawn_background();
        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_inbound(inbound).await }));
        let this = self.clone();
        let session = self.inner.session.subscribe();
        tasks.push(tokio::spawn(async move { this.run_session_watch(session).await }));
        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_status_forwarder().await }));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(tasks);

        if let Some(credential) = self.inner.session.current() {
            self.inner.supervisor.start(credential).await;
        }
        info!("Sync coordinator started");
    }

    /// Stop background work and release every subscription
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        if let Some(active) = self.inner.active.lock().await.take() {
            active.handle.close().await;
        }
        self.inner.supervisor.stop().await;
        info!("Sync coordinator shut down");
    }

    /// Change feed for the UI
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    pub fn session(&self) -> &SessionWatch {
        &self.inner.session
    }

    pub fn current_generation(&self) -> Generation {
        Generation(self.inner.generation.load(Ordering::SeqCst))
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.supervisor.status()
    }

    /// Ordered conversation list as seen by the signed-in user
    pub async fn conversations(&self) -> Vec<ConversationView> {
        let Some(credential) = self.inner.session.current() else {
            return Vec::new();
        };
        let snapshot = self.inner.state.read().await.index.snapshot();
        views(&snapshot, &credential.user_id)
    }

    /// Ordered messages of a selected conversation; empty until its backfill settles
    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.inner
            .state
            .read()
            .await
            .slots
            .get(conversation_id)
            .map(|slot| slot.stream.all().to_vec())
            .unwrap_or_default()
    }

    /// Whether older history remains to be paged in
    pub async fn has_older(&self, conversation_id: &str) -> bool {
        self.inner
            .state
            .read()
            .await
            .slots
            .get(conversation_id)
            .map(|slot| !slot.stream.cursor().exhausted)
            .unwrap_or(false)
    }

    /// Subscribe the list topic if needed and load a fresh snapshot
    pub async fn list_conversations(&self) -> Result<Vec<ConversationView>> {
        let credential = self.credential()?;
        self.inner.supervisor.start(credential.clone()).await;

        let ticket = self.inner.state.write().await.index.begin_snapshot();
        let pending = PendingSnapshot::new(self.inner.clone(), ticket);
        let fetched = self
            .with_retry("conversation list", || {
                self.inner.rest.list_conversations(&credential)
            })
            .await;

        let loaded = {
            let mut state = self.inner.state.write().await;
            pending.settled();
            match fetched {
                Ok(list) => state.index.load_snapshot(ticket, list),
                Err(e) => {
                    state.index.abort_snapshot(ticket);
                    return Err(e);
                }
            }
        };
        let Some(snapshot) = loaded else {
            debug!("Conversation snapshot outlived its session, dropped");
            return Ok(self.conversations().await);
        };
        info!("Loaded {} conversations", snapshot.len());
        self.emit(SyncEvent::ConversationsChanged);
        Ok(views(&snapshot, &credential.user_id))
    }

    /// Open a conversation: subscribe its message topic, backfill, go live.
    /// Only the latest selection ever merges its results.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<SelectOutcome> {
        let credential = self.credential()?;
        let generation = Generation(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);
        debug!("Selecting {} as {}", conversation_id, generation);

        {
            let mut active = self.inner.active.lock().await;
            if !self.is_current(generation) {
                return Ok(SelectOutcome::Superseded);
            }

            let reused = match active.take() {
                Some(current) if current.conversation_id == conversation_id => Some(current),
                Some(previous) => {
                    debug!("Closing messages of {}", previous.conversation_id);
                    previous.handle.close().await;
                    self.inner
                        .state
                        .write()
                        .await
                        .slots
                        .remove(&previous.conversation_id);
                    None
                }
                None => None,
            };
            // Closing yields; a newer selection may be waiting on the lock
            if !self.is_current(generation) {
                *active = reused;
                return Ok(SelectOutcome::Superseded);
            }

            self.inner.state.write().await.slots.insert(
                conversation_id.to_string(),
                Slot {
                    generation,
                    stream: MessageStream::new(conversation_id),
                },
            );

            let mut handle = match reused {
                Some(current) => {
                    current.handle.retag(generation);
                    current.handle
                }
                None => {
                    self.inner
                        .supervisor
                        .subscribe(Topic::messages(conversation_id), generation)
                        .await
                }
            };
            if !handle
                .wait_subscribed(self.inner.config.subscribe_timeout)
                .await
            {
                warn!(
                    "Messages of {} not confirmed within {:?}, backfilling anyway",
                    conversation_id, self.inner.config.subscribe_timeout
                );
            }
            *active = Some(ActiveConversation {
                conversation_id: conversation_id.to_string(),
                handle,
            });
        }

        let request = PageRequest {
            before: None,
            limit: self.inner.config.page_size,
        };
        let Some(page) = self
            .fetch_while_current(conversation_id, &request, generation)
            .await?
        else {
            debug!("Backfill of {} superseded", generation);
            return Ok(SelectOutcome::Superseded);
        };

        let messages = {
            let mut state = self.inner.state.write().await;
            if !self.is_current(generation) {
                return Ok(SelectOutcome::Superseded);
            }
            let Some(slot) = state
                .slots
                .get_mut(conversation_id)
                .filter(|slot| slot.generation == generation)
            else {
                return Ok(SelectOutcome::Superseded);
            };
            slot.stream.apply_backfill(page, request.limit);
            let buffered = slot.stream.finalize_backfill();
            debug!(
                "{} live for {} ({} buffered events kept)",
                conversation_id, generation, buffered
            );
            slot.stream.all().to_vec()
        };

        self.emit(SyncEvent::MessagesReset {
            conversation_id: conversation_id.to_string(),
        });
        Ok(SelectOutcome::Loaded {
            generation,
            messages,
        })
    }

    /// Page older history into the open conversation. Returns how many
    /// messages were new; zero when history is exhausted or the page went stale.
    pub async fn load_older(&self, conversation_id: &str) -> Result<usize> {
        let (generation, cursor, overlap) = {
            let state = self.inner.state.read().await;
            let slot = state
                .slots
                .get(conversation_id)
                .filter(|slot| slot.stream.is_live())
                .ok_or_else(|| {
                    SyncError::InvalidInput(format!("conversation {} is not open", conversation_id))
                })?;
            (
                slot.generation,
                slot.stream.cursor().clone(),
                slot.stream.loaded_at_oldest(),
            )
        };
        if cursor.exhausted {
            return Ok(0);
        }

        // `before` is inclusive so ties at the boundary are not skipped;
        // the repeated messages are deduplicated by id
        let request = PageRequest {
            before: cursor.oldest_loaded_at,
            limit: self.inner.config.page_size + overlap,
        };
        let Some(page) = self
            .fetch_while_current(conversation_id, &request, generation)
            .await?
        else {
            return Ok(0);
        };

        let added = {
            let mut state = self.inner.state.write().await;
            match state.slots.get_mut(conversation_id) {
                Some(slot) if slot.generation == generation && self.is_current(generation) => {
                    slot.stream.apply_backfill(page, request.limit)
                }
                _ => return Ok(0),
            }
        };
        if added > 0 {
            self.emit(SyncEvent::MessagesReset {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(added)
    }

    /// Post a message. The stream is only updated by the push echo.
    pub async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidInput("message is empty".to_string()));
        }
        let length = content.chars().count();
        if length > self.inner.config.max_message_len {
            return Err(SyncError::InvalidInput(format!(
                "message is {} characters, limit is {}",
                length, self.inner.config.max_message_len
            )));
        }
        let credential = self.credential()?;
        let message = self
            .inner
            .rest
            .create_message(&credential, conversation_id, content)
            .await?;
        debug!("Sent {} to {}", message.id, conversation_id);
        Ok(message)
    }

    /// Return the existing thread with `other_user_id`, or create one
    pub async fn create_conversation(&self, other_user_id: &str) -> Result<ConversationView> {
        let other_user_id = other_user_id.trim();
        if other_user_id.is_empty() {
            return Err(SyncError::InvalidInput("user id is empty".to_string()));
        }
        let credential = self.credential()?;
        if other_user_id == credential.user_id {
            return Err(SyncError::InvalidInput(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let existing = self
            .inner
            .state
            .read()
            .await
            .index
            .find_with_participant(&credential.user_id, other_user_id)
            .cloned();
        if let Some(conversation) = existing {
            return Ok(ConversationView::from_conversation(
                &conversation,
                &credential.user_id,
            ));
        }

        let created = self
            .inner
            .rest
            .create_conversation(&credential, other_user_id)
            .await?;
        info!("Created conversation {} with {}", created.id, other_user_id);
        let change = self
            .inner
            .state
            .write()
            .await
            .index
            .apply_live_event(ConversationEvent::Created(created.clone()));
        if change.is_change() {
            self.emit(SyncEvent::ConversationsChanged);
        }
        Ok(ConversationView::from_conversation(
            &created,
            &credential.user_id,
        ))
    }

    /// Case-insensitive match on the other participant's name (or id)
    pub async fn search_conversations(&self, term: &str) -> Vec<ConversationView> {
        let Some(credential) = self.inner.session.current() else {
            return Vec::new();
        };
        let needle = term.trim().to_lowercase();
        let user_id = credential.user_id.as_str();
        let matches = self.inner.state.read().await.index.filter(|c| {
            let peer = c
                .other_participant_name(user_id)
                .unwrap_or_else(|| c.other_participant(user_id));
            peer.to_lowercase().contains(&needle)
        });
        views(&matches, user_id)
    }

    fn credential(&self) -> Result<Credential> {
        self.inner
            .session
            .current()
            .ok_or_else(|| SyncError::NotConnected("not signed in".to_string()))
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation.0
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Retry retriable failures up to the failure budget, then report
    /// `ResourceExhausted`
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let budget = self.inner.config.degraded_after + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt >= budget => {
                    return Err(SyncError::ResourceExhausted(format!(
                        "{} failed {} times in a row, last: {}",
                        what, attempt, e
                    )));
                }
                Err(e) if e.is_retriable() => {
                    warn!("Fetching {} failed (attempt {}): {}", what, attempt, e);
                    self.inner.backoff.sleep(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch one page, retrying while `generation` is current. `None` once stale.
    async fn fetch_while_current(
        &self,
        conversation_id: &str,
        request: &PageRequest,
        generation: Generation,
    ) -> Result<Option<Vec<Message>>> {
        let auth_budget = self.inner.config.degraded_after + 1;
        let mut attempt: u32 = 0;
        let mut auth_failures: u32 = 0;
        loop {
            if !self.is_current(generation) {
                return Ok(None);
            }
            // Re-read so a rotated token is picked up between attempts
            let credential = self.credential()?;
            let error = match self
                .inner
                .rest
                .fetch_messages(&credential, conversation_id, request)
                .await
            {
                Ok(page) => return Ok(Some(page)),
                Err(e) => e,
            };

            if error.is_auth() {
                auth_failures += 1;
                if auth_failures >= auth_budget {
                    return Err(error);
                }
            } else if !error.is_retriable() {
                return Err(error);
            }
            attempt = attempt.saturating_add(1);
            warn!(
                "Backfill of {} failed (attempt {}): {}",
                conversation_id, attempt, error
            );
            self.inner.backoff.sleep(attempt).await;
        }
    }

    async fn run_inbound(self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(item) = inbound.recv().await {
            self.apply_inbound(item).await;
        }
        debug!("Inbound event loop finished");
    }

    async fn apply_inbound(&self, inbound: Inbound) {
        match inbound.topic.kind() {
            TopicKind::ConversationList { .. } => match inbound.event.into_conversation_event() {
                Ok(event) => {
                    let change = self.inner.state.write().await.index.apply_live_event(event);
                    if change.is_change() {
                        self.emit(SyncEvent::ConversationsChanged);
                    }
                }
                Err(e) => warn!("Dropping event on {}: {}", inbound.topic, e),
            },
            TopicKind::Messages { conversation_id } => match inbound.event.into_message_event() {
                Ok(MessageEvent::Inserted(message)) => {
                    self.apply_live_message(&conversation_id, inbound.generation, message)
                        .await
                }
                Err(e) => warn!("Dropping event on {}: {}", inbound.topic, e),
            },
            TopicKind::Heartbeat | TopicKind::Other => {
                debug!("Ignoring event on {}", inbound.topic);
            }
        }
    }

    async fn apply_live_message(
        &self,
        conversation_id: &str,
        generation: Generation,
        message: Message,
    ) {
        if message.conversation_id != conversation_id {
            warn!(
                "Message {} of {} arrived on messages:{}",
                message.id, message.conversation_id, conversation_id
            );
            return;
        }

        let (outcome, preview) = {
            let mut guard = self.inner.state.write().await;
            let state = &mut *guard;
            let outcome = match state.slots.get_mut(conversation_id) {
                Some(slot) if slot.generation == generation => {
                    slot.stream.append_live(message.clone())
                }
                Some(slot) => {
                    debug!(
                        "Dropping {} tagged {}, slot is {}",
                        message.id, generation, slot.generation
                    );
                    LiveOutcome::Ignored
                }
                None => LiveOutcome::Ignored,
            };
            (outcome, state.index.note_message(&message))
        };

        if preview.is_change() {
            self.emit(SyncEvent::ConversationsChanged);
        }
        if let Some(placement) = outcome.placement() {
            self.emit(SyncEvent::MessageReceived {
                conversation_id: conversation_id.to_string(),
                message,
                placement,
            });
        }
    }

    async fn run_session_watch(self, mut session: watch::Receiver<Option<Credential>>) {
        let mut user_id = session
            .borrow_and_update()
            .as_ref()
            .map(|c| c.user_id.clone());

        while session.changed().await.is_ok() {
            let credential = session.borrow_and_update().clone();
            let next_user = credential.as_ref().map(|c| c.user_id.clone());
            if next_user != user_id {
                self.reset_caches().await;
                user_id = next_user;
            }
            match credential {
                Some(credential) => self.inner.supervisor.start(credential).await,
                None => self.inner.supervisor.stop().await,
            }
        }
    }

    /// Forget everything cached for the previous user
    async fn reset_caches(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = self.inner.active.lock().await.take() {
            active.handle.close().await;
        }
        *self.inner.state.write().await = SyncState::default();
        info!("Session user changed, caches cleared");
        self.emit(SyncEvent::ConversationsChanged);
    }

    async fn run_status_forwarder(self) {
        let mut reports = self.inner.supervisor.subscribe_reports();
        let mut last = self.inner.supervisor.status();
        loop {
            match reports.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let status = self.inner.supervisor.status();
                    if status != last {
                        info!("Connection status: {:?}", status);
                        last = status;
                        self.emit(SyncEvent::StatusChanged { status });
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn views(conversations: &[Conversation], user_id: &str) -> Vec<ConversationView> {
    conversations
        .iter()
        .map(|c| ConversationView::from_conversation(c, user_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::MemoryBackend;
    use crate::transport::MemoryTransport;
    use chrono::{TimeZone, Utc};

    fn conversation(id: &str, other: &str, name: &str, secs: i64) -> Conversation {
        Conversation {
            id: id.to_string(),
            participant_a: "alice".to_string(),
            participant_b: other.to_string(),
            participant_a_name: Some("Alice".to_string()),
            participant_b_name: Some(name.to_string()),
            last_message_text: None,
            last_message_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn coordinator() -> (SyncCoordinator, MemoryBackend) {
        let hub = MemoryTransport::new();
        let backend = MemoryBackend::with_transport(hub.clone());
        let session = SessionWatch::new(Some(Credential::new("alice", "token")));
        let coordinator = SyncCoordinator::new(
            Config::default(),
            Arc::new(backend.clone()),
            Arc::new(hub),
            session,
        );
        (coordinator, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_validates_content() {
        let (coordinator, _backend) = coordinator();
        let blank = coordinator.send_message("c1", "   ").await;
        assert!(matches!(blank, Err(SyncError::InvalidInput(_))));

        let long = "x".repeat(Config::default().max_message_len + 1);
        let too_long = coordinator.send_message("c1", &long).await;
        assert!(matches!(too_long, Err(SyncError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_errors_are_returned() {
        let (coordinator, _backend) = coordinator();
        let result = coordinator.send_message("missing", "hi").await;
        assert!(matches!(result, Err(SyncError::Rejected { status: 404, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_matches_names_case_insensitively() {
        let (coordinator, backend) = coordinator();
        backend.insert_conversation(conversation("c1", "bob", "Bob Builder", 10));
        backend.insert_conversation(conversation("c2", "carol", "Carol", 20));
        coordinator.start().await;
        coordinator.list_conversations().await.unwrap();

        let found = coordinator.search_conversations("BUILD").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "c1");
        assert_eq!(coordinator.search_conversations("").await.len(), 2);
        assert!(coordinator.search_conversations("dave").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_conversation_reuses_existing_thread() {
        let (coordinator, backend) = coordinator();
        backend.insert_conversation(conversation("c1", "bob", "Bob", 10));
        coordinator.start().await;
        coordinator.list_conversations().await.unwrap();

        let existing = coordinator.create_conversation("bob").await.unwrap();
        assert_eq!(existing.id, "c1");

        let created = coordinator.create_conversation("carol").await.unwrap();
        assert_eq!(created.peer_id, "carol");
        assert_eq!(coordinator.conversations().await.len(), 2);

        let again = coordinator.create_conversation("carol").await.unwrap();
        assert_eq!(again.id, created.id);
        assert!(matches!(
            coordinator.create_conversation("alice").await,
            Err(SyncError::InvalidInput(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_retries_network_failures() {
        let (coordinator, backend) = coordinator();
        backend.insert_conversation(conversation("c1", "bob", "Bob", 10));
        backend.fail_next([
            SyncError::Network("reset".into()),
            SyncError::Network("reset".into()),
        ]);
        coordinator.start().await;

        let list = coordinator.list_conversations().await.unwrap();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_gives_up_after_budget() {
        let (coordinator, backend) = coordinator();
        backend.fail_next((0..6).map(|_| SyncError::Network("down".into())));
        coordinator.start().await;

        let result = coordinator.list_conversations().await;
        assert!(matches!(result, Err(SyncError::ResourceExhausted(_))));
        assert!(coordinator.conversations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_list_load_stops_recording() {
        let (coordinator, backend) = coordinator();
        backend.insert_conversation(conversation("c1", "bob", "Bob", 10));
        backend.fail_next([
            SyncError::Network("reset".into()),
            SyncError::Network("reset".into()),
        ]);
        coordinator.start().await;

        // Dropped while backing off after the first failure
        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            coordinator.list_conversations(),
        )
        .await;
        assert!(cancelled.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!coordinator.inner.state.read().await.index.is_recording());

        for secs in 11..=20 {
            let event = ConversationEvent::Updated(conversation("c9", "zed", "Zed", secs));
            coordinator
                .inner
                .state
                .write()
                .await
                .index
                .apply_live_event(event);
        }
        assert!(!coordinator.inner.state.read().await.index.is_recording());

        let list = coordinator.list_conversations().await.unwrap();
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_selection_does_not_subscribe() {
        let hub = MemoryTransport::new();
        let backend = MemoryBackend::with_transport(hub.clone());
        for id in ["a", "b", "c"] {
            backend.insert_conversation(conversation(id, "bob", "Bob", 10));
        }
        let coordinator = SyncCoordinator::new(
            Config::default(),
            Arc::new(backend.clone()),
            Arc::new(hub.clone()),
            SessionWatch::new(Some(Credential::new("alice", "token"))),
        );
        coordinator.start().await;
        coordinator.select_conversation("a").await.unwrap();

        // "b" takes the lock and starts closing "a"; "c" queues behind it
        let b = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.select_conversation("b").await })
        };
        let c = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.select_conversation("c").await })
        };
        assert!(b.await.unwrap().unwrap().is_superseded());
        assert!(!c.await.unwrap().unwrap().is_superseded());

        assert_eq!(hub.subscribe_attempts(&Topic::messages("b")), 0);
        assert_eq!(hub.subscriber_count(&Topic::messages("c")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_out_calls_fail() {
        let hub = MemoryTransport::new();
        let coordinator = SyncCoordinator::new(
            Config::default(),
            Arc::new(MemoryBackend::new()),
            Arc::new(hub),
            SessionWatch::default(),
        );
        assert!(matches!(
            coordinator.list_conversations().await,
            Err(SyncError::NotConnected(_))
        ));
        assert!(matches!(
            coordinator.select_conversation("c1").await,
            Err(SyncError::NotConnected(_))
        ));
        assert!(coordinator.conversations().await.is_empty());
    }
}
