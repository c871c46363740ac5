/// Connection supervision: owns topic subscriptions, reconnects with backoff,
/// and re-validates the transport with heartbeat subscriptions.
use crate::backoff::Backoff;
use crate::config::Config;
use crate::error::SyncError;
use crate::event::PushEvent;
use crate::model::{ConnectionState, ConnectionStatus, Credential, Generation};
use crate::transport::{ChannelTransport, Subscription, Topic};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

const REPORT_BUFFER: usize = 256;

/// Live event forwarded from an owned topic, tagged with the generation the
/// subscription belonged to when the event was read
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: Topic,
    pub generation: Generation,
    pub event: PushEvent,
}

/// One state transition of one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    pub topic: Topic,
    pub state: ConnectionState,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicRole {
    /// Session topic, re-derived from the credential on refresh
    ConversationList,
    /// Opened through `subscribe`, owned by a handle
    Extra,
}

struct TopicEntry {
    id: u64,
    role: TopicRole,
    tag: Arc<AtomicU64>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    pump: Option<JoinHandle<()>>,
}

enum ForwardEnd {
    /// Transport ended the stream without an error
    Closed,
    Failed(SyncError),
    /// Nobody consumes inbound events any more
    ConsumerGone,
}

struct Inner {
    transport: Arc<dyn ChannelTransport>,
    backoff: Backoff,
    degraded_after: u32,
    subscribe_timeout: Duration,
    health_check_timeout: Duration,
    health_check_interval: Duration,
    credential: RwLock<Option<Credential>>,
    topics: Mutex<HashMap<Topic, TopicEntry>>,
    /// Serializes start/refresh/stop/release
    lifecycle: tokio::sync::Mutex<()>,
    inbound: mpsc::Sender<Inbound>,
    reports: broadcast::Sender<StateReport>,
    refresh_tx: mpsc::UnboundedSender<()>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    next_id: AtomicU64,
    /// Refreshes triggered by rejected credentials since the last success
    auth_failures: AtomicU32,
}

/// Owns every topic subscription of the current session
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        config: &Config,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_BUFFER);
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                transport,
                backoff: Backoff::from_config(config),
                degraded_after: config.degraded_after,
                subscribe_timeout: config.subscribe_timeout,
                health_check_timeout: config.health_check_timeout,
                health_check_interval: config.health_check_interval,
                credential: RwLock::new(None),
                topics: Mutex::new(HashMap::new()),
                lifecycle: tokio::sync::Mutex::new(()),
                inbound,
                reports,
                refresh_tx,
                refresh_rx: Mutex::new(Some(refresh_rx)),
                next_id: AtomicU64::new(1),
                auth_failures: AtomicU32::new(0),
            }),
        }
    }

    /// Spawn the auth-refresh loop and the periodic health monitor.
    /// Only the first call spawns anything.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let Some(refresh_rx) = lock(&self.inner.refresh_rx).take() else {
            return Vec::new();
        };
        let refresher = {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.run_refresh_requests(refresh_rx).await })
        };
        let monitor = {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.run_health_monitor().await })
        };
        vec![refresher, monitor]
    }

    /// Observe every per-topic state transition
    pub fn subscribe_reports(&self) -> broadcast::Receiver<StateReport> {
        self.inner.reports.subscribe()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.inner.current_credential()
    }

    pub fn is_started(&self) -> bool {
        self.inner.current_credential().is_some()
    }

    /// Open the conversation-list topic for `credential`. No-op when already
    /// started with the same credential; a different one forces `refresh`.
    pub async fn start(&self, credential: Credential) {
        let _guard = self.inner.lifecycle.lock().await;
        match self.inner.current_credential() {
            Some(current) if current == credential => {
                debug!("Supervisor already started for {}", credential.user_id);
            }
            Some(_) => {
                info!("Session credential changed, refreshing subscriptions");
                self.inner.set_credential(Some(credential));
                self.refresh_locked().await;
            }
            None => {
                info!("Starting supervisor for {}", credential.user_id);
                let topic = Topic::conversation_list(&credential.user_id);
                self.inner.set_credential(Some(credential));
                self.inner.open(
                    topic,
                    TopicRole::ConversationList,
                    Generation::SESSION,
                    None,
                );
            }
        }
    }

    /// Close all owned topics and re-open them with the current credential
    pub async fn refresh(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.refresh_locked().await;
    }

    async fn refresh_locked(&self) {
        let Some(credential) = self.inner.current_credential() else {
            warn!("Refresh requested without a session credential");
            return;
        };

        let mut closing: Vec<(Topic, TopicEntry)> = lock(&self.inner.topics).drain().collect();
        info!("Refreshing {} subscriptions", closing.len());
        self.inner.shutdown_entries(&mut closing).await;

        for (topic, entry) in closing {
            if entry.role == TopicRole::Extra {
                let tag = Generation(entry.tag.load(Ordering::SeqCst));
                let reuse = Some((entry.id, entry.tag, entry.state_tx));
                self.inner.open(topic, TopicRole::Extra, tag, reuse);
            }
        }
        self.inner.open(
            Topic::conversation_list(&credential.user_id),
            TopicRole::ConversationList,
            Generation::SESSION,
            None,
        );
    }

    /// Close everything and forget the credential (sign-out)
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.set_credential(None);
        let mut closing: Vec<(Topic, TopicEntry)> = lock(&self.inner.topics).drain().collect();
        self.inner.shutdown_entries(&mut closing).await;
        for (topic, entry) in &closing {
            entry.state_tx.send_replace(ConnectionState::Disconnected);
            self.inner.broadcast(topic, ConnectionState::Disconnected, 0);
        }
        info!("Supervisor stopped, {} subscriptions closed", closing.len());
    }

    /// Open one more topic (the active conversation's messages). Events are
    /// tagged with `generation` until the handle is re-tagged.
    pub async fn subscribe(&self, topic: Topic, generation: Generation) -> SubscriptionHandle {
        let _guard = self.inner.lifecycle.lock().await;

        let stale = lock(&self.inner.topics).remove(&topic);
        if let Some(entry) = stale {
            warn!("Topic {} was still open, closing it before re-opening", topic);
            self.inner
                .shutdown_entries(&mut [(topic.clone(), entry)])
                .await;
        }

        let (id, tag, state_rx) = self.inner.open(topic.clone(), TopicRole::Extra, generation, None);
        SubscriptionHandle {
            topic,
            id,
            tag,
            state_rx,
            supervisor: self.clone(),
            closed: false,
        }
    }

    async fn release(&self, topic: &Topic, id: u64) {
        let _guard = self.inner.lifecycle.lock().await;
        let entry = {
            let mut topics = lock(&self.inner.topics);
            match topics.get(topic) {
                Some(entry) if entry.id == id => topics.remove(topic),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return;
        };
        let mut closing = [(topic.clone(), entry)];
        self.inner.shutdown_entries(&mut closing).await;
        closing[0].1.state_tx.send_replace(ConnectionState::Disconnected);
        self.inner.broadcast(topic, ConnectionState::Disconnected, 0);
        debug!("Released {}", topic);
    }

    /// Subscribe a throwaway heartbeat topic and wait (bounded) for the
    /// transport to confirm it
    pub async fn health_check(&self) -> bool {
        let Some(credential) = self.inner.current_credential() else {
            return false;
        };
        let topic = Topic::heartbeat();
        let healthy = match timeout(
            self.inner.health_check_timeout,
            self.inner.transport.subscribe(&topic, &credential),
        )
        .await
        {
            Ok(Ok(_subscription)) => true,
            Ok(Err(e)) => {
                warn!("Health check failed: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    "Health check timed out after {:?}",
                    self.inner.health_check_timeout
                );
                false
            }
        };
        if let Err(e) = self.inner.transport.unsubscribe(&topic).await {
            debug!("Heartbeat unsubscribe failed: {}", e);
        }
        healthy
    }

    /// State of one owned topic
    pub fn state(&self, topic: &Topic) -> Option<ConnectionState> {
        lock(&self.inner.topics).get(topic).map(|e| e.state)
    }

    /// Owned topics and their states, sorted by topic
    pub fn topics(&self) -> Vec<(Topic, ConnectionState)> {
        let mut list: Vec<_> = lock(&self.inner.topics)
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.state))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// Worst state over all owned topics
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::aggregate(lock(&self.inner.topics).values().map(|e| e.state))
    }

    async fn run_refresh_requests(self, mut requests: mpsc::UnboundedReceiver<()>) {
        while requests.recv().await.is_some() {
            while requests.try_recv().is_ok() {} // coalesce bursts
            let attempt = self.inner.auth_failures.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.backoff.sleep(attempt).await;
            info!("Refreshing after rejected credential (attempt {})", attempt);
            self.refresh().await;
        }
    }

    async fn run_health_monitor(self) {
        let mut ticker = interval(self.inner.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;
            if !self.is_started() {
                continue;
            }
            if self.health_check().await {
                debug!("Health check passed");
                continue;
            }
            warn!("Transport unhealthy, refreshing subscriptions");
            self.inner.mark_all(ConnectionState::Reconnecting);
            self.refresh().await;
        }
    }
}

impl Inner {
    fn current_credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_credential(&self, credential: Option<Credential>) {
        *self
            .credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = credential;
    }

    /// Register `topic` and spawn its pump. `reuse` keeps the identity of an
    /// entry that is being re-opened by a refresh.
    fn open(
        self: &Arc<Self>,
        topic: Topic,
        role: TopicRole,
        generation: Generation,
        reuse: Option<(u64, Arc<AtomicU64>, watch::Sender<ConnectionState>)>,
    ) -> (u64, Arc<AtomicU64>, watch::Receiver<ConnectionState>) {
        let (id, tag, state_tx) = reuse.unwrap_or_else(|| {
            (
                self.next_id.fetch_add(1, Ordering::SeqCst),
                Arc::new(AtomicU64::new(generation.0)),
                watch::channel(ConnectionState::Connecting).0,
            )
        });
        state_tx.send_replace(ConnectionState::Connecting);
        let state_rx = state_tx.subscribe();

        let mut topics = lock(&self.topics);
        let pump = {
            let inner = self.clone();
            let topic = topic.clone();
            let tag = tag.clone();
            tokio::spawn(async move { inner.run_pump(topic, id, tag).await })
        };
        topics.insert(
            topic,
            TopicEntry {
                id,
                role,
                tag: tag.clone(),
                state: ConnectionState::Connecting,
                state_tx,
                pump: Some(pump),
            },
        );
        (id, tag, state_rx)
    }

    /// Stop pumps and release the topics on the transport
    async fn shutdown_entries(&self, entries: &mut [(Topic, TopicEntry)]) {
        let pumps: Vec<JoinHandle<()>> = entries
            .iter_mut()
            .filter_map(|(_, entry)| entry.pump.take())
            .collect();
        for pump in &pumps {
            pump.abort();
        }
        let _ = join_all(pumps).await;

        for (topic, _) in entries.iter() {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                warn!("Unsubscribe of {} failed: {}", topic, e);
            }
        }
    }

    /// Keep one topic subscribed until the pump is aborted
    async fn run_pump(self: Arc<Self>, topic: Topic, id: u64, tag: Arc<AtomicU64>) {
        let mut failures: u32 = 0;
        self.report(&topic, id, ConnectionState::Connecting, 0);

        loop {
            let Some(credential) = self.current_credential() else {
                self.report(&topic, id, ConnectionState::Disconnected, failures);
                return;
            };

            let attempt = timeout(
                self.subscribe_timeout,
                self.transport.subscribe(&topic, &credential),
            )
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::Timeout(format!(
                    "subscribe to {} not confirmed within {:?}",
                    topic, self.subscribe_timeout
                )))
            });

            let error = match attempt {
                Ok(mut subscription) => {
                    failures = 0;
                    self.auth_failures.store(0, Ordering::SeqCst);
                    self.report(&topic, id, ConnectionState::Subscribed, 0);
                    let end = self.forward(&topic, &tag, &mut subscription).await;
                    // Stream is finished either way; release it before retrying
                    if let Err(e) = self.transport.unsubscribe(&topic).await {
                        debug!("Unsubscribe of dead topic {} failed: {}", topic, e);
                    }
                    match end {
                        ForwardEnd::ConsumerGone => {
                            debug!("Inbound consumer gone, stopping pump for {}", topic);
                            return;
                        }
                        ForwardEnd::Closed => {
                            SyncError::Network(format!("{} closed by transport", topic))
                        }
                        ForwardEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            if error.is_auth() {
                let n = self.auth_failures.load(Ordering::SeqCst) + 1;
                self.report(&topic, id, self.failure_state(n), n);
                warn!("Credential rejected on {}: {}", topic, error);
                let _ = self.refresh_tx.send(());
                return; // the refresh re-opens this topic
            }

            failures = failures.saturating_add(1);
            let state = self.failure_state(failures);
            self.report(&topic, id, state, failures);
            if state == ConnectionState::Degraded {
                let exhausted = SyncError::ResourceExhausted(format!(
                    "{} failed {} times in a row, last: {}",
                    topic, failures, error
                ));
                warn!("{}", exhausted);
            } else {
                warn!("{} failed (attempt {}): {}", topic, failures, error);
            }
            self.backoff.sleep(failures).await;
        }
    }

    async fn forward(
        &self,
        topic: &Topic,
        tag: &AtomicU64,
        subscription: &mut Subscription,
    ) -> ForwardEnd {
        while let Some(item) = subscription.events.recv().await {
            match item {
                Ok(event) => {
                    let inbound = Inbound {
                        topic: topic.clone(),
                        generation: Generation(tag.load(Ordering::SeqCst)),
                        event,
                    };
                    if self.inbound.send(inbound).await.is_err() {
                        return ForwardEnd::ConsumerGone;
                    }
                }
                Err(SyncError::Protocol(reason)) => {
                    warn!("Dropping malformed event on {}: {}", topic, reason);
                }
                Err(e) => return ForwardEnd::Failed(e),
            }
        }
        ForwardEnd::Closed
    }

    /// `Reconnecting` within the failure budget, `Degraded` past it
    fn failure_state(&self, consecutive_failures: u32) -> ConnectionState {
        if consecutive_failures > self.degraded_after {
            ConnectionState::Degraded
        } else {
            ConnectionState::Reconnecting
        }
    }

    fn report(&self, topic: &Topic, id: u64, state: ConnectionState, failures: u32) {
        {
            let mut topics = lock(&self.topics);
            match topics.get_mut(topic) {
                Some(entry) if entry.id == id => {
                    entry.state = state;
                    entry.state_tx.send_replace(state);
                }
                _ => return, // released or replaced meanwhile
            }
        }
        self.broadcast(topic, state, failures);
    }

    fn broadcast(&self, topic: &Topic, state: ConnectionState, failures: u32) {
        debug!("{} -> {:?} (failures: {})", topic, state, failures);
        let _ = self.reports.send(StateReport {
            topic: topic.clone(),
            state,
            consecutive_failures: failures,
        });
    }

    fn mark_all(&self, state: ConnectionState) {
        let marked: Vec<Topic> = {
            let mut topics = lock(&self.topics);
            topics
                .iter_mut()
                .map(|(topic, entry)| {
                    entry.state = state;
                    entry.state_tx.send_replace(state);
                    topic.clone()
                })
                .collect()
        };
        for topic in marked {
            self.broadcast(&topic, state, 0);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases one supervised topic. Dropping an unclosed handle releases it in
/// the background.
pub struct SubscriptionHandle {
    topic: Topic,
    id: u64,
    tag: Arc<AtomicU64>,
    state_rx: watch::Receiver<ConnectionState>,
    supervisor: ConnectionSupervisor,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn generation(&self) -> Generation {
        Generation(self.tag.load(Ordering::SeqCst))
    }

    /// Tag events read from now on with `generation`
    pub fn retag(&self, generation: Generation) {
        self.tag.store(generation.0, Ordering::SeqCst);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the transport confirms the topic; false on timeout
    pub async fn wait_subscribed(&mut self, limit: Duration) -> bool {
        matches!(
            timeout(
                limit,
                self.state_rx
                    .wait_for(|state| *state == ConnectionState::Subscribed)
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Stop the pump and unsubscribe; returns once the topic is released
    pub async fn close(mut self) {
        self.closed = true;
        self.supervisor.release(&self.topic, self.id).await;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let supervisor = self.supervisor.clone();
        let topic = self.topic.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { supervisor.release(&topic, id).await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EntityKind, EventKind};
    use crate::transport::MemoryTransport;

    fn credential(user: &str) -> Credential {
        Credential::new(user, "token")
    }

    fn supervisor(hub: &MemoryTransport) -> (ConnectionSupervisor, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(64);
        let supervisor = ConnectionSupervisor::new(Arc::new(hub.clone()), &Config::default(), tx);
        (supervisor, rx)
    }

    async fn states_until(
        reports: &mut broadcast::Receiver<StateReport>,
        topic: &Topic,
        last: ConnectionState,
    ) -> Vec<ConnectionState> {
        let mut trace = Vec::new();
        loop {
            let report = reports.recv().await.unwrap();
            if &report.topic != topic {
                continue;
            }
            trace.push(report.state);
            if report.state == last {
                return trace;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_four_failures_then_subscribed() {
        let hub = MemoryTransport::new();
        hub.fail_next_subscribes((0..4).map(|i| SyncError::Network(format!("down {}", i))));
        let (supervisor, _inbound) = supervisor(&hub);
        let mut reports = supervisor.subscribe_reports();

        supervisor.start(credential("alice")).await;
        let topic = Topic::conversation_list("alice");
        let trace = states_until(&mut reports, &topic, ConnectionState::Subscribed).await;

        use ConnectionState::*;
        assert_eq!(
            trace,
            vec![Connecting, Reconnecting, Reconnecting, Reconnecting, Reconnecting, Subscribed]
        );
        assert_eq!(supervisor.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_failure_degrades() {
        let hub = MemoryTransport::new();
        hub.fail_next_subscribes((0..6).map(|_| SyncError::Network("down".into())));
        let (supervisor, _inbound) = supervisor(&hub);
        let mut reports = supervisor.subscribe_reports();

        supervisor.start(credential("alice")).await;
        let topic = Topic::conversation_list("alice");
        let mut failures = Vec::new();
        while failures.len() < 6 {
            let report = reports.recv().await.unwrap();
            if report.topic == topic && report.consecutive_failures > 0 {
                failures.push(report);
            }
        }

        assert_eq!(failures[4].state, ConnectionState::Reconnecting);
        assert_eq!(failures[5].state, ConnectionState::Degraded);
        assert_eq!(failures[5].consecutive_failures, 6);

        // Still retrying, and recovers once the transport does
        let trace = states_until(&mut reports, &topic, ConnectionState::Subscribed).await;
        assert_eq!(trace, vec![ConnectionState::Subscribed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;
        supervisor.start(credential("alice")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let topic = Topic::conversation_list("alice");
        assert_eq!(hub.subscribe_attempts(&topic), 1);
        assert_eq!(hub.subscriber_count(&topic), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_change_refreshes_topics() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;
        let mut handle = supervisor
            .subscribe(Topic::messages("c1"), Generation(1))
            .await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);

        supervisor.start(credential("bob")).await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let topics: Vec<Topic> = supervisor.topics().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            topics,
            vec![Topic::conversation_list("bob"), Topic::messages("c1")]
        );
        assert_eq!(hub.subscriber_count(&Topic::conversation_list("alice")), 0);
        assert_eq!(hub.subscriber_count(&Topic::messages("c1")), 1);
        assert_eq!(handle.generation(), Generation(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_topic() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;

        let topic = Topic::messages("c1");
        let mut handle = supervisor.subscribe(topic.clone(), Generation(1)).await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);
        assert_eq!(hub.subscriber_count(&topic), 1);

        handle.close().await;
        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(supervisor.state(&topic), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_releases_topic() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;

        let topic = Topic::messages("c1");
        let mut handle = supervisor.subscribe(topic.clone(), Generation(1)).await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);
        drop(handle);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(hub.subscriber_count(&topic), 0);
        assert_eq!(supervisor.state(&topic), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_carry_current_tag() {
        let hub = MemoryTransport::new();
        let (supervisor, mut inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;

        let topic = Topic::messages("c1");
        let mut handle = supervisor.subscribe(topic.clone(), Generation(3)).await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);
        handle.retag(Generation(4));

        let event = PushEvent {
            kind: EventKind::Inserted,
            entity: EntityKind::Message,
            payload: serde_json::json!({}),
        };
        assert_eq!(hub.publish(&topic, event), 1);
        let received = inbound.recv().await.unwrap();
        assert_eq!(received.topic, topic);
        assert_eq!(received.generation, Generation(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_loss_resubscribes() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        let mut reports = supervisor.subscribe_reports();
        supervisor.start(credential("alice")).await;
        let topic = Topic::conversation_list("alice");
        states_until(&mut reports, &topic, ConnectionState::Subscribed).await;

        hub.drop_topic(&topic);
        let trace = states_until(&mut reports, &topic, ConnectionState::Subscribed).await;
        assert_eq!(
            trace,
            vec![ConnectionState::Reconnecting, ConnectionState::Subscribed]
        );
        assert_eq!(hub.subscribe_attempts(&topic), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_triggers_refresh() {
        let hub = MemoryTransport::new();
        hub.fail_next_subscribes([SyncError::Auth("expired".into())]);
        let (supervisor, _inbound) = supervisor(&hub);
        let _background = supervisor.spawn_background();
        let mut reports = supervisor.subscribe_reports();

        supervisor.start(credential("alice")).await;
        let topic = Topic::conversation_list("alice");
        let trace = states_until(&mut reports, &topic, ConnectionState::Subscribed).await;

        assert!(trace.contains(&ConnectionState::Reconnecting));
        assert_eq!(hub.subscribe_attempts(&topic), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_times_out() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        assert!(!supervisor.health_check().await);

        supervisor.start(credential("alice")).await;
        assert!(supervisor.health_check().await);

        hub.set_unresponsive(true);
        assert!(!supervisor.health_check().await);
        hub.set_unresponsive(false);
        assert!(supervisor.health_check().await);
        assert!(hub
            .active_topics()
            .iter()
            .all(|topic| !topic.as_str().starts_with("heartbeat:")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_everything() {
        let hub = MemoryTransport::new();
        let (supervisor, _inbound) = supervisor(&hub);
        supervisor.start(credential("alice")).await;
        let mut handle = supervisor
            .subscribe(Topic::messages("c1"), Generation(1))
            .await;
        assert!(handle.wait_subscribed(Duration::from_secs(1)).await);

        supervisor.stop().await;
        assert!(hub.active_topics().is_empty());
        assert!(supervisor.topics().is_empty());
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!supervisor.is_started());
    }
}
