// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker connection management.
//!
//! A [`ConnectionManager`] owns one broker session. Its event-loop task is the
//! delivery context for inbound messages and the only writer of the
//! connection state. Outbound messages go through a bounded queue drained by
//! a small pool of dispatcher tasks, so `publish` never waits on the network.
//!
//! The network side sits behind [`Transport`] and [`BrokerClient`];
//! [`crate::mqtt`] implements them over rumqttc and [`crate::mock`] in memory.

use crate::config::{EndpointConfig, QosLevel, ReconnectConfig};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long `disconnect` waits for the session to close cleanly.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Broker client error: {0}")]
    Client(String),

    #[error("Gave up after {attempts} reconnect attempts (last error: {last})")]
    ReconnectExhausted { attempts: u32, last: String },

    #[error("Publish queue full")]
    QueueFull,

    #[error("Connection closed")]
    Closed,

    #[error("Connection already started")]
    AlreadyStarted,

    #[error("Invalid endpoint: {0}")]
    Endpoint(String),
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What to do after a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`; this is attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted. The connection is fatal.
    GiveUp { attempts: u32 },
}

/// Pure reconnect bookkeeping, driven by the event loop.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    attempts: u32,
    fatal: bool,
    policy: ReconnectConfig,
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            fatal: false,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// First connection attempt begins.
    pub fn start(&mut self) {
        if self.state == ConnectionState::Disconnected && !self.fatal {
            self.state = ConnectionState::Connecting;
        }
    }

    /// A session was established: the attempt budget is refilled.
    pub fn on_session(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempts = 0;
    }

    /// A connect attempt failed or a live session was lost.
    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.fatal || self.attempts >= self.policy.max_attempts {
            self.fatal = true;
            self.state = ConnectionState::Disconnected;
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }
        self.attempts += 1;
        self.state = ConnectionState::Reconnecting;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.interval(),
        }
    }

    /// The session was closed on request.
    pub fn on_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }
}

/// Event produced by a transport poll.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A session was established (CONNACK).
    Connected,
    /// Inbound application message.
    Message { topic: String, payload: Vec<u8> },
    /// The session was closed after a local disconnect request.
    Closed,
    /// Protocol traffic with no meaning to the manager.
    Other,
}

/// Event source of a broker session.
///
/// `poll` also drives reconnection: after an error, the next poll starts a
/// new connection attempt.
pub trait Transport: Send + 'static {
    type Client: BrokerClient;

    /// Request handle bound to this transport.
    fn client(&self) -> Self::Client;

    /// Wait for the next event.
    fn poll(&mut self) -> impl Future<Output = Result<TransportEvent, ConnectionError>> + Send;
}

/// Request side of a broker session. Requests are queued, not awaited.
pub trait BrokerClient: Clone + Send + Sync + 'static {
    fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), ConnectionError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError>;

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;

    fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Anything that accepts outbound messages without blocking.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: String, payload: Vec<u8>, qos: QosLevel) -> Result<(), ConnectionError>;
}

/// Inbound delivery callback: `(topic, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Static settings of a managed connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub topics: Vec<String>,
    pub qos: QosLevel,
    pub reconnect: ReconnectConfig,
    pub queue_capacity: usize,
    pub publish_workers: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            qos: QosLevel::default(),
            reconnect: ReconnectConfig::default(),
            queue_capacity: 1024,
            publish_workers: 2,
        }
    }
}

impl ConnectionSettings {
    /// Subscription and reconnect settings from an endpoint.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Self {
        Self {
            topics: endpoint.topics.clone(),
            qos: endpoint.qos,
            reconnect: endpoint.reconnect.clone(),
            ..Default::default()
        }
    }

    /// Set publish queue bound and dispatcher count.
    pub fn with_queue(mut self, capacity: usize, workers: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self.publish_workers = workers.max(1);
        self
    }
}

/// Published view of the connection state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempts: u32,
    pub fatal: Option<ConnectionError>,
}

/// Per-connection traffic counters.
#[derive(Debug, Default)]
pub struct ConnectionCounters {
    pub received: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
}

/// Snapshot of [`ConnectionCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCountersSnapshot {
    pub received: u64,
    pub published: u64,
    pub publish_failures: u64,
}

impl ConnectionCounters {
    pub fn snapshot(&self) -> ConnectionCountersSnapshot {
        ConnectionCountersSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

struct Outbound {
    topic: String,
    payload: Vec<u8>,
    qos: QosLevel,
}

struct Shared {
    name: String,
    status: watch::Sender<ConnectionStatus>,
    closing: AtomicBool,
    counters: ConnectionCounters,
}

#[derive(Default)]
struct Tasks {
    event_loop: Option<JoinHandle<()>>,
    dispatchers: Vec<JoinHandle<()>>,
}

/// One managed broker connection.
pub struct ConnectionManager<T: Transport> {
    settings: ConnectionSettings,
    client: T::Client,
    transport: Mutex<Option<T>>,
    handler: Mutex<Option<MessageHandler>>,
    queue: Mutex<Option<mpsc::Sender<Outbound>>>,
    tasks: Mutex<Tasks>,
    stop: watch::Sender<bool>,
    shared: Arc<Shared>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager around a not-yet-polled transport.
    pub fn new(name: impl Into<String>, transport: T, settings: ConnectionSettings) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (stop, _) = watch::channel(false);
        Self {
            client: transport.client(),
            settings,
            transport: Mutex::new(Some(transport)),
            handler: Mutex::new(None),
            queue: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            stop,
            shared: Arc::new(Shared {
                name: name.into(),
                status,
                closing: AtomicBool::new(false),
                counters: ConnectionCounters::default(),
            }),
        }
    }

    /// Connection name, as used in logs.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Register the inbound delivery handler. Must be called before `connect`.
    pub fn on_message(&self, handler: MessageHandler) {
        *self.handler.lock() = Some(handler);
    }

    /// Start the session and wait until it is established.
    ///
    /// Fails with [`ConnectionError::ReconnectExhausted`] when the broker
    /// cannot be reached within the reconnect budget.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let transport = self
            .transport
            .lock()
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;
        let handler = self.handler.lock().clone();

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        *self.queue.lock() = Some(tx);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut dispatchers = Vec::with_capacity(self.settings.publish_workers);
        for _ in 0..self.settings.publish_workers.max(1) {
            dispatchers.push(tokio::spawn(run_dispatcher(
                self.client.clone(),
                rx.clone(),
                self.shared.clone(),
            )));
        }

        let event_loop = tokio::spawn(run_event_loop(
            transport,
            self.client.clone(),
            handler,
            self.settings.clone(),
            self.shared.clone(),
            self.stop.subscribe(),
        ));

        {
            let mut tasks = self.tasks.lock();
            tasks.event_loop = Some(event_loop);
            tasks.dispatchers = dispatchers;
        }

        let mut status = self.shared.status.subscribe();
        let fatal = status
            .wait_for(|s| s.state == ConnectionState::Connected || s.fatal.is_some())
            .await
            .map_err(|_| ConnectionError::Closed)?
            .fatal
            .clone();

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop accepting publishes, drain for at most `grace`, then close.
    pub async fn disconnect(&self, grace: Duration) {
        drop(self.queue.lock().take());

        let (event_loop, mut dispatchers) = {
            let mut tasks = self.tasks.lock();
            (tasks.event_loop.take(), std::mem::take(&mut tasks.dispatchers))
        };

        let drained = tokio::time::timeout(grace, async {
            for handle in dispatchers.iter_mut() {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                connection = %self.shared.name,
                grace_ms = grace.as_millis() as u64,
                "Publish queue not drained before grace period, dropping the rest"
            );
            for handle in &dispatchers {
                handle.abort();
            }
        }

        self.shared.closing.store(true, Ordering::Relaxed);
        if let Some(mut handle) = event_loop {
            if !handle.is_finished() {
                for topic in &self.settings.topics {
                    let _ = self.client.unsubscribe(topic);
                }
                let _ = self.client.disconnect();
            }
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                let _ = self.stop.send(true);
                handle.abort();
            }
        }

        self.shared.status.send_modify(|s| s.state = ConnectionState::Disconnected);
        tracing::info!(connection = %self.shared.name, "Disconnected");
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    /// Current published status.
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    /// Traffic counters.
    pub fn counters(&self) -> ConnectionCountersSnapshot {
        self.shared.counters.snapshot()
    }

    /// Resolve once the connection has given up reconnecting.
    pub async fn wait_fatal(&self) -> ConnectionError {
        let mut status = self.shared.status.subscribe();
        let fatal = match status.wait_for(|s| s.fatal.is_some()).await {
            Ok(s) => s.fatal.clone().unwrap_or(ConnectionError::Closed),
            Err(_) => ConnectionError::Closed,
        };
        fatal
    }

    /// Queue one message for publishing.
    pub fn publish(&self, topic: String, payload: Vec<u8>, qos: QosLevel) -> Result<(), ConnectionError> {
        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(ConnectionError::Closed)?;
        tx.try_send(Outbound {
            topic,
            payload,
            qos,
        })
        .map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }
}

impl<T: Transport> Publisher for ConnectionManager<T> {
    fn publish(&self, topic: String, payload: Vec<u8>, qos: QosLevel) -> Result<(), ConnectionError> {
        ConnectionManager::publish(self, topic, payload, qos)
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(handle) = tasks.event_loop.take() {
            handle.abort();
        }
        for handle in tasks.dispatchers.drain(..) {
            handle.abort();
        }
    }
}

async fn run_event_loop<T: Transport>(
    mut transport: T,
    client: T::Client,
    handler: Option<MessageHandler>,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) {
    let name = shared.name.as_str();
    let mut machine = ConnectionStateMachine::new(settings.reconnect.clone());
    machine.start();
    publish_status(&shared, &machine, None);

    // Topics the current session still lacks, retried while polling continues.
    let mut unsubscribed: Vec<String> = Vec::new();
    let mut subscribe_retries = 0u32;
    let mut retry_at: Option<Instant> = None;

    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            _ = wait_until(retry_at) => {
                subscribe_retries += 1;
                let (rejected, last) = subscribe_topics(&client, &unsubscribed, settings.qos, name);
                unsubscribed = rejected;
                match last {
                    None => {
                        retry_at = None;
                        tracing::info!(connection = name, retries = subscribe_retries, "Subscriptions restored");
                    }
                    Some(e) if subscribe_retries >= settings.reconnect.max_attempts => {
                        tracing::error!(
                            connection = name,
                            missing = unsubscribed.len(),
                            "Subscribe still failing after {} retries, giving up",
                            subscribe_retries
                        );
                        let fatal = ConnectionError::ReconnectExhausted {
                            attempts: subscribe_retries,
                            last: e.to_string(),
                        };
                        publish_status(&shared, &machine, Some(fatal));
                        return;
                    }
                    Some(_) => retry_at = Some(Instant::now() + settings.reconnect.interval()),
                }
                continue;
            }
            event = transport.poll() => event,
        };

        match event {
            Ok(TransportEvent::Connected) => {
                machine.on_session();
                let (rejected, last) = subscribe_topics(&client, &settings.topics, settings.qos, name);
                unsubscribed = rejected;
                subscribe_retries = 0;
                retry_at = last.map(|_| Instant::now() + settings.reconnect.interval());
                publish_status(&shared, &machine, None);
                tracing::info!(connection = name, topics = settings.topics.len(), "Session established");
            }
            Ok(TransportEvent::Message { topic, payload }) => {
                shared.counters.received.fetch_add(1, Ordering::Relaxed);
                if let Some(handler) = &handler {
                    handler(&topic, &payload);
                }
            }
            Ok(TransportEvent::Closed) => {
                if shared.closing.load(Ordering::Relaxed) {
                    break;
                }
            }
            Ok(TransportEvent::Other) => {}
            Err(e) => {
                if shared.closing.load(Ordering::Relaxed) {
                    break;
                }
                unsubscribed.clear();
                retry_at = None;
                match machine.on_failure() {
                    ReconnectDecision::Retry { attempt, delay } => {
                        tracing::warn!(
                            connection = name,
                            attempt,
                            max = settings.reconnect.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Connection error: {}, retrying",
                            e
                        );
                        publish_status(&shared, &machine, None);
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    ReconnectDecision::GiveUp { attempts } => {
                        tracing::error!(connection = name, attempts, "Connection error: {}, giving up", e);
                        let fatal = ConnectionError::ReconnectExhausted {
                            attempts,
                            last: e.to_string(),
                        };
                        publish_status(&shared, &machine, Some(fatal));
                        return;
                    }
                }
            }
        }
    }

    machine.on_closed();
    publish_status(&shared, &machine, None);
}

/// Subscribe each topic; returns the rejected ones and the last error.
fn subscribe_topics<C: BrokerClient>(
    client: &C,
    topics: &[String],
    qos: QosLevel,
    name: &str,
) -> (Vec<String>, Option<ConnectionError>) {
    let mut rejected = Vec::new();
    let mut last = None;
    for topic in topics {
        if let Err(e) = client.subscribe(topic, qos) {
            tracing::warn!(connection = name, topic = %topic, "Subscribe failed: {}", e);
            rejected.push(topic.clone());
            last = Some(e);
        }
    }
    (rejected, last)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn publish_status(shared: &Shared, machine: &ConnectionStateMachine, fatal: Option<ConnectionError>) {
    shared.status.send_modify(|s| {
        s.state = machine.state();
        s.attempts = machine.attempts();
        if fatal.is_some() {
            s.fatal = fatal;
        }
    });
}

async fn run_dispatcher<C: BrokerClient>(
    client: C,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
    shared: Arc<Shared>,
) {
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(msg) = next else { break };
        match client.publish(msg.topic.clone(), msg.payload, msg.qos).await {
            Ok(()) => {
                shared.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(connection = %shared.name, topic = %msg.topic, "Publish failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    fn policy(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            interval_ms: 5000,
        }
    }

    fn settings(topics: &[&str]) -> ConnectionSettings {
        ConnectionSettings {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_machine_bounded_retries() {
        let mut machine = ConnectionStateMachine::new(policy(10));
        machine.start();
        assert_eq!(machine.state(), ConnectionState::Connecting);

        for expected in 1..=10 {
            match machine.on_failure() {
                ReconnectDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, expected);
                    assert_eq!(delay, Duration::from_millis(5000));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(machine.state(), ConnectionState::Reconnecting);
        }

        assert_eq!(machine.on_failure(), ReconnectDecision::GiveUp { attempts: 10 });
        assert!(machine.is_fatal());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(matches!(machine.on_failure(), ReconnectDecision::GiveUp { .. }));
    }

    #[test]
    fn test_state_machine_session_resets_attempts() {
        let mut machine = ConnectionStateMachine::new(policy(2));
        machine.start();
        machine.on_failure();
        machine.on_failure();
        machine.on_session();
        assert_eq!(machine.attempts(), 0);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(matches!(machine.on_failure(), ReconnectDecision::Retry { attempt: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_topics() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        let manager = ConnectionManager::new("src", transport, settings(&["tags/+", "zones/#"]));

        manager.connect().await.expect("connect");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.subscriptions(), vec!["tags/+".to_string(), "zones/#".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_exhausted() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        for i in 0..12 {
            broker.fail(format!("refused {}", i));
        }
        let mut s = settings(&["tags/+"]);
        s.reconnect = policy(10);
        let manager = ConnectionManager::new("src", transport, s);

        manager.connect().await.expect("connect");
        let fatal = manager.wait_fatal().await;

        assert_eq!(
            fatal,
            ConnectionError::ReconnectExhausted {
                attempts: 10,
                last: "Transport error: refused 10".into()
            }
        );
        // One session poll, the loss, then ten failed retries. No eleventh.
        assert_eq!(broker.polls(), 12);
        assert_eq!(broker.pending(), 1);
        assert!(manager.status().fatal.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_connect_failure_is_fatal() {
        let (transport, broker) = MockTransport::new();
        for _ in 0..5 {
            broker.fail("unreachable");
        }
        let mut s = settings(&[]);
        s.reconnect = policy(3);
        let manager = ConnectionManager::new("dst", transport, s);

        let err = manager.connect().await.expect_err("must fail");
        assert!(matches!(err, ConnectionError::ReconnectExhausted { attempts: 3, .. }));
        assert_eq!(broker.polls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_after_reconnect() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.fail("lost");
        broker.connect_ack();
        let manager = ConnectionManager::new("src", transport, settings(&["tags/+"]));

        manager.connect().await.expect("connect");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(broker.subscriptions(), vec!["tags/+".to_string(), "tags/+".to_string()]);
        assert_eq!(manager.status().attempts, 0);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_subscribe_retried() {
        let (transport, broker) = MockTransport::new();
        broker.fail_subscribes(1);
        broker.connect_ack();
        let manager = ConnectionManager::new("src", transport, settings(&["tags/+"]));

        manager.connect().await.expect("connect");
        assert!(broker.subscriptions().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(broker.subscriptions(), vec!["tags/+".to_string()]);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.status().fatal.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_rejected_until_budget_exhausted() {
        let (transport, broker) = MockTransport::new();
        broker.fail_subscribes(usize::MAX);
        broker.connect_ack();
        let mut s = settings(&["tags/+", "zones/#"]);
        s.reconnect = policy(3);
        let manager = ConnectionManager::new("src", transport, s);

        manager.connect().await.expect("connect");
        let fatal = manager.wait_fatal().await;

        assert_eq!(
            fatal,
            ConnectionError::ReconnectExhausted {
                attempts: 3,
                last: "Broker client error: subscribe rejected".into()
            }
        );
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_reach_handler() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.deliver("tags/1", b"one".to_vec());
        broker.deliver("tags/2", b"two".to_vec());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = ConnectionManager::new("src", transport, settings(&["tags/+"]));
        let sink = seen.clone();
        manager.on_message(Arc::new(move |topic: &str, payload: &[u8]| {
            sink.lock().push((topic.to_string(), payload.to_vec()));
        }));

        manager.connect().await.expect("connect");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[1], ("tags/2".to_string(), b"two".to_vec()));
        assert_eq!(manager.counters().received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_queue_bound_and_drain() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.hold_publishes(true);
        let manager = ConnectionManager::new(
            "dst",
            transport,
            ConnectionSettings::default().with_queue(1, 1),
        );

        assert_eq!(
            manager.publish("a".into(), vec![1], QosLevel::AtLeastOnce),
            Err(ConnectionError::Closed)
        );

        manager.connect().await.expect("connect");
        manager.publish("a".into(), vec![1], QosLevel::AtLeastOnce).expect("first");
        tokio::time::sleep(Duration::from_millis(1)).await;
        manager.publish("b".into(), vec![2], QosLevel::AtLeastOnce).expect("queued");
        assert_eq!(
            manager.publish("c".into(), vec![3], QosLevel::AtLeastOnce),
            Err(ConnectionError::QueueFull)
        );

        broker.hold_publishes(false);
        manager.disconnect(Duration::from_secs(2)).await;

        let topics: Vec<String> = broker.published().into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(manager.counters().published, 2);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(broker.disconnected());
        assert_eq!(
            manager.publish("d".into(), vec![4], QosLevel::AtLeastOnce),
            Err(ConnectionError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_expires() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.hold_publishes(true);
        let manager = ConnectionManager::new("dst", transport, ConnectionSettings::default());

        manager.connect().await.expect("connect");
        manager.publish("a".into(), vec![1], QosLevel::AtMostOnce).expect("queued");
        manager.disconnect(Duration::from_millis(100)).await;

        assert!(broker.published().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_counted() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        broker.fail_publishes(true);
        let manager = ConnectionManager::new("dst", transport, ConnectionSettings::default());

        manager.connect().await.expect("connect");
        manager.publish("a".into(), vec![1], QosLevel::AtMostOnce).expect("queued");
        manager.disconnect(Duration::from_secs(1)).await;

        assert_eq!(manager.counters().publish_failures, 1);
        assert_eq!(manager.counters().published, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_rejected() {
        let (transport, broker) = MockTransport::new();
        broker.connect_ack();
        let manager = ConnectionManager::new("src", transport, ConnectionSettings::default());
        manager.connect().await.expect("connect");
        assert_eq!(manager.connect().await, Err(ConnectionError::AlreadyStarted));
    }
}
