// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory broker for testing.
//!
//! [`MockTransport`] replays scripted events; [`MockBroker`] scripts them and
//! inspects what the client side did.

use crate::config::QosLevel;
use crate::connection::{BrokerClient, ConnectionError, Transport, TransportEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// A message the client published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QosLevel,
}

struct MockState {
    events: Mutex<VecDeque<Result<TransportEvent, ConnectionError>>>,
    ready: Notify,
    polls: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    disconnected: AtomicBool,
    fail_publishes: AtomicBool,
    fail_subscribes: AtomicUsize,
    hold: watch::Sender<bool>,
}

impl MockState {
    fn push(&self, event: Result<TransportEvent, ConnectionError>) {
        self.events.lock().push_back(event);
        self.ready.notify_one();
    }
}

/// Scripted transport. A poll with nothing scripted waits for the next event.
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// Create a transport and the broker handle that scripts it.
    pub fn new() -> (Self, MockBroker) {
        let (hold, _) = watch::channel(false);
        let state = Arc::new(MockState {
            events: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            polls: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            fail_subscribes: AtomicUsize::new(0),
            hold,
        });
        (
            Self {
                state: state.clone(),
            },
            MockBroker { state },
        )
    }
}

impl Transport for MockTransport {
    type Client = MockClient;

    fn client(&self) -> MockClient {
        MockClient {
            state: self.state.clone(),
        }
    }

    fn poll(&mut self) -> impl Future<Output = Result<TransportEvent, ConnectionError>> + Send {
        let state = self.state.clone();
        async move {
            state.polls.fetch_add(1, Ordering::Relaxed);
            loop {
                let next = state.events.lock().pop_front();
                if let Some(event) = next {
                    return event;
                }
                state.ready.notified().await;
            }
        }
    }
}

/// Client half of [`MockTransport`].
#[derive(Clone)]
pub struct MockClient {
    state: Arc<MockState>,
}

impl BrokerClient for MockClient {
    fn subscribe(&self, topic: &str, _qos: QosLevel) -> Result<(), ConnectionError> {
        let reject = self
            .state
            .fail_subscribes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if reject {
            return Err(ConnectionError::Client("subscribe rejected".into()));
        }
        self.state.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), ConnectionError> {
        self.state.unsubscriptions.lock().push(topic.to_string());
        Ok(())
    }

    fn publish(
        &self,
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send {
        let state = self.state.clone();
        async move {
            let mut hold = state.hold.subscribe();
            let _ = hold.wait_for(|held| !*held).await;
            if state.fail_publishes.load(Ordering::Relaxed) {
                return Err(ConnectionError::Client("publish rejected".into()));
            }
            state.published.lock().push(PublishedMessage {
                topic,
                payload,
                qos,
            });
            Ok(())
        }
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.state.disconnected.store(true, Ordering::Relaxed);
        self.state.push(Ok(TransportEvent::Closed));
        Ok(())
    }
}

/// Test-side handle of a [`MockTransport`].
#[derive(Clone)]
pub struct MockBroker {
    state: Arc<MockState>,
}

impl MockBroker {
    /// Script a session establishment.
    pub fn connect_ack(&self) {
        self.state.push(Ok(TransportEvent::Connected));
    }

    /// Script a connection failure.
    pub fn fail(&self, reason: impl Into<String>) {
        self.state
            .push(Err(ConnectionError::Transport(reason.into())));
    }

    /// Script an inbound message.
    pub fn deliver(&self, topic: impl Into<String>, payload: Vec<u8>) {
        self.state.push(Ok(TransportEvent::Message {
            topic: topic.into(),
            payload,
        }));
    }

    /// Block (or release) publishes in flight.
    pub fn hold_publishes(&self, hold: bool) {
        self.state.hold.send_replace(hold);
    }

    /// Make publishes fail.
    pub fn fail_publishes(&self, fail: bool) {
        self.state.fail_publishes.store(fail, Ordering::Relaxed);
    }

    /// Reject the next `count` subscribe requests.
    pub fn fail_subscribes(&self, count: usize) {
        self.state.fail_subscribes.store(count, Ordering::Relaxed);
    }

    /// Number of polls started.
    pub fn polls(&self) -> usize {
        self.state.polls.load(Ordering::Relaxed)
    }

    /// Scripted events not yet consumed.
    pub fn pending(&self) -> usize {
        self.state.events.lock().len()
    }

    /// Subscribe requests, in order, including repeats.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.subscriptions.lock().clone()
    }

    /// Unsubscribe requests, in order.
    pub fn unsubscriptions(&self) -> Vec<String> {
        self.state.unsubscriptions.lock().clone()
    }

    /// Messages published so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Whether the client asked to disconnect.
    pub fn disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::Relaxed)
    }
}
