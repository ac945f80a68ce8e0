/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing an in-process [`Backend`](crate::broker::Backend) implementation: live
subscription routing, retained messages, offline queues for persistent sessions, and
same-id connection take-over.  Suitable for tests and single-process brokers.
 */

use crate::broker::{Ack, Backend, Client};
use crate::error::MqttResult;
use crate::mqtt::{Message, QualityOfService, Subscription};
use crate::session::{MemorySession, Session};
use crate::topic::matches_filter;

use async_trait::async_trait;
use log::*;
use tokio::sync::mpsc;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

type QueueEntry = (Message, Option<Ack>);

struct ClientQueue {
    client_id: String,
    clean_session: bool,
    subscriptions: Vec<Subscription>,
    sender: mpsc::UnboundedSender<QueueEntry>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueEntry>>>,
}

#[derive(Default)]
struct BackendState {
    // persistent sessions and offline queues are keyed by client id; live connections by
    // connection uid so a takeover cannot cross wires with its predecessor
    sessions: HashMap<String, Arc<MemorySession>>,
    offline: HashMap<String, VecDeque<(u64, Message)>>,
    connected: HashMap<String, Client>,
    queues: HashMap<u64, ClientQueue>,
    retained: BTreeMap<String, Message>,
    next_offline_sequence: u64,
}

/// The default in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    logins: Option<HashMap<String, Vec<u8>>>,
    state: Arc<Mutex<BackendState>>,
}

impl MemoryBackend {

    /// Creates a backend that accepts any credentials.
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    /// Restricts authentication to an explicit credential list.  May be called multiple
    /// times to allow multiple logins.
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.logins.get_or_insert_with(HashMap::new).insert(username.into(), password.into());
        self
    }

    fn deliver(queue: &ClientQueue, message: Message, ack: Option<Ack>) {
        // a failed send means the connection is tearing down; the message is dropped the
        // same way it would be for any disconnected non-persistent subscriber
        let _ = queue.sender.send((message, ack));
    }

    fn best_live_match(queue: &ClientQueue, topic: &str) -> Option<QualityOfService> {
        queue.subscriptions.iter()
            .filter(|subscription| matches_filter(topic, &subscription.topic_filter))
            .map(|subscription| subscription.qos)
            .max()
    }
}

#[async_trait]
impl Backend for MemoryBackend {

    async fn authenticate(&self, _client: &Client, username: Option<&str>, password: Option<&[u8]>) -> MqttResult<bool> {
        let Some(logins) = &self.logins else {
            return Ok(true);
        };

        let authenticated = match (username, password) {
            (Some(username), Some(password)) => {
                logins.get(username).map(|expected| expected.as_slice() == password).unwrap_or(false)
            }
            _ => { false }
        };

        Ok(authenticated)
    }

    async fn setup(&self, client: &Client, client_id: &str, clean_session: bool) -> MqttResult<(Option<Arc<dyn Session>>, bool)> {
        // take over any existing connection with the same non-empty id before touching
        // session state; the lock is released while waiting so the old connection's
        // terminate call can get through
        if !client_id.is_empty() {
            loop {
                let existing = {
                    let mut state = self.state.lock().unwrap();
                    let found = state.connected.get(client_id)
                        .filter(|existing| existing.uid() != client.uid())
                        .cloned();
                    if found.is_some() {
                        state.connected.remove(client_id);
                    }
                    found
                };

                match existing {
                    Some(existing) => {
                        info!("[{}] taking over client id {:?} from connection {}", client.uid(), client_id, existing.uid());
                        existing.close();
                        existing.closed().wait().await;
                    }
                    None => { break; }
                }
            }
        }

        let mut state = self.state.lock().unwrap();

        let (session, resumed) =
            if client_id.is_empty() {
                // temporary session, never stored; a reconnect always gets a distinct one
                (Arc::new(MemorySession::new()), false)
            } else {
                let resumed = state.sessions.contains_key(client_id);
                if clean_session {
                    state.sessions.remove(client_id);
                    state.offline.remove(client_id);
                }

                let session = state.sessions.entry(client_id.to_string())
                    .or_insert_with(|| Arc::new(MemorySession::new()))
                    .clone();

                state.connected.insert(client_id.to_string(), client.clone());
                (session, resumed)
            };

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = ClientQueue {
            client_id: client_id.to_string(),
            clean_session,
            subscriptions: Vec::new(),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        };

        // queued offline messages move to the live queue; each one is released from the
        // offline store only once its delivery ack fires
        if !client_id.is_empty() && !clean_session {
            let entries: Vec<(u64, Message)> = state.offline.get(client_id)
                .map(|queued| queued.iter().cloned().collect())
                .unwrap_or_default();

            for (sequence, message) in entries {
                let (ack, fired) = Ack::pair();
                let shared_state = self.state.clone();
                let owner = client_id.to_string();

                tokio::spawn(async move {
                    if fired.await.is_ok() {
                        let mut state = shared_state.lock().unwrap();
                        if let Some(queued) = state.offline.get_mut(&owner) {
                            queued.retain(|(queued_sequence, _)| *queued_sequence != sequence);
                        }
                    }
                });

                MemoryBackend::deliver(&queue, message, Some(ack));
            }
        }

        state.queues.insert(client.uid(), queue);

        Ok((Some(session), resumed))
    }

    async fn restored(&self, _client: &Client) -> MqttResult<()> {
        Ok(())
    }

    async fn subscribe(&self, client: &Client, subscriptions: &[Subscription], stored: bool) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();

        let retained: Vec<Message> = subscriptions.iter()
            .flat_map(|subscription| {
                state.retained.values()
                    .filter(|message| matches_filter(&message.topic, &subscription.topic_filter))
                    .cloned()
                    .collect::<Vec<Message>>()
            })
            .collect();

        let Some(queue) = state.queues.get_mut(&client.uid()) else {
            return Ok(());
        };

        for subscription in subscriptions {
            queue.subscriptions.retain(|existing| existing.topic_filter != subscription.topic_filter);
            queue.subscriptions.push(subscription.clone());
        }

        for mut message in retained {
            // replayed stored subscriptions must not re-flag messages as retained
            message.retain = !stored;
            MemoryBackend::deliver(queue, message, None);
        }

        Ok(())
    }

    async fn unsubscribe(&self, client: &Client, topic_filters: &[String]) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();

        if let Some(queue) = state.queues.get_mut(&client.uid()) {
            queue.subscriptions.retain(|subscription| !topic_filters.contains(&subscription.topic_filter));
        }

        Ok(())
    }

    async fn publish(&self, _client: &Client, message: Message, ack: Option<Ack>) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();

        if message.retain {
            if message.payload.is_empty() {
                debug!("retained message for topic {} cleared", message.topic);
                state.retained.remove(&message.topic);
            } else {
                debug!("retained message for topic {} replaced", message.topic);
                state.retained.insert(message.topic.clone(), message.clone());
            }
        }

        // the retain flag never survives forwarding
        let mut forwarded = message;
        forwarded.retain = false;

        for queue in state.queues.values() {
            if MemoryBackend::best_live_match(queue, &forwarded.topic).is_some() {
                MemoryBackend::deliver(queue, forwarded.clone(), None);
            }
        }

        // offline queueing applies to qos > 0 messages and persistent sessions with a
        // matching stored subscription
        if forwarded.qos != QualityOfService::AtMostOnce {
            let connected: Vec<String> = state.connected.keys().cloned().collect();
            let mut queued: Vec<String> = Vec::new();

            for (client_id, session) in &state.sessions {
                if connected.contains(client_id) {
                    continue;
                }

                if session.lookup_subscription(&forwarded.topic)?.is_some() {
                    queued.push(client_id.clone());
                }
            }

            for client_id in queued {
                let sequence = state.next_offline_sequence;
                state.next_offline_sequence += 1;
                state.offline.entry(client_id).or_default().push_back((sequence, forwarded.clone()));
            }
        }

        if let Some(ack) = ack {
            ack.ack();
        }

        Ok(())
    }

    async fn dequeue(&self, client: &Client) -> MqttResult<Option<(Message, Option<Ack>)>> {
        let receiver = {
            let state = self.state.lock().unwrap();
            match state.queues.get(&client.uid()) {
                Some(queue) => { queue.receiver.clone() }
                None => { return Ok(None); }
            }
        };

        let closing = client.closing();

        let mut receiver = tokio::select! {
            biased;
            _ = closing.wait() => { return Ok(None); }
            guard = receiver.lock() => { guard }
        };

        tokio::select! {
            biased;
            _ = closing.wait() => { Ok(None) }
            entry = receiver.recv() => {
                match entry {
                    Some((message, ack)) => { Ok(Some((message, ack))) }
                    None => { Ok(None) }
                }
            }
        }
    }

    async fn terminate(&self, client: &Client) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();

        let client_id = client.id();
        let still_registered = state.connected.get(&client_id)
            .map(|connected| connected.uid() == client.uid())
            .unwrap_or(false);
        if still_registered {
            state.connected.remove(&client_id);
        }

        if let Some(queue) = state.queues.remove(&client.uid()) {
            // clean sessions leave nothing behind; persistent sessions keep their stored
            // subscriptions as offline subscriptions
            if queue.clean_session && !queue.client_id.is_empty() {
                state.sessions.remove(&queue.client_id);
                state.offline.remove(&queue.client_id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &str, qos: QualityOfService, retain: bool) -> Message {
        Message::new(topic, payload, qos, retain)
    }

    async fn dequeue_now(backend: &MemoryBackend, client: &Client) -> Option<(Message, Option<Ack>)> {
        tokio::time::timeout(std::time::Duration::from_millis(100), backend.dequeue(client))
            .await
            .ok()
            .and_then(|result| result.unwrap())
    }

    async fn assert_queue_empty(backend: &MemoryBackend, client: &Client) {
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), backend.dequeue(client)).await;
        assert!(result.is_err(), "expected no queued message");
    }

    #[tokio::test]
    async fn authentication_with_logins() {
        let backend = MemoryBackend::new().with_login("allow", "allow");
        let client = Client::detached();

        assert!(backend.authenticate(&client, Some("allow"), Some(b"allow")).await.unwrap());
        assert!(!backend.authenticate(&client, Some("deny"), Some(b"deny")).await.unwrap());
        assert!(!backend.authenticate(&client, None, None).await.unwrap());
    }

    #[tokio::test]
    async fn authentication_without_logins_allows_anyone() {
        let backend = MemoryBackend::new();
        let client = Client::detached();

        assert!(backend.authenticate(&client, None, None).await.unwrap());
        assert!(backend.authenticate(&client, Some("anyone"), Some(b"pw")).await.unwrap());
    }

    #[tokio::test]
    async fn setup_reports_resumed_correctly() {
        let backend = MemoryBackend::new();
        let client = Client::detached();

        let (session, resumed) = backend.setup(&client, "foo", false).await.unwrap();
        assert!(session.is_some());
        assert!(!resumed);

        let (session, resumed) = backend.setup(&client, "foo", false).await.unwrap();
        assert!(session.is_some());
        assert!(resumed);

        // prior state existed, so the backend still reports resumed even though a clean
        // session drops that state
        let (session, resumed) = backend.setup(&client, "foo", true).await.unwrap();
        assert!(session.is_some());
        assert!(resumed);

        let (session, resumed) = backend.setup(&client, "bar", false).await.unwrap();
        assert!(session.is_some());
        assert!(!resumed);
    }

    #[tokio::test]
    async fn setup_with_empty_id_yields_distinct_temporary_sessions() {
        let backend = MemoryBackend::new();
        let first = Client::detached();
        let second = Client::detached();

        let (first_session, first_resumed) = backend.setup(&first, "", true).await.unwrap();
        let (second_session, second_resumed) = backend.setup(&second, "", true).await.unwrap();

        assert!(!first_resumed);
        assert!(!second_resumed);

        // the sessions must be independent
        first_session.unwrap().save_will(message("w", "x", QualityOfService::AtMostOnce, false)).unwrap();
        assert!(second_session.unwrap().lookup_will().unwrap().is_none());
    }

    #[tokio::test]
    async fn setup_takes_over_existing_connection() {
        let backend = MemoryBackend::new();
        let old = Client::detached();
        backend.setup(&old, "shared", false).await.unwrap();

        // emulate the old connection finishing its shutdown once asked to close
        let old_observer = old.clone();
        tokio::spawn(async move {
            old_observer.closing().wait().await;
            old_observer.closed().fire();
        });

        let new = Client::detached();
        let (session, resumed) = backend.setup(&new, "shared", false).await.unwrap();

        assert!(session.is_some());
        assert!(resumed);
        assert!(old.closing().is_fired());
    }

    #[tokio::test]
    async fn basic_queuing() {
        let backend = MemoryBackend::new();
        let publisher = Client::detached();
        let first = Client::detached();
        let second = Client::detached();

        backend.setup(&publisher, "publisher", true).await.unwrap();
        backend.setup(&first, "first", true).await.unwrap();
        backend.setup(&second, "second", true).await.unwrap();

        let subscription = vec![Subscription::new("test", QualityOfService::AtMostOnce)];
        backend.subscribe(&first, &subscription, false).await.unwrap();
        backend.subscribe(&second, &subscription, false).await.unwrap();

        backend.publish(&publisher, message("test", "x", QualityOfService::AtMostOnce, false), None).await.unwrap();

        assert_eq!(b"x".to_vec(), dequeue_now(&backend, &first).await.unwrap().0.payload);
        assert_eq!(b"x".to_vec(), dequeue_now(&backend, &second).await.unwrap().0.payload);

        backend.unsubscribe(&second, &["test".to_string()]).await.unwrap();
        backend.publish(&publisher, message("test", "y", QualityOfService::AtMostOnce, false), None).await.unwrap();

        assert_eq!(b"y".to_vec(), dequeue_now(&backend, &first).await.unwrap().0.payload);
        assert_queue_empty(&backend, &second).await;
    }

    #[tokio::test]
    async fn publish_fires_ack_after_persistence() {
        let backend = MemoryBackend::new();
        let publisher = Client::detached();
        backend.setup(&publisher, "publisher", true).await.unwrap();

        let (ack, fired) = Ack::pair();
        backend.publish(&publisher, message("test", "x", QualityOfService::AtLeastOnce, false), Some(ack)).await.unwrap();

        fired.await.unwrap();
    }

    #[tokio::test]
    async fn retained_messages() {
        let backend = MemoryBackend::new();
        let client = Client::detached();
        backend.setup(&client, "client", true).await.unwrap();

        // no retained messages yet
        backend.subscribe(&client, &[Subscription::new("foo", QualityOfService::AtMostOnce)], false).await.unwrap();
        assert_queue_empty(&backend, &client).await;
        backend.unsubscribe(&client, &["foo".to_string()]).await.unwrap();

        backend.publish(&client, message("foo", "bar", QualityOfService::AtLeastOnce, true), None).await.unwrap();

        backend.subscribe(&client, &[Subscription::new("foo", QualityOfService::AtMostOnce)], false).await.unwrap();
        let (retained, _) = dequeue_now(&backend, &client).await.unwrap();
        assert!(retained.retain);
        assert_eq!(QualityOfService::AtLeastOnce, retained.qos);
        backend.unsubscribe(&client, &["foo".to_string()]).await.unwrap();

        backend.publish(&client, message("foo/bar", "bar", QualityOfService::AtLeastOnce, true), None).await.unwrap();

        backend.subscribe(&client, &[Subscription::new("#", QualityOfService::AtMostOnce)], false).await.unwrap();
        assert!(dequeue_now(&backend, &client).await.is_some());
        assert!(dequeue_now(&backend, &client).await.is_some());
        assert_queue_empty(&backend, &client).await;
        backend.unsubscribe(&client, &["#".to_string()]).await.unwrap();

        // replacing a retained message keeps exactly one per topic
        backend.publish(&client, message("foo", "bar", QualityOfService::ExactlyOnce, true), None).await.unwrap();

        backend.subscribe(&client, &[Subscription::new("foo", QualityOfService::AtMostOnce)], false).await.unwrap();
        let (retained, _) = dequeue_now(&backend, &client).await.unwrap();
        assert_eq!(QualityOfService::ExactlyOnce, retained.qos);
        assert_queue_empty(&backend, &client).await;
        backend.unsubscribe(&client, &["foo".to_string()]).await.unwrap();

        // an empty payload clears the retained entry
        backend.publish(&client, message("foo", "", QualityOfService::AtMostOnce, true), None).await.unwrap();

        backend.subscribe(&client, &[Subscription::new("foo", QualityOfService::AtMostOnce)], false).await.unwrap();
        assert_queue_empty(&backend, &client).await;
    }

    #[tokio::test]
    async fn stored_subscription_replay_clears_retain_flag() {
        let backend = MemoryBackend::new();
        let client = Client::detached();
        backend.setup(&client, "client", true).await.unwrap();

        backend.publish(&client, message("foo", "bar", QualityOfService::AtMostOnce, true), None).await.unwrap();

        backend.subscribe(&client, &[Subscription::new("foo", QualityOfService::AtMostOnce)], true).await.unwrap();
        let (retained, _) = dequeue_now(&backend, &client).await.unwrap();
        assert!(!retained.retain);
    }

    #[tokio::test]
    async fn offline_queue_for_persistent_sessions() {
        let backend = MemoryBackend::new();

        // persistent client subscribes, then goes away
        let first_connection = Client::detached();
        let (session, _) = backend.setup(&first_connection, "sleeper", false).await.unwrap();
        session.unwrap().save_subscription(Subscription::new("a", QualityOfService::AtLeastOnce)).unwrap();
        backend.terminate(&first_connection).await.unwrap();

        let publisher = Client::detached();
        backend.setup(&publisher, "publisher", true).await.unwrap();
        backend.publish(&publisher, message("a", "m", QualityOfService::AtLeastOnce, false), None).await.unwrap();

        // qos 0 messages are never queued offline
        backend.publish(&publisher, message("a", "dropped", QualityOfService::AtMostOnce, false), None).await.unwrap();

        // the message is waiting when the client comes back
        let second_connection = Client::detached();
        let (_, resumed) = backend.setup(&second_connection, "sleeper", false).await.unwrap();
        assert!(resumed);

        let (queued, ack) = dequeue_now(&backend, &second_connection).await.unwrap();
        assert_eq!(b"m".to_vec(), queued.payload);
        assert_queue_empty(&backend, &second_connection).await;

        // until the ack fires, the message survives another reconnect
        backend.terminate(&second_connection).await.unwrap();
        let third_connection = Client::detached();
        backend.setup(&third_connection, "sleeper", false).await.unwrap();
        assert_eq!(b"m".to_vec(), dequeue_now(&backend, &third_connection).await.unwrap().0.payload);

        // after the ack fires, it is gone for good
        ack.unwrap().ack();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        backend.terminate(&third_connection).await.unwrap();
        let fourth_connection = Client::detached();
        backend.setup(&fourth_connection, "sleeper", false).await.unwrap();
        assert_queue_empty(&backend, &fourth_connection).await;
    }

    #[tokio::test]
    async fn clean_session_terminate_drops_state() {
        let backend = MemoryBackend::new();

        let client = Client::detached();
        backend.setup(&client, "transient", true).await.unwrap();
        backend.terminate(&client).await.unwrap();

        let reconnect = Client::detached();
        let (_, resumed) = backend.setup(&reconnect, "transient", false).await.unwrap();
        assert!(!resumed);
    }

    #[tokio::test]
    async fn dequeue_returns_none_when_closing() {
        let backend = MemoryBackend::new();
        let client = Client::detached();
        backend.setup(&client, "closer", true).await.unwrap();

        client.close();
        assert!(backend.dequeue(&client).await.unwrap().is_none());
    }
}
