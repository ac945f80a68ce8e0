/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the service supervisor: a stable application-facing interface that keeps
an underlying client connected, reconnecting with exponential backoff and replaying queued
commands across connections.

The supervisor owns the session and the future store.  Every client incarnation borrows
both, so QoS 1/2 state and in-flight user futures survive broker outages.
 */

use crate::client::{Client, ClientEvent, ConnectOptions};
use crate::error::{MqttError, MqttResult};
use crate::future::{FutureStore, PublishFuture, SubscribeFuture, Trigger, UnsubscribeFuture};
use crate::mqtt::{Message, QualityOfService, Subscription};
use crate::session::{MemorySession, Session};

use log::*;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COMMAND_QUEUE_SIZE: usize = 100;

/// Callback invoked when the service comes online, with whether the session was resumed.
pub type OnlineCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Callback invoked for every message received by the current client.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback invoked when the current connection goes away.
pub type OfflineCallback = Arc<dyn Fn() + Send + Sync>;

/// Controls randomization of reconnect delays.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BackoffJitter {

    /// Use the deterministic doubling sequence as computed.
    #[default]
    None,

    /// Draw each delay uniformly from zero up to the computed value.
    Uniform,
}

// exponential backoff with a doubling factor, clamped to a maximum
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
    jitter: BackoffJitter,
}

impl Backoff {
    pub(crate) fn new(min: Duration, max: Duration, jitter: BackoffJitter) -> Self {
        Backoff {
            next: min,
            max,
            jitter,
        }
    }

    pub(crate) fn duration(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);

        match self.jitter {
            BackoffJitter::None => { current }
            BackoffJitter::Uniform => {
                let mut rng = rand::thread_rng();
                Duration::from_nanos(rng.gen_range(0..current.as_nanos().max(1)) as u64)
            }
        }
    }
}

struct QueuedPublish {
    message: Message,
    future: PublishFuture,
}

struct QueuedSubscribe {
    subscriptions: Vec<Subscription>,
    future: SubscribeFuture,
}

struct QueuedUnsubscribe {
    topic_filters: Vec<String>,
    future: UnsubscribeFuture,
}

struct QueueReceivers {
    publish: mpsc::Receiver<QueuedPublish>,
    subscribe: mpsc::Receiver<QueuedSubscribe>,
    unsubscribe: mpsc::Receiver<QueuedUnsubscribe>,
}

#[derive(Clone)]
struct Tunables {
    min_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    reconnect_jitter: BackoffJitter,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            min_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(32),
            reconnect_jitter: BackoffJitter::None,
            connect_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Default)]
struct Callbacks {
    online: Option<OnlineCallback>,
    message: Option<MessageCallback>,
    offline: Option<OfflineCallback>,
}

struct ServiceInner {
    session: Arc<dyn Session>,
    futures: Arc<FutureStore>,
    callbacks: Mutex<Callbacks>,
    tunables: Mutex<Tunables>,

    publish_sender: mpsc::Sender<QueuedPublish>,
    subscribe_sender: mpsc::Sender<QueuedSubscribe>,
    unsubscribe_sender: mpsc::Sender<QueuedUnsubscribe>,
    receivers: Mutex<Option<QueueReceivers>>,

    started: AtomicBool,
    stop: Mutex<Option<Trigger>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// An abstraction over [`Client`] that provides a stable interface to the application
/// while automatically connecting and reconnecting in the background.
///
/// Command methods never fail; they queue their command (queues are bounded, so a send may
/// wait) and return a future that settles once a connected client gets the corresponding
/// acknowledgement.  Commands queued while offline survive until the next connection.
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {

    /// Creates a service with a fresh in-memory session.
    pub fn new() -> Self {
        Service::with_session(Arc::new(MemorySession::new()))
    }

    /// Creates a service around an existing session, e.g. a persistent implementation.
    pub fn with_session(session: Arc<dyn Session>) -> Self {
        let (publish_sender, publish_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (subscribe_sender, subscribe_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (unsubscribe_sender, unsubscribe_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        Service {
            inner: Arc::new(ServiceInner {
                session,
                futures: Arc::new(FutureStore::new()),
                callbacks: Mutex::new(Callbacks::default()),
                tunables: Mutex::new(Tunables::default()),
                publish_sender,
                subscribe_sender,
                unsubscribe_sender,
                receivers: Mutex::new(Some(QueueReceivers {
                    publish: publish_receiver,
                    subscribe: subscribe_receiver,
                    unsubscribe: unsubscribe_receiver,
                })),
                started: AtomicBool::new(false),
                stop: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Returns the session shared across this service's client incarnations.
    pub fn session(&self) -> Arc<dyn Session> {
        self.inner.session.clone()
    }

    /// Installs the callback invoked whenever a connection comes up.
    pub fn set_online_callback(&self, callback: OnlineCallback) {
        self.inner.callbacks.lock().unwrap().online = Some(callback);
    }

    /// Installs the callback invoked for every received message.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.inner.callbacks.lock().unwrap().message = Some(callback);
    }

    /// Installs the callback invoked whenever the connection goes away.
    pub fn set_offline_callback(&self, callback: OfflineCallback) {
        self.inner.callbacks.lock().unwrap().offline = Some(callback);
    }

    /// Adjusts the reconnect backoff window.  Applies to the next `start`.
    pub fn set_reconnect_delays(&self, min: Duration, max: Duration, jitter: BackoffJitter) {
        let mut tunables = self.inner.tunables.lock().unwrap();
        tunables.min_reconnect_delay = min;
        tunables.max_reconnect_delay = max;
        tunables.reconnect_jitter = jitter;
    }

    /// Adjusts how long a connection attempt may wait for its Connack.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.inner.tunables.lock().unwrap().connect_timeout = timeout;
    }

    /// Adjusts how long `stop` waits for outstanding operations before disconnecting.
    pub fn set_disconnect_timeout(&self, timeout: Duration) {
        self.inner.tunables.lock().unwrap().disconnect_timeout = timeout;
    }

    /// Starts maintaining a connection to the broker.  Does nothing if already started.
    pub fn start(&self, broker_url: &str, options: ConnectOptions) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(receivers) = self.inner.receivers.lock().unwrap().take() else {
            self.inner.started.store(false, Ordering::SeqCst);
            return;
        };

        let stop = Trigger::new();
        *self.inner.stop.lock().unwrap() = Some(stop.clone());

        let inner = self.inner.clone();
        let broker_url = broker_url.to_string();
        let task = tokio::spawn(async move {
            reconnector(inner, broker_url, options, receivers, stop).await;
        });

        *self.inner.task.lock().unwrap() = Some(task);
    }

    /// Stops the service: disconnects the current client and ends the reconnect loop.
    /// All waiting futures get canceled.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(stop) = self.inner.stop.lock().unwrap().take() {
            stop.fire();
        }

        let task = self.inner.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Queues a Publish command.  The future settles once a connected client completes the
    /// quality of service flow.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> PublishFuture {
        let future = PublishFuture::new();

        let queued = QueuedPublish {
            message: Message::new(topic, payload, qos, retain),
            future: future.clone(),
        };

        if self.inner.publish_sender.send(queued).await.is_err() {
            future.cancel();
        }

        future
    }

    /// Queues a Subscribe command with a single entry.
    pub async fn subscribe(&self, topic_filter: &str, qos: QualityOfService) -> SubscribeFuture {
        self.subscribe_multiple(vec![Subscription::new(topic_filter, qos)]).await
    }

    /// Queues a Subscribe command.  The future settles with the granted return codes.
    pub async fn subscribe_multiple(&self, subscriptions: Vec<Subscription>) -> SubscribeFuture {
        let future = SubscribeFuture::new();

        let queued = QueuedSubscribe {
            subscriptions,
            future: future.clone(),
        };

        if self.inner.subscribe_sender.send(queued).await.is_err() {
            future.cancel();
        }

        future
    }

    /// Queues an Unsubscribe command with a single topic filter.
    pub async fn unsubscribe(&self, topic_filter: &str) -> UnsubscribeFuture {
        self.unsubscribe_multiple(vec![topic_filter.to_string()]).await
    }

    /// Queues an Unsubscribe command.
    pub async fn unsubscribe_multiple(&self, topic_filters: Vec<String>) -> UnsubscribeFuture {
        let future = UnsubscribeFuture::new();

        let queued = QueuedUnsubscribe {
            topic_filters,
            future: future.clone(),
        };

        if self.inner.unsubscribe_sender.send(queued).await.is_err() {
            future.cancel();
        }

        future
    }
}

async fn reconnector(inner: Arc<ServiceInner>, broker_url: String, options: ConnectOptions, mut receivers: QueueReceivers, stop: Trigger) {
    let tunables = inner.tunables.lock().unwrap().clone();
    let mut backoff = Backoff::new(tunables.min_reconnect_delay, tunables.max_reconnect_delay, tunables.reconnect_jitter);
    let mut first = true;

    loop {
        if first {
            // no delay on the very first attempt
            first = false;
        } else {
            let delay = backoff.duration();
            info!("service - delaying reconnect by {:?}", delay);

            tokio::select! {
                biased;
                _ = stop.wait() => { break; }
                _ = sleep(delay) => {}
            }
        }

        info!("service - next reconnect");

        let fail = Trigger::new();
        let Some((client, resumed)) = get_client(&inner, &broker_url, &options, &tunables, &fail).await else {
            continue;
        };

        notify_online(&inner, resumed);

        let stopping = dispatcher(&client, &mut receivers, &tunables, &fail, &stop).await;

        notify_offline(&inner);

        if stopping {
            break;
        }
    }

    // hand the queues back so the service can be started again
    *inner.receivers.lock().unwrap() = Some(receivers);
}

// tries once to produce a connected client
async fn get_client(inner: &Arc<ServiceInner>, broker_url: &str, options: &ConnectOptions, tunables: &Tunables, fail: &Trigger)
    -> Option<(Client, bool)> {
    let client = Client::with_shared(inner.session.clone(), inner.futures.clone());

    let message_callback = inner.callbacks.lock().unwrap().message.clone();
    let fail = fail.clone();
    client.set_callback(Arc::new(move |event| {
        match event {
            ClientEvent::Message(message) => {
                if let Some(callback) = &message_callback {
                    callback(&message.topic, &message.payload);
                }
            }
            ClientEvent::Error(error) => {
                warn!("service - client error: {}", error);
                fail.fire();
            }
        }
    }));

    let connect_future = match client.connect(broker_url, options.clone()).await {
        Ok(future) => { future }
        Err(error) => {
            warn!("service - connect error: {}", error);
            return None;
        }
    };

    match connect_future.wait_timeout(tunables.connect_timeout).await {
        Ok(connack) => {
            if !connack.return_code.is_success() {
                warn!("service - connack: {}", connack.return_code);
                let _ = client.close().await;
                return None;
            }

            Some((client, connack.session_present))
        }
        Err(MqttError::TimedOut) => {
            warn!("service - connack timeout");
            let _ = client.close().await;
            None
        }
        Err(error) => {
            warn!("service - connack: {}", error);
            None
        }
    }
}

// feeds queued commands into the current client; returns whether the service is stopping
async fn dispatcher(client: &Client, receivers: &mut QueueReceivers, tunables: &Tunables, fail: &Trigger, stop: &Trigger) -> bool {
    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => {
                if let Err(error) = client.disconnect(Some(tunables.disconnect_timeout)).await {
                    warn!("service - disconnect error: {}", error);
                }

                return true;
            }
            _ = fail.wait() => {
                return false;
            }
            // subscriptions drain ahead of publishes on ties
            queued = receivers.subscribe.recv() => {
                let Some(queued) = queued else { return false; };
                match client.subscribe_multiple(queued.subscriptions).await {
                    Ok(future) => { queued.future.bind(future); }
                    Err(error) => {
                        warn!("service - subscribe error: {}", error);
                        queued.future.cancel();
                        return false;
                    }
                }
            }
            queued = receivers.unsubscribe.recv() => {
                let Some(queued) = queued else { return false; };
                match client.unsubscribe_multiple(queued.topic_filters).await {
                    Ok(future) => { queued.future.bind(future); }
                    Err(error) => {
                        warn!("service - unsubscribe error: {}", error);
                        queued.future.cancel();
                        return false;
                    }
                }
            }
            queued = receivers.publish.recv() => {
                let Some(queued) = queued else { return false; };
                match client.publish(&queued.message.topic, &queued.message.payload, queued.message.qos, queued.message.retain).await {
                    Ok(future) => { queued.future.bind(future); }
                    Err(error) => {
                        warn!("service - publish error: {}", error);
                        queued.future.cancel();
                        return false;
                    }
                }
            }
        }
    }
}

fn notify_online(inner: &Arc<ServiceInner>, resumed: bool) {
    let callback = inner.callbacks.lock().unwrap().online.clone();
    if let Some(callback) = callback {
        callback(resumed);
    }
}

fn notify_offline(inner: &Arc<ServiceInner>) {
    let callback = inner.callbacks.lock().unwrap().offline.clone();
    if let Some(callback) = callback {
        callback();
    }
}

/// Connects once with a clean session request and disconnects, forcing the broker to drop
/// any stored session for the client id.  Useful when the state of the last session is
/// unknown.
pub async fn clear_session(broker_url: &str, client_id: &str) -> MqttResult<()> {
    let client = Client::new();

    let options = ConnectOptions::builder()
        .with_client_id(client_id)
        .with_clean_session(true)
        .build();

    let connect_future = client.connect(broker_url, options).await?;
    let connack = connect_future.wait().await?;

    if !connack.return_code.is_success() {
        return Err(MqttError::ConnectionDenied(connack.return_code));
    }

    client.disconnect(None).await
}
