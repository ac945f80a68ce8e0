/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing one-shot completion primitives: the futures handed out by the client API
and the trigger signal the connection engines use for cancellation.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::ConnackPacket;

use tokio::sync::Notify;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
enum FutureState<T> {
    Pending,
    Completed(T),
    Canceled,
}

#[derive(Debug)]
struct FutureShared<T> {
    state: Mutex<FutureState<T>>,
    notify: Notify,
}

/// A one-shot completion cell.  Transitions from pending to either completed or canceled
/// exactly once and wakes every waiter when it does.
///
/// Cloning yields another handle to the same underlying cell.
#[derive(Debug)]
pub struct OperationFuture<T> {
    shared: Arc<FutureShared<T>>,
}

impl<T> Clone for OperationFuture<T> {
    fn clone(&self) -> Self {
        OperationFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for OperationFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OperationFuture<T> {

    /// Creates a new, pending future.
    pub fn new() -> Self {
        OperationFuture {
            shared: Arc::new(FutureShared {
                state: Mutex::new(FutureState::Pending),
                notify: Notify::new(),
            }),
        }
    }
}

impl<T: Clone + Send + 'static> OperationFuture<T> {

    /// Transitions the future to completed and wakes all waiters.  A future that has already
    /// settled is left untouched.
    pub fn complete(&self, value: T) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !matches!(*state, FutureState::Pending) {
                return;
            }
            *state = FutureState::Completed(value);
        }

        self.shared.notify.notify_waiters();
    }

    /// Transitions the future to canceled and wakes all waiters.  A future that has already
    /// settled is left untouched.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if !matches!(*state, FutureState::Pending) {
                return;
            }
            *state = FutureState::Canceled;
        }

        self.shared.notify.notify_waiters();
    }

    fn check(&self) -> Option<MqttResult<T>> {
        let state = self.shared.state.lock().unwrap();
        match &*state {
            FutureState::Pending => { None }
            FutureState::Completed(value) => { Some(Ok(value.clone())) }
            FutureState::Canceled => { Some(Err(MqttError::Canceled)) }
        }
    }

    /// Waits until the future completes or is canceled.
    pub async fn wait(&self) -> MqttResult<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.check() {
                return outcome;
            }

            notified.await;
        }
    }

    /// Waits until the future settles or the timeout elapses.  On timeout the future remains
    /// pending and may still settle later.
    pub async fn wait_timeout(&self, timeout: Duration) -> MqttResult<T> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => { outcome }
            Err(_) => { Err(MqttError::TimedOut) }
        }
    }

    /// Links another future's outcome into this one: when `other` settles, this future settles
    /// the same way.  Used to thread client-returned futures through the service supervisor.
    pub fn bind(&self, other: OperationFuture<T>) {
        let this = self.clone();
        tokio::spawn(async move {
            match other.wait().await {
                Ok(value) => { this.complete(value); }
                Err(_) => { this.cancel(); }
            }
        });
    }
}

/// Future completed once the broker answers a Connect packet; carries the Connack data.
pub type ConnectFuture = OperationFuture<ConnackPacket>;

/// Future completed once a publish's quality of service flow finishes.
pub type PublishFuture = OperationFuture<()>;

/// Future completed once a Suback arrives; carries the granted return codes.
pub type SubscribeFuture = OperationFuture<Vec<u8>>;

/// Future completed once an Unsuback arrives.
pub type UnsubscribeFuture = OperationFuture<()>;

/// A pending client operation, stored until the corresponding ack packet arrives.
#[derive(Clone)]
pub(crate) enum StoredFuture {
    Publish(PublishFuture),
    Subscribe(SubscribeFuture),
    Unsubscribe(UnsubscribeFuture),
}

impl StoredFuture {
    fn cancel(&self) {
        match self {
            StoredFuture::Publish(future) => { future.cancel(); }
            StoredFuture::Subscribe(future) => { future.cancel(); }
            StoredFuture::Unsubscribe(future) => { future.cancel(); }
        }
    }

    async fn settle(&self, deadline: tokio::time::Instant) -> MqttResult<()> {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let settled = match self {
            StoredFuture::Publish(future) => { future.wait_timeout(remaining).await.map(|_| ()) }
            StoredFuture::Subscribe(future) => { future.wait_timeout(remaining).await.map(|_| ()) }
            StoredFuture::Unsubscribe(future) => { future.wait_timeout(remaining).await.map(|_| ()) }
        };

        match settled {
            Err(MqttError::TimedOut) => { Err(MqttError::TimedOut) }

            // cancellation still counts as settled for shutdown purposes
            _ => { Ok(()) }
        }
    }
}

/// Store of in-flight operation futures keyed by packet id.  Shared between a client and the
/// service supervisor so outstanding futures survive reconnects.
#[derive(Default)]
pub(crate) struct FutureStore {
    futures: Mutex<HashMap<u16, StoredFuture>>,
}

impl FutureStore {
    pub fn new() -> Self {
        FutureStore {
            futures: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, packet_id: u16, future: StoredFuture) {
        self.futures.lock().unwrap().insert(packet_id, future);
    }

    pub fn get(&self, packet_id: u16) -> Option<StoredFuture> {
        self.futures.lock().unwrap().get(&packet_id).cloned()
    }

    pub fn remove(&self, packet_id: u16) {
        self.futures.lock().unwrap().remove(&packet_id);
    }

    /// Cancels every stored future and empties the store.
    pub fn cancel_all(&self) {
        let futures: Vec<StoredFuture> = self.futures.lock().unwrap().drain().map(|(_, f)| f).collect();
        for future in futures {
            future.cancel();
        }
    }

    /// Waits up to `timeout` for all currently stored futures to settle.
    pub async fn settle_all(&self, timeout: Duration) -> MqttResult<()> {
        let futures: Vec<StoredFuture> = self.futures.lock().unwrap().values().cloned().collect();
        let deadline = tokio::time::Instant::now() + timeout;

        for future in futures {
            future.settle(deadline).await?;
        }

        Ok(())
    }
}

/// A fire-once, many-waiter signal.  The connection engines use a pair of these as their
/// dying and closed signals; every blocking point selects against the dying trigger.
#[derive(Clone, Default)]
pub struct Trigger {
    inner: Arc<TriggerInner>,
}

#[derive(Default)]
struct TriggerInner {
    fired: AtomicBool,
    notify: Notify,
}

impl Trigger {

    /// Creates a new, unfired trigger.
    pub fn new() -> Self {
        Trigger::default()
    }

    /// Fires the trigger, waking all waiters.  Idempotent.
    pub fn fire(&self) {
        if !self.inner.fired.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns whether or not the trigger has fired.
    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Waits until the trigger fires.  Returns immediately if it already has.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_fired() {
                return;
            }

            notified.await;
        }
    }
}
