/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the application-side connection engine: a single-use MQTT 3.1.1 client
with future-based operation results, automatic keep alive, and session-backed QoS flows.

A client drives one connection.  Reconnection across client instances, with a shared
session, is the job of the [`Service`](crate::service::Service) supervisor.
 */

use crate::error::{MqttError, MqttResult};
use crate::future::{ConnectFuture, FutureStore, PublishFuture, StoredFuture, SubscribeFuture, Trigger, UnsubscribeFuture};
use crate::mqtt::*;
use crate::session::{Direction, MemorySession, Session};
use crate::transport::{split_stream, PacketReader, PacketWriter};

use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use url::Url;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_PORT: u16 = 1883;

/// Event surfaced through a client's callback.
#[derive(Debug)]
pub enum ClientEvent {

    /// An inbound application message.
    Message(Message),

    /// The terminal error of a connection that closed abnormally.  Emitted at most once.
    Error(MqttError),
}

/// Callback invoked by the client for inbound messages and the final connection error.
pub type Callback = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Configuration for the Connect packet sent by a client.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub(crate) client_id: String,
    pub(crate) clean_session: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) will: Option<Message>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            client_id: String::new(),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            will: None,
        }
    }
}

impl ConnectOptions {

    /// Creates a new builder with default options: empty client id, clean session, a 30
    /// second keep alive and no will.
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder {
            options: ConnectOptions::default(),
        }
    }
}

/// Builder type for constructing connect configuration.
pub struct ConnectOptionsBuilder {
    options: ConnectOptions,
}

impl ConnectOptionsBuilder {

    /// Sets the client identifier.  Required when requesting a non-clean session.
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.options.client_id = client_id.to_string();
        self
    }

    /// Configures whether the broker should discard prior session state.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets the keep alive interval.  Zero disables keep alive handling on both ends.
    /// Sub-second precision is lost on the wire.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.options.keep_alive = keep_alive;
        self
    }

    /// Sets the will message the broker publishes if this connection ends abnormally.
    pub fn with_will(mut self, will: Message) -> Self {
        self.options.will = Some(will);
        self
    }

    /// Creates a new set of connect options.
    pub fn build(self) -> ConnectOptions {
        self.options
    }
}

// Keep alive bookkeeping.  Every wire send resets the window; a ping left unanswered for a
// full window is a dead connection.
pub(crate) struct Tracker {
    keep_alive: Duration,
    last_send: Instant,
    pending_ping: bool,
}

impl Tracker {
    pub(crate) fn new(keep_alive: Duration) -> Self {
        Tracker {
            keep_alive,
            last_send: Instant::now(),
            pending_ping: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_send = Instant::now();
    }

    pub(crate) fn ping(&mut self) {
        self.pending_ping = true;
    }

    pub(crate) fn pong(&mut self) {
        self.pending_ping = false;
    }

    pub(crate) fn pending(&self) -> bool {
        self.pending_ping
    }

    // time left until another ping is due; zero means due now
    pub(crate) fn window(&self) -> Duration {
        self.keep_alive.saturating_sub(self.last_send.elapsed())
    }
}

const STATE_INITIAL: u32 = 0;
const STATE_CONNECTING: u32 = 1;
const STATE_CONNACKED: u32 = 2;
const STATE_CONNECTED: u32 = 3;
const STATE_DISCONNECTING: u32 = 4;
const STATE_DISCONNECTED: u32 = 5;

struct ClientInner {
    session: Arc<dyn Session>,
    futures: Arc<FutureStore>,
    callback: Mutex<Option<Callback>>,

    state: AtomicU32,
    clean: AtomicBool,
    finished: AtomicBool,
    dying: Trigger,

    api_lock: tokio::sync::Mutex<()>,
    writer: tokio::sync::Mutex<Option<PacketWriter>>,
    connect_future: Mutex<Option<ConnectFuture>>,
    tracker: Mutex<Option<Tracker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A single-use MQTT 3.1.1 client.  Connect once; after the connection ends the client
/// cannot be reused.
///
/// All operation methods return futures that settle when the broker acknowledges the
/// operation.  Outgoing QoS 1/2 packets are stored in the session and replayed by the next
/// client that shares it.  When the connection dies, all waiting futures are canceled.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {

    /// Creates a client with a fresh in-memory session.
    pub fn new() -> Self {
        Client::with_shared(Arc::new(MemorySession::new()), Arc::new(FutureStore::new()))
    }

    pub(crate) fn with_shared(session: Arc<dyn Session>, futures: Arc<FutureStore>) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                session,
                futures,
                callback: Mutex::new(None),
                state: AtomicU32::new(STATE_INITIAL),
                clean: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                dying: Trigger::new(),
                api_lock: tokio::sync::Mutex::new(()),
                writer: tokio::sync::Mutex::new(None),
                connect_future: Mutex::new(None),
                tracker: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the session backing this client.
    pub fn session(&self) -> Arc<dyn Session> {
        self.inner.session.clone()
    }

    /// Installs the callback for inbound messages and the final connection error.  Must be
    /// set before connecting to observe every event.
    pub fn set_callback(&self, callback: Callback) {
        *self.inner.callback.lock().unwrap() = Some(callback);
    }

    /// Dials the broker URL and sends a Connect packet built from the options.  Credentials
    /// are taken from the URL's user-info section.  The returned future settles once the
    /// Connack arrives.
    pub async fn connect(&self, broker_url: &str, options: ConnectOptions) -> MqttResult<ConnectFuture> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() >= STATE_CONNECTING {
            return Err(MqttError::AlreadyConnecting);
        }

        let url = Url::parse(broker_url).map_err(MqttError::new_transport_error)?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            other => {
                return Err(MqttError::new_transport_error(format!("unsupported broker url scheme {:?}", other)));
            }
        }

        let host = url.host_str()
            .ok_or_else(|| MqttError::new_transport_error("broker url is missing a host"))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let username =
            if url.username().is_empty() {
                None
            } else {
                Some(url.username().to_string())
            };
        let password = url.password().map(|password| password.as_bytes().to_vec());

        let stream = TcpStream::connect((host, port)).await?;
        info!("client - transport connection established to {}:{}", host, port);

        self.start_connection(stream, options, username, password).await
    }

    /// Runs the connect handshake over an already established byte stream.  Useful for
    /// transports this crate does not dial itself.
    pub async fn connect_stream<S>(&self, stream: S, options: ConnectOptions) -> MqttResult<ConnectFuture>
        where S : AsyncRead + AsyncWrite + Send + Sync + 'static {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() >= STATE_CONNECTING {
            return Err(MqttError::AlreadyConnecting);
        }

        self.start_connection(stream, options, None, None).await
    }

    async fn start_connection<S>(&self, stream: S, options: ConnectOptions, username: Option<String>, password: Option<Vec<u8>>)
        -> MqttResult<ConnectFuture>
        where S : AsyncRead + AsyncWrite + Send + Sync + 'static {
        if !options.clean_session && options.client_id.is_empty() {
            return Err(MqttError::MissingClientId);
        }

        *self.inner.tracker.lock().unwrap() = Some(Tracker::new(options.keep_alive));

        let (reader, writer) = split_stream(stream);
        *self.inner.writer.lock().await = Some(writer);

        // from this point on the client is spent and any failure must run cleanup
        self.set_state(STATE_CONNECTING);
        self.inner.clean.store(options.clean_session, Ordering::SeqCst);

        if options.clean_session {
            if let Err(error) = self.inner.session.reset() {
                return Err(self.fail(error, true).await);
            }
        }

        let connect = ConnectPacket {
            client_id: options.client_id,
            clean_session: options.clean_session,
            keep_alive: options.keep_alive.as_secs().min(u64::from(u16::MAX)) as u16,
            will: options.will,
            username,
            password,
        };

        let connect_future = ConnectFuture::new();
        *self.inner.connect_future.lock().unwrap() = Some(connect_future.clone());

        if let Err(error) = self.send_packet(&MqttPacket::Connect(connect), false).await {
            return Err(self.fail(error, false).await);
        }

        let processor_client = self.clone();
        let processor = tokio::spawn(async move {
            processor_client.processor(reader).await;
        });

        let mut tasks = vec![processor];
        if !options.keep_alive.is_zero() {
            let pinger_client = self.clone();
            tasks.push(tokio::spawn(async move {
                pinger_client.pinger().await;
            }));
        }

        self.inner.tasks.lock().unwrap().extend(tasks);

        Ok(connect_future)
    }

    /// Sends a Publish packet.  The returned future settles when the quality of service
    /// flow completes: immediately for QoS 0, on Puback for QoS 1, on Pubcomp for QoS 2.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> MqttResult<PublishFuture> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() != STATE_CONNECTED {
            return Err(MqttError::NotConnected);
        }

        let mut publish = PublishPacket::new(Message::new(topic, payload, qos, retain));
        if qos != QualityOfService::AtMostOnce {
            publish.packet_id = self.inner.session.next_id()?;
        }

        let future = PublishFuture::new();
        if qos != QualityOfService::AtMostOnce {
            self.inner.futures.put(publish.packet_id, StoredFuture::Publish(future.clone()));
        }

        let store = qos != QualityOfService::AtMostOnce;
        if let Err(error) = self.send_packet(&MqttPacket::Publish(publish), store).await {
            return Err(self.fail(error, false).await);
        }

        if qos == QualityOfService::AtMostOnce {
            future.complete(());
        }

        Ok(future)
    }

    /// Sends a Subscribe packet with a single entry.
    pub async fn subscribe(&self, topic_filter: &str, qos: QualityOfService) -> MqttResult<SubscribeFuture> {
        self.subscribe_multiple(vec![Subscription::new(topic_filter, qos)]).await
    }

    /// Sends a Subscribe packet.  The returned future settles with the granted return
    /// codes once the Suback arrives.
    pub async fn subscribe_multiple(&self, subscriptions: Vec<Subscription>) -> MqttResult<SubscribeFuture> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() != STATE_CONNECTED {
            return Err(MqttError::NotConnected);
        }

        let subscribe = SubscribePacket {
            packet_id: self.inner.session.next_id()?,
            subscriptions,
        };

        let future = SubscribeFuture::new();
        self.inner.futures.put(subscribe.packet_id, StoredFuture::Subscribe(future.clone()));

        if let Err(error) = self.send_packet(&MqttPacket::Subscribe(subscribe), false).await {
            return Err(self.fail(error, false).await);
        }

        Ok(future)
    }

    /// Sends an Unsubscribe packet with a single topic filter.
    pub async fn unsubscribe(&self, topic_filter: &str) -> MqttResult<UnsubscribeFuture> {
        self.unsubscribe_multiple(vec![topic_filter.to_string()]).await
    }

    /// Sends an Unsubscribe packet.  The returned future settles once the Unsuback arrives.
    pub async fn unsubscribe_multiple(&self, topic_filters: Vec<String>) -> MqttResult<UnsubscribeFuture> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() != STATE_CONNECTED {
            return Err(MqttError::NotConnected);
        }

        let unsubscribe = UnsubscribePacket {
            packet_id: self.inner.session.next_id()?,
            topic_filters,
        };

        let future = UnsubscribeFuture::new();
        self.inner.futures.put(unsubscribe.packet_id, StoredFuture::Unsubscribe(future.clone()));

        if let Err(error) = self.send_packet(&MqttPacket::Unsubscribe(unsubscribe), false).await {
            return Err(self.fail(error, false).await);
        }

        Ok(future)
    }

    /// Sends a Disconnect packet and closes the connection cleanly.  When a timeout is
    /// given, outstanding operation futures are given that long to settle first.
    pub async fn disconnect(&self, timeout: Option<Duration>) -> MqttResult<()> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() != STATE_CONNECTED {
            return Err(MqttError::NotConnected);
        }

        if let Some(timeout) = timeout {
            let _ = self.inner.futures.settle_all(timeout).await;
        }

        self.set_state(STATE_DISCONNECTING);

        let send_result = self.send_packet(&MqttPacket::Disconnect, false).await;
        self.end(send_result.err()).await
    }

    /// Closes the connection immediately, without a Disconnect packet and without waiting
    /// for outstanding transmissions.
    pub async fn close(&self) -> MqttResult<()> {
        let _guard = self.inner.api_lock.lock().await;

        if self.state() < STATE_CONNECTING {
            return Err(MqttError::NotConnected);
        }

        self.end(None).await
    }

    /* processor task */

    async fn processor(&self, mut reader: PacketReader) {
        let dying = self.inner.dying.clone();

        loop {
            let result = tokio::select! {
                biased;
                _ = dying.wait() => { return; }
                result = reader.receive() => { result }
            };

            let packet = match result {
                Ok(packet) => { packet }
                Err(error) => {
                    // an error after disconnect started is just the connection winding down
                    if self.state() >= STATE_DISCONNECTING {
                        return;
                    }

                    let error = match error {
                        MqttError::ConnectionClosed => { MqttError::UnexpectedClose }
                        other => { other }
                    };

                    self.die(error, false).await;
                    return;
                }
            };

            if self.process_packet(packet).await.is_err() {
                return;
            }
        }
    }

    // handlers use the error arm only to stop the processor; by the time they return an
    // error the connection has already been cleaned
    async fn process_packet(&self, packet: MqttPacket) -> MqttResult<()> {
        match packet {
            MqttPacket::Connack(connack) => { self.process_connack(connack).await }
            MqttPacket::Suback(suback) => { self.process_suback(suback) }
            MqttPacket::Unsuback(unsuback) => { self.process_unsuback(unsuback) }
            MqttPacket::Publish(publish) => { self.process_publish(publish).await }
            MqttPacket::Puback(puback) => { self.process_puback_and_pubcomp(puback.packet_id) }
            MqttPacket::Pubcomp(pubcomp) => { self.process_puback_and_pubcomp(pubcomp.packet_id) }
            MqttPacket::Pubrec(pubrec) => { self.process_pubrec(pubrec.packet_id).await }
            MqttPacket::Pubrel(pubrel) => { self.process_pubrel(pubrel.packet_id).await }
            MqttPacket::Pingresp => {
                if let Some(tracker) = self.inner.tracker.lock().unwrap().as_mut() {
                    tracker.pong();
                }
                Ok(())
            }

            // everything else is silently ignored
            _ => { Ok(()) }
        }
    }

    async fn process_connack(&self, connack: ConnackPacket) -> MqttResult<()> {
        if self.state() != STATE_CONNECTING {
            // ignore a wrongly sent Connack packet
            return Ok(());
        }

        let connect_future = self.inner.connect_future.lock().unwrap().clone();

        if !connack.return_code.is_success() {
            // past this state the cleanup no longer cancels the connect future; it has to
            // complete carrying the return code
            self.set_state(STATE_CONNACKED);

            if let Some(future) = connect_future {
                future.complete(connack);
            }

            self.die(MqttError::ConnectionDenied(connack.return_code), true).await;
            return Err(MqttError::Disconnected);
        }

        self.set_state(STATE_CONNECTED);
        info!("client - connection established, session present: {}", connack.session_present);

        if let Some(future) = connect_future {
            future.complete(connack);
        }

        // replay stored outgoing packets, marking publishes as duplicate deliveries
        let stored_packets = match self.inner.session.all_packets(Direction::Outgoing) {
            Ok(packets) => { packets }
            Err(error) => {
                self.die(error, true).await;
                return Err(MqttError::Disconnected);
            }
        };

        for mut packet in stored_packets {
            if let MqttPacket::Publish(publish) = &mut packet {
                publish.duplicate = true;
            }

            if let Err(error) = self.send_packet(&packet, false).await {
                self.die(error, false).await;
                return Err(MqttError::Disconnected);
            }
        }

        Ok(())
    }

    fn process_suback(&self, suback: SubackPacket) -> MqttResult<()> {
        match self.inner.futures.get(suback.packet_id) {
            Some(StoredFuture::Subscribe(future)) => {
                future.complete(suback.return_codes);
                self.inner.futures.remove(suback.packet_id);
            }

            // ignore a wrongly sent Suback packet
            _ => {}
        }

        Ok(())
    }

    fn process_unsuback(&self, unsuback: UnsubackPacket) -> MqttResult<()> {
        match self.inner.futures.get(unsuback.packet_id) {
            Some(StoredFuture::Unsubscribe(future)) => {
                future.complete(());
                self.inner.futures.remove(unsuback.packet_id);
            }

            // ignore a wrongly sent Unsuback packet
            _ => {}
        }

        Ok(())
    }

    async fn process_publish(&self, publish: PublishPacket) -> MqttResult<()> {
        match publish.message.qos {
            QualityOfService::AtMostOnce => {
                self.forward(publish.message);
            }

            QualityOfService::AtLeastOnce => {
                let puback = MqttPacket::Puback(PubackPacket { packet_id: publish.packet_id });
                if let Err(error) = self.send_packet(&puback, false).await {
                    self.die(error, false).await;
                    return Err(MqttError::Disconnected);
                }

                self.forward(publish.message);
            }

            QualityOfService::ExactlyOnce => {
                let packet_id = publish.packet_id;
                if let Err(error) = self.inner.session.save_packet(Direction::Incoming, MqttPacket::Publish(publish)) {
                    self.die(error, true).await;
                    return Err(MqttError::Disconnected);
                }

                let pubrec = MqttPacket::Pubrec(PubrecPacket { packet_id });
                if let Err(error) = self.send_packet(&pubrec, false).await {
                    self.die(error, false).await;
                    return Err(MqttError::Disconnected);
                }
            }
        }

        Ok(())
    }

    fn process_puback_and_pubcomp(&self, packet_id: u16) -> MqttResult<()> {
        let _ = self.inner.session.delete_packet(Direction::Outgoing, packet_id);

        match self.inner.futures.get(packet_id) {
            Some(StoredFuture::Publish(future)) => {
                future.complete(());
                self.inner.futures.remove(packet_id);
            }

            // ignore a wrongly sent Puback or Pubcomp packet
            _ => {}
        }

        Ok(())
    }

    async fn process_pubrec(&self, packet_id: u16) -> MqttResult<()> {
        // the stored publish is overwritten; replay resumes from the pubrel
        let pubrel = MqttPacket::Pubrel(PubrelPacket { packet_id });
        if let Err(error) = self.send_packet(&pubrel, true).await {
            self.die(error, false).await;
            return Err(MqttError::Disconnected);
        }

        Ok(())
    }

    async fn process_pubrel(&self, packet_id: u16) -> MqttResult<()> {
        let publish = match self.inner.session.lookup_packet(Direction::Incoming, packet_id) {
            Ok(Some(MqttPacket::Publish(publish))) => { publish }
            Ok(_) => {
                // ignore a pubrel for an unknown delivery
                return Ok(());
            }
            Err(error) => {
                self.die(error, true).await;
                return Err(MqttError::Disconnected);
            }
        };

        let pubcomp = MqttPacket::Pubcomp(PubcompPacket { packet_id });
        if let Err(error) = self.send_packet(&pubcomp, false).await {
            self.die(error, false).await;
            return Err(MqttError::Disconnected);
        }

        if let Err(error) = self.inner.session.delete_packet(Direction::Incoming, packet_id) {
            self.die(error, true).await;
            return Err(MqttError::Disconnected);
        }

        // the message only becomes visible once the pubcomp is on the wire
        self.forward(publish.message);
        Ok(())
    }

    /* pinger task */

    async fn pinger(&self) {
        let dying = self.inner.dying.clone();

        loop {
            let (window, pending) = {
                let tracker = self.inner.tracker.lock().unwrap();
                match tracker.as_ref() {
                    Some(tracker) => { (tracker.window(), tracker.pending()) }
                    None => { return; }
                }
            };

            if window.is_zero() {
                if pending {
                    self.die(MqttError::MissingPong, true).await;
                    return;
                }

                if let Err(error) = self.send_packet(&MqttPacket::Pingreq, false).await {
                    self.die(error, false).await;
                    return;
                }

                if let Some(tracker) = self.inner.tracker.lock().unwrap().as_mut() {
                    tracker.ping();
                }
            } else {
                debug!("client - delaying keep alive by {:?}", window);

                tokio::select! {
                    biased;
                    _ = dying.wait() => { return; }
                    _ = sleep(window) => {}
                }
            }
        }
    }

    /* helpers */

    // sends a packet, optionally persisting it to the session first; every send resets the
    // keep alive window
    async fn send_packet(&self, packet: &MqttPacket, store: bool) -> MqttResult<()> {
        if store {
            self.inner.session.save_packet(Direction::Outgoing, packet.clone())?;
        }

        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(MqttError::NotConnected);
        };

        if let Some(tracker) = self.inner.tracker.lock().unwrap().as_mut() {
            tracker.reset();
        }

        writer.send(packet).await
    }

    fn forward(&self, message: Message) {
        let callback = self.inner.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(ClientEvent::Message(message));
        }
    }

    fn emit_error(&self, error: MqttError) {
        let callback = self.inner.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(ClientEvent::Error(error));
        }
    }

    fn state(&self) -> u32 {
        self.inner.state.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: u32) {
        self.inner.state.store(state, Ordering::SeqCst);
    }

    // releases as many resources as possible; always returns the error it was given (or
    // one encountered on the way) so callers can propagate
    async fn cleanup(&self, error: Option<MqttError>, close_connection: bool) -> MqttResult<()> {
        let mut error = error;

        // the connect future only survives cancellation once a Connack was seen
        if self.state() < STATE_CONNACKED {
            let connect_future = self.inner.connect_future.lock().unwrap().clone();
            if let Some(future) = connect_future {
                future.cancel();
            }
        }

        self.set_state(STATE_DISCONNECTED);

        if close_connection {
            let mut writer = self.inner.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                let _ = writer.shutdown().await;
            }
            *writer = None;
        }

        if self.inner.clean.load(Ordering::SeqCst) {
            if let Err(reset_error) = self.inner.session.reset() {
                error.get_or_insert(reset_error);
            }
        }

        self.inner.futures.cancel_all();

        match error {
            Some(error) => { Err(error) }
            None => { Ok(()) }
        }
    }

    // terminal path for user-facing calls that hit an error mid-operation
    async fn fail(&self, error: MqttError, close_connection: bool) -> MqttError {
        match self.cleanup(Some(error), close_connection).await {
            Err(error) => { error }
            Ok(()) => { MqttError::Disconnected }
        }
    }

    // terminal path for internal tasks; runs cleanup exactly once and surfaces the error
    // through the callback
    async fn die(&self, error: MqttError, close_connection: bool) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!("client - dying: {}", error);

        if let Err(error) = self.cleanup(Some(error), close_connection).await {
            self.emit_error(error);
        }

        self.inner.dying.fire();
    }

    // terminal path for disconnect and close
    async fn end(&self, error: Option<MqttError>) -> MqttResult<()> {
        let result = self.cleanup(error, true).await;

        self.inner.dying.fire();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        result
    }
}
