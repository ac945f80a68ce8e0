/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the broker side of the stack: the backend contract, the per-connection
state machine, and a minimal TCP listener that binds the two together.

Each accepted connection runs three cooperative tasks joined by a single dying trigger:

* the *processor* reads packets and drives the per-packet handlers,
* the *dequeuer* pulls outbound messages from the backend,
* the *sender* serializes every outbound packet onto the wire.
 */

use crate::error::{MqttError, MqttResult};
use crate::future::Trigger;
use crate::mqtt::*;
use crate::session::{Direction, Session};
use crate::transport::{split_stream, PacketReader, PacketWriter};

use async_trait::async_trait;
use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Default size for the per-connection token pools and the inbound packet prefetch.
pub const DEFAULT_PARALLELISM: usize = 10;

// keep alive grace factor: the read deadline is keep_alive * 1.5
const KEEP_ALIVE_GRACE_MILLIS: u64 = 1500;

/// One-shot acknowledgement handle passed along with a message to signal that the message
/// has been persisted well enough to release the sender.
///
/// Acks are plain completion channels rather than closures over the engine, so a backend
/// may hold and fire one from its own tasks even while the originating connection is
/// tearing down.
pub struct Ack {
    sender: oneshot::Sender<()>,
}

impl Ack {

    /// Creates an ack and the listener half that observes it firing.
    pub fn pair() -> (Ack, oneshot::Receiver<()>) {
        let (sender, receiver) = oneshot::channel();
        (Ack { sender }, receiver)
    }

    /// Fires the acknowledgement.  Dropping an ack without calling this leaves the
    /// associated flow unacknowledged.
    pub fn ack(self) {
        let _ = self.sender.send(());
    }
}

/// The routing, retention and authentication provider behind a broker.  One backend serves
/// every connection; the engine hands it an opaque [`Client`] handle per connection.
#[async_trait]
pub trait Backend: Send + Sync {

    /// Authenticates a connecting client.  Returning `Ok(false)` rejects the connection
    /// with a not-authorized Connack.
    async fn authenticate(&self, client: &Client, username: Option<&str>, password: Option<&[u8]>) -> MqttResult<bool>;

    /// Returns the session for the supplied client id, creating one if it is missing or a
    /// clean session was requested, plus whether prior state existed for the id.  An empty
    /// id yields a fresh temporary session that is never stored.
    ///
    /// Any existing connection using the same non-empty id must be closed before this
    /// returns (take-over semantics).
    async fn setup(&self, client: &Client, client_id: &str, clean_session: bool) -> MqttResult<(Option<Arc<dyn Session>>, bool)>;

    /// One-shot notification fired after the engine has replayed stored packets and
    /// resubscribed stored subscriptions.
    async fn restored(&self, client: &Client) -> MqttResult<()>;

    /// Attaches live subscriptions for the client and queues matching retained messages
    /// onto its outgoing queue.  When `stored` is set the subscriptions are being replayed
    /// from a resumed session and retained messages must be delivered with the retain flag
    /// cleared.
    async fn subscribe(&self, client: &Client, subscriptions: &[Subscription], stored: bool) -> MqttResult<()>;

    /// Detaches live subscriptions for the client.
    async fn unsubscribe(&self, client: &Client, topic_filters: &[String]) -> MqttResult<()>;

    /// Fans the message out to matching live subscribers and appends it to offline
    /// sessions with matching stored subscriptions (QoS > 0 only).  A retained message
    /// updates the retained store first: an empty payload clears the entry, anything else
    /// replaces it, and the retain flag is cleared before forwarding.
    ///
    /// When an ack is supplied it must be fired exactly once, during or after this call,
    /// once the message is safe to release.
    async fn publish(&self, client: &Client, message: Message, ack: Option<Ack>) -> MqttResult<()>;

    /// Blocks until the next message for the client is available, or until the client's
    /// closing signal fires, which is the only case that returns `Ok(None)`.
    async fn dequeue(&self, client: &Client) -> MqttResult<Option<(Message, Option<Ack>)>>;

    /// Releases everything associated with the client.  Live subscriptions are detached
    /// and may be converted to offline subscriptions for non-clean sessions.
    async fn terminate(&self, client: &Client) -> MqttResult<()>;
}

const STATE_CONNECTING: u32 = 0;
const STATE_CONNECTED: u32 = 1;
const STATE_DISCONNECTED: u32 = 2;

static NEXT_CONNECTION_UID: AtomicU64 = AtomicU64::new(1);

struct ClientInner {
    uid: u64,
    remote_address: Option<SocketAddr>,
    state: AtomicU32,
    client_id: RwLock<String>,
    session: RwLock<Option<Arc<dyn Session>>>,
    packet_prefetch: AtomicUsize,
    parallel_publishes: AtomicUsize,
    parallel_dequeues: AtomicUsize,
    dying: Trigger,
    closed: Trigger,
}

/// Broker-side handle for one remote client connection.  Clones share the same connection;
/// the backend keeps clones to target queues and to close connections during take-over.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    fn new(remote_address: Option<SocketAddr>) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                uid: NEXT_CONNECTION_UID.fetch_add(1, Ordering::Relaxed),
                remote_address,
                state: AtomicU32::new(STATE_CONNECTING),
                client_id: RwLock::new(String::new()),
                session: RwLock::new(None),
                packet_prefetch: AtomicUsize::new(DEFAULT_PARALLELISM),
                parallel_publishes: AtomicUsize::new(DEFAULT_PARALLELISM),
                parallel_dequeues: AtomicUsize::new(DEFAULT_PARALLELISM),
                dying: Trigger::new(),
                closed: Trigger::new(),
            }),
        }
    }

    // handle without an engine behind it, for exercising backends directly
    #[cfg(test)]
    pub(crate) fn detached() -> Client {
        Client::new(None)
    }

    /// Takes over a freshly accepted connection and runs its engine to completion in the
    /// background.  The returned handle observes and controls the connection.
    pub fn accept<S>(backend: Arc<dyn Backend>, stream: S, remote_address: Option<SocketAddr>) -> Client
        where S : AsyncRead + AsyncWrite + Send + Sync + 'static {
        let client = Client::new(remote_address);
        info!("[{}] new connection", client.uid());

        let engine_client = client.clone();
        tokio::spawn(async move {
            let (reader, writer) = split_stream(stream);

            let mut processor = Processor {
                client: engine_client.clone(),
                backend: backend.clone(),
                dying: engine_client.inner.dying.clone(),
                reader,
                task_handles: Vec::new(),
            };

            let result = processor.run(writer).await;
            match &result {
                Ok(()) => { info!("[{}] processor finished", engine_client.uid()); }
                Err(error) => { info!("[{}] processor finished: {}", engine_client.uid(), error); }
            }

            engine_client.inner.dying.fire();
            for handle in processor.task_handles.drain(..) {
                let _ = handle.await;
            }

            cleanup(&engine_client, backend.as_ref()).await;
            engine_client.inner.closed.fire();
            info!("[{}] connection closed", engine_client.uid());
        });

        client
    }

    /// Returns the client id supplied during the connect handshake.  Empty before the
    /// handshake and for anonymous clients.
    pub fn id(&self) -> String {
        self.inner.client_id.read().unwrap().clone()
    }

    /// Returns the session attached to this connection, if the handshake has reached
    /// session setup.
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.inner.session.read().unwrap().clone()
    }

    /// Returns the peer address the connection was accepted from.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote_address
    }

    /// Immediately starts closing the connection.
    pub fn close(&self) {
        self.inner.dying.fire();
    }

    /// Returns a signal that fires when the connection starts closing.
    pub fn closing(&self) -> Trigger {
        self.inner.dying.clone()
    }

    /// Returns a signal that fires once every connection task has finished and cleanup
    /// has run.
    pub fn closed(&self) -> Trigger {
        self.inner.closed.clone()
    }

    /// Returns an identifier unique to this connection, distinguishing consecutive
    /// connections that reuse a client id.
    pub fn uid(&self) -> u64 {
        self.inner.uid
    }

    /// Bounds the processor's buffered inbound packets.  Intended to be called by the
    /// backend during setup.
    pub fn set_packet_prefetch(&self, limit: usize) {
        self.inner.packet_prefetch.store(limit.max(1), Ordering::SeqCst);
    }

    /// Bounds the concurrent inbound QoS 1/2 flows awaiting a backend ack.  Intended to be
    /// called by the backend during setup.
    pub fn set_parallel_publishes(&self, limit: usize) {
        self.inner.parallel_publishes.store(limit.max(1), Ordering::SeqCst);
    }

    /// Bounds the concurrent outbound messages dequeued from the backend.  Intended to be
    /// called by the backend during setup.
    pub fn set_parallel_dequeues(&self, limit: usize) {
        self.inner.parallel_dequeues.store(limit.max(1), Ordering::SeqCst);
    }

    fn state(&self) -> u32 {
        self.inner.state.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: u32) {
        self.inner.state.store(state, Ordering::SeqCst);
    }
}

// records the terminal event, starts the teardown, and hands the error back for propagation
fn die(uid: u64, dying: &Trigger, error: MqttError) -> MqttError {
    if error.is_clean_disconnect() {
        info!("[{}] closing: {}", uid, error);
    } else {
        warn!("[{}] dying: {}", uid, error);
    }

    dying.fire();
    error
}

// everything that flows to the wire goes through the sender's channel, giving wire output
// a single total order per connection
enum Outgoing {
    // packets produced directly by the processor's handlers
    Control(MqttPacket),

    // puback/pubcomp released by a backend ack; sending one returns a publish token
    Ack(MqttPacket),

    // a dequeued message on its way to becoming a publish packet
    Message {
        message: Message,
        ack: Option<Ack>,
    },
}

// processor-side handles created during the connect handshake
struct Flows {
    session: Arc<dyn Session>,
    outgoing: mpsc::Sender<Outgoing>,
    publish_tokens: mpsc::Receiver<()>,
    dequeue_tokens: mpsc::Sender<()>,
}

struct Processor {
    client: Client,
    backend: Arc<dyn Backend>,
    dying: Trigger,
    reader: PacketReader,
    task_handles: Vec<JoinHandle<()>>,
}

impl Processor {

    async fn run(&mut self, writer: PacketWriter) -> MqttResult<()> {
        let first = match self.receive().await? {
            Some(packet) => { packet }
            None => { return Ok(()); }
        };

        let connect = match first {
            MqttPacket::Connect(connect) => { connect }
            _ => {
                return Err(die(self.client.uid(), &self.dying, MqttError::ExpectedConnect));
            }
        };

        let (mut flows, sender, dequeuer) = self.process_connect(connect, writer).await?;
        self.task_handles.push(tokio::spawn(sender.run()));
        self.task_handles.push(tokio::spawn(dequeuer.run()));

        loop {
            if self.dying.is_fired() {
                return Ok(());
            }

            let packet = match self.receive().await? {
                Some(packet) => { packet }
                None => { return Ok(()); }
            };

            self.process_packet(packet, &mut flows).await?;
        }
    }

    // reads the next packet, honoring the dying signal; Ok(None) means the connection is
    // shutting down
    async fn receive(&mut self) -> MqttResult<Option<MqttPacket>> {
        let dying = self.dying.clone();

        tokio::select! {
            biased;
            _ = dying.wait() => {
                Ok(None)
            }
            result = self.reader.receive() => {
                match result {
                    Ok(packet) => { Ok(Some(packet)) }
                    Err(error) => { Err(die(self.client.uid(), &self.dying, error)) }
                }
            }
        }
    }

    async fn process_connect(&mut self, connect: ConnectPacket, mut writer: PacketWriter)
        -> MqttResult<(Flows, SenderTask, DequeuerTask)> {
        let uid = self.client.uid();
        *self.client.inner.client_id.write().unwrap() = connect.client_id.clone();

        let authenticated = match self.backend.authenticate(
            &self.client, connect.username.as_deref(), connect.password.as_deref()).await {
            Ok(authenticated) => { authenticated }
            Err(error) => { return Err(die(uid, &self.dying, error)); }
        };

        let mut connack = ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::Accepted,
        };

        if !authenticated {
            connack.return_code = ConnectReturnCode::NotAuthorized;
            if let Err(error) = writer.send(&MqttPacket::Connack(connack)).await {
                return Err(die(uid, &self.dying, error));
            }

            return Err(die(uid, &self.dying, MqttError::NotAuthorized));
        }

        self.client.set_state(STATE_CONNECTED);

        if connect.keep_alive > 0 {
            self.reader.set_read_deadline(
                Some(Duration::from_millis(u64::from(connect.keep_alive) * KEEP_ALIVE_GRACE_MILLIS)));
        } else {
            self.reader.set_read_deadline(None);
        }

        let (session, resumed) = match self.backend.setup(
            &self.client, &connect.client_id, connect.clean_session).await {
            Ok((Some(session), resumed)) => { (session, resumed) }
            Ok((None, _)) => {
                return Err(die(uid, &self.dying, MqttError::MissingSession));
            }
            Err(error) => { return Err(die(uid, &self.dying, error)); }
        };

        connack.session_present = !connect.clean_session && resumed;
        *self.client.inner.session.write().unwrap() = Some(session.clone());

        let prefetch = self.client.inner.packet_prefetch.load(Ordering::SeqCst);
        let parallel_publishes = self.client.inner.parallel_publishes.load(Ordering::SeqCst);
        let parallel_dequeues = self.client.inner.parallel_dequeues.load(Ordering::SeqCst);

        self.reader.set_packet_prefetch(prefetch);

        let (publish_token_sender, publish_token_receiver) = mpsc::channel(parallel_publishes);
        for _ in 0..parallel_publishes {
            let _ = publish_token_sender.try_send(());
        }

        let (dequeue_token_sender, dequeue_token_receiver) = mpsc::channel(parallel_dequeues);
        for _ in 0..parallel_dequeues {
            let _ = dequeue_token_sender.try_send(());
        }

        let (outgoing_sender, outgoing_receiver) = mpsc::channel(parallel_publishes + parallel_dequeues);

        if let Some(will) = connect.will {
            if let Err(error) = session.save_will(will) {
                return Err(die(uid, &self.dying, error));
            }
        }

        if let Err(error) = writer.send(&MqttPacket::Connack(connack)).await {
            return Err(die(uid, &self.dying, error));
        }

        // replay stored outgoing packets in their original order, marking publishes as
        // duplicate deliveries
        let stored_packets = match session.all_packets(Direction::Outgoing) {
            Ok(packets) => { packets }
            Err(error) => { return Err(die(uid, &self.dying, error)); }
        };

        for mut packet in stored_packets {
            if let MqttPacket::Publish(publish) = &mut packet {
                publish.duplicate = true;
            }

            if let Err(error) = writer.send_buffered(&packet).await {
                return Err(die(uid, &self.dying, error));
            }
        }

        if let Err(error) = writer.flush().await {
            return Err(die(uid, &self.dying, error));
        }

        let stored_subscriptions = match session.all_subscriptions() {
            Ok(subscriptions) => { subscriptions }
            Err(error) => { return Err(die(uid, &self.dying, error)); }
        };

        if let Err(error) = self.backend.subscribe(&self.client, &stored_subscriptions, true).await {
            return Err(die(uid, &self.dying, error));
        }

        if let Err(error) = self.backend.restored(&self.client).await {
            return Err(die(uid, &self.dying, error));
        }

        let sender = SenderTask {
            uid,
            session: session.clone(),
            dying: self.dying.clone(),
            writer,
            outgoing: outgoing_receiver,
            publish_tokens: publish_token_sender,
            dequeue_tokens: dequeue_token_sender.clone(),
        };

        let dequeuer = DequeuerTask {
            client: self.client.clone(),
            backend: self.backend.clone(),
            dying: self.dying.clone(),
            tokens: dequeue_token_receiver,
            outgoing: outgoing_sender.clone(),
        };

        let flows = Flows {
            session,
            outgoing: outgoing_sender,
            publish_tokens: publish_token_receiver,
            dequeue_tokens: dequeue_token_sender,
        };

        Ok((flows, sender, dequeuer))
    }

    async fn process_packet(&mut self, packet: MqttPacket, flows: &mut Flows) -> MqttResult<()> {
        match packet {
            MqttPacket::Subscribe(subscribe) => { self.process_subscribe(subscribe, flows).await }
            MqttPacket::Unsubscribe(unsubscribe) => { self.process_unsubscribe(unsubscribe, flows).await }
            MqttPacket::Publish(publish) => { self.process_publish(publish, flows).await }
            MqttPacket::Puback(puback) => { self.process_puback_and_pubcomp(puback.packet_id, flows).await }
            MqttPacket::Pubcomp(pubcomp) => { self.process_puback_and_pubcomp(pubcomp.packet_id, flows).await }
            MqttPacket::Pubrec(pubrec) => { self.process_pubrec(pubrec.packet_id, flows).await }
            MqttPacket::Pubrel(pubrel) => { self.process_pubrel(pubrel.packet_id, flows).await }
            MqttPacket::Pingreq => { self.enqueue(flows, Outgoing::Control(MqttPacket::Pingresp)).await }
            MqttPacket::Disconnect => { self.process_disconnect(flows) }

            // everything else is silently ignored
            _ => { Ok(()) }
        }
    }

    async fn process_subscribe(&mut self, subscribe: SubscribePacket, flows: &mut Flows) -> MqttResult<()> {
        let uid = self.client.uid();

        let mut suback = SubackPacket {
            packet_id: subscribe.packet_id,
            return_codes: Vec::with_capacity(subscribe.subscriptions.len()),
        };

        for subscription in &subscribe.subscriptions {
            if let Err(error) = flows.session.save_subscription(subscription.clone()) {
                return Err(die(uid, &self.dying, error));
            }

            suback.return_codes.push(subscription.qos as u8);
        }

        if let Err(error) = self.backend.subscribe(&self.client, &subscribe.subscriptions, false).await {
            return Err(die(uid, &self.dying, error));
        }

        self.enqueue(flows, Outgoing::Control(MqttPacket::Suback(suback))).await
    }

    async fn process_unsubscribe(&mut self, unsubscribe: UnsubscribePacket, flows: &mut Flows) -> MqttResult<()> {
        let uid = self.client.uid();

        if let Err(error) = self.backend.unsubscribe(&self.client, &unsubscribe.topic_filters).await {
            return Err(die(uid, &self.dying, error));
        }

        for topic_filter in &unsubscribe.topic_filters {
            if let Err(error) = flows.session.delete_subscription(topic_filter) {
                return Err(die(uid, &self.dying, error));
            }
        }

        let unsuback = UnsubackPacket { packet_id: unsubscribe.packet_id };
        self.enqueue(flows, Outgoing::Control(MqttPacket::Unsuback(unsuback))).await
    }

    async fn process_publish(&mut self, publish: PublishPacket, flows: &mut Flows) -> MqttResult<()> {
        let uid = self.client.uid();

        match publish.message.qos {
            QualityOfService::AtMostOnce => {
                if let Err(error) = self.backend.publish(&self.client, publish.message, None).await {
                    return Err(die(uid, &self.dying, error));
                }
            }

            QualityOfService::AtLeastOnce => {
                self.acquire_publish_token(flows).await?;

                let puback = MqttPacket::Puback(PubackPacket { packet_id: publish.packet_id });
                let ack = self.arm_ack(flows, puback);

                if let Err(error) = self.backend.publish(&self.client, publish.message, Some(ack)).await {
                    return Err(die(uid, &self.dying, error));
                }
            }

            QualityOfService::ExactlyOnce => {
                // store first; the publish token is only taken once the pubrel arrives
                if let Err(error) = flows.session.save_packet(Direction::Incoming, MqttPacket::Publish(publish.clone())) {
                    return Err(die(uid, &self.dying, error));
                }

                let pubrec = MqttPacket::Pubrec(PubrecPacket { packet_id: publish.packet_id });
                self.enqueue(flows, Outgoing::Control(pubrec)).await?;
            }
        }

        Ok(())
    }

    async fn process_puback_and_pubcomp(&mut self, packet_id: u16, flows: &mut Flows) -> MqttResult<()> {
        if let Err(error) = flows.session.delete_packet(Direction::Outgoing, packet_id) {
            return Err(die(self.client.uid(), &self.dying, error));
        }

        // a spurious ack from the peer would overfill the pool; dropping the return is safe
        let _ = flows.dequeue_tokens.try_send(());
        Ok(())
    }

    async fn process_pubrec(&mut self, packet_id: u16, flows: &mut Flows) -> MqttResult<()> {
        let pubrel = MqttPacket::Pubrel(PubrelPacket { packet_id });

        // overwrite the stored publish; replay now resumes from the pubrel
        if let Err(error) = flows.session.save_packet(Direction::Outgoing, pubrel.clone()) {
            return Err(die(self.client.uid(), &self.dying, error));
        }

        self.enqueue(flows, Outgoing::Control(pubrel)).await
    }

    async fn process_pubrel(&mut self, packet_id: u16, flows: &mut Flows) -> MqttResult<()> {
        let uid = self.client.uid();

        let publish = match flows.session.lookup_packet(Direction::Incoming, packet_id) {
            Ok(Some(MqttPacket::Publish(publish))) => { publish }
            Ok(_) => {
                // ignore a pubrel for an unknown delivery
                return Ok(());
            }
            Err(error) => { return Err(die(uid, &self.dying, error)); }
        };

        self.acquire_publish_token(flows).await?;

        // the stored publish is only removed once the pubcomp has actually been sent
        let pubcomp = MqttPacket::Pubcomp(PubcompPacket { packet_id });
        let ack = self.arm_ack(flows, pubcomp);

        if let Err(error) = self.backend.publish(&self.client, publish.message, Some(ack)).await {
            return Err(die(uid, &self.dying, error));
        }

        Ok(())
    }

    fn process_disconnect(&mut self, flows: &mut Flows) -> MqttResult<()> {
        if let Err(error) = flows.session.clear_will() {
            return Err(die(self.client.uid(), &self.dying, error));
        }

        self.client.set_state(STATE_DISCONNECTED);
        Err(die(self.client.uid(), &self.dying, MqttError::Disconnected))
    }

    // creates an ack whose firing enqueues the given packet to the sender, unless the
    // connection dies first
    fn arm_ack(&self, flows: &Flows, packet: MqttPacket) -> Ack {
        let (ack, fired) = Ack::pair();
        let outgoing = flows.outgoing.clone();
        let dying = self.dying.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = dying.wait() => {}
                result = fired => {
                    if result.is_ok() {
                        tokio::select! {
                            biased;
                            _ = dying.wait() => {}
                            _ = outgoing.send(Outgoing::Ack(packet)) => {}
                        }
                    }
                }
            }
        });

        ack
    }

    async fn acquire_publish_token(&self, flows: &mut Flows) -> MqttResult<()> {
        let dying = self.dying.clone();

        tokio::select! {
            biased;
            _ = dying.wait() => { Err(MqttError::Disconnected) }
            token = flows.publish_tokens.recv() => {
                match token {
                    Some(()) => { Ok(()) }
                    None => { Err(MqttError::Disconnected) }
                }
            }
        }
    }

    async fn enqueue(&self, flows: &Flows, event: Outgoing) -> MqttResult<()> {
        let dying = self.dying.clone();

        tokio::select! {
            biased;
            _ = dying.wait() => { Err(MqttError::Disconnected) }
            result = flows.outgoing.send(event) => {
                result.map_err(|_| MqttError::Disconnected)
            }
        }
    }
}

struct DequeuerTask {
    client: Client,
    backend: Arc<dyn Backend>,
    dying: Trigger,
    tokens: mpsc::Receiver<()>,
    outgoing: mpsc::Sender<Outgoing>,
}

impl DequeuerTask {
    async fn run(mut self) {
        loop {
            let token = tokio::select! {
                biased;
                _ = self.dying.wait() => { return; }
                token = self.tokens.recv() => { token }
            };

            if token.is_none() {
                return;
            }

            let dequeued = match self.backend.dequeue(&self.client).await {
                Ok(dequeued) => { dequeued }
                Err(error) => {
                    die(self.client.uid(), &self.dying, error);
                    return;
                }
            };

            let (message, ack) = match dequeued {
                Some(entry) => { entry }

                // the backend only returns nothing when the closing signal fired
                None => { return; }
            };

            debug!("[{}] dequeued message for topic {}", self.client.uid(), message.topic);

            let send_result = tokio::select! {
                biased;
                _ = self.dying.wait() => { return; }
                result = self.outgoing.send(Outgoing::Message { message, ack }) => { result }
            };

            if send_result.is_err() {
                return;
            }
        }
    }
}

struct SenderTask {
    uid: u64,
    session: Arc<dyn Session>,
    dying: Trigger,
    writer: PacketWriter,
    outgoing: mpsc::Receiver<Outgoing>,
    publish_tokens: mpsc::Sender<()>,
    dequeue_tokens: mpsc::Sender<()>,
}

impl SenderTask {
    async fn run(mut self) {
        'outer: loop {
            let event = tokio::select! {
                biased;
                _ = self.dying.wait() => { break; }
                event = self.outgoing.recv() => {
                    match event {
                        Some(event) => { event }
                        None => { break; }
                    }
                }
            };

            if self.handle(event).await.is_err() {
                break;
            }

            // coalesce whatever is already queued before paying for a flush
            while let Ok(event) = self.outgoing.try_recv() {
                if self.handle(event).await.is_err() {
                    break 'outer;
                }
            }

            if let Err(error) = self.writer.flush().await {
                die(self.uid, &self.dying, error);
                break;
            }
        }

        let _ = self.writer.shutdown().await;
    }

    async fn handle(&mut self, event: Outgoing) -> MqttResult<()> {
        match event {
            Outgoing::Control(packet) => {
                if let Err(error) = self.writer.send_buffered(&packet).await {
                    return Err(die(self.uid, &self.dying, error));
                }
            }

            Outgoing::Ack(packet) => {
                if let Err(error) = self.writer.send_buffered(&packet).await {
                    return Err(die(self.uid, &self.dying, error));
                }

                // the incoming half-state survives until the pubcomp is actually on the wire
                if let MqttPacket::Pubcomp(pubcomp) = &packet {
                    if let Err(error) = self.session.delete_packet(Direction::Incoming, pubcomp.packet_id) {
                        return Err(die(self.uid, &self.dying, error));
                    }
                }

                let _ = self.publish_tokens.try_send(());
            }

            Outgoing::Message { message, ack } => {
                self.send_message(message, ack).await?;
            }
        }

        Ok(())
    }

    async fn send_message(&mut self, message: Message, ack: Option<Ack>) -> MqttResult<()> {
        let mut publish = PublishPacket::new(message);

        // cap the delivery qos at whatever the stored subscription granted; retained
        // replay arrives without a stored subscription and keeps its own qos
        match self.session.lookup_subscription(&publish.message.topic) {
            Ok(Some(subscription)) => {
                if publish.message.qos > subscription.qos {
                    publish.message.qos = subscription.qos;
                }
            }
            Ok(None) => {}
            Err(error) => { return Err(die(self.uid, &self.dying, error)); }
        }

        if publish.message.qos != QualityOfService::AtMostOnce {
            publish.packet_id = match self.session.next_id() {
                Ok(packet_id) => { packet_id }
                Err(error) => { return Err(die(self.uid, &self.dying, error)); }
            };

            if let Err(error) = self.session.save_packet(Direction::Outgoing, MqttPacket::Publish(publish.clone())) {
                return Err(die(self.uid, &self.dying, error));
            }
        }

        // qos > 0 messages are now owned by the session; qos 0 custody transfers to the wire
        if let Some(ack) = ack {
            ack.ack();
        }

        if let Err(error) = self.writer.send_buffered(&MqttPacket::Publish(publish.clone())).await {
            return Err(die(self.uid, &self.dying, error));
        }

        // qos 0 flows finish here; higher qos flows return their token on the final ack
        if publish.message.qos == QualityOfService::AtMostOnce {
            let _ = self.dequeue_tokens.try_send(());
        }

        Ok(())
    }
}

async fn cleanup(client: &Client, backend: &dyn Backend) {
    let state = client.state();

    if state == STATE_CONNECTED {
        if let Some(session) = client.session() {
            match session.lookup_will() {
                Ok(Some(will)) => {
                    info!("[{}] publishing will for abnormal close", client.uid());
                    if let Err(error) = backend.publish(client, will, None).await {
                        warn!("[{}] failed to publish will: {}", client.uid(), error);
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("[{}] failed to look up will: {}", client.uid(), error);
                }
            }
        }
    }

    if state >= STATE_CONNECTED {
        if let Err(error) = backend.terminate(client).await {
            warn!("[{}] backend terminate failed: {}", client.uid(), error);
        }
    }
}

/// A plain TCP listener front for a backend.  Accepts connections and hands each one to a
/// connection engine; transport policy beyond TCP stays outside this crate.
pub struct Broker {
    backend: Arc<dyn Backend>,
}

impl Broker {

    /// Creates a broker serving the given backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Broker { backend }
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> MqttResult<()> {
        loop {
            let (stream, remote_address) = listener.accept().await?;
            Client::accept(self.backend.clone(), stream, Some(remote_address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use assert_matches::assert_matches;
    use tokio::io::DuplexStream;

    #[derive(Debug)]
    enum BackendEvent {
        Published(Message),
        Subscribed(Vec<Subscription>, bool),
        Unsubscribed(Vec<String>),
        Restored,
        Terminated,
    }

    struct ScriptedBackend {
        allow: bool,
        resumed: bool,
        session: Arc<MemorySession>,
        events: mpsc::UnboundedSender<BackendEvent>,
        queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Message, Option<Ack>)>>,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn authenticate(&self, _client: &Client, _username: Option<&str>, _password: Option<&[u8]>) -> MqttResult<bool> {
            Ok(self.allow)
        }

        async fn setup(&self, _client: &Client, _client_id: &str, _clean_session: bool) -> MqttResult<(Option<Arc<dyn Session>>, bool)> {
            Ok((Some(self.session.clone()), self.resumed))
        }

        async fn restored(&self, _client: &Client) -> MqttResult<()> {
            let _ = self.events.send(BackendEvent::Restored);
            Ok(())
        }

        async fn subscribe(&self, _client: &Client, subscriptions: &[Subscription], stored: bool) -> MqttResult<()> {
            let _ = self.events.send(BackendEvent::Subscribed(subscriptions.to_vec(), stored));
            Ok(())
        }

        async fn unsubscribe(&self, _client: &Client, topic_filters: &[String]) -> MqttResult<()> {
            let _ = self.events.send(BackendEvent::Unsubscribed(topic_filters.to_vec()));
            Ok(())
        }

        async fn publish(&self, _client: &Client, message: Message, ack: Option<Ack>) -> MqttResult<()> {
            let _ = self.events.send(BackendEvent::Published(message));
            if let Some(ack) = ack {
                ack.ack();
            }

            Ok(())
        }

        async fn dequeue(&self, client: &Client) -> MqttResult<Option<(Message, Option<Ack>)>> {
            let closing = client.closing();

            let mut queue = tokio::select! {
                biased;
                _ = closing.wait() => { return Ok(None); }
                guard = self.queue.lock() => { guard }
            };

            tokio::select! {
                biased;
                _ = closing.wait() => { Ok(None) }
                entry = queue.recv() => { Ok(entry) }
            }
        }

        async fn terminate(&self, _client: &Client) -> MqttResult<()> {
            let _ = self.events.send(BackendEvent::Terminated);
            Ok(())
        }
    }

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        events: mpsc::UnboundedReceiver<BackendEvent>,
        queue: mpsc::UnboundedSender<(Message, Option<Ack>)>,
    }

    fn scripted_backend(allow: bool, resumed: bool) -> Fixture {
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (queue_sender, queue_receiver) = mpsc::unbounded_channel();

        let backend = Arc::new(ScriptedBackend {
            allow,
            resumed,
            session: Arc::new(MemorySession::new()),
            events: event_sender,
            queue: tokio::sync::Mutex::new(queue_receiver),
        });

        Fixture {
            backend,
            events: event_receiver,
            queue: queue_sender,
        }
    }

    struct Peer {
        reader: PacketReader,
        writer: PacketWriter,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = split_stream(stream);
            Peer { reader, writer }
        }

        async fn connect(&mut self, client_id: &str, clean_session: bool, keep_alive: u16, will: Option<Message>) -> ConnackPacket {
            self.writer.send(&MqttPacket::Connect(ConnectPacket {
                client_id: client_id.to_string(),
                clean_session,
                keep_alive,
                will,
                username: None,
                password: None,
            })).await.unwrap();

            match self.reader.receive().await.unwrap() {
                MqttPacket::Connack(connack) => { connack }
                other => { panic!("expected connack, got {}", other) }
            }
        }
    }

    async fn connected_fixture(clean_session: bool) -> (Fixture, Peer, Client, ConnackPacket) {
        let mut fixture = scripted_backend(true, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let connack = peer.connect("tester", clean_session, 0, None).await;

        // handshake always replays stored subscriptions and signals restoration
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Subscribed(_, true)));
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Restored));

        (fixture, peer, client, connack)
    }

    #[tokio::test]
    async fn first_packet_must_be_connect() {
        let mut fixture = scripted_backend(true, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        peer.writer.send(&MqttPacket::Pingreq).await.unwrap();

        assert_matches!(peer.reader.receive().await, Err(MqttError::ConnectionClosed));
        client.closed().wait().await;

        // the backend was never engaged
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_credentials_get_a_failing_connack() {
        let mut fixture = scripted_backend(false, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let connack = peer.connect("tester", true, 0, None).await;
        assert_eq!(ConnectReturnCode::NotAuthorized, connack.return_code);

        client.closed().wait().await;

        // no setup happened, so no terminate either
        assert!(fixture.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn session_present_requires_resume_without_clean() {
        // resumed non-clean session
        let fixture = scripted_backend(true, true);
        let (near, far) = tokio::io::duplex(4096);
        Client::accept(fixture.backend.clone(), near, None);
        let mut peer = Peer::new(far);
        let connack = peer.connect("tester", false, 0, None).await;
        assert!(connack.session_present);

        // prior state existed, but a clean connect never reports a session
        let fixture = scripted_backend(true, true);
        let (near, far) = tokio::io::duplex(4096);
        Client::accept(fixture.backend.clone(), near, None);
        let mut peer = Peer::new(far);
        let connack = peer.connect("tester", true, 0, None).await;
        assert!(!connack.session_present);
    }

    #[tokio::test]
    async fn pingreq_is_answered() {
        let (_fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Pingreq).await.unwrap();
        assert_eq!(MqttPacket::Pingresp, peer.reader.receive().await.unwrap());
    }

    #[tokio::test]
    async fn subscribe_saves_and_acknowledges() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Subscribe(SubscribePacket {
            packet_id: 1,
            subscriptions: vec![Subscription::new("a/+", QualityOfService::AtLeastOnce)],
        })).await.unwrap();

        assert_eq!(
            MqttPacket::Suback(SubackPacket { packet_id: 1, return_codes: vec![1] }),
            peer.reader.receive().await.unwrap());

        match fixture.events.recv().await {
            Some(BackendEvent::Subscribed(subscriptions, false)) => {
                assert_eq!("a/+", subscriptions[0].topic_filter);
            }
            _ => { panic!("expected live subscribe event") }
        }

        let stored = fixture.backend.session.all_subscriptions().unwrap();
        assert_eq!(1, stored.len());
        assert_eq!("a/+", stored[0].topic_filter);
    }

    #[tokio::test]
    async fn unsubscribe_deletes_and_acknowledges() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Subscribe(SubscribePacket {
            packet_id: 1,
            subscriptions: vec![Subscription::new("a/+", QualityOfService::AtLeastOnce)],
        })).await.unwrap();
        peer.reader.receive().await.unwrap();

        peer.writer.send(&MqttPacket::Unsubscribe(UnsubscribePacket {
            packet_id: 2,
            topic_filters: vec!["a/+".to_string()],
        })).await.unwrap();

        assert_eq!(
            MqttPacket::Unsuback(UnsubackPacket { packet_id: 2 }),
            peer.reader.receive().await.unwrap());

        assert!(fixture.backend.session.all_subscriptions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn qos0_publish_reaches_backend_without_session_writes() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Publish(PublishPacket::new(
            Message::new("t", "m", QualityOfService::AtMostOnce, false)))).await.unwrap();

        match fixture.events.recv().await {
            Some(BackendEvent::Published(message)) => {
                assert_eq!(b"m".to_vec(), message.payload);
            }
            _ => { panic!("expected publish event") }
        }

        assert!(fixture.backend.session.all_packets(Direction::Incoming).unwrap().is_empty());
    }

    #[tokio::test]
    async fn qos1_publish_is_acked_after_backend_ack() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Publish(PublishPacket {
            packet_id: 5,
            duplicate: false,
            message: Message::new("t", "m", QualityOfService::AtLeastOnce, false),
        })).await.unwrap();

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Published(_)));
        assert_eq!(
            MqttPacket::Puback(PubackPacket { packet_id: 5 }),
            peer.reader.receive().await.unwrap());
    }

    #[tokio::test]
    async fn qos2_publish_runs_the_full_flow() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Publish(PublishPacket {
            packet_id: 7,
            duplicate: false,
            message: Message::new("t", "m", QualityOfService::ExactlyOnce, false),
        })).await.unwrap();

        assert_eq!(
            MqttPacket::Pubrec(PubrecPacket { packet_id: 7 }),
            peer.reader.receive().await.unwrap());

        // nothing published yet; the half-state is parked in the session
        assert!(fixture.events.try_recv().is_err());
        assert!(fixture.backend.session.lookup_packet(Direction::Incoming, 7).unwrap().is_some());

        peer.writer.send(&MqttPacket::Pubrel(PubrelPacket { packet_id: 7 })).await.unwrap();

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Published(_)));
        assert_eq!(
            MqttPacket::Pubcomp(PubcompPacket { packet_id: 7 }),
            peer.reader.receive().await.unwrap());

        assert!(fixture.backend.session.lookup_packet(Direction::Incoming, 7).unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_qos2_publish_is_idempotent() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(false).await;

        for duplicate in [false, true] {
            peer.writer.send(&MqttPacket::Publish(PublishPacket {
                packet_id: 7,
                duplicate,
                message: Message::new("t", "m", QualityOfService::ExactlyOnce, false),
            })).await.unwrap();

            assert_eq!(
                MqttPacket::Pubrec(PubrecPacket { packet_id: 7 }),
                peer.reader.receive().await.unwrap());
        }

        peer.writer.send(&MqttPacket::Pubrel(PubrelPacket { packet_id: 7 })).await.unwrap();

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Published(_)));
        assert_eq!(
            MqttPacket::Pubcomp(PubcompPacket { packet_id: 7 }),
            peer.reader.receive().await.unwrap());
    }

    #[tokio::test]
    async fn unknown_pubrel_is_ignored() {
        let (_fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Pubrel(PubrelPacket { packet_id: 42 })).await.unwrap();

        // the connection stays healthy and no pubcomp shows up
        peer.writer.send(&MqttPacket::Pingreq).await.unwrap();
        assert_eq!(MqttPacket::Pingresp, peer.reader.receive().await.unwrap());
    }

    #[tokio::test]
    async fn stored_packets_replay_with_dup_on_connect() {
        let fixture = scripted_backend(true, true);

        fixture.backend.session.save_packet(Direction::Outgoing, MqttPacket::Publish(PublishPacket {
            packet_id: 3,
            duplicate: false,
            message: Message::new("t", "m", QualityOfService::AtLeastOnce, false),
        })).unwrap();
        fixture.backend.session.save_packet(Direction::Outgoing, MqttPacket::Pubrel(PubrelPacket { packet_id: 4 })).unwrap();

        let (near, far) = tokio::io::duplex(4096);
        Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let connack = peer.connect("tester", false, 0, None).await;
        assert!(connack.session_present);

        match peer.reader.receive().await.unwrap() {
            MqttPacket::Publish(publish) => {
                assert_eq!(3, publish.packet_id);
                assert!(publish.duplicate);
            }
            other => { panic!("expected publish, got {}", other) }
        }

        assert_eq!(
            MqttPacket::Pubrel(PubrelPacket { packet_id: 4 }),
            peer.reader.receive().await.unwrap());
    }

    #[tokio::test]
    async fn dequeued_messages_are_sent_and_tracked() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(false).await;

        peer.writer.send(&MqttPacket::Subscribe(SubscribePacket {
            packet_id: 1,
            subscriptions: vec![Subscription::new("t", QualityOfService::AtLeastOnce)],
        })).await.unwrap();
        peer.reader.receive().await.unwrap();
        fixture.events.recv().await;

        let (ack, fired) = Ack::pair();
        fixture.queue.send((Message::new("t", "m", QualityOfService::ExactlyOnce, false), Some(ack))).unwrap();

        let packet_id = match peer.reader.receive().await.unwrap() {
            MqttPacket::Publish(publish) => {
                // delivery qos is capped at the subscription's grant
                assert_eq!(QualityOfService::AtLeastOnce, publish.message.qos);
                assert!(publish.packet_id > 0);
                publish.packet_id
            }
            other => { panic!("expected publish, got {}", other) }
        };

        // the message was saved before the ack fired
        fired.await.unwrap();
        assert!(fixture.backend.session.lookup_packet(Direction::Outgoing, packet_id).unwrap().is_some());

        peer.writer.send(&MqttPacket::Puback(PubackPacket { packet_id })).await.unwrap();

        peer.writer.send(&MqttPacket::Pingreq).await.unwrap();
        assert_eq!(MqttPacket::Pingresp, peer.reader.receive().await.unwrap());
        assert!(fixture.backend.session.lookup_packet(Direction::Outgoing, packet_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn qos0_dequeued_message_is_sent_without_id() {
        let (mut fixture, mut peer, _client, _connack) = connected_fixture(true).await;

        peer.writer.send(&MqttPacket::Subscribe(SubscribePacket {
            packet_id: 1,
            subscriptions: vec![Subscription::new("t", QualityOfService::ExactlyOnce)],
        })).await.unwrap();
        peer.reader.receive().await.unwrap();
        fixture.events.recv().await;

        fixture.queue.send((Message::new("t", "m", QualityOfService::AtMostOnce, false), None)).unwrap();

        match peer.reader.receive().await.unwrap() {
            MqttPacket::Publish(publish) => {
                assert_eq!(0, publish.packet_id);
                assert_eq!(QualityOfService::AtMostOnce, publish.message.qos);
            }
            other => { panic!("expected publish, got {}", other) }
        }
    }

    #[tokio::test]
    async fn disconnect_clears_will_and_terminates() {
        let mut fixture = scripted_backend(true, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let will = Message::new("will/topic", "gone", QualityOfService::AtLeastOnce, false);
        peer.connect("tester", false, 0, Some(will)).await;

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Subscribed(_, true)));
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Restored));

        peer.writer.send(&MqttPacket::Disconnect).await.unwrap();
        client.closed().wait().await;

        // terminate ran but the will was never published
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Terminated));
        assert!(fixture.events.try_recv().is_err());
        assert!(fixture.backend.session.lookup_will().unwrap().is_none());
    }

    #[tokio::test]
    async fn abnormal_close_publishes_will() {
        let mut fixture = scripted_backend(true, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let will = Message::new("will/topic", "gone", QualityOfService::AtLeastOnce, false);
        peer.connect("tester", false, 0, Some(will)).await;

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Subscribed(_, true)));
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Restored));

        drop(peer);
        client.closed().wait().await;

        match fixture.events.recv().await {
            Some(BackendEvent::Published(message)) => {
                assert_eq!("will/topic", message.topic);
            }
            _ => { panic!("expected will publish") }
        }

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_expiry_kills_the_connection() {
        let mut fixture = scripted_backend(true, false);
        let (near, far) = tokio::io::duplex(4096);
        let client = Client::accept(fixture.backend.clone(), near, None);

        let mut peer = Peer::new(far);
        let will = Message::new("will/topic", "gone", QualityOfService::AtMostOnce, false);
        peer.connect("tester", true, 1, Some(will)).await;

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Subscribed(_, true)));
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Restored));

        // the peer goes silent; the read deadline is keep_alive * 1.5
        client.closed().wait().await;

        match fixture.events.recv().await {
            Some(BackendEvent::Published(message)) => {
                assert_eq!("will/topic", message.topic);
            }
            _ => { panic!("expected will publish") }
        }

        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Terminated));
    }

    #[tokio::test]
    async fn backend_close_tears_down_the_connection() {
        let (mut fixture, mut peer, client, _connack) = connected_fixture(false).await;

        client.close();
        client.closed().wait().await;

        assert_matches!(peer.reader.receive().await, Err(MqttError::ConnectionClosed));
        assert_matches!(fixture.events.recv().await, Some(BackendEvent::Terminated));
    }
}
