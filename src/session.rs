/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the session store abstraction used by both connection engines, plus the
default in-memory implementation.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::{Message, MqttPacket, QualityOfService, Subscription};
use crate::topic::matches_filter;

use std::collections::HashMap;
use std::sync::Mutex;

/// Which of a session's two packet maps an operation addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {

    /// Packets received from the peer: QoS 2 publishes awaiting their Pubrel.
    Incoming,

    /// Packets sent to the peer: QoS 1/2 publishes and Pubrels awaiting their final ack.
    Outgoing,
}

/// Persistent per-connection protocol state: the in-flight packet maps, subscriptions and
/// the will message.  A session outlives any single connection; handing the same session to
/// consecutive connections is what makes QoS 1/2 delivery survive reconnects.
///
/// Implementations must serialize operations on a given packet id.
pub trait Session: Send + Sync {

    /// Returns the next free packet id for outgoing packets.  Ids cycle through `1..=65535`
    /// and skip values currently stored in the outgoing packet map.  Errors when every id
    /// is in flight.
    fn next_id(&self) -> MqttResult<u16>;

    /// Stores a packet under its id, quietly overwriting any existing entry with the same id.
    fn save_packet(&self, direction: Direction, packet: MqttPacket) -> MqttResult<()>;

    /// Retrieves a stored packet by id.
    fn lookup_packet(&self, direction: Direction, packet_id: u16) -> MqttResult<Option<MqttPacket>>;

    /// Removes a stored packet.  Removing an id with no entry is not an error.
    fn delete_packet(&self, direction: Direction, packet_id: u16) -> MqttResult<()>;

    /// Returns all stored packets in insertion order.
    fn all_packets(&self, direction: Direction) -> MqttResult<Vec<MqttPacket>>;

    /// Stores a subscription, quietly overwriting any existing entry with the same filter.
    fn save_subscription(&self, subscription: Subscription) -> MqttResult<()>;

    /// Matches a topic name against the stored subscriptions and returns the best match:
    /// the matching subscription with the highest granted quality of service.
    fn lookup_subscription(&self, topic: &str) -> MqttResult<Option<Subscription>>;

    /// Removes a stored subscription.  Removing an unknown filter is not an error.
    fn delete_subscription(&self, topic_filter: &str) -> MqttResult<()>;

    /// Returns all stored subscriptions in insertion order.
    fn all_subscriptions(&self) -> MqttResult<Vec<Subscription>>;

    /// Stores the will message, replacing any previous one.
    fn save_will(&self, will: Message) -> MqttResult<()>;

    /// Retrieves the stored will message.
    fn lookup_will(&self) -> MqttResult<Option<Message>>;

    /// Removes the stored will message.
    fn clear_will(&self) -> MqttResult<()>;

    /// Drops all session state: packets, subscriptions, will and the id counter.
    fn reset(&self) -> MqttResult<()>;
}

// insertion-ordered id -> packet map
#[derive(Default)]
struct PacketStore {
    order: Vec<u16>,
    packets: HashMap<u16, MqttPacket>,
}

impl PacketStore {
    fn save(&mut self, packet_id: u16, packet: MqttPacket) {
        if self.packets.insert(packet_id, packet).is_none() {
            self.order.push(packet_id);
        }
    }

    fn lookup(&self, packet_id: u16) -> Option<MqttPacket> {
        self.packets.get(&packet_id).cloned()
    }

    fn delete(&mut self, packet_id: u16) {
        if self.packets.remove(&packet_id).is_some() {
            self.order.retain(|id| *id != packet_id);
        }
    }

    fn all(&self) -> Vec<MqttPacket> {
        self.order.iter().map(|id| self.packets[id].clone()).collect()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.packets.clear();
    }
}

#[derive(Default)]
struct SessionState {
    incoming: PacketStore,
    outgoing: PacketStore,
    subscription_order: Vec<String>,
    subscriptions: HashMap<String, QualityOfService>,
    will: Option<Message>,
    next_packet_id: u16,
}

impl SessionState {
    fn store(&mut self, direction: Direction) -> &mut PacketStore {
        match direction {
            Direction::Incoming => { &mut self.incoming }
            Direction::Outgoing => { &mut self.outgoing }
        }
    }
}

/// The default, non-persistent session implementation.  All state lives behind a single
/// mutex, which makes every per-id operation linearizable.
#[derive(Default)]
pub struct MemorySession {
    state: Mutex<SessionState>,
}

impl MemorySession {

    /// Creates a new, empty session.
    pub fn new() -> Self {
        MemorySession::default()
    }
}

impl Session for MemorySession {

    fn next_id(&self) -> MqttResult<u16> {
        let mut state = self.state.lock().unwrap();

        for _ in 0..u16::MAX {
            state.next_packet_id = state.next_packet_id % u16::MAX + 1;
            let candidate = state.next_packet_id;
            if !state.outgoing.packets.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        Err(MqttError::new_session_error("packet id space exhausted"))
    }

    fn save_packet(&self, direction: Direction, packet: MqttPacket) -> MqttResult<()> {
        let packet_id = match &packet {
            MqttPacket::Publish(publish) => { publish.packet_id }
            MqttPacket::Pubrel(pubrel) => { pubrel.packet_id }
            _ => {
                return Err(MqttError::new_session_error("only publish and pubrel packets are stored in a session"));
            }
        };

        if packet_id == 0 {
            return Err(MqttError::new_session_error("session packets require a non-zero packet id"));
        }

        self.state.lock().unwrap().store(direction).save(packet_id, packet);
        Ok(())
    }

    fn lookup_packet(&self, direction: Direction, packet_id: u16) -> MqttResult<Option<MqttPacket>> {
        Ok(self.state.lock().unwrap().store(direction).lookup(packet_id))
    }

    fn delete_packet(&self, direction: Direction, packet_id: u16) -> MqttResult<()> {
        self.state.lock().unwrap().store(direction).delete(packet_id);
        Ok(())
    }

    fn all_packets(&self, direction: Direction) -> MqttResult<Vec<MqttPacket>> {
        Ok(self.state.lock().unwrap().store(direction).all())
    }

    fn save_subscription(&self, subscription: Subscription) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.subscriptions.insert(subscription.topic_filter.clone(), subscription.qos).is_none() {
            state.subscription_order.push(subscription.topic_filter);
        }

        Ok(())
    }

    fn lookup_subscription(&self, topic: &str) -> MqttResult<Option<Subscription>> {
        let state = self.state.lock().unwrap();

        let mut best: Option<Subscription> = None;
        for filter in &state.subscription_order {
            if !matches_filter(topic, filter) {
                continue;
            }

            let qos = state.subscriptions[filter];
            if best.as_ref().map_or(true, |current| qos > current.qos) {
                best = Some(Subscription::new(filter.clone(), qos));
            }
        }

        Ok(best)
    }

    fn delete_subscription(&self, topic_filter: &str) -> MqttResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.subscriptions.remove(topic_filter).is_some() {
            state.subscription_order.retain(|filter| filter != topic_filter);
        }

        Ok(())
    }

    fn all_subscriptions(&self) -> MqttResult<Vec<Subscription>> {
        let state = self.state.lock().unwrap();
        Ok(state.subscription_order.iter()
            .map(|filter| Subscription::new(filter.clone(), state.subscriptions[filter]))
            .collect())
    }

    fn save_will(&self, will: Message) -> MqttResult<()> {
        self.state.lock().unwrap().will = Some(will);
        Ok(())
    }

    fn lookup_will(&self) -> MqttResult<Option<Message>> {
        Ok(self.state.lock().unwrap().will.clone())
    }

    fn clear_will(&self) -> MqttResult<()> {
        self.state.lock().unwrap().will = None;
        Ok(())
    }

    fn reset(&self) -> MqttResult<()> {
        *self.state.lock().unwrap() = SessionState::default();
        Ok(())
    }
}
