/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model the MQTT 3.1.1 specification.
 */

use crate::error::{MqttError, MqttResult};

use std::fmt;

/// MQTT message delivery quality of service.
///
/// Enum values match the MQTT 3.1.1 encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No
    /// response is sent by the receiver and no retry is performed by the sender. The message
    /// arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = MqttError;

    fn try_from(value: u8) -> MqttResult<Self> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            2 => { Ok(QualityOfService::ExactlyOnce) }
            _ => { Err(MqttError::new_decoding_failure("quality of service value out of range")) }
        }
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityOfService::AtMostOnce => { write!(f, "AtMostOnce") }
            QualityOfService::AtLeastOnce => { write!(f, "AtLeastOnce") }
            QualityOfService::ExactlyOnce => { write!(f, "ExactlyOnce") }
        }
    }
}

/// Server return code for connection attempts.
///
/// Enum values match the MQTT 3.1.1 Connack return code values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReturnCode {

    /// Returned when the connection is accepted.
    #[default]
    Accepted = 0,

    /// Returned when the server does not support the protocol level requested by the client.
    UnacceptableProtocolVersion = 1,

    /// Returned when the client identifier is well-formed but not allowed by the server.
    IdentifierRejected = 2,

    /// Returned when the network connection succeeded but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// Returned when the data in the user name or password is malformed.
    BadUsernameOrPassword = 4,

    /// Returned when the client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    /// Returns whether or not the return code represents an accepted connection
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectReturnCode::Accepted)
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> MqttResult<Self> {
        match value {
            0 => { Ok(ConnectReturnCode::Accepted) }
            1 => { Ok(ConnectReturnCode::UnacceptableProtocolVersion) }
            2 => { Ok(ConnectReturnCode::IdentifierRejected) }
            3 => { Ok(ConnectReturnCode::ServerUnavailable) }
            4 => { Ok(ConnectReturnCode::BadUsernameOrPassword) }
            5 => { Ok(ConnectReturnCode::NotAuthorized) }
            _ => { Err(MqttError::new_decoding_failure("connect return code value out of range")) }
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => { write!(f, "connection accepted") }
            ConnectReturnCode::UnacceptableProtocolVersion => { write!(f, "unacceptable protocol version") }
            ConnectReturnCode::IdentifierRejected => { write!(f, "identifier rejected") }
            ConnectReturnCode::ServerUnavailable => { write!(f, "server unavailable") }
            ConnectReturnCode::BadUsernameOrPassword => { write!(f, "bad user name or password") }
            ConnectReturnCode::NotAuthorized => { write!(f, "not authorized") }
        }
    }
}

/// Suback return code indicating a rejected subscription entry.
pub const SUBACK_FAILURE: u8 = 0x80;

/// An application-level message routed between clients.  This is the value the broker fans
/// out and the session stores; delivery metadata that only matters on the wire (packet id,
/// dup flag) lives on [`PublishPacket`] instead.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {

    /// Topic the message was published to.  Never contains wildcards.
    pub topic: String,

    /// Application payload.  May be empty.
    pub payload: Vec<u8>,

    /// Delivery quality of service requested by the publisher.
    pub qos: QualityOfService,

    /// Whether the message should be stored as the topic's retained message.
    pub retain: bool,
}

impl Message {

    /// Creates a new message from its parts.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QualityOfService, retain: bool) -> Self {
        Message {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// A single subscription entry: a topic filter and the maximum quality of service the
/// subscriber wants to receive matching messages at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Subscription {

    /// Topic filter to subscribe to.  May contain the `+` and `#` wildcards.
    pub topic_filter: String,

    /// Maximum quality of service for message delivery on this subscription.
    pub qos: QualityOfService,
}

impl Subscription {

    /// Creates a new subscription from its parts.
    pub fn new(topic_filter: impl Into<String>, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.into(),
            qos,
        }
    }
}

/// Data model of an MQTT 3.1.1 Connect packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {

    /// Client identifier.  May be empty, in which case the broker creates a temporary,
    /// non-persisted session (requires `clean_session` to be set).
    pub client_id: String,

    /// Whether the broker should discard any previous session state for this client id.
    pub clean_session: bool,

    /// Maximum interval, in seconds, between client packets.  Zero disables keep alive
    /// tracking on both sides.
    pub keep_alive: u16,

    /// Message the broker should publish on behalf of the client if the connection ends
    /// without a Disconnect packet.
    pub will: Option<Message>,

    /// Username to authenticate with.
    pub username: Option<String>,

    /// Password to authenticate with.
    pub password: Option<Vec<u8>>,
}

/// Data model of an MQTT 3.1.1 Connack packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {

    /// Whether the broker held prior session state for the connecting client id.
    pub session_present: bool,

    /// Result of the connection attempt.
    pub return_code: ConnectReturnCode,
}

/// Data model of an MQTT 3.1.1 Publish packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet identifier, required for quality of service levels above zero.  Zero means
    /// "no identifier".
    pub packet_id: u16,

    /// Whether this packet is a retransmission of an earlier delivery attempt.
    pub duplicate: bool,

    /// The message being delivered.
    pub message: Message,
}

impl PublishPacket {

    /// Creates a publish packet carrying the given message, with no packet id assigned.
    pub fn new(message: Message) -> Self {
        PublishPacket {
            packet_id: 0,
            duplicate: false,
            message,
        }
    }
}

/// Data model of an MQTT 3.1.1 Puback packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {

    /// Packet identifier of the QoS 1 publish being acknowledged.
    pub packet_id: u16,
}

/// Data model of an MQTT 3.1.1 Pubrec packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {

    /// Packet identifier of the QoS 2 publish whose receipt is being recorded.
    pub packet_id: u16,
}

/// Data model of an MQTT 3.1.1 Pubrel packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {

    /// Packet identifier of the QoS 2 delivery being released.
    pub packet_id: u16,
}

/// Data model of an MQTT 3.1.1 Pubcomp packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {

    /// Packet identifier of the QoS 2 delivery being completed.
    pub packet_id: u16,
}

/// Data model of an MQTT 3.1.1 Subscribe packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {

    /// Packet identifier used to correlate the Suback.
    pub packet_id: u16,

    /// List of subscription entries.  Must not be empty.
    pub subscriptions: Vec<Subscription>,
}

/// Data model of an MQTT 3.1.1 Suback packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {

    /// Packet identifier of the Subscribe being acknowledged.
    pub packet_id: u16,

    /// Per-entry granted quality of service values (0, 1, 2) or [`SUBACK_FAILURE`].
    pub return_codes: Vec<u8>,
}

/// Data model of an MQTT 3.1.1 Unsubscribe packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {

    /// Packet identifier used to correlate the Unsuback.
    pub packet_id: u16,

    /// List of topic filters to unsubscribe from.  Must not be empty.
    pub topic_filters: Vec<String>,
}

/// Data model of an MQTT 3.1.1 Unsuback packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {

    /// Packet identifier of the Unsubscribe being acknowledged.
    pub packet_id: u16,
}

/// Algebraic union of all MQTT 3.1.1 packet types.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {

    /// Connection request; the first packet sent by a client.
    Connect(ConnectPacket),

    /// Connection acknowledgement sent by the broker.
    Connack(ConnackPacket),

    /// Message delivery in either direction.
    Publish(PublishPacket),

    /// QoS 1 delivery acknowledgement.
    Puback(PubackPacket),

    /// First acknowledgement of a QoS 2 delivery.
    Pubrec(PubrecPacket),

    /// Release of a QoS 2 delivery; answer to Pubrec.
    Pubrel(PubrelPacket),

    /// Final acknowledgement of a QoS 2 delivery; answer to Pubrel.
    Pubcomp(PubcompPacket),

    /// Subscription request.
    Subscribe(SubscribePacket),

    /// Subscription acknowledgement.
    Suback(SubackPacket),

    /// Unsubscription request.
    Unsubscribe(UnsubscribePacket),

    /// Unsubscription acknowledgement.
    Unsuback(UnsubackPacket),

    /// Keep alive probe sent by the client.
    Pingreq,

    /// Keep alive answer sent by the broker.
    Pingresp,

    /// Clean shutdown notification sent by the client.
    Disconnect,
}

/// An enum indicating the kind of MQTT packet, without any of the packet's data.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PacketType {
    /// A Connect packet
    Connect,
    /// A Connack packet
    Connack,
    /// A Publish packet
    Publish,
    /// A Puback packet
    Puback,
    /// A Pubrec packet
    Pubrec,
    /// A Pubrel packet
    Pubrel,
    /// A Pubcomp packet
    Pubcomp,
    /// A Subscribe packet
    Subscribe,
    /// A Suback packet
    Suback,
    /// An Unsubscribe packet
    Unsubscribe,
    /// An Unsuback packet
    Unsuback,
    /// A Pingreq packet
    Pingreq,
    /// A Pingresp packet
    Pingresp,
    /// A Disconnect packet
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}

impl MqttPacket {

    /// Returns the kind of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            MqttPacket::Connect(_) => { PacketType::Connect }
            MqttPacket::Connack(_) => { PacketType::Connack }
            MqttPacket::Publish(_) => { PacketType::Publish }
            MqttPacket::Puback(_) => { PacketType::Puback }
            MqttPacket::Pubrec(_) => { PacketType::Pubrec }
            MqttPacket::Pubrel(_) => { PacketType::Pubrel }
            MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
            MqttPacket::Subscribe(_) => { PacketType::Subscribe }
            MqttPacket::Suback(_) => { PacketType::Suback }
            MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
            MqttPacket::Unsuback(_) => { PacketType::Unsuback }
            MqttPacket::Pingreq => { PacketType::Pingreq }
            MqttPacket::Pingresp => { PacketType::Pingresp }
            MqttPacket::Disconnect => { PacketType::Disconnect }
        }
    }
}

impl fmt::Display for MqttPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttPacket::Publish(publish) => {
                write!(f, "PublishPacket(id: {}, topic: {}, qos: {}, retain: {}, dup: {})",
                       publish.packet_id, publish.message.topic, publish.message.qos,
                       publish.message.retain, publish.duplicate)
            }
            MqttPacket::Puback(puback) => { write!(f, "PubackPacket(id: {})", puback.packet_id) }
            MqttPacket::Pubrec(pubrec) => { write!(f, "PubrecPacket(id: {})", pubrec.packet_id) }
            MqttPacket::Pubrel(pubrel) => { write!(f, "PubrelPacket(id: {})", pubrel.packet_id) }
            MqttPacket::Pubcomp(pubcomp) => { write!(f, "PubcompPacket(id: {})", pubcomp.packet_id) }
            MqttPacket::Subscribe(subscribe) => {
                write!(f, "SubscribePacket(id: {}, entries: {})", subscribe.packet_id, subscribe.subscriptions.len())
            }
            MqttPacket::Unsubscribe(unsubscribe) => {
                write!(f, "UnsubscribePacket(id: {}, entries: {})", unsubscribe.packet_id, unsubscribe.topic_filters.len())
            }
            _ => { write!(f, "{}", self.packet_type()) }
        }
    }
}

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;
