/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the incremental MQTT 3.1.1 packet decoder.
 */

use crate::encode::{PROTOCOL_LEVEL, PROTOCOL_NAME};
use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

use log::*;

use std::collections::VecDeque;

const DEFAULT_BUFFERED_PACKET_LIMIT: usize = 10;

fn read_u8(bytes: &mut &[u8]) -> MqttResult<u8> {
    if bytes.is_empty() {
        return Err(MqttError::new_decoding_failure("packet body ends before a one byte field"));
    }

    let value = bytes[0];
    *bytes = &bytes[1..];
    Ok(value)
}

fn read_u16(bytes: &mut &[u8]) -> MqttResult<u16> {
    if bytes.len() < 2 {
        return Err(MqttError::new_decoding_failure("packet body ends before a two byte field"));
    }

    let value = u16::from_be_bytes([bytes[0], bytes[1]]);
    *bytes = &bytes[2..];
    Ok(value)
}

fn read_binary<'a>(bytes: &mut &'a [u8]) -> MqttResult<&'a [u8]> {
    let length = read_u16(bytes)? as usize;
    if bytes.len() < length {
        return Err(MqttError::new_decoding_failure("packet body ends before a length-prefixed field"));
    }

    let value = &bytes[..length];
    *bytes = &bytes[length..];
    Ok(value)
}

fn read_string(bytes: &mut &[u8]) -> MqttResult<String> {
    let value = read_binary(bytes)?;
    Ok(std::str::from_utf8(value)?.to_string())
}

fn read_packet_id(bytes: &mut &[u8]) -> MqttResult<u16> {
    let packet_id = read_u16(bytes)?;
    if packet_id == 0 {
        return Err(MqttError::new_decoding_failure("packet id must be non-zero"));
    }

    Ok(packet_id)
}

fn expect_empty(bytes: &[u8]) -> MqttResult<()> {
    if !bytes.is_empty() {
        return Err(MqttError::new_decoding_failure("packet body longer than its remaining length accounts for"));
    }

    Ok(())
}

fn expect_flags(first_byte: u8, flags: u8) -> MqttResult<()> {
    if first_byte & 0x0f != flags {
        return Err(MqttError::new_decoding_failure("fixed header flags violate the reserved bit requirements"));
    }

    Ok(())
}

fn decode_connect(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0)?;

    let protocol_name = read_string(&mut body)?;
    if protocol_name != PROTOCOL_NAME {
        return Err(MqttError::new_decoding_failure("connect protocol name is not MQTT"));
    }

    let protocol_level = read_u8(&mut body)?;
    if protocol_level != PROTOCOL_LEVEL {
        return Err(MqttError::new_decoding_failure("connect protocol level is not 4"));
    }

    let flags = read_u8(&mut body)?;
    if flags & 0x01 != 0 {
        return Err(MqttError::new_decoding_failure("connect flags reserved bit is set"));
    }

    let clean_session = flags & 0x02 != 0;
    let has_will = flags & 0x04 != 0;
    let will_qos = QualityOfService::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & 0x20 != 0;
    let has_password = flags & 0x40 != 0;
    let has_username = flags & 0x80 != 0;

    if !has_will && (will_qos != QualityOfService::AtMostOnce || will_retain) {
        return Err(MqttError::new_decoding_failure("connect will qos/retain set without the will flag"));
    }
    if has_password && !has_username {
        return Err(MqttError::new_decoding_failure("connect password flag set without the username flag"));
    }

    let keep_alive = read_u16(&mut body)?;
    let client_id = read_string(&mut body)?;

    let will =
        if has_will {
            let topic = read_string(&mut body)?;
            let payload = read_binary(&mut body)?.to_vec();
            Some(Message::new(topic, payload, will_qos, will_retain))
        } else {
            None
        };

    let username = if has_username { Some(read_string(&mut body)?) } else { None };
    let password = if has_password { Some(read_binary(&mut body)?.to_vec()) } else { None };

    expect_empty(body)?;

    Ok(MqttPacket::Connect(ConnectPacket {
        client_id,
        clean_session,
        keep_alive,
        will,
        username,
        password,
    }))
}

fn decode_connack(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0)?;

    let ack_flags = read_u8(&mut body)?;
    if ack_flags & 0xfe != 0 {
        return Err(MqttError::new_decoding_failure("connack acknowledge flags reserved bits are set"));
    }

    let return_code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
    expect_empty(body)?;

    Ok(MqttPacket::Connack(ConnackPacket {
        session_present: ack_flags & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    let retain = first_byte & 0x01 != 0;
    let qos = QualityOfService::try_from((first_byte >> 1) & 0x03)?;
    let duplicate = first_byte & 0x08 != 0;

    if duplicate && qos == QualityOfService::AtMostOnce {
        return Err(MqttError::new_decoding_failure("publish dup flag set on a qos 0 packet"));
    }

    let topic = read_string(&mut body)?;
    let packet_id =
        if qos != QualityOfService::AtMostOnce {
            read_packet_id(&mut body)?
        } else {
            0
        };

    Ok(MqttPacket::Publish(PublishPacket {
        packet_id,
        duplicate,
        message: Message::new(topic, body.to_vec(), qos, retain),
    }))
}

fn decode_id_only_body(mut body: &[u8]) -> MqttResult<u16> {
    let packet_id = read_packet_id(&mut body)?;
    expect_empty(body)?;
    Ok(packet_id)
}

fn decode_subscribe(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0x02)?;

    let packet_id = read_packet_id(&mut body)?;

    let mut subscriptions = Vec::new();
    while !body.is_empty() {
        let topic_filter = read_string(&mut body)?;
        let qos_byte = read_u8(&mut body)?;
        if qos_byte & 0xfc != 0 {
            return Err(MqttError::new_decoding_failure("subscribe requested qos reserved bits are set"));
        }

        subscriptions.push(Subscription::new(topic_filter, QualityOfService::try_from(qos_byte)?));
    }

    if subscriptions.is_empty() {
        return Err(MqttError::new_decoding_failure("subscribe packet contains no subscriptions"));
    }

    Ok(MqttPacket::Subscribe(SubscribePacket { packet_id, subscriptions }))
}

fn decode_suback(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0)?;

    let packet_id = read_packet_id(&mut body)?;
    if body.is_empty() {
        return Err(MqttError::new_decoding_failure("suback packet contains no return codes"));
    }

    for code in body {
        if *code > 2 && *code != SUBACK_FAILURE {
            return Err(MqttError::new_decoding_failure("suback return code value out of range"));
        }
    }

    Ok(MqttPacket::Suback(SubackPacket { packet_id, return_codes: body.to_vec() }))
}

fn decode_unsubscribe(first_byte: u8, mut body: &[u8]) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0x02)?;

    let packet_id = read_packet_id(&mut body)?;

    let mut topic_filters = Vec::new();
    while !body.is_empty() {
        topic_filters.push(read_string(&mut body)?);
    }

    if topic_filters.is_empty() {
        return Err(MqttError::new_decoding_failure("unsubscribe packet contains no topic filters"));
    }

    Ok(MqttPacket::Unsubscribe(UnsubscribePacket { packet_id, topic_filters }))
}

fn decode_empty(first_byte: u8, body: &[u8], packet: MqttPacket) -> MqttResult<MqttPacket> {
    expect_flags(first_byte, 0)?;
    expect_empty(body)?;
    Ok(packet)
}

fn decode_packet(first_byte: u8, body: &[u8]) -> MqttResult<MqttPacket> {
    let packet_type = first_byte >> 4;

    match packet_type {
        PACKET_TYPE_CONNECT => { decode_connect(first_byte, body) }
        PACKET_TYPE_CONNACK => { decode_connack(first_byte, body) }
        PACKET_TYPE_PUBLISH => { decode_publish(first_byte, body) }
        PACKET_TYPE_PUBACK => {
            expect_flags(first_byte, 0)?;
            Ok(MqttPacket::Puback(PubackPacket { packet_id: decode_id_only_body(body)? }))
        }
        PACKET_TYPE_PUBREC => {
            expect_flags(first_byte, 0)?;
            Ok(MqttPacket::Pubrec(PubrecPacket { packet_id: decode_id_only_body(body)? }))
        }
        PACKET_TYPE_PUBREL => {
            expect_flags(first_byte, 0x02)?;
            Ok(MqttPacket::Pubrel(PubrelPacket { packet_id: decode_id_only_body(body)? }))
        }
        PACKET_TYPE_PUBCOMP => {
            expect_flags(first_byte, 0)?;
            Ok(MqttPacket::Pubcomp(PubcompPacket { packet_id: decode_id_only_body(body)? }))
        }
        PACKET_TYPE_SUBSCRIBE => { decode_subscribe(first_byte, body) }
        PACKET_TYPE_SUBACK => { decode_suback(first_byte, body) }
        PACKET_TYPE_UNSUBSCRIBE => { decode_unsubscribe(first_byte, body) }
        PACKET_TYPE_UNSUBACK => {
            expect_flags(first_byte, 0)?;
            Ok(MqttPacket::Unsuback(UnsubackPacket { packet_id: decode_id_only_body(body)? }))
        }
        PACKET_TYPE_PINGREQ => { decode_empty(first_byte, body, MqttPacket::Pingreq) }
        PACKET_TYPE_PINGRESP => { decode_empty(first_byte, body, MqttPacket::Pingresp) }
        PACKET_TYPE_DISCONNECT => { decode_empty(first_byte, body, MqttPacket::Disconnect) }
        _ => {
            Err(MqttError::new_decoding_failure("invalid packet type value"))
        }
    }
}

// Attempts to parse one complete packet from the front of the buffer.  Returns the packet
// and the number of bytes it occupied, or None if the buffer does not yet hold a full packet.
fn parse_front(buffer: &[u8]) -> MqttResult<Option<(MqttPacket, usize)>> {
    if buffer.is_empty() {
        return Ok(None);
    }

    let first_byte = buffer[0];

    let mut remaining_length: usize = 0;
    let mut header_length: usize = 1;
    loop {
        if header_length > 4 {
            return Err(MqttError::new_decoding_failure("remaining length variable length integer exceeds four bytes"));
        }
        if header_length >= buffer.len() {
            return Ok(None);
        }

        let byte = buffer[header_length];
        remaining_length |= ((byte & 0x7f) as usize) << (7 * (header_length - 1));
        header_length += 1;

        if byte & 0x80 == 0 {
            break;
        }
    }

    let total_length = header_length + remaining_length;
    if buffer.len() < total_length {
        return Ok(None);
    }

    let packet = decode_packet(first_byte, &buffer[header_length..total_length])?;
    Ok(Some((packet, total_length)))
}

/// Incremental decoder that turns a byte stream into a bounded queue of MQTT packets.
///
/// Decoding stops once the queue holds the configured number of packets; remaining bytes
/// stay buffered until packets are popped, which is what bounds a connection's inbound
/// packet prefetch.
pub(crate) struct Decoder {
    buffer: Vec<u8>,
    packets: VecDeque<MqttPacket>,
    buffered_packet_limit: usize,
    failed: bool,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            buffer: Vec::with_capacity(4096),
            packets: VecDeque::new(),
            buffered_packet_limit: DEFAULT_BUFFERED_PACKET_LIMIT,
            failed: false,
        }
    }

    pub fn set_buffered_packet_limit(&mut self, limit: usize) {
        self.buffered_packet_limit = limit.max(1);
    }

    /// Feeds raw bytes into the decoder.  Any error is terminal; the decoder refuses
    /// further input afterwards.
    pub fn decode(&mut self, bytes: &[u8]) -> MqttResult<()> {
        if self.failed {
            return Err(MqttError::new_decoding_failure("decoder previously encountered a terminal error"));
        }

        self.buffer.extend_from_slice(bytes);
        self.drain_buffer()
    }

    /// Pops the next fully decoded packet, resuming buffered decoding if the queue had
    /// reached its limit.
    pub fn pop_packet(&mut self) -> MqttResult<Option<MqttPacket>> {
        let packet = self.packets.pop_front();
        if packet.is_some() && !self.failed {
            self.drain_buffer()?;
        }

        Ok(packet)
    }

    fn drain_buffer(&mut self) -> MqttResult<()> {
        let mut consumed = 0;
        while self.packets.len() < self.buffered_packet_limit {
            match parse_front(&self.buffer[consumed..]) {
                Ok(Some((packet, length))) => {
                    debug!("Decoder - decoded {}", packet);
                    self.packets.push_back(packet);
                    consumed += length;
                }
                Ok(None) => {
                    break;
                }
                Err(error) => {
                    error!("Decoder - terminal decode failure: {}", error);
                    self.failed = true;
                    self.buffer.clear();
                    return Err(error);
                }
            }
        }

        self.buffer.drain(..consumed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode_packet;
    use assert_matches::assert_matches;

    fn round_trip(packet: MqttPacket) {
        let mut encoded = Vec::new();
        encode_packet(&packet, &mut encoded).unwrap();

        let mut decoder = Decoder::new();
        decoder.decode(&encoded).unwrap();

        let decoded = decoder.pop_packet().unwrap().unwrap();
        assert_eq!(packet, decoded);
        assert!(decoder.pop_packet().unwrap().is_none());

        // encoding the decoded packet must reproduce the original bytes
        let mut reencoded = Vec::new();
        encode_packet(&decoded, &mut reencoded).unwrap();
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn round_trip_connect_full() {
        round_trip(MqttPacket::Connect(ConnectPacket {
            client_id: "the-client".to_string(),
            clean_session: true,
            keep_alive: 30,
            will: Some(Message::new("will/topic", "gone", QualityOfService::AtLeastOnce, true)),
            username: Some("user".to_string()),
            password: Some(b"pass".to_vec()),
        }));
    }

    #[test]
    fn round_trip_connect_minimal() {
        round_trip(MqttPacket::Connect(ConnectPacket {
            client_id: "".to_string(),
            clean_session: true,
            ..Default::default()
        }));
    }

    #[test]
    fn round_trip_connack() {
        round_trip(MqttPacket::Connack(ConnackPacket {
            session_present: true,
            return_code: ConnectReturnCode::Accepted,
        }));
        round_trip(MqttPacket::Connack(ConnackPacket {
            session_present: false,
            return_code: ConnectReturnCode::NotAuthorized,
        }));
    }

    #[test]
    fn round_trip_publish_all_qos() {
        round_trip(MqttPacket::Publish(PublishPacket::new(
            Message::new("a/b", "payload", QualityOfService::AtMostOnce, false))));

        round_trip(MqttPacket::Publish(PublishPacket {
            packet_id: 17,
            duplicate: false,
            message: Message::new("a/b", "payload", QualityOfService::AtLeastOnce, true),
        }));

        round_trip(MqttPacket::Publish(PublishPacket {
            packet_id: 65535,
            duplicate: true,
            message: Message::new("a/b", Vec::<u8>::new(), QualityOfService::ExactlyOnce, false),
        }));
    }

    #[test]
    fn round_trip_acks() {
        round_trip(MqttPacket::Puback(PubackPacket { packet_id: 1 }));
        round_trip(MqttPacket::Pubrec(PubrecPacket { packet_id: 2 }));
        round_trip(MqttPacket::Pubrel(PubrelPacket { packet_id: 3 }));
        round_trip(MqttPacket::Pubcomp(PubcompPacket { packet_id: 4 }));
        round_trip(MqttPacket::Unsuback(UnsubackPacket { packet_id: 5 }));
    }

    #[test]
    fn round_trip_subscription_packets() {
        round_trip(MqttPacket::Subscribe(SubscribePacket {
            packet_id: 6,
            subscriptions: vec![
                Subscription::new("a/+", QualityOfService::AtLeastOnce),
                Subscription::new("#", QualityOfService::ExactlyOnce),
            ],
        }));

        round_trip(MqttPacket::Suback(SubackPacket {
            packet_id: 6,
            return_codes: vec![1, SUBACK_FAILURE],
        }));

        round_trip(MqttPacket::Unsubscribe(UnsubscribePacket {
            packet_id: 7,
            topic_filters: vec!["a/+".to_string(), "#".to_string()],
        }));
    }

    #[test]
    fn round_trip_empty_body_packets() {
        round_trip(MqttPacket::Pingreq);
        round_trip(MqttPacket::Pingresp);
        round_trip(MqttPacket::Disconnect);
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let packet = MqttPacket::Publish(PublishPacket {
            packet_id: 100,
            duplicate: false,
            message: Message::new("fragmented/topic", vec![0u8; 300], QualityOfService::AtLeastOnce, false),
        });

        let mut encoded = Vec::new();
        encode_packet(&packet, &mut encoded).unwrap();

        let mut decoder = Decoder::new();
        for (index, byte) in encoded.iter().enumerate() {
            decoder.decode(std::slice::from_ref(byte)).unwrap();
            if index + 1 < encoded.len() {
                assert!(decoder.pop_packet().unwrap().is_none());
            }
        }

        assert_eq!(packet, decoder.pop_packet().unwrap().unwrap());
    }

    #[test]
    fn buffered_packet_limit_pauses_decoding() {
        let mut encoded = Vec::new();
        for _ in 0..5 {
            encode_packet(&MqttPacket::Pingreq, &mut encoded).unwrap();
        }

        let mut decoder = Decoder::new();
        decoder.set_buffered_packet_limit(2);
        decoder.decode(&encoded).unwrap();

        let mut popped = 0;
        while decoder.pop_packet().unwrap().is_some() {
            popped += 1;
        }

        assert_eq!(5, popped);
    }

    #[test]
    fn invalid_vli_is_terminal() {
        let mut decoder = Decoder::new();
        let result = decoder.decode(&[0x30, 0x80, 0x80, 0x80, 0x80, 0x01]);
        assert_matches!(result, Err(MqttError::DecodingFailure(_)));

        assert_matches!(decoder.decode(&[0xc0, 0x00]), Err(MqttError::DecodingFailure(_)));
    }

    #[test]
    fn invalid_fixed_header_flags() {
        let mut decoder = Decoder::new();
        // puback with non-zero flags
        assert_matches!(decoder.decode(&[0x41, 0x02, 0x00, 0x01]), Err(MqttError::DecodingFailure(_)));

        let mut decoder = Decoder::new();
        // pubrel without the reserved 0b0010 flags
        assert_matches!(decoder.decode(&[0x60, 0x02, 0x00, 0x01]), Err(MqttError::DecodingFailure(_)));
    }

    #[test]
    fn publish_rejects_qos_three() {
        let mut decoder = Decoder::new();
        assert_matches!(
            decoder.decode(&[0x36, 0x05, 0x00, 0x01, 0x61, 0x00, 0x01]),
            Err(MqttError::DecodingFailure(_)));
    }

    #[test]
    fn zero_packet_id_is_rejected() {
        let mut decoder = Decoder::new();
        assert_matches!(decoder.decode(&[0x40, 0x02, 0x00, 0x00]), Err(MqttError::DecodingFailure(_)));
    }
}
