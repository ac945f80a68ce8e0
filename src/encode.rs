/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the MQTT 3.1.1 packet encoder.
 */

use crate::error::{MqttError, MqttResult};
use crate::mqtt::*;

/// Maximum value of an MQTT variable length integer
pub(crate) const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = 268_435_455;

pub(crate) const PROTOCOL_NAME: &str = "MQTT";
pub(crate) const PROTOCOL_LEVEL: u8 = 4;

const CONNECT_FLAG_CLEAN_SESSION: u8 = 1 << 1;
const CONNECT_FLAG_WILL: u8 = 1 << 2;
const CONNECT_FLAG_WILL_RETAIN: u8 = 1 << 5;
const CONNECT_FLAG_PASSWORD: u8 = 1 << 6;
const CONNECT_FLAG_USERNAME: u8 = 1 << 7;

fn encode_vli(value: usize, dest: &mut Vec<u8>) -> MqttResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(MqttError::new_encoding_failure("remaining length exceeds the variable length integer maximum"));
    }

    let mut remaining = value;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }

        dest.push(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

fn write_u16(value: u16, dest: &mut Vec<u8>) {
    dest.extend_from_slice(&value.to_be_bytes());
}

fn write_binary(value: &[u8], dest: &mut Vec<u8>) -> MqttResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(MqttError::new_encoding_failure("length-prefixed field exceeds 65535 bytes"));
    }

    write_u16(value.len() as u16, dest);
    dest.extend_from_slice(value);
    Ok(())
}

fn write_string(value: &str, dest: &mut Vec<u8>) -> MqttResult<()> {
    write_binary(value.as_bytes(), dest)
}

fn write_packet_id(packet_id: u16, dest: &mut Vec<u8>) -> MqttResult<()> {
    if packet_id == 0 {
        return Err(MqttError::new_encoding_failure("packet requires a non-zero packet id"));
    }

    write_u16(packet_id, dest);
    Ok(())
}

fn encode_connect_body(packet: &ConnectPacket, body: &mut Vec<u8>) -> MqttResult<()> {
    write_string(PROTOCOL_NAME, body)?;
    body.push(PROTOCOL_LEVEL);

    let mut flags: u8 = 0;
    if packet.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }
    if let Some(will) = &packet.will {
        flags |= CONNECT_FLAG_WILL;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= CONNECT_FLAG_WILL_RETAIN;
        }
    }
    if packet.username.is_some() {
        flags |= CONNECT_FLAG_USERNAME;
    }
    if packet.password.is_some() {
        if packet.username.is_none() {
            return Err(MqttError::new_encoding_failure("a connect password requires a username"));
        }
        flags |= CONNECT_FLAG_PASSWORD;
    }

    body.push(flags);
    write_u16(packet.keep_alive, body);

    write_string(&packet.client_id, body)?;
    if let Some(will) = &packet.will {
        write_string(&will.topic, body)?;
        write_binary(&will.payload, body)?;
    }
    if let Some(username) = &packet.username {
        write_string(username, body)?;
    }
    if let Some(password) = &packet.password {
        write_binary(password, body)?;
    }

    Ok(())
}

fn encode_publish_body(packet: &PublishPacket, body: &mut Vec<u8>) -> MqttResult<()> {
    write_string(&packet.message.topic, body)?;
    if packet.message.qos != QualityOfService::AtMostOnce {
        write_packet_id(packet.packet_id, body)?;
    }

    body.extend_from_slice(&packet.message.payload);
    Ok(())
}

fn encode_subscribe_body(packet: &SubscribePacket, body: &mut Vec<u8>) -> MqttResult<()> {
    if packet.subscriptions.is_empty() {
        return Err(MqttError::new_encoding_failure("subscribe packet must contain at least one subscription"));
    }

    write_packet_id(packet.packet_id, body)?;
    for subscription in &packet.subscriptions {
        write_string(&subscription.topic_filter, body)?;
        body.push(subscription.qos as u8);
    }

    Ok(())
}

fn encode_suback_body(packet: &SubackPacket, body: &mut Vec<u8>) -> MqttResult<()> {
    write_packet_id(packet.packet_id, body)?;
    body.extend_from_slice(&packet.return_codes);
    Ok(())
}

fn encode_unsubscribe_body(packet: &UnsubscribePacket, body: &mut Vec<u8>) -> MqttResult<()> {
    if packet.topic_filters.is_empty() {
        return Err(MqttError::new_encoding_failure("unsubscribe packet must contain at least one topic filter"));
    }

    write_packet_id(packet.packet_id, body)?;
    for topic_filter in &packet.topic_filters {
        write_string(topic_filter, body)?;
    }

    Ok(())
}

fn compute_first_byte(packet: &MqttPacket) -> u8 {
    match packet {
        MqttPacket::Publish(publish) => {
            let mut first_byte = PACKET_TYPE_PUBLISH << 4;
            if publish.duplicate {
                first_byte |= 1 << 3;
            }
            first_byte |= (publish.message.qos as u8) << 1;
            if publish.message.retain {
                first_byte |= 1;
            }
            first_byte
        }

        // these three carry the reserved 0b0010 flag nibble
        MqttPacket::Pubrel(_) => { (PACKET_TYPE_PUBREL << 4) | 0x02 }
        MqttPacket::Subscribe(_) => { (PACKET_TYPE_SUBSCRIBE << 4) | 0x02 }
        MqttPacket::Unsubscribe(_) => { (PACKET_TYPE_UNSUBSCRIBE << 4) | 0x02 }

        MqttPacket::Connect(_) => { PACKET_TYPE_CONNECT << 4 }
        MqttPacket::Connack(_) => { PACKET_TYPE_CONNACK << 4 }
        MqttPacket::Puback(_) => { PACKET_TYPE_PUBACK << 4 }
        MqttPacket::Pubrec(_) => { PACKET_TYPE_PUBREC << 4 }
        MqttPacket::Pubcomp(_) => { PACKET_TYPE_PUBCOMP << 4 }
        MqttPacket::Suback(_) => { PACKET_TYPE_SUBACK << 4 }
        MqttPacket::Unsuback(_) => { PACKET_TYPE_UNSUBACK << 4 }
        MqttPacket::Pingreq => { PACKET_TYPE_PINGREQ << 4 }
        MqttPacket::Pingresp => { PACKET_TYPE_PINGRESP << 4 }
        MqttPacket::Disconnect => { PACKET_TYPE_DISCONNECT << 4 }
    }
}

/// Encodes a packet into the destination buffer as a complete MQTT 3.1.1 control packet.
pub(crate) fn encode_packet(packet: &MqttPacket, dest: &mut Vec<u8>) -> MqttResult<()> {
    let mut body = Vec::new();

    match packet {
        MqttPacket::Connect(connect) => { encode_connect_body(connect, &mut body)?; }
        MqttPacket::Connack(connack) => {
            body.push(u8::from(connack.session_present));
            body.push(connack.return_code as u8);
        }
        MqttPacket::Publish(publish) => { encode_publish_body(publish, &mut body)?; }
        MqttPacket::Puback(puback) => { write_packet_id(puback.packet_id, &mut body)?; }
        MqttPacket::Pubrec(pubrec) => { write_packet_id(pubrec.packet_id, &mut body)?; }
        MqttPacket::Pubrel(pubrel) => { write_packet_id(pubrel.packet_id, &mut body)?; }
        MqttPacket::Pubcomp(pubcomp) => { write_packet_id(pubcomp.packet_id, &mut body)?; }
        MqttPacket::Subscribe(subscribe) => { encode_subscribe_body(subscribe, &mut body)?; }
        MqttPacket::Suback(suback) => { encode_suback_body(suback, &mut body)?; }
        MqttPacket::Unsubscribe(unsubscribe) => { encode_unsubscribe_body(unsubscribe, &mut body)?; }
        MqttPacket::Unsuback(unsuback) => { write_packet_id(unsuback.packet_id, &mut body)?; }
        MqttPacket::Pingreq | MqttPacket::Pingresp | MqttPacket::Disconnect => {}
    }

    dest.push(compute_first_byte(packet));
    encode_vli(body.len(), dest)?;
    dest.extend_from_slice(&body);

    Ok(())
}
