/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the framed packet channel: a bidirectional MQTT packet transport layered
over any async byte stream.

The channel is split into a reader and a writer so that a connection's processor task can
own the inbound side while its sender task owns the outbound side.
 */

use crate::decode::Decoder;
use crate::encode::encode_packet;
use crate::error::{MqttError, MqttResult};
use crate::mqtt::MqttPacket;

use log::*;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::timeout;

use std::time::Duration;

const READ_CHUNK_SIZE: usize = 4096;

type BoxedReadStream = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriteStream = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Inbound half of a framed packet channel.  Owns the decoder and the optional read
/// deadline used for broker-side keep alive enforcement.
pub struct PacketReader {
    stream: BoxedReadStream,
    decoder: Decoder,
    read_deadline: Option<Duration>,
    read_buffer: Vec<u8>,
}

impl PacketReader {

    /// Suspends until a full packet is available.  End-of-stream surfaces as
    /// [`MqttError::ConnectionClosed`]; an elapsed read deadline surfaces as a transport
    /// error.
    pub async fn receive(&mut self) -> MqttResult<MqttPacket> {
        loop {
            if let Some(packet) = self.decoder.pop_packet()? {
                debug!("PacketReader - received {}", packet);
                return Ok(packet);
            }

            let read = self.stream.read(self.read_buffer.as_mut_slice());
            let bytes_read =
                match self.read_deadline {
                    Some(deadline) => {
                        match timeout(deadline, read).await {
                            Ok(read_result) => { read_result? }
                            Err(_) => {
                                info!("PacketReader - read deadline elapsed");
                                return Err(MqttError::new_transport_error("read deadline elapsed"));
                            }
                        }
                    }
                    None => { read.await? }
                };

            if bytes_read == 0 {
                info!("PacketReader - stream closed for read (0 bytes)");
                return Err(MqttError::ConnectionClosed);
            }

            self.decoder.decode(&self.read_buffer[..bytes_read])?;
        }
    }

    /// Sets or clears the maximum time a `receive` call may spend waiting on the stream.
    pub fn set_read_deadline(&mut self, deadline: Option<Duration>) {
        self.read_deadline = deadline;
    }

    /// Bounds the number of decoded packets buffered ahead of `receive` calls.
    pub fn set_packet_prefetch(&mut self, limit: usize) {
        self.decoder.set_buffered_packet_limit(limit);
    }
}

/// Outbound half of a framed packet channel.  Writes pass through a buffering layer;
/// `send` flushes immediately while `send_buffered` leaves coalescing to a later flush.
pub struct PacketWriter {
    stream: BufWriter<BoxedWriteStream>,
    scratch: Vec<u8>,
}

impl PacketWriter {

    /// Encodes and writes a packet, then flushes the stream.
    pub async fn send(&mut self, packet: &MqttPacket) -> MqttResult<()> {
        self.write_packet(packet).await?;
        self.flush().await
    }

    /// Encodes and writes a packet without flushing.  The bytes reach the stream on the
    /// next `send`, `flush` or `shutdown` call.
    pub async fn send_buffered(&mut self, packet: &MqttPacket) -> MqttResult<()> {
        self.write_packet(packet).await
    }

    /// Flushes any buffered writes through to the stream.
    pub async fn flush(&mut self) -> MqttResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Flushes buffered writes and shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> MqttResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write_packet(&mut self, packet: &MqttPacket) -> MqttResult<()> {
        self.scratch.clear();
        encode_packet(packet, &mut self.scratch)?;

        self.stream.write_all(&self.scratch).await?;
        debug!("PacketWriter - sent {}", packet);
        Ok(())
    }
}

/// Splits a byte stream into the two halves of a framed packet channel.
pub fn split_stream<S>(stream: S) -> (PacketReader, PacketWriter)
    where S : AsyncRead + AsyncWrite + Send + Sync + 'static {
    let (read_half, write_half) = split(stream);

    let reader = PacketReader {
        stream: Box::new(read_half),
        decoder: Decoder::new(),
        read_deadline: None,
        read_buffer: vec![0u8; READ_CHUNK_SIZE],
    };

    let writer = PacketWriter {
        stream: BufWriter::new(Box::new(write_half)),
        scratch: Vec::with_capacity(READ_CHUNK_SIZE),
    };

    (reader, writer)
}
