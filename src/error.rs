/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the crate error enumeration and associated conversion and
construction support.
 */

use crate::mqtt::ConnectReturnCode;

use std::error::Error;
use std::fmt;

/// Boxed source error carried by the context-wrapping variants.
pub type ErrorSource = Box<dyn Error + Send + Sync + 'static>;

/// Basic error type for the entire crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum MqttError {

    /// Emitted by the broker engine when the first packet received on a new connection is not
    /// a Connect packet.
    ExpectedConnect,

    /// Emitted by the broker engine when the backend rejects a connection's credentials.  The
    /// peer is sent a Connack with the not-authorized return code before the connection drops.
    NotAuthorized,

    /// Emitted by the broker engine when the backend's setup call returns no session.
    MissingSession,

    /// Emitted by the client when a connection that wants to resume a session is attempted
    /// without a client id.
    MissingClientId,

    /// Emitted by the client when a connect is attempted on a client that has already been
    /// used for a connection.  Clients are single-use; create a new one per connection.
    AlreadyConnecting,

    /// Emitted by client operations that require an established connection.
    NotConnected,

    /// Emitted by the client when the broker explicitly rejects a connection attempt by
    /// sending a Connack packet with a failing return code.
    ConnectionDenied(ConnectReturnCode),

    /// Emitted when the peer closes the connection before a Disconnect packet was exchanged.
    UnexpectedClose,

    /// Emitted by the client when the broker does not answer a Pingreq packet within the
    /// keep alive interval.
    MissingPong,

    /// Emitted when the underlying stream reports end-of-stream on a read.
    ConnectionClosed,

    /// Error encountered while reading from or writing to the framed packet channel.
    TransportError(ErrorSource),

    /// Error surfaced by a session store operation.
    SessionError(ErrorSource),

    /// Error surfaced by a backend operation.
    BackendError(ErrorSource),

    /// Emitted when the peer commits a protocol violation that cannot be safely ignored.
    ClientError(ErrorSource),

    /// Error encountered while decoding an incoming MQTT packet.  This is distinct from
    /// errors that arise from packets that violate protocol behavior specifications.
    /// Examples include bad header flags and mismatches between remaining length fields
    /// and overall packet length.
    DecodingFailure(ErrorSource),

    /// Error encountered while encoding an outbound MQTT packet.
    EncodingFailure(ErrorSource),

    /// Outcome applied to a future whose originating connection died before the associated
    /// operation completed.
    Canceled,

    /// Outcome of a bounded wait on a future that did not complete in time.  The future
    /// remains pending and may still complete later.
    TimedOut,

    /// Informational result recorded when a connection shuts down cleanly via a Disconnect
    /// packet.  Does not indicate an actual failure.
    Disconnected,
}

impl MqttError {

    /// Constructs a new TransportError variant from an existing error.
    pub fn new_transport_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::TransportError(source.into())
    }

    /// Constructs a new SessionError variant from an existing error.  Intended for session
    /// store implementations.
    pub fn new_session_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::SessionError(source.into())
    }

    /// Constructs a new BackendError variant from an existing error.  Intended for backend
    /// implementations.
    pub fn new_backend_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::BackendError(source.into())
    }

    /// Constructs a new ClientError variant from an existing error describing a protocol
    /// violation by the peer.
    pub fn new_client_error(source: impl Into<ErrorSource>) -> Self {
        MqttError::ClientError(source.into())
    }

    pub(crate) fn new_decoding_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::DecodingFailure(source.into())
    }

    pub(crate) fn new_encoding_failure(source: impl Into<ErrorSource>) -> Self {
        MqttError::EncodingFailure(source.into())
    }

    /// Returns whether or not the error represents a clean, intentional shutdown rather
    /// than a failure.
    pub fn is_clean_disconnect(&self) -> bool {
        matches!(self, MqttError::Disconnected)
    }
}

impl Error for MqttError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MqttError::TransportError(source) => { Some(source.as_ref()) }
            MqttError::SessionError(source) => { Some(source.as_ref()) }
            MqttError::BackendError(source) => { Some(source.as_ref()) }
            MqttError::ClientError(source) => { Some(source.as_ref()) }
            MqttError::DecodingFailure(source) => { Some(source.as_ref()) }
            MqttError::EncodingFailure(source) => { Some(source.as_ref()) }
            _ => { None }
        }
    }
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::ExpectedConnect => {
                write!(f, "expected a Connect packet as the first packet")
            }
            MqttError::NotAuthorized => {
                write!(f, "connection is not authorized")
            }
            MqttError::MissingSession => {
                write!(f, "no session returned from the backend")
            }
            MqttError::MissingClientId => {
                write!(f, "resuming a session requires a client id")
            }
            MqttError::AlreadyConnecting => {
                write!(f, "client has already been connected; clients are single-use")
            }
            MqttError::NotConnected => {
                write!(f, "client is not connected")
            }
            MqttError::ConnectionDenied(return_code) => {
                write!(f, "connection denied by the broker: {}", return_code)
            }
            MqttError::UnexpectedClose => {
                write!(f, "peer closed the connection without a Disconnect packet")
            }
            MqttError::MissingPong => {
                write!(f, "broker did not answer a Pingreq packet in time")
            }
            MqttError::ConnectionClosed => {
                write!(f, "connection stream has been closed")
            }
            MqttError::TransportError(_) => {
                write!(f, "framed channel failure; source contains further details")
            }
            MqttError::SessionError(_) => {
                write!(f, "session store failure; source contains further details")
            }
            MqttError::BackendError(_) => {
                write!(f, "backend operation failure; source contains further details")
            }
            MqttError::ClientError(_) => {
                write!(f, "peer behavior disallowed by the mqtt spec; source contains further details")
            }
            MqttError::DecodingFailure(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            MqttError::EncodingFailure(_) => {
                write!(f, "failure encountered while encoding an outbound MQTT packet")
            }
            MqttError::Canceled => {
                write!(f, "future canceled before completion")
            }
            MqttError::TimedOut => {
                write!(f, "future wait timed out; the underlying operation is still pending")
            }
            MqttError::Disconnected => {
                write!(f, "connection shut down cleanly")
            }
        }
    }
}

impl From<std::io::Error> for MqttError {
    fn from(error: std::io::Error) -> Self {
        MqttError::new_transport_error(error)
    }
}

impl From<core::str::Utf8Error> for MqttError {
    fn from(error: core::str::Utf8Error) -> Self {
        MqttError::new_decoding_failure(error)
    }
}

/// Crate-wide result type for functions that can fail
pub type MqttResult<T> = Result<T, MqttError>;
