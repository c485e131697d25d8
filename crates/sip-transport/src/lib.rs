// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport abstraction consumed by the transaction and dialog layers.
//!
//! Socket handling lives outside this crate. What the core needs is the
//! [`TransportChannel`] capability (send a parsed message, report whether the
//! channel is reliable, expose its addresses, close it), a
//! [`ChannelRegistry`] that use-counts channels shared by transactions, and
//! [`ListeningPoints`] plus [`SelfRouter`] for the in-process fast path.

mod listening;
mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sip_core::SipMessage;
use thiserror::Error;

pub use listening::{ListeningPoint, ListeningPoints, LoopbackChannel, SelfRouter};
pub use registry::{ChannelEventSink, ChannelLease, ChannelRegistry, RegistryConfig};

/// Transport protocols a channel can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
    /// SCTP transport (RFC 4168)
    Sctp,
    /// TLS over SCTP transport (RFC 4168)
    TlsSctp,
}

impl TransportKind {
    /// Lowercase name for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
            TransportKind::Sctp => "sctp",
            TransportKind::TlsSctp => "tls-sctp",
        }
    }

    /// Via transport token (RFC 3261, RFC 4168, RFC 7118).
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Wss.via_transport(), "WSS");
    /// assert_eq!(TransportKind::TlsSctp.via_transport(), "TLS-SCTP");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
            TransportKind::Sctp => "SCTP",
            TransportKind::TlsSctp => "TLS-SCTP",
        }
    }

    /// Parses a Via or URI transport token, ignoring case.
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::parse("tcp"), Some(TransportKind::Tcp));
    /// assert_eq!(TransportKind::parse("invalid"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            "wss" => Some(TransportKind::Wss),
            "sctp" => Some(TransportKind::Sctp),
            "tls-sctp" => Some(TransportKind::TlsSctp),
            _ => None,
        }
    }

    /// Reliable transports need no SIP-level retransmission (RFC 3261 §17).
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_transport())
    }
}

/// Failure kinds reported on the application event surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorReason {
    KeepAliveTimeout,
    ConnectionFailure,
    ConnectionError,
    MessageTooLong,
    NoListeningPointForTransport,
}

impl TransportErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorReason::KeepAliveTimeout => "keepalive-timeout",
            TransportErrorReason::ConnectionFailure => "connection-failure",
            TransportErrorReason::ConnectionError => "connection-error",
            TransportErrorReason::MessageTooLong => "message-too-long",
            TransportErrorReason::NoListeningPointForTransport => "no-listening-point",
        }
    }
}

/// Errors returned by [`TransportChannel::send`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// An established connection broke (reset, write error).
    #[error("connection error: {0}")]
    ConnectionError(String),
    /// A connection could not be established.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    #[error("message of {size} bytes exceeds transport limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("no listening point for transport {0}")]
    NoListeningPointForTransport(TransportKind),
    #[error("keep-alive not answered")]
    KeepAliveTimeout,
    #[error("channel closed")]
    Closed,
}

impl TransportError {
    pub fn reason(&self) -> TransportErrorReason {
        match self {
            TransportError::ConnectionError(_) | TransportError::Closed => {
                TransportErrorReason::ConnectionError
            }
            TransportError::ConnectionFailure(_) => TransportErrorReason::ConnectionFailure,
            TransportError::MessageTooLarge { .. } => TransportErrorReason::MessageTooLong,
            TransportError::NoListeningPointForTransport(_) => {
                TransportErrorReason::NoListeningPointForTransport
            }
            TransportError::KeepAliveTimeout => TransportErrorReason::KeepAliveTimeout,
        }
    }
}

/// A connection or socket able to carry SIP messages to one peer.
///
/// Implementations must not block: `send` is awaited from timer-driven
/// retransmission paths as well as inbound processing.
#[async_trait]
pub trait TransportChannel: Send + Sync + 'static {
    async fn send(&self, message: &SipMessage) -> Result<(), TransportError>;

    fn kind(&self) -> TransportKind;

    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }

    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;

    /// Sends a CRLF keep-alive (RFC 5626 §4.4.1). Datagram channels may ignore it.
    async fn send_keepalive(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Releases the underlying connection. Idempotent.
    fn close(&self);
}

/// Shared handle to a channel.
pub type ChannelRef = Arc<dyn TransportChannel>;

/// Identity of a channel: transport plus both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub kind: TransportKind,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl ChannelKey {
    pub fn of(channel: &dyn TransportChannel) -> Self {
        Self {
            kind: channel.kind(),
            local: channel.local_addr(),
            peer: channel.peer_addr(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.kind, self.local, self.peer)
    }
}

/// One fully parsed inbound message and the channel it arrived on.
#[derive(Clone)]
pub struct InboundMessage {
    pub message: SipMessage,
    pub channel: ChannelRef,
    /// Size on the wire, used for the 513 boundary check.
    pub wire_len: usize,
}

impl InboundMessage {
    pub fn new(message: SipMessage, channel: ChannelRef) -> Self {
        let wire_len = message.to_bytes().len();
        Self {
            message,
            channel,
            wire_len,
        }
    }

    pub fn with_wire_len(mut self, wire_len: usize) -> Self {
        self.wire_len = wire_len;
        self
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("channel", &ChannelKey::of(self.channel.as_ref()))
            .field("call_id", &self.message.call_id())
            .field("wire_len", &self.wire_len)
            .finish()
    }
}
