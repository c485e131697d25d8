// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use sip_core::SipMessage;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{ChannelRef, InboundMessage, TransportChannel, TransportError, TransportKind};

/// A local address the stack receives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListeningPoint {
    pub kind: TransportKind,
    pub addr: SocketAddr,
    /// Value advertised as Via sent-by; defaults to `addr`.
    pub sent_by: SmolStr,
}

impl ListeningPoint {
    pub fn new(kind: TransportKind, addr: SocketAddr) -> Self {
        Self {
            kind,
            addr,
            sent_by: SmolStr::new(addr.to_string()),
        }
    }

    pub fn with_sent_by(mut self, sent_by: &str) -> Self {
        self.sent_by = SmolStr::new(sent_by);
        self
    }
}

/// The set of configured listening points.
#[derive(Debug, Default)]
pub struct ListeningPoints {
    points: RwLock<Vec<ListeningPoint>>,
}

impl ListeningPoints {
    pub fn new(points: Vec<ListeningPoint>) -> Self {
        Self {
            points: RwLock::new(points),
        }
    }

    pub fn add(&self, point: ListeningPoint) {
        let mut points = self.points.write();
        if !points.iter().any(|p| p.kind == point.kind && p.addr == point.addr) {
            points.push(point);
        }
    }

    pub fn remove(&self, kind: TransportKind, addr: SocketAddr) -> bool {
        let mut points = self.points.write();
        let before = points.len();
        points.retain(|p| !(p.kind == kind && p.addr == addr));
        before != points.len()
    }

    /// First listening point for the given transport.
    pub fn find(&self, kind: TransportKind) -> Option<ListeningPoint> {
        self.points.read().iter().find(|p| p.kind == kind).cloned()
    }

    /// True when `addr` is one of our own listening points for `kind`.
    ///
    /// A wildcard bind (`0.0.0.0`/`::`) matches loopback destinations on the
    /// same port.
    pub fn is_local(&self, kind: TransportKind, addr: SocketAddr) -> bool {
        self.points.read().iter().any(|p| {
            p.kind == kind
                && p.addr.port() == addr.port()
                && (p.addr.ip() == addr.ip() || (p.addr.ip().is_unspecified() && addr.ip().is_loopback()))
        })
    }

    pub fn all(&self) -> Vec<ListeningPoint> {
        self.points.read().clone()
    }
}

/// Outbound send path with the same-process shortcut.
///
/// A message whose destination is one of our own listening points is not
/// handed to the network: it is pushed back into the inbound pipeline on a
/// [`LoopbackChannel`] so it is processed exactly like a received message.
#[derive(Clone)]
pub struct SelfRouter {
    points: Arc<ListeningPoints>,
    inbound: Option<mpsc::UnboundedSender<InboundMessage>>,
}

impl SelfRouter {
    /// Router that always sends on the channel.
    pub fn direct() -> Self {
        Self {
            points: Arc::new(ListeningPoints::default()),
            inbound: None,
        }
    }

    pub fn new(points: Arc<ListeningPoints>, inbound: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self {
            points,
            inbound: Some(inbound),
        }
    }

    pub fn points(&self) -> &Arc<ListeningPoints> {
        &self.points
    }

    pub fn is_self_addressed(&self, channel: &dyn TransportChannel) -> bool {
        self.inbound.is_some() && self.points.is_local(channel.kind(), channel.peer_addr())
    }

    pub async fn send(&self, channel: &ChannelRef, message: &SipMessage) -> Result<(), TransportError> {
        if let Some(inbound) = &self.inbound {
            if self.points.is_local(channel.kind(), channel.peer_addr()) {
                trace!(peer = %channel.peer_addr(), "self-routing message");
                let reverse: ChannelRef = Arc::new(LoopbackChannel {
                    kind: channel.kind(),
                    local: channel.peer_addr(),
                    peer: channel.local_addr(),
                    inbound: inbound.clone(),
                });
                return inbound
                    .send(InboundMessage::new(message.clone(), reverse))
                    .map_err(|_| TransportError::Closed);
            }
        }
        channel.send(message).await
    }
}

/// Channel whose sends land in this stack's own inbound pipeline.
pub struct LoopbackChannel {
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

#[async_trait]
impl TransportChannel for LoopbackChannel {
    async fn send(&self, message: &SipMessage) -> Result<(), TransportError> {
        let reverse: ChannelRef = Arc::new(LoopbackChannel {
            kind: self.kind,
            local: self.peer,
            peer: self.local,
            inbound: self.inbound.clone(),
        });
        self.inbound
            .send(InboundMessage::new(message.clone(), reverse))
            .map_err(|_| TransportError::Closed)
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {}
}
