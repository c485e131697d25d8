// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application event surface.
//!
//! Every transport failure, protocol timeout and keep-alive failure reaches
//! the [`SipListener`] exactly once. The object that owns the failure
//! (transaction, dialog or channel) keeps a raised flag and is terminated or
//! deleted as part of raising the event.

use std::net::SocketAddr;

use async_trait::async_trait;
use sip_core::DialogId;
use sip_transport::{ChannelKey, TransportErrorReason, TransportKind};
use smol_str::SmolStr;

use crate::{TransactionKey, TransactionTimer};

/// The object an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventSource {
    Transaction(TransactionKey),
    Dialog(DialogId),
    Channel(ChannelKey),
}

/// What timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Timer B, F or H.
    Transaction(TransactionTimer),
    /// A reliable provisional response was never PRACKed.
    ReliableProvisional,
    /// No ACK arrived for a 2xx we sent.
    AckNotReceived,
    /// We did not send the ACK for a 2xx we received.
    AckNotSent,
    /// A queued re-INVITE could not be sent in time.
    ReInvite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub source: EventSource,
    pub kind: TimeoutKind,
    pub call_id: Option<SmolStr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportErrorEvent {
    pub source: EventSource,
    pub reason: TransportErrorReason,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub transport: TransportKind,
}

impl TransportErrorEvent {
    pub fn new(source: EventSource, reason: TransportErrorReason, channel: ChannelKey) -> Self {
        Self {
            source,
            reason,
            local_addr: channel.local,
            peer_addr: channel.peer,
            transport: channel.kind,
        }
    }
}

/// Receives the events raised by the stack.
///
/// Callbacks run on stack tasks; implementations should hand work off
/// rather than block.
#[async_trait]
pub trait SipListener: Send + Sync + 'static {
    async fn on_timeout(&self, event: TimeoutEvent);

    async fn on_transport_error(&self, event: TransportErrorEvent);

    async fn on_dialog_terminated(&self, dialog: DialogId);
}

/// Listener that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

#[async_trait]
impl SipListener for NoopListener {
    async fn on_timeout(&self, _event: TimeoutEvent) {}

    async fn on_transport_error(&self, _event: TransportErrorEvent) {}

    async fn on_dialog_terminated(&self, _dialog: DialogId) {}
}
