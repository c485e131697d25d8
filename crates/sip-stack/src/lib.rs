// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The stack context: one object owning configuration, the timer service,
//! channels, the transaction and dialog tables and the application listener.
//!
//! Inbound messages go through boundary validation (400/505/513), RFC 3581
//! Via patching, transaction matching and finally dialog routing before the
//! application sees them as [`StackEvent`]s. Outbound requests take the
//! self-routing fast path when addressed to one of our listening points.

pub mod config;
pub mod stack;

use sip_core::{DialogId, Request, Response};
use sip_dialog::DialogError;
use sip_timer::TimerError;
use sip_transaction::{ServerTransactionHandle, TerminationReason, TransactionError, TransactionKey};
use sip_transport::TransportError;
use thiserror::Error;

pub use config::{ConfigError, ListeningPointConfig, StackConfig};
pub use stack::SipStack;

#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Dialog(#[from] DialogError),
}

/// What the stack hands to the application.
#[derive(Debug)]
pub enum StackEvent {
    /// A request that created a server transaction. Answer it through
    /// [`SipStack::respond`].
    Request {
        request: Request,
        handle: ServerTransactionHandle,
        dialog: Option<DialogId>,
    },
    /// A response passed up by one of our client transactions.
    Response {
        key: TransactionKey,
        response: Response,
        dialog: Option<DialogId>,
    },
    /// The ACK for a 2xx we sent.
    Ack {
        request: Request,
        dialog: Option<DialogId>,
    },
    /// A transaction left the table.
    Terminated {
        key: TransactionKey,
        reason: TerminationReason,
    },
}

impl StackEvent {
    pub fn dialog(&self) -> Option<&DialogId> {
        match self {
            StackEvent::Request { dialog, .. }
            | StackEvent::Response { dialog, .. }
            | StackEvent::Ack { dialog, .. } => dialog.as_ref(),
            StackEvent::Terminated { .. } => None,
        }
    }
}
