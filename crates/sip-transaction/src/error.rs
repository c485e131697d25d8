// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_core::MessageError;
use sip_transport::TransportError;
use thiserror::Error;

use crate::TransactionKey;

/// Errors returned by the transaction layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    /// The message lacks the Via/branch/CSeq needed to key a transaction.
    #[error("cannot derive a transaction key: {0}")]
    Unkeyable(&'static str),

    #[error("transaction {0} does not exist")]
    NotFound(TransactionKey),

    #[error("transaction {0} already exists")]
    Duplicate(TransactionKey),

    /// `max_transactions` reached.
    #[error("transaction table full ({limit} entries)")]
    Overloaded { limit: usize },

    /// The requested operation is not legal in the current state.
    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invariant violation detected at runtime.
    #[error("internal error: {0}")]
    Internal(String),
}
