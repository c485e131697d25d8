// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 dialog layer on top of the transaction manager.
//!
//! Tracks dialog lifecycle (Early/Confirmed/Terminated), local and remote
//! CSeq, route set and remote target. On top of that it owns the
//! behaviours that span transactions:
//!
//! - the UAS resends a 2xx to INVITE until the ACK arrives and the UAC
//!   must send that ACK within 64·T1 (RFC 3261 §13.3.1.4, §13.2.2.4)
//! - reliable provisional responses are resent until PRACK (RFC 3262)
//! - a re-INVITE waits until the previous INVITE of the dialog has its
//!   final response and, for a 2xx, its ACK (RFC 3261 §14.1)
//!
//! Dialog timeouts are reported through the stack's
//! [`SipListener`](sip_transaction::SipListener) with a
//! [`EventSource::Dialog`](sip_transaction::EventSource) source.

use rand::{distributions::Alphanumeric, Rng};
use sip_transaction::TransactionError;
use smol_str::SmolStr;
use thiserror::Error;

pub mod dialog;
pub mod manager;
pub mod metrics;
pub mod prack;
pub mod tasks;

pub use dialog::{Dialog, DialogRole, DialogState};
pub use manager::{DialogConfig, DialogManager, Outbound};
pub use metrics::{DialogMetrics, DialogMetricsSnapshot};
pub use prack::{requires_100rel, supports_100rel, PendingReliable};
pub use sip_core::DialogId;
pub use tasks::DialogTimer;

/// Errors returned by the dialog layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DialogError {
    #[error("dialog {0} does not exist")]
    NotFound(DialogId),

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Remote CSeq did not increase.
    #[error("CSeq {received} is not above {current}")]
    InvalidCSeq { received: u32, current: u32 },

    #[error("local CSeq space exhausted")]
    CSeqExhausted,

    /// RFC 3262 allows one unacknowledged reliable provisional at a time.
    #[error("reliable provisional RSeq {rseq} still awaiting PRACK")]
    ReliableResponsePending { rseq: u32 },

    #[error("response tags do not match dialog {dialog}")]
    TagMismatch { dialog: DialogId },

    #[error("status {code} does not create a dialog")]
    NotDialogCreating { code: u16 },

    #[error("missing {0}")]
    MissingHeader(&'static str),

    #[error("PRACK rejected: {0}")]
    InvalidPrack(String),

    /// An INVITE arrived while another INVITE of the dialog is in progress.
    #[error("another INVITE is in progress")]
    RequestPending,

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Random From/To tag.
pub fn generate_tag() -> SmolStr {
    let tag: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SmolStr::new(tag)
}
