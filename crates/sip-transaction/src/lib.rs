// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! - [`fsm`]: sans-IO client and server state machines (INVITE and non-INVITE)
//! - [`timers`]: transport-aware timer durations
//! - [`manager`]: the transaction table, matching and timer-driven execution
//! - [`events`]: the application event surface ([`SipListener`])
//!
//! The state machines never touch the network or the clock. They consume
//! events and return [`fsm::Action`]s which the [`TransactionManager`] applies
//! under the transaction's entry lock (timers) or after releasing it (sends,
//! upcalls).

pub mod error;
pub mod events;
pub mod fsm;
pub mod manager;
pub mod metrics;
pub mod timers;

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Method, Request, Response, MAGIC_COOKIE};
use smol_str::SmolStr;

pub use error::TransactionError;
pub use events::{
    EventSource, NoopListener, SipListener, TimeoutEvent, TimeoutKind, TransportErrorEvent,
};
pub use fsm::TerminationReason;
pub use manager::{
    Disposition, ServerTransactionHandle, Termination, TransactionLimits, TransactionManager,
    TransactionUser,
};

/// Extracts the branch parameter from a single Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("branch") {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{MAGIC_COOKIE}{suffix}"))
}

/// Timers referenced by the SIP transaction state machines (RFC 3261 §17).
///
/// `M` is the RFC 6026 linger a client INVITE transaction keeps after a 2xx
/// so retransmitted 2xx responses still reach the dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    M,
}

impl TransactionTimer {
    /// Timers whose expiry is a failure rather than a normal end of life.
    pub fn is_timeout(self) -> bool {
        matches!(
            self,
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H
        )
    }
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// State of any transaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    ClientInvite(ClientInviteState),
    ClientNonInvite(ClientNonInviteState),
    ServerInvite(ServerInviteState),
    ServerNonInvite(ServerNonInviteState),
}

impl TransactionState {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::ClientInvite(s) => match s {
                ClientInviteState::Calling => "Calling",
                ClientInviteState::Proceeding => "Proceeding",
                ClientInviteState::Completed => "Completed",
                ClientInviteState::Terminated => "Terminated",
            },
            TransactionState::ClientNonInvite(s) => match s {
                ClientNonInviteState::Trying => "Trying",
                ClientNonInviteState::Proceeding => "Proceeding",
                ClientNonInviteState::Completed => "Completed",
                ClientNonInviteState::Terminated => "Terminated",
            },
            TransactionState::ServerInvite(s) => match s {
                ServerInviteState::Proceeding => "Proceeding",
                ServerInviteState::Completed => "Completed",
                ServerInviteState::Confirmed => "Confirmed",
                ServerInviteState::Terminated => "Terminated",
            },
            TransactionState::ServerNonInvite(s) => match s {
                ServerNonInviteState::Trying => "Trying",
                ServerNonInviteState::Proceeding => "Proceeding",
                ServerNonInviteState::Completed => "Completed",
                ServerNonInviteState::Terminated => "Terminated",
            },
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            TransactionState::ClientInvite(ClientInviteState::Terminated)
                | TransactionState::ClientNonInvite(ClientNonInviteState::Terminated)
                | TransactionState::ServerInvite(ServerInviteState::Terminated)
                | TransactionState::ServerNonInvite(ServerNonInviteState::Terminated)
        )
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            TransactionState::ClientInvite(ClientInviteState::Completed)
                | TransactionState::ClientNonInvite(ClientNonInviteState::Completed)
                | TransactionState::ServerInvite(ServerInviteState::Completed)
                | TransactionState::ServerNonInvite(ServerNonInviteState::Completed)
        )
    }
}

/// Unique key identifying a transaction.
///
/// For RFC 3261 requests the key is the top-Via branch, its sent-by and the
/// method (ACK folded onto INVITE). Requests from RFC 2543 peers carry no
/// magic cookie and get a compound branch built from the Request-URI, From
/// tag, Call-ID and CSeq number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub sent_by: SmolStr,
    pub is_server: bool,
}

impl TransactionKey {
    /// Key of the server transaction an inbound request belongs to.
    pub fn server(req: &Request) -> Option<Self> {
        let via = req.top_via()?;
        let sent_by = SmolStr::new(via.sent_by().to_ascii_lowercase());
        let branch = if via.is_rfc3261() {
            SmolStr::new(via.branch()?)
        } else {
            compound_branch(req, &sent_by)?
        };
        let method = match req.method() {
            Method::Ack => Method::Invite,
            other => other.clone(),
        };
        Some(Self {
            branch,
            method,
            sent_by,
            is_server: true,
        })
    }

    /// Key of the client transaction an outbound request creates.
    pub fn client(req: &Request) -> Option<Self> {
        let via = req.top_via()?;
        Some(Self {
            branch: SmolStr::new(via.branch()?),
            method: req.method().clone(),
            sent_by: SmolStr::new(via.sent_by().to_ascii_lowercase()),
            is_server: false,
        })
    }

    /// Key of the client transaction a response belongs to (RFC 3261 §17.1.3).
    pub fn client_for_response(resp: &Response) -> Option<Self> {
        let via = resp.top_via()?;
        Some(Self {
            branch: SmolStr::new(via.branch()?),
            method: resp.cseq()?.method,
            sent_by: SmolStr::new(via.sent_by().to_ascii_lowercase()),
            is_server: false,
        })
    }

    /// True when `other` is the transaction this CANCEL key targets: same
    /// branch and sent-by, any method but CANCEL.
    pub fn is_cancel_target(&self, other: &TransactionKey) -> bool {
        self.method == Method::Cancel
            && other.method != Method::Cancel
            && self.is_server == other.is_server
            && self.branch == other.branch
            && self.sent_by == other.sent_by
    }

    pub fn is_invite(&self) -> bool {
        self.method == Method::Invite
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            if self.is_server { "s" } else { "c" },
            self.branch,
            self.method,
            self.sent_by
        )
    }
}

fn compound_branch(req: &Request, sent_by: &str) -> Option<SmolStr> {
    let from_tag = req.from_tag().unwrap_or_default();
    let cseq = req.cseq()?;
    Some(SmolStr::new(format!(
        "2543|{}|{}|{}|{}|{}",
        req.uri(),
        from_tag,
        req.call_id()?,
        cseq.seq,
        sent_by
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, RequestLine};

    fn request(method: Method, via: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("From", "<sip:alice@example.com>;tag=a1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "key-test");
        headers.push("CSeq", format!("7 {}", method.as_str()));
        Request::new(RequestLine::new(method, "sip:bob@example.com"), headers, Bytes::new())
    }

    #[test]
    fn branch_from_via_extracts_branch() {
        let via = "SIP/2.0/UDP host;branch=z9hG4bKabc;rport";
        assert_eq!(branch_from_via(via), Some("z9hG4bKabc"));
        assert_eq!(branch_from_via("SIP/2.0/UDP host;rport"), None);
    }

    #[test]
    fn generated_branches_carry_cookie() {
        let branch = generate_branch_id();
        assert!(branch.starts_with(MAGIC_COOKIE));
        assert_eq!(branch.len(), MAGIC_COOKIE.len() + 16);
    }

    #[test]
    fn ack_maps_to_invite_server_key() {
        let via = "SIP/2.0/UDP pc33.example.com;branch=z9hG4bKack";
        let invite = TransactionKey::server(&request(Method::Invite, via)).expect("key");
        let ack = TransactionKey::server(&request(Method::Ack, via)).expect("key");
        assert_eq!(invite, ack);
    }

    #[test]
    fn cancel_targets_same_branch_and_sent_by_only() {
        let via = "SIP/2.0/UDP pc33.example.com;branch=z9hG4bKc1";
        let invite = TransactionKey::server(&request(Method::Invite, via)).expect("key");
        let cancel = TransactionKey::server(&request(Method::Cancel, via)).expect("key");
        assert!(cancel.is_cancel_target(&invite));

        let other = "SIP/2.0/UDP other.example.com;branch=z9hG4bKc1";
        let foreign = TransactionKey::server(&request(Method::Invite, other)).expect("key");
        assert!(!cancel.is_cancel_target(&foreign));
    }

    #[test]
    fn rfc2543_requests_use_compound_key() {
        let via = "SIP/2.0/UDP old.example.com:5060";
        let key = TransactionKey::server(&request(Method::Invite, via)).expect("key");
        assert!(key.branch.starts_with("2543|sip:bob@example.com|a1|key-test|7|"));
        let ack = TransactionKey::server(&request(Method::Ack, via)).expect("key");
        assert_eq!(key, ack);
    }

    #[test]
    fn response_key_matches_client_key() {
        let via = "SIP/2.0/UDP pc33.example.com;branch=z9hG4bKr1";
        let req = request(Method::Options, via);
        let resp = Response::for_request(200, "OK", &req).expect("response");
        assert_eq!(
            TransactionKey::client(&req),
            TransactionKey::client_for_response(&resp)
        );
    }
}
