// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the transaction, dialog and stack crates.
//!
//! Provides request builders, a [`RecordingChannel`] that captures every
//! message sent through it (with the tokio instant it was sent at, so paused
//! clock tests can assert retransmission schedules), and tracing setup.
//!
//! # Example
//! ```
//! use sip_core::Method;
//! use sip_testkit::RequestBuilder;
//!
//! let req = RequestBuilder::new(Method::Options).branch("z9hG4bKdoc").build();
//! assert_eq!(req.method().as_str(), "OPTIONS");
//! assert_eq!(req.branch().as_deref(), Some("z9hG4bKdoc"));
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{Headers, Method, Request, RequestLine, Response, SipMessage};
use sip_transport::{ChannelRef, TransportChannel, TransportError, TransportKind};
use smol_str::SmolStr;
use tokio::time::Instant;

pub const LOCAL_ADDR: &str = "127.0.0.1:5060";
pub const PEER_ADDR: &str = "192.0.2.10:5060";

/// Fluent builder for test requests. Defaults describe a UDP request from
/// alice to bob with CSeq 1.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    uri: SmolStr,
    transport: TransportKind,
    sent_by: SmolStr,
    branch: SmolStr,
    call_id: SmolStr,
    cseq: u32,
    from_tag: Option<SmolStr>,
    to_tag: Option<SmolStr>,
    extra: Vec<(SmolStr, SmolStr)>,
    body: Bytes,
}

impl RequestBuilder {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            uri: SmolStr::new("sip:bob@example.com"),
            transport: TransportKind::Udp,
            sent_by: SmolStr::new("client.example.com:5060"),
            branch: SmolStr::new("z9hG4bKtest"),
            call_id: SmolStr::new("test-callid@example.com"),
            cseq: 1,
            from_tag: Some(SmolStr::new("1234")),
            to_tag: None,
            extra: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = SmolStr::new(uri);
        self
    }

    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn sent_by(mut self, sent_by: &str) -> Self {
        self.sent_by = SmolStr::new(sent_by);
        self
    }

    pub fn branch(mut self, branch: &str) -> Self {
        self.branch = SmolStr::new(branch);
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.call_id = SmolStr::new(call_id);
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn from_tag(mut self, tag: &str) -> Self {
        self.from_tag = Some(SmolStr::new(tag));
        self
    }

    pub fn no_from_tag(mut self) -> Self {
        self.from_tag = None;
        self
    }

    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(SmolStr::new(tag));
        self
    }

    /// Appends an extra header after the mandatory ones.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra.push((SmolStr::new(name), SmolStr::new(value)));
        self
    }

    pub fn body(mut self, body: &'static str) -> Self {
        self.body = Bytes::from_static(body.as_bytes());
        self
    }

    pub fn build(self) -> Request {
        let mut headers = Headers::new();
        headers.push(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={}",
                self.transport.via_transport(),
                self.sent_by,
                self.branch
            ),
        );
        headers.push("Max-Forwards", "70");
        headers.push(
            "From",
            match &self.from_tag {
                Some(tag) => format!("<sip:alice@example.com>;tag={tag}"),
                None => "<sip:alice@example.com>".to_string(),
            },
        );
        headers.push(
            "To",
            match &self.to_tag {
                Some(tag) => format!("<sip:bob@example.com>;tag={tag}"),
                None => "<sip:bob@example.com>".to_string(),
            },
        );
        headers.push("Call-ID", self.call_id.clone());
        headers.push("CSeq", format!("{} {}", self.cseq, self.method.as_str()));
        if self.method.is_dialog_creating() {
            headers.push("Contact", "<sip:alice@client.example.com:5060>");
        }
        for (name, value) in self.extra {
            headers.push(name, value);
        }
        headers.push("Content-Length", self.body.len().to_string());
        Request::new(RequestLine::new(self.method, self.uri), headers, self.body)
    }
}

/// Minimal INVITE with the given branch and Call-ID.
pub fn invite(branch: &str, call_id: &str) -> Request {
    RequestBuilder::new(Method::Invite)
        .branch(branch)
        .call_id(call_id)
        .build()
}

/// Minimal OPTIONS with the given branch.
pub fn options(branch: &str) -> Request {
    RequestBuilder::new(Method::Options).branch(branch).build()
}

/// PRACK inside the dialog identified by `call_id` and the tags.
pub fn prack(call_id: &str, cseq: u32, rack: &str, from_tag: &str, to_tag: &str) -> Request {
    RequestBuilder::new(Method::Prack)
        .branch(&format!("z9hG4bKprack{cseq}"))
        .call_id(call_id)
        .cseq(cseq)
        .from_tag(from_tag)
        .to_tag(to_tag)
        .header("RAck", rack)
        .build()
}

/// Response to `request` copying the transaction headers.
///
/// # Panics
/// On a status code outside 100-699.
pub fn response_to(request: &Request, code: u16, reason: &str) -> Response {
    Response::for_request(code, reason, request).expect("valid status line")
}

/// Response to `request` whose To header carries `tag`.
pub fn response_with_tag(request: &Request, code: u16, reason: &str, tag: &str) -> Response {
    let mut response = response_to(request, code, reason);
    let to = response
        .headers()
        .get("To")
        .map(|to| sip_core::with_tag(to, tag))
        .expect("To header present");
    response.headers_mut().set("To", to);
    response
}

/// A message captured by a [`RecordingChannel`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub at: Instant,
    pub message: SipMessage,
}

impl SentMessage {
    pub fn status(&self) -> Option<u16> {
        self.message.as_response().map(Response::code)
    }

    pub fn method(&self) -> Option<Method> {
        self.message.as_request().map(|r| r.method().clone())
    }
}

struct ChannelState {
    kind: TransportKind,
    local: SocketAddr,
    peer: SocketAddr,
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<VecDeque<TransportError>>,
    fail_all: Mutex<Option<TransportError>>,
    closed: AtomicBool,
    keepalives: AtomicUsize,
}

/// In-memory channel that records everything sent through it and can be
/// told to fail.
#[derive(Clone)]
pub struct RecordingChannel {
    state: Arc<ChannelState>,
}

impl RecordingChannel {
    pub fn new(kind: TransportKind, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            state: Arc::new(ChannelState {
                kind,
                local,
                peer,
                sent: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                fail_all: Mutex::new(None),
                closed: AtomicBool::new(false),
                keepalives: AtomicUsize::new(0),
            }),
        }
    }

    fn with_defaults(kind: TransportKind) -> Self {
        let local = LOCAL_ADDR.parse().expect("valid address");
        let peer = PEER_ADDR.parse().expect("valid address");
        Self::new(kind, local, peer)
    }

    pub fn udp() -> Self {
        Self::with_defaults(TransportKind::Udp)
    }

    pub fn tcp() -> Self {
        Self::with_defaults(TransportKind::Tcp)
    }

    /// The same channel as a shared trait object.
    pub fn as_channel(&self) -> ChannelRef {
        Arc::new(self.clone())
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.sent.lock().len()
    }

    /// Status codes of all responses sent, in order.
    pub fn sent_statuses(&self) -> Vec<u16> {
        self.state.sent.lock().iter().filter_map(SentMessage::status).collect()
    }

    /// Methods of all requests sent, in order.
    pub fn sent_methods(&self) -> Vec<Method> {
        self.state.sent.lock().iter().filter_map(SentMessage::method).collect()
    }

    pub fn last_sent(&self) -> Option<SipMessage> {
        self.state.sent.lock().last().map(|s| s.message.clone())
    }

    pub fn clear(&self) {
        self.state.sent.lock().clear();
    }

    /// The next send fails with `error`; later sends succeed again.
    pub fn fail_next(&self, error: TransportError) {
        self.state.failures.lock().push_back(error);
    }

    /// Every send from now on fails with `error`.
    pub fn fail_all(&self, error: TransportError) {
        *self.state.fail_all.lock() = Some(error);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.state.keepalives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportChannel for RecordingChannel {
    async fn send(&self, message: &SipMessage) -> Result<(), TransportError> {
        if let Some(error) = self.state.failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(error) = self.state.fail_all.lock().clone() {
            return Err(error);
        }
        self.state.sent.lock().push(SentMessage {
            at: Instant::now(),
            message: message.clone(),
        });
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.state.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.state.local
    }

    fn peer_addr(&self) -> SocketAddr {
        self.state.peer
    }

    async fn send_keepalive(&self) -> Result<(), TransportError> {
        self.state.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Installs a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
