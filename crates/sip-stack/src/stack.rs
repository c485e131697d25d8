// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{
    validate_request, validate_response, with_tag, DialogId, Headers, Method, Request, Response,
    SipMessage,
};
use sip_dialog::{generate_tag, DialogError, DialogManager, Outbound};
use sip_timer::TimerService;
use sip_transaction::{
    generate_branch_id, Disposition, EventSource, ServerTransactionHandle, SipListener,
    Termination, TransactionError, TransactionKey, TransactionManager, TransactionUser,
    TransportErrorEvent,
};
use sip_transport::{
    ChannelEventSink, ChannelKey, ChannelRef, ChannelRegistry, InboundMessage, ListeningPoints,
    SelfRouter, TransportError, TransportErrorReason,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{StackConfig, StackError, StackEvent};

/// Handle to a running stack. Cheap to clone.
#[derive(Clone)]
pub struct SipStack {
    inner: Arc<StackInner>,
}

struct StackInner {
    config: StackConfig,
    timers: TimerService,
    channels: ChannelRegistry,
    router: SelfRouter,
    transactions: TransactionManager,
    dialogs: DialogManager,
    listener: Arc<dyn SipListener>,
    user: Arc<StackUser>,
    events: mpsc::UnboundedSender<StackEvent>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
}

impl SipStack {
    /// Builds the stack on the current tokio runtime and starts its inbound
    /// workers. Application events arrive on the returned receiver.
    pub fn new(
        config: StackConfig,
        listener: Arc<dyn SipListener>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StackEvent>), StackError> {
        config.validate()?;
        let timers = TimerService::new()?;
        timers.update_settings(config.timers)?;

        let channels = ChannelRegistry::new(timers.clone(), config.registry_config());
        channels.set_event_sink(Arc::new(ChannelSink {
            listener: listener.clone(),
        }));

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let router = SelfRouter::new(config.listening_points()?, inbound_tx.clone());
        let transactions = TransactionManager::new(
            timers.clone(),
            channels.clone(),
            router.clone(),
            listener.clone(),
            config.transaction_limits(),
        );
        let dialogs = DialogManager::new(
            transactions.clone(),
            timers.clone(),
            router.clone(),
            listener.clone(),
            config.dialog_config(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let workers = config.workers;

        let inner = Arc::new_cyclic(|weak| StackInner {
            config,
            timers,
            channels,
            router,
            transactions,
            dialogs,
            listener,
            user: Arc::new(StackUser {
                stack: weak.clone(),
            }),
            events: events_tx,
            inbound: inbound_tx,
        });
        spawn_workers(&inner, inbound_rx, workers);
        info!(
            workers,
            listening_points = inner.router.points().all().len(),
            b2bua = inner.config.b2bua,
            "SIP stack started"
        );
        Ok((Self { inner }, events_rx))
    }

    pub fn config(&self) -> &StackConfig {
        &self.inner.config
    }

    pub fn timers(&self) -> &TimerService {
        &self.inner.timers
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.inner.transactions
    }

    pub fn dialogs(&self) -> &DialogManager {
        &self.inner.dialogs
    }

    pub fn listening_points(&self) -> &Arc<ListeningPoints> {
        self.inner.router.points()
    }

    /// Queue for transports to push parsed messages into. Messages of one
    /// Call-ID are processed in order by the same worker.
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundMessage> {
        self.inner.inbound.clone()
    }

    /// A CRLF pong was read on a reliable channel.
    pub fn pong_received(&self, channel: &ChannelKey) {
        self.inner.channels.pong_received(channel);
    }

    /// Processes one inbound message to completion.
    #[instrument(
        name = "receive",
        skip(self, inbound),
        fields(call_id = ?inbound.message.call_id(), peer = %inbound.channel.peer_addr())
    )]
    pub async fn receive(&self, inbound: InboundMessage) {
        let InboundMessage {
            message,
            channel,
            wire_len,
        } = inbound;
        match message {
            SipMessage::Request(request) => self.receive_request(request, channel, wire_len).await,
            SipMessage::Response(response) => self.receive_response(response, wire_len).await,
        }
    }

    async fn receive_request(&self, mut request: Request, channel: ChannelRef, wire_len: usize) {
        let is_ack = request.method() == &Method::Ack;
        if let Err(err) = validate_request(&request, wire_len, self.inner.config.max_message_size) {
            if is_ack {
                debug!(%err, "dropping invalid ACK");
            } else {
                warn!(%err, method = %request.method().as_str(), "rejecting invalid request");
                self.reply_stateless(&request, err.status_code(), err.reason_phrase(), &channel)
                    .await;
            }
            return;
        }

        if let Some(mut via) = request.top_via() {
            if via.apply_received(channel.peer_addr(), self.inner.config.patch_rport) {
                request.set_top_via(&via);
            }
        }

        let disposition = match self
            .inner
            .transactions
            .receive_request(&request, &channel, self.inner.user.clone())
            .await
        {
            Ok(disposition) => disposition,
            Err(TransactionError::Overloaded { .. }) => {
                self.reply_stateless(&request, 503, "Service Unavailable", &channel)
                    .await;
                return;
            }
            Err(err) => {
                warn!(%err, "request not matched");
                return;
            }
        };

        match disposition {
            Disposition::Absorbed => trace!("request absorbed by its transaction"),
            Disposition::UnmatchedAck => {
                let dialog = if self.inner.dialogs.on_ack(&request).await {
                    DialogId::for_inbound(&request)
                } else {
                    debug!("ACK for no known dialog");
                    None
                };
                self.emit(StackEvent::Ack { request, dialog });
            }
            Disposition::New(handle) => self.dispatch(handle, request).await,
        }
    }

    /// Routes a request that created a server transaction.
    async fn dispatch(&self, handle: ServerTransactionHandle, request: Request) {
        if request.method() == &Method::Cancel {
            if handle.cancel_target().is_none() {
                debug!(key = %handle.key(), "CANCEL matches no transaction");
                self.reject(&handle, &request, 481, "Call/Transaction Does Not Exist")
                    .await;
                return;
            }
            self.emit(StackEvent::Request {
                request,
                handle,
                dialog: None,
            });
            return;
        }

        let dialog = if request.to_tag().is_some() {
            match self.inner.dialogs.on_request(handle.key(), &request).await {
                Ok(id) => Some(id),
                Err(err) => {
                    let (code, reason) = rejection(&err);
                    debug!(%err, code, "in-dialog request rejected");
                    self.reject(&handle, &request, code, reason).await;
                    return;
                }
            }
        } else {
            None
        };
        self.emit(StackEvent::Request {
            request,
            handle,
            dialog,
        });
    }

    async fn receive_response(&self, response: Response, wire_len: usize) {
        if let Err(err) = validate_response(&response, wire_len, self.inner.config.max_message_size)
        {
            debug!(%err, status = response.code(), "dropping invalid response");
            return;
        }
        if !self.inner.transactions.receive_response(&response).await {
            debug!(status = response.code(), branch = ?response.branch(), "stray response dropped");
        }
    }

    /// Sends a request outside any dialog on a new client transaction.
    ///
    /// A top Via is added when the request has none. Without a listening
    /// point for the channel's transport nothing is sent and a
    /// `NoListeningPointForTransport` error is raised.
    pub async fn send_request(
        &self,
        mut request: Request,
        channel: &ChannelRef,
    ) -> Result<TransactionKey, StackError> {
        let kind = channel.kind();
        let Some(point) = self.inner.router.points().find(kind) else {
            let key = ChannelKey::of(channel.as_ref());
            warn!(transport = %kind, "no listening point for transport");
            self.inner
                .listener
                .on_transport_error(TransportErrorEvent::new(
                    EventSource::Channel(key),
                    TransportErrorReason::NoListeningPointForTransport,
                    key,
                ))
                .await;
            return Err(TransportError::NoListeningPointForTransport(kind).into());
        };
        if request.top_via().is_none() {
            request.headers_mut().push_front(
                "Via",
                format!(
                    "SIP/2.0/{} {};branch={}",
                    kind.via_transport(),
                    point.sent_by,
                    generate_branch_id()
                ),
            );
        }
        let key = self
            .inner
            .transactions
            .start_client_transaction(request, channel, self.inner.user.clone())
            .await?;
        Ok(key)
    }

    /// Sends a request inside a dialog. A re-INVITE that cannot go out yet
    /// is queued and sent once the previous INVITE is fully acknowledged.
    pub async fn send_in_dialog(
        &self,
        id: &DialogId,
        method: Method,
        headers: Headers,
        body: Bytes,
        cseq: Option<u32>,
    ) -> Result<Outbound, StackError> {
        Ok(self
            .inner
            .dialogs
            .send_request(id, method, headers, body, cseq)
            .await?)
    }

    /// Sends the ACK for the 2xx that confirmed dialog `id`.
    pub async fn send_ack(&self, id: &DialogId) -> Result<Request, StackError> {
        Ok(self.inner.dialogs.send_ack(id).await?)
    }

    /// Answers a request received as [`StackEvent::Request`]. Returns the
    /// dialog the response created or belongs to.
    pub async fn respond(
        &self,
        handle: &ServerTransactionHandle,
        request: &Request,
        response: Response,
    ) -> Result<Option<DialogId>, StackError> {
        Ok(self
            .inner
            .dialogs
            .send_response(handle, request, response, self.inner.user.clone())
            .await?)
    }

    /// Stops every timer. The stack stops processing once dropped.
    pub fn shutdown(&self) {
        info!("SIP stack shutting down");
        self.inner.timers.shutdown();
    }

    fn emit(&self, event: StackEvent) {
        if self.inner.events.send(event).is_err() {
            trace!("application event receiver dropped");
        }
    }

    async fn reject(
        &self,
        handle: &ServerTransactionHandle,
        request: &Request,
        code: u16,
        reason: &str,
    ) {
        let Some(response) = tagged_response(request, code, reason) else {
            return;
        };
        if let Err(err) = handle.send_final(response).await {
            warn!(%err, code, "rejection not sent");
        }
    }

    async fn reply_stateless(&self, request: &Request, code: u16, reason: &str, channel: &ChannelRef) {
        let Some(response) = tagged_response(request, code, reason) else {
            return;
        };
        if let Err(err) = self
            .inner
            .router
            .send(channel, &SipMessage::Response(response))
            .await
        {
            warn!(%err, code, "stateless response not sent");
        }
    }
}

fn tagged_response(request: &Request, code: u16, reason: &str) -> Option<Response> {
    let mut response = match Response::for_request(code, reason, request) {
        Ok(response) => response,
        Err(err) => {
            error!(%err, code, "cannot build response");
            return None;
        }
    };
    if response.to_tag().is_none() {
        if let Some(to) = response.to().map(|to| with_tag(to, &generate_tag())) {
            response.headers_mut().set("To", to);
        }
    }
    Some(response)
}

fn rejection(err: &DialogError) -> (u16, &'static str) {
    match err {
        DialogError::NotFound(_) | DialogError::InvalidPrack(_) => {
            (481, "Call/Transaction Does Not Exist")
        }
        DialogError::RequestPending => (491, "Request Pending"),
        _ => (500, "Server Internal Error"),
    }
}

fn spawn_workers(
    inner: &Arc<StackInner>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    workers: usize,
) {
    let mut lanes = Vec::with_capacity(workers);
    for worker in 0..workers {
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SipStack { inner }.receive(message).await;
            }
            trace!(worker, "inbound worker stopped");
        });
        lanes.push(tx);
    }
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            let lane = lane_for(message.message.call_id(), lanes.len());
            if lanes[lane].send(message).is_err() {
                break;
            }
        }
    });
}

fn lane_for(call_id: Option<&str>, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    call_id.unwrap_or_default().hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Transaction user for everything the stack creates: feeds the dialog
/// layer, then the application.
struct StackUser {
    stack: Weak<StackInner>,
}

#[async_trait]
impl TransactionUser for StackUser {
    async fn on_response(&self, key: &TransactionKey, response: Response) {
        let Some(inner) = self.stack.upgrade() else {
            return;
        };
        let dialog = match inner
            .dialogs
            .on_response(key, &response, inner.user.clone())
            .await
        {
            Ok(dialog) => dialog,
            Err(err) => {
                warn!(key = %key, status = response.code(), %err, "response not applied to dialog");
                None
            }
        };
        let stack = SipStack { inner };
        stack.emit(StackEvent::Response {
            key: key.clone(),
            response,
            dialog,
        });
    }

    async fn on_terminated(&self, key: &TransactionKey, termination: &Termination) {
        let Some(inner) = self.stack.upgrade() else {
            return;
        };
        inner.dialogs.on_transaction_terminated(key, termination).await;
        let stack = SipStack { inner };
        stack.emit(StackEvent::Terminated {
            key: key.clone(),
            reason: termination.reason.clone(),
        });
    }
}

/// Reports channel failures (keep-alive) to the application.
struct ChannelSink {
    listener: Arc<dyn SipListener>,
}

impl ChannelEventSink for ChannelSink {
    fn on_channel_failure(&self, channel: &ChannelRef, error: &TransportError) {
        let key = ChannelKey::of(channel.as_ref());
        warn!(channel = %key, %error, "channel failed");
        let event = TransportErrorEvent::new(EventSource::Channel(key), error.reason(), key);
        let listener = self.listener.clone();
        tokio::spawn(async move { listener.on_transport_error(event).await });
    }
}
