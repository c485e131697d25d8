// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use sip_core::{with_tag, DialogId, Headers, Method, Request, Response, SipMessage};
use sip_timer::{TimerHandle, TimerService};
use sip_transaction::{
    generate_branch_id, EventSource, ServerTransactionHandle, SipListener, Termination,
    TimeoutEvent, TimeoutKind, TransactionError, TransactionKey, TransactionManager,
    TransactionUser, TransportErrorEvent,
};
use sip_transport::{ChannelKey, ChannelRef, SelfRouter, TransportError};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::dialog::{Dialog, DialogState};
use crate::metrics::DialogMetrics;
use crate::prack::{validate_prack, wants_reliable};
use crate::tasks::{Backoff, DialogTimer, DialogTimerTask, Tick};
use crate::{generate_tag, DialogError};

/// Dialog layer behaviour switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogConfig {
    /// On ACK timeouts send BYE before terminating instead of deleting the
    /// dialog outright.
    pub b2bua: bool,
    /// Retention after termination.
    pub linger: Duration,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            b2bua: false,
            linger: Duration::from_secs(32),
        }
    }
}

/// Result of [`DialogManager::send_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A client transaction was started.
    Sent(TransactionKey),
    /// A re-INVITE waiting for the previous INVITE to finish.
    Queued,
}

pub(crate) enum DialogCommand {
    TimerFired {
        id: DialogId,
        timer: DialogTimer,
        generation: u64,
    },
}

struct QueuedInvite {
    headers: Headers,
    body: Bytes,
    explicit_cseq: Option<u32>,
}

/// An in-dialog request built under the entry lock, sent after it.
struct Prepared {
    request: Request,
    key: TransactionKey,
    channel: ChannelRef,
    tu: Arc<dyn TransactionUser>,
}

struct DialogEntry {
    dialog: Dialog,
    channel: ChannelRef,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<DialogTimer, (TimerHandle, u64)>,
    /// Transaction of the dialog-creating request
    creator: Option<TransactionKey>,
    transactions: HashSet<TransactionKey>,
    /// INVITE transaction (either direction) without a final response yet
    invite_in_flight: Option<TransactionKey>,
    /// UAS: the 2xx being resent until ACK
    ack_wait: Option<(Response, Backoff)>,
    /// UAS: server transaction of the reliable 1xx awaiting PRACK
    provisional: Option<(TransactionKey, Backoff)>,
    /// UAC: last ACK sent, resent on 2xx retransmissions
    last_ack: Option<Request>,
    queued: VecDeque<QueuedInvite>,
    reinvite_wait_ticks: u64,
    /// A timeout or transport error was reported for this dialog
    raised: bool,
    /// `on_dialog_terminated` was called
    notified: bool,
}

impl DialogEntry {
    fn new(
        dialog: Dialog,
        channel: ChannelRef,
        tu: Arc<dyn TransactionUser>,
        creator: Option<TransactionKey>,
    ) -> Self {
        let mut transactions = HashSet::new();
        if let Some(key) = &creator {
            transactions.insert(key.clone());
        }
        Self {
            dialog,
            channel,
            tu,
            timers: HashMap::new(),
            creator,
            transactions,
            invite_in_flight: None,
            ack_wait: None,
            provisional: None,
            last_ack: None,
            queued: VecDeque::new(),
            reinvite_wait_ticks: 0,
            raised: false,
            notified: false,
        }
    }
}

/// What a fired timer asks for once the entry lock is released.
enum Fired {
    Nothing,
    Send(ChannelRef, SipMessage),
    ResendProvisional(TransactionKey, Response),
    ProvisionalExpired(TransactionKey),
    Escalate(TimeoutKind),
    Drain,
    Remove,
}

/// Owns the dialog table.
///
/// Dialog state is mutated under the DashMap entry lock; sends, transaction
/// calls and listener upcalls happen after it is released. Timer tasks only
/// carry the dialog id and are resolved against the table when they fire.
#[derive(Clone)]
pub struct DialogManager {
    inner: Arc<DialogInner>,
    cmd_tx: mpsc::UnboundedSender<DialogCommand>,
}

struct DialogInner {
    dialogs: DashMap<DialogId, DialogEntry>,
    /// Transaction key to the dialog it belongs to
    by_transaction: DashMap<TransactionKey, DialogId>,
    transactions: TransactionManager,
    router: SelfRouter,
    timers: TimerService,
    listener: Arc<dyn SipListener>,
    config: DialogConfig,
    metrics: DialogMetrics,
    generation: AtomicU64,
}

impl DialogManager {
    /// Creates a manager and spawns its command loop on the current runtime.
    pub fn new(
        transactions: TransactionManager,
        timers: TimerService,
        router: SelfRouter,
        listener: Arc<dyn SipListener>,
        config: DialogConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(DialogInner {
                dialogs: DashMap::new(),
                by_transaction: DashMap::new(),
                transactions,
                router,
                timers,
                listener,
                config,
                metrics: DialogMetrics::new(),
                generation: AtomicU64::new(0),
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    pub fn metrics(&self) -> &DialogMetrics {
        &self.inner.metrics
    }

    pub fn config(&self) -> DialogConfig {
        self.inner.config
    }

    /// Snapshot of a dialog.
    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.inner.dialogs.get(id).map(|e| e.dialog.clone())
    }

    pub fn state(&self, id: &DialogId) -> Option<DialogState> {
        self.inner.dialogs.get(id).map(|e| e.dialog.state)
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.inner.dialogs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.dialogs.is_empty()
    }

    /// Number of re-INVITEs waiting on the dialog.
    pub fn queued_invites(&self, id: &DialogId) -> usize {
        self.inner.dialogs.get(id).map_or(0, |e| e.queued.len())
    }

    pub fn dialog_for_transaction(&self, key: &TransactionKey) -> Option<DialogId> {
        self.inner.by_transaction.get(key).map(|id| id.clone())
    }

    fn spawn_command_loop(&self, mut rx: mpsc::UnboundedReceiver<DialogCommand>) {
        let weak: Weak<DialogInner> = Arc::downgrade(&self.inner);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = DialogManager {
                    inner,
                    cmd_tx: cmd_tx.clone(),
                };
                match cmd {
                    DialogCommand::TimerFired {
                        id,
                        timer,
                        generation,
                    } => manager.handle_timer(id, timer, generation).await,
                }
            }
        });
    }

    // ---------------------------------------------------------------------
    // UAS side
    // ---------------------------------------------------------------------

    /// Sends `response` on the server transaction of `request`, creating or
    /// updating the dialog it belongs to.
    ///
    /// A tagged 1xx/2xx to a dialog-creating request creates the dialog; a To
    /// tag is generated when the response has none. A 1xx carrying
    /// `Require: 100rel` is sent reliably: it gets an RSeq and is resent until
    /// PRACK. A 2xx to INVITE starts the ACK wait. A 2xx to BYE terminates the
    /// dialog.
    pub async fn send_response(
        &self,
        handle: &ServerTransactionHandle,
        request: &Request,
        mut response: Response,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<Option<DialogId>, DialogError> {
        let key = handle.key().clone();
        let method = request.method().clone();
        let code = response.code();
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?.seq;

        let mut created = false;
        let mut reliable = false;
        let id = if request.to_tag().is_some() {
            let id = DialogId::for_inbound(request).ok_or(DialogError::MissingHeader("From tag"))?;
            if method.is_invite() && wants_reliable(&response) {
                let mut entry = self
                    .inner
                    .dialogs
                    .get_mut(&id)
                    .ok_or_else(|| DialogError::NotFound(id.clone()))?;
                entry.dialog.begin_reliable(&mut response)?;
                reliable = true;
            }
            Some(id)
        } else if method.is_dialog_creating() && (101..300).contains(&code) {
            let channel = self
                .inner
                .transactions
                .channel(&key)
                .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
            if response.to_tag().is_none() {
                self.tag_response(&key, &mut response);
            }
            let id = DialogId::uas(&response).ok_or(DialogError::MissingHeader("To tag"))?;
            match self.inner.dialogs.entry(id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    if entry.dialog.is_terminated() {
                        return Err(DialogError::InvalidState {
                            operation: "send response",
                            state: entry.dialog.state.as_str(),
                        });
                    }
                    if method.is_invite() && wants_reliable(&response) {
                        entry.dialog.begin_reliable(&mut response)?;
                        reliable = true;
                    }
                }
                Entry::Vacant(vacant) => {
                    let mut entry = DialogEntry::new(
                        Dialog::new_uas(request, &response)?,
                        channel,
                        tu,
                        Some(key.clone()),
                    );
                    if method.is_invite() {
                        entry.invite_in_flight = Some(key.clone());
                        if wants_reliable(&response) {
                            entry.dialog.begin_reliable(&mut response)?;
                            reliable = true;
                        }
                    }
                    vacant.insert(entry);
                    created = true;
                }
            }
            if created {
                self.inner.metrics.record_created();
                self.inner.by_transaction.insert(key.clone(), id.clone());
                debug!(dialog = %id, status = code, "UAS dialog created");
            }
            Some(id)
        } else {
            None
        };

        let sent = if response.is_provisional() {
            handle.send_provisional(response.clone()).await
        } else {
            handle.send_final(response.clone()).await
        };
        if let Err(err) = sent {
            if let Some(id) = &id {
                self.rollback_response(id, &key, created, reliable);
                // the transaction has raised the transport error; a dialog
                // whose 2xx never left cannot be confirmed by an ACK
                if matches!(err, TransactionError::Transport(_))
                    && method.is_invite()
                    && response.is_success()
                {
                    self.delete(id).await;
                }
            }
            return Err(err.into());
        }

        if method.is_dialog_creating() && request.to_tag().is_none() && code >= 300 {
            self.discard_early(&key).await;
            return Ok(None);
        }
        let Some(id) = id else {
            return Ok(None);
        };
        self.commit_response(&id, &key, &method, cseq, &response, reliable)
            .await;
        Ok(Some(id))
    }

    /// Reuses the tag of an early dialog of the same transaction, or makes
    /// a new one.
    fn tag_response(&self, key: &TransactionKey, response: &mut Response) {
        let tag = self
            .inner
            .dialogs
            .iter()
            .find(|e| e.creator.as_ref() == Some(key))
            .map(|e| e.dialog.id.local_tag.clone())
            .unwrap_or_else(generate_tag);
        if let Some(to) = response.to().map(|to| with_tag(to, &tag)) {
            response.headers_mut().set("To", to);
        }
    }

    fn rollback_response(&self, id: &DialogId, key: &TransactionKey, created: bool, reliable: bool) {
        if created {
            self.inner.dialogs.remove(id);
            self.inner.by_transaction.remove(key);
        } else if reliable {
            if let Some(mut entry) = self.inner.dialogs.get_mut(id) {
                entry.dialog.clear_reliable();
            }
        }
    }

    async fn commit_response(
        &self,
        id: &DialogId,
        key: &TransactionKey,
        method: &Method,
        cseq: u32,
        response: &Response,
        reliable: bool,
    ) {
        let settings = self.inner.timers.settings();
        let (terminate, drain) = {
            let Some(mut entry) = self.inner.dialogs.get_mut(id) else {
                return;
            };
            if reliable {
                entry.provisional = Some((key.clone(), Backoff::uncapped(&settings)));
                self.arm(&mut entry, DialogTimer::ProvisionalResend, true, settings.base_interval());
                debug!(dialog = %id, rseq = ?entry.dialog.pending_reliable().map(|p| p.rseq), "reliable provisional sent");
            }
            if response.is_final() && method.is_invite() {
                // a pending reliable 1xx is superseded by the final response
                if entry.dialog.clear_reliable().is_some() {
                    entry.provisional = None;
                    self.disarm(&mut entry, DialogTimer::ProvisionalResend);
                }
                if entry.invite_in_flight.as_ref() == Some(key) {
                    entry.invite_in_flight = None;
                }
            }

            let mut terminate = false;
            if response.is_success() {
                match method {
                    Method::Invite => {
                        if entry.dialog.state == DialogState::Early {
                            self.inner.metrics.record_confirmed();
                        }
                        entry.dialog.confirm();
                        entry.ack_wait = Some((response.clone(), Backoff::capped(&settings)));
                        self.arm(&mut entry, DialogTimer::AckWait, true, settings.base_interval());
                    }
                    Method::Bye => terminate = true,
                    m if m.is_dialog_creating() => {
                        if entry.dialog.state == DialogState::Early {
                            self.inner.metrics.record_confirmed();
                        }
                        entry.dialog.confirm();
                    }
                    _ => {}
                }
            } else if response.is_final() && method.is_invite() {
                // the transaction absorbs the ACK for a non-2xx
                entry.dialog.record_remote_ack(cseq);
            }
            (terminate, !entry.queued.is_empty())
        };
        if terminate {
            self.terminate(id).await;
        } else if drain {
            self.drain(id).await;
        }
    }

    /// Routes an in-dialog request that created a new server transaction.
    ///
    /// Errors map to the rejection the stack sends: `NotFound` is 481,
    /// `InvalidCSeq` 500, `RequestPending` 491, `InvalidPrack` 481.
    pub async fn on_request(
        &self,
        key: &TransactionKey,
        request: &Request,
    ) -> Result<DialogId, DialogError> {
        let id = DialogId::for_inbound(request).ok_or(DialogError::MissingHeader("To tag"))?;
        let method = request.method().clone();
        {
            let mut entry = self
                .inner
                .dialogs
                .get_mut(&id)
                .ok_or_else(|| DialogError::NotFound(id.clone()))?;
            if entry.dialog.is_terminated() {
                return Err(DialogError::NotFound(id));
            }
            if method.is_invite() && entry.invite_in_flight.is_some() {
                return Err(DialogError::RequestPending);
            }
            entry.dialog.update_from_request(request)?;

            if method == Method::Prack {
                let rack = validate_prack(entry.dialog.pending_reliable(), request)
                    .map_err(|err| DialogError::InvalidPrack(err.to_string()))?;
                entry.dialog.clear_reliable();
                entry.provisional = None;
                self.disarm(&mut entry, DialogTimer::ProvisionalResend);
                self.inner.metrics.record_prack();
                debug!(dialog = %id, rseq = rack.rseq, "PRACK accepted");
            }
            if method.is_invite() {
                entry.invite_in_flight = Some(key.clone());
            }
            entry.transactions.insert(key.clone());
        }
        self.inner.by_transaction.insert(key.clone(), id.clone());
        Ok(id)
    }

    /// Consumes the ACK for a 2xx. Returns false when it matches no dialog.
    pub async fn on_ack(&self, request: &Request) -> bool {
        let (Some(id), Some(cseq)) = (DialogId::for_inbound(request), request.cseq()) else {
            return false;
        };
        let drain = {
            let Some(mut entry) = self.inner.dialogs.get_mut(&id) else {
                debug!(call_id = %id.call_id, "ACK for unknown dialog");
                return false;
            };
            if !entry.dialog.record_remote_ack(cseq.seq) {
                trace!(dialog = %id, cseq = cseq.seq, "duplicate ACK");
                return true;
            }
            entry.ack_wait = None;
            self.disarm(&mut entry, DialogTimer::AckWait);
            debug!(dialog = %id, cseq = cseq.seq, "ACK received");
            !entry.queued.is_empty()
        };
        if drain {
            self.drain(&id).await;
        }
        true
    }

    // ---------------------------------------------------------------------
    // UAC side
    // ---------------------------------------------------------------------

    /// Applies a response received on client transaction `key`.
    ///
    /// Creates the dialog for a tagged 1xx/2xx to a dialog-creating request,
    /// arms the ACK-send deadline for a 2xx to INVITE and resends the ACK
    /// when the 2xx is retransmitted.
    pub async fn on_response(
        &self,
        key: &TransactionKey,
        response: &Response,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<Option<DialogId>, DialogError> {
        let request = self
            .inner
            .transactions
            .request(key)
            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
        if request.to_tag().is_some() {
            return self.on_in_dialog_response(key, &request, response).await.map(Some);
        }
        let method = request.method().clone();
        if !method.is_dialog_creating() || response.code() == 100 {
            return Ok(None);
        }
        if response.code() >= 300 {
            self.discard_early(key).await;
            return Ok(None);
        }
        if response.to_tag().is_none() {
            debug!(status = response.code(), "response without To tag creates no dialog");
            return Ok(None);
        }

        let channel = self
            .inner
            .transactions
            .channel(key)
            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
        let id = DialogId::uac(response).ok_or(DialogError::MissingHeader("To tag"))?;
        let settings = self.inner.timers.settings();
        let resend = match self.inner.dialogs.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let was_early = entry.dialog.state == DialogState::Early;
                entry.dialog.update_from_response(response)?;
                if was_early && entry.dialog.state == DialogState::Confirmed {
                    self.inner.metrics.record_confirmed();
                }
                self.uac_final(entry, key, &method, response, &settings)
            }
            Entry::Vacant(vacant) => {
                let mut entry = DialogEntry::new(
                    Dialog::new_uac(&request, response)?,
                    channel,
                    tu,
                    Some(key.clone()),
                );
                if method.is_invite() {
                    entry.invite_in_flight = Some(key.clone());
                }
                self.inner.metrics.record_created();
                if entry.dialog.state == DialogState::Confirmed {
                    self.inner.metrics.record_confirmed();
                }
                let resend = self.uac_final(&mut entry, key, &method, response, &settings);
                debug!(dialog = %id, status = response.code(), "UAC dialog created");
                vacant.insert(entry);
                resend
            }
        };
        self.inner.by_transaction.insert(key.clone(), id.clone());
        if let Some((channel, ack)) = resend {
            self.transmit(&id, &channel, &SipMessage::from(ack)).await;
        }
        Ok(Some(id))
    }

    /// Bookkeeping for a 2xx to our INVITE. Returns the ACK to resend when
    /// the 2xx is a retransmission that was already acknowledged.
    fn uac_final(
        &self,
        entry: &mut DialogEntry,
        key: &TransactionKey,
        method: &Method,
        response: &Response,
        settings: &sip_timer::TimerSettings,
    ) -> Option<(ChannelRef, Request)> {
        if !response.is_final() {
            return None;
        }
        // a non-2xx leaves the INVITE in Completed until Timer D; the next
        // re-INVITE waits for the transaction to terminate
        if response.is_success() && entry.invite_in_flight.as_ref() == Some(key) {
            entry.invite_in_flight = None;
        }
        if !(response.is_success() && method.is_invite()) {
            return None;
        }
        let cseq = response.cseq()?.seq;
        if entry.dialog.is_local_acked(cseq) {
            let ack = entry.last_ack.clone()?;
            debug!(dialog = %entry.dialog.id, cseq, "2xx retransmission, resending ACK");
            return Some((entry.channel.clone(), ack));
        }
        if !entry.timers.contains_key(&DialogTimer::AckSendDeadline) {
            self.arm(entry, DialogTimer::AckSendDeadline, false, settings.timeout_bound());
        }
        None
    }

    async fn on_in_dialog_response(
        &self,
        key: &TransactionKey,
        request: &Request,
        response: &Response,
    ) -> Result<DialogId, DialogError> {
        let id = DialogId::for_outbound(request).ok_or(DialogError::MissingHeader("From tag"))?;
        let settings = self.inner.timers.settings();
        let method = request.method().clone();
        let (resend, terminate, drain) = {
            let mut entry = self
                .inner
                .dialogs
                .get_mut(&id)
                .ok_or_else(|| DialogError::NotFound(id.clone()))?;
            if response.is_success() {
                entry.dialog.update_from_response(response)?;
            }
            let resend = self.uac_final(&mut entry, key, &method, response, &settings);
            if response.code() >= 300 && method.is_invite() {
                if let Some(cseq) = response.cseq() {
                    entry.dialog.record_local_ack(cseq.seq);
                }
            }
            // RFC 3261 §12.2.1.2: 481 and 408 end the dialog
            let terminate = (method == Method::Bye && response.is_final())
                || matches!(response.code(), 408 | 481);
            (resend, terminate, response.is_final() && !entry.queued.is_empty())
        };
        if let Some((channel, ack)) = resend {
            self.transmit(&id, &channel, &SipMessage::from(ack)).await;
        }
        if terminate {
            self.terminate(&id).await;
        } else if drain {
            self.drain(&id).await;
        }
        Ok(id)
    }

    /// Sends the ACK for the 2xx to the latest INVITE of the dialog.
    pub async fn send_ack(&self, id: &DialogId) -> Result<Request, DialogError> {
        let (channel, ack) = {
            let mut entry = self
                .inner
                .dialogs
                .get_mut(id)
                .ok_or_else(|| DialogError::NotFound(id.clone()))?;
            if entry.dialog.state != DialogState::Confirmed {
                return Err(DialogError::InvalidState {
                    operation: "send ACK",
                    state: entry.dialog.state.as_str(),
                });
            }
            let cseq = entry.dialog.local_invite.ok_or(DialogError::InvalidState {
                operation: "send ACK",
                state: "no INVITE",
            })?;
            let via = self.via_for(&entry.channel);
            let ack = entry.dialog.build_ack(cseq, &via);
            entry.dialog.record_local_ack(cseq);
            entry.last_ack = Some(ack.clone());
            self.disarm(&mut entry, DialogTimer::AckSendDeadline);
            (entry.channel.clone(), ack)
        };
        debug!(dialog = %id, "sending ACK");
        self.transmit(id, &channel, &SipMessage::from(ack.clone())).await;
        self.drain(id).await;
        Ok(ack)
    }

    /// Sends an in-dialog request.
    ///
    /// An INVITE is queued while another INVITE transaction of the dialog
    /// has not terminated or its 2xx is not acknowledged; its CSeq is assigned
    /// when it is actually sent. `explicit_cseq` above the current local
    /// CSeq becomes the new baseline.
    pub async fn send_request(
        &self,
        id: &DialogId,
        method: Method,
        headers: Headers,
        body: Bytes,
        explicit_cseq: Option<u32>,
    ) -> Result<Outbound, DialogError> {
        if matches!(method, Method::Ack | Method::Cancel) {
            return Err(DialogError::InvalidState {
                operation: "send ACK or CANCEL as a new request",
                state: "any",
            });
        }
        let prepared = {
            let mut entry = self
                .inner
                .dialogs
                .get_mut(id)
                .ok_or_else(|| DialogError::NotFound(id.clone()))?;
            if entry.dialog.is_terminated() {
                return Err(DialogError::InvalidState {
                    operation: "send request",
                    state: entry.dialog.state.as_str(),
                });
            }
            if method.is_invite() && !Self::invite_allowed(&entry) {
                entry.queued.push_back(QueuedInvite {
                    headers,
                    body,
                    explicit_cseq,
                });
                if !entry.timers.contains_key(&DialogTimer::ReInviteWait) {
                    entry.reinvite_wait_ticks = 0;
                    let base = self.inner.timers.settings().base_interval();
                    self.arm(&mut entry, DialogTimer::ReInviteWait, true, base);
                }
                self.inner.metrics.record_reinvite_queued();
                debug!(dialog = %id, queued = entry.queued.len(), "re-INVITE queued");
                return Ok(Outbound::Queued);
            }
            self.prepare(&mut entry, method, &headers, body, explicit_cseq)?
        };
        let key = self.start(id, prepared).await?;
        Ok(Outbound::Sent(key))
    }

    fn invite_allowed(entry: &DialogEntry) -> bool {
        entry.invite_in_flight.is_none() && entry.dialog.is_ack_seen() && entry.queued.is_empty()
    }

    fn prepare(
        &self,
        entry: &mut DialogEntry,
        method: Method,
        headers: &Headers,
        body: Bytes,
        explicit_cseq: Option<u32>,
    ) -> Result<Prepared, DialogError> {
        let cseq = entry.dialog.next_local_cseq(explicit_cseq)?;
        let via = self.via_for(&entry.channel);
        let is_invite = method.is_invite();
        let request = entry.dialog.build_request(method, cseq, &via, headers, body);
        let key = TransactionKey::client(&request)
            .ok_or(TransactionError::Unkeyable("missing Via branch"))?;
        if is_invite {
            entry.dialog.local_invite = Some(cseq);
            entry.invite_in_flight = Some(key.clone());
        }
        entry.transactions.insert(key.clone());
        Ok(Prepared {
            request,
            key,
            channel: entry.channel.clone(),
            tu: entry.tu.clone(),
        })
    }

    async fn start(&self, id: &DialogId, prepared: Prepared) -> Result<TransactionKey, DialogError> {
        let Prepared {
            request,
            key,
            channel,
            tu,
        } = prepared;
        self.inner.by_transaction.insert(key.clone(), id.clone());
        debug!(dialog = %id, method = %request.method(), cseq = ?request.cseq().map(|c| c.seq), "sending in-dialog request");
        match self
            .inner
            .transactions
            .start_client_transaction(request, &channel, tu)
            .await
        {
            Ok(key) => Ok(key),
            Err(err) => {
                self.inner.by_transaction.remove(&key);
                if let Some(mut entry) = self.inner.dialogs.get_mut(id) {
                    entry.transactions.remove(&key);
                    if entry.invite_in_flight.as_ref() == Some(&key) {
                        entry.invite_in_flight = None;
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Sends the next queued re-INVITE if the dialog allows it.
    async fn drain(&self, id: &DialogId) {
        let prepared = {
            let Some(mut entry) = self.inner.dialogs.get_mut(id) else {
                return;
            };
            if entry.queued.is_empty() || entry.dialog.is_terminated() {
                entry.queued.clear();
                self.disarm(&mut entry, DialogTimer::ReInviteWait);
                return;
            }
            if entry.invite_in_flight.is_some() || !entry.dialog.is_ack_seen() {
                return;
            }
            let Some(next) = entry.queued.pop_front() else {
                return;
            };
            entry.reinvite_wait_ticks = 0;
            if entry.queued.is_empty() {
                self.disarm(&mut entry, DialogTimer::ReInviteWait);
            }
            match self.prepare(&mut entry, Method::Invite, &next.headers, next.body, next.explicit_cseq) {
                Ok(prepared) => prepared,
                Err(err) => {
                    error!(dialog = %id, %err, "queued re-INVITE dropped");
                    return;
                }
            }
        };
        if let Err(err) = self.start(id, prepared).await {
            warn!(dialog = %id, %err, "queued re-INVITE failed to start");
        }
    }

    /// Called for every transaction that leaves the transaction table.
    ///
    /// A failed BYE terminates its dialog; a failed dialog-creating
    /// transaction deletes the early dialog it created.
    pub async fn on_transaction_terminated(&self, key: &TransactionKey, termination: &Termination) {
        let Some((_, id)) = self.inner.by_transaction.remove(key) else {
            return;
        };
        let failed = termination.reason.is_failure();
        let (terminate, delete, drain) = {
            let Some(mut entry) = self.inner.dialogs.get_mut(&id) else {
                return;
            };
            entry.transactions.remove(key);
            if entry.invite_in_flight.as_ref() == Some(key) {
                entry.invite_in_flight = None;
            }
            let terminate = failed && key.method == Method::Bye;
            let delete = failed
                && entry.creator.as_ref() == Some(key)
                && entry.dialog.state == DialogState::Early;
            (terminate, delete, !entry.queued.is_empty())
        };
        if terminate {
            self.terminate(&id).await;
        } else if delete {
            self.delete(&id).await;
        } else if drain {
            self.drain(&id).await;
        }
    }

    /// Deletes the early dialogs created by `key` after a non-2xx final.
    async fn discard_early(&self, key: &TransactionKey) {
        let ids: Vec<DialogId> = self
            .inner
            .dialogs
            .iter()
            .filter(|e| e.creator.as_ref() == Some(key) && e.dialog.state == DialogState::Early)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            debug!(dialog = %id, "early dialog ended by final response");
            self.delete(&id).await;
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Moves the dialog to Terminated and keeps it for the linger interval.
    /// Returns false if it was unknown or already terminated.
    pub async fn terminate(&self, id: &DialogId) -> bool {
        let notify = {
            let Some(mut entry) = self.inner.dialogs.get_mut(id) else {
                return false;
            };
            if !entry.dialog.terminate() {
                return false;
            }
            self.disarm_all(&mut entry);
            entry.ack_wait = None;
            entry.provisional = None;
            entry.queued.clear();
            self.arm(&mut entry, DialogTimer::Linger, false, self.inner.config.linger);
            !std::mem::replace(&mut entry.notified, true)
        };
        self.inner.metrics.record_terminated();
        info!(dialog = %id, "dialog terminated");
        if notify {
            self.inner.listener.on_dialog_terminated(id.clone()).await;
        }
        true
    }

    /// Removes the dialog immediately. Returns false if it was unknown.
    pub async fn delete(&self, id: &DialogId) -> bool {
        let Some((_, mut entry)) = self.inner.dialogs.remove(id) else {
            return false;
        };
        self.disarm_all(&mut entry);
        for key in &entry.transactions {
            self.inner.by_transaction.remove(key);
        }
        if !entry.dialog.is_terminated() {
            self.inner.metrics.record_terminated();
        }
        info!(dialog = %id, "dialog deleted");
        if !entry.notified {
            self.inner.listener.on_dialog_terminated(id.clone()).await;
        }
        true
    }

    // ---------------------------------------------------------------------
    // Timers and failures
    // ---------------------------------------------------------------------

    fn arm(&self, entry: &mut DialogEntry, timer: DialogTimer, periodic: bool, delay: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let task = DialogTimerTask {
            id: entry.dialog.id.clone(),
            timer,
            generation,
            call_id: entry.dialog.id.call_id.clone(),
            cmd_tx: self.cmd_tx.clone(),
        };
        let handle = if periodic {
            self.inner.timers.schedule_with_fixed_delay(task, delay, delay)
        } else {
            self.inner.timers.schedule(task, delay)
        };
        if let Some((previous, _)) = entry.timers.insert(timer, (handle, generation)) {
            self.inner.timers.cancel(previous);
        }
        trace!(dialog = %entry.dialog.id, timer = timer.name(), ?delay, "dialog timer armed");
    }

    fn disarm(&self, entry: &mut DialogEntry, timer: DialogTimer) {
        if let Some((handle, _)) = entry.timers.remove(&timer) {
            self.inner.timers.cancel(handle);
        }
    }

    fn disarm_all(&self, entry: &mut DialogEntry) {
        for (_, (handle, _)) in entry.timers.drain() {
            self.inner.timers.cancel(handle);
        }
    }

    async fn handle_timer(&self, id: DialogId, timer: DialogTimer, generation: u64) {
        let fired = {
            let Some(mut entry) = self.inner.dialogs.get_mut(&id) else {
                return;
            };
            match entry.timers.get(&timer) {
                Some((_, current)) if *current == generation => {}
                _ => {
                    trace!(dialog = %id, timer = timer.name(), "stale dialog timer ignored");
                    return;
                }
            }
            match timer {
                DialogTimer::AckWait => {
                    let tick = entry.ack_wait.as_mut().map(|(_, backoff)| backoff.tick());
                    match tick {
                        Some(Tick::Fire) if !entry.channel.is_reliable() => {
                            match entry.ack_wait.as_ref().map(|(response, _)| response.clone()) {
                                Some(response) => {
                                    self.inner.metrics.record_success_retransmission();
                                    Fired::Send(entry.channel.clone(), SipMessage::from(response))
                                }
                                None => Fired::Nothing,
                            }
                        }
                        Some(Tick::Expired) => {
                            entry.ack_wait = None;
                            self.disarm(&mut entry, DialogTimer::AckWait);
                            Fired::Escalate(TimeoutKind::AckNotReceived)
                        }
                        None => {
                            self.disarm(&mut entry, DialogTimer::AckWait);
                            Fired::Nothing
                        }
                        _ => Fired::Nothing,
                    }
                }
                DialogTimer::AckSendDeadline => {
                    entry.timers.remove(&timer);
                    if entry.dialog.is_ack_seen() {
                        Fired::Nothing
                    } else {
                        Fired::Escalate(TimeoutKind::AckNotSent)
                    }
                }
                DialogTimer::ProvisionalResend => {
                    let tick = match entry.provisional.as_mut() {
                        Some((_, backoff)) => backoff.tick(),
                        None => Tick::Expired,
                    };
                    let pending = entry.dialog.pending_reliable().map(|p| p.response.clone());
                    match (tick, entry.provisional.as_ref().map(|(k, _)| k.clone()), pending) {
                        (Tick::Fire, Some(key), Some(response)) => {
                            if entry.channel.is_reliable() {
                                Fired::Nothing
                            } else {
                                Fired::ResendProvisional(key, response)
                            }
                        }
                        (Tick::Expired, Some(key), _) => {
                            entry.provisional = None;
                            entry.dialog.clear_reliable();
                            self.disarm(&mut entry, DialogTimer::ProvisionalResend);
                            Fired::ProvisionalExpired(key)
                        }
                        (Tick::Idle, Some(_), Some(_)) => Fired::Nothing,
                        _ => {
                            entry.provisional = None;
                            self.disarm(&mut entry, DialogTimer::ProvisionalResend);
                            Fired::Nothing
                        }
                    }
                }
                DialogTimer::ReInviteWait => {
                    // the transaction bounds its own lifetime; only the ACK
                    // wait that follows counts against the re-INVITE bound
                    let in_flight = match entry.invite_in_flight.as_ref() {
                        Some(key) => self.inner.transactions.state(key).is_some(),
                        None => false,
                    };
                    if !in_flight {
                        entry.invite_in_flight = None;
                        entry.reinvite_wait_ticks += 1;
                    }
                    if entry.reinvite_wait_ticks >= self.inner.timers.settings().timeout_ticks() {
                        let dropped = entry.queued.len();
                        entry.queued.clear();
                        self.disarm(&mut entry, DialogTimer::ReInviteWait);
                        warn!(dialog = %id, dropped, "queued re-INVITE could not be sent in time");
                        Fired::Escalate(TimeoutKind::ReInvite)
                    } else {
                        Fired::Drain
                    }
                }
                DialogTimer::Linger => {
                    entry.timers.remove(&timer);
                    Fired::Remove
                }
            }
        };

        match fired {
            Fired::Nothing => {}
            Fired::Send(channel, message) => {
                trace!(dialog = %id, "resending 2xx");
                self.transmit(&id, &channel, &message).await;
            }
            Fired::ResendProvisional(key, response) => {
                if self.inner.transactions.retransmit_provisional(&key, response).await {
                    self.inner.metrics.record_provisional_retransmission();
                    trace!(dialog = %id, "resending reliable provisional");
                } else if let Some(mut entry) = self.inner.dialogs.get_mut(&id) {
                    // the transaction is gone or past Proceeding
                    entry.provisional = None;
                    entry.dialog.clear_reliable();
                    self.disarm(&mut entry, DialogTimer::ProvisionalResend);
                }
            }
            Fired::ProvisionalExpired(key) => {
                info!(dialog = %id, "reliable provisional response never acknowledged");
                self.inner.transactions.reliable_provisional_timeout(&key).await;
                let early = self
                    .inner
                    .dialogs
                    .get(&id)
                    .is_some_and(|e| e.dialog.state == DialogState::Early && e.creator.as_ref() == Some(&key));
                if early {
                    self.delete(&id).await;
                }
            }
            Fired::Escalate(kind) => self.escalate(&id, kind).await,
            Fired::Drain => self.drain(&id).await,
            Fired::Remove => {
                if let Some((_, mut entry)) = self.inner.dialogs.remove(&id) {
                    self.disarm_all(&mut entry);
                    for key in &entry.transactions {
                        self.inner.by_transaction.remove(key);
                    }
                    debug!(dialog = %id, "dialog removed after linger");
                }
            }
        }
    }

    /// Raises a dialog timeout once, then sends BYE (B2BUA) or deletes the
    /// dialog.
    async fn escalate(&self, id: &DialogId, kind: TimeoutKind) {
        let (ack, bye) = {
            let Some(mut entry) = self.inner.dialogs.get_mut(id) else {
                return;
            };
            if std::mem::replace(&mut entry.raised, true) {
                return;
            }
            if matches!(kind, TimeoutKind::AckNotReceived | TimeoutKind::AckNotSent) {
                self.inner.metrics.record_ack_timeout();
            }
            if self.inner.config.b2bua && entry.dialog.state == DialogState::Confirmed {
                let ack = match (kind, entry.dialog.local_invite) {
                    (TimeoutKind::AckNotSent, Some(cseq)) => {
                        let via = self.via_for(&entry.channel);
                        entry.dialog.record_local_ack(cseq);
                        Some((entry.channel.clone(), entry.dialog.build_ack(cseq, &via)))
                    }
                    _ => None,
                };
                match self.prepare(&mut entry, Method::Bye, &Headers::new(), Bytes::new(), None) {
                    Ok(prepared) => (ack, Some(prepared)),
                    Err(err) => {
                        error!(dialog = %id, %err, "cannot build BYE");
                        (ack, None)
                    }
                }
            } else {
                (None, None)
            }
        };

        info!(dialog = %id, ?kind, "dialog timeout");
        self.inner
            .listener
            .on_timeout(TimeoutEvent {
                source: EventSource::Dialog(id.clone()),
                kind,
                call_id: Some(id.call_id.clone()),
            })
            .await;

        if let Some((channel, ack)) = ack {
            self.transmit(id, &channel, &SipMessage::from(ack)).await;
        }
        match bye {
            Some(prepared) => {
                if let Err(err) = self.start(id, prepared).await {
                    warn!(dialog = %id, %err, "BYE after timeout failed");
                }
                self.terminate(id).await;
            }
            None => {
                self.delete(id).await;
            }
        }
    }

    async fn transmit(&self, id: &DialogId, channel: &ChannelRef, message: &SipMessage) {
        if let Err(error) = self.inner.router.send(channel, message).await {
            warn!(dialog = %id, %error, "dialog send failed");
            self.transport_failure(id, channel, error).await;
        }
    }

    /// Reports a failed dialog-level send once and deletes the dialog.
    async fn transport_failure(&self, id: &DialogId, channel: &ChannelRef, error: TransportError) {
        {
            let Some(mut entry) = self.inner.dialogs.get_mut(id) else {
                return;
            };
            if std::mem::replace(&mut entry.raised, true) {
                return;
            }
        }
        self.inner
            .listener
            .on_transport_error(TransportErrorEvent::new(
                EventSource::Dialog(id.clone()),
                error.reason(),
                ChannelKey::of(channel.as_ref()),
            ))
            .await;
        self.delete(id).await;
    }

    fn via_for(&self, channel: &ChannelRef) -> String {
        let sent_by = self
            .inner
            .router
            .points()
            .find(channel.kind())
            .map(|point| point.sent_by)
            .unwrap_or_else(|| SmolStr::new(channel.local_addr().to_string()));
        format!(
            "SIP/2.0/{} {};branch={}",
            channel.kind().via_transport(),
            sent_by,
            generate_branch_id()
        )
    }
}
