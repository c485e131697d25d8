// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use sip_core::{Method, Request, Response};
use sip_timer::{TimerHandle, TimerService, TimerSettings, TimerTask};
use sip_transport::{ChannelKey, ChannelLease, ChannelRef, ChannelRegistry, SelfRouter, TransportError};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::TransactionError;
use crate::events::{EventSource, SipListener, TimeoutEvent, TimeoutKind, TransportErrorEvent};
use crate::fsm::{
    Action, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerEvent, ServerInviteFsm,
    ServerNonInviteFsm, TerminationReason,
};
use crate::metrics::{TransactionMetrics, TransactionOutcome, TransactionRole};
use crate::timers::TransportAwareTimers;
use crate::{ServerInviteState, TransactionKey, TransactionState, TransactionTimer};

/// Transaction limits for DoS protection.
///
/// Without limits an attacker can exhaust memory by sending requests with
/// unique branches. Creation beyond a limit fails with
/// [`TransactionError::Overloaded`]; the stack answers such requests with 503.
///
/// ```
/// use sip_transaction::TransactionLimits;
///
/// let limits = TransactionLimits::new(5_000, 2_000);
/// assert_eq!(limits.max_server_transactions, 5_000);
/// assert_eq!(TransactionLimits::default().max_client_transactions, 10_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    pub max_server_transactions: usize,
    pub max_client_transactions: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_server_transactions: 10_000,
            max_client_transactions: 10_000,
        }
    }
}

impl TransactionLimits {
    pub fn new(max_server: usize, max_client: usize) -> Self {
        Self {
            max_server_transactions: max_server,
            max_client_transactions: max_client,
        }
    }

    /// Same limit for both tables.
    pub fn uniform(max: usize) -> Self {
        Self::new(max, max)
    }

    /// No limits (tests only).
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }
}

/// Why and where a transaction ended, as reported to its user.
#[derive(Debug, Clone)]
pub struct Termination {
    pub reason: TerminationReason,
    /// The request that created the transaction.
    pub request: Request,
    pub channel: ChannelKey,
}

/// Callbacks from a transaction to the layer that created it.
#[async_trait]
pub trait TransactionUser: Send + Sync + 'static {
    /// A response passed up by a client transaction.
    async fn on_response(&self, key: &TransactionKey, response: Response);

    /// The transaction left the table. Called exactly once per transaction.
    async fn on_terminated(&self, key: &TransactionKey, termination: &Termination);
}

/// What became of an inbound request.
pub enum Disposition {
    /// A new server transaction was created; the request must be handed to
    /// the application.
    New(ServerTransactionHandle),
    /// Retransmission or non-2xx ACK, consumed by an existing transaction.
    Absorbed,
    /// An ACK that matched no transaction in Completed or Confirmed: the ACK
    /// for a 2xx, which belongs to the dialog.
    UnmatchedAck,
}

enum ManagerCommand {
    TimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
        generation: u64,
    },
    TransportError {
        key: TransactionKey,
        error: TransportError,
    },
}

enum Machine {
    ClientInvite(ClientInviteFsm),
    ClientNonInvite(ClientNonInviteFsm),
    ServerInvite(ServerInviteFsm),
    ServerNonInvite(ServerNonInviteFsm),
}

impl Machine {
    fn state(&self) -> TransactionState {
        match self {
            Machine::ClientInvite(fsm) => TransactionState::ClientInvite(fsm.state()),
            Machine::ClientNonInvite(fsm) => TransactionState::ClientNonInvite(fsm.state()),
            Machine::ServerInvite(fsm) => TransactionState::ServerInvite(fsm.state()),
            Machine::ServerNonInvite(fsm) => TransactionState::ServerNonInvite(fsm.state()),
        }
    }

    fn client(&mut self, event: ClientEvent) -> Vec<Action> {
        match self {
            Machine::ClientInvite(fsm) => fsm.on_event(event),
            Machine::ClientNonInvite(fsm) => fsm.on_event(event),
            _ => Vec::new(),
        }
    }

    fn server(&mut self, event: ServerEvent) -> Vec<Action> {
        match self {
            Machine::ServerInvite(fsm) => fsm.on_event(event),
            Machine::ServerNonInvite(fsm) => fsm.on_event(event),
            _ => Vec::new(),
        }
    }

    fn is_client(&self) -> bool {
        matches!(self, Machine::ClientInvite(_) | Machine::ClientNonInvite(_))
    }

    fn timer_fired(&mut self, timer: TransactionTimer) -> Vec<Action> {
        if self.is_client() {
            self.client(ClientEvent::TimerFired(timer))
        } else {
            self.server(ServerEvent::TimerFired(timer))
        }
    }

    fn transport_error(&mut self, error: TransportError) -> Vec<Action> {
        if self.is_client() {
            self.client(ClientEvent::TransportError(error))
        } else {
            self.server(ServerEvent::TransportError(error))
        }
    }

    fn send_response(&mut self, response: Response) -> Result<Vec<Action>, TransactionError> {
        let provisional = response.is_provisional();
        match self {
            Machine::ServerInvite(fsm) if provisional => fsm.send_provisional(response),
            Machine::ServerInvite(fsm) => fsm.send_final(response),
            Machine::ServerNonInvite(fsm) if provisional => fsm.send_provisional(response),
            Machine::ServerNonInvite(fsm) => fsm.send_final(response),
            _ => Err(TransactionError::InvalidState {
                operation: "send response",
                state: "client transaction",
            }),
        }
    }
}

struct TransactionEntry {
    machine: Machine,
    lease: ChannelLease,
    tu: Arc<dyn TransactionUser>,
    timers: HashMap<TransactionTimer, (TimerHandle, u64)>,
    request: Request,
    call_id: SmolStr,
    started: Instant,
}

/// Outcome of one state machine step still to be carried out without the
/// entry lock.
struct Pending {
    channel: ChannelRef,
    tu: Arc<dyn TransactionUser>,
    effects: Vec<Action>,
}

/// Fires a transaction timer by enqueueing its id; the manager resolves it
/// against the table, so a timer of a removed transaction does nothing.
struct TransactionTimerTask {
    key: TransactionKey,
    timer: TransactionTimer,
    generation: u64,
    call_id: SmolStr,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
}

impl TimerTask for TransactionTimerTask {
    fn name(&self) -> &str {
        match self.timer {
            TransactionTimer::A => "timer-A",
            TransactionTimer::B => "timer-B",
            TransactionTimer::D => "timer-D",
            TransactionTimer::E => "timer-E",
            TransactionTimer::F => "timer-F",
            TransactionTimer::G => "timer-G",
            TransactionTimer::H => "timer-H",
            TransactionTimer::I => "timer-I",
            TransactionTimer::J => "timer-J",
            TransactionTimer::K => "timer-K",
            TransactionTimer::M => "timer-M",
        }
    }

    fn correlation_id(&self) -> Option<&str> {
        Some(&self.call_id)
    }

    fn run(&self) {
        let _ = self.cmd_tx.send(ManagerCommand::TimerFired {
            key: self.key.clone(),
            timer: self.timer,
            generation: self.generation,
        });
    }
}

/// Owns SIP transactions and manages timers/actions.
///
/// State machine steps run under the DashMap entry lock together with the
/// timer schedule/cancel actions they produce. Sends and upcalls happen
/// after the lock is released.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<ManagerInner>,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
}

struct ManagerInner {
    server: DashMap<TransactionKey, TransactionEntry>,
    client: DashMap<TransactionKey, TransactionEntry>,
    timers: TimerService,
    channels: ChannelRegistry,
    router: SelfRouter,
    listener: Arc<dyn SipListener>,
    metrics: TransactionMetrics,
    limits: TransactionLimits,
    generation: AtomicU64,
}

impl TransactionManager {
    /// Creates a manager and spawns its command loop on the current runtime.
    pub fn new(
        timers: TimerService,
        channels: ChannelRegistry,
        router: SelfRouter,
        listener: Arc<dyn SipListener>,
        limits: TransactionLimits,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                server: DashMap::new(),
                client: DashMap::new(),
                timers,
                channels,
                router,
                listener,
                metrics: TransactionMetrics::new(),
                limits,
                generation: AtomicU64::new(0),
            }),
            cmd_tx,
        };
        manager.spawn_command_loop(cmd_rx);
        manager
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.inner.metrics
    }

    pub fn timer_settings(&self) -> TimerSettings {
        self.inner.timers.settings()
    }

    pub fn state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.table(key).get(key).map(|entry| entry.machine.state())
    }

    /// The request that created the transaction.
    pub fn request(&self, key: &TransactionKey) -> Option<Request> {
        self.table(key).get(key).map(|entry| entry.request.clone())
    }

    /// The channel the transaction is bound to.
    pub fn channel(&self, key: &TransactionKey) -> Option<ChannelRef> {
        self.table(key)
            .get(key)
            .map(|entry| entry.lease.channel().clone())
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.table(key).contains_key(key)
    }

    pub fn server_count(&self) -> usize {
        self.inner.server.len()
    }

    pub fn client_count(&self) -> usize {
        self.inner.client.len()
    }

    fn table(&self, key: &TransactionKey) -> &DashMap<TransactionKey, TransactionEntry> {
        if key.is_server {
            &self.inner.server
        } else {
            &self.inner.client
        }
    }

    fn spawn_command_loop(&self, mut rx: mpsc::UnboundedReceiver<ManagerCommand>) {
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = TransactionManager {
                    inner,
                    cmd_tx: cmd_tx.clone(),
                };
                match cmd {
                    ManagerCommand::TimerFired {
                        key,
                        timer,
                        generation,
                    } => manager.handle_timer(key, timer, generation).await,
                    ManagerCommand::TransportError { key, error } => {
                        manager.handle_transport_error(key, error).await
                    }
                }
            }
        });
    }

    /// Matches an inbound request against the server table.
    ///
    /// Retransmissions are resolved to their existing transaction, which may
    /// resend its cached response. A request that matches nothing creates a
    /// new server transaction owned by `tu`.
    pub async fn receive_request(
        &self,
        request: &Request,
        channel: &ChannelRef,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<Disposition, TransactionError> {
        let key = TransactionKey::server(request)
            .ok_or(TransactionError::Unkeyable("missing Via or CSeq"))?;

        if request.method() == &Method::Ack {
            return Ok(self.receive_ack(&key, request).await);
        }

        if let Some(pending) = self.step(&key, |m| m.server(ServerEvent::Request(request.clone())))
        {
            debug!(key = %key, "request retransmission resolved to existing transaction");
            self.execute(&key, pending).await;
            return Ok(Disposition::Absorbed);
        }

        let limit = self.inner.limits.max_server_transactions;
        if self.inner.server.len() >= limit {
            self.inner.metrics.record_server_transaction_rejected();
            warn!(key = %key, limit, "server transaction limit reached");
            return Err(TransactionError::Overloaded { limit });
        }

        let timers = TransportAwareTimers::new(channel.kind(), self.inner.timers.settings());
        let machine = if request.method().is_invite() {
            Machine::ServerInvite(ServerInviteFsm::new(timers))
        } else {
            Machine::ServerNonInvite(ServerNonInviteFsm::new(timers))
        };
        let entry = self.new_entry(machine, request.clone(), channel, tu);
        match self.inner.server.entry(key.clone()) {
            // an identical request won the race to create it
            Entry::Occupied(_) => return Ok(Disposition::Absorbed),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.inner.metrics.record_start(
            channel.kind(),
            request.method().as_str(),
            TransactionRole::Server,
        );

        let cancel_target = if request.method() == &Method::Cancel {
            self.inner
                .server
                .iter()
                .find(|e| key.is_cancel_target(e.key()))
                .map(|e| e.key().clone())
        } else {
            None
        };
        debug!(
            key = %key,
            call_id = ?request.call_id(),
            cancel_target = ?cancel_target,
            "server transaction created"
        );

        Ok(Disposition::New(ServerTransactionHandle {
            manager: self.clone(),
            key,
            cancel_target,
        }))
    }

    async fn receive_ack(&self, key: &TransactionKey, request: &Request) -> Disposition {
        let mut matched = false;
        let pending = self.step(key, |m| {
            if matches!(
                m.state(),
                TransactionState::ServerInvite(
                    ServerInviteState::Completed | ServerInviteState::Confirmed
                )
            ) {
                matched = true;
                m.server(ServerEvent::Ack(request.clone()))
            } else {
                Vec::new()
            }
        });
        match pending {
            Some(pending) if matched => {
                self.execute(key, pending).await;
                Disposition::Absorbed
            }
            _ => Disposition::UnmatchedAck,
        }
    }

    /// Creates a client transaction for `request` and sends it on `channel`.
    ///
    /// A send failure is not returned here: it terminates the transaction and
    /// is reported once through the listener and `tu`.
    pub async fn start_client_transaction(
        &self,
        request: Request,
        channel: &ChannelRef,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey, TransactionError> {
        if request.method() == &Method::Ack {
            return Err(TransactionError::Unkeyable("ACK does not create a transaction"));
        }
        let key = TransactionKey::client(&request)
            .ok_or(TransactionError::Unkeyable("missing Via branch"))?;

        let limit = self.inner.limits.max_client_transactions;
        if self.inner.client.len() >= limit {
            self.inner.metrics.record_client_transaction_rejected();
            warn!(key = %key, limit, "client transaction limit reached");
            return Err(TransactionError::Overloaded { limit });
        }

        let timers = TransportAwareTimers::new(channel.kind(), self.inner.timers.settings());
        let machine = if request.method().is_invite() {
            Machine::ClientInvite(ClientInviteFsm::new(timers))
        } else {
            Machine::ClientNonInvite(ClientNonInviteFsm::new(timers))
        };
        let entry = self.new_entry(machine, request.clone(), channel, tu);
        match self.inner.client.entry(key.clone()) {
            Entry::Occupied(_) => return Err(TransactionError::Duplicate(key)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        self.inner.metrics.record_start(
            channel.kind(),
            request.method().as_str(),
            TransactionRole::Client,
        );
        debug!(
            key = %key,
            call_id = ?request.call_id(),
            transport = %channel.kind(),
            "client transaction started"
        );

        if let Some(pending) = self.step(&key, |m| m.client(ClientEvent::Send(request))) {
            self.execute(&key, pending).await;
        }
        Ok(key)
    }

    /// Feeds a response to its client transaction. Returns false for a stray
    /// response that matched nothing.
    pub async fn receive_response(&self, response: &Response) -> bool {
        let Some(key) = TransactionKey::client_for_response(response) else {
            debug!("response without branch or CSeq");
            return false;
        };
        match self.step(&key, |m| m.client(ClientEvent::Response(response.clone()))) {
            Some(pending) => {
                self.execute(&key, pending).await;
                true
            }
            None => {
                debug!(key = %key, status = response.code(), "no client transaction for response");
                false
            }
        }
    }

    /// Sends a provisional or final response on a server transaction.
    /// A failed send comes back as [`TransactionError::Transport`]; the
    /// transaction reports it to the listener and terminates.
    pub async fn send_response(
        &self,
        key: &TransactionKey,
        response: Response,
    ) -> Result<(), TransactionError> {
        let pending = self.try_step(key, |m| m.send_response(response))?;
        match self.execute(key, pending).await {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    /// Resends a reliable provisional response that is still awaiting PRACK.
    pub async fn retransmit_provisional(&self, key: &TransactionKey, response: Response) -> bool {
        match self.step(key, |m| m.server(ServerEvent::RetransmitProvisional(response))) {
            Some(pending) => {
                self.execute(key, pending).await;
                true
            }
            None => false,
        }
    }

    /// The reliable provisional response bound elapsed: the transaction is
    /// terminated and a [`TimeoutKind::ReliableProvisional`] event raised.
    pub async fn reliable_provisional_timeout(&self, key: &TransactionKey) {
        if let Some(pending) = self.step(key, |m| m.server(ServerEvent::ProvisionalTimeout)) {
            self.execute(key, pending).await;
        }
    }

    fn new_entry(
        &self,
        machine: Machine,
        request: Request,
        channel: &ChannelRef,
        tu: Arc<dyn TransactionUser>,
    ) -> TransactionEntry {
        TransactionEntry {
            machine,
            lease: self.inner.channels.acquire(channel),
            tu,
            timers: HashMap::new(),
            call_id: SmolStr::new(request.call_id().unwrap_or_default()),
            request,
            started: Instant::now(),
        }
    }

    fn step<F>(&self, key: &TransactionKey, f: F) -> Option<Pending>
    where
        F: FnOnce(&mut Machine) -> Vec<Action>,
    {
        self.try_step(key, |m| Ok(f(m))).ok()
    }

    fn try_step<F>(&self, key: &TransactionKey, f: F) -> Result<Pending, TransactionError>
    where
        F: FnOnce(&mut Machine) -> Result<Vec<Action>, TransactionError>,
    {
        let mut entry = self
            .table(key)
            .get_mut(key)
            .ok_or_else(|| TransactionError::NotFound(key.clone()))?;
        let actions = f(&mut entry.machine)?;
        Ok(self.arm(key, &mut entry, actions))
    }

    /// Applies timer actions while the entry is locked and returns the rest.
    fn arm(&self, key: &TransactionKey, entry: &mut TransactionEntry, actions: Vec<Action>) -> Pending {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                Action::Schedule { timer, duration } => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let handle = self.inner.timers.schedule(
                        TransactionTimerTask {
                            key: key.clone(),
                            timer,
                            generation,
                            call_id: entry.call_id.clone(),
                            cmd_tx: self.cmd_tx.clone(),
                        },
                        duration,
                    );
                    if let Some((previous, _)) = entry.timers.insert(timer, (handle, generation)) {
                        self.inner.timers.cancel(previous);
                    }
                    trace!(key = %key, timer = ?timer, ?duration, "timer armed");
                }
                Action::Cancel(timer) => {
                    if let Some((handle, _)) = entry.timers.remove(&timer) {
                        self.inner.timers.cancel(handle);
                    }
                }
                other => effects.push(other),
            }
        }
        Pending {
            channel: entry.lease.channel().clone(),
            tu: entry.tu.clone(),
            effects,
        }
    }

    /// Runs the side effects of one step. Returns the error of a failed
    /// send so callers that sent a message themselves can report it.
    ///
    /// When the same step also ends the transaction (a 2xx on a reliable
    /// transport, Timer J of zero) the failure becomes the termination
    /// reason; otherwise it is fed back into the machine.
    async fn execute(&self, key: &TransactionKey, pending: Pending) -> Option<TransportError> {
        let Pending {
            channel,
            tu,
            effects,
        } = pending;
        let mut failed: Option<TransportError> = None;
        let mut ended = false;
        for effect in effects {
            match effect {
                Action::Transmit {
                    message,
                    retransmission,
                } => {
                    if failed.is_some() {
                        continue;
                    }
                    if retransmission {
                        self.inner.metrics.record_retransmission(channel.kind());
                    }
                    if let Err(error) = self.inner.router.send(&channel, &message).await {
                        warn!(key = %key, %error, "transaction send failed");
                        failed = Some(error);
                    }
                }
                Action::Deliver(response) => tu.on_response(key, response).await,
                Action::Terminate(reason) => {
                    ended = true;
                    let reason = match &failed {
                        Some(error) => TerminationReason::TransportError(error.clone()),
                        None => reason,
                    };
                    self.finish(key, reason).await;
                }
                Action::Schedule { .. } | Action::Cancel(_) => {}
            }
        }
        if let (Some(error), false) = (&failed, ended) {
            let _ = self.cmd_tx.send(ManagerCommand::TransportError {
                key: key.clone(),
                error: error.clone(),
            });
        }
        failed
    }

    async fn handle_timer(&self, key: TransactionKey, timer: TransactionTimer, generation: u64) {
        let pending = {
            let Some(mut entry) = self.table(&key).get_mut(&key) else {
                return;
            };
            match entry.timers.get(&timer) {
                Some((_, current)) if *current == generation => {}
                _ => {
                    trace!(key = %key, timer = ?timer, "stale timer ignored");
                    return;
                }
            }
            entry.timers.remove(&timer);
            self.inner.metrics.record_timer_fired(timer);
            let actions = entry.machine.timer_fired(timer);
            self.arm(&key, &mut entry, actions)
        };
        self.execute(&key, pending).await;
    }

    async fn handle_transport_error(&self, key: TransactionKey, error: TransportError) {
        if let Some(pending) = self.step(&key, |m| m.transport_error(error)) {
            self.execute(&key, pending).await;
        }
    }

    /// Removes the transaction and reports its end. Removal from the table
    /// is what makes the report happen once.
    async fn finish(&self, key: &TransactionKey, reason: TerminationReason) {
        let Some((_, entry)) = self.table(key).remove(key) else {
            return;
        };
        for (handle, _) in entry.timers.values() {
            self.inner.timers.cancel(*handle);
        }

        let channel = *entry.lease.key();
        let role = if key.is_server {
            TransactionRole::Server
        } else {
            TransactionRole::Client
        };
        self.inner.metrics.record_complete(
            channel.kind,
            key.method.as_str(),
            role,
            TransactionOutcome::from(&reason),
            entry.started.elapsed(),
        );

        let source = EventSource::Transaction(key.clone());
        match &reason {
            TerminationReason::Completed => {
                debug!(key = %key, call_id = %entry.call_id, "transaction terminated");
            }
            TerminationReason::Timeout(timer) => {
                info!(key = %key, call_id = %entry.call_id, timer = ?timer, "transaction timed out");
                self.inner
                    .listener
                    .on_timeout(TimeoutEvent {
                        source,
                        kind: TimeoutKind::Transaction(*timer),
                        call_id: Some(entry.call_id.clone()),
                    })
                    .await;
            }
            TerminationReason::ProvisionalTimeout => {
                info!(key = %key, call_id = %entry.call_id, "reliable provisional response not acknowledged");
                self.inner
                    .listener
                    .on_timeout(TimeoutEvent {
                        source,
                        kind: TimeoutKind::ReliableProvisional,
                        call_id: Some(entry.call_id.clone()),
                    })
                    .await;
            }
            TerminationReason::TransportError(error) => {
                warn!(key = %key, call_id = %entry.call_id, %error, "transaction failed on transport");
                self.inner
                    .listener
                    .on_transport_error(TransportErrorEvent::new(source, error.reason(), channel))
                    .await;
            }
        }

        let termination = Termination {
            reason,
            request: entry.request.clone(),
            channel,
        };
        entry.tu.on_terminated(key, &termination).await;
    }
}

/// Handle given to the layer that owns a server transaction.
#[derive(Clone)]
pub struct ServerTransactionHandle {
    manager: TransactionManager,
    key: TransactionKey,
    cancel_target: Option<TransactionKey>,
}

impl ServerTransactionHandle {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    /// For a CANCEL, the transaction it cancels (same branch and sent-by).
    pub fn cancel_target(&self) -> Option<&TransactionKey> {
        self.cancel_target.as_ref()
    }

    pub fn state(&self) -> Option<TransactionState> {
        self.manager.state(&self.key)
    }

    pub async fn send_provisional(&self, response: Response) -> Result<(), TransactionError> {
        if !response.is_provisional() {
            return Err(TransactionError::Internal(format!(
                "{} is not a provisional response",
                response.code()
            )));
        }
        self.manager.send_response(&self.key, response).await
    }

    pub async fn send_final(&self, response: Response) -> Result<(), TransactionError> {
        if !response.is_final() {
            return Err(TransactionError::Internal(format!(
                "{} is not a final response",
                response.code()
            )));
        }
        self.manager.send_response(&self.key, response).await
    }
}

impl std::fmt::Debug for ServerTransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransactionHandle")
            .field("key", &self.key)
            .field("cancel_target", &self.cancel_target)
            .finish()
    }
}
