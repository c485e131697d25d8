// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sans-IO transaction state machines (RFC 3261 §17.1 and §17.2).
//!
//! Each machine consumes an event and returns the [`Action`]s the runtime
//! must carry out. Once a machine reaches `Terminated` its state never
//! changes again; late events are absorbed.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{Headers, Method, Request, RequestLine, Response, SipMessage};
use sip_transport::TransportError;

use crate::error::TransactionError;
use crate::timers::TransportAwareTimers;
use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionState, TransactionTimer,
};

/// Why a transaction left the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal end of life.
    Completed,
    /// Timer B, F or H expired.
    Timeout(TransactionTimer),
    /// A reliable provisional response was never acknowledged.
    ProvisionalTimeout,
    TransportError(TransportError),
}

impl TerminationReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, TerminationReason::Completed)
    }
}

/// Work requested by a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transmit {
        message: SipMessage,
        retransmission: bool,
    },
    /// Pass a response up to the transaction user.
    Deliver(Response),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    /// Remove the transaction and report `reason`.
    Terminate(TerminationReason),
}

/// Inputs of the client machines.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Send(Request),
    Response(Response),
    TimerFired(TransactionTimer),
    TransportError(TransportError),
}

/// Inputs of the server machines. Sending responses goes through the
/// dedicated `send_*` methods because those can be refused.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A retransmission of the request that created the transaction.
    Request(Request),
    Ack(Request),
    /// Resend a reliable provisional response that is still unacknowledged.
    RetransmitProvisional(Response),
    /// The reliable provisional response bound elapsed without PRACK.
    ProvisionalTimeout,
    TimerFired(TransactionTimer),
    TransportError(TransportError),
}

fn transmit(message: impl Into<SipMessage>, retransmission: bool) -> Action {
    Action::Transmit {
        message: message.into(),
        retransmission,
    }
}

/// Builds the ACK for a non-2xx final response (RFC 3261 §17.1.1.3).
///
/// The ACK reuses the INVITE's Request-URI, top Via, Call-ID, From and CSeq
/// number, takes To from the response and copies the Route set.
pub fn build_non_2xx_ack(invite: &Request, response: &Response) -> Request {
    let mut headers = Headers::new();
    if let Some(via) = invite.top_via() {
        headers.push("Via", via.to_string());
    }
    if let Some(max) = invite.header("Max-Forwards") {
        headers.push("Max-Forwards", max);
    }
    if let Some(from) = invite.from() {
        headers.push("From", from);
    }
    if let Some(to) = response.to().or_else(|| invite.to()) {
        headers.push("To", to);
    }
    if let Some(call_id) = invite.call_id() {
        headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = invite.cseq() {
        headers.push("CSeq", format!("{} ACK", cseq.seq));
    }
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    Request::new(
        RequestLine::with_version(Method::Ack, invite.uri(), invite.version().clone()),
        headers,
        Bytes::new(),
    )
}

/// Client INVITE transaction (RFC 3261 Figure 5, with the RFC 6026 2xx linger).
#[derive(Debug)]
pub struct ClientInviteFsm {
    state: ClientInviteState,
    timers: TransportAwareTimers,
    a_interval: Duration,
    invite: Option<Request>,
    ack: Option<Request>,
}

impl ClientInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientInviteState::Calling,
            a_interval: timers.duration(TransactionTimer::A),
            timers,
            invite: None,
            ack: None,
        }
    }

    pub fn state(&self) -> ClientInviteState {
        self.state
    }

    pub fn request(&self) -> Option<&Request> {
        self.invite.as_ref()
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<Action> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling, ClientEvent::Send(invite)) if self.invite.is_none() => {
                self.handle_send(invite)
            }
            (Calling | Proceeding, ClientEvent::Response(resp)) if resp.is_provisional() => {
                self.state = Proceeding;
                vec![
                    Action::Cancel(TransactionTimer::A),
                    Action::Cancel(TransactionTimer::B),
                    Action::Deliver(resp),
                ]
            }
            (Calling | Proceeding, ClientEvent::Response(resp)) if resp.is_success() => {
                self.state = Terminated;
                let mut actions = vec![
                    Action::Cancel(TransactionTimer::A),
                    Action::Cancel(TransactionTimer::B),
                    Action::Deliver(resp),
                ];
                actions.push(self.linger(TransactionTimer::M));
                actions
            }
            // retransmitted 2xx while lingering: the dialog resends its ACK
            (Terminated, ClientEvent::Response(resp)) if resp.is_success() => {
                vec![Action::Deliver(resp)]
            }
            (Calling | Proceeding, ClientEvent::Response(resp)) if resp.is_final() => {
                self.handle_failure_response(resp)
            }
            (Completed, ClientEvent::Response(resp)) if resp.is_final() => match &self.ack {
                Some(ack) => vec![transmit(ack.clone(), true)],
                None => Vec::new(),
            },
            (Calling, ClientEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling, ClientEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    Action::Cancel(TransactionTimer::A),
                    Action::Terminate(TerminationReason::Timeout(TransactionTimer::B)),
                ]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::D)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            (Terminated, ClientEvent::TimerFired(TransactionTimer::M)) => {
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            (Calling | Proceeding | Completed, ClientEvent::TransportError(err)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::TransportError(err))]
            }
            _ => Vec::new(),
        }
    }

    fn handle_send(&mut self, invite: Request) -> Vec<Action> {
        self.invite = Some(invite.clone());
        let mut actions = vec![transmit(invite, false)];
        if self.timers.should_retransmit() {
            actions.push(Action::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    fn handle_timer_a(&mut self) -> Vec<Action> {
        let Some(invite) = &self.invite else {
            return Vec::new();
        };
        let mut actions = vec![transmit(invite.clone(), true)];
        self.a_interval = self.timers.next_a(self.a_interval);
        actions.push(Action::Schedule {
            timer: TransactionTimer::A,
            duration: self.a_interval,
        });
        actions
    }

    fn handle_failure_response(&mut self, resp: Response) -> Vec<Action> {
        self.state = ClientInviteState::Completed;
        let mut actions = vec![
            Action::Cancel(TransactionTimer::A),
            Action::Cancel(TransactionTimer::B),
        ];
        if let Some(invite) = &self.invite {
            let ack = build_non_2xx_ack(invite, &resp);
            actions.push(transmit(ack.clone(), false));
            self.ack = Some(ack);
        }
        actions.push(Action::Deliver(resp));
        if self.timers.duration(TransactionTimer::D).is_zero() {
            self.state = ClientInviteState::Terminated;
            actions.push(Action::Terminate(TerminationReason::Completed));
        } else {
            actions.push(Action::Schedule {
                timer: TransactionTimer::D,
                duration: self.timers.duration(TransactionTimer::D),
            });
        }
        actions
    }

    fn linger(&self, timer: TransactionTimer) -> Action {
        let duration = self.timers.duration(timer);
        if duration.is_zero() {
            Action::Terminate(TerminationReason::Completed)
        } else {
            Action::Schedule { timer, duration }
        }
    }
}

/// Client non-INVITE transaction (RFC 3261 Figure 6).
#[derive(Debug)]
pub struct ClientNonInviteFsm {
    state: ClientNonInviteState,
    timers: TransportAwareTimers,
    e_interval: Duration,
    request: Option<Request>,
}

impl ClientNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            e_interval: timers.duration(TransactionTimer::E),
            timers,
            request: None,
        }
    }

    pub fn state(&self) -> ClientNonInviteState {
        self.state
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn on_event(&mut self, event: ClientEvent) -> Vec<Action> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying, ClientEvent::Send(request)) if self.request.is_none() => {
                self.request = Some(request.clone());
                let mut actions = vec![transmit(request, false)];
                if self.timers.should_retransmit() {
                    actions.push(Action::Schedule {
                        timer: TransactionTimer::E,
                        duration: self.e_interval,
                    });
                }
                actions.push(Action::Schedule {
                    timer: TransactionTimer::F,
                    duration: self.timers.duration(TransactionTimer::F),
                });
                actions
            }
            (Trying | Proceeding, ClientEvent::Response(resp)) if resp.is_provisional() => {
                self.state = Proceeding;
                vec![Action::Deliver(resp)]
            }
            (Trying | Proceeding, ClientEvent::Response(resp)) => {
                self.state = Completed;
                let mut actions = vec![
                    Action::Cancel(TransactionTimer::E),
                    Action::Cancel(TransactionTimer::F),
                    Action::Deliver(resp),
                ];
                let k = self.timers.duration(TransactionTimer::K);
                if k.is_zero() {
                    self.state = Terminated;
                    actions.push(Action::Terminate(TerminationReason::Completed));
                } else {
                    actions.push(Action::Schedule {
                        timer: TransactionTimer::K,
                        duration: k,
                    });
                }
                actions
            }
            (state @ (Trying | Proceeding), ClientEvent::TimerFired(TransactionTimer::E)) => {
                let Some(request) = &self.request else {
                    return Vec::new();
                };
                self.e_interval = if state == Proceeding {
                    self.timers.t2()
                } else {
                    self.timers.next_capped(self.e_interval)
                };
                vec![
                    transmit(request.clone(), true),
                    Action::Schedule {
                        timer: TransactionTimer::E,
                        duration: self.e_interval,
                    },
                ]
            }
            (Trying | Proceeding, ClientEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    Action::Cancel(TransactionTimer::E),
                    Action::Terminate(TerminationReason::Timeout(TransactionTimer::F)),
                ]
            }
            (Completed, ClientEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            (Trying | Proceeding | Completed, ClientEvent::TransportError(err)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::TransportError(err))]
            }
            _ => Vec::new(),
        }
    }
}

/// Server INVITE transaction (RFC 3261 Figure 7).
///
/// After a 2xx the machine is `Terminated` but stays in the table for Timer
/// J so retransmitted INVITEs are absorbed; the 2xx itself is retransmitted
/// by the dialog.
#[derive(Debug)]
pub struct ServerInviteFsm {
    state: ServerInviteState,
    timers: TransportAwareTimers,
    g_interval: Duration,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl ServerInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            g_interval: timers.duration(TransactionTimer::G),
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerInviteState {
        self.state
    }

    pub fn last_final(&self) -> Option<&Response> {
        self.last_final.as_ref()
    }

    pub fn send_provisional(&mut self, resp: Response) -> Result<Vec<Action>, TransactionError> {
        if self.state != ServerInviteState::Proceeding {
            return Err(self.refuse("send provisional"));
        }
        self.last_provisional = Some(resp.clone());
        Ok(vec![transmit(resp, false)])
    }

    pub fn send_final(&mut self, resp: Response) -> Result<Vec<Action>, TransactionError> {
        if self.state != ServerInviteState::Proceeding {
            return Err(self.refuse("send final"));
        }
        self.last_final = Some(resp.clone());
        if resp.is_success() {
            self.state = ServerInviteState::Terminated;
            let j = self.timers.duration(TransactionTimer::J);
            let tail = if j.is_zero() {
                Action::Terminate(TerminationReason::Completed)
            } else {
                Action::Schedule {
                    timer: TransactionTimer::J,
                    duration: j,
                }
            };
            return Ok(vec![transmit(resp, false), tail]);
        }

        self.state = ServerInviteState::Completed;
        let mut actions = vec![transmit(resp, false)];
        if self.timers.should_retransmit() {
            actions.push(Action::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        Ok(actions)
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Action> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerEvent::Request(_)) => match &self.last_provisional {
                Some(resp) => vec![transmit(resp.clone(), true)],
                None => Vec::new(),
            },
            (Completed, ServerEvent::Request(_)) => match &self.last_final {
                Some(resp) => vec![transmit(resp.clone(), true)],
                None => Vec::new(),
            },
            (Proceeding, ServerEvent::RetransmitProvisional(resp)) => {
                self.last_provisional = Some(resp.clone());
                vec![transmit(resp, true)]
            }
            (Proceeding, ServerEvent::ProvisionalTimeout) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::ProvisionalTimeout)]
            }
            (Completed, ServerEvent::Ack(_)) => {
                self.state = Confirmed;
                let mut actions = vec![
                    Action::Cancel(TransactionTimer::G),
                    Action::Cancel(TransactionTimer::H),
                ];
                let i = self.timers.duration(TransactionTimer::I);
                if i.is_zero() {
                    self.state = Terminated;
                    actions.push(Action::Terminate(TerminationReason::Completed));
                } else {
                    actions.push(Action::Schedule {
                        timer: TransactionTimer::I,
                        duration: i,
                    });
                }
                actions
            }
            (Completed, ServerEvent::TimerFired(TransactionTimer::G)) => {
                let Some(resp) = &self.last_final else {
                    return Vec::new();
                };
                self.g_interval = self.timers.next_capped(self.g_interval);
                vec![
                    transmit(resp.clone(), true),
                    Action::Schedule {
                        timer: TransactionTimer::G,
                        duration: self.g_interval,
                    },
                ]
            }
            (Completed, ServerEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    Action::Cancel(TransactionTimer::G),
                    Action::Terminate(TerminationReason::Timeout(TransactionTimer::H)),
                ]
            }
            (Confirmed, ServerEvent::TimerFired(TransactionTimer::I)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            (Terminated, ServerEvent::TimerFired(TransactionTimer::J)) => {
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            // after a 2xx the entry stays in Terminated until Timer J
            (Proceeding | Completed | Confirmed | Terminated, ServerEvent::TransportError(err)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::TransportError(err))]
            }
            _ => Vec::new(),
        }
    }

    fn refuse(&self, operation: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            operation,
            state: TransactionState::ServerInvite(self.state).name(),
        }
    }
}

/// Server non-INVITE transaction (RFC 3261 Figure 8).
#[derive(Debug)]
pub struct ServerNonInviteFsm {
    state: ServerNonInviteState,
    timers: TransportAwareTimers,
    last_provisional: Option<Response>,
    last_final: Option<Response>,
}

impl ServerNonInviteFsm {
    pub fn new(timers: TransportAwareTimers) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            timers,
            last_provisional: None,
            last_final: None,
        }
    }

    pub fn state(&self) -> ServerNonInviteState {
        self.state
    }

    pub fn last_final(&self) -> Option<&Response> {
        self.last_final.as_ref()
    }

    pub fn send_provisional(&mut self, resp: Response) -> Result<Vec<Action>, TransactionError> {
        match self.state {
            ServerNonInviteState::Trying | ServerNonInviteState::Proceeding => {
                self.state = ServerNonInviteState::Proceeding;
                self.last_provisional = Some(resp.clone());
                Ok(vec![transmit(resp, false)])
            }
            _ => Err(self.refuse("send provisional")),
        }
    }

    pub fn send_final(&mut self, resp: Response) -> Result<Vec<Action>, TransactionError> {
        if !matches!(
            self.state,
            ServerNonInviteState::Trying | ServerNonInviteState::Proceeding
        ) {
            return Err(self.refuse("send final"));
        }
        self.state = ServerNonInviteState::Completed;
        self.last_final = Some(resp.clone());
        let mut actions = vec![transmit(resp, false)];
        let j = self.timers.duration(TransactionTimer::J);
        if j.is_zero() {
            self.state = ServerNonInviteState::Terminated;
            actions.push(Action::Terminate(TerminationReason::Completed));
        } else {
            actions.push(Action::Schedule {
                timer: TransactionTimer::J,
                duration: j,
            });
        }
        Ok(actions)
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Action> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Proceeding, ServerEvent::Request(_)) => match &self.last_provisional {
                Some(resp) => vec![transmit(resp.clone(), true)],
                None => Vec::new(),
            },
            (Completed, ServerEvent::Request(_)) => match &self.last_final {
                Some(resp) => vec![transmit(resp.clone(), true)],
                None => Vec::new(),
            },
            (Completed, ServerEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::Completed)]
            }
            (Trying | Proceeding | Completed, ServerEvent::TransportError(err)) => {
                self.state = Terminated;
                vec![Action::Terminate(TerminationReason::TransportError(err))]
            }
            _ => Vec::new(),
        }
    }

    fn refuse(&self, operation: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            operation,
            state: TransactionState::ServerNonInvite(self.state).name(),
        }
    }
}
