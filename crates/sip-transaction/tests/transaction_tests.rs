// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use sip_core::{Method, SipMessage};
use sip_testkit::{invite, options, response_to, response_with_tag, RequestBuilder};
use sip_timer::TimerSettings;
use sip_transaction::fsm::{
    Action, ClientEvent, ClientInviteFsm, ClientNonInviteFsm, ServerEvent, ServerInviteFsm,
    ServerNonInviteFsm, TerminationReason,
};
use sip_transaction::timers::TransportAwareTimers;
use sip_transaction::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionError, TransactionTimer,
};
use sip_transport::{TransportError, TransportKind};

fn udp() -> TransportAwareTimers {
    TransportAwareTimers::new(TransportKind::Udp, TimerSettings::default())
}

fn tcp() -> TransportAwareTimers {
    TransportAwareTimers::new(TransportKind::Tcp, TimerSettings::default())
}

fn scheduled(actions: &[Action], timer: TransactionTimer) -> Option<Duration> {
    actions.iter().find_map(|a| match a {
        Action::Schedule { timer: t, duration } if *t == timer => Some(*duration),
        _ => None,
    })
}

fn transmitted(actions: &[Action]) -> Vec<&SipMessage> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Transmit { message, .. } => Some(message),
            _ => None,
        })
        .collect()
}

fn delivered(actions: &[Action]) -> Vec<u16> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Deliver(resp) => Some(resp.code()),
            _ => None,
        })
        .collect()
}

fn terminated(actions: &[Action]) -> Option<&TerminationReason> {
    actions.iter().find_map(|a| match a {
        Action::Terminate(reason) => Some(reason),
        _ => None,
    })
}

// ==========================
// Client Non-INVITE Tests
// ==========================

#[test]
fn client_non_invite_retransmission_on_timer_e() {
    let mut fsm = ClientNonInviteFsm::new(udp());
    let actions = fsm.on_event(ClientEvent::Send(options("z9hG4bKe1")));
    assert_eq!(transmitted(&actions).len(), 1);
    assert_eq!(scheduled(&actions, TransactionTimer::E), Some(Duration::from_millis(500)));
    assert_eq!(scheduled(&actions, TransactionTimer::F), Some(Duration::from_secs(32)));

    let mut intervals = Vec::new();
    for _ in 0..5 {
        let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
        assert_eq!(transmitted(&actions).len(), 1);
        intervals.push(scheduled(&actions, TransactionTimer::E).expect("E rescheduled"));
    }
    // doubles from T1 and caps at T2
    assert_eq!(
        intervals,
        [1_000, 2_000, 4_000, 4_000, 4_000].map(Duration::from_millis).to_vec()
    );
}

#[test]
fn client_non_invite_proceeding_uses_t2() {
    let request = options("z9hG4bKe2");
    let mut fsm = ClientNonInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(request.clone()));
    let actions = fsm.on_event(ClientEvent::Response(response_to(&request, 100, "Trying")));
    assert_eq!(delivered(&actions), vec![100]);
    assert_eq!(fsm.state(), ClientNonInviteState::Proceeding);

    let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::E));
    assert_eq!(scheduled(&actions, TransactionTimer::E), Some(Duration::from_secs(4)));
}

#[test]
fn client_non_invite_timeout_on_timer_f() {
    let mut fsm = ClientNonInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(options("z9hG4bKf1")));
    let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::F));
    assert_eq!(
        terminated(&actions),
        Some(&TerminationReason::Timeout(TransactionTimer::F))
    );
    assert_eq!(fsm.state(), ClientNonInviteState::Terminated);
}

#[test]
fn client_non_invite_final_on_tcp_terminates_immediately() {
    let request = options("z9hG4bKk0");
    let mut fsm = ClientNonInviteFsm::new(tcp());
    let actions = fsm.on_event(ClientEvent::Send(request.clone()));
    assert_eq!(scheduled(&actions, TransactionTimer::E), None);

    let actions = fsm.on_event(ClientEvent::Response(response_to(&request, 200, "OK")));
    assert_eq!(delivered(&actions), vec![200]);
    assert_eq!(terminated(&actions), Some(&TerminationReason::Completed));
}

#[test]
fn client_non_invite_absorbs_final_retransmission() {
    let request = options("z9hG4bKk1");
    let mut fsm = ClientNonInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(request.clone()));
    let ok = response_to(&request, 200, "OK");
    let actions = fsm.on_event(ClientEvent::Response(ok.clone()));
    assert_eq!(scheduled(&actions, TransactionTimer::K), Some(Duration::from_secs(5)));
    assert!(fsm.on_event(ClientEvent::Response(ok)).is_empty());
}

// ==========================
// Client INVITE Tests
// ==========================

#[test]
fn client_invite_non_2xx_generates_ack() {
    let request = invite("z9hG4bKinv1", "call-ack");
    let mut fsm = ClientInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(request.clone()));

    let busy = response_with_tag(&request, 486, "Busy Here", "callee");
    let actions = fsm.on_event(ClientEvent::Response(busy.clone()));
    assert_eq!(fsm.state(), ClientInviteState::Completed);
    assert_eq!(delivered(&actions), vec![486]);
    assert_eq!(scheduled(&actions, TransactionTimer::D), Some(Duration::from_secs(32)));

    let sent = transmitted(&actions);
    let ack = sent[0].as_request().expect("ACK request");
    assert_eq!(ack.method(), &Method::Ack);
    assert_eq!(ack.branch(), request.branch());
    assert_eq!(ack.to_tag().as_deref(), Some("callee"));
    assert_eq!(ack.cseq().map(|c| c.seq), Some(1));

    // a retransmitted final gets the same ACK again, not a second delivery
    let actions = fsm.on_event(ClientEvent::Response(busy));
    assert!(delivered(&actions).is_empty());
    assert_eq!(transmitted(&actions).len(), 1);
}

#[test]
fn client_invite_2xx_lingers_and_redelivers() {
    let request = invite("z9hG4bKinv2", "call-2xx");
    let mut fsm = ClientInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(request.clone()));

    let ok = response_with_tag(&request, 200, "OK", "callee");
    let actions = fsm.on_event(ClientEvent::Response(ok.clone()));
    assert_eq!(fsm.state(), ClientInviteState::Terminated);
    assert_eq!(delivered(&actions), vec![200]);
    assert!(transmitted(&actions).is_empty(), "2xx ACK belongs to the dialog");
    assert_eq!(scheduled(&actions, TransactionTimer::M), Some(Duration::from_secs(32)));

    let actions = fsm.on_event(ClientEvent::Response(ok));
    assert_eq!(delivered(&actions), vec![200]);

    let actions = fsm.on_event(ClientEvent::TimerFired(TransactionTimer::M));
    assert_eq!(terminated(&actions), Some(&TerminationReason::Completed));
}

#[test]
fn client_invite_provisional_stops_retransmission() {
    let request = invite("z9hG4bKinv3", "call-180");
    let mut fsm = ClientInviteFsm::new(udp());
    fsm.on_event(ClientEvent::Send(request.clone()));
    let actions = fsm.on_event(ClientEvent::Response(response_to(&request, 180, "Ringing")));
    assert!(actions.contains(&Action::Cancel(TransactionTimer::A)));
    assert!(actions.contains(&Action::Cancel(TransactionTimer::B)));
    assert_eq!(fsm.state(), ClientInviteState::Proceeding);
    // a late Timer A is ignored
    assert!(fsm
        .on_event(ClientEvent::TimerFired(TransactionTimer::A))
        .is_empty());
}

#[test]
fn client_invite_transport_error_terminates() {
    let mut fsm = ClientInviteFsm::new(tcp());
    fsm.on_event(ClientEvent::Send(invite("z9hG4bKinv4", "call-err")));
    let error = TransportError::ConnectionFailure("refused".into());
    let actions = fsm.on_event(ClientEvent::TransportError(error.clone()));
    assert_eq!(terminated(&actions), Some(&TerminationReason::TransportError(error)));
}

// ==========================
// Server INVITE Tests
// ==========================

#[test]
fn server_invite_non_2xx_retransmits_until_ack() {
    let request = invite("z9hG4bKsinv1", "call-s1");
    let mut fsm = ServerInviteFsm::new(udp());
    let actions = fsm
        .send_final(response_with_tag(&request, 486, "Busy Here", "uas"))
        .expect("final in Proceeding");
    assert_eq!(fsm.state(), ServerInviteState::Completed);
    assert_eq!(scheduled(&actions, TransactionTimer::G), Some(Duration::from_millis(500)));
    assert_eq!(scheduled(&actions, TransactionTimer::H), Some(Duration::from_secs(32)));

    let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::G));
    assert_eq!(transmitted(&actions).len(), 1);
    assert_eq!(scheduled(&actions, TransactionTimer::G), Some(Duration::from_secs(1)));

    let ack = RequestBuilder::new(Method::Ack).branch("z9hG4bKsinv1").build();
    let actions = fsm.on_event(ServerEvent::Ack(ack));
    assert_eq!(fsm.state(), ServerInviteState::Confirmed);
    assert!(actions.contains(&Action::Cancel(TransactionTimer::G)));
    assert_eq!(scheduled(&actions, TransactionTimer::I), Some(Duration::from_secs(5)));
}

#[test]
fn server_invite_timer_h_is_a_timeout() {
    let request = invite("z9hG4bKsinv2", "call-s2");
    let mut fsm = ServerInviteFsm::new(udp());
    fsm.send_final(response_to(&request, 404, "Not Found"))
        .expect("final");
    let actions = fsm.on_event(ServerEvent::TimerFired(TransactionTimer::H));
    assert_eq!(
        terminated(&actions),
        Some(&TerminationReason::Timeout(TransactionTimer::H))
    );
}

#[test]
fn server_invite_2xx_leaves_retransmission_to_dialog() {
    let request = invite("z9hG4bKsinv3", "call-s3");
    let mut fsm = ServerInviteFsm::new(udp());
    let actions = fsm
        .send_final(response_with_tag(&request, 200, "OK", "uas"))
        .expect("final");
    assert_eq!(fsm.state(), ServerInviteState::Terminated);
    assert_eq!(scheduled(&actions, TransactionTimer::G), None);
    assert_eq!(scheduled(&actions, TransactionTimer::J), Some(Duration::from_secs(32)));

    // retransmitted INVITE is absorbed silently
    assert!(fsm.on_event(ServerEvent::Request(request)).is_empty());
}

#[test]
fn server_invite_duplicate_resends_last_provisional() {
    let request = invite("z9hG4bKsinv4", "call-s4");
    let mut fsm = ServerInviteFsm::new(udp());
    assert!(fsm.on_event(ServerEvent::Request(request.clone())).is_empty());

    fsm.send_provisional(response_to(&request, 180, "Ringing"))
        .expect("provisional");
    let actions = fsm.on_event(ServerEvent::Request(request));
    assert_eq!(transmitted(&actions).len(), 1);
    assert!(matches!(
        &actions[0],
        Action::Transmit { retransmission: true, .. }
    ));
}

#[test]
fn server_invite_refuses_second_final() {
    let request = invite("z9hG4bKsinv5", "call-s5");
    let mut fsm = ServerInviteFsm::new(udp());
    fsm.send_final(response_to(&request, 603, "Decline")).expect("final");
    assert!(matches!(
        fsm.send_final(response_to(&request, 200, "OK")),
        Err(TransactionError::InvalidState { .. })
    ));
    assert!(fsm
        .send_provisional(response_to(&request, 180, "Ringing"))
        .is_err());
}

#[test]
fn server_invite_provisional_timeout() {
    let request = invite("z9hG4bKsinv6", "call-s6");
    let mut fsm = ServerInviteFsm::new(udp());
    fsm.send_provisional(response_to(&request, 183, "Session Progress"))
        .expect("provisional");
    let actions = fsm.on_event(ServerEvent::ProvisionalTimeout);
    assert_eq!(terminated(&actions), Some(&TerminationReason::ProvisionalTimeout));
}

// ==========================
// Server Non-INVITE Tests
// ==========================

#[test]
fn server_non_invite_completed_absorbs_duplicates() {
    let request = options("z9hG4bKsn1");
    let mut fsm = ServerNonInviteFsm::new(udp());
    let actions = fsm.send_final(response_to(&request, 200, "OK")).expect("final");
    assert_eq!(fsm.state(), ServerNonInviteState::Completed);
    assert_eq!(scheduled(&actions, TransactionTimer::J), Some(Duration::from_secs(32)));

    let actions = fsm.on_event(ServerEvent::Request(request));
    let sent = transmitted(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_response().map(|r| r.code()), Some(200));
}

#[test]
fn server_non_invite_tcp_terminates_on_final() {
    let request = options("z9hG4bKsn2");
    let mut fsm = ServerNonInviteFsm::new(tcp());
    fsm.send_provisional(response_to(&request, 100, "Trying"))
        .expect("provisional");
    assert_eq!(fsm.state(), ServerNonInviteState::Proceeding);
    let actions = fsm.send_final(response_to(&request, 200, "OK")).expect("final");
    assert_eq!(terminated(&actions), Some(&TerminationReason::Completed));
    assert_eq!(fsm.state(), ServerNonInviteState::Terminated);
}
