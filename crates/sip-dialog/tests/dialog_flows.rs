// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dialog behaviour driven through the transaction manager on a paused
//! tokio clock: ACK waits, reliable provisionals and re-INVITE ordering.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{DialogId, Headers, Method, Request, Response};
use sip_dialog::{DialogConfig, DialogError, DialogManager, DialogState, Outbound};
use sip_testkit::{invite, prack, response_to, response_with_tag, RecordingChannel, RequestBuilder};
use sip_timer::TimerService;
use sip_transaction::{
    ClientInviteState, Disposition, EventSource, ServerTransactionHandle, SipListener, Termination,
    TimeoutEvent, TimeoutKind, TransactionError, TransactionKey, TransactionLimits,
    TransactionManager, TransactionState, TransactionUser, TransportErrorEvent,
};
use sip_transport::{
    ChannelRegistry, RegistryConfig, SelfRouter, TransportError, TransportErrorReason, TransportKind,
};
use tokio::time::sleep;

#[derive(Default)]
struct RecordingListener {
    timeouts: Mutex<Vec<TimeoutEvent>>,
    transport_errors: Mutex<Vec<TransportErrorEvent>>,
    terminated: Mutex<Vec<DialogId>>,
}

#[async_trait]
impl SipListener for RecordingListener {
    async fn on_timeout(&self, event: TimeoutEvent) {
        self.timeouts.lock().push(event);
    }

    async fn on_transport_error(&self, event: TransportErrorEvent) {
        self.transport_errors.lock().push(event);
    }

    async fn on_dialog_terminated(&self, dialog: DialogId) {
        self.terminated.lock().push(dialog);
    }
}

struct NullTu;

#[async_trait]
impl TransactionUser for NullTu {
    async fn on_response(&self, _key: &TransactionKey, _response: Response) {}

    async fn on_terminated(&self, _key: &TransactionKey, _termination: &Termination) {}
}

struct Harness {
    transactions: TransactionManager,
    dialogs: DialogManager,
    listener: Arc<RecordingListener>,
    channel: RecordingChannel,
    tu: Arc<dyn TransactionUser>,
}

fn harness_with(config: DialogConfig, channel: RecordingChannel) -> Harness {
    sip_testkit::init_tracing();
    let timers = TimerService::new().expect("runtime");
    let channels = ChannelRegistry::new(timers.clone(), RegistryConfig::default());
    let listener = Arc::new(RecordingListener::default());
    let transactions = TransactionManager::new(
        timers.clone(),
        channels,
        SelfRouter::direct(),
        listener.clone(),
        TransactionLimits::default(),
    );
    let dialogs = DialogManager::new(
        transactions.clone(),
        timers,
        SelfRouter::direct(),
        listener.clone(),
        config,
    );
    Harness {
        transactions,
        dialogs,
        listener,
        channel,
        tu: Arc::new(NullTu),
    }
}

fn harness() -> Harness {
    harness_with(DialogConfig::default(), RecordingChannel::udp())
}

impl Harness {
    async fn server(&self, request: &Request) -> ServerTransactionHandle {
        match self
            .transactions
            .receive_request(request, &self.channel.as_channel(), self.tu.clone())
            .await
        {
            Ok(Disposition::New(handle)) => handle,
            _ => panic!("expected a new server transaction"),
        }
    }

    /// Inbound INVITE answered with `code`; returns the UAS dialog.
    async fn answered(&self, request: &Request, response: Response) -> DialogId {
        let handle = self.server(request).await;
        self.dialogs
            .send_response(&handle, request, response, self.tu.clone())
            .await
            .expect("response sent")
            .expect("dialog created")
    }

    /// Outbound INVITE answered 200 by the peer; returns the UAC dialog.
    async fn confirmed_uac(&self, request: &Request) -> (TransactionKey, DialogId) {
        let key = self
            .transactions
            .start_client_transaction(request.clone(), &self.channel.as_channel(), self.tu.clone())
            .await
            .expect("started");
        let ok = response_with_tag(request, 200, "OK", "peer");
        assert!(self.transactions.receive_response(&ok).await);
        let id = self
            .dialogs
            .on_response(&key, &ok, self.tu.clone())
            .await
            .expect("dialog")
            .expect("created");
        (key, id)
    }

    fn count_status(&self, code: u16) -> usize {
        self.channel.sent_statuses().iter().filter(|&&c| c == code).count()
    }
}

fn in_dialog(method: Method, id: &DialogId, cseq: u32, branch: &str) -> Request {
    RequestBuilder::new(method)
        .branch(branch)
        .call_id(&id.call_id)
        .cseq(cseq)
        .from_tag(&id.remote_tag)
        .to_tag(&id.local_tag)
        .build()
}

fn cseq_of(request: &Request) -> u32 {
    request.cseq().expect("CSeq").seq
}

fn last_request(channel: &RecordingChannel) -> Request {
    channel
        .sent()
        .iter()
        .rev()
        .find_map(|s| s.message.as_request().cloned())
        .expect("a request was sent")
}

#[tokio::test(start_paused = true)]
async fn uas_resends_2xx_until_ack() {
    let h = harness();
    let request = invite("z9hG4bKack1", "ack-wait");
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;
    assert_eq!(h.dialogs.state(&id), Some(DialogState::Confirmed));

    // T1, then doubling: 500, 1500, 3500
    sleep(Duration::from_millis(4000)).await;
    assert_eq!(h.count_status(200), 4);

    let ack = in_dialog(Method::Ack, &id, 1, "z9hG4bKack1b");
    assert!(h.dialogs.on_ack(&ack).await);
    assert!(h.dialogs.get(&id).expect("dialog").is_ack_seen());

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.count_status(200), 4);
    assert!(h.listener.timeouts.lock().is_empty());
    assert_eq!(h.dialogs.state(&id), Some(DialogState::Confirmed));
    assert_eq!(h.dialogs.metrics().snapshot().success_retransmissions, 3);
}

#[tokio::test(start_paused = true)]
async fn missing_ack_is_reported_once() {
    let h = harness();
    let request = invite("z9hG4bKack2", "no-ack");
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;

    sleep(Duration::from_secs(40)).await;
    // initial send plus ten resends capped at T2, bounded by 64·T1
    assert_eq!(h.count_status(200), 11);

    let timeouts = h.listener.timeouts.lock().clone();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(timeouts[0].kind, TimeoutKind::AckNotReceived);
    assert_eq!(timeouts[0].source, EventSource::Dialog(id.clone()));
    assert!(!h.dialogs.contains(&id));
    assert_eq!(*h.listener.terminated.lock(), vec![id]);
    assert_eq!(h.dialogs.metrics().snapshot().ack_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn reliable_channel_waits_for_ack_without_resends() {
    let h = harness_with(DialogConfig::default(), RecordingChannel::tcp());
    let request = RequestBuilder::new(Method::Invite)
        .branch("z9hG4bKack3")
        .call_id("tcp-ack")
        .transport(TransportKind::Tcp)
        .build();
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.count_status(200), 1);
    assert_eq!(h.listener.timeouts.lock().len(), 1);
    assert!(!h.dialogs.contains(&id));
}

#[tokio::test(start_paused = true)]
async fn failed_2xx_on_reliable_channel_is_reported_once() {
    let h = harness_with(DialogConfig::default(), RecordingChannel::tcp());
    let request = RequestBuilder::new(Method::Invite)
        .branch("z9hG4bKfail1")
        .call_id("tcp-2xx-fail")
        .transport(TransportKind::Tcp)
        .build();
    let handle = h.server(&request).await;
    h.channel.fail_next(TransportError::ConnectionError("reset".into()));

    let sent = h
        .dialogs
        .send_response(&handle, &request, response_to(&request, 200, "OK"), h.tu.clone())
        .await;
    assert!(matches!(
        sent,
        Err(DialogError::Transaction(TransactionError::Transport(_)))
    ));
    assert!(h.dialogs.is_empty());
    assert_eq!(h.transactions.state(handle.key()), None);
    {
        let errors = h.listener.transport_errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, EventSource::Transaction(handle.key().clone()));
        assert_eq!(errors[0].reason, TransportErrorReason::ConnectionError);
    }

    // no ACK-wait left behind to report a second, unrelated cause
    sleep(Duration::from_secs(40)).await;
    assert!(h.listener.timeouts.lock().is_empty());
    assert_eq!(h.listener.transport_errors.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_2xx_on_datagram_channel_is_reported_once() {
    let h = harness();
    let request = invite("z9hG4bKfail2", "udp-2xx-fail");
    let handle = h.server(&request).await;
    h.channel.fail_next(TransportError::ConnectionError("unreachable".into()));

    let sent = h
        .dialogs
        .send_response(&handle, &request, response_to(&request, 200, "OK"), h.tu.clone())
        .await;
    assert!(sent.is_err());
    assert!(h.dialogs.is_empty());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(h.transactions.state(handle.key()), None);
    assert_eq!(h.listener.transport_errors.lock().len(), 1);

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.count_status(200), 0);
    assert!(h.listener.timeouts.lock().is_empty());
    assert_eq!(h.listener.transport_errors.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn b2bua_sends_bye_when_ack_never_arrives() {
    let config = DialogConfig {
        b2bua: true,
        linger: Duration::from_secs(5),
    };
    let h = harness_with(config, RecordingChannel::udp());
    let request = invite("z9hG4bKack4", "b2bua");
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;

    sleep(Duration::from_millis(32_100)).await;
    assert_eq!(h.listener.timeouts.lock().len(), 1);
    assert_eq!(h.dialogs.state(&id), Some(DialogState::Terminated));
    let bye = last_request(&h.channel);
    assert_eq!(bye.method(), &Method::Bye);
    assert_eq!(bye.to_tag().as_deref(), Some("1234"));

    sleep(Duration::from_secs(6)).await;
    assert!(!h.dialogs.contains(&id));
    assert_eq!(h.listener.terminated.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn prack_stops_provisional_resends() {
    let h = harness();
    let request = invite("z9hG4bKrel1", "rel-call");
    let handle = h.server(&request).await;

    let mut ringing = response_to(&request, 180, "Ringing");
    ringing.headers_mut().push("Require", "100rel");
    let id = h
        .dialogs
        .send_response(&handle, &request, ringing, h.tu.clone())
        .await
        .expect("sent")
        .expect("early dialog");
    assert_eq!(h.dialogs.state(&id), Some(DialogState::Early));
    let rseq = h
        .dialogs
        .get(&id)
        .and_then(|d| d.pending_reliable().map(|p| p.rseq))
        .expect("pending reliable");

    sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.count_status(180), 2);

    let ack_for_ringing = prack("rel-call", 2, &format!("{rseq} 1 INVITE"), "1234", &id.local_tag);
    let prack_handle = h.server(&ack_for_ringing).await;
    h.dialogs
        .on_request(prack_handle.key(), &ack_for_ringing)
        .await
        .expect("PRACK accepted");
    h.dialogs
        .send_response(
            &prack_handle,
            &ack_for_ringing,
            response_to(&ack_for_ringing, 200, "OK"),
            h.tu.clone(),
        )
        .await
        .expect("sent");

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.count_status(180), 2);
    assert!(h.dialogs.get(&id).expect("dialog").pending_reliable().is_none());
    assert_eq!(h.dialogs.metrics().snapshot().prack_events, 1);

    // a second PRACK has nothing to acknowledge
    let late = prack("rel-call", 3, &format!("{rseq} 1 INVITE"), "1234", &id.local_tag);
    let late_handle = h.server(&late).await;
    assert!(matches!(
        h.dialogs.on_request(late_handle.key(), &late).await,
        Err(DialogError::InvalidPrack(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn second_reliable_provisional_is_refused_while_pending() {
    let h = harness();
    let request = invite("z9hG4bKrel2", "rel-two");
    let handle = h.server(&request).await;

    let mut first = response_to(&request, 180, "Ringing");
    first.headers_mut().push("Require", "100rel");
    let id = h
        .dialogs
        .send_response(&handle, &request, first, h.tu.clone())
        .await
        .expect("sent")
        .expect("dialog");

    let mut second = response_with_tag(&request, 183, "Session Progress", &id.local_tag);
    second.headers_mut().push("Require", "100rel");
    assert!(matches!(
        h.dialogs.send_response(&handle, &request, second, h.tu.clone()).await,
        Err(DialogError::ReliableResponsePending { .. })
    ));
    assert_eq!(h.count_status(183), 0);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_provisional_times_out() {
    let h = harness();
    let request = invite("z9hG4bKrel3", "rel-timeout");
    let handle = h.server(&request).await;

    let mut ringing = response_to(&request, 180, "Ringing");
    ringing.headers_mut().push("Require", "100rel");
    let id = h
        .dialogs
        .send_response(&handle, &request, ringing, h.tu.clone())
        .await
        .expect("sent")
        .expect("dialog");

    sleep(Duration::from_secs(40)).await;
    // resends at 0.5, 1.5, 3.5, 7.5, 15.5 and 31.5 seconds
    assert_eq!(h.count_status(180), 7);
    let kinds: Vec<TimeoutKind> = h.listener.timeouts.lock().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TimeoutKind::ReliableProvisional]);
    assert!(!h.dialogs.contains(&id));
}

#[tokio::test(start_paused = true)]
async fn reinvite_waits_for_ack_then_uses_next_cseq() {
    let h = harness();
    let request = invite("z9hG4bKre1", "reinvite");
    let (_, id) = h.confirmed_uac(&request).await;

    let queued = h
        .dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("accepted");
    assert_eq!(queued, Outbound::Queued);
    assert_eq!(h.dialogs.queued_invites(&id), 1);
    assert_eq!(h.channel.sent_methods(), vec![Method::Invite]);

    h.dialogs.send_ack(&id).await.expect("ack");
    assert_eq!(
        h.channel.sent_methods(),
        vec![Method::Invite, Method::Ack, Method::Invite]
    );
    let reinvite = last_request(&h.channel);
    assert_eq!(cseq_of(&reinvite), 2);
    assert_eq!(reinvite.to_tag().as_deref(), Some("peer"));
    assert_eq!(h.dialogs.queued_invites(&id), 0);
}

#[tokio::test(start_paused = true)]
async fn reinvite_waits_for_final_response_and_its_ack() {
    let h = harness();
    let request = invite("z9hG4bKre2", "reinvite-two");
    let (_, id) = h.confirmed_uac(&request).await;
    h.dialogs.send_ack(&id).await.expect("ack");

    let Outbound::Sent(first) = h
        .dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("sent")
    else {
        panic!("first re-INVITE should go out");
    };
    let second = h
        .dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("accepted");
    assert_eq!(second, Outbound::Queued);

    // other methods are not held back
    let info = h
        .dialogs
        .send_request(&id, Method::Info, Headers::new(), Bytes::new(), None)
        .await
        .expect("sent");
    assert!(matches!(info, Outbound::Sent(_)));
    assert_eq!(cseq_of(&last_request(&h.channel)), 3);

    let reinvite = h.transactions.request(&first).expect("in flight");
    h.dialogs
        .on_response(&first, &response_to(&reinvite, 200, "OK"), h.tu.clone())
        .await
        .expect("in dialog");
    assert_eq!(h.dialogs.queued_invites(&id), 1);

    h.dialogs.send_ack(&id).await.expect("ack");
    let next = last_request(&h.channel);
    assert_eq!(next.method(), &Method::Invite);
    assert_eq!(cseq_of(&next), 4);
}

#[tokio::test(start_paused = true)]
async fn queued_reinvite_waits_for_rejected_invite_to_terminate() {
    let h = harness();
    let request = invite("z9hG4bKre3", "reinvite-rejected");
    let (_, id) = h.confirmed_uac(&request).await;
    h.dialogs.send_ack(&id).await.expect("ack");

    let Outbound::Sent(first) = h
        .dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("sent")
    else {
        panic!("first re-INVITE should go out");
    };
    let second = h
        .dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("accepted");
    assert_eq!(second, Outbound::Queued);

    let reinvite = h.transactions.request(&first).expect("in flight");
    let rejected = response_to(&reinvite, 488, "Not Acceptable Here");
    assert!(h.transactions.receive_response(&rejected).await);
    h.dialogs
        .on_response(&first, &rejected, h.tu.clone())
        .await
        .expect("in dialog");

    let invites = |h: &Harness| {
        h.channel
            .sent_methods()
            .iter()
            .filter(|m| **m == Method::Invite)
            .count()
    };
    assert_eq!(
        h.transactions.state(&first),
        Some(TransactionState::ClientInvite(ClientInviteState::Completed))
    );
    assert_eq!(invites(&h), 2);

    // Timer D keeps the rejected INVITE in Completed for 32 seconds
    sleep(Duration::from_secs(31)).await;
    assert_eq!(invites(&h), 2);
    assert_eq!(h.dialogs.queued_invites(&id), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.transactions.state(&first), None);
    assert_eq!(invites(&h), 3);
    assert_eq!(h.dialogs.queued_invites(&id), 0);
    assert_eq!(cseq_of(&last_request(&h.channel)), 3);
    assert!(h.listener.timeouts.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn explicit_cseq_becomes_new_baseline() {
    let h = harness();
    let request = invite("z9hG4bKcs1", "explicit");
    let (_, id) = h.confirmed_uac(&request).await;
    h.dialogs.send_ack(&id).await.expect("ack");

    h.dialogs
        .send_request(&id, Method::Info, Headers::new(), Bytes::new(), Some(50))
        .await
        .expect("sent");
    assert_eq!(cseq_of(&last_request(&h.channel)), 50);
    h.dialogs
        .send_request(&id, Method::Info, Headers::new(), Bytes::new(), None)
        .await
        .expect("sent");
    assert_eq!(cseq_of(&last_request(&h.channel)), 51);
}

#[tokio::test(start_paused = true)]
async fn unsent_ack_is_reported() {
    let h = harness();
    let request = invite("z9hG4bKns1", "no-ack-sent");
    let (_, id) = h.confirmed_uac(&request).await;

    sleep(Duration::from_secs(33)).await;
    let kinds: Vec<TimeoutKind> = h.listener.timeouts.lock().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![TimeoutKind::AckNotSent]);
    assert!(!h.dialogs.contains(&id));
}

#[tokio::test(start_paused = true)]
async fn inbound_reinvite_during_own_reinvite_is_refused() {
    let h = harness();
    let request = invite("z9hG4bKgl1", "glare");
    let (_, id) = h.confirmed_uac(&request).await;
    h.dialogs.send_ack(&id).await.expect("ack");
    h.dialogs
        .send_request(&id, Method::Invite, Headers::new(), Bytes::new(), None)
        .await
        .expect("sent");

    let theirs = in_dialog(Method::Invite, &id, 7, "z9hG4bKgl1b");
    let handle = h.server(&theirs).await;
    assert!(matches!(
        h.dialogs.on_request(handle.key(), &theirs).await,
        Err(DialogError::RequestPending)
    ));
}

#[tokio::test(start_paused = true)]
async fn out_of_order_cseq_and_unknown_dialog_are_rejected() {
    let h = harness();
    let request = invite("z9hG4bKoo1", "order");
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;
    assert!(h.dialogs.on_ack(&in_dialog(Method::Ack, &id, 1, "z9hG4bKoo1a")).await);

    let info = in_dialog(Method::Info, &id, 5, "z9hG4bKoo2");
    let handle = h.server(&info).await;
    h.dialogs.on_request(handle.key(), &info).await.expect("in order");

    let stale = in_dialog(Method::Info, &id, 4, "z9hG4bKoo3");
    let handle = h.server(&stale).await;
    assert!(matches!(
        h.dialogs.on_request(handle.key(), &stale).await,
        Err(DialogError::InvalidCSeq { received: 4, current: 5 })
    ));

    let stranger = DialogId::new("order", "nobody", "1234");
    let lost = in_dialog(Method::Info, &stranger, 9, "z9hG4bKoo4");
    let handle = h.server(&lost).await;
    assert!(matches!(
        h.dialogs.on_request(handle.key(), &lost).await,
        Err(DialogError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn bye_terminates_and_dialog_lingers() {
    let config = DialogConfig {
        b2bua: false,
        linger: Duration::from_secs(2),
    };
    let h = harness_with(config, RecordingChannel::udp());
    let request = invite("z9hG4bKby1", "bye-call");
    let id = h.answered(&request, response_to(&request, 200, "OK")).await;
    assert!(h.dialogs.on_ack(&in_dialog(Method::Ack, &id, 1, "z9hG4bKby1a")).await);

    let bye = in_dialog(Method::Bye, &id, 2, "z9hG4bKby2");
    let handle = h.server(&bye).await;
    h.dialogs.on_request(handle.key(), &bye).await.expect("in dialog");
    h.dialogs
        .send_response(&handle, &bye, response_to(&bye, 200, "OK"), h.tu.clone())
        .await
        .expect("sent");
    assert_eq!(h.dialogs.state(&id), Some(DialogState::Terminated));
    assert_eq!(*h.listener.terminated.lock(), vec![id.clone()]);

    // requests on a terminated dialog are refused
    assert!(matches!(
        h.dialogs
            .send_request(&id, Method::Info, Headers::new(), Bytes::new(), None)
            .await,
        Err(DialogError::InvalidState { .. })
    ));

    sleep(Duration::from_secs(3)).await;
    assert!(!h.dialogs.contains(&id));
    assert_eq!(h.listener.terminated.lock().len(), 1);
}
