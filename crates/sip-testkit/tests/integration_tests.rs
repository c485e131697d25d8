// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use sip_core::{validate_request, Method, SipMessage};
use sip_testkit::{invite, options, prack, response_to, response_with_tag, RecordingChannel, RequestBuilder};
use sip_transport::{TransportChannel, TransportError, TransportKind};

/// Built requests carry every header the inbound validator requires.
#[test]
fn built_requests_validate() {
    for request in [
        options("z9hG4bKv1"),
        invite("z9hG4bKv2", "call-v2"),
        prack("call-v3", 2, "1 1 INVITE", "1234", "bob"),
    ] {
        let len = request.to_bytes().len();
        validate_request(&request, len, 65_535).expect("valid request");
    }
}

#[test]
fn invite_carries_contact_and_transport() {
    let request = RequestBuilder::new(Method::Invite)
        .transport(TransportKind::Tcp)
        .branch("z9hG4bKtcp")
        .build();
    assert!(request.header("Contact").is_some());
    let via = request.top_via().expect("Via");
    assert_eq!(via.transport(), "TCP");
    assert_eq!(via.branch(), Some("z9hG4bKtcp"));
}

#[test]
fn response_with_tag_sets_to_tag_once() {
    let request = invite("z9hG4bKtag", "call-tag");
    let response = response_with_tag(&request, 180, "Ringing", "uas1");
    assert_eq!(response.to_tag().as_deref(), Some("uas1"));
    assert_eq!(response.cseq(), request.cseq());

    let plain = response_to(&request, 100, "Trying");
    assert_eq!(plain.to_tag(), None);
}

#[tokio::test(start_paused = true)]
async fn recording_channel_captures_and_fails() {
    let channel = RecordingChannel::udp();
    let message = SipMessage::Request(options("z9hG4bKrec"));

    channel.send(&message).await.expect("first send");
    channel.fail_next(TransportError::ConnectionError("reset".into()));
    assert!(channel.send(&message).await.is_err());
    channel.send(&message).await.expect("third send");

    assert_eq!(channel.sent_count(), 2);
    assert_eq!(channel.sent_methods(), vec![Method::Options, Method::Options]);

    channel.fail_all(TransportError::Closed);
    assert_eq!(channel.send(&message).await, Err(TransportError::Closed));
    channel.close();
    assert!(channel.is_closed());
}
