// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use rand::Rng;
use sip_core::{
    split_addr_list, uri_of, DialogId, Headers, Method, Request, RequestLine, Response, MAX_CSEQ,
};
use smol_str::SmolStr;
use tracing::debug;

use crate::prack::PendingReliable;
use crate::DialogError;

/// Dialog state per RFC 3261 §12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogState {
    /// Established by a provisional response carrying a To tag
    Early,
    /// Established by a 2xx response
    Confirmed,
    /// Ended by BYE, a fatal error or deletion; lingering before removal
    Terminated,
}

impl DialogState {
    pub fn as_str(self) -> &'static str {
        match self {
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        }
    }
}

/// Which side of the dialog-creating request we were.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Complete dialog state tracking per RFC 3261 §12.
///
/// This type is pure bookkeeping; timers, sends and the table live in
/// [`DialogManager`](crate::DialogManager).
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub role: DialogRole,
    pub state: DialogState,

    /// Our From (UAC) or To (UAS) header value, tag included
    pub local_party: SmolStr,
    /// The peer's header value, tag included
    pub remote_party: SmolStr,
    /// Remote target URI (Contact of the peer)
    pub remote_target: SmolStr,
    /// Route set, in the order Route headers are to be sent
    pub route_set: Vec<SmolStr>,

    /// Local CSeq number (incremented for each request we send)
    pub local_cseq: u32,
    /// Highest CSeq number received from the peer
    pub remote_cseq: u32,

    /// CSeq of our latest INVITE and the highest one we acknowledged
    pub local_invite: Option<u32>,
    pub local_acked: Option<u32>,
    /// CSeq of the peer's latest INVITE and the highest ACK seen for it
    pub remote_invite: Option<u32>,
    pub remote_acked: Option<u32>,

    next_rseq: u32,
    pending_reliable: Option<PendingReliable>,
}

impl Dialog {
    /// Creates a dialog from the UAC side: `request` was sent by us and
    /// `response` carries the peer's To tag.
    pub fn new_uac(request: &Request, response: &Response) -> Result<Self, DialogError> {
        let id = DialogId::uac(response).ok_or(DialogError::MissingHeader("To tag"))?;
        let state = state_for(response)?;
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;

        let remote_target = response
            .header("Contact")
            .map(|c| SmolStr::new(uri_of(c)))
            .unwrap_or_else(|| SmolStr::new(request.uri()));
        // UAC reverses the Record-Route list of the response
        let mut route_set = record_routes(response.headers());
        route_set.reverse();

        Ok(Self {
            id,
            role: DialogRole::Uac,
            state,
            local_party: SmolStr::new(request.from().unwrap_or_default()),
            remote_party: SmolStr::new(response.to().unwrap_or_default()),
            remote_target,
            route_set,
            local_cseq: cseq.seq,
            remote_cseq: 0,
            local_invite: (cseq.method == Method::Invite).then_some(cseq.seq),
            local_acked: None,
            remote_invite: None,
            remote_acked: None,
            next_rseq: initial_rseq(),
            pending_reliable: None,
        })
    }

    /// Creates a dialog from the UAS side: `request` was received and
    /// `response` is the one we are sending, carrying our To tag.
    pub fn new_uas(request: &Request, response: &Response) -> Result<Self, DialogError> {
        let id = DialogId::uas(response).ok_or(DialogError::MissingHeader("To tag"))?;
        let state = state_for(response)?;
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;

        let remote_target = request
            .header("Contact")
            .map(|c| SmolStr::new(uri_of(c)))
            .ok_or(DialogError::MissingHeader("Contact"))?;

        Ok(Self {
            id,
            role: DialogRole::Uas,
            state,
            local_party: SmolStr::new(response.to().unwrap_or_default()),
            remote_party: SmolStr::new(request.from().unwrap_or_default()),
            remote_target,
            route_set: record_routes(request.headers()),
            local_cseq: 0,
            remote_cseq: cseq.seq,
            local_invite: None,
            local_acked: None,
            remote_invite: (cseq.method == Method::Invite).then_some(cseq.seq),
            remote_acked: None,
            next_rseq: initial_rseq(),
            pending_reliable: None,
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Transitions from Early to Confirmed.
    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    /// Returns true when the dialog was not already terminated.
    pub fn terminate(&mut self) -> bool {
        let changed = self.state != DialogState::Terminated;
        self.state = DialogState::Terminated;
        self.pending_reliable = None;
        changed
    }

    /// True when every INVITE of this dialog, in both directions, has been
    /// acknowledged.
    pub fn is_ack_seen(&self) -> bool {
        acked(self.local_invite, self.local_acked) && acked(self.remote_invite, self.remote_acked)
    }

    /// Records the ACK we sent for our INVITE `cseq`. Returns false if that
    /// INVITE was already acknowledged.
    pub fn record_local_ack(&mut self, cseq: u32) -> bool {
        advance(&mut self.local_acked, cseq)
    }

    /// Records the peer's ACK for its INVITE `cseq`. Returns false for a
    /// stale or duplicate ACK.
    pub fn record_remote_ack(&mut self, cseq: u32) -> bool {
        advance(&mut self.remote_acked, cseq)
    }

    /// Our INVITE `cseq` was already acknowledged.
    pub fn is_local_acked(&self, cseq: u32) -> bool {
        self.local_acked.is_some_and(|acked| acked >= cseq)
    }

    /// Next CSeq for an outgoing in-dialog request.
    ///
    /// An explicit value higher than the current one becomes the new
    /// baseline; anything else auto-increments.
    pub fn next_local_cseq(&mut self, explicit: Option<u32>) -> Result<u32, DialogError> {
        let next = match explicit {
            Some(seq) if seq > self.local_cseq => seq,
            Some(seq) => {
                debug!(dialog = %self.id, requested = seq, current = self.local_cseq, "explicit CSeq not above current, incrementing");
                self.local_cseq.saturating_add(1)
            }
            None => self.local_cseq.saturating_add(1),
        };
        if next > MAX_CSEQ {
            return Err(DialogError::CSeqExhausted);
        }
        self.local_cseq = next;
        Ok(next)
    }

    /// Validates and records an in-dialog request from the peer.
    ///
    /// ACK and CANCEL reuse the CSeq of their INVITE; every other request
    /// must carry a CSeq above the highest seen.
    pub fn update_from_request(&mut self, request: &Request) -> Result<(), DialogError> {
        let cseq = request.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;
        if cseq.seq == 0 {
            return Err(DialogError::InvalidCSeq {
                received: 0,
                current: self.remote_cseq,
            });
        }
        match request.method() {
            Method::Ack | Method::Cancel => return Ok(()),
            _ => {}
        }
        if self.remote_cseq != 0 && cseq.seq <= self.remote_cseq {
            return Err(DialogError::InvalidCSeq {
                received: cseq.seq,
                current: self.remote_cseq,
            });
        }
        self.remote_cseq = cseq.seq;
        if request.method() == &Method::Invite {
            self.remote_invite = Some(cseq.seq);
        }
        if is_target_refresh(request.method()) {
            if let Some(contact) = request.header("Contact") {
                self.remote_target = SmolStr::new(uri_of(contact));
            }
        }
        Ok(())
    }

    /// Applies a response received for one of our requests.
    pub fn update_from_response(&mut self, response: &Response) -> Result<(), DialogError> {
        // our own requests always carry the local tag in From
        let local = response.from_tag();
        let remote = response.to_tag();
        if local.as_deref() != Some(self.id.local_tag.as_str())
            || remote.as_deref() != Some(self.id.remote_tag.as_str())
        {
            return Err(DialogError::TagMismatch {
                dialog: self.id.clone(),
            });
        }

        if response.is_success() {
            if self.state == DialogState::Early && self.role == DialogRole::Uac {
                let mut routes = record_routes(response.headers());
                routes.reverse();
                self.route_set = routes;
            }
            self.confirm();
            if let Some(contact) = response.header("Contact") {
                self.remote_target = SmolStr::new(uri_of(contact));
            }
        }
        Ok(())
    }

    /// Marks `response` reliable: assigns the next RSeq and stores it as the
    /// single pending reliable provisional response.
    pub fn begin_reliable(
        &mut self,
        response: &mut Response,
    ) -> Result<&PendingReliable, DialogError> {
        if let Some(pending) = &self.pending_reliable {
            return Err(DialogError::ReliableResponsePending { rseq: pending.rseq });
        }
        let cseq = response.cseq().ok_or(DialogError::MissingHeader("CSeq"))?;
        let rseq = self.next_rseq;
        self.next_rseq = self.next_rseq.wrapping_add(1).max(1);
        response.headers_mut().set("RSeq", rseq.to_string());
        Ok(self
            .pending_reliable
            .insert(PendingReliable::new(rseq, cseq, response.clone())))
    }

    pub fn pending_reliable(&self) -> Option<&PendingReliable> {
        self.pending_reliable.as_ref()
    }

    /// Clears the pending reliable response, returning it.
    pub fn clear_reliable(&mut self) -> Option<PendingReliable> {
        self.pending_reliable.take()
    }

    /// Builds an in-dialog request (RFC 3261 §12.2.1.1). `via` is the full
    /// Via value for the new transaction.
    pub fn build_request(
        &self,
        method: Method,
        cseq: u32,
        via: &str,
        extra: &Headers,
        body: Bytes,
    ) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("Max-Forwards", "70");
        headers.push("From", self.local_party.clone());
        headers.push("To", self.remote_party.clone());
        headers.push("Call-ID", self.id.call_id.clone());
        headers.push("CSeq", format!("{} {}", cseq, method.as_str()));
        for route in &self.route_set {
            headers.push("Route", route.clone());
        }
        for header in extra.iter() {
            headers.push(header.name.clone(), header.value.clone());
        }
        Request::new(
            RequestLine::new(method, self.remote_target.clone()),
            headers,
            body,
        )
    }

    /// ACK for the 2xx to INVITE `cseq` (RFC 3261 §13.2.2.4).
    pub fn build_ack(&self, cseq: u32, via: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("Max-Forwards", "70");
        headers.push("From", self.local_party.clone());
        headers.push("To", self.remote_party.clone());
        headers.push("Call-ID", self.id.call_id.clone());
        headers.push("CSeq", format!("{cseq} ACK"));
        for route in &self.route_set {
            headers.push("Route", route.clone());
        }
        Request::new(
            RequestLine::new(Method::Ack, self.remote_target.clone()),
            headers,
            Bytes::new(),
        )
    }
}

fn state_for(response: &Response) -> Result<DialogState, DialogError> {
    match response.code() {
        101..=199 => Ok(DialogState::Early),
        200..=299 => Ok(DialogState::Confirmed),
        code => Err(DialogError::NotDialogCreating { code }),
    }
}

fn record_routes(headers: &Headers) -> Vec<SmolStr> {
    headers
        .get_all("Record-Route")
        .flat_map(|v| split_addr_list(v.as_str()))
        .map(SmolStr::new)
        .collect()
}

fn is_target_refresh(method: &Method) -> bool {
    matches!(method, Method::Invite | Method::Update)
}

fn acked(invite: Option<u32>, acked: Option<u32>) -> bool {
    match invite {
        None => true,
        Some(cseq) => acked.is_some_and(|a| a >= cseq),
    }
}

fn advance(acked: &mut Option<u32>, cseq: u32) -> bool {
    if acked.is_some_and(|a| a >= cseq) {
        return false;
    }
    *acked = Some(cseq);
    true
}

/// First RSeq of a dialog (RFC 3262 §3), uniform over the lower half of
/// 1..2**31 so later increments stay below 2**31.
fn initial_rseq() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_CSEQ / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_testkit::{invite, response_with_tag, RequestBuilder};

    fn uac_dialog() -> Dialog {
        let request = invite("z9hG4bKd1", "dialog-call");
        let mut ok = response_with_tag(&request, 200, "OK", "bob-tag");
        ok.headers_mut().push("Contact", "<sip:bob@192.0.2.20:5060>");
        ok.headers_mut().push("Record-Route", "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>");
        Dialog::new_uac(&request, &ok).expect("dialog")
    }

    #[test]
    fn initial_rseq_stays_in_lower_half() {
        for _ in 0..1000 {
            let rseq = initial_rseq();
            assert!((1..=MAX_CSEQ / 2).contains(&rseq), "rseq {rseq}");
        }
    }

    #[test]
    fn uac_dialog_from_2xx() {
        let dialog = uac_dialog();
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.id, DialogId::new("dialog-call", "1234", "bob-tag"));
        assert_eq!(dialog.remote_target, "sip:bob@192.0.2.20:5060");
        assert_eq!(
            dialog.route_set,
            vec![
                SmolStr::new("<sip:p2.example.com;lr>"),
                SmolStr::new("<sip:p1.example.com;lr>")
            ]
        );
        assert_eq!(dialog.local_cseq, 1);
        assert!(!dialog.is_ack_seen());
    }

    #[test]
    fn error_response_creates_no_dialog() {
        let request = invite("z9hG4bKd2", "no-dialog");
        let busy = response_with_tag(&request, 486, "Busy Here", "t");
        assert!(matches!(
            Dialog::new_uac(&request, &busy),
            Err(DialogError::NotDialogCreating { code: 486 })
        ));
    }

    #[test]
    fn explicit_cseq_raises_baseline() {
        let mut dialog = uac_dialog();
        assert_eq!(dialog.next_local_cseq(None).expect("cseq"), 2);
        assert_eq!(dialog.next_local_cseq(Some(10)).expect("cseq"), 10);
        assert_eq!(dialog.next_local_cseq(Some(5)).expect("cseq"), 11);
        assert_eq!(dialog.next_local_cseq(None).expect("cseq"), 12);
    }

    #[test]
    fn cseq_exhaustion_is_an_error() {
        let mut dialog = uac_dialog();
        dialog.local_cseq = MAX_CSEQ;
        assert!(matches!(
            dialog.next_local_cseq(None),
            Err(DialogError::CSeqExhausted)
        ));
    }

    #[test]
    fn remote_cseq_must_increase() {
        let request = invite("z9hG4bKd3", "uas-call");
        let ringing = response_with_tag(&request, 180, "Ringing", "uas-tag");
        let mut dialog = Dialog::new_uas(&request, &ringing).expect("dialog");
        assert_eq!(dialog.state, DialogState::Early);

        let info = RequestBuilder::new(Method::Info)
            .call_id("uas-call")
            .to_tag("uas-tag")
            .cseq(2)
            .build();
        dialog.update_from_request(&info).expect("in order");
        assert!(matches!(
            dialog.update_from_request(&info),
            Err(DialogError::InvalidCSeq { received: 2, current: 2 })
        ));

        let ack = RequestBuilder::new(Method::Ack)
            .call_id("uas-call")
            .to_tag("uas-tag")
            .cseq(1)
            .build();
        assert!(dialog.update_from_request(&ack).is_ok());
    }

    #[test]
    fn ack_tracking_is_per_direction() {
        let mut dialog = uac_dialog();
        assert!(dialog.record_local_ack(1));
        assert!(!dialog.record_local_ack(1));
        assert!(dialog.is_local_acked(1));
        assert!(dialog.is_ack_seen());

        // a peer re-INVITE with a large CSeq does not acknowledge ours
        dialog.remote_invite = Some(100);
        assert!(!dialog.is_ack_seen());
        assert!(dialog.record_remote_ack(100));
        dialog.local_invite = Some(2);
        assert!(!dialog.is_local_acked(2));
        assert!(!dialog.is_ack_seen());
    }

    #[test]
    fn second_reliable_response_is_refused() {
        let request = invite("z9hG4bKd4", "rel-call");
        let mut first = response_with_tag(&request, 180, "Ringing", "uas");
        let mut dialog = Dialog::new_uas(&request, &first).expect("dialog");

        let rseq = dialog.begin_reliable(&mut first).expect("first").rseq;
        assert_eq!(first.header("RSeq"), Some(rseq.to_string().as_str()));

        let mut second = response_with_tag(&request, 183, "Session Progress", "uas");
        assert!(matches!(
            dialog.begin_reliable(&mut second),
            Err(DialogError::ReliableResponsePending { rseq: pending }) if pending == rseq
        ));

        dialog.clear_reliable();
        let next = dialog.begin_reliable(&mut second).expect("after clear").rseq;
        assert_eq!(next, rseq + 1);
    }

    #[test]
    fn tag_mismatch_is_reported() {
        let mut dialog = uac_dialog();
        let request = invite("z9hG4bKd5", "dialog-call");
        let stray = response_with_tag(&request, 200, "OK", "someone-else");
        assert!(matches!(
            dialog.update_from_response(&stray),
            Err(DialogError::TagMismatch { .. })
        ));
    }

    #[test]
    fn in_dialog_request_uses_route_set_and_target() {
        let dialog = uac_dialog();
        let bye = dialog.build_request(
            Method::Bye,
            2,
            "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKbye",
            &Headers::new(),
            Bytes::new(),
        );
        assert_eq!(bye.uri(), "sip:bob@192.0.2.20:5060");
        assert_eq!(bye.headers().get_all("Route").count(), 2);
        assert_eq!(DialogId::for_outbound(&bye), Some(dialog.id.clone()));
    }
}
