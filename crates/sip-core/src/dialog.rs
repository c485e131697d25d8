// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

use crate::msg::{Request, Response};

/// Dialog identifier: Call-ID plus the local and remote tags (RFC 3261 §12).
///
/// The tags are always stored from this side's point of view, so a UAC's
/// local tag is the From tag while a UAS's local tag is the To tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Id as seen by the UAC for a response it received.
    pub fn uac(response: &Response) -> Option<Self> {
        Some(Self::new(
            response.call_id()?,
            response.from_tag()?,
            response.to_tag()?,
        ))
    }

    /// Id as seen by the UAS for a response it is sending.
    pub fn uas(response: &Response) -> Option<Self> {
        Some(Self::new(
            response.call_id()?,
            response.to_tag()?,
            response.from_tag()?,
        ))
    }

    /// Id of the dialog an inbound in-dialog request belongs to.
    pub fn for_inbound(request: &Request) -> Option<Self> {
        Some(Self::new(
            request.call_id()?,
            request.to_tag()?,
            request.from_tag()?,
        ))
    }

    /// Id of the dialog an outbound in-dialog request belongs to.
    pub fn for_outbound(request: &Request) -> Option<Self> {
        Some(Self::new(
            request.call_id()?,
            request.from_tag()?,
            request.to_tag()?,
        ))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{}", self.call_id, self.local_tag, self.remote_tag)
    }
}
