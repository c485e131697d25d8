// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3262 reliable provisional responses.
//!
//! A dialog holds at most one [`PendingReliable`] response at a time. A PRACK
//! clears it only when its RAck names exactly that response.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use sip_core::{CSeq, Headers, Method, RAck, Request, Response};

/// The reliable provisional response awaiting PRACK.
#[derive(Debug, Clone)]
pub struct PendingReliable {
    /// RSeq assigned to the response
    pub rseq: u32,
    /// CSeq number of the request being answered
    pub cseq: u32,
    /// Method of the request being answered
    pub method: Method,
    pub response: Response,
    /// Encoded form, kept for resends and size checks
    pub encoded: Bytes,
}

impl PendingReliable {
    pub fn new(rseq: u32, cseq: CSeq, response: Response) -> Self {
        let encoded = response.to_bytes();
        Self {
            rseq,
            cseq: cseq.seq,
            method: cseq.method,
            response,
            encoded,
        }
    }

    pub fn code(&self) -> u16 {
        self.response.code()
    }
}

/// Validates an incoming PRACK against the pending reliable response.
///
/// # Validation Rules (RFC 3262 §4)
///
/// 1. RAck header must be present and well formed
/// 2. RAck RSeq must match the pending response
/// 3. RAck CSeq and method must match the request the response answered
pub fn validate_prack(pending: Option<&PendingReliable>, prack: &Request) -> Result<RAck> {
    let value = prack
        .header("RAck")
        .ok_or_else(|| anyhow!("PRACK missing RAck header"))?;
    let rack = RAck::parse(value)
        .ok_or_else(|| anyhow!("Invalid RAck format: expected 'rseq cseq method', got '{}'", value))?;

    let pending =
        pending.ok_or_else(|| anyhow!("No pending reliable provisional for RAck {}", rack))?;

    if pending.rseq != rack.rseq {
        return Err(anyhow!(
            "RAck RSeq {} does not match pending RSeq {}",
            rack.rseq,
            pending.rseq
        ));
    }
    if pending.cseq != rack.cseq {
        return Err(anyhow!(
            "RAck CSeq {} does not match provisional CSeq {}",
            rack.cseq,
            pending.cseq
        ));
    }
    if pending.method != rack.method {
        return Err(anyhow!(
            "RAck method {} does not match provisional method {}",
            rack.method,
            pending.method
        ));
    }
    Ok(rack)
}

fn has_option_tag(headers: &Headers, header: &str, tag: &str) -> bool {
    headers
        .get_all(header)
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(tag))
}

/// The peer insists on reliable provisional responses.
pub fn requires_100rel(request: &Request) -> bool {
    has_option_tag(request.headers(), "Require", "100rel")
}

/// The peer accepts reliable provisional responses.
pub fn supports_100rel(request: &Request) -> bool {
    requires_100rel(request) || has_option_tag(request.headers(), "Supported", "100rel")
}

/// A 1xx the application wants delivered reliably (`Require: 100rel`).
pub fn wants_reliable(response: &Response) -> bool {
    response.is_provisional()
        && response.code() != 100
        && has_option_tag(response.headers(), "Require", "100rel")
}

/// 1xx other than 100 carrying an RSeq header.
pub fn is_reliable_provisional(response: &Response) -> bool {
    response.is_provisional() && response.code() != 100 && response.header("RSeq").is_some()
}
