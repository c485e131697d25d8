// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Boundary checks applied before a message reaches transaction matching.

use smol_str::SmolStr;
use thiserror::Error;

use crate::msg::{Request, Response};

/// Errors raised while building or admitting a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("invalid SIP status code: {code} (must be 100-699)")]
    InvalidStatusCode { code: u16 },
    #[error("reason phrase too long (max {max}, got {actual})")]
    ReasonTooLong { max: usize, actual: usize },
    #[error("reason phrase contains control characters")]
    InvalidReason,
    #[error("missing mandatory header {0}")]
    MissingHeader(&'static str),
    #[error("malformed {0} header")]
    MalformedHeader(&'static str),
    #[error("CSeq method {cseq} does not match request method {method}")]
    CSeqMethodMismatch { cseq: SmolStr, method: SmolStr },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(SmolStr),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl MessageError {
    /// Final response code used to reject a request failing this check.
    pub fn status_code(&self) -> u16 {
        match self {
            MessageError::UnsupportedVersion(_) => 505,
            MessageError::TooLarge { .. } => 513,
            _ => 400,
        }
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.status_code() {
            505 => "Version Not Supported",
            513 => "Message Too Large",
            _ => "Bad Request",
        }
    }
}

/// Checks an inbound request. `wire_len` is the encoded size the transport
/// saw; anything above `max_size` is rejected with 513.
pub fn validate_request(req: &Request, wire_len: usize, max_size: usize) -> Result<(), MessageError> {
    if wire_len > max_size {
        return Err(MessageError::TooLarge {
            size: wire_len,
            limit: max_size,
        });
    }
    if !req.version().is_supported() {
        return Err(MessageError::UnsupportedVersion(SmolStr::new(
            req.version().as_str(),
        )));
    }
    if req.top_via().is_none() {
        return Err(if req.headers().contains("Via") {
            MessageError::MalformedHeader("Via")
        } else {
            MessageError::MissingHeader("Via")
        });
    }
    check_common(req.from(), req.to(), req.call_id())?;
    let cseq = req
        .cseq()
        .ok_or(if req.headers().contains("CSeq") {
            MessageError::MalformedHeader("CSeq")
        } else {
            MessageError::MissingHeader("CSeq")
        })?;
    if &cseq.method != req.method() {
        return Err(MessageError::CSeqMethodMismatch {
            cseq: SmolStr::new(cseq.method.as_str()),
            method: SmolStr::new(req.method().as_str()),
        });
    }
    Ok(())
}

/// Checks an inbound response; failures are dropped silently by the caller.
pub fn validate_response(
    resp: &Response,
    wire_len: usize,
    max_size: usize,
) -> Result<(), MessageError> {
    if wire_len > max_size {
        return Err(MessageError::TooLarge {
            size: wire_len,
            limit: max_size,
        });
    }
    if !resp.start_line().version().is_supported() {
        return Err(MessageError::UnsupportedVersion(SmolStr::new(
            resp.start_line().version().as_str(),
        )));
    }
    if resp.top_via().is_none() {
        return Err(MessageError::MissingHeader("Via"));
    }
    check_common(resp.from(), resp.to(), resp.call_id())?;
    if resp.cseq().is_none() {
        return Err(MessageError::MissingHeader("CSeq"));
    }
    Ok(())
}

fn check_common(
    from: Option<&str>,
    to: Option<&str>,
    call_id: Option<&str>,
) -> Result<(), MessageError> {
    if from.map(str::trim).unwrap_or("").is_empty() {
        return Err(MessageError::MissingHeader("From"));
    }
    if to.map(str::trim).unwrap_or("").is_empty() {
        return Err(MessageError::MissingHeader("To"));
    }
    if call_id.unwrap_or("").is_empty() {
        return Err(MessageError::MissingHeader("Call-ID"));
    }
    Ok(())
}
