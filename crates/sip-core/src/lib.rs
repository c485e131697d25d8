// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Parsed SIP message model used by the transaction and dialog engines.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`] with accessors
//!   for Via, From, To, CSeq and Call-ID
//! - **Headers**: [`Headers`] container (case-insensitive, compact forms)
//! - **Via**: [`ViaHeader`] with RFC 3581 `received`/`rport` handling
//! - **Validation**: [`validate_request`] / [`validate_response`] boundary checks
//!
//! The grammar itself lives with the transport; this crate only models the
//! result and knows how to encode it back to bytes.
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let mut headers = Headers::new();
//! headers.push("Via", "SIP/2.0/UDP host.example.com;branch=z9hG4bK74bf9");
//! headers.push("CSeq", "1 OPTIONS");
//! let req = Request::new(
//!     RequestLine::new(Method::Options, "sip:bob@example.com"),
//!     headers,
//!     bytes::Bytes::new(),
//! );
//! assert_eq!(req.branch().as_deref(), Some("z9hG4bK74bf9"));
//! ```

pub mod addr;
pub mod cseq;
pub mod dialog;
pub mod headers;
pub mod method;
pub mod msg;
pub mod validate;
pub mod version;
pub mod via;

pub use addr::{extract_tag, split_addr_list, uri_of, with_tag};
pub use cseq::{CSeq, RAck, MAX_CSEQ};
pub use dialog::DialogId;
pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, SipMessage, StatusLine};
pub use validate::{validate_request, validate_response, MessageError};
pub use version::SipVersion;
pub use via::{ViaHeader, MAGIC_COOKIE};
