// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::{BufMut, Bytes, BytesMut};
use smol_str::SmolStr;

use crate::{
    addr::extract_tag,
    cseq::CSeq,
    headers::Headers,
    method::Method,
    validate::MessageError,
    version::SipVersion,
    via::{split_via_list, ViaHeader},
};

const MAX_REASON_LENGTH: usize = 256;

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SmolStr,
    version: SipVersion,
}

impl RequestLine {
    /// Creates a SIP/2.0 request line.
    pub fn new(method: Method, uri: impl Into<SmolStr>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SipVersion::V2,
        }
    }

    /// Request line carrying the version exactly as received.
    pub fn with_version(method: Method, uri: impl Into<SmolStr>, version: SipVersion) -> Self {
        Self {
            method,
            uri: uri.into(),
            version,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a SIP/2.0 status line, rejecting codes outside 100-699 and
    /// reason phrases with control characters.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        if reason.len() > MAX_REASON_LENGTH {
            return Err(MessageError::ReasonTooLong {
                max: MAX_REASON_LENGTH,
                actual: reason.len(),
            });
        }
        if reason.chars().any(|c| c.is_control() && c != '\t') {
            return Err(MessageError::InvalidReason);
        }
        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn version(&self) -> &SipVersion {
        &self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

macro_rules! header_accessors {
    ($ty:ty) => {
        impl $ty {
            pub fn headers(&self) -> &Headers {
                &self.headers
            }

            pub fn headers_mut(&mut self) -> &mut Headers {
                &mut self.headers
            }

            pub fn body(&self) -> &Bytes {
                &self.body
            }

            /// First value of the named header.
            pub fn header(&self, name: &str) -> Option<&str> {
                self.headers.get(name).map(|v| v.as_str())
            }

            pub fn call_id(&self) -> Option<&str> {
                self.header("Call-ID").map(str::trim)
            }

            pub fn cseq(&self) -> Option<CSeq> {
                self.header("CSeq").and_then(CSeq::parse)
            }

            pub fn from(&self) -> Option<&str> {
                self.header("From")
            }

            pub fn to(&self) -> Option<&str> {
                self.header("To")
            }

            pub fn from_tag(&self) -> Option<SmolStr> {
                self.from().and_then(extract_tag)
            }

            pub fn to_tag(&self) -> Option<SmolStr> {
                self.to().and_then(extract_tag)
            }

            /// All Via entries top to bottom, flattening comma lists.
            pub fn vias(&self) -> Vec<ViaHeader> {
                self.headers
                    .get_all("Via")
                    .flat_map(|v| split_via_list(v.as_str()))
                    .filter_map(ViaHeader::parse)
                    .collect()
            }

            pub fn top_via(&self) -> Option<ViaHeader> {
                self.headers
                    .get("Via")
                    .and_then(|v| split_via_list(v.as_str()).next())
                    .and_then(ViaHeader::parse)
            }

            /// Branch parameter of the top Via.
            pub fn branch(&self) -> Option<SmolStr> {
                self.top_via()
                    .and_then(|via| via.branch().map(SmolStr::new))
            }

            /// Replaces the topmost Via entry, keeping any entries that shared
            /// its header line.
            pub fn set_top_via(&mut self, via: &ViaHeader) {
                if let Some(value) = self.headers.get_mut("Via") {
                    let rest: Vec<&str> = split_via_list(value.as_str()).skip(1).collect();
                    let mut line = via.to_string();
                    for entry in rest {
                        line.push_str(", ");
                        line.push_str(entry);
                    }
                    *value = SmolStr::new(line);
                } else {
                    self.headers.push("Via", via.to_string());
                }
            }

            fn encode_headers(&self, buf: &mut BytesMut) {
                let mut has_length = false;
                for header in &self.headers {
                    if header.name.eq_ignore_ascii_case("Content-Length")
                        || header.name.eq_ignore_ascii_case("l")
                    {
                        has_length = true;
                        buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
                        continue;
                    }
                    buf.put_slice(header.name.as_bytes());
                    buf.put_slice(b": ");
                    buf.put_slice(header.value.as_bytes());
                    buf.put_slice(b"\r\n");
                }
                if !has_length {
                    buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
                }
                buf.put_slice(b"\r\n");
                buf.put_slice(&self.body);
            }
        }
    };
}

/// In-memory SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

header_accessors!(Request);

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &str {
        self.start.uri()
    }

    pub fn version(&self) -> &SipVersion {
        self.start.version()
    }

    /// Encodes the request, rewriting Content-Length to match the body.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(
            format!(
                "{} {} {}\r\n",
                self.start.method, self.start.uri, self.start.version
            )
            .as_bytes(),
        );
        self.encode_headers(&mut buf);
        buf.freeze()
    }
}

/// In-memory SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

header_accessors!(Response);

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a response to `request` copying Via, From, To, Call-ID and
    /// CSeq as RFC 3261 §8.2.6.2 requires.
    pub fn for_request(code: u16, reason: &str, request: &Request) -> Result<Self, MessageError> {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        Ok(Self::new(StatusLine::new(code, reason)?, headers, Bytes::new()))
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Any final response (2xx-6xx).
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512 + self.body.len());
        buf.put_slice(
            format!(
                "{} {} {}\r\n",
                self.start.version, self.start.code, self.start.reason
            )
            .as_bytes(),
        );
        self.encode_headers(&mut buf);
        buf.freeze()
    }
}

/// Either a SIP request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            SipMessage::Request(req) => Some(req),
            SipMessage::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            SipMessage::Request(_) => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => req.headers(),
            SipMessage::Response(resp) => resp.headers(),
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            SipMessage::Request(req) => req.call_id(),
            SipMessage::Response(resp) => resp.call_id(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}
