// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// Protocol version carried on the start line.
///
/// Anything other than `SIP/2.0` is kept verbatim so the boundary check can
/// answer it with 505 instead of losing it during parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SipVersion {
    #[default]
    V2,
    Other(SmolStr),
}

impl SipVersion {
    pub fn parse(token: &str) -> Self {
        if token.eq_ignore_ascii_case("SIP/2.0") {
            SipVersion::V2
        } else {
            SipVersion::Other(SmolStr::new(token))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SipVersion::V2 => "SIP/2.0",
            SipVersion::Other(token) => token.as_str(),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, SipVersion::V2)
    }
}

impl fmt::Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
