// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// SIP request methods understood by the transaction and dialog layers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Update,
    Message,
    Prack,
    Refer,
    Subscribe,
    Notify,
    Register,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Message => "MESSAGE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Register => "REGISTER",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token; extension methods become `Unknown`.
    ///
    /// Method names are case-sensitive on the wire (RFC 3261 §7.1) but the
    /// stack accepts any casing for the well-known ones.
    pub fn from_token(token: &str) -> Self {
        const KNOWN: [(&str, Method); 13] = [
            ("INVITE", Method::Invite),
            ("ACK", Method::Ack),
            ("BYE", Method::Bye),
            ("CANCEL", Method::Cancel),
            ("OPTIONS", Method::Options),
            ("INFO", Method::Info),
            ("UPDATE", Method::Update),
            ("MESSAGE", Method::Message),
            ("PRACK", Method::Prack),
            ("REFER", Method::Refer),
            ("SUBSCRIBE", Method::Subscribe),
            ("NOTIFY", Method::Notify),
            ("REGISTER", Method::Register),
        ];
        KNOWN
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, method)| method.clone())
            .unwrap_or_else(|| Method::Unknown(SmolStr::new(token)))
    }

    /// Methods that establish a dialog when answered with a tagged 1xx/2xx.
    pub fn is_dialog_creating(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }

    /// INVITE and ACK use the INVITE transaction machinery (or none, for ACK).
    pub fn is_invite(&self) -> bool {
        matches!(self, Method::Invite)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
