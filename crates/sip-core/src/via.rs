// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::net::SocketAddr;

use smol_str::SmolStr;

/// RFC 3261 §8.1.1.7 branch prefix.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed representation of a single Via entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    protocol: SmolStr,
    transport: SmolStr,
    sent_by: SmolStr,
    params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl ViaHeader {
    /// Builds a `SIP/2.0/<transport> <sent-by>;branch=<branch>` entry.
    pub fn new(transport: &str, sent_by: &str, branch: &str) -> Self {
        Self {
            protocol: SmolStr::new("SIP/2.0"),
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by),
            params: vec![(SmolStr::new("branch"), Some(SmolStr::new(branch)))],
        }
    }

    /// Parses one Via value (no comma-separated lists).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (head, params) = match value.split_once(';') {
            Some((head, params)) => (head, Some(params)),
            None => (value, None),
        };

        let mut parts = head.split_whitespace();
        let proto = parts.next()?;
        let sent_by: String = parts.collect();
        if sent_by.is_empty() {
            return None;
        }
        let (protocol, transport) = proto.rsplit_once('/')?;
        if !protocol.to_ascii_uppercase().starts_with("SIP/") || transport.is_empty() {
            return None;
        }

        let params = params
            .map(|raw| {
                raw.split(';')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| match p.split_once('=') {
                        Some((k, v)) => (
                            SmolStr::new(k.trim().to_ascii_lowercase()),
                            Some(SmolStr::new(v.trim())),
                        ),
                        None => (SmolStr::new(p.to_ascii_lowercase()), None),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            protocol: SmolStr::new(protocol),
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by),
            params,
        })
    }

    /// Transport token such as `UDP`, `TCP` or `TLS`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// The `host[:port]` the sender claims to have sent from.
    pub fn sent_by(&self) -> &str {
        &self.sent_by
    }

    /// Host part of sent-by, without IPv6 brackets.
    pub fn host(&self) -> &str {
        if let Some(rest) = self.sent_by.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match self.sent_by.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.sent_by,
        }
    }

    pub fn port(&self) -> Option<u16> {
        let tail = if self.sent_by.starts_with('[') {
            self.sent_by.rsplit_once("]:").map(|(_, port)| port)?
        } else {
            self.sent_by.rsplit_once(':').map(|(_, port)| port)?
        };
        tail.parse().ok()
    }

    /// `Some(None)` for a flag parameter, `Some(Some(v))` for `name=v`.
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let value = value.map(SmolStr::new);
        match self
            .params
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(slot) => slot.1 = value,
            None => self.params.push((SmolStr::new(name), value)),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").flatten()
    }

    /// True when the branch carries the RFC 3261 magic cookie.
    pub fn is_rfc3261(&self) -> bool {
        self.branch()
            .map(|b| b.starts_with(MAGIC_COOKIE))
            .unwrap_or(false)
    }

    /// Applies RFC 3581 `received`/`rport` handling for a request that
    /// arrived from `source`.
    ///
    /// `received` is added when the sent-by host differs from the source IP
    /// or when rport is in play. An empty `rport` is filled with the source
    /// port; an explicit `rport=<n>` is left alone. `force_rport` behaves as
    /// if the client had sent an empty `rport`.
    ///
    /// Returns true when the entry was modified.
    pub fn apply_received(&mut self, source: SocketAddr, force_rport: bool) -> bool {
        let source_ip = source.ip().to_string();
        let rport = self.param("rport").map(|v| v.map(str::to_owned));
        let fill_rport = matches!(rport, Some(None)) || (rport.is_none() && force_rport);
        let needs_received = self.host() != source_ip || rport.is_some() || force_rport;

        let mut changed = false;
        if needs_received && self.param("received").flatten() != Some(source_ip.as_str()) {
            self.set_param("received", Some(&source_ip));
            changed = true;
        }
        if fill_rport {
            self.set_param("rport", Some(&source.port().to_string()));
            changed = true;
        }
        changed
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.protocol, self.transport, self.sent_by)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Splits a header value holding a comma-separated Via list.
pub fn split_via_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sent_by_and_params() {
        let via = ViaHeader::parse("SIP/2.0/udp pc33.example.com:5066;branch=z9hG4bK776;rport")
            .expect("via");
        assert_eq!(via.transport(), "UDP");
        assert_eq!(via.host(), "pc33.example.com");
        assert_eq!(via.port(), Some(5066));
        assert_eq!(via.branch(), Some("z9hG4bK776"));
        assert_eq!(via.param("rport"), Some(None));
        assert!(via.is_rfc3261());
    }

    #[test]
    fn ipv6_sent_by() {
        let via = ViaHeader::parse("SIP/2.0/TCP [2001:db8::1]:5070;branch=z9hG4bKx").expect("via");
        assert_eq!(via.host(), "2001:db8::1");
        assert_eq!(via.port(), Some(5070));
    }

    #[test]
    fn rejects_garbage() {
        assert!(ViaHeader::parse("nonsense").is_none());
        assert!(ViaHeader::parse("HTTP/1.1/TCP host").is_none());
    }

    #[test]
    fn received_added_when_host_differs() {
        let mut via = ViaHeader::parse("SIP/2.0/UDP client.example.com;branch=z9hG4bK1").expect("via");
        assert!(via.apply_received("192.0.2.4:5060".parse().expect("addr"), false));
        assert_eq!(via.param("received"), Some(Some("192.0.2.4")));
        assert_eq!(via.param("rport"), None);
    }

    #[test]
    fn empty_rport_is_filled() {
        let mut via = ViaHeader::parse("SIP/2.0/UDP 192.0.2.4:5060;rport;branch=z9hG4bK1").expect("via");
        via.apply_received("192.0.2.4:9988".parse().expect("addr"), false);
        assert_eq!(via.param("rport"), Some(Some("9988")));
        assert_eq!(via.param("received"), Some(Some("192.0.2.4")));
    }

    #[test]
    fn explicit_rport_is_kept_even_when_forced() {
        let mut via =
            ViaHeader::parse("SIP/2.0/UDP 192.0.2.4:5060;rport=7000;branch=z9hG4bK1").expect("via");
        via.apply_received("192.0.2.4:9988".parse().expect("addr"), true);
        assert_eq!(via.param("rport"), Some(Some("7000")));
    }

    #[test]
    fn forced_rport_without_client_request() {
        let mut via = ViaHeader::parse("SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bK1").expect("via");
        assert!(!via.clone().apply_received("192.0.2.4:5060".parse().expect("addr"), false));
        via.apply_received("192.0.2.4:5060".parse().expect("addr"), true);
        assert_eq!(via.param("rport"), Some(Some("5060")));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 192.0.2.4:5060;branch=z9hG4bK1;received=192.0.2.4;rport=5060"
        );
    }
}
