// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stack configuration, loadable from JSON.
//!
//! ```
//! use sip_stack::StackConfig;
//!
//! let config = StackConfig::from_json(r#"{
//!     "timers": { "t1_ms": 250, "base_interval_ms": 250 },
//!     "b2bua": true,
//!     "listening_points": [{ "transport": "udp", "addr": "127.0.0.1:5060" }]
//! }"#).unwrap();
//! assert_eq!(config.timers.t1_ms, 250);
//! assert_eq!(config.timers.t2_ms, 4_000);
//! assert!(config.b2bua);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sip_dialog::DialogConfig;
use sip_timer::{TimerError, TimerSettings};
use sip_transaction::TransactionLimits;
use sip_transport::{ListeningPoint, ListeningPoints, RegistryConfig, TransportKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    #[error("{0} must be positive")]
    NotPositive(&'static str),
}

/// One address the stack receives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningPointConfig {
    /// `udp`, `tcp`, `tls`, `ws`, `wss` or `sctp`
    pub transport: String,
    pub addr: SocketAddr,
    /// Via sent-by to advertise instead of `addr` (e.g. a public name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_by: Option<String>,
}

/// Everything the stack needs at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub timers: TimerSettings,
    /// Send BYE instead of silently deleting a dialog whose ACK timed out
    pub b2bua: bool,
    /// Add `rport` to every inbound top Via, even when the client did not ask
    pub patch_rport: bool,
    pub dialog_linger_ms: u64,
    /// Minimum time a reliable channel outlives its last transaction
    pub transaction_linger_ms: u64,
    /// Requests larger than this are answered 513
    pub max_message_size: usize,
    /// Idle time before an unused reliable channel is closed
    pub channel_linger_ms: u64,
    /// CRLF keep-alive period on reliable channels; absent disables it
    pub keepalive_interval_ms: Option<u64>,
    pub keepalive_timeout_ms: u64,
    pub listening_points: Vec<ListeningPointConfig>,
    /// Limit applied to the server and the client table each
    pub max_transactions: usize,
    /// Inbound workers; messages of one Call-ID always go to the same one
    pub workers: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            timers: TimerSettings::default(),
            b2bua: false,
            patch_rport: false,
            dialog_linger_ms: 32_000,
            transaction_linger_ms: 0,
            max_message_size: 65_535,
            channel_linger_ms: 8_000,
            keepalive_interval_ms: None,
            keepalive_timeout_ms: 10_000,
            listening_points: Vec::new(),
            max_transactions: 10_000,
            workers: 4,
        }
    }
}

impl StackConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading stack config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("parsing stack config {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timers.validate()?;
        if self.max_message_size == 0 {
            return Err(ConfigError::NotPositive("max_message_size"));
        }
        if self.max_transactions == 0 {
            return Err(ConfigError::NotPositive("max_transactions"));
        }
        if self.workers == 0 {
            return Err(ConfigError::NotPositive("workers"));
        }
        for point in &self.listening_points {
            transport_kind(&point.transport)?;
        }
        Ok(())
    }

    pub fn dialog_config(&self) -> DialogConfig {
        DialogConfig {
            b2bua: self.b2bua,
            linger: Duration::from_millis(self.dialog_linger_ms),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            linger: Duration::from_millis(self.channel_linger_ms.max(self.transaction_linger_ms)),
            keepalive_interval: self.keepalive_interval_ms.map(Duration::from_millis),
            keepalive_timeout: Duration::from_millis(self.keepalive_timeout_ms),
        }
    }

    pub fn transaction_limits(&self) -> TransactionLimits {
        TransactionLimits::uniform(self.max_transactions)
    }

    pub fn listening_points(&self) -> Result<Arc<ListeningPoints>, ConfigError> {
        let points = self
            .listening_points
            .iter()
            .map(|p| {
                let point = ListeningPoint::new(transport_kind(&p.transport)?, p.addr);
                Ok(match &p.sent_by {
                    Some(sent_by) => point.with_sent_by(sent_by),
                    None => point,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Arc::new(ListeningPoints::new(points)))
    }
}

fn transport_kind(name: &str) -> Result<TransportKind, ConfigError> {
    TransportKind::parse(name).ok_or_else(|| ConfigError::UnknownTransport(name.to_owned()))
}
