// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transaction counters.
//!
//! The [`TransactionManager`](crate::TransactionManager) records every start,
//! termination, timer firing and retransmission here. Counters are grouped by
//! transport, method and role and read back through [`MetricsSnapshot`].
//!
//! ```
//! use sip_transaction::metrics::{TransactionMetrics, TransactionOutcome, TransactionRole};
//! use sip_transport::TransportKind;
//! use std::time::Duration;
//!
//! let metrics = TransactionMetrics::new();
//! metrics.record_start(TransportKind::Udp, "INVITE", TransactionRole::Client);
//! metrics.record_complete(
//!     TransportKind::Udp,
//!     "INVITE",
//!     TransactionRole::Client,
//!     TransactionOutcome::Timeout,
//!     Duration::from_secs(32),
//! );
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.outcomes[&TransactionOutcome::Timeout], 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sip_transport::TransportKind;

use crate::fsm::TerminationReason;
use crate::TransactionTimer;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionOutcome {
    Completed,
    /// Timer B, F or H
    Timeout,
    TransportError,
    /// Reliable provisional response never acknowledged
    ProvisionalTimeout,
}

impl From<&TerminationReason> for TransactionOutcome {
    fn from(reason: &TerminationReason) -> Self {
        match reason {
            TerminationReason::Completed => TransactionOutcome::Completed,
            TerminationReason::Timeout(_) => TransactionOutcome::Timeout,
            TerminationReason::TransportError(_) => TransactionOutcome::TransportError,
            TerminationReason::ProvisionalTimeout => TransactionOutcome::ProvisionalTimeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Duration aggregate for one group.
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    pub count: u64,
    pub total: Duration,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

impl DurationStats {
    fn record(&mut self, duration: Duration) {
        self.count += 1;
        self.total += duration;
        self.min = Some(self.min.map_or(duration, |m| m.min(duration)));
        self.max = Some(self.max.map_or(duration, |m| m.max(duration)));
    }

    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            None
        } else {
            Some(self.total / self.count as u32)
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub starts_by_transport: HashMap<TransportKind, u64>,
    pub starts_by_method: HashMap<String, u64>,
    pub starts_by_role: HashMap<TransactionRole, u64>,
    pub durations_by_transport: HashMap<TransportKind, DurationStats>,
    pub durations_by_method: HashMap<String, DurationStats>,
    pub outcomes: HashMap<TransactionOutcome, u64>,
    pub outcomes_by_role: HashMap<(TransactionRole, TransactionOutcome), u64>,
    pub timer_fires: HashMap<TransactionTimer, u64>,
    pub retransmissions: HashMap<TransportKind, u64>,
    pub server_transactions_rejected: u64,
    pub client_transactions_rejected: u64,
}

impl MetricsSnapshot {
    pub fn total_started(&self) -> u64 {
        self.starts_by_role.values().sum()
    }

    pub fn total_retransmissions(&self) -> u64 {
        self.retransmissions.values().sum()
    }
}

/// Thread-safe transaction metrics collector.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetrics {
    data: Arc<RwLock<MetricsSnapshot>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, transport: TransportKind, method: &str, role: TransactionRole) {
        let mut data = self.data.write();
        *data.starts_by_transport.entry(transport).or_insert(0) += 1;
        *data.starts_by_method.entry(method.to_string()).or_insert(0) += 1;
        *data.starts_by_role.entry(role).or_insert(0) += 1;
    }

    pub fn record_complete(
        &self,
        transport: TransportKind,
        method: &str,
        role: TransactionRole,
        outcome: TransactionOutcome,
        duration: Duration,
    ) {
        let mut data = self.data.write();
        data.durations_by_transport
            .entry(transport)
            .or_default()
            .record(duration);
        data.durations_by_method
            .entry(method.to_string())
            .or_default()
            .record(duration);
        *data.outcomes.entry(outcome).or_insert(0) += 1;
        *data.outcomes_by_role.entry((role, outcome)).or_insert(0) += 1;
    }

    pub fn record_timer_fired(&self, timer: TransactionTimer) {
        *self.data.write().timer_fires.entry(timer).or_insert(0) += 1;
    }

    pub fn record_retransmission(&self, transport: TransportKind) {
        *self.data.write().retransmissions.entry(transport).or_insert(0) += 1;
    }

    /// An inbound request refused because the server table is full.
    pub fn record_server_transaction_rejected(&self) {
        self.data.write().server_transactions_rejected += 1;
    }

    pub fn record_client_transaction_rejected(&self) {
        self.data.write().client_transactions_rejected += 1;
    }

    pub fn timer_fire_count(&self, timer: TransactionTimer) -> u64 {
        self.data.read().timer_fires.get(&timer).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.data.read().clone()
    }

    pub fn reset(&self) {
        *self.data.write() = MetricsSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_aggregate() {
        let metrics = TransactionMetrics::new();
        for ms in [100, 300] {
            metrics.record_complete(
                TransportKind::Tcp,
                "OPTIONS",
                TransactionRole::Client,
                TransactionOutcome::Completed,
                Duration::from_millis(ms),
            );
        }
        let snapshot = metrics.snapshot();
        let stats = &snapshot.durations_by_transport[&TransportKind::Tcp];
        assert_eq!(stats.count, 2);
        assert_eq!(stats.average(), Some(Duration::from_millis(200)));
        assert_eq!(stats.min, Some(Duration::from_millis(100)));
        assert_eq!(
            snapshot.outcomes_by_role[&(TransactionRole::Client, TransactionOutcome::Completed)],
            2
        );
    }

    #[test]
    fn reset_clears_everything() {
        let metrics = TransactionMetrics::new();
        metrics.record_timer_fired(TransactionTimer::A);
        metrics.record_retransmission(TransportKind::Udp);
        metrics.record_server_transaction_rejected();
        assert_eq!(metrics.timer_fire_count(TransactionTimer::A), 1);
        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_retransmissions(), 0);
        assert_eq!(snapshot.server_transactions_rejected, 0);
    }

    #[test]
    fn outcome_from_reason() {
        assert_eq!(
            TransactionOutcome::from(&TerminationReason::Timeout(TransactionTimer::B)),
            TransactionOutcome::Timeout
        );
        assert_eq!(
            TransactionOutcome::from(&TerminationReason::ProvisionalTimeout),
            TransactionOutcome::ProvisionalTimeout
        );
    }
}
