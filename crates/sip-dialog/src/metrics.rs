// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

/// Dialog-level metrics (lifecycle, PRACK, 2xx/1xx retransmissions, timeouts).
#[derive(Debug, Clone, Default)]
pub struct DialogMetrics {
    inner: Arc<RwLock<MetricsData>>,
}

#[derive(Debug, Default)]
struct MetricsData {
    created: u64,
    confirmed: u64,
    terminated: u64,
    prack_events: u64,
    success_retransmissions: u64,
    provisional_retransmissions: u64,
    ack_timeouts: u64,
    reinvites_queued: u64,
    last_updated: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct DialogMetricsSnapshot {
    pub created: u64,
    pub confirmed: u64,
    pub terminated: u64,
    pub prack_events: u64,
    /// 2xx resends while waiting for ACK
    pub success_retransmissions: u64,
    /// Reliable 1xx resends while waiting for PRACK
    pub provisional_retransmissions: u64,
    /// AckNotReceived plus AckNotSent
    pub ack_timeouts: u64,
    pub reinvites_queued: u64,
    pub last_updated: Option<Instant>,
}

impl DialogMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, f: impl FnOnce(&mut MetricsData)) {
        let mut data = self.inner.write();
        f(&mut data);
        data.last_updated = Some(Instant::now());
    }

    pub fn record_created(&self) {
        self.bump(|d| d.created += 1);
    }

    pub fn record_confirmed(&self) {
        self.bump(|d| d.confirmed += 1);
    }

    pub fn record_terminated(&self) {
        self.bump(|d| d.terminated += 1);
    }

    pub fn record_prack(&self) {
        self.bump(|d| d.prack_events += 1);
    }

    pub fn record_success_retransmission(&self) {
        self.bump(|d| d.success_retransmissions += 1);
    }

    pub fn record_provisional_retransmission(&self) {
        self.bump(|d| d.provisional_retransmissions += 1);
    }

    pub fn record_ack_timeout(&self) {
        self.bump(|d| d.ack_timeouts += 1);
    }

    pub fn record_reinvite_queued(&self) {
        self.bump(|d| d.reinvites_queued += 1);
    }

    pub fn snapshot(&self) -> DialogMetricsSnapshot {
        let data = self.inner.read();
        DialogMetricsSnapshot {
            created: data.created,
            confirmed: data.confirmed,
            terminated: data.terminated,
            prack_events: data.prack_events,
            success_retransmissions: data.success_retransmissions,
            provisional_retransmissions: data.provisional_retransmissions,
            ack_timeouts: data.ack_timeouts,
            reinvites_queued: data.reinvites_queued,
            last_updated: data.last_updated,
        }
    }
}
