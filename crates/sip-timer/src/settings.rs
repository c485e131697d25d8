// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TimerError;

/// RFC 3261 timer base values, in milliseconds.
///
/// `base_interval_ms` is the tick the retransmission tasks count in; T1, T2
/// and T4 are converted to ticks by rounding up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub base_interval_ms: u64,
    pub t1_ms: u64,
    pub t2_ms: u64,
    pub t4_ms: u64,
    /// Client INVITE Timer D on unreliable transports (at least 32s).
    pub timer_d_ms: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: 500,
            t1_ms: 500,
            t2_ms: 4_000,
            t4_ms: 5_000,
            timer_d_ms: 32_000,
        }
    }
}

impl TimerSettings {
    /// Settings with every value derived from a custom T1, keeping the RFC
    /// ratios (T2 = 8·T1, T4 = 10·T1, D = 64·T1).
    pub fn scaled(t1: Duration) -> Self {
        let t1_ms = t1.as_millis().max(1) as u64;
        Self {
            base_interval_ms: t1_ms,
            t1_ms,
            t2_ms: t1_ms * 8,
            t4_ms: t1_ms * 10,
            timer_d_ms: t1_ms * 64,
        }
    }

    pub fn validate(&self) -> Result<(), TimerError> {
        if self.base_interval_ms == 0 || self.t1_ms == 0 || self.t2_ms == 0 || self.t4_ms == 0 {
            return Err(TimerError::InvalidSettings("timer values must be positive"));
        }
        if self.t1_ms > self.t2_ms {
            return Err(TimerError::InvalidSettings("T1 must not exceed T2"));
        }
        if self.base_interval_ms > self.t1_ms {
            return Err(TimerError::InvalidSettings(
                "base interval must not exceed T1",
            ));
        }
        Ok(())
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    pub fn t4(&self) -> Duration {
        Duration::from_millis(self.t4_ms)
    }

    pub fn timer_d(&self) -> Duration {
        Duration::from_millis(self.timer_d_ms)
    }

    /// 64·T1, the bound shared by Timers B, F, H, J and the dialog loops.
    pub fn timeout_bound(&self) -> Duration {
        self.t1() * 64
    }

    /// Number of base-interval ticks covering `duration`, rounded up.
    pub fn ticks(&self, duration: Duration) -> u64 {
        let ms = duration.as_millis() as u64;
        ms.div_ceil(self.base_interval_ms)
    }

    pub fn t1_ticks(&self) -> u64 {
        self.ticks(self.t1()).max(1)
    }

    pub fn t2_ticks(&self) -> u64 {
        self.ticks(self.t2()).max(1)
    }

    pub fn timeout_ticks(&self) -> u64 {
        self.ticks(self.timeout_bound())
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        self.base_interval() * ticks as u32
    }
}
