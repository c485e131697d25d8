// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transport-aware timer calculations per RFC 3261 §17.
//!
//! Retransmission timers only run over unreliable transports. On reliable
//! transports the post-completion waits (D, I, J, K and the 2xx linger M)
//! collapse to zero while the absolute bounds (B, F, H) still apply.
//!
//! | Timer | UDP | reliable |
//! |-------|-----|----------|
//! | A, E, G | T1 (doubling) | not armed |
//! | B, F, H | 64·T1 | 64·T1 |
//! | D | Timer D setting (≥ 32s) | 0 |
//! | I, K | T4 | 0 |
//! | J, M | 64·T1 | 0 |
//!
//! ```
//! use sip_timer::TimerSettings;
//! use sip_transaction::timers::TransportAwareTimers;
//! use sip_transaction::TransactionTimer;
//! use sip_transport::TransportKind;
//! use std::time::Duration;
//!
//! let tcp = TransportAwareTimers::new(TransportKind::Tcp, TimerSettings::default());
//! assert_eq!(tcp.duration(TransactionTimer::K), Duration::ZERO);
//! assert_eq!(tcp.duration(TransactionTimer::F), Duration::from_secs(32));
//! assert!(!tcp.should_retransmit());
//! ```

use std::time::Duration;

use sip_timer::TimerSettings;
use sip_transport::TransportKind;

use crate::TransactionTimer;

/// Transport-aware timer value calculator.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    settings: TimerSettings,
}

impl TransportAwareTimers {
    pub fn new(transport: TransportKind, settings: TimerSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Initial duration of `timer` on this transport.
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        let or_zero = |d: Duration| if reliable { Duration::ZERO } else { d };
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                or_zero(self.settings.t1())
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                self.settings.timeout_bound()
            }
            TransactionTimer::D => or_zero(self.settings.timer_d()),
            TransactionTimer::I | TransactionTimer::K => or_zero(self.settings.t4()),
            TransactionTimer::J | TransactionTimer::M => or_zero(self.settings.timeout_bound()),
        }
    }

    /// Interval after `current` for Timer A: doubles without a cap, Timer B
    /// bounds it.
    pub fn next_a(&self, current: Duration) -> Duration {
        current.saturating_mul(2)
    }

    /// Interval after `current` for Timers E and G: doubles up to T2.
    pub fn next_capped(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.settings.t2())
    }

    pub fn t2(&self) -> Duration {
        self.settings.t2()
    }

    /// Retransmissions are only needed on unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp() -> TransportAwareTimers {
        TransportAwareTimers::new(TransportKind::Udp, TimerSettings::default())
    }

    fn tcp() -> TransportAwareTimers {
        TransportAwareTimers::new(TransportKind::Tcp, TimerSettings::default())
    }

    #[test]
    fn waits_collapse_on_reliable_transport() {
        for timer in [
            TransactionTimer::A,
            TransactionTimer::D,
            TransactionTimer::E,
            TransactionTimer::G,
            TransactionTimer::I,
            TransactionTimer::J,
            TransactionTimer::K,
            TransactionTimer::M,
        ] {
            assert_eq!(tcp().duration(timer), Duration::ZERO, "{timer:?}");
        }
    }

    #[test]
    fn bounds_apply_to_every_transport() {
        for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
            assert_eq!(udp().duration(timer), Duration::from_secs(32));
            assert_eq!(tcp().duration(timer), Duration::from_secs(32));
        }
    }

    #[test]
    fn udp_waits_follow_table_4() {
        let timers = udp();
        assert_eq!(timers.duration(TransactionTimer::D), Duration::from_secs(32));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::I), Duration::from_secs(5));
        assert_eq!(timers.duration(TransactionTimer::J), Duration::from_secs(32));
    }

    #[test]
    fn timer_e_caps_at_t2_but_a_does_not() {
        let timers = udp();
        assert_eq!(timers.next_capped(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(timers.next_capped(Duration::from_secs(4)), Duration::from_secs(4));
        assert_eq!(timers.next_a(Duration::from_secs(4)), Duration::from_secs(8));
    }

    #[test]
    fn scaled_settings_flow_through() {
        let timers = TransportAwareTimers::new(
            TransportKind::Udp,
            TimerSettings::scaled(Duration::from_secs(1)),
        );
        assert_eq!(timers.duration(TransactionTimer::A), Duration::from_secs(1));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(10));
        assert_eq!(timers.duration(TransactionTimer::F), Duration::from_secs(64));
    }
}
