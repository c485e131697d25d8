// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dialog timer tasks.
//!
//! Tasks carry only the dialog id, timer kind and a generation. They are
//! resolved against the dialog table when they fire, so a task outliving its
//! dialog does nothing.

use sip_core::DialogId;
use sip_timer::{TimerSettings, TimerTask};
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::manager::DialogCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DialogTimer {
    /// UAS: resend the 2xx until ACK, bounded by 64·T1 (periodic)
    AckWait,
    /// UAC: the application must send the ACK within 64·T1 (one-shot)
    AckSendDeadline,
    /// UAS: resend the reliable 1xx until PRACK (periodic)
    ProvisionalResend,
    /// A queued re-INVITE waits for the previous INVITE (periodic)
    ReInviteWait,
    /// Removal after termination (one-shot)
    Linger,
}

impl DialogTimer {
    pub fn name(self) -> &'static str {
        match self {
            DialogTimer::AckWait => "dialog-ack-wait",
            DialogTimer::AckSendDeadline => "dialog-ack-send",
            DialogTimer::ProvisionalResend => "dialog-100rel",
            DialogTimer::ReInviteWait => "dialog-reinvite-wait",
            DialogTimer::Linger => "dialog-linger",
        }
    }
}

pub(crate) struct DialogTimerTask {
    pub id: DialogId,
    pub timer: DialogTimer,
    pub generation: u64,
    pub call_id: SmolStr,
    pub cmd_tx: mpsc::UnboundedSender<DialogCommand>,
}

impl TimerTask for DialogTimerTask {
    fn name(&self) -> &str {
        self.timer.name()
    }

    fn correlation_id(&self) -> Option<&str> {
        Some(&self.call_id)
    }

    fn run(&self) {
        let _ = self.cmd_tx.send(DialogCommand::TimerFired {
            id: self.id.clone(),
            timer: self.timer,
            generation: self.generation,
        });
    }
}

/// What a periodic tick asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Fire,
    Expired,
}

/// Exponential backoff counted in base-interval ticks.
///
/// The first fire is T1 ticks after start and the interval doubles after
/// each fire, optionally capped at T2. The schedule expires once the elapsed
/// ticks reach 64·T1.
#[derive(Debug, Clone)]
pub struct Backoff {
    elapsed: u64,
    until_next: u64,
    interval: u64,
    cap: Option<u64>,
    bound: u64,
}

impl Backoff {
    /// Doubling without cap (RFC 3262 reliable provisional resends).
    pub fn uncapped(settings: &TimerSettings) -> Self {
        Self::new(settings, None)
    }

    /// Doubling capped at T2 (RFC 3261 §13.3.1.4 2xx resends).
    pub fn capped(settings: &TimerSettings) -> Self {
        Self::new(settings, Some(settings.t2_ticks()))
    }

    fn new(settings: &TimerSettings, cap: Option<u64>) -> Self {
        let first = settings.t1_ticks();
        Self {
            elapsed: 0,
            until_next: first,
            interval: first,
            cap,
            bound: settings.timeout_ticks().max(1),
        }
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn tick(&mut self) -> Tick {
        self.elapsed += 1;
        if self.elapsed >= self.bound {
            return Tick::Expired;
        }
        self.until_next = self.until_next.saturating_sub(1);
        if self.until_next > 0 {
            return Tick::Idle;
        }
        let doubled = self.interval.saturating_mul(2);
        self.interval = match self.cap {
            Some(cap) => doubled.min(cap),
            None => doubled,
        };
        self.until_next = self.interval;
        Tick::Fire
    }
}
