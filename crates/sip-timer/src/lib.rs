// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Timer service shared by every transaction and dialog of a stack.
//!
//! Tasks are plain descriptors implementing [`TimerTask`]; they run on the
//! tokio runtime the service was created on, never on the caller's task.
//!
//! Guarantees:
//! - a task cancelled before it fires never fires
//! - cancelling a task that is already running lets that run finish and
//!   stops any further periodic runs
//! - a panic inside [`TimerTask::run`] is caught and logged
//!
//! ```no_run
//! # async fn demo() -> Result<(), sip_timer::TimerError> {
//! use std::time::Duration;
//! use sip_timer::{FnTask, TimerService};
//!
//! let timers = TimerService::new()?;
//! let handle = timers.schedule(FnTask::new("hello", || println!("fired")), Duration::from_millis(500));
//! timers.cancel(handle);
//! # Ok(())
//! # }
//! ```

mod settings;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, trace};

pub use settings::TimerSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error("no tokio runtime available to drive timers")]
    NoRuntime,
    #[error("timer settings cannot change after the first timer was scheduled")]
    AlreadyStarted,
    #[error("invalid timer settings: {0}")]
    InvalidSettings(&'static str),
}

/// A unit of work fired by the [`TimerService`].
///
/// `run` executes on a timer worker; it must not block on I/O. Tasks that
/// need to touch a transaction or dialog should only enqueue an event keyed
/// by that object's id.
pub trait TimerTask: Send + Sync + 'static {
    /// Short name used in logs (e.g. `"timer-A"`).
    fn name(&self) -> &str;

    /// Call-ID (or other id) used to correlate log lines.
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    fn run(&self);
}

/// Adapts a closure into a [`TimerTask`].
pub struct FnTask<F> {
    name: SmolStr,
    correlation: Option<SmolStr>,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn() + Send + Sync + 'static,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: SmolStr::new(name),
            correlation: None,
            f,
        }
    }

    pub fn with_correlation(mut self, id: &str) -> Self {
        self.correlation = Some(SmolStr::new(id));
        self
    }
}

impl<F> TimerTask for FnTask<F>
where
    F: Fn() + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation.as_deref()
    }

    fn run(&self) {
        (self.f)()
    }
}

/// Opaque handle returned by `schedule*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Running,
    Cancelled,
}

struct Slot {
    state: Mutex<SlotState>,
    wake: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Waiting),
            wake: Notify::new(),
        }
    }

    /// Moves Waiting -> Running; false when the slot was cancelled.
    fn begin_run(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SlotState::Cancelled {
            return false;
        }
        *state = SlotState::Running;
        true
    }

    /// Moves Running -> Waiting for the next period; false if cancelled
    /// while the run was in progress.
    fn end_run(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SlotState::Cancelled {
            return false;
        }
        *state = SlotState::Waiting;
        true
    }
}

struct Inner {
    runtime: Handle,
    slots: DashMap<TimerHandle, Arc<Slot>>,
    next_id: AtomicU64,
    started: AtomicBool,
    settings: RwLock<TimerSettings>,
}

/// Cancelable delayed and fixed-delay task executor.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("pending", &self.pending())
            .field("settings", &self.settings())
            .finish()
    }
}

impl TimerService {
    /// Creates a service on the current tokio runtime with RFC default timers.
    pub fn new() -> Result<Self, TimerError> {
        let runtime = Handle::try_current().map_err(|_| TimerError::NoRuntime)?;
        Ok(Self::with_handle(runtime, TimerSettings::default()))
    }

    /// Creates a service whose tasks run on `runtime`.
    ///
    /// Passing the handle of a runtime separate from the one reading sockets
    /// keeps slow tasks away from transport reads.
    pub fn with_handle(runtime: Handle, settings: TimerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                settings: RwLock::new(settings),
            }),
        }
    }

    pub fn settings(&self) -> TimerSettings {
        *self.inner.settings.read()
    }

    /// Replaces the timer settings. Only allowed before anything was scheduled.
    pub fn update_settings(&self, settings: TimerSettings) -> Result<(), TimerError> {
        settings.validate()?;
        let mut guard = self.inner.settings.write();
        if self.inner.started.load(Ordering::Acquire) {
            return Err(TimerError::AlreadyStarted);
        }
        *guard = settings;
        Ok(())
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<T: TimerTask>(&self, task: T, delay: Duration) -> TimerHandle {
        self.spawn(Arc::new(task), delay, None)
    }

    /// Runs `task` after `initial_delay`, then again `period` after each run
    /// completes, until cancelled.
    pub fn schedule_with_fixed_delay<T: TimerTask>(
        &self,
        task: T,
        initial_delay: Duration,
        period: Duration,
    ) -> TimerHandle {
        self.spawn(Arc::new(task), initial_delay, Some(period))
    }

    /// Cancels a scheduled task.
    ///
    /// Returns true when a pending fire was prevented. Returns false when the
    /// handle is unknown (already fired or cancelled) or the task is running
    /// right now; in the latter case the current run completes and no further
    /// periodic run happens.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let Some((_, slot)) = self.inner.slots.remove(&handle) else {
            return false;
        };
        let prevented = {
            let mut state = slot.state.lock();
            let was = *state;
            *state = SlotState::Cancelled;
            was == SlotState::Waiting
        };
        slot.wake.notify_one();
        prevented
    }

    /// True while the task can still fire.
    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.inner.slots.contains_key(&handle)
    }

    /// Number of tasks that can still fire.
    pub fn pending(&self) -> usize {
        self.inner.slots.len()
    }

    /// Cancels every outstanding task.
    pub fn shutdown(&self) {
        let handles: Vec<TimerHandle> = self.inner.slots.iter().map(|e| *e.key()).collect();
        for handle in handles {
            self.cancel(handle);
        }
    }

    fn spawn(&self, task: Arc<dyn TimerTask>, delay: Duration, period: Option<Duration>) -> TimerHandle {
        self.inner.started.store(true, Ordering::Release);
        let handle = TimerHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(Slot::new());
        self.inner.slots.insert(handle, slot.clone());

        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            let mut wait = delay;
            loop {
                tokio::select! {
                    _ = sleep(wait) => {}
                    _ = slot.wake.notified() => {}
                }
                if !slot.begin_run() {
                    break;
                }
                run_guarded(task.as_ref());
                let Some(period) = period else { break };
                if !slot.end_run() {
                    break;
                }
                wait = period;
            }
            if let Some(inner) = inner.upgrade() {
                inner.slots.remove_if(&handle, |_, s| Arc::ptr_eq(s, &slot));
            }
        });
        trace!(handle = handle.0, ?delay, ?period, "timer scheduled");
        handle
    }
}

fn run_guarded(task: &dyn TimerTask) {
    if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
        error!(
            task = task.name(),
            correlation = task.correlation_id().unwrap_or("-"),
            "timer task panicked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(name: &str, hits: &Arc<AtomicUsize>) -> FnTask<impl Fn() + Send + Sync + 'static> {
        let hits = hits.clone();
        FnTask::new(name, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_after_delay() {
        let timers = TimerService::new().expect("runtime");
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = timers.schedule(counter_task("once", &hits), Duration::from_millis(500));

        sleep(Duration::from_millis(499)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!timers.is_scheduled(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let timers = TimerService::new().expect("runtime");
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = timers.schedule(counter_task("cancel-me", &hits), Duration::from_millis(100));

        assert!(timers.cancel(handle));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(!timers.cancel(handle));
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_repeats_until_cancelled() {
        let timers = TimerService::new().expect("runtime");
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = timers.schedule_with_fixed_delay(
            counter_task("tick", &hits),
            Duration::from_millis(100),
            Duration::from_millis(50),
        );

        sleep(Duration::from_millis(260)).await;
        // fires at 100, 150, 200, 250
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(timers.cancel(handle));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_does_not_kill_the_service() {
        let timers = TimerService::new().expect("runtime");
        timers.schedule(
            FnTask::new("boom", || panic!("task failure")).with_correlation("call-1"),
            Duration::from_millis(10),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        timers.schedule(counter_task("after", &hits), Duration::from_millis(20));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn settings_freeze_after_first_schedule() {
        let timers = TimerService::new().expect("runtime");
        let custom = TimerSettings::scaled(Duration::from_millis(100));
        assert!(timers.update_settings(custom).is_ok());
        assert_eq!(timers.settings().t1_ms, 100);

        let hits = Arc::new(AtomicUsize::new(0));
        timers.schedule(counter_task("x", &hits), Duration::from_millis(1));
        assert_eq!(
            timers.update_settings(TimerSettings::default()),
            Err(TimerError::AlreadyStarted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let timers = TimerService::new().expect("runtime");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            timers.schedule(counter_task("bulk", &hits), Duration::from_millis(10));
        }
        assert_eq!(timers.pending(), 5);
        timers.shutdown();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
