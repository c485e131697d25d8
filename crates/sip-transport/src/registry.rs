// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use sip_timer::{TimerHandle, TimerService, TimerTask};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ChannelKey, ChannelRef, TransportError};

/// Registry tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long an unused reliable channel stays open before it is closed.
    pub linger: Duration,
    /// CRLF keep-alive period for reliable channels; `None` disables it.
    pub keepalive_interval: Option<Duration>,
    /// Time allowed for a pong before the channel is declared dead.
    pub keepalive_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_secs(8),
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

/// Receives channel-level failures that have no owning transaction.
pub trait ChannelEventSink: Send + Sync + 'static {
    fn on_channel_failure(&self, channel: &ChannelRef, error: &TransportError);
}

struct Entry {
    channel: ChannelRef,
    uses: usize,
    linger: Option<TimerHandle>,
    keepalive: Option<TimerHandle>,
    awaiting_pong_since: Option<Instant>,
    failed: bool,
}

struct RegistryInner {
    entries: DashMap<ChannelKey, Entry>,
    timers: TimerService,
    config: RegistryConfig,
    sink: RwLock<Option<Arc<dyn ChannelEventSink>>>,
}

/// Use-counted table of reliable channels shared by transactions.
///
/// A transaction holds a [`ChannelLease`] for its lifetime. When the last
/// lease is dropped the channel lingers for [`RegistryConfig::linger`] and is
/// closed unless somebody acquired it again in the meantime. Datagram
/// channels are never counted or closed here.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(timers: TimerService, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                timers,
                config,
                sink: RwLock::new(None),
            }),
        }
    }

    pub fn set_event_sink(&self, sink: Arc<dyn ChannelEventSink>) {
        *self.inner.sink.write() = Some(sink);
    }

    /// Starts tracking a reliable channel without taking a use.
    pub fn register(&self, channel: &ChannelRef) -> ChannelKey {
        let key = ChannelKey::of(channel.as_ref());
        if !channel.is_reliable() {
            return key;
        }
        let mut created = false;
        self.inner.entries.entry(key).or_insert_with(|| {
            created = true;
            Entry {
                channel: channel.clone(),
                uses: 0,
                linger: None,
                keepalive: None,
                awaiting_pong_since: None,
                failed: false,
            }
        });
        if created {
            debug!(channel = %key, "channel registered");
            self.start_keepalive(key);
        }
        key
    }

    /// Takes one use of `channel` for the lifetime of the returned lease.
    pub fn acquire(&self, channel: &ChannelRef) -> ChannelLease {
        let key = self.register(channel);
        if !channel.is_reliable() {
            return ChannelLease {
                key,
                channel: channel.clone(),
                registry: None,
            };
        }
        if let Some(mut entry) = self.inner.entries.get_mut(&key) {
            entry.uses += 1;
            if let Some(handle) = entry.linger.take() {
                self.inner.timers.cancel(handle);
            }
        }
        ChannelLease {
            key,
            channel: channel.clone(),
            registry: Some(Arc::downgrade(&self.inner)),
        }
    }

    pub fn use_count(&self, key: &ChannelKey) -> usize {
        self.inner.entries.get(key).map(|e| e.uses).unwrap_or(0)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Records a CRLF pong (RFC 5626 §4.4.1) received on the channel.
    pub fn pong_received(&self, key: &ChannelKey) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.awaiting_pong_since = None;
        }
    }

    /// Closes and forgets a channel regardless of its use count.
    pub fn close(&self, key: &ChannelKey) {
        self.inner.close(key);
    }

    fn start_keepalive(&self, key: ChannelKey) {
        let Some(interval) = self.inner.config.keepalive_interval else {
            return;
        };
        let handle = self.inner.timers.schedule_with_fixed_delay(
            KeepAliveTask {
                registry: Arc::downgrade(&self.inner),
                key,
            },
            interval,
            interval,
        );
        if let Some(mut entry) = self.inner.entries.get_mut(&key) {
            entry.keepalive = Some(handle);
        } else {
            self.inner.timers.cancel(handle);
        }
    }
}

impl RegistryInner {
    fn release(self: &Arc<Self>, key: &ChannelKey) {
        let linger = self.config.linger;
        let close_now = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return;
            };
            entry.uses = entry.uses.saturating_sub(1);
            if entry.uses > 0 {
                return;
            }
            if linger.is_zero() {
                true
            } else {
                let handle = self.timers.schedule(
                    LingerCloseTask {
                        registry: Arc::downgrade(self),
                        key: *key,
                    },
                    linger,
                );
                if let Some(old) = entry.linger.replace(handle) {
                    self.timers.cancel(old);
                }
                false
            }
        };
        if close_now {
            self.close(key);
        }
    }

    fn close_if_idle(&self, key: &ChannelKey) {
        let idle = self
            .entries
            .get(key)
            .map(|e| e.uses == 0)
            .unwrap_or(false);
        if idle {
            debug!(channel = %key, "closing idle channel after linger");
            self.close(key);
        }
    }

    fn close(&self, key: &ChannelKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            for handle in [entry.linger, entry.keepalive].into_iter().flatten() {
                self.timers.cancel(handle);
            }
            entry.channel.close();
        }
    }

    fn keepalive_tick(self: &Arc<Self>, key: ChannelKey) {
        let timeout = self.config.keepalive_timeout;
        let channel = {
            let Some(mut entry) = self.entries.get_mut(&key) else {
                return;
            };
            if entry.failed {
                return;
            }
            match entry.awaiting_pong_since {
                Some(since) if since.elapsed() >= timeout => None,
                Some(_) => return,
                None => {
                    entry.awaiting_pong_since = Some(Instant::now());
                    Some(entry.channel.clone())
                }
            }
        };

        match channel {
            None => self.fail(&key, TransportError::KeepAliveTimeout),
            Some(channel) => {
                let registry = Arc::downgrade(self);
                tokio::spawn(async move {
                    if let Err(err) = channel.send_keepalive().await {
                        warn!(channel = %key, error = %err, "keep-alive send failed");
                        if let Some(registry) = registry.upgrade() {
                            registry.fail(&key, TransportError::KeepAliveTimeout);
                        }
                    }
                });
            }
        }
    }

    /// Reports a channel failure exactly once, then closes the channel.
    fn fail(&self, key: &ChannelKey, error: TransportError) {
        let channel = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return;
            };
            if entry.failed {
                return;
            }
            entry.failed = true;
            entry.channel.clone()
        };
        warn!(channel = %key, error = %error, "channel failed");
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_channel_failure(&channel, &error);
        }
        self.close(key);
    }
}

/// One use of a channel; dropping it releases the use.
pub struct ChannelLease {
    key: ChannelKey,
    channel: ChannelRef,
    registry: Option<Weak<RegistryInner>>,
}

impl ChannelLease {
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn channel(&self) -> &ChannelRef {
        &self.channel
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("key", &self.key)
            .field("counted", &self.registry.is_some())
            .finish()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.release(&self.key);
        }
    }
}

struct LingerCloseTask {
    registry: Weak<RegistryInner>,
    key: ChannelKey,
}

impl TimerTask for LingerCloseTask {
    fn name(&self) -> &str {
        "channel-linger"
    }

    fn run(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.close_if_idle(&self.key);
        }
    }
}

struct KeepAliveTask {
    registry: Weak<RegistryInner>,
    key: ChannelKey,
}

impl TimerTask for KeepAliveTask {
    fn name(&self) -> &str {
        "keep-alive"
    }

    fn run(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.keepalive_tick(self.key);
        }
    }
}
