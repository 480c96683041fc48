//! Pause state shared by every queue built from one context.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    courier_config::SendingConfig,
    dashmap::DashMap,
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, gauge, labels, sending as send_metrics};

use crate::error::{Error, Result};

/// Timing knobs shared by all queues of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long an item scheduled during a block waits for a release.
    pub block_retry_window: Duration,
    /// Granularity of block-wait and drain-wait polling.
    pub poll_interval: Duration,
    /// Default time-to-live for idle queues in a registry.
    pub queue_ttl: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            block_retry_window: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            queue_ttl: Duration::from_secs(3600),
        }
    }
}

impl Timing {
    /// Build a timing set, rejecting values a queue cannot poll with.
    pub fn new(
        block_retry_window: Duration,
        poll_interval: Duration,
        queue_ttl: Duration,
    ) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(Error::invalid_config("poll interval must be greater than zero"));
        }
        if block_retry_window < poll_interval {
            return Err(Error::invalid_config(format!(
                "block retry window {block_retry_window:?} is shorter than the poll interval {poll_interval:?}"
            )));
        }
        if queue_ttl.is_zero() {
            return Err(Error::invalid_config("queue ttl must be greater than zero"));
        }
        Ok(Self {
            block_retry_window,
            poll_interval,
            queue_ttl,
        })
    }

    pub fn from_config(config: &SendingConfig) -> Result<Self> {
        Self::new(
            config.block_retry_window(),
            config.poll_interval(),
            config.cache_ttl(),
        )
    }
}

/// Result of a stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Everything pending at the time of the call finished.
    Complete,
    /// The wait window elapsed first. The block stays applied and the
    /// remaining items keep going on their own.
    TimedOut { remaining: usize },
}

impl Drain {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        match self {
            Self::Complete => 0,
            Self::TimedOut { remaining } => *remaining,
        }
    }

    fn merge(self, other: Self) -> Self {
        match self.remaining() + other.remaining() {
            0 if self.is_complete() && other.is_complete() => Self::Complete,
            remaining => Self::TimedOut { remaining },
        }
    }
}

/// Block flag and pending counter of one group.
#[derive(Debug, Default)]
pub(crate) struct GroupState {
    blocked: AtomicBool,
    pending: AtomicUsize,
}

impl GroupState {
    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn increment(&self) -> usize {
        self.pending.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Saturates at zero: a release may have reset the counter while items
    /// were still in flight.
    pub(crate) fn decrement(&self) -> usize {
        let previous = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or_default();
        previous.saturating_sub(1)
    }

    fn reset(&self) {
        self.set_blocked(false);
        self.pending.store(0, Ordering::SeqCst);
    }
}

struct ContextInner {
    global_block: AtomicBool,
    groups: DashMap<String, Arc<GroupState>>,
    timing: Timing,
}

/// Shared pause state: one global block flag plus a block flag and pending
/// counter per group.
///
/// Cheap to clone; all clones observe the same state. Build one per process
/// (or per test) and pass it to every queue and registry.
#[derive(Clone)]
pub struct SendingContext {
    inner: Arc<ContextInner>,
}

impl Default for SendingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SendingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendingContext")
            .field("global_block", &self.is_globally_blocked())
            .field("groups", &self.inner.groups.len())
            .field("timing", &self.inner.timing)
            .finish()
    }
}

impl SendingContext {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timing(Timing::default())
    }

    #[must_use]
    pub fn with_timing(timing: Timing) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                global_block: AtomicBool::new(false),
                groups: DashMap::new(),
                timing,
            }),
        }
    }

    pub fn from_config(config: &SendingConfig) -> Result<Self> {
        Ok(Self::with_timing(Timing::from_config(config)?))
    }

    #[must_use]
    pub fn timing(&self) -> Timing {
        self.inner.timing
    }

    /// State of `group`, created unblocked on first use. An existing block or
    /// counter is never overwritten.
    pub(crate) fn group(&self, group: &str) -> Arc<GroupState> {
        if let Some(state) = self.inner.groups.get(group) {
            return Arc::clone(state.value());
        }
        Arc::clone(
            self.inner
                .groups
                .entry(group.to_string())
                .or_default()
                .value(),
        )
    }

    #[must_use]
    pub fn is_globally_blocked(&self) -> bool {
        self.inner.global_block.load(Ordering::SeqCst)
    }

    /// Whether sending is paused for `group`, either directly or globally.
    #[must_use]
    pub fn is_blocked(&self, group: &str) -> bool {
        self.is_globally_blocked()
            || self
                .inner
                .groups
                .get(group)
                .is_some_and(|state| state.is_blocked())
    }

    /// Items scheduled in `group` that have not finished yet.
    #[must_use]
    pub fn pending(&self, group: &str) -> usize {
        self.inner
            .groups
            .get(group)
            .map_or(0, |state| state.pending())
    }

    /// Block `group` and wait until its pending counter reaches zero or
    /// `timeout` elapses. In-flight sends are never cancelled.
    pub async fn local_stop(&self, group: &str, timeout: Duration) -> Drain {
        let state = self.group(group);
        state.set_blocked(true);

        let pending = state.pending();
        if pending > 0 {
            info!(group, pending, "waiting for pending items");
        }

        if poll_until(timeout, self.timing().poll_interval, || state.pending() == 0).await {
            debug!(group, "group drained");
            return Drain::Complete;
        }

        let remaining = state.pending();
        warn!(group, remaining, "{remaining} item(s) did not finish before the stop timeout");
        #[cfg(feature = "metrics")]
        counter!(send_metrics::DRAIN_TIMEOUTS_TOTAL, labels::GROUP => group.to_string()).increment(1);
        Drain::TimedOut { remaining }
    }

    /// Block every queue and wait for all groups with pending items to drain,
    /// concurrently, each bounded by `timeout`.
    pub async fn global_stop(&self, timeout: Duration) -> Drain {
        self.inner.global_block.store(true, Ordering::SeqCst);

        let pending: Vec<(String, usize)> = self
            .inner
            .groups
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().pending()))
            .filter(|(_, pending)| *pending > 0)
            .collect();
        if pending.is_empty() {
            return Drain::Complete;
        }

        let total: usize = pending.iter().map(|(_, n)| n).sum();
        info!(groups = pending.len(), pending = total, "global stop: waiting for pending items");

        futures::future::join_all(
            pending
                .iter()
                .map(|(group, _)| self.local_stop(group, timeout)),
        )
        .await
        .into_iter()
        .fold(Drain::Complete, Drain::merge)
    }

    /// Lift a block and reset the pending counter of `group`, or of every
    /// group plus the global block when `group` is `None`.
    ///
    /// Instance blocks set by `single_stop` are permanent and stay applied.
    pub fn release_block(&self, group: Option<&str>) {
        match group {
            Some(group) => {
                self.group(group).reset();
                debug!(group, "sending block released");
            },
            None => {
                self.inner.global_block.store(false, Ordering::SeqCst);
                for state in self.inner.groups.iter() {
                    state.value().reset();
                }
                debug!("all sending blocks released");
            },
        }
        #[cfg(feature = "metrics")]
        for entry in self.inner.groups.iter() {
            if group.is_none_or(|g| g == entry.key().as_str()) {
                gauge!(send_metrics::PENDING, labels::GROUP => entry.key().clone()).set(0.0);
            }
        }
    }
}

/// Poll `done` every `interval` until it holds or `timeout` elapses.
///
/// Returns whether `done` held. The condition is checked before the first
/// sleep, so a zero timeout still observes an already-satisfied condition.
pub(crate) async fn poll_until(
    timeout: Duration,
    interval: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
