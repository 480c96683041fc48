//! Ordered delivery for one destination.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::sync::Notify,
    tokio_util::sync::CancellationToken,
    tracing::{Level, debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, gauge, histogram, labels, sending as send_metrics};

use crate::{
    context::{Drain, GroupState, SendingContext, poll_until},
    error::FailureKind,
    outcome::{self, Outcome, Resolver},
    sender::{AsyncSender, BlockingSender, Deliver, IntoReport, Sender},
};

struct QueueItem<P> {
    id: u64,
    resolver: Resolver,
    /// Whether any block applied when the item was scheduled.
    blocked: bool,
    payload: P,
}

struct QueueState<P> {
    items: VecDeque<QueueItem<P>>,
    /// An item has been popped and is not finished yet.
    busy: bool,
    /// A worker task is alive for this queue.
    worker: bool,
}

struct QueueInner<P> {
    destination: String,
    group: String,
    sender: Arc<dyn Sender<P>>,
    context: SendingContext,
    group_state: Arc<GroupState>,
    instance_block: AtomicBool,
    state: Mutex<QueueState<P>>,
    wake: Arc<Notify>,
    closed: CancellationToken,
    next_id: AtomicU64,
}

/// Sends scheduled payloads for one destination, one at a time, in order.
///
/// The handle is cheap to clone; clones share the same queue. Items are
/// processed by a single worker task that is spawned on the first
/// [`schedule`](Self::schedule) and exits once the queue is empty and either
/// [closed](Self::close) or no longer referenced by any handle.
pub struct DeliveryQueue<P> {
    inner: Arc<QueueInner<P>>,
}

impl<P> Clone for DeliveryQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Debug for DeliveryQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("group", &self.inner.group)
            .field("destination", &self.inner.destination)
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl<P> DeliveryQueue<P> {
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.inner.destination
    }

    #[must_use]
    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Items waiting to be sent, not counting one in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing waiting and nothing in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// Whether [`single_stop`](Self::single_stop) was called on this queue.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.instance_block.load(Ordering::SeqCst)
    }

    /// Whether an item scheduled now would have to wait for a release.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.inner.is_blocked()
    }

    /// Items scheduled in this queue's group that have not finished yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.group_state.pending()
    }

    /// Let the worker exit once the queue runs empty.
    ///
    /// Items already scheduled are still delivered, and scheduling on a
    /// closed queue starts a new worker.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Whether two handles point at the same queue.
    #[must_use]
    pub fn same_queue(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block this queue's group and wait for the group to drain.
    pub async fn local_stop(&self, timeout: Duration) -> Drain {
        self.inner
            .context
            .local_stop(&self.inner.group, timeout)
            .await
    }
}

impl<P> DeliveryQueue<P>
where
    P: Debug + Send + Sync + 'static,
{
    pub fn new(
        context: &SendingContext,
        group: impl Into<String>,
        destination: impl Into<String>,
        sender: Arc<dyn Sender<P>>,
    ) -> Self {
        let group = group.into();
        Self {
            inner: Arc::new(QueueInner {
                destination: destination.into(),
                group_state: context.group(&group),
                group,
                sender,
                context: context.clone(),
                instance_block: AtomicBool::new(false),
                state: Mutex::new(QueueState {
                    items: VecDeque::new(),
                    busy: false,
                    worker: false,
                }),
                wake: Arc::new(Notify::new()),
                closed: CancellationToken::new(),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queue over a synchronous sender, run on tokio's blocking pool.
    pub fn blocking<F, O>(
        context: &SendingContext,
        group: impl Into<String>,
        destination: impl Into<String>,
        func: F,
    ) -> Self
    where
        F: Fn(&P) -> O + Send + Sync + 'static,
        O: IntoReport + 'static,
    {
        Self::new(
            context,
            group,
            destination,
            Arc::new(BlockingSender::<F, O>::new(func)),
        )
    }

    /// Queue over an asynchronous sender.
    pub fn with_async<D>(
        context: &SendingContext,
        group: impl Into<String>,
        destination: impl Into<String>,
        sender: D,
    ) -> Self
    where
        D: Deliver<P>,
    {
        Self::new(context, group, destination, Arc::new(AsyncSender::new(sender)))
    }

    /// Append `payload` and return its [`Outcome`] without waiting.
    ///
    /// If any block applies right now the item waits for a release before it
    /// is sent, even when the block is lifted before the item's turn.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, payload: P) -> Outcome {
        let inner = &self.inner;
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (resolver, outcome) = outcome::pair(id);
        // Count the item before reading the blocks: a concurrent stop either
        // sees it pending or has its block seen here.
        let _pending = inner.group_state.increment();
        let blocked = inner.is_blocked();

        debug!(
            group = %inner.group,
            destination = %inner.destination,
            item = id,
            blocked,
            payload = ?payload,
            "scheduled"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(send_metrics::ITEMS_SCHEDULED_TOTAL, labels::GROUP => inner.group.clone())
                .increment(1);
            gauge!(send_metrics::PENDING, labels::GROUP => inner.group.clone())
                .set(_pending as f64);
        }

        let spawn_worker = {
            let mut state = inner.lock();
            state.items.push_back(QueueItem {
                id,
                resolver,
                blocked,
                payload,
            });
            !std::mem::replace(&mut state.worker, true)
        };

        if spawn_worker {
            tokio::spawn(Arc::clone(inner).run());
        } else {
            inner.wake.notify_one();
        }
        outcome
    }

    /// Permanently block this queue and wait until it is idle or `timeout`
    /// elapses.
    ///
    /// Items scheduled before the call are still sent; items scheduled after
    /// it wait for a release that never comes and fail once their retry
    /// window runs out. In-flight sends are never cancelled.
    pub async fn single_stop(&self, timeout: Duration) -> Drain {
        let inner = &self.inner;
        inner.instance_block.store(true, Ordering::SeqCst);

        let poll = inner.context.timing().poll_interval;
        if poll_until(timeout, poll, || inner.lock().is_idle()).await {
            debug!(group = %inner.group, destination = %inner.destination, "queue drained");
            return Drain::Complete;
        }

        let remaining = inner.lock().unfinished();
        warn!(
            group = %inner.group,
            destination = %inner.destination,
            remaining,
            "{remaining} item(s) did not finish before the stop timeout"
        );
        #[cfg(feature = "metrics")]
        counter!(send_metrics::DRAIN_TIMEOUTS_TOTAL, labels::GROUP => inner.group.clone())
            .increment(1);
        Drain::TimedOut { remaining }
    }
}

impl<P> QueueState<P> {
    fn is_idle(&self) -> bool {
        self.items.is_empty() && !self.busy
    }

    fn unfinished(&self) -> usize {
        self.items.len() + usize::from(self.busy)
    }
}

impl<P> QueueInner<P> {
    fn lock(&self) -> MutexGuard<'_, QueueState<P>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_blocked(&self) -> bool {
        self.instance_block.load(Ordering::SeqCst)
            || self.group_state.is_blocked()
            || self.context.is_globally_blocked()
    }
}

impl<P> Drop for QueueInner<P> {
    fn drop(&mut self) {
        // Wakes an idle worker so it notices the queue is gone.
        self.closed.cancel();
    }
}

impl<P> QueueInner<P>
where
    P: Debug + Send + Sync + 'static,
{
    /// Worker loop. Holds the queue strongly only while there is work, so an
    /// idle queue is freed once its last handle is dropped.
    async fn run(self: Arc<Self>) {
        debug!(group = %self.group, destination = %self.destination, "queue worker started");
        let mut inner = self;
        loop {
            let next = {
                let mut state = inner.lock();
                match state.items.pop_front() {
                    Some(item) => {
                        state.busy = true;
                        Some(item)
                    },
                    None if inner.closed.is_cancelled() => {
                        state.worker = false;
                        break;
                    },
                    None => None,
                }
            };

            let Some(item) = next else {
                let queue = Arc::downgrade(&inner);
                let wake = Arc::clone(&inner.wake);
                let closed = inner.closed.clone();
                drop(inner);

                tokio::select! {
                    () = wake.notified() => {},
                    () = closed.cancelled() => {},
                }
                let Some(strong) = queue.upgrade() else {
                    debug!("queue dropped, worker stopped");
                    return;
                };
                inner = strong;
                continue;
            };

            inner.process(item).await;

            let _pending = inner.group_state.decrement();
            #[cfg(feature = "metrics")]
            gauge!(send_metrics::PENDING, labels::GROUP => inner.group.clone()).set(_pending as f64);
            inner.lock().busy = false;
        }
        debug!(group = %inner.group, destination = %inner.destination, "queue worker stopped");
    }

    /// Send one item and resolve its outcome.
    async fn process(&self, item: QueueItem<P>) {
        let QueueItem {
            id,
            resolver,
            blocked,
            payload,
        } = item;

        if blocked && !self.wait_for_release().await {
            self.log_context(id, &payload);
            warn!(
                group = %self.group,
                destination = %self.destination,
                item = id,
                "block timeout reached"
            );
            self.record_failure(FailureKind::BlockTimeout);
            resolver.resolve(false);
            return;
        }

        debug!(group = %self.group, destination = %self.destination, item = id, "sending");
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        // The send runs on its own task so it survives this worker going away.
        let joined = Arc::clone(&self.sender).dispatch(payload).await;

        #[cfg(feature = "metrics")]
        histogram!(send_metrics::SEND_DURATION_SECONDS, labels::GROUP => self.group.clone())
            .record(started.elapsed().as_secs_f64());

        match joined {
            Ok((payload, Ok(report))) => {
                let delivered = report.unwrap_or(true);
                if delivered {
                    #[cfg(feature = "metrics")]
                    counter!(send_metrics::ITEMS_SENT_TOTAL, labels::GROUP => self.group.clone())
                        .increment(1);
                } else {
                    self.log_context(id, &payload);
                    info!(
                        group = %self.group,
                        destination = %self.destination,
                        item = id,
                        "sender reported failure"
                    );
                    self.record_failure(FailureKind::SendFailure);
                }
                resolver.resolve(delivered);
            },
            Ok((payload, Err(error))) => {
                self.log_context(id, &payload);
                warn!(
                    group = %self.group,
                    destination = %self.destination,
                    item = id,
                    error = %error,
                    "sending failed"
                );
                self.record_failure(FailureKind::SendFailure);
                resolver.resolve(false);
            },
            Err(join) if join.is_cancelled() => {
                debug!(group = %self.group, destination = %self.destination, item = id, "send cancelled");
                #[cfg(feature = "metrics")]
                counter!(send_metrics::ITEMS_CANCELLED_TOTAL, labels::GROUP => self.group.clone())
                    .increment(1);
                // Dropping the resolver unresolved cancels the waiters.
                drop(resolver);
                return;
            },
            Err(join) => {
                error!(
                    group = %self.group,
                    destination = %self.destination,
                    item = id,
                    error = %join,
                    "sender panicked"
                );
                self.record_failure(FailureKind::SendFailure);
                resolver.resolve(false);
            },
        }
        debug!(group = %self.group, destination = %self.destination, item = id, "sent");
    }

    /// Poll the live block flags until they clear or the retry window runs out.
    async fn wait_for_release(&self) -> bool {
        let timing = self.context.timing();
        poll_until(timing.block_retry_window, timing.poll_interval, || {
            !self.is_blocked()
        })
        .await
    }

    /// Payloads are already logged at debug level when scheduled; repeat
    /// them at info level only when that record was filtered out.
    fn log_context(&self, id: u64, payload: &P) {
        if tracing::enabled!(Level::DEBUG) {
            return;
        }
        info!(
            group = %self.group,
            destination = %self.destination,
            item = id,
            payload = ?payload,
            "failed item"
        );
    }

    fn record_failure(&self, _kind: FailureKind) {
        #[cfg(feature = "metrics")]
        counter!(
            send_metrics::ITEMS_FAILED_TOTAL,
            labels::GROUP => self.group.clone(),
            labels::REASON => _kind.as_str()
        )
        .increment(1);
    }
}
