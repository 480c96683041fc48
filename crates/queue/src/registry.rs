//! Lazily created queues keyed by destination, with idle eviction.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use courier_metrics::{counter, gauge, labels, registry as registry_metrics};

use crate::{
    context::{Drain, SendingContext},
    queue::DeliveryQueue,
    sender::{AsyncSender, BlockingSender, Deliver, IntoReport, Sender},
};

/// Full sweep cadence on the `get` path.
const SWEEP_EVERY_GETS: u64 = 256;

struct Slot<P> {
    queue: DeliveryQueue<P>,
    last_access: Instant,
}

impl<P> Slot<P> {
    /// Unused past `ttl` and nothing left to send.
    fn is_evictable(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > ttl && self.queue.is_idle()
    }
}

/// Hands out one [`DeliveryQueue`] per destination for a fixed group and
/// sender, creating queues on first use and dropping them once idle past the
/// time-to-live.
///
/// A destination never maps to two live queues at once: lookups go through
/// the map's entry lock, and a queue with items left is never evicted.
pub struct QueueRegistry<P> {
    group: String,
    context: SendingContext,
    sender: Arc<dyn Sender<P>>,
    ttl: Duration,
    slots: DashMap<String, Slot<P>>,
    gets: AtomicU64,
}

impl<P> Debug for QueueRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("group", &self.group)
            .field("ttl", &self.ttl)
            .field("queues", &self.slots.len())
            .finish()
    }
}

impl<P> QueueRegistry<P> {
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn contains(&self, destination: &str) -> bool {
        self.slots.contains_key(destination)
    }

    /// Drop the queue for `destination` from the registry.
    ///
    /// The returned queue is closed: its worker finishes what is left and
    /// exits. The next [`get`](Self::get) for the destination builds a fresh
    /// queue, which is how a queue retired with `single_stop` is replaced.
    pub fn remove(&self, destination: &str) -> Option<DeliveryQueue<P>> {
        let (_, slot) = self.slots.remove(destination)?;
        slot.queue.close();
        debug!(group = %self.group, destination, "queue removed");
        self.record_len();
        Some(slot.queue)
    }

    /// Evict every queue that is idle and unused past the ttl.
    ///
    /// Returns the number of evicted queues.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if slot.is_evictable(now, self.ttl) {
                slot.queue.close();
                false
            } else {
                true
            }
        });
        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            debug!(group = %self.group, evicted, "idle queues evicted");
            #[cfg(feature = "metrics")]
            counter!(registry_metrics::QUEUES_EVICTED_TOTAL, labels::GROUP => self.group.clone())
                .increment(evicted as u64);
        }
        self.record_len();
        evicted
    }

    /// Block the registry's group and wait for it to drain.
    pub async fn stop(&self, timeout: Duration) -> Drain {
        self.context.local_stop(&self.group, timeout).await
    }

    fn record_len(&self) {
        #[cfg(feature = "metrics")]
        gauge!(registry_metrics::QUEUES_ACTIVE, labels::GROUP => self.group.clone())
            .set(self.slots.len() as f64);
    }
}

impl<P> QueueRegistry<P>
where
    P: Debug + Send + Sync + 'static,
{
    /// Registry for `group` with the context's default ttl.
    ///
    /// Any block left on `group` from an earlier run is released.
    pub fn new(
        context: &SendingContext,
        group: impl Into<String>,
        sender: Arc<dyn Sender<P>>,
    ) -> Self {
        let group = group.into();
        context.release_block(Some(&group));
        Self {
            ttl: context.timing().queue_ttl,
            context: context.clone(),
            group,
            sender,
            slots: DashMap::new(),
            gets: AtomicU64::new(0),
        }
    }

    pub fn blocking<F, O>(context: &SendingContext, group: impl Into<String>, func: F) -> Self
    where
        F: Fn(&P) -> O + Send + Sync + 'static,
        O: IntoReport + 'static,
    {
        Self::new(context, group, Arc::new(BlockingSender::<F, O>::new(func)))
    }

    pub fn with_async<D>(context: &SendingContext, group: impl Into<String>, sender: D) -> Self
    where
        D: Deliver<P>,
    {
        Self::new(context, group, Arc::new(AsyncSender::new(sender)))
    }

    /// Override the time-to-live for idle queues.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The live queue for `destination`, created on a miss.
    pub fn get(&self, destination: &str) -> DeliveryQueue<P> {
        self.get_at(destination, Instant::now())
    }

    pub fn get_at(&self, destination: &str, now: Instant) -> DeliveryQueue<P> {
        let queue = match self.slots.entry(destination.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.is_evictable(now, self.ttl) {
                    slot.queue.close();
                    slot.queue = self.build(destination);
                    debug!(group = %self.group, destination, "expired queue replaced");
                    #[cfg(feature = "metrics")]
                    counter!(registry_metrics::QUEUES_EVICTED_TOTAL, labels::GROUP => self.group.clone())
                        .increment(1);
                }
                slot.last_access = now;
                slot.queue.clone()
            },
            Entry::Vacant(vacant) => {
                let queue = self.build(destination);
                vacant.insert(Slot {
                    queue: queue.clone(),
                    last_access: now,
                });
                queue
            },
        };

        let seen = self.gets.fetch_add(1, Ordering::Relaxed) + 1;
        if seen.is_multiple_of(SWEEP_EVERY_GETS) {
            self.sweep_at(now);
        } else {
            self.record_len();
        }
        queue
    }

    /// Sweep every `interval` until `cancel` fires or the registry is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let group = self.group.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
            info!(group = %group, "registry sweeper stopped");
        })
    }

    fn build(&self, destination: &str) -> DeliveryQueue<P> {
        debug!(group = %self.group, destination, "creating queue");
        #[cfg(feature = "metrics")]
        counter!(registry_metrics::QUEUES_CREATED_TOTAL, labels::GROUP => self.group.clone())
            .increment(1);
        DeliveryQueue::new(
            &self.context,
            self.group.clone(),
            destination,
            Arc::clone(&self.sender),
        )
    }
}

impl<P> Drop for QueueRegistry<P> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            slot.queue.close();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::context::Timing,
        std::sync::Mutex,
    };

    fn context() -> SendingContext {
        SendingContext::with_timing(
            Timing::new(
                Duration::from_millis(200),
                Duration::from_millis(10),
                Duration::from_secs(60),
            )
            .unwrap(),
        )
    }

    fn registry(ctx: &SendingContext) -> QueueRegistry<String> {
        QueueRegistry::blocking(ctx, "telegram", |_: &String| ())
    }

    #[tokio::test]
    async fn same_destination_resolves_to_same_queue() {
        let ctx = context();
        let registry = registry(&ctx);

        let first = registry.get("chat-1");
        let second = registry.get("chat-1");
        let other = registry.get("chat-2");

        assert!(first.same_queue(&second));
        assert!(!first.same_queue(&other));
        assert_eq!(registry.len(), 2);
        assert_eq!(first.group(), "telegram");
        assert_eq!(first.destination(), "chat-1");
    }

    #[tokio::test]
    async fn concurrent_gets_never_duplicate() {
        let ctx = context();
        let registry = Arc::new(registry(&ctx));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get("chat-1") })
            })
            .collect();
        let queues: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert!(queues.iter().all(|q| q.same_queue(&queues[0])));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn idle_queue_is_replaced_after_ttl() {
        let ctx = context();
        let registry = registry(&ctx).with_ttl(Duration::from_secs(10));
        let start = Instant::now();

        let first = registry.get_at("chat-1", start);
        let fresh = registry.get_at("chat-1", start + Duration::from_secs(5));
        assert!(first.same_queue(&fresh));

        // Last access moved to +5s, so +14s is still inside the ttl.
        let still = registry.get_at("chat-1", start + Duration::from_secs(14));
        assert!(first.same_queue(&still));

        let replaced = registry.get_at("chat-1", start + Duration::from_secs(30));
        assert!(!first.same_queue(&replaced));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn sweep_is_idempotent() {
        let ctx = context();
        let registry = registry(&ctx).with_ttl(Duration::from_secs(10));
        let start = Instant::now();
        registry.get_at("chat-1", start);
        registry.get_at("chat-2", start + Duration::from_secs(8));

        let later = start + Duration::from_secs(15);
        assert_eq!(registry.sweep_at(later), 1);
        assert_eq!(registry.sweep_at(later), 0);
        assert!(!registry.contains("chat-1"));
        assert!(registry.contains("chat-2"));
    }

    #[tokio::test]
    async fn queue_with_pending_items_is_not_evicted() {
        let ctx = context();
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let sender_gate = Arc::clone(&gate);
        let registry = QueueRegistry::blocking(&ctx, "telegram", move |_: &String| {
            drop(tokio::runtime::Handle::current().block_on(sender_gate.acquire()));
        })
        .with_ttl(Duration::from_secs(10));
        let start = Instant::now();

        let queue = registry.get_at("chat-1", start);
        let outcome = queue.schedule("held".to_string());

        let later = start + Duration::from_secs(60);
        assert_eq!(registry.sweep_at(later), 0);
        assert!(registry.get_at("chat-1", later).same_queue(&queue));

        gate.add_permits(1);
        assert!(outcome.await.unwrap());
    }

    #[tokio::test]
    async fn construction_releases_stale_group_block() {
        let ctx = context();
        ctx.local_stop("telegram", Duration::ZERO).await;
        assert!(ctx.is_blocked("telegram"));

        let _registry = registry(&ctx);
        assert!(!ctx.is_blocked("telegram"));
    }

    #[tokio::test]
    async fn remove_discards_stopped_queue() {
        let ctx = context();
        let registry = registry(&ctx);
        let queue = registry.get("chat-1");
        assert!(queue.single_stop(Duration::from_millis(50)).await.is_complete());

        let removed = registry.remove("chat-1").unwrap();
        assert!(removed.same_queue(&queue));
        assert!(registry.remove("chat-1").is_none());

        let fresh = registry.get("chat-1");
        assert!(!fresh.is_stopped());
        assert!(fresh.schedule("after".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn stop_drains_the_group() {
        let ctx = context();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let registry = QueueRegistry::blocking(&ctx, "telegram", move |text: &String| {
            std::thread::sleep(Duration::from_millis(5));
            log.lock().unwrap().push(text.clone());
        });

        for dest in ["a", "b", "c"] {
            registry.get(dest).schedule(dest.to_string());
        }
        let drain = registry.stop(Duration::from_secs(5)).await;

        assert!(drain.is_complete());
        assert_eq!(sent.lock().unwrap().len(), 3);
        assert!(ctx.is_blocked("telegram"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_in_background_and_stops_on_cancel() {
        let ctx = context();
        let registry = Arc::new(registry(&ctx).with_ttl(Duration::from_secs(5)));
        registry.get("chat-1");

        let cancel = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(Duration::from_secs(1), cancel.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_when_registry_is_dropped() {
        let ctx = context();
        let registry = Arc::new(registry(&ctx));
        let sweeper = registry.spawn_sweeper(Duration::from_secs(1), CancellationToken::new());

        drop(registry);
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper must notice the dropped registry")
            .unwrap();
    }

    #[tokio::test]
    async fn periodic_sweep_runs_on_get_path() {
        let ctx = context();
        let registry = registry(&ctx).with_ttl(Duration::from_secs(1));
        let start = Instant::now();
        registry.get_at("stale", start);

        let later = start + Duration::from_secs(10);
        for n in 0..SWEEP_EVERY_GETS {
            registry.get_at(&format!("dest-{}", n % 4), later);
        }

        assert!(!registry.contains("stale"));
        assert_eq!(registry.len(), 4);
    }
}
