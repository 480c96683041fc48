//! One-shot success/failure signal for a scheduled item.

use std::{
    future::{Future, IntoFuture},
    pin::Pin,
};

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Create a linked resolver/outcome pair for the item with sequence `id`.
pub(crate) fn pair(id: u64) -> (Resolver, Outcome) {
    let (tx, rx) = watch::channel(None);
    (Resolver { tx }, Outcome { id, rx })
}

/// Write side of an [`Outcome`], owned by the queue worker.
///
/// Resolving consumes the resolver, so an item resolves at most once.
/// Dropping it unresolved cancels every waiter.
#[derive(Debug)]
pub(crate) struct Resolver {
    tx: watch::Sender<Option<bool>>,
}

impl Resolver {
    pub(crate) fn resolve(self, success: bool) {
        let previous = self.tx.send_replace(Some(success));
        debug_assert!(previous.is_none(), "outcome resolved twice");
    }
}

/// The result of one scheduled item: `true` once sent, `false` on failure.
///
/// Clones observe the same result. Await it directly or call [`Outcome::wait`].
#[derive(Debug, Clone)]
pub struct Outcome {
    id: u64,
    rx: watch::Receiver<Option<bool>>,
}

impl Outcome {
    /// Sequence number of the item within its queue.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until the item is processed.
    ///
    /// Returns [`Error::Cancelled`] if the send was cancelled before it
    /// reported a result.
    pub async fn wait(&self) -> Result<bool> {
        let mut rx = self.rx.clone();
        let value = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Cancelled)?;
        value.ok_or(Error::Cancelled)
    }

    /// The result if the item was already processed.
    #[must_use]
    pub fn try_result(&self) -> Option<bool> {
        *self.rx.borrow()
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.try_result().is_some()
    }
}

impl IntoFuture for Outcome {
    type IntoFuture = Pin<Box<dyn Future<Output = Result<bool>> + Send>>;
    type Output = Result<bool>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::time::Duration};

    #[tokio::test]
    async fn waiters_see_the_same_result() {
        let (resolver, outcome) = pair(7);
        let first = tokio::spawn(outcome.clone().into_future());
        let second = tokio::spawn(outcome.clone().into_future());
        tokio::task::yield_now().await;

        assert!(!outcome.is_resolved());
        resolver.resolve(true);

        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        assert_eq!(outcome.id(), 7);
    }

    #[tokio::test]
    async fn wait_after_resolution_returns_immediately() {
        let (resolver, outcome) = pair(0);
        resolver.resolve(false);
        let result = tokio::time::timeout(Duration::from_millis(50), outcome.wait())
            .await
            .expect("resolved outcome must not suspend");
        assert!(!result.unwrap());
        assert_eq!(outcome.try_result(), Some(false));
    }

    #[tokio::test]
    async fn dropped_resolver_cancels_waiters() {
        let (resolver, outcome) = pair(0);
        let waiter = tokio::spawn(outcome.clone().into_future());
        drop(resolver);
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert!(!outcome.is_resolved());
    }
}
