//! The outbound side of a queue.
//!
//! A queue never calls platform code directly. It hands each payload to a
//! [`Sender`], which starts the delivery on a task of its own and returns the
//! payload together with a [`Report`] once done. Running the send on a separate
//! task keeps it alive even if the queue worker awaiting it goes away.
//!
//! Two adapters cover the usual cases:
//!
//! - [`BlockingSender`] wraps a synchronous closure and runs it on tokio's
//!   blocking pool so it never stalls the runtime.
//! - [`AsyncSender`] wraps a [`Deliver`] implementation and awaits it directly.

use std::{marker::PhantomData, sync::Arc};

use {async_trait::async_trait, tokio::task::JoinHandle};

/// What a sender reports for one payload.
///
/// - `Ok(None)`: the sender did not report a result. This counts as delivered,
///   so senders that simply return `()` are treated as successful.
/// - `Ok(Some(delivered))`: explicit success or failure.
/// - `Err(_)`: the send failed.
pub type Report = anyhow::Result<Option<bool>>;

/// Conversion from a sender's return value into a [`Report`].
pub trait IntoReport {
    fn into_report(self) -> Report;
}

impl IntoReport for () {
    fn into_report(self) -> Report {
        Ok(None)
    }
}

impl IntoReport for bool {
    fn into_report(self) -> Report {
        Ok(Some(self))
    }
}

impl IntoReport for Option<bool> {
    fn into_report(self) -> Report {
        Ok(self)
    }
}

impl<T, E> IntoReport for Result<T, E>
where
    T: IntoReport,
    E: Into<anyhow::Error>,
{
    fn into_report(self) -> Report {
        self.map_err(Into::into).and_then(IntoReport::into_report)
    }
}

/// Starts the delivery of one payload.
pub trait Sender<P>: Send + Sync + 'static {
    /// Deliver `payload` on a task detached from the caller.
    ///
    /// The join handle yields the payload back alongside the report so the
    /// queue can log it on failure. A cancelled task means the send never
    /// reported a result.
    fn dispatch(self: Arc<Self>, payload: P) -> JoinHandle<(P, Report)>;
}

/// Asynchronous platform client.
#[async_trait]
pub trait Deliver<P: Sync>: Send + Sync + 'static {
    async fn deliver(&self, payload: &P) -> Report;
}

/// Runs a synchronous closure on tokio's blocking pool.
pub struct BlockingSender<F, O> {
    func: F,
    _output: PhantomData<fn() -> O>,
}

impl<F, O> BlockingSender<F, O> {
    pub fn new(func: F) -> Self {
        Self {
            func,
            _output: PhantomData,
        }
    }
}

impl<P, F, O> Sender<P> for BlockingSender<F, O>
where
    P: Send + 'static,
    F: Fn(&P) -> O + Send + Sync + 'static,
    O: IntoReport + 'static,
{
    fn dispatch(self: Arc<Self>, payload: P) -> JoinHandle<(P, Report)> {
        tokio::task::spawn_blocking(move || {
            let report = (self.func)(&payload).into_report();
            (payload, report)
        })
    }
}

/// Awaits a [`Deliver`] implementation on a spawned task.
pub struct AsyncSender<D> {
    inner: D,
}

impl<D> AsyncSender<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }
}

impl<P, D> Sender<P> for AsyncSender<D>
where
    P: Send + Sync + 'static,
    D: Deliver<P>,
{
    fn dispatch(self: Arc<Self>, payload: P) -> JoinHandle<(P, Report)> {
        tokio::spawn(async move {
            let report = self.inner.deliver(&payload).await;
            (payload, report)
        })
    }
}
