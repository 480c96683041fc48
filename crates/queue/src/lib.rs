//! Per-destination ordered delivery.
//!
//! Every destination (a chat, a channel) gets one [`DeliveryQueue`] that hands
//! scheduled payloads to a [`Sender`] strictly one at a time and in submission
//! order. Sending can be paused for a single queue, for a whole group of queues
//! (one platform), or globally; the stop calls pause and then wait, bounded, for
//! outstanding items to drain. A [`QueueRegistry`] creates queues on demand and
//! drops idle ones after a time-to-live.
//!
//! Shared pause state lives in a [`SendingContext`] that is built once and
//! handed to every queue and registry.

pub mod context;
pub mod error;
pub mod outcome;
pub mod queue;
pub mod registry;
pub mod sender;

pub use {
    context::{Drain, SendingContext, Timing},
    error::{Error, FailureKind, Result},
    outcome::Outcome,
    queue::DeliveryQueue,
    registry::QueueRegistry,
    sender::{AsyncSender, BlockingSender, Deliver, IntoReport, Report, Sender},
};
