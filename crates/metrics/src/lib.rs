//! Metrics collection and export for courier.
//!
//! The delivery pipeline records through the `metrics` crate facade. Nothing is
//! exported until a recorder is installed with [`init_metrics`]; with the
//! `prometheus` feature that recorder renders the Prometheus text format.
//!
//! ```rust,ignore
//! use courier_metrics::{counter, labels, sending};
//!
//! counter!(sending::ITEMS_SENT_TOTAL, labels::GROUP => "telegram").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
