//! Metric name and label definitions.
//!
//! Every metric the delivery pipeline emits is named here so dashboards and
//! the code agree on spelling.

/// Per-item delivery metrics
pub mod sending {
    /// Items handed to `schedule`
    pub const ITEMS_SCHEDULED_TOTAL: &str = "courier_sending_items_scheduled_total";
    /// Items whose outcome resolved as success
    pub const ITEMS_SENT_TOTAL: &str = "courier_sending_items_sent_total";
    /// Items whose outcome resolved as failure (label: reason)
    pub const ITEMS_FAILED_TOTAL: &str = "courier_sending_items_failed_total";
    /// Items whose send was cancelled before reporting
    pub const ITEMS_CANCELLED_TOTAL: &str = "courier_sending_items_cancelled_total";
    /// Items scheduled but not yet finished, per group
    pub const PENDING: &str = "courier_sending_pending";
    /// Wall time spent inside the sender, in seconds
    pub const SEND_DURATION_SECONDS: &str = "courier_sending_send_duration_seconds";
    /// Stop calls whose drain window elapsed with items left
    pub const DRAIN_TIMEOUTS_TOTAL: &str = "courier_sending_drain_timeouts_total";
}

/// Queue registry metrics
pub mod registry {
    /// Live queues held by registries
    pub const QUEUES_ACTIVE: &str = "courier_registry_queues_active";
    /// Queues created on a cache miss
    pub const QUEUES_CREATED_TOTAL: &str = "courier_registry_queues_created_total";
    /// Idle queues dropped after their time-to-live
    pub const QUEUES_EVICTED_TOTAL: &str = "courier_registry_queues_evicted_total";
}

/// Common label keys
pub mod labels {
    pub const GROUP: &str = "group";
    pub const REASON: &str = "reason";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Platform send duration buckets (in seconds)
    /// Covers 5ms to 2 minutes; rate-limited platforms can stall a send for a while
    pub static SEND_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
        ]
    });
}
