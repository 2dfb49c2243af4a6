//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for all runtime components:
//! - Change bus accept/debounce decisions
//! - Action dispatch outcomes and waits
//! - Action queue occupancy
//! - Component lifecycle transitions
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so components record unconditionally.
//!
//! Installation only sets the process-wide recorder and keeps a handle for
//! rendering; serving the text over HTTP is left to the embedding
//! application.
//!
//! # Example
//!
//! ```rust,no_run
//! use keystone_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut metrics = PrometheusMetrics::new();
//! metrics.install()?;
//!
//! // Expose this from whatever endpoint the application serves
//! let exposition = metrics.render().unwrap_or_default();
//! # let _ = exposition;
//! # Ok(())
//! # }
//! ```

use keystone_core::change::ChangeType;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from installing the Prometheus recorder.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter configuration was rejected
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// The recorder could not be installed
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Process-wide Prometheus recorder plus the handle used to render it.
#[derive(Default)]
pub struct PrometheusMetrics {
    handle: Option<PrometheusHandle>,
}

impl PrometheusMetrics {
    /// Not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the Prometheus recorder globally.
    ///
    /// Only one recorder can exist per process. When another one is already
    /// installed this logs a warning, succeeds, and leaves
    /// [`handle`](Self::handle) empty.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the histogram buckets are rejected
    /// and [`MetricsError::Install`] for any other installation failure.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            },
            Err(BuildError::FailedToSetGlobalRecorder(_)) => {
                tracing::warn!("Metrics recorder already installed, keeping the existing one");
                Ok(())
            },
            Err(e) => Err(MetricsError::Install(e.to_string())),
        }
    }

    /// Handle of the recorder this instance installed.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in the Prometheus text format.
    ///
    /// `None` unless this instance installed the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Change Bus Metrics
    describe_counter!(
        "change_bus_events_accepted_total",
        "Total number of change events published by the bus"
    );
    describe_counter!(
        "change_bus_events_debounced_total",
        "Total number of change events dropped inside the debounce window"
    );

    // Dispatcher Metrics
    describe_counter!(
        "dispatcher_actions_dispatched_total",
        "Total number of actions handed to the action queue"
    );
    describe_counter!(
        "dispatcher_actions_failed_total",
        "Total number of dispatched actions that failed or panicked"
    );
    describe_histogram!(
        "dispatcher_action_duration_seconds",
        "Time from dispatch to action completion, including queueing"
    );
    describe_counter!(
        "dispatcher_events_gated_total",
        "Total number of change events ignored because their type was disabled"
    );
    describe_counter!(
        "dispatcher_wait_timeouts_total",
        "Total number of waits for outstanding actions that timed out"
    );

    // Action Queue Metrics
    describe_gauge!(
        "action_queue_running",
        "Number of actions currently running per queue"
    );

    // Lifecycle Metrics
    describe_counter!(
        "lifecycle_initializations_total",
        "Total number of successful component activations"
    );
    describe_counter!(
        "lifecycle_failures_total",
        "Total number of component activations that failed or declined"
    );
    describe_counter!(
        "lifecycle_teardowns_total",
        "Total number of component teardowns"
    );
}

/// Change bus metrics recorder.
pub struct ChangeBusMetrics;

impl ChangeBusMetrics {
    /// Record a published event.
    pub fn record_accepted(change_type: ChangeType) {
        counter!("change_bus_events_accepted_total", "change_type" => change_type.as_str()).increment(1);
    }

    /// Record an event dropped by debouncing.
    pub fn record_debounced(change_type: ChangeType) {
        counter!("change_bus_events_debounced_total", "change_type" => change_type.as_str()).increment(1);
    }
}

/// Dispatcher metrics recorder.
pub struct DispatcherMetrics;

impl DispatcherMetrics {
    /// Record an action handed to the queue.
    pub fn record_dispatch(change_type: ChangeType) {
        counter!("dispatcher_actions_dispatched_total", "change_type" => change_type.as_str()).increment(1);
    }

    /// Record an action's settlement.
    pub fn record_completion(change_type: ChangeType, duration: Duration, succeeded: bool) {
        histogram!("dispatcher_action_duration_seconds", "change_type" => change_type.as_str())
            .record(duration.as_secs_f64());
        if !succeeded {
            counter!("dispatcher_actions_failed_total", "change_type" => change_type.as_str()).increment(1);
        }
    }

    /// Record an event ignored by the type gate.
    pub fn record_gated(change_type: ChangeType) {
        counter!("dispatcher_events_gated_total", "change_type" => change_type.as_str()).increment(1);
    }

    /// Record a wait that hit its deadline.
    pub fn record_wait_timeout(change_type: ChangeType) {
        counter!("dispatcher_wait_timeouts_total", "change_type" => change_type.as_str()).increment(1);
    }
}

/// Action queue metrics recorder.
pub struct ActionQueueMetrics;

impl ActionQueueMetrics {
    /// Record an action taking a slot.
    pub fn record_started(queue: &str) {
        gauge!("action_queue_running", "queue" => queue.to_string()).increment(1.0);
    }

    /// Record an action releasing its slot.
    pub fn record_finished(queue: &str) {
        gauge!("action_queue_running", "queue" => queue.to_string()).decrement(1.0);
    }
}

/// Lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record a successful activation.
    pub fn record_initialized(component: &str) {
        counter!("lifecycle_initializations_total", "component" => component.to_string()).increment(1);
    }

    /// Record a failed or declined activation.
    pub fn record_failure(component: &str) {
        counter!("lifecycle_failures_total", "component" => component.to_string()).increment(1);
    }

    /// Record a teardown.
    pub fn record_teardown(component: &str) {
        counter!("lifecycle_teardowns_total", "component" => component.to_string()).increment(1);
    }
}
