//! # Keystone Testing
//!
//! Testing utilities and helpers for Keystone.
//!
//! This crate provides:
//! - Controllable clocks for debounce and timestamp tests
//! - Probes that record how actions and components were driven
//! - Tracing setup for tests
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```
//! use keystone_testing::{ActionProbe, ManualClock};
//! use keystone_runtime::{Context, Dispatcher, RuntimeConfig};
//! use keystone_core::change::{ChangeSource, ChangeType};
//! use keystone_core::lifecycle::{Lifecycle, LifecycleConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let clock = ManualClock::default();
//! let context = Context::with_clock(RuntimeConfig::default(), Arc::new(clock.clone()));
//! let dispatcher = Dispatcher::new(&context).into_component();
//! let probe = ActionProbe::new();
//! dispatcher.register_actions(ChangeType::Login, [probe.action(ChangeType::Login, "probe")]);
//! dispatcher.initialize(&LifecycleConfig::default()).await.unwrap();
//!
//! context.bus().emit_change(ChangeType::Login, serde_json::Value::Null, ChangeSource::System);
//! clock.advance(Duration::from_millis(100));
//! context.bus().emit_change(ChangeType::Login, serde_json::Value::Null, ChangeSource::System);
//!
//! dispatcher.wait_for_change_actions(ChangeType::Login, Duration::from_secs(1)).await.unwrap();
//! assert_eq!(probe.calls(), 1); // second emit was debounced
//! # }
//! ```

use chrono::{DateTime, Utc};
use keystone_core::environment::Clock;

/// Action and component probes
pub mod probes;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use keystone_testing::mocks::FixedClock;
    /// use keystone_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    ///
    /// ```
    /// use keystone_testing::ManualClock;
    /// use keystone_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::from_millis(250));
    /// assert_eq!((clock.now() - start).num_milliseconds(), 250);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward.
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit a `chrono::Duration`.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).expect("test durations fit chrono::Duration");
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        /// Starts at [`test_clock`]'s instant.
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
    ///
    /// Safe to call from every test; only the first call installs anything.
    /// `RUST_LOG=keystone::lifecycle=debug` traces component transitions.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use keystone_core::change::{ChangeSource, ChangeType};
    use proptest::prelude::*;

    /// Any change type.
    pub fn change_type() -> impl Strategy<Value = ChangeType> {
        proptest::sample::select(ChangeType::ALL.to_vec())
    }

    /// Any change source.
    pub fn change_source() -> impl Strategy<Value = ChangeSource> {
        prop_oneof![
            Just(ChangeSource::UserAction),
            Just(ChangeSource::System),
            Just(ChangeSource::Api),
        ]
    }

    /// A non-empty subset of change types, in declaration order.
    pub fn change_type_set() -> impl Strategy<Value = Vec<ChangeType>> {
        proptest::sample::subsequence(ChangeType::ALL.to_vec(), 1..=ChangeType::ALL.len())
    }
}

// Re-export commonly used items
pub use helpers::init_tracing;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use probes::{ActionProbe, ProbeHooks, ProbeOutcome};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let handle = clock.clone();
        clock.advance(Duration::from_secs(2));
        assert_eq!(handle.now(), test_clock().now() + chrono::Duration::seconds(2));
    }
}
