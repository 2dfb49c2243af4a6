//! Property tests for debouncing and the dispatch gate
//!
//! Drives the bus with generated emit schedules on a manual clock and checks
//! every outcome against a simple per-type model.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use keystone_core::change::ChangeType;
use keystone_runtime::{ChangeBus, Context, Dispatcher, RuntimeConfig};
use keystone_testing::ManualClock;
use keystone_testing::properties::{change_source, change_type, change_type_set};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WINDOW_MS: u64 = 300;

// ============================================================================
// Debouncing
// ============================================================================

proptest! {
    #[test]
    fn prop_emit_is_accepted_only_outside_the_window(
        schedule in prop::collection::vec((change_type(), change_source(), 0_u64..600), 1..40)
    ) {
        let clock = ManualClock::default();
        let bus = ChangeBus::with_clock(Duration::from_millis(WINDOW_MS), Arc::new(clock.clone()));
        let mut elapsed_ms = 0_u64;
        let mut last_accepted: HashMap<ChangeType, u64> = HashMap::new();

        for (change_type, source, gap_ms) in schedule {
            clock.advance(Duration::from_millis(gap_ms));
            elapsed_ms += gap_ms;

            let expected = last_accepted
                .get(&change_type)
                .is_none_or(|last| elapsed_ms - last >= WINDOW_MS);
            let outcome = bus.emit_change(change_type, serde_json::Value::Null, source);

            prop_assert_eq!(outcome.is_accepted(), expected);
            if expected {
                last_accepted.insert(change_type, elapsed_ms);
                let event = outcome.event().unwrap();
                prop_assert_eq!(event.change_type, change_type);
                prop_assert_eq!(event.source, source);
            }
        }
    }

    #[test]
    fn prop_types_never_debounce_each_other(
        first in change_type(),
        second in change_type(),
        source in change_source(),
    ) {
        prop_assume!(first != second);
        let clock = ManualClock::default();
        let bus = ChangeBus::with_clock(Duration::from_millis(WINDOW_MS), Arc::new(clock));

        prop_assert!(bus.emit_change(first, serde_json::Value::Null, source).is_accepted());
        prop_assert!(bus.emit_change(second, serde_json::Value::Null, source).is_accepted());
        prop_assert!(!bus.emit_change(first, serde_json::Value::Null, source).is_accepted());
    }
}

// ============================================================================
// Dispatch gate
// ============================================================================

proptest! {
    #[test]
    fn prop_enabled_types_report_sorted_and_exact(types in change_type_set()) {
        let context = Context::new(RuntimeConfig::default());
        let dispatcher = Dispatcher::new(&context);

        for change_type in types.iter().rev() {
            prop_assert!(dispatcher.enable_change_type(*change_type));
        }

        prop_assert_eq!(dispatcher.get_enabled_change_types(), types.clone());
        for change_type in ChangeType::ALL {
            prop_assert_eq!(dispatcher.is_change_type_enabled(change_type), types.contains(&change_type));
        }
    }

    #[test]
    fn prop_unsupported_types_stay_disabled(supported in change_type_set(), candidate in change_type()) {
        let context = Context::new(RuntimeConfig::default());
        let dispatcher = Dispatcher::with_supported(&context, supported.clone());

        let enabled = dispatcher.enable_change_type(candidate);

        prop_assert_eq!(enabled, supported.contains(&candidate));
        prop_assert_eq!(dispatcher.is_change_type_enabled(candidate), enabled);
    }
}
