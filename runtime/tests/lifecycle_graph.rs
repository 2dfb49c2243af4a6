//! Integration tests for reference-counted component graphs
//!
//! Builds small dependency graphs out of probe components and checks hold
//! counting, the fail-fast initialization walk and the continue-on-error
//! teardown walk.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use keystone_core::lifecycle::{Lifecycle, LifecycleConfig, LifecycleError};
use keystone_core::registry::{RegistryError, Token};
use keystone_runtime::component::Component;
use keystone_runtime::registry::Registry;
use keystone_testing::{ProbeHooks, ProbeOutcome, init_tracing};
use proptest::prelude::*;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

type Probe = Component<ProbeHooks>;

const STORAGE: Token<Probe> = Token::new("storage");
const AUTH: Token<Probe> = Token::new("auth");
const PROFILE: Token<Probe> = Token::new("profile");

fn leaf(registry: &Registry, token: &Token<Probe>, hooks: ProbeHooks) -> Arc<Probe> {
    let component = Arc::new(Component::new(token.name(), registry, hooks));
    registry.register_component(token, Arc::clone(&component));
    component
}

fn node(registry: &Registry, token: &Token<Probe>, deps: &[&Token<Probe>], hooks: ProbeHooks) -> Arc<Probe> {
    let component = Arc::new(
        Component::build(token.name(), registry, |scope| {
            for dep in deps {
                scope.add_dependency(*dep)?;
            }
            Ok::<_, RegistryError>(hooks)
        })
        .unwrap(),
    );
    registry.register_component(token, Arc::clone(&component));
    component
}

// ============================================================================
// Hold counting
// ============================================================================

#[tokio::test]
async fn test_nested_holds_set_up_and_tear_down_once() {
    init_tracing();
    let registry = Registry::new();
    let storage = leaf(&registry, &STORAGE, ProbeHooks::default());
    let auth = node(&registry, &AUTH, &[&STORAGE], ProbeHooks::default());
    let config = LifecycleConfig::default();

    for _ in 0..4 {
        assert_eq!(auth.initialize(&config).await, Ok(true));
    }
    assert_eq!(storage.hold_count(), 1, "the cascade only runs on the first hold");

    for _ in 0..4 {
        assert_eq!(auth.end(&config).await, Ok(true));
    }

    assert_eq!(auth.setup_calls(), 1);
    assert_eq!(auth.teardown_calls(), 1);
    assert_eq!(storage.setup_calls(), 1);
    assert_eq!(storage.teardown_calls(), 1);
    assert!(!storage.is_initialized());
}

#[tokio::test]
async fn test_diamond_shares_one_instance() {
    let registry = Registry::new();
    let storage = leaf(&registry, &STORAGE, ProbeHooks::default());
    let auth = node(&registry, &AUTH, &[&STORAGE], ProbeHooks::default());
    let profile = node(&registry, &PROFILE, &[&STORAGE, &AUTH], ProbeHooks::default());
    let config = LifecycleConfig::default();

    profile.initialize(&config).await.unwrap();
    // profile holds storage directly and through auth
    assert_eq!(storage.hold_count(), 2);
    assert_eq!(storage.setup_calls(), 1);
    assert!(storage.setup_sequence() < auth.setup_sequence());
    assert!(auth.setup_sequence() < profile.setup_sequence());

    profile.end(&config).await.unwrap();
    assert_eq!(storage.hold_count(), 0);
    assert_eq!(storage.teardown_calls(), 1);
    // Own teardown runs before dependencies are ended
    assert!(profile.teardown_sequence() < auth.teardown_sequence());
}

// ============================================================================
// Failure asymmetry
// ============================================================================

#[tokio::test]
async fn test_failing_dependency_blocks_dependent_setup() {
    let registry = Registry::new();
    leaf(&registry, &STORAGE, ProbeHooks::with_setup(ProbeOutcome::Fail("disk full")));
    let profile = node(&registry, &PROFILE, &[&STORAGE], ProbeHooks::default());

    let error = profile.initialize(&LifecycleConfig::default()).await.unwrap_err();

    assert_eq!(profile.setup_calls(), 0);
    assert!(!profile.is_initialized());
    match error {
        LifecycleError::DependencyFailed {
            component,
            dependency,
            reason,
        } => {
            assert_eq!(component, "profile");
            assert_eq!(dependency, "storage");
            assert!(matches!(*reason, LifecycleError::SetupFailed { .. }));
        },
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_failure_propagates_through_intermediate_dependencies() {
    let registry = Registry::new();
    leaf(&registry, &STORAGE, ProbeHooks::with_setup(ProbeOutcome::Decline));
    let auth = node(&registry, &AUTH, &[&STORAGE], ProbeHooks::default());
    let profile = node(&registry, &PROFILE, &[&AUTH], ProbeHooks::default());

    let error = profile.initialize(&LifecycleConfig::default()).await.unwrap_err();

    let LifecycleError::DependencyFailed { reason, .. } = error else {
        panic!("expected nested dependency failure");
    };
    assert!(matches!(*reason, LifecycleError::DependencyDeclined { .. }));
    assert_eq!(auth.setup_calls(), 0);
    assert_eq!(profile.setup_calls(), 0);
}

#[tokio::test]
async fn test_init_fails_fast_while_teardown_continues() {
    let registry = Registry::new();
    let storage = leaf(&registry, &STORAGE, ProbeHooks::with_teardown(ProbeOutcome::Fail("flush failed")));
    let auth = leaf(&registry, &AUTH, ProbeHooks::default());
    let profile = node(&registry, &PROFILE, &[&STORAGE, &AUTH], ProbeHooks::default());
    let config = LifecycleConfig::default();

    profile.initialize(&config).await.unwrap();
    let error = profile.end(&config).await.unwrap_err();

    let LifecycleError::TeardownFailed { failures, .. } = error else {
        panic!("expected aggregated teardown failure");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(auth.teardown_calls(), 1, "teardown continues past the failing dependency");
    assert!(!profile.is_initialized());
    assert_eq!(storage.hold_count(), 0);

    // Same graph, failing at init: the walk stops at the first dependency
    let registry = Registry::new();
    leaf(&registry, &STORAGE, ProbeHooks::with_setup(ProbeOutcome::Fail("offline")));
    let auth = leaf(&registry, &AUTH, ProbeHooks::default());
    let profile = node(&registry, &PROFILE, &[&STORAGE, &AUTH], ProbeHooks::default());

    assert!(profile.initialize(&config).await.is_err());
    assert_eq!(auth.setup_calls(), 0, "initialization stops at the first failure");
}

// ============================================================================
// Dynamic dependencies
// ============================================================================

#[tokio::test]
async fn test_remove_dependency_respects_other_owners() {
    let registry = Registry::new();
    let storage = leaf(&registry, &STORAGE, ProbeHooks::default());
    let auth = node(&registry, &AUTH, &[&STORAGE], ProbeHooks::default());
    let profile = node(&registry, &PROFILE, &[&STORAGE], ProbeHooks::default());
    let config = LifecycleConfig::default();

    auth.initialize(&config).await.unwrap();
    profile.initialize(&config).await.unwrap();
    assert_eq!(storage.hold_count(), 2);

    assert_eq!(profile.remove_dependency(&STORAGE, &config).await, Ok(true));
    assert_eq!(storage.hold_count(), 1);
    assert_eq!(storage.teardown_calls(), 0);
    assert!(profile.dependency_names().is_empty());

    // Ending profile no longer touches storage
    profile.end(&config).await.unwrap();
    assert_eq!(storage.hold_count(), 1);

    auth.end(&config).await.unwrap();
    assert_eq!(storage.hold_count(), 0);
    assert_eq!(storage.teardown_calls(), 1);
}

#[tokio::test]
async fn test_reactivation_uses_a_new_generation() {
    let registry = Registry::new();
    let storage = leaf(&registry, &STORAGE, ProbeHooks::default());
    let config = LifecycleConfig::default();

    storage.initialize(&config).await.unwrap();
    let first = storage.generation();
    storage.end(&config).await.unwrap();
    storage.initialize(&config).await.unwrap();

    assert_ne!(storage.generation(), first);
    assert_eq!(storage.setup_calls(), 2);
    assert!(storage.is_initialized());
}

#[tokio::test]
async fn test_concurrent_initialize_runs_setup_once() {
    let registry = Registry::new();
    let storage = Arc::new(Component::new(
        "storage",
        &registry,
        ProbeHooks::default().with_setup_delay(std::time::Duration::from_millis(20)),
    ));
    let config = LifecycleConfig::default();

    let (a, b) = tokio::join!(storage.initialize(&config), storage.initialize(&config));
    assert_eq!((a, b), (Ok(true), Ok(true)));
    assert_eq!(storage.setup_calls(), 1);
    assert_eq!(storage.hold_count(), 2);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_balanced_holds_run_each_transition_once(holds in 1_usize..16) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let registry = Registry::new();
            let storage = leaf(&registry, &STORAGE, ProbeHooks::default());
            let auth = node(&registry, &AUTH, &[&STORAGE], ProbeHooks::default());
            let config = LifecycleConfig::default();

            for _ in 0..holds {
                auth.initialize(&config).await.unwrap();
            }
            for _ in 0..holds {
                auth.end(&config).await.unwrap();
            }

            prop_assert_eq!(auth.setup_calls(), 1);
            prop_assert_eq!(auth.teardown_calls(), 1);
            prop_assert_eq!(storage.setup_calls(), 1);
            prop_assert_eq!(storage.teardown_calls(), 1);
            prop_assert_eq!(auth.hold_count(), 0);
            Ok(())
        })?;
    }
}
