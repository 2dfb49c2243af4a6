//! Probes recording how actions and components were driven.

use keystone_core::action::Action;
use keystone_core::change::ChangeType;
use keystone_core::lifecycle::{LifecycleConfig, LifecycleError, LifecycleFuture, LifecycleResult};
use keystone_runtime::component::{Hooks, Scope};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Global order of probe events, shared by every probe in the process.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

#[derive(Default)]
struct ActionCounters {
    calls: AtomicUsize,
    completions: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    payloads: Mutex<Vec<Value>>,
}

/// Builds actions that count invocations, track concurrency and optionally
/// sleep or fail.
///
/// ```
/// use keystone_testing::ActionProbe;
/// use keystone_core::change::ChangeType;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let probe = ActionProbe::new().failing("quota exceeded");
/// let action = probe.action(ChangeType::Chat, "summarize");
///
/// assert!(action.invoke(serde_json::json!({"id": 1})).await.is_err());
/// assert_eq!(probe.calls(), 1);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ActionProbe {
    counters: Arc<ActionCounters>,
    delay: Duration,
    failure: Option<&'static str>,
}

impl ActionProbe {
    /// A probe whose actions succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every action sleep for `delay` before settling.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every action fail with `reason`.
    #[must_use]
    pub const fn failing(mut self, reason: &'static str) -> Self {
        self.failure = Some(reason);
        self
    }

    /// Build an action reporting to this probe.
    #[must_use]
    pub fn action(&self, change_type: ChangeType, name: impl Into<String>) -> Action {
        let counters = Arc::clone(&self.counters);
        let delay = self.delay;
        let failure = self.failure;

        Action::new(change_type, name, move |payload| {
            let counters = Arc::clone(&counters);
            async move {
                counters.calls.fetch_add(1, Ordering::SeqCst);
                lock(&counters.payloads).push(payload);

                let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
                counters.peak.fetch_max(now, Ordering::SeqCst);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                counters.running.fetch_sub(1, Ordering::SeqCst);
                counters.completions.fetch_add(1, Ordering::SeqCst);

                failure.map_or(Ok(()), Err)
            }
        })
    }

    /// Number of times any of this probe's actions started.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.counters.calls.load(Ordering::SeqCst)
    }

    /// Number of actions that reached the end of their body.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.counters.completions.load(Ordering::SeqCst)
    }

    /// Highest number of this probe's actions observed running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Payloads received, in start order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Value> {
        lock(&self.counters.payloads).clone()
    }
}

/// Outcome a [`ProbeHooks`] hook reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// `Ok(true)`
    #[default]
    Succeed,
    /// `Ok(false)`
    Decline,
    /// `Err(SetupFailed)` with the given reason
    Fail(&'static str),
}

impl ProbeOutcome {
    fn result(self, component: &str) -> LifecycleResult {
        match self {
            Self::Succeed => Ok(true),
            Self::Decline => Ok(false),
            Self::Fail(reason) => Err(LifecycleError::setup(component, reason)),
        }
    }
}

/// Component hooks that count setup/teardown and report a chosen outcome.
#[derive(Debug, Default)]
pub struct ProbeHooks {
    setup: ProbeOutcome,
    teardown: ProbeOutcome,
    setup_delay: Duration,
    setups: AtomicUsize,
    teardowns: AtomicUsize,
    setup_sequence: Mutex<Option<u64>>,
    teardown_sequence: Mutex<Option<u64>>,
}

impl ProbeHooks {
    /// Hooks whose setup reports `outcome`.
    #[must_use]
    pub fn with_setup(outcome: ProbeOutcome) -> Self {
        Self {
            setup: outcome,
            ..Self::default()
        }
    }

    /// Hooks whose teardown reports `outcome`.
    #[must_use]
    pub fn with_teardown(outcome: ProbeOutcome) -> Self {
        Self {
            teardown: outcome,
            ..Self::default()
        }
    }

    /// Make setup sleep for `delay` first.
    #[must_use]
    pub fn with_setup_delay(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    /// Times setup ran.
    #[must_use]
    pub fn setup_calls(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    /// Times teardown ran.
    #[must_use]
    pub fn teardown_calls(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// Global sequence number of the latest setup.
    #[must_use]
    pub fn setup_sequence(&self) -> Option<u64> {
        *lock(&self.setup_sequence)
    }

    /// Global sequence number of the latest teardown.
    #[must_use]
    pub fn teardown_sequence(&self) -> Option<u64> {
        *lock(&self.teardown_sequence)
    }
}

impl Hooks for ProbeHooks {
    fn on_initialize<'a>(&'a self, scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async move {
            if !self.setup_delay.is_zero() {
                tokio::time::sleep(self.setup_delay).await;
            }
            self.setups.fetch_add(1, Ordering::SeqCst);
            *lock(&self.setup_sequence) = Some(next_sequence());
            self.setup.result(scope.name())
        })
    }

    fn on_end<'a>(&'a self, scope: &'a Scope, _config: &'a LifecycleConfig) -> LifecycleFuture<'a> {
        Box::pin(async move {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            *lock(&self.teardown_sequence) = Some(next_sequence());
            self.teardown.result(scope.name())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_actions_record_payloads_and_failures() {
        let probe = ActionProbe::new().failing("nope");
        let action = probe.action(ChangeType::Auth, "check");

        let result = tokio_test::block_on(action.invoke(serde_json::json!("token")));

        assert!(result.is_err());
        assert_eq!(probe.calls(), 1);
        assert_eq!(probe.completions(), 1);
        assert_eq!(probe.payloads(), vec![serde_json::json!("token")]);
        assert_eq!(probe.peak_concurrency(), 1);
    }

    #[test]
    fn outcomes_map_to_lifecycle_results() {
        assert_eq!(ProbeOutcome::Succeed.result("svc"), Ok(true));
        assert_eq!(ProbeOutcome::Decline.result("svc"), Ok(false));
        assert!(matches!(
            ProbeOutcome::Fail("x").result("svc"),
            Err(LifecycleError::SetupFailed { .. })
        ));
    }
}
