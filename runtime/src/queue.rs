//! Bounded FIFO action queue.
//!
//! [`ActionQueue`] runs at most `max_concurrent` actions at a time. Pending
//! actions start in arrival order; completion order is whatever the actions
//! make it. Every submission yields an [`ActionTicket`] that resolves to an
//! [`ActionResult`], so failures (including panics) never escape the queue.
//!
//! ```text
//!  execute_action ──► pending (VecDeque) ──► schedule ──► running ≤ K
//!                                              ▲              │
//!                                              └── on settle ◄┘
//! ```
//!
//! # Example
//!
//! ```
//! use keystone_runtime::queue::ActionQueue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = ActionQueue::new("uploads", 2);
//! let ticket = queue.execute_action(|| async { true });
//! assert_eq!(ticket.await, Ok(true));
//! # }
//! ```

use crate::lock;
use crate::metrics::ActionQueueMetrics;
use futures::FutureExt;
use futures::future::BoxFuture;
use keystone_core::action::{ActionError, ActionResult, IntoActionResult, UNKNOWN_ACTION_ERROR};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// A job that has not been started yet. Invoking it produces the future.
type Job = Box<dyn FnOnce() -> BoxFuture<'static, ActionResult> + Send>;

struct PendingAction {
    job: Job,
    reply: oneshot::Sender<ActionResult>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingAction>,
    running: usize,
}

struct QueueInner {
    name: String,
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

/// FIFO task runner enforcing a concurrency limit.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct ActionQueue {
    inner: Arc<QueueInner>,
}

impl ActionQueue {
    /// Create a queue. A `max_concurrent` of 0 is clamped to 1.
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Maximum number of concurrently running actions.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Number of actions currently running.
    #[must_use]
    pub fn running_actions(&self) -> usize {
        lock(&self.inner.state).running
    }

    /// Number of actions waiting for a slot.
    #[must_use]
    pub fn pending_actions(&self) -> usize {
        lock(&self.inner.state).pending.len()
    }

    /// Whether anything is pending or running.
    #[must_use]
    pub fn has_active_actions(&self) -> bool {
        let state = lock(&self.inner.state);
        state.running > 0 || !state.pending.is_empty()
    }

    /// Append an action without starting anything.
    ///
    /// The action runs once a later [`execute_action`](Self::execute_action)
    /// or [`drain`](Self::drain) schedules it.
    pub fn queue_action<F, Fut, R>(&self, action: F) -> ActionTicket
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoActionResult + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            action().map(IntoActionResult::into_action_result).boxed()
        });

        lock(&self.inner.state)
            .pending
            .push_back(PendingAction { job, reply });

        ActionTicket { rx }
    }

    /// Append an action and immediately try to schedule.
    pub fn execute_action<F, Fut, R>(&self, action: F) -> ActionTicket
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoActionResult + 'static,
    {
        let ticket = self.queue_action(action);
        self.drain();
        ticket
    }

    /// Start pending actions while free slots remain.
    pub fn drain(&self) {
        while let Some(pending) = self.claim_slot() {
            self.start(pending);
        }
    }

    /// Pop the oldest pending action if a slot is free, marking it running.
    fn claim_slot(&self) -> Option<PendingAction> {
        let mut state = lock(&self.inner.state);
        if state.running >= self.inner.max_concurrent {
            return None;
        }
        let pending = state.pending.pop_front()?;
        state.running += 1;
        drop(state);

        ActionQueueMetrics::record_started(&self.inner.name);
        Some(pending)
    }

    fn release_slot(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.running = state.running.saturating_sub(1);
        }
        ActionQueueMetrics::record_finished(&self.inner.name);
    }

    fn start(&self, pending: PendingAction) {
        let PendingAction { job, reply } = pending;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(queue = %self.inner.name, "No tokio runtime available, failing action");
            self.release_slot();
            let _ = reply.send(Err(ActionError::NoRuntime));
            return;
        };

        tracing::trace!(
            queue = %self.inner.name,
            max = self.inner.max_concurrent,
            "Starting action"
        );

        let queue = self.clone();
        handle.spawn(async move {
            let result = run_job(job).await;
            queue.release_slot();
            queue.drain();
            // The submitter may have dropped its ticket; the result is then discarded.
            let _ = reply.send(result);
        });
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("ActionQueue")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("running", &state.running)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Run a job, containing panics raised while creating or polling its future.
async fn run_job(job: Job) -> ActionResult {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(future) => future,
        Err(payload) => return Err(ActionError::Panicked(panic_message(payload.as_ref()))),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ActionError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_ACTION_ERROR.to_string())
}

/// Completion handle for a submitted action.
///
/// Dropping the ticket does not cancel the action.
#[must_use = "dropping a ticket discards the action's result"]
#[derive(Debug)]
pub struct ActionTicket {
    rx: oneshot::Receiver<ActionResult>,
}

impl Future for ActionTicket {
    type Output = ActionResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ActionError::Abandoned)))
    }
}
