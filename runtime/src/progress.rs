//! Per-change-type dispatch progress.
//!
//! Every dispatch of a change event opens a [`DispatchProgress`] record that
//! replaces the previous one for that type. Action starts and settlements
//! update it in place; observers read snapshots through
//! [`ProgressTracker::get`] or a `watch` receiver.

use chrono::{DateTime, Utc};
use keystone_core::action::ActionResult;
use keystone_core::change::{ChangeEvent, ChangeType};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Overall state of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// At least one action has not settled
    Running,
    /// Every action settled without error
    Completed,
    /// Every action settled and at least one failed
    Failed,
}

/// State of a single action within a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum ActionStatus {
    /// Queued, waiting for a slot
    Pending,
    /// Running
    Started,
    /// Settled with `Ok(_)`
    Completed,
    /// Settled with an error
    Failed(String),
}

/// Progress of one registered action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionProgress {
    /// Action name
    pub name: String,
    /// Current state
    pub status: ActionStatus,
}

/// Progress of the latest dispatch for a change type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchProgress {
    /// `{CHANGE_TYPE}_{timestamp_ms}` of the triggering event
    pub id: String,
    /// The dispatched change type
    pub change_type: ChangeType,
    /// Overall state
    pub status: DispatchStatus,
    /// When the dispatch began
    pub started_at: DateTime<Utc>,
    /// When the last action settled
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of actions dispatched
    pub total: usize,
    /// Number of actions settled successfully
    pub completed: usize,
    /// Number of actions settled with an error
    pub failed: usize,
    /// Most recently started action
    pub current_action: Option<String>,
    /// Per-action state, in registration order
    pub actions: Vec<ActionProgress>,
    #[serde(skip)]
    sequence: u64,
}

impl DispatchProgress {
    /// Whether every action has settled.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.completed + self.failed >= self.total
    }
}

/// Identifies one dispatch so late settlements of a replaced dispatch are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchKey {
    change_type: ChangeType,
    sequence: u64,
}

/// Latest progress record per change type.
pub type ProgressMap = HashMap<ChangeType, DispatchProgress>;

/// Shared progress store. Cloning yields a handle to the same store.
#[derive(Clone)]
pub struct ProgressTracker {
    records: Arc<watch::Sender<ProgressMap>>,
    next_sequence: Arc<AtomicU64>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        let (records, _) = watch::channel(ProgressMap::new());
        Self {
            records: Arc::new(records),
            next_sequence: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ProgressTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record for `event`, replacing the type's previous record.
    pub fn begin(&self, event: &ChangeEvent, action_names: &[String], now: DateTime<Utc>) -> DispatchKey {
        let key = DispatchKey {
            change_type: event.change_type,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
        };

        let record = DispatchProgress {
            id: event.dispatch_id(),
            change_type: event.change_type,
            status: DispatchStatus::Running,
            started_at: now,
            finished_at: None,
            total: action_names.len(),
            completed: 0,
            failed: 0,
            current_action: None,
            actions: action_names
                .iter()
                .map(|name| ActionProgress {
                    name: name.clone(),
                    status: ActionStatus::Pending,
                })
                .collect(),
            sequence: key.sequence,
        };

        self.records.send_modify(|records| {
            records.insert(key.change_type, record);
        });
        key
    }

    /// Mark the action at `index` as running.
    pub fn action_started(&self, key: DispatchKey, index: usize) {
        self.update(key, |record| {
            if let Some(action) = record.actions.get_mut(index) {
                action.status = ActionStatus::Started;
                record.current_action = Some(action.name.clone());
            }
        });
    }

    /// Record the settlement of the action at `index`.
    pub fn action_settled(&self, key: DispatchKey, index: usize, result: &ActionResult, now: DateTime<Utc>) {
        self.update(key, |record| {
            let Some(action) = record.actions.get_mut(index) else {
                return;
            };
            match result {
                Ok(_) => {
                    action.status = ActionStatus::Completed;
                    record.completed += 1;
                },
                Err(error) => {
                    action.status = ActionStatus::Failed(error.to_string());
                    record.failed += 1;
                },
            }

            if record.is_finished() {
                record.finished_at = Some(now);
                record.current_action = None;
                record.status = if record.failed == 0 {
                    DispatchStatus::Completed
                } else {
                    DispatchStatus::Failed
                };
            }
        });
    }

    /// Latest record for `change_type`.
    #[must_use]
    pub fn get(&self, change_type: ChangeType) -> Option<DispatchProgress> {
        self.records.borrow().get(&change_type).cloned()
    }

    /// Observe every change to the progress map.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ProgressMap> {
        self.records.subscribe()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.send_modify(ProgressMap::clear);
    }

    fn update(&self, key: DispatchKey, apply: impl FnOnce(&mut DispatchProgress)) {
        self.records.send_if_modified(|records| {
            match records.get_mut(&key.change_type) {
                Some(record) if record.sequence == key.sequence => {
                    apply(record);
                    true
                },
                _ => false,
            }
        });
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("records", &self.records.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;
    use keystone_core::action::ActionError;
    use keystone_core::change::ChangeSource;

    fn event(change_type: ChangeType, ms: i64) -> ChangeEvent {
        let at = Utc.timestamp_millis_opt(ms).unwrap();
        ChangeEvent::new(change_type, serde_json::Value::Null, at, ChangeSource::System)
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn tracks_actions_through_completion() {
        let tracker = ProgressTracker::new();
        let trigger = event(ChangeType::Login, 1_000);
        let key = tracker.begin(&trigger, &names(&["sync", "refresh"]), trigger.timestamp);

        let record = tracker.get(ChangeType::Login).unwrap();
        assert_eq!(record.id, "LOGIN_1000");
        assert_eq!(record.status, DispatchStatus::Running);
        assert_eq!(record.actions[0].status, ActionStatus::Pending);

        tracker.action_started(key, 0);
        assert_eq!(tracker.get(ChangeType::Login).unwrap().current_action.as_deref(), Some("sync"));

        tracker.action_settled(key, 0, &Ok(true), trigger.timestamp);
        tracker.action_started(key, 1);
        tracker.action_settled(key, 1, &Ok(false), trigger.timestamp);

        let record = tracker.get(ChangeType::Login).unwrap();
        assert_eq!(record.status, DispatchStatus::Completed);
        assert_eq!(record.completed, 2);
        assert!(record.finished_at.is_some());
        assert!(record.current_action.is_none());
    }

    #[test]
    fn any_error_fails_the_dispatch() {
        let tracker = ProgressTracker::new();
        let trigger = event(ChangeType::Chat, 5);
        let key = tracker.begin(&trigger, &names(&["a", "b"]), trigger.timestamp);

        tracker.action_settled(key, 0, &Err(ActionError::failed("quota")), trigger.timestamp);
        assert_eq!(tracker.get(ChangeType::Chat).unwrap().status, DispatchStatus::Running);

        tracker.action_settled(key, 1, &Ok(true), trigger.timestamp);
        let record = tracker.get(ChangeType::Chat).unwrap();
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.actions[0].status, ActionStatus::Failed("Action failed: quota".to_string()));
    }

    #[test]
    fn newer_dispatch_ignores_stale_settlements() {
        let tracker = ProgressTracker::new();
        let first = event(ChangeType::Signup, 1);
        let second = event(ChangeType::Signup, 2);
        let stale = tracker.begin(&first, &names(&["a"]), first.timestamp);
        tracker.begin(&second, &names(&["a"]), second.timestamp);

        tracker.action_settled(stale, 0, &Ok(true), second.timestamp);

        let record = tracker.get(ChangeType::Signup).unwrap();
        assert_eq!(record.id, "SIGNUP_2");
        assert_eq!(record.completed, 0);
    }

    #[tokio::test]
    async fn watchers_see_updates() {
        let tracker = ProgressTracker::new();
        let mut rx = tracker.watch();
        let trigger = event(ChangeType::Auth, 9);

        tracker.begin(&trigger, &names(&["a"]), trigger.timestamp);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().contains_key(&ChangeType::Auth));

        tracker.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_empty());
    }
}
