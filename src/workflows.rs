// ============================================================================
// WORKFLOW TRACKER
// ============================================================================
// Progress of long-running backend workflows (assessments, scans):
// - First `workflow_progress` frame for an id creates the entry
// - Later frames shallow-merge; present fields overwrite, absent ones stay
// - Finished workflows are pruned once idle past the retention period,
//   measured against the newest update time seen
// ============================================================================

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::types::Timestamp;
use crate::DEFAULT_WORKFLOW_RETENTION_SECS;

/// Statuses after which a workflow no longer changes
pub const TERMINAL_STATUSES: [&str; 3] = ["completed", "failed", "cancelled"];

/// Prefix identifying assessment workflows
pub const ASSESSMENT_PREFIX: &str = "assessment_";

/// A normalized `workflow_progress` payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowUpdate {
    pub workflow_id: String,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    /// Every other payload field
    pub fields: Map<String, JsonValue>,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub status: Option<String>,
    pub progress: Option<f64>,
    pub current_step: Option<String>,
    pub fields: Map<String, JsonValue>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| TERMINAL_STATUSES.contains(&s))
    }

    pub fn is_completed(&self) -> bool {
        self.status.as_deref() == Some("completed")
    }

    /// Assessment this workflow belongs to, from an explicit
    /// `assessment_id` field or an `assessment_<X>` workflow id.
    pub fn assessment_id(&self) -> Option<String> {
        match self.fields.get("assessment_id") {
            Some(JsonValue::String(id)) => return Some(id.clone()),
            Some(JsonValue::Number(id)) => return Some(id.to_string()),
            _ => {}
        }
        self.workflow_id
            .strip_prefix(ASSESSMENT_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowChange {
    Created,
    Updated {
        /// Status moved to a different value in this update
        status_changed: bool,
    },
}

#[derive(Debug)]
pub struct WorkflowTracker {
    workflows: BTreeMap<String, WorkflowState>,
    retention: Duration,
    pruned: u64,
}

impl Default for WorkflowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowTracker {
    pub fn new() -> Self {
        Self::with_retention(Duration::from_secs(DEFAULT_WORKFLOW_RETENTION_SECS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            workflows: BTreeMap::new(),
            retention,
            pruned: 0,
        }
    }

    /// Merge one update, then prune finished workflows idle past the
    /// retention period relative to the update's time.
    pub fn apply(&mut self, update: WorkflowUpdate) -> WorkflowChange {
        let now = update.timestamp;
        let change = self.merge(update);
        self.prune_finished(now);
        change
    }

    fn merge(&mut self, update: WorkflowUpdate) -> WorkflowChange {
        let progress = update.progress.map(|p| p.clamp(0.0, 100.0));
        match self.workflows.get_mut(&update.workflow_id) {
            Some(state) => {
                let status_changed = update.status.is_some() && update.status != state.status;
                if update.status.is_some() {
                    state.status = update.status;
                }
                if progress.is_some() {
                    state.progress = progress;
                }
                if update.current_step.is_some() {
                    state.current_step = update.current_step;
                }
                state.fields.extend(update.fields);
                state.updated_at = state.updated_at.max(update.timestamp);
                if status_changed {
                    debug!(target: "cerebro::console", workflow = %state.workflow_id,
                        status = ?state.status, "Workflow status changed");
                }
                WorkflowChange::Updated { status_changed }
            }
            None => {
                let state = WorkflowState {
                    workflow_id: update.workflow_id.clone(),
                    status: update.status,
                    progress,
                    current_step: update.current_step,
                    fields: update.fields,
                    created_at: update.timestamp,
                    updated_at: update.timestamp,
                };
                self.workflows.insert(update.workflow_id, state);
                WorkflowChange::Created
            }
        }
    }

    /// Drop terminal workflows whose last update is older than
    /// `now - retention`. Returns how many were dropped.
    pub fn prune_finished(&mut self, now: Timestamp) -> usize {
        let retention = self.retention;
        let before = self.workflows.len();
        self.workflows
            .retain(|_, state| !(state.is_terminal() && now.duration_since(state.updated_at) > retention));
        let removed = before - self.workflows.len();
        if removed > 0 {
            self.pruned += removed as u64;
            debug!(target: "cerebro::console", removed, "Pruned finished workflows");
        }
        removed
    }

    pub fn pruned_total(&self) -> u64 {
        self.pruned
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn get(&self, workflow_id: &str) -> Option<&WorkflowState> {
        self.workflows.get(workflow_id)
    }

    /// Workflows ordered by id
    pub fn list(&self) -> Vec<WorkflowState> {
        self.workflows.values().cloned().collect()
    }

    pub fn active(&self) -> impl Iterator<Item = &WorkflowState> + '_ {
        self.workflows.values().filter(|w| !w.is_terminal())
    }

    pub fn remove(&mut self, workflow_id: &str) -> Option<WorkflowState> {
        self.workflows.remove(workflow_id)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    pub fn clear(&mut self) {
        self.workflows.clear();
    }
}
