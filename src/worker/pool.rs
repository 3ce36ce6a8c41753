//! Worker pool: lifecycle, resource accounting, restart bookkeeping.
//!
//! The pool owns every worker's runtime state behind one lock. Callers
//! copy snapshots out and release the lock before doing anything slow;
//! executions themselves run in the scheduler's spawn, not under the lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{CancelSignal, CancelToken, Worker, WorkerId, WorkerType};
use crate::error::{OrchestratorError, Result};
use crate::task::{ResourceEnvelope, TaskId, TaskType};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Created,
    Initializing,
    Ready,
    Idle,
    Busy,
    Error,
    /// Did not honor a cancellation within the graceful window.
    Unresponsive,
    Terminating,
    Terminated,
}

impl WorkerState {
    /// Counts toward the active-worker ceiling.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Terminating | Self::Terminated)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn can_transition(&self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Created, Initializing)
                | (Initializing, Ready)
                | (Ready, Idle)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Idle | Busy | Ready | Unresponsive, Error)
                | (Error, Idle)
                | (Busy, Unresponsive)
                | (
                    Created | Initializing | Ready | Idle | Busy | Error | Unresponsive,
                    Terminating
                )
                | (Terminating, Terminated)
        )
    }
}

/// Immutable description of a worker, captured at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: WorkerId,
    pub worker_type: WorkerType,
    pub capabilities: std::collections::HashSet<String>,
    pub resource_cap: ResourceEnvelope,
    pub priority_weight: f64,
}

impl WorkerSpec {
    pub fn of(worker: &dyn Worker) -> Self {
        Self {
            id: worker.id().clone(),
            worker_type: worker.worker_type(),
            capabilities: worker.capabilities().clone(),
            resource_cap: worker.resource_cap(),
            priority_weight: worker.priority_weight(),
        }
    }
}

/// Per-task-type execution counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TypeStats {
    pub completed: u64,
    pub failed: u64,
}

impl TypeStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.completed + self.failed;
        if total == 0 {
            // Unproven workers score a neutral default.
            0.5
        } else {
            self.completed as f64 / total as f64
        }
    }
}

/// Mutable execution metrics for one worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub busy_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub per_type: HashMap<TaskType, TypeStats>,
    /// Reservation of the task currently executing, if any.
    pub resource_in_use: ResourceEnvelope,
}

impl WorkerMetrics {
    pub fn record(&mut self, task_type: TaskType, success: bool, duration_ms: u64) {
        let stats = self.per_type.entry(task_type).or_default();
        if success {
            self.tasks_completed += 1;
            stats.completed += 1;
        } else {
            self.tasks_failed += 1;
            stats.failed += 1;
        }
        self.busy_ms += duration_ms;
    }

    pub fn success_rate_for(&self, task_type: TaskType) -> f64 {
        self.per_type
            .get(&task_type)
            .copied()
            .unwrap_or_default()
            .success_rate()
    }
}

/// Copy of a worker's state handed to strategies and checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub spec: WorkerSpec,
    pub state: WorkerState,
    pub current_task: Option<TaskId>,
    pub restart_count: u32,
    pub idle_since: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub metrics: WorkerMetrics,
}

struct WorkerEntry {
    worker: Arc<dyn Worker>,
    spec: WorkerSpec,
    state: WorkerState,
    current_task: Option<TaskId>,
    restart_count: u32,
    idle_since: Option<DateTime<Utc>>,
    last_health_at: Option<DateTime<Utc>>,
    restart_due: Option<DateTime<Utc>>,
    cancel: Option<CancelSignal>,
    cancel_deadline: Option<DateTime<Utc>>,
    metrics: WorkerMetrics,
}

impl WorkerEntry {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            spec: self.spec.clone(),
            state: self.state,
            current_task: self.current_task.clone(),
            restart_count: self.restart_count,
            idle_since: self.idle_since,
            last_health_at: self.last_health_at,
            metrics: self.metrics.clone(),
        }
    }

    fn transition(&mut self, to: WorkerState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(OrchestratorError::invalid_state(
                format!("worker state allowing {to:?}"),
                format!("{} is {:?}", self.spec.id, self.state),
            ));
        }
        self.state = to;
        Ok(())
    }
}

/// Aggregate pool statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub busy: usize,
    pub utilization: f64,
    pub resources_in_use: ResourceEnvelope,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// The worker registry and its resource accounting.
pub struct WorkerPool {
    inner: RwLock<HashMap<WorkerId, WorkerEntry>>,
    max_agents: usize,
    /// Upper bound any single worker's cap must fit within, if set.
    global_resource_cap: Option<ResourceEnvelope>,
}

impl WorkerPool {
    pub fn new(max_agents: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_agents,
            global_resource_cap: None,
        }
    }

    pub fn with_global_resource_cap(mut self, cap: ResourceEnvelope) -> Self {
        self.global_resource_cap = Some(cap);
        self
    }

    /// Register a worker in `Created` state.
    pub fn register(&self, worker: Arc<dyn Worker>) -> Result<WorkerId> {
        let spec = WorkerSpec::of(worker.as_ref());
        let id = spec.id.clone();

        if let Some(global) = &self.global_resource_cap {
            if !spec.resource_cap.fits_within(global) {
                return Err(OrchestratorError::ResourceExhausted(format!(
                    "worker {id} reserves beyond the global resource limits"
                )));
            }
        }

        let mut inner = self.inner.write();
        let active = inner.values().filter(|e| e.state.is_active()).count();
        if active >= self.max_agents {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "worker ceiling reached: {active} active at limit {}",
                self.max_agents
            )));
        }
        if inner.contains_key(&id) {
            return Err(OrchestratorError::InvalidArgument(format!(
                "worker {id} already registered"
            )));
        }

        inner.insert(
            id.clone(),
            WorkerEntry {
                worker,
                spec,
                state: WorkerState::Created,
                current_task: None,
                restart_count: 0,
                idle_since: None,
                last_health_at: None,
                restart_due: None,
                cancel: None,
                cancel_deadline: None,
                metrics: WorkerMetrics::default(),
            },
        );
        debug!(worker_id = %id, "Worker registered");
        Ok(id)
    }

    /// Drive Created → Initializing → Ready → Idle.
    pub fn activate(&self, id: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {id}")))?;
        entry.transition(WorkerState::Initializing)?;
        entry.transition(WorkerState::Ready)?;
        entry.transition(WorkerState::Idle)?;
        entry.idle_since = Some(now);
        entry.last_health_at = Some(now);
        info!(worker_id = %id, worker_type = %entry.spec.worker_type, "Worker ready");
        Ok(())
    }

    /// Move an idle worker to Busy and hand back its executor + a fresh
    /// cancellation token.
    pub fn begin_assignment(
        &self,
        id: &WorkerId,
        task_id: &TaskId,
        reservation: ResourceEnvelope,
    ) -> Result<(Arc<dyn Worker>, CancelToken)> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {id}")))?;

        if entry.state != WorkerState::Idle {
            return Err(OrchestratorError::invalid_state(
                "Idle worker",
                format!("{id} is {:?}", entry.state),
            ));
        }

        entry.transition(WorkerState::Busy)?;
        entry.current_task = Some(task_id.clone());
        entry.idle_since = None;
        entry.metrics.resource_in_use = reservation;
        let (signal, token) = CancelToken::pair();
        entry.cancel = Some(signal);
        entry.cancel_deadline = None;
        Ok((Arc::clone(&entry.worker), token))
    }

    /// Record an execution outcome and return the worker to Idle.
    ///
    /// Ignored with `Ok(false)` when the completion is stale, i.e. the
    /// worker has already been reassigned, restarted, or removed.
    pub fn finish_assignment(
        &self,
        id: &WorkerId,
        task_id: &TaskId,
        task_type: TaskType,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(id) else {
            return Ok(false);
        };
        if entry.state != WorkerState::Busy || entry.current_task.as_ref() != Some(task_id) {
            return Ok(false);
        }

        entry.metrics.record(task_type, success, duration_ms);
        if let Some(message) = error {
            entry.metrics.last_error = Some(message);
        }
        entry.metrics.resource_in_use = ResourceEnvelope::default();
        entry.current_task = None;
        entry.cancel = None;
        entry.cancel_deadline = None;
        entry.transition(WorkerState::Idle)?;
        entry.idle_since = Some(now);
        Ok(true)
    }

    /// Fire the cancel signal for whatever the worker is running.
    pub fn request_cancel(&self, id: &WorkerId, deadline: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        let Some(entry) = inner.get_mut(id) else {
            return false;
        };
        if let Some(cancel) = &entry.cancel {
            cancel.cancel();
            entry.cancel_deadline = Some(deadline);
            true
        } else {
            false
        }
    }

    /// Busy workers whose cancel deadline has passed become Unresponsive.
    ///
    /// Returns the orphaned `(worker, task)` pairs for the scheduler.
    pub fn collect_overdue_cancels(&self, now: DateTime<Utc>) -> Vec<(WorkerId, TaskId)> {
        let mut inner = self.inner.write();
        let mut overdue = Vec::new();
        for entry in inner.values_mut() {
            if entry.state == WorkerState::Busy
                && entry.cancel_deadline.map(|d| now > d).unwrap_or(false)
            {
                if let Some(task_id) = entry.current_task.take() {
                    warn!(
                        worker_id = %entry.spec.id,
                        task_id = %task_id,
                        "Worker missed the graceful cancel window"
                    );
                    let _ = entry.transition(WorkerState::Unresponsive);
                    entry.cancel = None;
                    entry.cancel_deadline = None;
                    entry.metrics.resource_in_use = ResourceEnvelope::default();
                    overdue.push((entry.spec.id.clone(), task_id));
                }
            }
        }
        overdue
    }

    /// Mark a worker failed; returns the task it was running, if any.
    pub fn mark_error(&self, id: &WorkerId, reason: &str) -> Option<TaskId> {
        let mut inner = self.inner.write();
        let entry = inner.get_mut(id)?;
        if let Some(cancel) = &entry.cancel {
            cancel.cancel();
        }
        let orphaned = entry.current_task.take();
        entry.cancel = None;
        entry.cancel_deadline = None;
        entry.metrics.last_error = Some(reason.to_string());
        entry.metrics.resource_in_use = ResourceEnvelope::default();
        let _ = entry.transition(WorkerState::Error);
        entry.idle_since = None;
        orphaned
    }

    pub fn record_health_ok(&self, id: &WorkerId, now: DateTime<Utc>) {
        if let Some(entry) = self.inner.write().get_mut(id) {
            entry.last_health_at = Some(now);
        }
    }

    /// Queue a restart attempt for an Error/Unresponsive worker.
    pub fn schedule_restart(&self, id: &WorkerId, due: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker {id}")))?;
        if !matches!(entry.state, WorkerState::Error | WorkerState::Unresponsive) {
            return Err(OrchestratorError::invalid_state(
                "Error or Unresponsive worker",
                format!("{id} is {:?}", entry.state),
            ));
        }
        if entry.state == WorkerState::Unresponsive {
            entry.transition(WorkerState::Error)?;
        }
        entry.restart_due = Some(due);
        Ok(())
    }

    /// Bring due restarts back to Idle; returns the restarted ids.
    pub fn process_due_restarts(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let mut inner = self.inner.write();
        let mut restarted = Vec::new();
        for entry in inner.values_mut() {
            if entry.state == WorkerState::Error
                && entry.restart_due.map(|d| now >= d).unwrap_or(false)
            {
                entry.restart_due = None;
                entry.restart_count += 1;
                if entry.transition(WorkerState::Idle).is_ok() {
                    entry.idle_since = Some(now);
                    entry.last_health_at = Some(now);
                    info!(
                        worker_id = %entry.spec.id,
                        restart_count = entry.restart_count,
                        "Worker restarted"
                    );
                    restarted.push(entry.spec.id.clone());
                }
            }
        }
        restarted
    }

    /// Remove a worker permanently; returns its final snapshot.
    pub fn remove(&self, id: &WorkerId) -> Option<WorkerSnapshot> {
        let mut inner = self.inner.write();
        let mut entry = inner.remove(id)?;
        if let Some(cancel) = &entry.cancel {
            cancel.cancel();
        }
        let _ = entry.transition(WorkerState::Terminating);
        let _ = entry.transition(WorkerState::Terminated);
        info!(worker_id = %id, "Worker terminated");
        Some(entry.snapshot())
    }

    /// Idle workers eligible for scale-down, oldest idle first. Busy
    /// workers are included only when `force` is set.
    pub fn scale_down_candidates(&self, n: usize, force: bool) -> Vec<WorkerId> {
        let inner = self.inner.read();
        let mut idle: Vec<_> = inner
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .collect();
        idle.sort_by_key(|e| (e.idle_since, e.spec.id.clone()));

        let mut candidates: Vec<WorkerId> =
            idle.into_iter().take(n).map(|e| e.spec.id.clone()).collect();

        if force && candidates.len() < n {
            let mut busy: Vec<_> = inner
                .values()
                .filter(|e| e.state == WorkerState::Busy)
                .map(|e| e.spec.id.clone())
                .collect();
            busy.sort();
            candidates.extend(busy.into_iter().take(n - candidates.len()));
        }
        candidates
    }

    pub fn snapshot(&self, id: &WorkerId) -> Option<WorkerSnapshot> {
        self.inner.read().get(id).map(WorkerEntry::snapshot)
    }

    pub fn idle_snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .read()
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .map(WorkerEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        snapshots
    }

    pub fn snapshot_all(&self) -> Vec<WorkerSnapshot> {
        let mut snapshots: Vec<_> = self
            .inner
            .read()
            .values()
            .map(WorkerEntry::snapshot)
            .collect();
        snapshots.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        snapshots
    }

    /// Active workers with their executors, for health probing.
    pub fn probe_targets(&self) -> Vec<(WorkerId, Arc<dyn Worker>, u32)> {
        self.inner
            .read()
            .values()
            .filter(|e| {
                matches!(
                    e.state,
                    WorkerState::Idle | WorkerState::Busy | WorkerState::Ready
                )
            })
            .map(|e| (e.spec.id.clone(), Arc::clone(&e.worker), e.restart_count))
            .collect()
    }

    pub fn restart_count(&self, id: &WorkerId) -> Option<u32> {
        self.inner.read().get(id).map(|e| e.restart_count)
    }

    /// Re-apply checkpointed metrics and restart counts to a live worker.
    pub fn restore_metrics(
        &self,
        id: &WorkerId,
        metrics: WorkerMetrics,
        restart_count: u32,
    ) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(id) {
            Some(entry) => {
                entry.metrics = metrics;
                entry.metrics.resource_in_use = ResourceEnvelope::default();
                entry.restart_count = restart_count;
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|e| e.state.is_active())
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|e| e.state == WorkerState::Idle)
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|e| e.state == WorkerState::Busy)
            .count()
    }

    /// Union of capability tags over active workers.
    pub fn capability_inventory(&self) -> std::collections::HashSet<String> {
        let inner = self.inner.read();
        let mut tags = std::collections::HashSet::new();
        for entry in inner.values().filter(|e| e.state.is_active()) {
            tags.extend(entry.spec.capabilities.iter().cloned());
        }
        tags
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.read();
        let mut stats = PoolStats {
            active: 0,
            idle: 0,
            busy: 0,
            utilization: 0.0,
            resources_in_use: ResourceEnvelope::default(),
            tasks_completed: 0,
            tasks_failed: 0,
        };
        for entry in inner.values() {
            if entry.state.is_active() {
                stats.active += 1;
            }
            match entry.state {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => {
                    stats.busy += 1;
                    stats.resources_in_use =
                        stats.resources_in_use.add(&entry.metrics.resource_in_use);
                }
                _ => {}
            }
            stats.tasks_completed += entry.metrics.tasks_completed;
            stats.tasks_failed += entry.metrics.tasks_failed;
        }
        if stats.active > 0 {
            stats.utilization = stats.busy as f64 / stats.active as f64;
        }
        stats
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents
    }
}
