//! The scheduling core.
//!
//! One logical loop drives everything: drain worker completions, admit due
//! retries, resolve dependencies into the ready queue, assign tier-FIFO
//! against the strategy, then sweep timeouts. Every entry point takes
//! `now` explicitly so a test can replay the loop under a fixed clock and
//! observe identical assignment sequences.
//!
//! Lock discipline: the scheduler state (graph + queue) lives behind one
//! mutex, the pool behind its own. The two are never held together:
//! idle-worker snapshots are copied out before scheduling decisions, and
//! events are buffered and published after locks are released.

pub mod backoff;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, OrchestratorError, Result};
use crate::event::{Event, EventBus, EventKind};
use crate::strategy::{AssignmentStrategy, PoolSignals, TaskView};
use crate::task::{
    CascadePolicy, QueueEntry, ReadyQueue, Task, TaskGraph, TaskId, TaskNode, TaskResult,
    TaskStatus, TaskType,
};
use crate::worker::{TaskAssignment, WorkerId, WorkerPool};

/// Outcome of one execution attempt, sent back over the completion channel.
#[derive(Debug)]
pub struct Completion {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: Result<serde_json::Value>,
}

/// What a single tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub assigned: usize,
    pub completed: usize,
    pub failed_attempts: usize,
    pub timed_out: usize,
    /// Workers that missed the graceful cancel window this tick.
    pub unresponsive_workers: Vec<WorkerId>,
    /// Terminal tasks removed by the retention sweep.
    pub swept_tasks: Vec<TaskId>,
}

/// Aggregate scheduler metrics.
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    pub tasks: crate::task::graph::TaskStats,
    pub queue_depth: usize,
    pub waiting_retries: usize,
}

impl SchedulerMetrics {
    pub fn success_rate(&self) -> f64 {
        self.tasks.success_rate()
    }
}

struct SchedulerState {
    graph: TaskGraph,
    queue: ReadyQueue,
    last_aging_at: Option<DateTime<Utc>>,
}

/// The dependency-aware, priority-ordered scheduler.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    pool: Arc<WorkerPool>,
    strategy: Arc<dyn AssignmentStrategy>,
    bus: Arc<EventBus>,
    config: OrchestratorConfig,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl Scheduler {
    pub fn new(
        config: OrchestratorConfig,
        pool: Arc<WorkerPool>,
        strategy: Arc<dyn AssignmentStrategy>,
        bus: Arc<EventBus>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(SchedulerState {
                graph: TaskGraph::new(config.cascade_policy),
                queue: ReadyQueue::new(),
                last_aging_at: None,
            }),
            pool,
            strategy,
            bus,
            config,
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
        }
    }

    /// Accept a task into the graph.
    ///
    /// Live duplicate ids are idempotent; terminal ids are rejected; the
    /// queue-full threshold counts everything not yet terminal.
    pub fn submit(&self, task: Task, now: DateTime<Utc>) -> Result<TaskId> {
        let id = task.id.clone();
        {
            let mut state = self.state.lock();

            if let Some(existing) = state.graph.get(&id) {
                if existing.status.is_terminal() {
                    return Err(OrchestratorError::InvalidArgument(format!(
                        "task id {id} already used by a terminal task"
                    )));
                }
                debug!(task_id = %id, "Duplicate live submission, idempotent");
                return Ok(id);
            }

            let live = state.graph.stats().live();
            if live >= self.config.max_queue_size {
                return Err(OrchestratorError::QueueFull {
                    pending: live,
                    limit: self.config.max_queue_size,
                });
            }

            state.graph.insert(task, now)?;
        }
        self.bus.publish(Event::task(EventKind::TaskSubmitted, id.as_str()));
        Ok(id)
    }

    /// One pass of the scheduling loop.
    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        self.run_tick(now, true)
    }

    /// A cooperative-pause pass: completions drain and timeouts fire, but
    /// no new task is assigned.
    pub fn tick_paused(&self, now: DateTime<Utc>) -> TickReport {
        self.run_tick(now, false)
    }

    fn run_tick(&self, now: DateTime<Utc>, assign: bool) -> TickReport {
        let mut report = TickReport::default();
        let mut events: Vec<Event> = Vec::new();
        let mut cascade_roots: Vec<TaskId> = Vec::new();

        self.drain_completions(now, &mut report, &mut events, &mut cascade_roots);

        for (worker_id, task_id) in self.pool.collect_overdue_cancels(now) {
            debug!(worker_id = %worker_id, task_id = %task_id, "Worker unresponsive to cancel");
            report.unresponsive_workers.push(worker_id);
        }

        if assign {
            self.admit_and_resolve(now, &mut events);
            report.assigned = self.assign(now, &mut events);
        }
        self.sweep_timeouts(now, &mut report, &mut events, &mut cascade_roots);
        self.apply_cascades(now, &cascade_roots, &mut events);

        report.swept_tasks = {
            let mut state = self.state.lock();
            state.graph.sweep_terminal(now, self.config.result_retention())
        };

        for event in events {
            self.bus.publish(event);
        }
        report
    }

    /// Phase 0: apply buffered execution outcomes.
    fn drain_completions(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
        events: &mut Vec<Event>,
        cascade_roots: &mut Vec<TaskId>,
    ) {
        loop {
            let completion = match self.completion_rx.lock().try_recv() {
                Ok(c) => c,
                Err(_) => break,
            };

            let success = completion.outcome.is_ok();
            let error_message = completion.outcome.as_ref().err().map(|e| e.to_string());
            let duration_ms = (now - completion.started_at).num_milliseconds().max(0) as u64;

            let _ = self.pool.finish_assignment(
                &completion.worker_id,
                &completion.task_id,
                completion.task_type,
                success,
                duration_ms,
                error_message.clone(),
                now,
            );

            let mut state = self.state.lock();
            let Some(node) = state.graph.get_mut(&completion.task_id) else {
                continue;
            };
            let current = node.status == TaskStatus::Running
                && node.assigned_worker.as_deref() == Some(completion.worker_id.as_str())
                && node.attempts == completion.attempt;
            if !current {
                debug!(task_id = %completion.task_id, "Stale completion ignored");
                continue;
            }

            match completion.outcome {
                Ok(output) => {
                    node.history.push(TaskResult {
                        task_id: completion.task_id.clone(),
                        worker_id: completion.worker_id.as_str().to_string(),
                        attempt: completion.attempt,
                        success: true,
                        output,
                        error: None,
                        started_at: completion.started_at,
                        ended_at: now,
                    });
                    node.status = TaskStatus::Completed;
                    node.ended_at = Some(now);
                    node.assigned_worker = None;
                    report.completed += 1;
                    events.push(
                        Event::task_with_worker(
                            EventKind::TaskCompleted,
                            completion.task_id.as_str(),
                            completion.worker_id.as_str(),
                        )
                        .with_attempt(completion.attempt),
                    );
                }
                Err(err) if err.kind() == ErrorKind::Cancelled => {
                    node.history.push(TaskResult {
                        task_id: completion.task_id.clone(),
                        worker_id: completion.worker_id.as_str().to_string(),
                        attempt: completion.attempt,
                        success: false,
                        output: serde_json::Value::Null,
                        error: Some(err.to_string()),
                        started_at: completion.started_at,
                        ended_at: now,
                    });
                    node.status = TaskStatus::Cancelled;
                    node.ended_at = Some(now);
                    node.assigned_worker = None;
                    events.push(Event::task(
                        EventKind::TaskCancelled,
                        completion.task_id.as_str(),
                    ));
                    cascade_roots.push(completion.task_id.clone());
                }
                Err(err) => {
                    report.failed_attempts += 1;
                    Self::fail_attempt(
                        &self.config,
                        node,
                        &err.to_string(),
                        false,
                        completion.started_at,
                        now,
                        events,
                        cascade_roots,
                    );
                }
            }
        }
    }

    /// Phases 1-2 plus aging: retries due now and newly unblocked tasks
    /// enter the queue at their priority tier.
    fn admit_and_resolve(&self, now: DateTime<Utc>, events: &mut Vec<Event>) {
        let mut state = self.state.lock();

        let due: Vec<TaskId> = state
            .graph
            .nodes()
            .filter(|n| n.status == TaskStatus::Pending)
            .filter(|n| n.next_retry_at.map(|at| at <= now).unwrap_or(false))
            .map(|n| n.id().clone())
            .collect();
        for id in due {
            if let Some(node) = state.graph.get_mut(&id) {
                node.next_retry_at = None;
                node.status = TaskStatus::Ready;
                let priority = node.task.priority;
                state.queue.push(id.clone(), priority, now);
                events.push(Event::task(EventKind::TaskReady, id.as_str()));
            }
        }

        for id in state.graph.ready_candidates() {
            if let Some(node) = state.graph.get_mut(&id) {
                node.status = TaskStatus::Ready;
                let priority = node.task.priority;
                state.queue.push(id.clone(), priority, now);
                events.push(Event::task(EventKind::TaskReady, id.as_str()));
            }
        }

        let age_due = state
            .last_aging_at
            .map(|at| now - at >= chrono::Duration::from_std(self.config.aging.interval()).unwrap_or_default())
            .unwrap_or(true);
        if age_due {
            state.last_aging_at = Some(now);
            let promoted = state.queue.age(now, self.config.aging.threshold());
            if !promoted.is_empty() {
                info!(count = promoted.len(), "Aged tasks promoted a tier");
            }
        }
    }

    /// Phase 3: pop tier-FIFO and let the strategy place each task.
    fn assign(&self, now: DateTime<Utc>, events: &mut Vec<Event>) -> usize {
        // Copied out before taking the scheduler lock; the two locks are
        // never held together.
        let mut idle = self.pool.idle_snapshot();
        if idle.is_empty() {
            return 0;
        }
        let signals = self.signals();

        struct Decision {
            entry: QueueEntry,
            worker_id: WorkerId,
            view: TaskView,
        }

        let mut decisions: Vec<Decision> = Vec::new();
        {
            let mut state = self.state.lock();
            while !idle.is_empty() {
                let Some(entry) = state.queue.pop() else { break };
                let Some(node) = state.graph.get_mut(&entry.task_id) else {
                    continue;
                };
                if node.status != TaskStatus::Ready {
                    continue;
                }

                let view = Self::view_of(node);
                match self.strategy.pick(&view, &idle, &signals) {
                    Some(worker_id) => {
                        node.status = TaskStatus::Assigned;
                        node.assigned_worker = Some(worker_id.as_str().to_string());
                        idle.retain(|w| w.spec.id != worker_id);
                        decisions.push(Decision {
                            entry,
                            worker_id,
                            view,
                        });
                    }
                    None => {
                        // Head stays put; the strategy may pick next tick.
                        state.queue.push_front(entry);
                        break;
                    }
                }
            }
        }

        let mut assigned = 0;
        for decision in decisions {
            let task_id = decision.entry.task_id.clone();
            match self.pool.begin_assignment(
                &decision.worker_id,
                &task_id,
                decision.view.resources,
            ) {
                Ok((worker, cancel)) => {
                    let (assignment, attempt) = {
                        let mut state = self.state.lock();
                        let Some(node) = state.graph.get_mut(&task_id) else {
                            continue;
                        };
                        node.status = TaskStatus::Running;
                        node.attempts += 1;
                        node.started_at = Some(now);
                        (
                            TaskAssignment {
                                task_id: task_id.clone(),
                                name: node.task.name.clone(),
                                task_type: node.task.task_type,
                                input: node.task.input.clone(),
                                attempt: node.attempts,
                                failed_dependencies: node.failed_dependencies.clone(),
                            },
                            node.attempts,
                        )
                    };

                    events.push(Event::task_with_worker(
                        EventKind::TaskAssigned,
                        task_id.as_str(),
                        decision.worker_id.as_str(),
                    ));
                    events.push(
                        Event::task_with_worker(
                            EventKind::TaskStarted,
                            task_id.as_str(),
                            decision.worker_id.as_str(),
                        )
                        .with_attempt(attempt),
                    );

                    let tx = self.completion_tx.clone();
                    let worker_id = decision.worker_id.clone();
                    let task_type = assignment.task_type;
                    let started_at = now;
                    tokio::spawn(async move {
                        let outcome = std::panic::AssertUnwindSafe(
                            worker.execute(assignment, cancel),
                        )
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(OrchestratorError::internal("worker execution panicked"))
                        });
                        let _ = tx.send(Completion {
                            task_id,
                            worker_id,
                            task_type,
                            attempt,
                            started_at,
                            outcome,
                        });
                    });
                    assigned += 1;
                }
                Err(err) => {
                    // The snapshot went stale; put the task back at its head.
                    warn!(
                        task_id = %task_id,
                        worker_id = %decision.worker_id,
                        error = %err,
                        "Assignment raced a worker state change"
                    );
                    let mut state = self.state.lock();
                    if let Some(node) = state.graph.get_mut(&task_id) {
                        node.status = TaskStatus::Ready;
                        node.assigned_worker = None;
                    }
                    state.queue.push_front(decision.entry);
                }
            }
        }
        assigned
    }

    /// Phase 4: running tasks past their timeout fail this attempt and
    /// the worker is asked to stop.
    fn sweep_timeouts(
        &self,
        now: DateTime<Utc>,
        report: &mut TickReport,
        events: &mut Vec<Event>,
        cascade_roots: &mut Vec<TaskId>,
    ) {
        let mut cancel_workers: Vec<WorkerId> = Vec::new();
        {
            let mut state = self.state.lock();
            let overdue: Vec<TaskId> = state
                .graph
                .nodes()
                .filter(|n| n.status == TaskStatus::Running)
                .filter(|n| {
                    let timeout = n.task.timeout().unwrap_or(self.config.default_timeout());
                    n.started_at
                        .map(|s| {
                            s + chrono::Duration::from_std(timeout).unwrap_or_default() < now
                        })
                        .unwrap_or(false)
                })
                .map(|n| n.id().clone())
                .collect();

            for id in overdue {
                let Some(node) = state.graph.get_mut(&id) else { continue };
                report.timed_out += 1;
                if let Some(worker) = node.assigned_worker.clone() {
                    cancel_workers.push(WorkerId::new(worker));
                }
                let started_at = node.started_at.unwrap_or(now);
                Self::fail_attempt(
                    &self.config,
                    node,
                    "execution timed out",
                    true,
                    started_at,
                    now,
                    events,
                    cascade_roots,
                );
            }
        }

        let deadline = now
            + chrono::Duration::from_std(self.config.graceful_cancel_window())
                .unwrap_or_default();
        for worker_id in cancel_workers {
            self.pool.request_cancel(&worker_id, deadline);
        }
    }

    /// Shared failure path: retry if budget and deadline allow, else
    /// terminal. The caller holds the state lock through `node`.
    #[allow(clippy::too_many_arguments)]
    fn fail_attempt(
        config: &OrchestratorConfig,
        node: &mut TaskNode,
        error: &str,
        timed_out: bool,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        events: &mut Vec<Event>,
        cascade_roots: &mut Vec<TaskId>,
    ) {
        let worker = node.assigned_worker.take().unwrap_or_default();
        node.history.push(TaskResult {
            task_id: node.id().clone(),
            worker_id: worker,
            attempt: node.attempts,
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.to_string()),
            started_at,
            ended_at: now,
        });

        let kind = if timed_out {
            EventKind::TaskTimedOut
        } else {
            EventKind::TaskFailed
        };
        events.push(
            Event::task(kind, node.id().as_str())
                .with_attempt(node.attempts)
                .with_error(error),
        );

        let mut policy = config.retry.clone();
        if let Some(max) = node.task.max_retries {
            policy.max_retries = max;
        }

        if node.attempts <= policy.max_retries {
            if let Some(at) =
                backoff::next_retry_at(&policy, node.attempts, now, node.task.deadline)
            {
                debug!(
                    task_id = %node.id(),
                    attempt = node.attempts,
                    retry_at = %at,
                    "Attempt failed, retry scheduled"
                );
                node.status = TaskStatus::Pending;
                node.next_retry_at = Some(at);
                node.started_at = None;
                return;
            }
            debug!(task_id = %node.id(), "Retry would pass the deadline, failing");
        }

        node.status = if timed_out {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        node.ended_at = Some(now);
        cascade_roots.push(node.id().clone());
    }

    /// Apply dependency-failure policies for every terminal failure seen
    /// this tick.
    fn apply_cascades(
        &self,
        now: DateTime<Utc>,
        roots: &[TaskId],
        events: &mut Vec<Event>,
    ) {
        if roots.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for root in roots {
            let outcome = state.graph.cascade_failure(root, now);
            for id in &outcome.cascade_failed {
                state.queue.remove(id);
                events.push(Event::task(EventKind::TaskCascadeFailed, id.as_str()));
            }
            for id in &outcome.skipped {
                state.queue.remove(id);
            }
        }
    }

    /// Mark a task cancelled and interrupt its worker if it is running.
    pub fn cancel(&self, id: &TaskId, now: DateTime<Utc>) -> Result<()> {
        let mut running_worker: Option<WorkerId> = None;
        {
            let mut state = self.state.lock();
            let node = state
                .graph
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;

            if node.status.is_terminal() {
                return Err(OrchestratorError::invalid_state(
                    "non-terminal task",
                    format!("{id} is {}", node.status),
                ));
            }

            if let Some(worker) = node.assigned_worker.take() {
                running_worker = Some(WorkerId::new(worker));
            }
            node.status = TaskStatus::Cancelled;
            node.ended_at = Some(now);
            node.next_retry_at = None;
            state.queue.remove(id);
        }

        if let Some(worker_id) = &running_worker {
            let deadline = now
                + chrono::Duration::from_std(self.config.graceful_cancel_window())
                    .unwrap_or_default();
            self.pool.request_cancel(worker_id, deadline);
        }

        self.bus.publish(Event::task(EventKind::TaskCancelled, id.as_str()));

        let mut events = Vec::new();
        self.apply_cascades(now, std::slice::from_ref(id), &mut events);
        for event in events {
            self.bus.publish(event);
        }
        info!(task_id = %id, "Task cancelled");
        Ok(())
    }

    /// Treat a lost worker's running task as a failed attempt.
    pub fn handle_worker_loss(&self, worker_id: &WorkerId, task_id: &TaskId, now: DateTime<Utc>) {
        let mut events = Vec::new();
        let mut cascade_roots = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(node) = state.graph.get_mut(task_id) {
                if node.status == TaskStatus::Running
                    && node.assigned_worker.as_deref() == Some(worker_id.as_str())
                {
                    Self::fail_attempt(
                        &self.config,
                        node,
                        &format!("worker {worker_id} failed"),
                        false,
                        node.started_at.unwrap_or(now),
                        now,
                        &mut events,
                        &mut cascade_roots,
                    );
                }
            }
        }
        self.apply_cascades(now, &cascade_roots, &mut events);
        for event in events {
            self.bus.publish(event);
        }
    }

    fn view_of(node: &TaskNode) -> TaskView {
        TaskView {
            id: node.id().clone(),
            task_type: node.task.task_type,
            priority: node.task.priority,
            capabilities: node.task.requirements.capabilities.clone(),
            resources: node.task.requirements.resources,
            dependency_count: node.task.requirements.dependencies.len(),
        }
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.state
            .lock()
            .graph
            .get(id)
            .map(|n| n.status)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))
    }

    /// Latest recorded attempt result, if any.
    pub fn result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        self.state
            .lock()
            .graph
            .get(id)
            .map(|n| n.latest_result().cloned())
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let state = self.state.lock();
        let waiting_retries = state
            .graph
            .nodes()
            .filter(|n| n.next_retry_at.is_some())
            .count();
        SchedulerMetrics {
            tasks: state.graph.stats(),
            queue_depth: state.queue.len(),
            waiting_retries,
        }
    }

    /// Live signals for the strategy and the autoscaler.
    pub fn signals(&self) -> PoolSignals {
        let pool = self.pool.stats();
        let state = self.state.lock();
        let stats = state.graph.stats();
        PoolSignals {
            utilization: pool.utilization,
            backlog: stats.pending + stats.ready,
            active_workers: pool.active,
            idle_workers: pool.idle,
        }
    }

    /// Whether any non-terminal task remains.
    pub fn has_live_tasks(&self) -> bool {
        self.state.lock().graph.stats().live() > 0
    }

    /// Clone of every task node, for checkpointing.
    pub fn graph_snapshot(&self) -> Vec<TaskNode> {
        let state = self.state.lock();
        let mut nodes: Vec<TaskNode> = state.graph.nodes().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Rebuild scheduler state from checkpointed nodes. Tasks that were
    /// in flight are re-run from Ready; at-least-once, not exactly-once.
    pub fn restore(&self, nodes: Vec<TaskNode>, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.graph = TaskGraph::new(self.config.cascade_policy);
        for mut node in nodes {
            if matches!(
                node.status,
                TaskStatus::Ready | TaskStatus::Assigned | TaskStatus::Running
            ) {
                node.status = TaskStatus::Ready;
                node.assigned_worker = None;
                node.started_at = None;
                let priority = node.task.priority;
                state.queue.push(node.id().clone(), priority, now);
            }
            state.graph.restore_node(node);
        }
    }

    /// Default cascade policy tasks inherit when they do not override it.
    pub fn default_cascade(&self) -> CascadePolicy {
        self.config.cascade_policy
    }
}
