//! Dependency graph over submitted tasks.
//!
//! Owns the task map and the dependency/dependent indexes, answers
//! readiness queries, rejects cycles at submission, and cascades
//! dependency failures to descendants according to each task's policy.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Task, TaskId, TaskResult, TaskStatus};
use crate::error::{OrchestratorError, Result};

/// How a task reacts when one of its dependencies terminates in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// The task is marked `CascadeFailed` and never starts.
    #[default]
    Abort,
    /// The task is marked `Skipped`; its own dependents treat its output
    /// as empty and may still run.
    Skip,
    /// The task still runs, carrying a marker naming the failed dependency.
    Continue,
}

/// A task plus the mutable state the scheduler owns for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub task: Task,
    pub status: TaskStatus,
    pub attempts: u32,
    pub assigned_worker: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub history: Vec<TaskResult>,
    /// Dependencies that failed while this task's policy is `Continue`.
    pub failed_dependencies: Vec<TaskId>,
    pub cascade: CascadePolicy,
}

impl TaskNode {
    fn new(task: Task, default_cascade: CascadePolicy, now: DateTime<Utc>) -> Self {
        let cascade = task.on_dependency_failure.unwrap_or(default_cascade);
        Self {
            task,
            status: TaskStatus::Pending,
            attempts: 0,
            assigned_worker: None,
            submitted_at: now,
            started_at: None,
            ended_at: None,
            next_retry_at: None,
            history: Vec::new(),
            failed_dependencies: Vec::new(),
            cascade,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.task.id
    }

    pub fn latest_result(&self) -> Option<&TaskResult> {
        self.history.last()
    }
}

/// Descendant transitions produced by a terminal failure.
#[derive(Debug, Default)]
pub struct CascadeOutcome {
    pub cascade_failed: Vec<TaskId>,
    pub skipped: Vec<TaskId>,
    /// Tasks that will still run, now carrying a failed-dependency marker.
    pub continued: Vec<TaskId>,
}

/// Aggregate task counts.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub cascade_failed: usize,
    pub skipped: usize,
}

impl TaskStats {
    pub fn success_rate(&self) -> f64 {
        let terminal = self.completed
            + self.failed
            + self.timed_out
            + self.cancelled
            + self.cascade_failed
            + self.skipped;
        if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }

    /// Tasks not yet terminal.
    pub fn live(&self) -> usize {
        self.pending + self.ready + self.assigned + self.running
    }
}

/// The dependency-aware task store.
#[derive(Debug)]
pub struct TaskGraph {
    nodes: HashMap<TaskId, TaskNode>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
    default_cascade: CascadePolicy,
}

impl TaskGraph {
    pub fn new(default_cascade: CascadePolicy) -> Self {
        Self {
            nodes: HashMap::new(),
            dependents: HashMap::new(),
            default_cascade,
        }
    }

    /// Insert a submitted task.
    ///
    /// Rejects self-dependencies, references to unknown tasks, and any
    /// dependency edge that would close a cycle.
    pub fn insert(&mut self, task: Task, now: DateTime<Utc>) -> Result<()> {
        let id = task.id.clone();

        for dep in &task.requirements.dependencies {
            if *dep == id {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "task {id} depends on itself"
                )));
            }
            if !self.nodes.contains_key(dep) {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "task {id} depends on unknown task {dep}"
                )));
            }
        }

        if self.would_create_cycle(&id, &task.requirements.dependencies) {
            return Err(OrchestratorError::InvalidGraph(format!(
                "task {id} would create a dependency cycle"
            )));
        }

        for dep in &task.requirements.dependencies {
            self.dependents.entry(dep.clone()).or_default().insert(id.clone());
        }

        self.nodes
            .insert(id.clone(), TaskNode::new(task, self.default_cascade, now));
        Ok(())
    }

    /// BFS over dependency edges: a cycle exists if any dependency's
    /// closure reaches the new task.
    fn would_create_cycle(&self, new_id: &TaskId, deps: &[TaskId]) -> bool {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&TaskId> = deps.iter().collect();

        while let Some(current) = queue.pop_front() {
            if current == new_id {
                return true;
            }
            if visited.insert(current.clone()) {
                if let Some(node) = self.nodes.get(current) {
                    queue.extend(node.task.requirements.dependencies.iter());
                }
            }
        }
        false
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    pub fn dependents_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.dependents
            .get(id)
            .map(|d| {
                let mut deps: Vec<_> = d.iter().cloned().collect();
                deps.sort();
                deps
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a single dependency status unblocks a dependent with the
    /// given policy.
    fn dependency_satisfied(status: TaskStatus, policy: CascadePolicy) -> bool {
        match status {
            TaskStatus::Completed | TaskStatus::Skipped => true,
            s if s.is_terminal_failure() => policy == CascadePolicy::Continue,
            _ => false,
        }
    }

    /// All dependencies of `id` allow it to run.
    pub fn is_ready(&self, id: &TaskId) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        node.task.requirements.dependencies.iter().all(|dep| {
            self.nodes
                .get(dep)
                .map(|d| Self::dependency_satisfied(d.status, node.cascade))
                .unwrap_or(false)
        })
    }

    /// Pending tasks whose dependencies are satisfied and which are not
    /// waiting out a retry delay. Sorted for deterministic admission.
    pub fn ready_candidates(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.status == TaskStatus::Pending && n.next_retry_at.is_none())
            .filter(|n| self.is_ready(n.id()))
            .map(|n| n.id().clone())
            .collect();
        ready.sort();
        ready
    }

    /// Guarded status transition: terminal states are final.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {id}")))?;

        if node.status.is_terminal() {
            return Err(OrchestratorError::invalid_state(
                "non-terminal task",
                format!("{id} is {}", node.status),
            ));
        }
        node.status = status;
        Ok(())
    }

    /// Apply each not-yet-started descendant's own cascade policy after
    /// `failed` reached a terminal failure state.
    pub fn cascade_failure(&mut self, failed: &TaskId, now: DateTime<Utc>) -> CascadeOutcome {
        let mut outcome = CascadeOutcome::default();
        let mut worklist = VecDeque::from([failed.clone()]);
        let mut visited = HashSet::new();

        while let Some(cause) = worklist.pop_front() {
            if !visited.insert(cause.clone()) {
                continue;
            }
            for dep_id in self.dependents_of(&cause) {
                let Some(node) = self.nodes.get_mut(&dep_id) else {
                    continue;
                };
                // Only tasks that have not started are affected.
                if !matches!(node.status, TaskStatus::Pending | TaskStatus::Ready) {
                    continue;
                }
                match node.cascade {
                    CascadePolicy::Abort => {
                        node.status = TaskStatus::CascadeFailed;
                        node.ended_at = Some(now);
                        debug!(task_id = %dep_id, cause = %cause, "Task cascade-failed");
                        outcome.cascade_failed.push(dep_id.clone());
                        // Its dependents see a terminal failure in turn.
                        worklist.push_back(dep_id);
                    }
                    CascadePolicy::Skip => {
                        node.status = TaskStatus::Skipped;
                        node.ended_at = Some(now);
                        debug!(task_id = %dep_id, cause = %cause, "Task skipped");
                        outcome.skipped.push(dep_id);
                        // Skipped counts as satisfied; no further cascade.
                    }
                    CascadePolicy::Continue => {
                        if !node.failed_dependencies.contains(&cause) {
                            node.failed_dependencies.push(cause.clone());
                        }
                        outcome.continued.push(dep_id);
                    }
                }
            }
        }

        outcome
    }

    /// Remove terminal tasks whose retention window has elapsed and whose
    /// dependents are all terminal themselves.
    pub fn sweep_terminal(&mut self, now: DateTime<Utc>, retention: std::time::Duration) -> Vec<TaskId> {
        let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::MAX);
        let expired: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.status.is_terminal())
            .filter(|n| {
                n.ended_at
                    .map(|ended| now - ended > retention)
                    .unwrap_or(false)
            })
            .filter(|n| {
                self.dependents_of(n.id()).iter().all(|d| {
                    self.nodes
                        .get(d)
                        .map(|dep| dep.status.is_terminal())
                        .unwrap_or(true)
                })
            })
            .map(|n| n.id().clone())
            .collect();

        for id in &expired {
            self.nodes.remove(id);
            self.dependents.remove(id);
            for set in self.dependents.values_mut() {
                set.remove(id);
            }
        }
        expired
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: self.nodes.len(),
            ..Default::default()
        };
        for node in self.nodes.values() {
            match node.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::TimedOut => stats.timed_out += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::CascadeFailed => stats.cascade_failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    /// Restore a node snapshot verbatim (checkpoint restore path).
    pub fn restore_node(&mut self, node: TaskNode) {
        let id = node.id().clone();
        for dep in &node.task.requirements.dependencies {
            self.dependents.entry(dep.clone()).or_default().insert(id.clone());
        }
        self.nodes.insert(id, node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskType;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, TaskType::Process).with_id(id);
        for d in deps {
            t = t.with_dependency(*d);
        }
        t
    }

    fn graph() -> TaskGraph {
        TaskGraph::new(CascadePolicy::Abort)
    }

    #[test]
    fn test_insert_and_readiness() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &["a"]), now).unwrap();

        assert!(g.is_ready(&"a".into()));
        assert!(!g.is_ready(&"b".into()));

        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Completed;
        assert!(g.is_ready(&"b".into()));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut g = graph();
        let err = g.insert(task("a", &["a"]), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidGraph);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut g = graph();
        let err = g.insert(task("a", &["ghost"]), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidGraph);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &["a"]), now).unwrap();

        // Re-submitting "a" with a dependency on "b" would close a cycle.
        let err = g.insert(task("a", &["b"]), now).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidGraph);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut g = graph();
        g.insert(task("a", &[]), Utc::now()).unwrap();
        g.set_status(&"a".into(), TaskStatus::Completed).unwrap();

        let err = g.set_status(&"a".into(), TaskStatus::Running).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[test]
    fn test_cascade_abort_reaches_grandchildren() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &["a"]), now).unwrap();
        g.insert(task("c", &["b"]), now).unwrap();

        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Failed;
        let outcome = g.cascade_failure(&"a".into(), now);

        assert_eq!(outcome.cascade_failed.len(), 2);
        assert_eq!(g.get(&"b".into()).unwrap().status, TaskStatus::CascadeFailed);
        assert_eq!(g.get(&"c".into()).unwrap().status, TaskStatus::CascadeFailed);
    }

    #[test]
    fn test_cascade_skip_unblocks_grandchildren() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(
            task("b", &["a"]).with_dependency_failure_policy(CascadePolicy::Skip),
            now,
        )
        .unwrap();
        g.insert(task("c", &["b"]), now).unwrap();

        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Failed;
        let outcome = g.cascade_failure(&"a".into(), now);

        assert_eq!(outcome.skipped, vec![TaskId::new("b")]);
        assert_eq!(g.get(&"b".into()).unwrap().status, TaskStatus::Skipped);
        // c's dependency is Skipped, which satisfies readiness.
        assert!(g.is_ready(&"c".into()));
        assert_eq!(g.get(&"c".into()).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_cascade_continue_marks_failed_dependency() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(
            task("b", &["a"]).with_dependency_failure_policy(CascadePolicy::Continue),
            now,
        )
        .unwrap();

        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Failed;
        let outcome = g.cascade_failure(&"a".into(), now);

        assert_eq!(outcome.continued, vec![TaskId::new("b")]);
        let b = g.get(&"b".into()).unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!(b.failed_dependencies, vec![TaskId::new("a")]);
        assert!(g.is_ready(&"b".into()));
    }

    #[test]
    fn test_cascade_ignores_started_tasks() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &["a"]), now).unwrap();

        g.get_mut(&"b".into()).unwrap().status = TaskStatus::Running;
        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Failed;

        let outcome = g.cascade_failure(&"a".into(), now);
        assert!(outcome.cascade_failed.is_empty());
        assert_eq!(g.get(&"b".into()).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn test_ready_candidates_sorted_and_filtered() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("b", &[]), now).unwrap();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("c", &["a"]), now).unwrap();

        // A task waiting out a retry delay is not a candidate.
        g.get_mut(&"b".into()).unwrap().next_retry_at = Some(now + ChronoDuration::seconds(10));

        assert_eq!(g.ready_candidates(), vec![TaskId::new("a")]);
    }

    #[test]
    fn test_sweep_respects_retention_and_dependents() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &["a"]), now).unwrap();

        let a = g.get_mut(&"a".into()).unwrap();
        a.status = TaskStatus::Completed;
        a.ended_at = Some(now - ChronoDuration::seconds(600));

        // b is still live, so a is retained despite the elapsed window.
        let removed = g.sweep_terminal(now, std::time::Duration::from_secs(300));
        assert!(removed.is_empty());

        let b = g.get_mut(&"b".into()).unwrap();
        b.status = TaskStatus::Completed;
        b.ended_at = Some(now - ChronoDuration::seconds(600));

        let mut removed = g.sweep_terminal(now, std::time::Duration::from_secs(300));
        removed.sort();
        assert_eq!(removed, vec![TaskId::new("a"), TaskId::new("b")]);
        assert!(g.is_empty());
    }

    #[test]
    fn test_stats() {
        let mut g = graph();
        let now = Utc::now();
        g.insert(task("a", &[]), now).unwrap();
        g.insert(task("b", &[]), now).unwrap();
        g.get_mut(&"a".into()).unwrap().status = TaskStatus::Completed;

        let stats = g.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.live(), 1);
        assert_eq!(stats.success_rate(), 1.0);
    }
}
