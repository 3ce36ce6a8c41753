//! Assignment strategies and autoscale recommendations.
//!
//! A strategy is pure with respect to external state: everything it reads
//! arrives through its arguments. The scheduler copies the idle-worker set
//! out of the pool lock before calling `pick`, so a strategy can never
//! deadlock the pool. Selection history kept for introspection is the only
//! state a strategy owns.

pub mod auto;

pub use auto::{AutoStrategy, Policy, PolicyRecord};

use serde::{Deserialize, Serialize};

use crate::task::{Priority, ResourceEnvelope, TaskId, TaskType};
use crate::worker::{WorkerId, WorkerSnapshot};

/// The slice of a task a strategy is allowed to see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub capabilities: std::collections::HashSet<String>,
    pub resources: ResourceEnvelope,
    pub dependency_count: usize,
}

/// Live scheduler/pool signals a strategy reads per call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolSignals {
    /// Busy workers over active workers, in [0,1].
    pub utilization: f64,
    /// Ready-queue depth plus tasks waiting on retries.
    pub backlog: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
}

/// Observed direction of recent utilization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    #[default]
    Stable,
    Degrading,
}

/// Autoscale recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDecision {
    None,
    Up(usize),
    Down(usize),
}

/// A scale decision plus the signal that drove it.
#[derive(Debug, Clone)]
pub struct ScaleAdvice {
    pub decision: ScaleDecision,
    pub reason: String,
}

impl ScaleAdvice {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            decision: ScaleDecision::None,
            reason: reason.into(),
        }
    }
}

/// Picks workers for tasks and advises on pool sizing.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Choose a worker for the task from the idle set, or decline.
    ///
    /// Declining leaves the task at the head of its tier for the next tick.
    fn pick(
        &self,
        task: &TaskView,
        idle: &[WorkerSnapshot],
        signals: &PoolSignals,
    ) -> Option<WorkerId>;

    /// Periodic sizing advice from live metrics.
    fn should_scale(&self, signals: &PoolSignals) -> ScaleAdvice {
        let _ = signals;
        ScaleAdvice::none("strategy does not autoscale")
    }

    /// Optional periodic pass proposing a placement for every pending
    /// task at once. The default proposes nothing.
    fn rebalance(
        &self,
        workers: &[WorkerSnapshot],
        pending: &[TaskView],
        signals: &PoolSignals,
    ) -> Vec<(TaskId, WorkerId)> {
        let _ = (workers, pending, signals);
        Vec::new()
    }
}

/// Eligibility filter shared by all strategies: capability superset,
/// componentwise resource fit, and type-matrix compatibility.
pub fn eligible<'a>(task: &TaskView, idle: &'a [WorkerSnapshot]) -> Vec<&'a WorkerSnapshot> {
    idle.iter()
        .filter(|w| w.spec.worker_type.can_execute(task.task_type))
        .filter(|w| task.capabilities.is_subset(&w.spec.capabilities))
        .filter(|w| task.resources.fits_within(&w.spec.resource_cap))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::worker::{WorkerMetrics, WorkerSpec, WorkerState, WorkerType};

    pub fn snapshot(id: &str, worker_type: WorkerType, caps: &[&str]) -> WorkerSnapshot {
        WorkerSnapshot {
            spec: WorkerSpec {
                id: WorkerId::new(id),
                worker_type,
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                resource_cap: ResourceEnvelope::new(4.0, 8_192),
                priority_weight: 1.0,
            },
            state: WorkerState::Idle,
            current_task: None,
            restart_count: 0,
            idle_since: None,
            last_health_at: None,
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn view(id: &str, task_type: TaskType) -> TaskView {
        TaskView {
            id: TaskId::new(id),
            task_type,
            priority: Priority::Medium,
            capabilities: Default::default(),
            resources: ResourceEnvelope::default(),
            dependency_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::worker::WorkerType;

    #[test]
    fn test_eligibility_filters_type() {
        let task = view("t-1", TaskType::Validate);
        let idle = vec![
            snapshot("exec-0", WorkerType::Execution, &[]),
            snapshot("val-0", WorkerType::Validation, &[]),
        ];

        let survivors = eligible(&task, &idle);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].spec.id.as_str(), "val-0");
    }

    #[test]
    fn test_eligibility_requires_all_capabilities() {
        let mut task = view("t-1", TaskType::Custom);
        task.capabilities.insert("gpu".to_string());
        task.capabilities.insert("simd".to_string());

        let idle = vec![
            snapshot("a", WorkerType::Execution, &["gpu"]),
            snapshot("b", WorkerType::Execution, &["gpu", "simd", "extra"]),
        ];

        let survivors = eligible(&task, &idle);
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].spec.id.as_str(), "b");
    }

    #[test]
    fn test_eligibility_checks_resources() {
        let mut task = view("t-1", TaskType::Custom);
        task.resources = ResourceEnvelope::new(16.0, 1_000_000);

        let idle = vec![snapshot("a", WorkerType::Execution, &[])];
        assert!(eligible(&task, &idle).is_empty());
    }
}
