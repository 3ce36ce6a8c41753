//! Worker contract: capability-typed executors for tasks.
//!
//! Workers are a sum over agent kinds sharing one capability contract:
//! execute a task under a cancellation token, answer a health probe, and
//! advertise capabilities plus a resource envelope. No inheritance;
//! capability tags and the type compatibility matrix drive eligibility.

pub mod health;
pub mod pool;

pub use health::{HealthMonitor, HealthOutcome, ProbeReport};
pub use pool::{
    PoolStats, WorkerMetrics, WorkerPool, WorkerSnapshot, WorkerSpec, WorkerState,
};

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;
use crate::task::{ResourceEnvelope, TaskId, TaskType};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn typed(worker_type: WorkerType, instance: usize) -> Self {
        Self(format!("{}-{instance}", worker_type.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Agent kinds a worker can be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Research,
    Analysis,
    Execution,
    Validation,
    Coordination,
    Monitoring,
    Specialist,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Execution => "execution",
            Self::Validation => "validation",
            Self::Coordination => "coordination",
            Self::Monitoring => "monitoring",
            Self::Specialist => "specialist",
        }
    }

    pub fn all() -> [WorkerType; 7] {
        [
            Self::Research,
            Self::Analysis,
            Self::Execution,
            Self::Validation,
            Self::Coordination,
            Self::Monitoring,
            Self::Specialist,
        ]
    }

    /// Task-type/worker-type compatibility matrix.
    ///
    /// The table is total: every task type maps to at least one worker
    /// type, and custom tasks run on any worker.
    pub fn can_execute(&self, task_type: TaskType) -> bool {
        match task_type {
            TaskType::Analyze => matches!(
                self,
                Self::Research | Self::Analysis | Self::Monitoring | Self::Specialist
            ),
            TaskType::Process => matches!(
                self,
                Self::Execution | Self::Coordination | Self::Specialist
            ),
            TaskType::Transform => matches!(
                self,
                Self::Execution | Self::Analysis | Self::Specialist
            ),
            TaskType::Validate => matches!(
                self,
                Self::Validation | Self::Analysis | Self::Specialist
            ),
            TaskType::Aggregate => matches!(
                self,
                Self::Coordination | Self::Analysis | Self::Monitoring | Self::Specialist
            ),
            TaskType::Custom => true,
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cancellation signal handed to an executing worker.
///
/// Workers observe it at natural yield points and return a `Cancelled`
/// error promptly once it fires.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token paired with its trigger.
    pub fn pair() -> (CancelSignal, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSignal { tx }, CancelToken { rx })
    }

    /// A token that never fires, for tests and detached executions.
    pub fn never() -> CancelToken {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // An error means the signal was dropped; treat that as cancelled.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

/// Owning side of a cancellation token.
#[derive(Debug)]
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Everything a worker receives for one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub input: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Dependencies that failed while this task's policy is `Continue`.
    pub failed_dependencies: Vec<TaskId>,
}

/// The shared capability contract every agent kind implements.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &WorkerId;

    fn worker_type(&self) -> WorkerType;

    /// Capability tags this worker advertises.
    fn capabilities(&self) -> &HashSet<String>;

    /// Most a single task may reserve on this worker.
    fn resource_cap(&self) -> ResourceEnvelope {
        ResourceEnvelope::new(1.0, 1024)
    }

    /// Relative weight used by hierarchical assignment.
    fn priority_weight(&self) -> f64 {
        1.0
    }

    /// Execute one task. Must observe `cancel` at yield points and return
    /// a `Cancelled` error once it fires.
    async fn execute(
        &self,
        assignment: TaskAssignment,
        cancel: CancelToken,
    ) -> Result<serde_json::Value>;

    /// Liveness probe. The pool calls this under a hard timeout.
    async fn health(&self) -> bool {
        true
    }
}

/// Creates workers for scale-up and restart-replacement.
///
/// `advertised_capabilities` is the union of tags the factory can bring
/// into the pool; submission-time capability checks consult it when the
/// live inventory alone cannot satisfy a task.
pub trait WorkerFactory: Send + Sync {
    fn available_types(&self) -> Vec<WorkerType>;

    fn advertised_capabilities(&self) -> HashSet<String>;

    fn create(&self, worker_type: WorkerType, instance: usize) -> std::sync::Arc<dyn Worker>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix_is_total() {
        use crate::task::TaskType;

        let task_types = [
            TaskType::Analyze,
            TaskType::Process,
            TaskType::Transform,
            TaskType::Validate,
            TaskType::Aggregate,
            TaskType::Custom,
        ];

        for task_type in task_types {
            let compatible = WorkerType::all()
                .iter()
                .filter(|w| w.can_execute(task_type))
                .count();
            assert!(compatible > 0, "{task_type} has no compatible worker type");
        }
    }

    #[test]
    fn test_custom_tasks_run_anywhere() {
        for worker_type in WorkerType::all() {
            assert!(worker_type.can_execute(crate::task::TaskType::Custom));
        }
    }

    #[test]
    fn test_specialist_runs_everything() {
        use crate::task::TaskType;
        for task_type in [
            TaskType::Analyze,
            TaskType::Process,
            TaskType::Transform,
            TaskType::Validate,
            TaskType::Aggregate,
            TaskType::Custom,
        ] {
            assert!(WorkerType::Specialist.can_execute(task_type));
        }
    }

    #[test]
    fn test_validation_worker_rejects_process() {
        assert!(!WorkerType::Validation.can_execute(crate::task::TaskType::Process));
        assert!(WorkerType::Validation.can_execute(crate::task::TaskType::Validate));
    }

    #[tokio::test]
    async fn test_cancel_token_fires() {
        let (signal, mut token) = CancelToken::pair();
        assert!(!token.is_cancelled());

        signal.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // resolves immediately
    }

    #[tokio::test]
    async fn test_cancel_token_resolves_on_dropped_signal() {
        let (signal, mut token) = CancelToken::pair();
        drop(signal);
        token.cancelled().await;
    }

    #[test]
    fn test_typed_worker_ids() {
        assert_eq!(
            WorkerId::typed(WorkerType::Execution, 3).as_str(),
            "execution-3"
        );
    }
}
