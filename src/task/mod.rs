//! Task model: identifiers, priorities, requirements, status machine.

pub mod graph;
pub mod queue;

pub use graph::{CascadePolicy, TaskGraph, TaskNode};
pub use queue::{QueueEntry, ReadyQueue};

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("task-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What kind of work a task describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analyze,
    #[default]
    Process,
    Transform,
    Validate,
    Aggregate,
    Custom,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Process => "process",
            Self::Transform => "transform",
            Self::Validate => "validate",
            Self::Aggregate => "aggregate",
            Self::Custom => "custom",
        }
    }

    /// Base contribution of the type to derived complexity.
    pub fn complexity_base(&self) -> f64 {
        match self {
            Self::Analyze => 0.4,
            Self::Process => 0.2,
            Self::Transform => 0.3,
            Self::Validate => 0.3,
            Self::Aggregate => 0.5,
            Self::Custom => 0.3,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority tier. Tiers are strict: any Critical task is assigned before
/// any High task, and so on. Within a tier, FIFO by enqueue order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Tier index with 0 = Critical, used by the ready queue.
    pub fn tier(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }

    pub fn from_tier(tier: usize) -> Self {
        match tier {
            0 => Self::Critical,
            1 => Self::High,
            2 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// One tier higher; aging never demotes and caps at Critical.
    pub fn promoted(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Normalized weight used by the strategy's priority signal.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

/// Resource reservation or capacity: CPU in cores, memory in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceEnvelope {
    pub cpu: f64,
    pub memory_mb: u64,
}

impl ResourceEnvelope {
    pub fn new(cpu: f64, memory_mb: u64) -> Self {
        Self { cpu, memory_mb }
    }

    /// Componentwise `self <= cap`.
    pub fn fits_within(&self, cap: &ResourceEnvelope) -> bool {
        self.cpu <= cap.cpu && self.memory_mb <= cap.memory_mb
    }

    pub fn add(&self, other: &ResourceEnvelope) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
        }
    }

    /// Contribution of the reservation to derived complexity.
    pub fn complexity_contribution(&self) -> f64 {
        (self.cpu / 8.0).min(0.2) + (self.memory_mb as f64 / 16_384.0).min(0.2)
    }
}

/// What a task needs before a worker may take it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskRequirements {
    /// Capability tags the executing worker must all advertise.
    pub capabilities: HashSet<String>,
    /// Resource reservation, checked componentwise against the worker cap.
    pub resources: ResourceEnvelope,
    /// Tasks that must reach terminal success first. Immutable after submit.
    pub dependencies: Vec<TaskId>,
}

/// A unit of work submitted to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: TaskType,
    pub priority: Priority,
    /// Opaque caller payload handed to the worker unchanged.
    pub input: serde_json::Value,
    pub requirements: TaskRequirements,
    /// Absolute deadline; retries are never scheduled past it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Execution timeout; falls back to the orchestrator default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry budget; falls back to the orchestrator retry policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// How this task reacts when one of its dependencies fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_dependency_failure: Option<CascadePolicy>,
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: TaskId::generate(),
            name: name.into(),
            task_type,
            priority: Priority::default(),
            input: serde_json::Value::Null,
            requirements: TaskRequirements::default(),
            deadline: None,
            timeout_ms: None,
            max_retries: None,
            on_dependency_failure: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.requirements.capabilities.insert(tag.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceEnvelope) -> Self {
        self.requirements.resources = resources;
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<TaskId>) -> Self {
        self.requirements.dependencies.push(dep.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_dependency_failure_policy(mut self, policy: CascadePolicy) -> Self {
        self.on_dependency_failure = Some(policy);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies or a retry delay.
    #[default]
    Pending,
    /// In the ready queue.
    Ready,
    /// Picked by the strategy, execution not yet observed.
    Assigned,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    /// Terminal because a dependency failed under the abort policy.
    CascadeFailed,
    /// Terminal because a dependency failed under the skip policy.
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::TimedOut
                | Self::Cancelled
                | Self::CascadeFailed
                | Self::Skipped
        )
    }

    /// Terminal without having produced usable output.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::TimedOut | Self::Cancelled | Self::CascadeFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::CascadeFailed => "cascade_failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one execution attempt, kept in the task's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_tiers_are_strict() {
        assert!(Priority::Critical.tier() < Priority::High.tier());
        assert!(Priority::High.tier() < Priority::Medium.tier());
        assert!(Priority::Medium.tier() < Priority::Low.tier());
    }

    #[test]
    fn test_promotion_caps_at_critical() {
        assert_eq!(Priority::Low.promoted(), Priority::Medium);
        assert_eq!(Priority::High.promoted(), Priority::Critical);
        assert_eq!(Priority::Critical.promoted(), Priority::Critical);
    }

    #[test]
    fn test_resource_fit() {
        let need = ResourceEnvelope::new(2.0, 1024);
        let cap = ResourceEnvelope::new(4.0, 2048);
        assert!(need.fits_within(&cap));
        assert!(!cap.fits_within(&need));
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("parse-batch", TaskType::Transform)
            .with_id("t-1")
            .with_priority(Priority::High)
            .with_capability("parser")
            .with_dependency("t-0")
            .with_max_retries(2);

        assert_eq!(task.id.as_str(), "t-1");
        assert_eq!(task.priority, Priority::High);
        assert!(task.requirements.capabilities.contains("parser"));
        assert_eq!(task.requirements.dependencies, vec![TaskId::new("t-0")]);
        assert_eq!(task.max_retries, Some(2));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::CascadeFailed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());

        assert!(!TaskStatus::Completed.is_terminal_failure());
        assert!(!TaskStatus::Skipped.is_terminal_failure());
        assert!(TaskStatus::TimedOut.is_terminal_failure());
    }
}
