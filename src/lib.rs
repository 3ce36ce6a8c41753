//! hivemind: an in-process work orchestrator for capability-typed workers.
//!
//! A caller submits tasks with priorities, resource requirements, and
//! dependencies; the orchestrator schedules them across a dynamically
//! sized pool of workers, honoring retry and timeout policies, emitting
//! lifecycle events, and supporting pause/resume and checkpoint/restore.
//! A shared-knowledge store lets workers publish observations, run
//! vote-based consensus rounds, and learn recurring patterns.
//!
//! # Quick start
//!
//! ```ignore
//! use hivemind::{Orchestrator, OrchestratorConfig, Task, TaskType};
//!
//! let orchestrator = Orchestrator::builder(OrchestratorConfig::default())
//!     .with_worker(my_worker)
//!     .build()?;
//! orchestrator.start()?;
//!
//! let id = orchestrator.submit(Task::new("ingest", TaskType::Process))?;
//! let status = orchestrator.status(&id)?;
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod knowledge;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod task;
pub mod worker;

pub use config::{
    AgingConfig, AutoscaleConfig, BackoffStrategy, OrchestratorConfig, RestartPolicy, RetryPolicy,
};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use event::{AlertSeverity, Event, EventBus, EventKind, EventPayload, EventSink, Subscription};
pub use knowledge::{
    ConsensusOutcome, ConsensusSession, ConsensusStatus, Experience, KnowledgeEntry,
    KnowledgeStore, LearnedPattern,
};
pub use orchestrator::{Checkpoint, Orchestrator, OrchestratorBuilder, OrchestratorState};
pub use scheduler::{Scheduler, SchedulerMetrics};
pub use store::{KvStore, MemoryStore};
pub use strategy::{
    AssignmentStrategy, AutoStrategy, Policy, PoolSignals, ScaleAdvice, ScaleDecision, TaskView,
    Trend,
};
pub use task::{
    CascadePolicy, Priority, ResourceEnvelope, Task, TaskId, TaskRequirements, TaskResult,
    TaskStatus, TaskType,
};
pub use worker::{
    CancelSignal, CancelToken, TaskAssignment, Worker, WorkerFactory, WorkerId, WorkerPool,
    WorkerSnapshot, WorkerSpec, WorkerState, WorkerType,
};
