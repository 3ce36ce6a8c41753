//! Typed lifecycle events.
//!
//! Every observable state change in the orchestrator is described by an
//! [`Event`]. Events flow through the [`bus::EventBus`] to in-process
//! subscribers and to registered [`bus::EventSink`] adapters.

pub mod bus;

pub use bus::{BusStats, EventBus, EventSink, Subscription};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discriminant for every event the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OrchestratorStarted,
    OrchestratorPaused,
    OrchestratorResumed,
    OrchestratorStopped,
    OrchestratorFailed,
    WorkerSpawned,
    WorkerReady,
    WorkerFailed,
    WorkerRestarted,
    WorkerTerminated,
    TaskSubmitted,
    TaskReady,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimedOut,
    TaskCancelled,
    TaskCascadeFailed,
    ScaleUp,
    ScaleDown,
    CheckpointSaved,
    AlertTriggered,
    EventsDropped,
    Custom,
}

/// Structured payload, tagged by the event kind that carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Orchestrator {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Worker {
        worker_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Task {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        worker_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Scale {
        count: usize,
        reason: String,
    },
    Checkpoint {
        checkpoint_id: String,
        sequence: u64,
    },
    Alert {
        severity: AlertSeverity,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    Dropped {
        dropped: u64,
    },
    Custom {
        data: serde_json::Value,
    },
}

/// Severity of an `AlertTriggered` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A single lifecycle event.
///
/// `sequence` is globally monotonic across all kinds; subscribers may
/// resume a stream from a sequence number they have already seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventKind, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            kind,
            sequence: 0,
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn task(kind: EventKind, task_id: impl Into<String>) -> Self {
        Self::new(
            kind,
            "scheduler",
            EventPayload::Task {
                task_id: task_id.into(),
                worker_id: None,
                attempt: None,
                error: None,
            },
        )
    }

    pub fn task_with_worker(
        kind: EventKind,
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self::new(
            kind,
            "scheduler",
            EventPayload::Task {
                task_id: task_id.into(),
                worker_id: Some(worker_id.into()),
                attempt: None,
                error: None,
            },
        )
    }

    pub fn worker(kind: EventKind, worker_id: impl Into<String>) -> Self {
        Self::new(
            kind,
            "pool",
            EventPayload::Worker {
                worker_id: worker_id.into(),
                reason: None,
            },
        )
    }

    pub fn worker_with_reason(
        kind: EventKind,
        worker_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(
            kind,
            "pool",
            EventPayload::Worker {
                worker_id: worker_id.into(),
                reason: Some(reason.into()),
            },
        )
    }

    pub fn alert(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::AlertTriggered,
            "orchestrator",
            EventPayload::Alert {
                severity,
                message: message.into(),
                correlation_id: None,
            },
        )
    }

    /// Internal-fault alert carrying a correlation id for log matching.
    pub fn internal_alert(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self::new(
            EventKind::AlertTriggered,
            "orchestrator",
            EventPayload::Alert {
                severity: AlertSeverity::Critical,
                message: message.into(),
                correlation_id: Some(correlation_id.into()),
            },
        )
    }

    pub fn with_attempt(mut self, n: u32) -> Self {
        if let EventPayload::Task { attempt, .. } = &mut self.payload {
            *attempt = Some(n);
        }
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        if let EventPayload::Task { error, .. } = &mut self.payload {
            *error = Some(message.into());
        }
        self
    }

    /// The task id this event concerns, if any.
    pub fn task_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Task { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
