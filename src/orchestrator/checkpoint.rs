//! Checkpoint records and their storage.
//!
//! A checkpoint is a self-describing snapshot of every task node (with
//! dependency and dependent sets flattened to arrays) and every worker's
//! configuration, metrics, and restart count. Sequence numbers increase
//! monotonically; restoring from a record whose sequence is not strictly
//! greater than the current one is rejected, so a stale or duplicate
//! restore can never overwrite newer state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::machine::OrchestratorState;
use crate::error::{OrchestratorError, Result};
use crate::store::{KvStore, CHECKPOINT_PREFIX};
use crate::task::{TaskId, TaskNode};
use crate::worker::WorkerSnapshot;

/// A task node plus its flattened dependent set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub node: TaskNode,
    pub dependents: Vec<TaskId>,
}

/// One orchestrator snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub orchestrator_id: String,
    pub state: OrchestratorState,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    pub tasks: Vec<TaskSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}

impl Checkpoint {
    pub fn summary(&self) -> String {
        format!(
            "checkpoint {} seq={} state={} tasks={} workers={}",
            self.id,
            self.sequence,
            self.state,
            self.tasks.len(),
            self.workers.len()
        )
    }
}

/// Persists checkpoints through the KV adapter under `checkpoint:<id>`.
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    sequence: AtomicU64,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            sequence: AtomicU64::new(0),
        }
    }

    /// Sequence number of the most recent save or restore.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Build and persist a checkpoint with the next sequence number.
    pub async fn save(
        &self,
        orchestrator_id: &str,
        state: OrchestratorState,
        tasks: Vec<TaskSnapshot>,
        workers: Vec<WorkerSnapshot>,
        now: DateTime<Utc>,
    ) -> Result<Checkpoint> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let checkpoint = Checkpoint {
            id: format!("cp-{}", uuid::Uuid::new_v4()),
            orchestrator_id: orchestrator_id.to_string(),
            state,
            created_at: now,
            sequence,
            tasks,
            workers,
        };

        let bytes = serde_json::to_vec(&checkpoint)?;
        self.kv
            .set(&format!("{CHECKPOINT_PREFIX}{}", checkpoint.id), bytes, None)
            .await?;
        info!(checkpoint = %checkpoint.summary(), "Checkpoint saved");
        Ok(checkpoint)
    }

    /// Load a checkpoint and advance the sequence watermark.
    ///
    /// Rejects records whose sequence is not strictly greater than the
    /// current watermark.
    pub async fn load_for_restore(&self, id: &str) -> Result<Checkpoint> {
        let key = format!("{CHECKPOINT_PREFIX}{id}");
        let bytes = self
            .kv
            .get(&key)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("checkpoint {id}")))?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;

        let current = self.sequence.load(Ordering::SeqCst);
        if checkpoint.sequence <= current {
            return Err(OrchestratorError::InvalidArgument(format!(
                "stale restore: checkpoint sequence {} is not greater than current {}",
                checkpoint.sequence, current
            )));
        }
        self.sequence.store(checkpoint.sequence, Ordering::SeqCst);
        Ok(checkpoint)
    }

    /// Ids of every stored checkpoint.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .kv
            .keys()
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(CHECKPOINT_PREFIX).map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}
