//! Worker health probing and restart evaluation.
//!
//! One probe pass runs per `health_check_interval`: every active worker's
//! probe is awaited under a hard timeout, failures are handed to the
//! restart policy, and workers past their restart budget are destroyed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, warn};

use super::pool::WorkerPool;
use super::WorkerId;
use crate::config::RestartPolicy;
use crate::task::TaskId;

/// What a failed probe led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// Restart queued for the given instant.
    RestartScheduled { due: DateTime<Utc>, attempt: u32 },
    /// Restart budget exhausted; the worker was removed.
    Destroyed,
}

/// Result of probing one worker.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub worker_id: WorkerId,
    pub outcome: HealthOutcome,
    /// Task orphaned by a failed busy worker, if any.
    pub orphaned_task: Option<TaskId>,
}

/// Periodic health evaluation over a pool.
pub struct HealthMonitor {
    policy: RestartPolicy,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(policy: RestartPolicy, probe_timeout: Duration) -> Self {
        Self {
            policy,
            probe_timeout,
        }
    }

    /// Probe every active worker once.
    ///
    /// Probes run concurrently; pool mutations happen after all probes
    /// resolve so the pool lock is never held across an await.
    pub async fn probe_all(&self, pool: &Arc<WorkerPool>, now: DateTime<Utc>) -> Vec<ProbeReport> {
        let targets = pool.probe_targets();

        let probes = targets.into_iter().map(|(id, worker, restart_count)| {
            let timeout = self.probe_timeout;
            async move {
                let healthy = tokio::time::timeout(timeout, worker.health())
                    .await
                    .unwrap_or(false);
                (id, restart_count, healthy)
            }
        });
        let results = join_all(probes).await;

        let mut reports = Vec::with_capacity(results.len());
        for (id, restart_count, healthy) in results {
            if healthy {
                pool.record_health_ok(&id, now);
                reports.push(ProbeReport {
                    worker_id: id,
                    outcome: HealthOutcome::Healthy,
                    orphaned_task: None,
                });
                continue;
            }

            let orphaned_task = pool.mark_error(&id, "health probe failed");
            let outcome = self.evaluate_restart(pool, &id, restart_count, now);
            reports.push(ProbeReport {
                worker_id: id,
                outcome,
                orphaned_task,
            });
        }
        reports
    }

    /// Apply the restart policy to a worker already in Error state.
    pub fn evaluate_restart(
        &self,
        pool: &Arc<WorkerPool>,
        id: &WorkerId,
        restart_count: u32,
        now: DateTime<Utc>,
    ) -> HealthOutcome {
        if restart_count < self.policy.max_restarts {
            let delay = self.policy.delay_for(restart_count);
            let due = now + chrono::Duration::from_std(delay).unwrap_or_default();
            match pool.schedule_restart(id, due) {
                Ok(()) => {
                    debug!(
                        worker_id = %id,
                        restart_count,
                        delay_ms = delay.as_millis() as u64,
                        "Worker restart scheduled"
                    );
                    HealthOutcome::RestartScheduled {
                        due,
                        attempt: restart_count + 1,
                    }
                }
                Err(_) => HealthOutcome::Healthy,
            }
        } else {
            warn!(
                worker_id = %id,
                max_restarts = self.policy.max_restarts,
                "Worker restart budget exhausted, destroying"
            );
            pool.remove(id);
            HealthOutcome::Destroyed
        }
    }

    /// Bring due restarts back into service.
    pub fn process_due_restarts(&self, pool: &Arc<WorkerPool>, now: DateTime<Utc>) -> Vec<WorkerId> {
        pool.process_due_restarts(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::ResourceEnvelope;
    use crate::worker::{CancelToken, TaskAssignment, Worker, WorkerType};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ProbeWorker {
        id: WorkerId,
        capabilities: HashSet<String>,
        healthy: AtomicBool,
        hang_probe: bool,
    }

    impl ProbeWorker {
        fn new(id: &str, healthy: bool) -> Self {
            Self {
                id: WorkerId::new(id),
                capabilities: HashSet::new(),
                healthy: AtomicBool::new(healthy),
                hang_probe: false,
            }
        }

        fn hanging(id: &str) -> Self {
            Self {
                hang_probe: true,
                ..Self::new(id, true)
            }
        }
    }

    #[async_trait]
    impl Worker for ProbeWorker {
        fn id(&self) -> &WorkerId {
            &self.id
        }

        fn worker_type(&self) -> WorkerType {
            WorkerType::Execution
        }

        fn capabilities(&self) -> &HashSet<String> {
            &self.capabilities
        }

        async fn execute(
            &self,
            _assignment: TaskAssignment,
            _cancel: CancelToken,
        ) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        async fn health(&self) -> bool {
            if self.hang_probe {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.healthy.load(Ordering::Relaxed)
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            RestartPolicy {
                max_restarts: 2,
                restart_delay_ms: 0,
                backoff_multiplier: 2.0,
            },
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_healthy_workers_pass() {
        let pool = Arc::new(WorkerPool::new(4));
        let now = Utc::now();
        let id = pool.register(Arc::new(ProbeWorker::new("w-0", true))).unwrap();
        pool.activate(&id, now).unwrap();

        let reports = monitor().probe_all(&pool, now).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, HealthOutcome::Healthy);
        assert!(pool.snapshot(&id).unwrap().last_health_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_probe_schedules_restart() {
        let pool = Arc::new(WorkerPool::new(4));
        let now = Utc::now();
        let id = pool
            .register(Arc::new(ProbeWorker::new("w-0", false)))
            .unwrap();
        pool.activate(&id, now).unwrap();

        let reports = monitor().probe_all(&pool, now).await;
        assert!(matches!(
            reports[0].outcome,
            HealthOutcome::RestartScheduled { attempt: 1, .. }
        ));

        let restarted = monitor().process_due_restarts(&pool, now + chrono::Duration::seconds(1));
        assert_eq!(restarted, vec![id.clone()]);
        assert_eq!(pool.restart_count(&id), Some(1));
    }

    #[tokio::test]
    async fn test_hanging_probe_counts_as_failure() {
        let pool = Arc::new(WorkerPool::new(4));
        let now = Utc::now();
        let id = pool
            .register(Arc::new(ProbeWorker::hanging("w-0")))
            .unwrap();
        pool.activate(&id, now).unwrap();

        let reports = monitor().probe_all(&pool, now).await;
        assert!(matches!(
            reports[0].outcome,
            HealthOutcome::RestartScheduled { .. }
        ));
    }

    #[tokio::test]
    async fn test_restart_budget_exhaustion_destroys() {
        let pool = Arc::new(WorkerPool::new(4));
        let now = Utc::now();
        let id = pool
            .register(Arc::new(ProbeWorker::new("w-0", false)))
            .unwrap();
        pool.activate(&id, now).unwrap();
        let m = monitor();

        // Two failures consume the restart budget.
        for round in 0..2 {
            let reports = m.probe_all(&pool, now).await;
            assert!(
                matches!(reports[0].outcome, HealthOutcome::RestartScheduled { .. }),
                "round {round}"
            );
            m.process_due_restarts(&pool, now + chrono::Duration::seconds(1));
        }

        // The third failure destroys the worker.
        let reports = m.probe_all(&pool, now).await;
        assert_eq!(reports[0].outcome, HealthOutcome::Destroyed);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_busy_worker_reports_orphan() {
        let pool = Arc::new(WorkerPool::new(4));
        let now = Utc::now();
        let id = pool
            .register(Arc::new(ProbeWorker::new("w-0", false)))
            .unwrap();
        pool.activate(&id, now).unwrap();
        pool.begin_assignment(&id, &TaskId::new("t-1"), ResourceEnvelope::default())
            .unwrap();

        let reports = monitor().probe_all(&pool, now).await;
        assert_eq!(reports[0].orphaned_task, Some(TaskId::new("t-1")));
    }
}
