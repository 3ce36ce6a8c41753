//! Signal-driven strategy selection.
//!
//! Each `pick` chooses one of five policies from the task shape and live
//! pool signals, then selects among eligible workers under that policy.
//! Every selection is recorded in a bounded history for introspection.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    eligible, AssignmentStrategy, PoolSignals, ScaleAdvice, ScaleDecision, TaskView, Trend,
};
use crate::config::AutoscaleConfig;
use crate::task::TaskId;
use crate::worker::{WorkerId, WorkerSnapshot, WorkerType};

const HISTORY_LIMIT: usize = 100;
const MAX_UP_STEP: usize = 5;
const MAX_DOWN_STEP: usize = 2;
const TREND_EPSILON: f64 = 0.05;

/// Dependency-count threshold that switches to pipeline placement.
const PIPELINE_DEPENDENCY_THRESHOLD: usize = 3;
/// Complexity above which validator-capable workers are preferred.
const CONSENSUS_COMPLEXITY_THRESHOLD: f64 = 0.7;
/// Priority weight above which coordinator workers are preferred.
const HIERARCHICAL_PRIORITY_THRESHOLD: f64 = 0.8;
/// Queue depth that, with low utilization, triggers spread placement.
const PARALLEL_QUEUE_THRESHOLD: usize = 10;
const PARALLEL_UTILIZATION_THRESHOLD: f64 = 0.5;

/// Backlog that forces a scale-up regardless of utilization.
const SCALE_UP_BACKLOG: usize = 50;
/// Backlog below which scale-down is permitted.
const SCALE_DOWN_BACKLOG: usize = 5;

/// Per-call assignment policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Prefer workers tagged for the task's stage.
    Pipeline,
    /// Prefer validator-capable workers for complex tasks.
    Consensus,
    /// Spread load onto the least-loaded worker.
    Parallel,
    /// Prefer coordinator-weighted workers for urgent tasks.
    Hierarchical,
    /// Prefer the best historical success rate for this task type.
    Adaptive,
}

/// One recorded selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub policy: Policy,
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub at: DateTime<Utc>,
}

/// The default strategy: policy chosen per call from live metrics.
pub struct AutoStrategy {
    config: AutoscaleConfig,
    history: Mutex<VecDeque<PolicyRecord>>,
    utilization_samples: Mutex<VecDeque<f64>>,
}

impl AutoStrategy {
    pub fn new(config: AutoscaleConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            utilization_samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Derived task complexity in [0,1]: type base plus resource and
    /// dependency contributions.
    pub fn complexity(task: &TaskView) -> f64 {
        let base = task.task_type.complexity_base();
        let resources = task.resources.complexity_contribution();
        let dependencies = (task.dependency_count as f64 * 0.1).min(0.3);
        (base + resources + dependencies).clamp(0.0, 1.0)
    }

    fn choose_policy(task: &TaskView, signals: &PoolSignals) -> Policy {
        if task.dependency_count > PIPELINE_DEPENDENCY_THRESHOLD {
            Policy::Pipeline
        } else if Self::complexity(task) > CONSENSUS_COMPLEXITY_THRESHOLD {
            Policy::Consensus
        } else if signals.utilization < PARALLEL_UTILIZATION_THRESHOLD
            && signals.backlog > PARALLEL_QUEUE_THRESHOLD
        {
            Policy::Parallel
        } else if task.priority.weight() >= HIERARCHICAL_PRIORITY_THRESHOLD {
            Policy::Hierarchical
        } else {
            Policy::Adaptive
        }
    }

    /// Apply a policy over the eligible set. Ties resolve by worker id so
    /// replays with identical inputs pick identically.
    fn select<'a>(
        policy: Policy,
        task: &TaskView,
        candidates: &[&'a WorkerSnapshot],
    ) -> Option<&'a WorkerSnapshot> {
        match policy {
            Policy::Pipeline => {
                let stage_tag = format!("stage:{}", task.task_type);
                Self::best_by(candidates, |w| {
                    (u8::from(w.spec.capabilities.contains(&stage_tag)), 0u64)
                })
            }
            Policy::Consensus => Self::best_by(candidates, |w| {
                (
                    u8::from(w.spec.worker_type == WorkerType::Validation),
                    w.metrics.tasks_completed,
                )
            }),
            Policy::Parallel => {
                // Least cumulative busy time spreads work evenly.
                candidates
                    .iter()
                    .copied()
                    .min_by_key(|w| (w.metrics.busy_ms, w.spec.id.clone()))
            }
            Policy::Hierarchical => Self::best_by(candidates, |w| {
                (
                    u8::from(w.spec.worker_type == WorkerType::Coordination),
                    (w.spec.priority_weight * 1_000.0) as u64,
                )
            }),
            Policy::Adaptive => Self::best_by(candidates, |w| {
                (
                    0,
                    (w.metrics.success_rate_for(task.task_type) * 1_000.0) as u64,
                )
            }),
        }
    }

    /// Highest (primary, secondary) score wins; id breaks ties.
    fn best_by<'a, F>(candidates: &[&'a WorkerSnapshot], score: F) -> Option<&'a WorkerSnapshot>
    where
        F: Fn(&WorkerSnapshot) -> (u8, u64),
    {
        candidates.iter().copied().max_by(|a, b| {
            score(a)
                .cmp(&score(b))
                .then_with(|| b.spec.id.cmp(&a.spec.id))
        })
    }

    fn record(&self, policy: Policy, task_id: &TaskId, worker_id: &WorkerId) {
        let mut history = self.history.lock();
        if history.len() >= HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(PolicyRecord {
            policy,
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            at: Utc::now(),
        });
    }

    /// Recent selections, newest last.
    pub fn history(&self) -> Vec<PolicyRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Rolling utilization trend over the configured window.
    fn trend(&self) -> Trend {
        let samples = self.utilization_samples.lock();
        let n = samples.len();
        if n < 3 {
            return Trend::Stable;
        }
        let third = (n / 3).max(1);
        let oldest: f64 = samples.iter().take(third).sum::<f64>() / third as f64;
        let newest: f64 = samples.iter().skip(n - third).sum::<f64>() / third as f64;

        if newest > oldest + TREND_EPSILON {
            Trend::Degrading
        } else if newest < oldest - TREND_EPSILON {
            Trend::Improving
        } else {
            Trend::Stable
        }
    }

    fn push_sample(&self, utilization: f64) {
        let mut samples = self.utilization_samples.lock();
        if samples.len() >= self.config.trend_window {
            samples.pop_front();
        }
        samples.push_back(utilization);
    }
}

impl AssignmentStrategy for AutoStrategy {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn pick(
        &self,
        task: &TaskView,
        idle: &[WorkerSnapshot],
        signals: &PoolSignals,
    ) -> Option<WorkerId> {
        let candidates = eligible(task, idle);
        if candidates.is_empty() {
            return None;
        }

        let policy = Self::choose_policy(task, signals);
        let chosen = Self::select(policy, task, &candidates)?;
        let worker_id = chosen.spec.id.clone();

        debug!(
            task_id = %task.id,
            worker_id = %worker_id,
            policy = ?policy,
            candidates = candidates.len(),
            "Assignment selected"
        );
        self.record(policy, &task.id, &worker_id);
        Some(worker_id)
    }

    fn rebalance(
        &self,
        workers: &[WorkerSnapshot],
        pending: &[TaskView],
        signals: &PoolSignals,
    ) -> Vec<(crate::task::TaskId, WorkerId)> {
        // Propose a pairing per idle worker, first-come over the pending
        // set; the scheduler remains free to ignore proposals.
        let idle: Vec<WorkerSnapshot> = workers
            .iter()
            .filter(|w| w.state == crate::worker::WorkerState::Idle)
            .cloned()
            .collect();
        let mut taken: std::collections::HashSet<WorkerId> = std::collections::HashSet::new();
        let mut proposals = Vec::new();

        for task in pending {
            let free: Vec<WorkerSnapshot> = idle
                .iter()
                .filter(|w| !taken.contains(&w.spec.id))
                .cloned()
                .collect();
            if free.is_empty() {
                break;
            }
            let candidates = eligible(task, &free);
            if candidates.is_empty() {
                continue;
            }
            if let Some(chosen) = Self::select(Self::choose_policy(task, signals), task, &candidates)
            {
                taken.insert(chosen.spec.id.clone());
                proposals.push((task.id.clone(), chosen.spec.id.clone()));
            }
        }
        proposals
    }

    fn should_scale(&self, signals: &PoolSignals) -> ScaleAdvice {
        self.push_sample(signals.utilization);
        let trend = self.trend();

        if signals.utilization > self.config.scale_up_threshold
            || signals.backlog > SCALE_UP_BACKLOG
        {
            let step = self.config.up_step.clamp(1, MAX_UP_STEP);
            return ScaleAdvice {
                decision: ScaleDecision::Up(step),
                reason: format!(
                    "utilization {:.2} backlog {} above scale-up thresholds",
                    signals.utilization, signals.backlog
                ),
            };
        }

        if signals.utilization < self.config.scale_down_threshold
            && signals.backlog < SCALE_DOWN_BACKLOG
            && trend != Trend::Degrading
        {
            let step = self.config.down_step.clamp(1, MAX_DOWN_STEP);
            return ScaleAdvice {
                decision: ScaleDecision::Down(step),
                reason: format!(
                    "utilization {:.2} backlog {} below scale-down thresholds, trend {:?}",
                    signals.utilization, signals.backlog, trend
                ),
            };
        }

        ScaleAdvice::none(format!(
            "utilization {:.2} backlog {} within bounds",
            signals.utilization, signals.backlog
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{snapshot, view};
    use crate::task::{Priority, ResourceEnvelope, TaskType};

    fn strategy() -> AutoStrategy {
        AutoStrategy::new(AutoscaleConfig::default())
    }

    fn signals(utilization: f64, backlog: usize) -> PoolSignals {
        PoolSignals {
            utilization,
            backlog,
            active_workers: 4,
            idle_workers: 2,
        }
    }

    #[test]
    fn test_pipeline_policy_for_deep_dependencies() {
        let mut task = view("t-1", TaskType::Process);
        task.dependency_count = 4;
        assert_eq!(
            AutoStrategy::choose_policy(&task, &signals(0.6, 0)),
            Policy::Pipeline
        );
    }

    #[test]
    fn test_pipeline_prefers_stage_tagged_worker() {
        let mut task = view("t-1", TaskType::Process);
        task.dependency_count = 5;

        let idle = vec![
            snapshot("plain", WorkerType::Execution, &[]),
            snapshot("staged", WorkerType::Execution, &["stage:process"]),
        ];

        let picked = strategy().pick(&task, &idle, &signals(0.6, 0)).unwrap();
        assert_eq!(picked.as_str(), "staged");
    }

    #[test]
    fn test_consensus_policy_for_complex_tasks() {
        let mut task = view("t-1", TaskType::Aggregate);
        task.resources = ResourceEnvelope::new(4.0, 8_192);
        assert!(AutoStrategy::complexity(&task) > 0.7);
        assert_eq!(
            AutoStrategy::choose_policy(&task, &signals(0.6, 0)),
            Policy::Consensus
        );

        let idle = vec![
            snapshot("agg", WorkerType::Analysis, &[]),
            snapshot("val", WorkerType::Validation, &[]),
        ];
        // Aggregate is not in Validation's row, so give the task a type
        // both can run to observe the preference.
        let mut custom = task.clone();
        custom.task_type = TaskType::Custom;
        let picked = strategy().pick(&custom, &idle, &signals(0.6, 0)).unwrap();
        assert_eq!(picked.as_str(), "val");
    }

    #[test]
    fn test_parallel_policy_under_light_load_big_queue() {
        let task = view("t-1", TaskType::Process);
        assert_eq!(
            AutoStrategy::choose_policy(&task, &signals(0.3, 20)),
            Policy::Parallel
        );

        let mut busy = snapshot("busy", WorkerType::Execution, &[]);
        busy.metrics.busy_ms = 50_000;
        let fresh = snapshot("fresh", WorkerType::Execution, &[]);

        let picked = strategy()
            .pick(&task, &[busy, fresh], &signals(0.3, 20))
            .unwrap();
        assert_eq!(picked.as_str(), "fresh");
    }

    #[test]
    fn test_hierarchical_policy_for_critical_tasks() {
        let mut task = view("t-1", TaskType::Process);
        task.priority = Priority::Critical;
        assert_eq!(
            AutoStrategy::choose_policy(&task, &signals(0.6, 0)),
            Policy::Hierarchical
        );

        let idle = vec![
            snapshot("exec", WorkerType::Execution, &[]),
            snapshot("coord", WorkerType::Coordination, &[]),
        ];
        let picked = strategy().pick(&task, &idle, &signals(0.6, 0)).unwrap();
        assert_eq!(picked.as_str(), "coord");
    }

    #[test]
    fn test_adaptive_policy_uses_per_type_success() {
        let task = view("t-1", TaskType::Process);
        assert_eq!(
            AutoStrategy::choose_policy(&task, &signals(0.6, 0)),
            Policy::Adaptive
        );

        let mut veteran = snapshot("veteran", WorkerType::Execution, &[]);
        veteran
            .metrics
            .per_type
            .insert(TaskType::Process, crate::worker::pool::TypeStats {
                completed: 9,
                failed: 1,
            });
        let mut flaky = snapshot("flaky", WorkerType::Execution, &[]);
        flaky
            .metrics
            .per_type
            .insert(TaskType::Process, crate::worker::pool::TypeStats {
                completed: 2,
                failed: 8,
            });

        let picked = strategy()
            .pick(&task, &[flaky, veteran], &signals(0.6, 0))
            .unwrap();
        assert_eq!(picked.as_str(), "veteran");
    }

    #[test]
    fn test_pick_declines_when_nothing_eligible() {
        let mut task = view("t-1", TaskType::Process);
        task.capabilities.insert("quantum".to_string());
        let idle = vec![snapshot("plain", WorkerType::Execution, &[])];

        assert!(strategy().pick(&task, &idle, &signals(0.5, 0)).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let s = strategy();
        let task = view("t-1", TaskType::Process);
        let idle = vec![snapshot("w", WorkerType::Execution, &[])];

        for _ in 0..150 {
            s.pick(&task, &idle, &signals(0.6, 0));
        }
        assert_eq!(s.history().len(), 100);
    }

    #[test]
    fn test_rebalance_pairs_each_idle_worker_once() {
        let s = strategy();
        let workers = vec![
            snapshot("w-0", WorkerType::Execution, &[]),
            snapshot("w-1", WorkerType::Execution, &[]),
        ];
        let pending = vec![
            view("t-1", TaskType::Process),
            view("t-2", TaskType::Process),
            view("t-3", TaskType::Process),
        ];

        let proposals = s.rebalance(&workers, &pending, &signals(0.5, 3));
        assert_eq!(proposals.len(), 2);
        let assigned: std::collections::HashSet<_> =
            proposals.iter().map(|(_, w)| w.clone()).collect();
        assert_eq!(assigned.len(), 2, "no worker proposed twice");
    }

    #[test]
    fn test_scale_up_on_high_utilization() {
        let s = strategy();
        let advice = s.should_scale(&signals(0.9, 0));
        assert!(matches!(advice.decision, ScaleDecision::Up(n) if n >= 1 && n <= 5));
    }

    #[test]
    fn test_scale_up_on_deep_backlog() {
        let s = strategy();
        let advice = s.should_scale(&signals(0.5, 60));
        assert!(matches!(advice.decision, ScaleDecision::Up(_)));
    }

    #[test]
    fn test_scale_down_on_idle_pool() {
        let s = strategy();
        let advice = s.should_scale(&signals(0.1, 0));
        assert!(matches!(advice.decision, ScaleDecision::Down(n) if n >= 1 && n <= 2));
    }

    #[test]
    fn test_no_scale_down_while_degrading() {
        let s = AutoStrategy::new(AutoscaleConfig {
            trend_window: 6,
            ..Default::default()
        });

        // Rising utilization, then a dip below the scale-down threshold:
        // the degrading trend vetoes the scale-down.
        for sample in [0.0, 0.05, 0.3, 0.6, 0.9] {
            s.should_scale(&signals(sample, 0));
        }
        assert_eq!(s.trend(), Trend::Degrading);

        let advice = s.should_scale(&signals(0.25, 0));
        assert_eq!(advice.decision, ScaleDecision::None);
    }

    #[test]
    fn test_steps_are_clamped() {
        let s = AutoStrategy::new(AutoscaleConfig {
            up_step: 50,
            down_step: 50,
            ..Default::default()
        });

        match s.should_scale(&signals(0.99, 100)).decision {
            ScaleDecision::Up(n) => assert_eq!(n, 5),
            other => panic!("expected Up, got {other:?}"),
        }
        match s.should_scale(&signals(0.0, 0)).decision {
            ScaleDecision::Down(n) => assert_eq!(n, 2),
            other => panic!("expected Down, got {other:?}"),
        }
    }
}
