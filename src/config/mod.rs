//! Orchestrator configuration.
//!
//! Every option recognized by the core lives here. Loading from files or
//! environment belongs to the embedding application; these structs are
//! serde-ready and validated as a whole before the orchestrator accepts them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::task::CascadePolicy;

/// Backoff strategy applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    #[default]
    Exponential,
}

/// Retry policy applied to tasks that do not carry their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Bounded re-creation of a worker after health-check failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// Delay before the nth restart (0-based restart count).
    pub fn delay_for(&self, restart_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(restart_count as i32);
        Duration::from_millis((self.restart_delay_ms as f64 * factor) as u64)
    }
}

/// Autoscaler thresholds and step sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval_ms: u64,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub up_step: usize,
    pub down_step: usize,
    /// Number of utilization samples in the rolling trend window.
    pub trend_window: usize,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            scale_up_threshold: 0.85,
            scale_down_threshold: 0.3,
            up_step: 2,
            down_step: 1,
            trend_window: 10,
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Starvation prevention: promote tasks that have waited too long.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingConfig {
    pub interval_ms: u64,
    pub threshold_ms: u64,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            threshold_ms: 60_000,
        }
    }
}

impl AgingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard ceiling for active workers.
    pub max_agents: usize,
    /// Floor maintained by the autoscaler.
    pub min_agents: usize,
    /// Scheduler loop period.
    pub tick_interval_ms: u64,
    /// Worker health probe period.
    pub health_check_interval_ms: u64,
    /// Hard timeout for a single health probe.
    pub health_probe_timeout_ms: u64,
    /// Periodic checkpoint period; zero disables the checkpoint loop.
    pub checkpoint_interval_ms: u64,
    /// Maximum `stop()` wait for in-flight tasks.
    pub drain_timeout_ms: u64,
    /// Soft deadline for a worker to honor cancellation.
    pub graceful_cancel_window_ms: u64,
    /// Task timeout when a task does not specify one.
    pub default_timeout_ms: u64,
    /// Submit backpressure threshold (pending + running).
    pub max_queue_size: usize,
    /// Knowledge store entry capacity.
    pub max_knowledge: usize,
    /// Fraction of active workers required to finalize a consensus vote.
    pub consensus_threshold: f64,
    /// How long terminal task results stay queryable.
    pub result_retention_ms: u64,
    /// Transition to Failed when tasks exist but no capacity can serve them.
    pub fail_on_starvation: bool,
    /// Window of sustained resource overage that is treated as fatal.
    pub sustained_overage_window_ms: u64,
    /// Default dependency-failure handling for tasks that do not override it.
    pub cascade_policy: CascadePolicy,
    pub retry: RetryPolicy,
    pub restart: RestartPolicy,
    pub autoscale: AutoscaleConfig,
    pub aging: AgingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agents: 16,
            min_agents: 1,
            tick_interval_ms: 100,
            health_check_interval_ms: 10_000,
            health_probe_timeout_ms: 5_000,
            checkpoint_interval_ms: 0,
            drain_timeout_ms: 30_000,
            graceful_cancel_window_ms: 5_000,
            default_timeout_ms: 300_000,
            max_queue_size: 1_000,
            max_knowledge: 1_000,
            consensus_threshold: 0.66,
            result_retention_ms: 300_000,
            fail_on_starvation: false,
            sustained_overage_window_ms: 30_000,
            cascade_policy: CascadePolicy::Abort,
            retry: RetryPolicy::default(),
            restart: RestartPolicy::default(),
            autoscale: AutoscaleConfig::default(),
            aging: AgingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health_probe_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0)
            .then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn graceful_cancel_window(&self) -> Duration {
        Duration::from_millis(self.graceful_cancel_window_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_millis(self.result_retention_ms)
    }

    pub fn sustained_overage_window(&self) -> Duration {
        Duration::from_millis(self.sustained_overage_window_ms)
    }

    /// Validate configuration values for consistency and safety.
    ///
    /// Collects every violation so a caller sees the full list at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<&'static str> = Vec::new();

        if self.max_agents == 0 {
            errors.push("max_agents must be greater than 0");
        }
        if self.min_agents > self.max_agents {
            errors.push("min_agents must not exceed max_agents");
        }
        if self.tick_interval_ms == 0 {
            errors.push("tick_interval_ms must be greater than 0");
        }
        if self.health_check_interval_ms == 0 {
            errors.push("health_check_interval_ms must be greater than 0");
        }
        if self.health_probe_timeout_ms == 0 {
            errors.push("health_probe_timeout_ms must be greater than 0");
        }
        if self.default_timeout_ms == 0 {
            errors.push("default_timeout_ms must be greater than 0");
        }
        if self.max_queue_size == 0 {
            errors.push("max_queue_size must be greater than 0");
        }
        if self.max_knowledge == 0 {
            errors.push("max_knowledge must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            errors.push("consensus_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.autoscale.scale_up_threshold) {
            errors.push("autoscale.scale_up_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.autoscale.scale_down_threshold) {
            errors.push("autoscale.scale_down_threshold must be between 0.0 and 1.0");
        }
        if self.autoscale.scale_down_threshold >= self.autoscale.scale_up_threshold {
            errors.push("autoscale.scale_down_threshold must be below scale_up_threshold");
        }
        if self.autoscale.trend_window < 2 {
            errors.push("autoscale.trend_window must be at least 2");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.restart.backoff_multiplier < 1.0 {
            errors.push("restart.backoff_multiplier must be at least 1.0");
        }
        if self.aging.interval_ms == 0 {
            errors.push("aging.interval_ms must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidArgument(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let config = OrchestratorConfig {
            max_agents: 0,
            consensus_threshold: 1.5,
            max_queue_size: 0,
            ..Default::default()
        };

        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("max_agents"));
        assert!(message.contains("consensus_threshold"));
        assert!(message.contains("max_queue_size"));
    }

    #[test]
    fn test_min_agents_cannot_exceed_max() {
        let config = OrchestratorConfig {
            max_agents: 2,
            min_agents: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_interval_zero_disables() {
        let config = OrchestratorConfig::default();
        assert!(config.checkpoint_interval().is_none());

        let config = OrchestratorConfig {
            checkpoint_interval_ms: 5_000,
            ..Default::default()
        };
        assert_eq!(
            config.checkpoint_interval(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_restart_delay_backoff() {
        let policy = RestartPolicy {
            max_restarts: 5,
            restart_delay_ms: 100,
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_config_round_trips_through_serde() {
        let config = OrchestratorConfig {
            max_agents: 8,
            checkpoint_interval_ms: 60_000,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_agents, 8);
        assert_eq!(back.checkpoint_interval_ms, 60_000);
    }
}
