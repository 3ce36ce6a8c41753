//! The orchestrator façade.
//!
//! Owns every subcomponent (pool, scheduler, event bus, knowledge store,
//! checkpoint store), wires the background loops, and exposes the public
//! API. All operations are safe under concurrent callers; only `stop`
//! blocks, and only up to the configured drain timeout. Subcomponent
//! panics are caught at the loop boundary and surface as `Internal`
//! alerts, never as a torn-down process.

pub mod checkpoint;
pub mod machine;

pub use checkpoint::{Checkpoint, CheckpointStore, TaskSnapshot};
pub use machine::{check_transition, OrchestratorState, StateTransition};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::event::{AlertSeverity, Event, EventBus, EventKind, EventPayload, EventSink, Subscription};
use crate::knowledge::KnowledgeStore;
use crate::scheduler::{Scheduler, SchedulerMetrics, TickReport};
use crate::store::{KvStore, MemoryStore};
use crate::strategy::{AssignmentStrategy, AutoStrategy, ScaleDecision};
use crate::task::{ResourceEnvelope, Task, TaskId, TaskResult, TaskStatus};
use crate::worker::{
    HealthMonitor, HealthOutcome, Worker, WorkerFactory, WorkerId, WorkerPool,
};

/// Configures and constructs an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    kv: Option<Arc<dyn KvStore>>,
    factory: Option<Arc<dyn WorkerFactory>>,
    workers: Vec<Arc<dyn Worker>>,
    sinks: Vec<Arc<dyn EventSink>>,
    resource_budget: Option<ResourceEnvelope>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            kv: None,
            factory: None,
            workers: Vec::new(),
            sinks: Vec::new(),
            resource_budget: None,
        }
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_worker_factory(mut self, factory: Arc<dyn WorkerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn with_workers(mut self, workers: impl IntoIterator<Item = Arc<dyn Worker>>) -> Self {
        self.workers.extend(workers);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Hard cumulative resource cap; sustained overage is fatal.
    pub fn with_resource_budget(mut self, budget: ResourceEnvelope) -> Self {
        self.resource_budget = Some(budget);
        self
    }

    /// Validate the configuration, construct subcomponents, register the
    /// initial workers, and transition Initializing → Ready.
    pub fn build(self) -> Result<Arc<Orchestrator>> {
        self.config.validate()?;

        if self.workers.is_empty() && self.factory.is_none() {
            return Err(OrchestratorError::InvalidArgument(
                "no workers and no worker factory: nothing can execute tasks".into(),
            ));
        }

        let kv = self.kv.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let bus = Arc::new(EventBus::new());
        for sink in self.sinks {
            bus.register_sink(sink);
        }

        let mut pool = WorkerPool::new(self.config.max_agents);
        if let Some(budget) = self.resource_budget {
            pool = pool.with_global_resource_cap(budget);
        }
        let pool = Arc::new(pool);

        let strategy = Arc::new(AutoStrategy::new(self.config.autoscale.clone()));
        let scheduler = Arc::new(Scheduler::new(
            self.config.clone(),
            Arc::clone(&pool),
            Arc::clone(&strategy) as Arc<dyn AssignmentStrategy>,
            Arc::clone(&bus),
        ));
        let knowledge = Arc::new(KnowledgeStore::new(
            Arc::clone(&kv),
            self.config.max_knowledge,
            self.config.consensus_threshold,
        ));
        let health = HealthMonitor::new(
            self.config.restart.clone(),
            self.config.health_probe_timeout(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::new(Orchestrator {
            id: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            config: self.config,
            state: RwLock::new(OrchestratorState::Initializing),
            transitions: Mutex::new(Vec::new()),
            pool,
            scheduler,
            strategy,
            bus,
            knowledge,
            checkpoints: CheckpointStore::new(Arc::clone(&kv)),
            kv,
            factory: self.factory,
            health,
            resource_budget: self.resource_budget,
            overage_since: Mutex::new(None),
            spawn_counter: AtomicUsize::new(0),
            loops: Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        });

        let now = Utc::now();
        for worker in self.workers {
            orchestrator.adopt_worker(worker, now)?;
        }
        if orchestrator.pool.active_count() < orchestrator.config.min_agents {
            let missing =
                orchestrator.config.min_agents - orchestrator.pool.active_count();
            orchestrator.spawn_from_factory(missing, "initial floor")?;
        }

        orchestrator.transition(OrchestratorState::Ready, "initialized")?;
        Ok(orchestrator)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Top-level work orchestrator for a pool of capability-typed workers.
pub struct Orchestrator {
    id: String,
    config: OrchestratorConfig,
    state: RwLock<OrchestratorState>,
    transitions: Mutex<Vec<StateTransition>>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<Scheduler>,
    strategy: Arc<AutoStrategy>,
    bus: Arc<EventBus>,
    knowledge: Arc<KnowledgeStore>,
    checkpoints: CheckpointStore,
    kv: Arc<dyn KvStore>,
    factory: Option<Arc<dyn WorkerFactory>>,
    health: HealthMonitor,
    resource_budget: Option<ResourceEnvelope>,
    overage_since: Mutex<Option<DateTime<Utc>>>,
    spawn_counter: AtomicUsize,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    /// Central, validated state transition with its lifecycle event.
    fn transition(&self, to: OrchestratorState, reason: &str) -> Result<()> {
        let from = {
            let mut state = self.state.write();
            check_transition(*state, to)?;
            let from = *state;
            *state = to;
            from
        };
        self.transitions
            .lock()
            .push(StateTransition::new(from, to, reason));
        info!(%from, %to, reason, "Orchestrator state changed");

        let kind = match to {
            OrchestratorState::Running if from == OrchestratorState::Paused => {
                Some(EventKind::OrchestratorResumed)
            }
            OrchestratorState::Running => Some(EventKind::OrchestratorStarted),
            OrchestratorState::Paused => Some(EventKind::OrchestratorPaused),
            OrchestratorState::Completed => Some(EventKind::OrchestratorStopped),
            OrchestratorState::Failed => Some(EventKind::OrchestratorFailed),
            _ => None,
        };
        if let Some(kind) = kind {
            self.bus.publish(Event::new(
                kind,
                "orchestrator",
                EventPayload::Orchestrator {
                    state: to.to_string(),
                    reason: Some(reason.to_string()),
                },
            ));
        }
        Ok(())
    }

    /// Ready → Running: start the scheduler tick, health, autoscale, and
    /// checkpoint loops.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.transition(OrchestratorState::Running, "start requested")?;

        let mut loops = self.loops.lock();
        if let Some(handle) = self.bus.spawn_sink_forwarder() {
            loops.push(handle);
        }
        loops.push(self.spawn_scheduler_loop());
        loops.push(self.spawn_health_loop());
        loops.push(self.spawn_autoscale_loop());
        if let Some(interval) = self.config.checkpoint_interval() {
            loops.push(self.spawn_checkpoint_loop(interval));
        }
        Ok(())
    }

    /// Cooperative pause: in-flight tasks run to completion, nothing new
    /// is assigned.
    pub fn pause(&self) -> Result<()> {
        self.transition(OrchestratorState::Paused, "pause requested")
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(OrchestratorState::Running, "resume requested")
    }

    /// Drain in-flight work (bounded by `drain_timeout`), persist a final
    /// checkpoint, flush events, and stop.
    pub async fn stop(&self) -> Result<()> {
        self.transition(OrchestratorState::Completing, "stop requested")?;

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout();
        loop {
            let metrics = self.scheduler.metrics();
            if metrics.tasks.running + metrics.tasks.assigned == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain timeout reached with tasks still in flight");
                break;
            }
            tokio::time::sleep(self.config.tick_interval()).await;
        }

        if let Err(err) = self.checkpoint().await {
            warn!(error = %err, "Final checkpoint failed");
        }

        let _ = self.shutdown_tx.send(true);
        self.bus.close_sinks();
        let handles: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        self.transition(OrchestratorState::Completed, "drained")
    }

    /// Fatal error path: Running/Paused → Failed.
    fn fail(&self, reason: &str) {
        error!(reason, "Orchestrator failed");
        if self.transition(OrchestratorState::Failed, reason).is_ok() {
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Submit a task for execution.
    ///
    /// Rejected unless Running; rejected when required capabilities exist
    /// neither in the live pool nor in what the factory can create.
    pub fn submit(&self, task: Task) -> Result<TaskId> {
        let state = self.state();
        if !state.accepts_submissions() {
            return Err(OrchestratorError::invalid_state("Running", state));
        }

        let required = &task.requirements.capabilities;
        if !required.is_empty() {
            let mut inventory = self.pool.capability_inventory();
            if let Some(factory) = &self.factory {
                inventory.extend(factory.advertised_capabilities());
            }
            let missing: Vec<&String> =
                required.iter().filter(|c| !inventory.contains(*c)).collect();
            if !missing.is_empty() {
                return Err(OrchestratorError::InvalidGraph(format!(
                    "no worker provides capabilities {missing:?}"
                )));
            }
        }

        self.scheduler.submit(task, Utc::now())
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        self.scheduler.status(id)
    }

    pub fn result(&self, id: &TaskId) -> Result<Option<TaskResult>> {
        self.scheduler.result(id)
    }

    pub fn cancel(&self, id: &TaskId) -> Result<()> {
        self.scheduler.cancel(id, Utc::now())
    }

    /// Add `n` factory-built workers. Rejected past the agent ceiling.
    pub fn scale_up(&self, n: usize) -> Result<Vec<WorkerId>> {
        let state = self.state();
        if !matches!(state, OrchestratorState::Running) {
            return Err(OrchestratorError::invalid_state("Running", state));
        }
        if self.pool.active_count() + n > self.config.max_agents {
            return Err(OrchestratorError::ResourceExhausted(format!(
                "scale-up of {n} would exceed max_agents {}",
                self.config.max_agents
            )));
        }
        let spawned = self.spawn_from_factory(n, "manual scale-up")?;
        self.bus.publish(Event::new(
            EventKind::ScaleUp,
            "orchestrator",
            EventPayload::Scale {
                count: spawned.len(),
                reason: "manual scale-up".into(),
            },
        ));
        Ok(spawned)
    }

    /// Remove up to `n` workers, oldest-idle first. Busy workers are
    /// only taken when `force` is set.
    pub fn scale_down(&self, n: usize, force: bool) -> Result<Vec<WorkerId>> {
        let state = self.state();
        if !matches!(
            state,
            OrchestratorState::Running | OrchestratorState::Paused
        ) {
            return Err(OrchestratorError::invalid_state("Running or Paused", state));
        }

        let removed = self.remove_workers(n, force);
        if !removed.is_empty() {
            self.bus.publish(Event::new(
                EventKind::ScaleDown,
                "orchestrator",
                EventPayload::Scale {
                    count: removed.len(),
                    reason: "manual scale-down".into(),
                },
            ));
        }
        Ok(removed)
    }

    pub fn worker_count(&self) -> usize {
        self.pool.active_count()
    }

    /// Persist a snapshot of tasks and workers.
    pub async fn checkpoint(&self) -> Result<Checkpoint> {
        let nodes = self.scheduler.graph_snapshot();

        // Invert dependency edges into flattened dependent arrays.
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for node in &nodes {
            for dep in &node.task.requirements.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(node.id().clone());
            }
        }
        let tasks: Vec<TaskSnapshot> = nodes
            .into_iter()
            .map(|node| {
                let mut deps = dependents.remove(node.id()).unwrap_or_default();
                deps.sort();
                TaskSnapshot {
                    node,
                    dependents: deps,
                }
            })
            .collect();

        let checkpoint = self
            .checkpoints
            .save(
                &self.id,
                self.state(),
                tasks,
                self.pool.snapshot_all(),
                Utc::now(),
            )
            .await?;

        self.bus.publish(Event::new(
            EventKind::CheckpointSaved,
            "orchestrator",
            EventPayload::Checkpoint {
                checkpoint_id: checkpoint.id.clone(),
                sequence: checkpoint.sequence,
            },
        ));
        Ok(checkpoint)
    }

    /// Rebuild task state from a checkpoint. In-flight tasks re-run;
    /// worker metrics and restart counts re-apply to matching live ids.
    pub async fn restore(&self, checkpoint_id: &str) -> Result<()> {
        let state = self.state();
        if state.is_terminal() || state == OrchestratorState::Completing {
            return Err(OrchestratorError::invalid_state(
                "Ready, Running, or Paused",
                state,
            ));
        }

        let checkpoint = self.checkpoints.load_for_restore(checkpoint_id).await?;
        let now = Utc::now();
        self.scheduler
            .restore(checkpoint.tasks.into_iter().map(|t| t.node).collect(), now);
        for snapshot in checkpoint.workers {
            self.pool
                .restore_metrics(&snapshot.spec.id, snapshot.metrics, snapshot.restart_count);
        }
        info!(checkpoint_id, "Restored from checkpoint");
        Ok(())
    }

    /// Stream lifecycle events, optionally filtered by kind.
    pub fn subscribe(&self, kinds: Option<&[EventKind]>) -> Subscription {
        self.bus.subscribe(kinds)
    }

    /// Stream events resuming after a sequence number already seen.
    pub fn subscribe_from(&self, kinds: Option<&[EventKind]>, after: u64) -> Subscription {
        self.bus.subscribe_from(kinds, after)
    }

    pub fn register_sink(&self, sink: Arc<dyn EventSink>) {
        self.bus.register_sink(sink);
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.scheduler.metrics()
    }

    pub fn pool_stats(&self) -> crate::worker::PoolStats {
        self.pool.stats()
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeStore> {
        &self.knowledge
    }

    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn state_transitions(&self) -> Vec<StateTransition> {
        self.transitions.lock().clone()
    }

    // === internals ===

    fn adopt_worker(&self, worker: Arc<dyn Worker>, now: DateTime<Utc>) -> Result<WorkerId> {
        let id = self.pool.register(worker)?;
        self.pool.activate(&id, now)?;
        self.knowledge.register_worker(id.clone());
        self.bus
            .publish(Event::worker(EventKind::WorkerSpawned, id.as_str()));
        self.bus
            .publish(Event::worker(EventKind::WorkerReady, id.as_str()));
        Ok(id)
    }

    fn spawn_from_factory(&self, n: usize, reason: &str) -> Result<Vec<WorkerId>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let factory = self.factory.as_ref().ok_or_else(|| {
            OrchestratorError::InvalidArgument(
                "scaling requires a worker factory".into(),
            )
        })?;
        let types = factory.available_types();
        if types.is_empty() {
            return Err(OrchestratorError::InvalidArgument(
                "worker factory advertises no types".into(),
            ));
        }

        let now = Utc::now();
        let mut spawned = Vec::with_capacity(n);
        for _ in 0..n {
            let instance = self.spawn_counter.fetch_add(1, Ordering::Relaxed);
            let worker_type = types[instance % types.len()];
            let worker = factory.create(worker_type, instance);
            let id = self.adopt_worker(worker, now)?;
            info!(worker_id = %id, %worker_type, reason, "Worker spawned");
            spawned.push(id);
        }
        Ok(spawned)
    }

    fn remove_workers(&self, n: usize, force: bool) -> Vec<WorkerId> {
        let candidates = self.pool.scale_down_candidates(n, force);
        let mut removed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(snapshot) = self.pool.remove(&id) {
                if let Some(task_id) = snapshot.current_task {
                    self.scheduler
                        .handle_worker_loss(&id, &task_id, Utc::now());
                }
                self.knowledge.unregister_worker(&id);
                self.bus
                    .publish(Event::worker(EventKind::WorkerTerminated, id.as_str()));
                removed.push(id);
            }
        }
        removed
    }

    fn report_internal(&self, message: &str) {
        let err = OrchestratorError::internal(message);
        let correlation_id = match &err {
            OrchestratorError::Internal { correlation_id, .. } => correlation_id.clone(),
            _ => String::new(),
        };
        error!(correlation_id, message, "Internal fault caught at loop boundary");
        self.bus
            .publish(Event::internal_alert(message, correlation_id));
    }

    fn handle_tick_report(&self, report: TickReport) {
        let now = Utc::now();
        for worker_id in report.unresponsive_workers {
            let restart_count = self.pool.restart_count(&worker_id).unwrap_or(0);
            let outcome = self
                .health
                .evaluate_restart(&self.pool, &worker_id, restart_count, now);
            if outcome == HealthOutcome::Destroyed {
                self.knowledge.unregister_worker(&worker_id);
                self.bus.publish(Event::worker_with_reason(
                    EventKind::WorkerFailed,
                    worker_id.as_str(),
                    "unresponsive to cancellation",
                ));
            }
        }
    }

    fn spawn_scheduler_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orch.config.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let state = orch.state();
                let tick = match state {
                    OrchestratorState::Running | OrchestratorState::Completing => {
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            orch.scheduler.tick(Utc::now())
                        }))
                    }
                    OrchestratorState::Paused => {
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            orch.scheduler.tick_paused(Utc::now())
                        }))
                    }
                    OrchestratorState::Ready | OrchestratorState::Initializing => continue,
                    _ => break,
                };
                match tick {
                    Ok(report) => orch.handle_tick_report(report),
                    Err(_) => orch.report_internal("scheduler tick panicked"),
                }
            }
        })
    }

    fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orch.config.health_check_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if orch.state().is_terminal() {
                    break;
                }
                let pass = std::panic::AssertUnwindSafe(orch.health_pass())
                    .catch_unwind()
                    .await;
                if pass.is_err() {
                    orch.report_internal("health pass panicked");
                }
            }
        })
    }

    async fn health_pass(&self) {
        let now = Utc::now();

        for report in self.health.probe_all(&self.pool, now).await {
            match report.outcome {
                HealthOutcome::Healthy => {}
                HealthOutcome::RestartScheduled { .. } => {
                    self.bus.publish(Event::worker_with_reason(
                        EventKind::WorkerFailed,
                        report.worker_id.as_str(),
                        "health probe failed, restart scheduled",
                    ));
                }
                HealthOutcome::Destroyed => {
                    self.knowledge.unregister_worker(&report.worker_id);
                    self.bus.publish(Event::worker_with_reason(
                        EventKind::WorkerFailed,
                        report.worker_id.as_str(),
                        "restart budget exhausted",
                    ));
                }
            }
            if let Some(task_id) = report.orphaned_task {
                self.scheduler
                    .handle_worker_loss(&report.worker_id, &task_id, now);
            }
        }

        for worker_id in self.health.process_due_restarts(&self.pool, now) {
            self.bus.publish(Event::worker(
                EventKind::WorkerRestarted,
                worker_id.as_str(),
            ));
        }

        self.knowledge.sweep(now).await;

        // Starvation: live tasks with no capacity to run them.
        if self.scheduler.has_live_tasks() && self.pool.active_count() == 0 {
            let replaceable = self
                .factory
                .as_ref()
                .map(|f| !f.available_types().is_empty())
                .unwrap_or(false);
            if !replaceable {
                if self.config.fail_on_starvation {
                    self.fail("all workers gone with tasks outstanding");
                } else {
                    self.bus.publish(Event::alert(
                        AlertSeverity::Critical,
                        "degraded: tasks outstanding but no workers available",
                    ));
                }
            }
        }
    }

    fn spawn_autoscale_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(orch.config.autoscale.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if orch.state() != OrchestratorState::Running {
                    if orch.state().is_terminal() {
                        break;
                    }
                    continue;
                }
                let pass = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    orch.autoscale_pass()
                }));
                if pass.is_err() {
                    orch.report_internal("autoscale pass panicked");
                }
            }
        })
    }

    fn autoscale_pass(&self) {
        let now = Utc::now();
        self.check_resource_budget(now);

        // Maintain the floor before consulting the strategy.
        let active = self.pool.active_count();
        if active < self.config.min_agents {
            if let Err(err) =
                self.spawn_from_factory(self.config.min_agents - active, "min-agent floor")
            {
                warn!(error = %err, "Could not maintain the min-agent floor");
            }
        }

        let signals = self.scheduler.signals();
        let advice = self.strategy.should_scale(&signals);
        match advice.decision {
            ScaleDecision::None => {}
            ScaleDecision::Up(n) => {
                let headroom = self
                    .config
                    .max_agents
                    .saturating_sub(self.pool.active_count());
                let step = n.min(headroom);
                if step > 0 {
                    match self.spawn_from_factory(step, &advice.reason) {
                        Ok(spawned) if !spawned.is_empty() => {
                            self.bus.publish(Event::new(
                                EventKind::ScaleUp,
                                "autoscaler",
                                EventPayload::Scale {
                                    count: spawned.len(),
                                    reason: advice.reason,
                                },
                            ));
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Autoscale up failed"),
                    }
                }
            }
            ScaleDecision::Down(n) => {
                let floor_room = self
                    .pool
                    .active_count()
                    .saturating_sub(self.config.min_agents);
                let step = n.min(floor_room);
                if step > 0 {
                    let removed = self.remove_workers(step, false);
                    if !removed.is_empty() {
                        self.bus.publish(Event::new(
                            EventKind::ScaleDown,
                            "autoscaler",
                            EventPayload::Scale {
                                count: removed.len(),
                                reason: advice.reason,
                            },
                        ));
                    }
                }
            }
        }
    }

    /// Sustained cumulative overage beyond the budget is fatal.
    fn check_resource_budget(&self, now: DateTime<Utc>) {
        let Some(budget) = self.resource_budget else { return };
        let in_use = self.pool.stats().resources_in_use;
        let over = !in_use.fits_within(&budget);

        let mut since = self.overage_since.lock();
        match (over, *since) {
            (false, _) => *since = None,
            (true, None) => *since = Some(now),
            (true, Some(started)) => {
                let window = chrono::Duration::from_std(self.config.sustained_overage_window())
                    .unwrap_or_default();
                if now - started > window {
                    drop(since);
                    self.fail("resource budget exceeded beyond the sustained window");
                }
            }
        }
    }

    fn spawn_checkpoint_loop(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let orch = Arc::clone(self);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match orch.state() {
                    OrchestratorState::Running | OrchestratorState::Paused => {
                        if let Err(err) = orch.checkpoint().await {
                            warn!(error = %err, "Periodic checkpoint failed");
                        }
                    }
                    state if state.is_terminal() => break,
                    _ => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskType};
    use crate::worker::{CancelToken, TaskAssignment, WorkerType};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    struct EchoWorker {
        id: WorkerId,
        capabilities: HashSet<String>,
    }

    impl EchoWorker {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: WorkerId::new(id),
                capabilities: HashSet::from(["general".to_string()]),
            })
        }
    }

    #[async_trait]
    impl Worker for EchoWorker {
        fn id(&self) -> &WorkerId {
            &self.id
        }
        fn worker_type(&self) -> WorkerType {
            WorkerType::Specialist
        }
        fn capabilities(&self) -> &HashSet<String> {
            &self.capabilities
        }
        async fn execute(
            &self,
            assignment: TaskAssignment,
            _cancel: CancelToken,
        ) -> crate::error::Result<serde_json::Value> {
            Ok(serde_json::json!({ "echo": assignment.name }))
        }
    }

    struct EchoFactory;

    impl WorkerFactory for EchoFactory {
        fn available_types(&self) -> Vec<WorkerType> {
            vec![WorkerType::Specialist]
        }
        fn advertised_capabilities(&self) -> HashSet<String> {
            HashSet::from(["general".to_string()])
        }
        fn create(&self, _worker_type: WorkerType, instance: usize) -> Arc<dyn Worker> {
            EchoWorker::new(&format!("spawned-{instance}"))
        }
    }

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            tick_interval_ms: 10,
            health_check_interval_ms: 50,
            min_agents: 1,
            autoscale: crate::config::AutoscaleConfig {
                interval_ms: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn orchestrator_with(n: usize) -> Arc<Orchestrator> {
        let mut builder = Orchestrator::builder(quick_config());
        for i in 0..n {
            builder = builder.with_worker(EchoWorker::new(&format!("w-{i}")));
        }
        builder.build().unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_build_validates_config() {
        let config = OrchestratorConfig {
            max_agents: 0,
            ..Default::default()
        };
        assert!(Orchestrator::builder(config)
            .with_worker(EchoWorker::new("w-0"))
            .build()
            .is_err());
    }

    #[test]
    fn test_build_requires_some_execution_capacity() {
        let err = Orchestrator::builder(quick_config()).build().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_submit_rejected_before_start() {
        let orch = orchestrator_with(1);
        assert_eq!(orch.state(), OrchestratorState::Ready);

        let err = orch
            .submit(Task::new("early", TaskType::Process))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_pipeline_end_to_end() {
        let orch = orchestrator_with(2);
        let sub = orch.subscribe(None);
        orch.start().unwrap();

        orch.submit(Task::new("a", TaskType::Process).with_id("a"))
            .unwrap();
        orch.submit(
            Task::new("b", TaskType::Process)
                .with_id("b")
                .with_dependency("a"),
        )
        .unwrap();
        orch.submit(
            Task::new("c", TaskType::Process)
                .with_id("c")
                .with_dependency("b"),
        )
        .unwrap();

        wait_until(|| {
            orch.status(&"c".into())
                .map(|s| s == TaskStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        assert_eq!(orch.status(&"a".into()).unwrap(), TaskStatus::Completed);
        assert_eq!(orch.status(&"b".into()).unwrap(), TaskStatus::Completed);
        assert_eq!(orch.metrics().success_rate(), 1.0);

        // Per-task event streams follow the lifecycle grammar.
        let events = sub.recv_all();
        for id in ["a", "b", "c"] {
            let kinds: Vec<EventKind> = events
                .iter()
                .filter(|e| e.task_id() == Some(id))
                .map(|e| e.kind)
                .collect();
            assert_eq!(
                kinds,
                vec![
                    EventKind::TaskSubmitted,
                    EventKind::TaskReady,
                    EventKind::TaskAssigned,
                    EventKind::TaskStarted,
                    EventKind::TaskCompleted,
                ],
                "event order for {id}"
            );
        }

        // b never started before a completed.
        let a_completed = events
            .iter()
            .position(|e| e.task_id() == Some("a") && e.kind == EventKind::TaskCompleted)
            .unwrap();
        let b_started = events
            .iter()
            .position(|e| e.task_id() == Some("b") && e.kind == EventKind::TaskStarted)
            .unwrap();
        assert!(a_completed < b_started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_new_assignments() {
        let orch = orchestrator_with(1);
        orch.start().unwrap();
        orch.pause().unwrap();

        let err = orch.submit(Task::new("t", TaskType::Process)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);

        orch.resume().unwrap();
        let id = orch.submit(Task::new("t", TaskType::Process)).unwrap();
        wait_until(|| {
            orch.status(&id)
                .map(|s| s == TaskStatus::Completed)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_inventory_gates_submit() {
        let orch = orchestrator_with(1);
        orch.start().unwrap();

        let err = orch
            .submit(Task::new("gpu-task", TaskType::Process).with_capability("gpu"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidGraph);

        // A capability the pool has is accepted.
        orch.submit(Task::new("ok", TaskType::Process).with_capability("general"))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_scaling() {
        let config = OrchestratorConfig {
            max_agents: 3,
            ..quick_config()
        };
        let orch = Orchestrator::builder(config)
            .with_worker(EchoWorker::new("w-0"))
            .with_worker_factory(Arc::new(EchoFactory))
            .build()
            .unwrap();
        orch.start().unwrap();

        let spawned = orch.scale_up(2).unwrap();
        assert_eq!(spawned.len(), 2);
        assert_eq!(orch.worker_count(), 3);

        // Past the ceiling: rejected, not clamped.
        let err = orch.scale_up(1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceExhausted);

        let removed = orch.scale_down(2, false).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(orch.worker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_restore_round_trip() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let orch = Orchestrator::builder(quick_config())
            .with_worker(EchoWorker::new("w-0"))
            .with_kv_store(Arc::clone(&kv))
            .build()
            .unwrap();
        orch.start().unwrap();

        orch.submit(Task::new("done", TaskType::Process).with_id("done"))
            .unwrap();
        wait_until(|| {
            orch.status(&"done".into())
                .map(|s| s == TaskStatus::Completed)
                .unwrap_or(false)
        })
        .await;
        orch.pause().unwrap();
        orch.submit_unchecked_for_tests();

        let checkpoint = orch.checkpoint().await.unwrap();
        assert!(checkpoint.sequence >= 1);

        // A fresh orchestrator over the same KV store restores it.
        let fresh = Orchestrator::builder(quick_config())
            .with_worker(EchoWorker::new("w-0"))
            .with_kv_store(kv)
            .build()
            .unwrap();
        fresh.restore(&checkpoint.id).await.unwrap();

        assert_eq!(
            fresh.status(&"done".into()).unwrap(),
            TaskStatus::Completed
        );
        assert_eq!(
            fresh.result(&"done".into()).unwrap().unwrap().output["echo"],
            "done"
        );

        // Restoring the same checkpoint again is stale.
        let err = fresh.restore(&checkpoint.id).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_and_completes() {
        let orch = orchestrator_with(2);
        orch.start().unwrap();

        for i in 0..4 {
            orch.submit(Task::new("t", TaskType::Process).with_id(format!("t-{i}")))
                .unwrap();
        }
        orch.stop().await.unwrap();

        assert_eq!(orch.state(), OrchestratorState::Completed);
        let err = orch.submit(Task::new("late", TaskType::Process)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_first_assignment_end_to_end() {
        let orch = orchestrator_with(1);
        let sub = orch.subscribe(Some(&[EventKind::TaskStarted]));
        orch.start().unwrap();

        for i in 0..5 {
            orch.submit(
                Task::new("low", TaskType::Process)
                    .with_id(format!("low-{i}"))
                    .with_priority(Priority::Low),
            )
            .unwrap();
        }
        orch.submit(
            Task::new("urgent", TaskType::Process)
                .with_id("critical")
                .with_priority(Priority::Critical),
        )
        .unwrap();

        wait_until(|| {
            orch.status(&"critical".into())
                .map(|s| s == TaskStatus::Completed)
                .unwrap_or(false)
        })
        .await;

        // With a single worker, the critical task starts within the first
        // two assignments despite five older Low tasks.
        let started: Vec<String> = sub
            .recv_all()
            .into_iter()
            .filter_map(|e| e.task_id().map(String::from))
            .collect();
        let critical_pos = started.iter().position(|id| id == "critical").unwrap();
        assert!(critical_pos <= 1, "critical started at {critical_pos} in {started:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_consensus_and_knowledge_through_facade() {
        let orch = orchestrator_with(4);
        orch.start().unwrap();
        let knowledge = orch.knowledge();
        let now = Utc::now();

        let session = knowledge.request_consensus(
            &WorkerId::new("w-0"),
            "topic-x",
            serde_json::json!({"options": ["yes", "no"]}),
            now + chrono::Duration::seconds(60),
            now,
        );
        for i in 0..3 {
            knowledge
                .vote(&WorkerId::new(format!("w-{i}")), &session, true, 0.9, None)
                .unwrap();
        }
        let result = knowledge.consensus_result(&session).unwrap();
        assert_eq!(result.status, crate::knowledge::ConsensusStatus::Approved);
        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.participation, 0.75);
        assert!(outcome.consensus >= 0.66);
    }

    #[tokio::test(start_paused = true)]
    async fn test_internal_panic_reported_not_fatal() {
        let orch = orchestrator_with(1);
        orch.report_internal("synthetic fault");

        let sub = orch.subscribe_from(Some(&[EventKind::AlertTriggered]), 0);
        let event = sub.try_recv().unwrap();
        match event.payload {
            EventPayload::Alert {
                severity,
                correlation_id,
                ..
            } => {
                assert_eq!(severity, AlertSeverity::Critical);
                assert!(correlation_id.is_some());
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(!orch.state().is_terminal());
    }

    impl Orchestrator {
        /// Test hook: place a task directly while Paused.
        fn submit_unchecked_for_tests(&self) {
            self.scheduler
                .submit(
                    Task::new("pending", TaskType::Process).with_id("pending"),
                    Utc::now(),
                )
                .unwrap();
        }
    }
}
