//! The step dispatcher.
//!
//! One orchestrator task owns each running workflow: it walks the steps in
//! declaration order (a topological order of the dependency DAG, upheld by
//! validation), waits out dependencies, evaluates gating conditions and
//! dispatches by step type. It is also the only writer of the workflow
//! document while the run lasts; everyone else observes through
//! `workflow:updates`.

use crate::condition;
use crate::metrics::MetricsCollector;
use crate::model::{
    FailureStrategy, MapErrorHandling, MapStepState, StateMap, Step, StepStatus, StepType,
    Workflow, WorkflowStatus, META_AGGREGATE_STATUS,
};
use crate::monitor::AgentMonitor;
use crate::pool::{PoolManager, PoolTimings};
use crate::profiler::PerformanceProfiler;
use crate::recovery::ErrorHandler;
use crate::runtime::{ContainerRuntime, ENV_REDIS_HOST, ENV_REDIS_PORT};
use crate::state::StateManager;
use crate::store::WorkflowStore;
use crate::subworkflow::SubWorkflowExecutor;
use crate::task::{TaskCoordinator, WorkerContext};
use crate::{OrchestrationError, OrchestratorConfig};
use chrono::Utc;
use coordination_store::CoordinationStore;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn CoordinationStore>,
    workflows: WorkflowStore,
    state: StateManager,
    runtime: Arc<dyn ContainerRuntime>,
    pools: Arc<PoolManager>,
    coordinator: TaskCoordinator,
    metrics: Arc<MetricsCollector>,
    profiler: Arc<PerformanceProfiler>,
    error_handler: Arc<ErrorHandler>,
    subworkflows: SubWorkflowExecutor,
    config: OrchestratorConfig,
    active: Arc<DashMap<String, watch::Sender<bool>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::with_timings(store, runtime, config, PoolTimings::default())
    }

    pub fn with_timings(
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        config: OrchestratorConfig,
        timings: PoolTimings,
    ) -> Self {
        let workflows = WorkflowStore::new(store.clone());
        let state = StateManager::new(store.clone());
        let metrics = Arc::new(MetricsCollector::new(store.clone()));
        let profiler = Arc::new(PerformanceProfiler::new(store.clone()));

        let mut base_env = HashMap::new();
        base_env.insert(ENV_REDIS_HOST.to_string(), config.store_host.clone());
        base_env.insert(ENV_REDIS_PORT.to_string(), config.store_port.to_string());
        let pools = PoolManager::new(runtime.clone(), base_env, timings);

        let coordinator = TaskCoordinator::new(
            store.clone(),
            runtime.clone(),
            pools.clone(),
            metrics.clone(),
            config.clone(),
        );
        let monitor = AgentMonitor::new(runtime.clone());
        let error_handler = Arc::new(ErrorHandler::new(
            workflows.clone(),
            state.clone(),
            store.clone(),
            runtime.clone(),
            monitor,
            metrics.clone(),
            config.rollback_wait,
        ));
        let subworkflows = SubWorkflowExecutor::new(workflows.clone(), state.clone());

        Self {
            store,
            workflows,
            state,
            runtime,
            pools,
            coordinator,
            metrics,
            profiler,
            error_handler,
            subworkflows,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.workflows
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn profiler(&self) -> &Arc<PerformanceProfiler> {
        &self.profiler
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn subworkflows(&self) -> &SubWorkflowExecutor {
        &self.subworkflows
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    /// Persist and execute in one call.
    pub async fn run(&self, mut workflow: Workflow) -> Result<WorkflowStatus, OrchestrationError> {
        self.workflows.create(&mut workflow).await?;
        self.execute(&workflow.id).await
    }

    /// Execute a stored workflow to a terminal status. Boxed because
    /// sub-workflow steps re-enter the orchestrator.
    pub fn execute<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> BoxFuture<'a, Result<WorkflowStatus, OrchestrationError>> {
        async move { self.execute_inner(workflow_id).await }.boxed()
    }

    /// Flip the cancellation flag of a running workflow; pending waits and
    /// retry sleeps observe it and abort.
    pub fn cancel(&self, workflow_id: &str) -> Result<(), OrchestrationError> {
        match self.active.get(workflow_id) {
            Some(entry) => {
                let _ = entry.value().send(true);
                info!(workflow_id, "cancellation requested");
                Ok(())
            }
            None => Err(OrchestrationError::NotFound {
                resource: format!("running workflow {}", workflow_id),
            }),
        }
    }

    async fn execute_inner(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, OrchestrationError> {
        let mut workflow = self.workflows.get(workflow_id).await?;
        workflow.validate()?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.insert(workflow_id.to_string(), cancel_tx);
        let run_started = Instant::now();
        let deadline = workflow
            .config
            .timeout_seconds
            .map(|seconds| run_started + Duration::from_secs(seconds));

        workflow.status = WorkflowStatus::Running;
        workflow.started_at.get_or_insert_with(Utc::now);
        self.workflows.save(&mut workflow).await?;
        self.metrics.record_workflow_start(workflow_id).await;
        if workflow.config.enable_profiling {
            self.profiler.start(workflow_id);
        }
        info!(workflow_id, steps = workflow.steps.len(), "workflow started");

        let mut failed_steps = 0usize;
        let mut fatal: Option<OrchestrationError> = None;

        for index in 0..workflow.steps.len() {
            if *cancel_rx.borrow() {
                return self.finish_cancelled(&mut workflow, run_started).await;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    fatal = Some(OrchestrationError::TaskTimeout {
                        seconds: workflow.config.timeout_seconds.unwrap_or_default(),
                    });
                    break;
                }
            }
            // Branch/decision gating may already have skipped this step.
            if workflow.steps[index].status.is_terminal() {
                continue;
            }

            match self
                .run_step_with_recovery(&mut workflow, index, cancel_rx.clone())
                .await
            {
                Ok(()) => {}
                Err(OrchestrationError::Cancelled) => {
                    return self.finish_cancelled(&mut workflow, run_started).await;
                }
                Err(err) => {
                    failed_steps += 1;
                    match workflow.config.failure_strategy {
                        FailureStrategy::FailFast => {
                            fatal = Some(err);
                            break;
                        }
                        FailureStrategy::Continue => {
                            debug!(workflow_id, step = %workflow.steps[index].id, "continuing past failed step");
                        }
                        FailureStrategy::Compensate => {
                            self.compensate_step(&mut workflow, index, &cancel_rx, &mut failed_steps)
                                .await;
                        }
                    }
                }
            }
        }

        if let Some(err) = fatal {
            if let Err(e) = self.error_handler.rollback_completed(&mut workflow).await {
                warn!(workflow_id, error = %e, "rollback sweep errored");
            }
            Self::finalize_remaining(&mut workflow, None);
            workflow.status = WorkflowStatus::Failed;
            workflow.completed_at = Some(Utc::now());
            self.workflows.save(&mut workflow).await?;
            self.metrics
                .record_workflow_fail(workflow_id, &err.to_string(), run_started.elapsed())
                .await;
            self.finish_observers(&workflow).await;
            self.active.remove(workflow_id);
            return Err(err);
        }

        // Under `continue`, the workflow completed because it ran to the
        // end; failed steps are surfaced separately.
        workflow.status = WorkflowStatus::Completed;
        workflow.completed_at = Some(Utc::now());
        if failed_steps > 0 {
            workflow.metadata.insert(
                META_AGGREGATE_STATUS.to_string(),
                "completed_with_failures".to_string(),
            );
        }
        self.workflows.save(&mut workflow).await?;
        self.metrics
            .record_workflow_complete(workflow_id, run_started.elapsed())
            .await;
        self.finish_observers(&workflow).await;
        self.active.remove(workflow_id);
        info!(workflow_id, failed_steps, "workflow completed");
        Ok(WorkflowStatus::Completed)
    }

    async fn finish_observers(&self, workflow: &Workflow) {
        if workflow.config.enable_profiling {
            self.profiler.stop(&workflow.id).await;
        }
    }

    /// A terminal workflow may not carry non-terminal steps: anything
    /// still running failed (with the given label), anything pending never
    /// ran and is skipped.
    fn finalize_remaining(workflow: &mut Workflow, running_error: Option<&str>) {
        let now = Utc::now();
        for step in &mut workflow.steps {
            match step.status {
                StepStatus::Running => {
                    step.status = StepStatus::Failed;
                    step.error = Some(running_error.unwrap_or("aborted").to_string());
                    step.started_at.get_or_insert(now);
                    step.completed_at = Some(now);
                }
                StepStatus::Pending => {
                    step.status = StepStatus::Skipped;
                    step.started_at = Some(now);
                    step.completed_at = Some(now);
                }
                _ => {}
            }
        }
    }

    async fn finish_cancelled(
        &self,
        workflow: &mut Workflow,
        run_started: Instant,
    ) -> Result<WorkflowStatus, OrchestrationError> {
        Self::finalize_remaining(workflow, Some("cancelled"));
        workflow.status = WorkflowStatus::Cancelled;
        workflow.completed_at = Some(Utc::now());
        self.workflows.save(workflow).await?;
        self.metrics
            .record_workflow_fail(&workflow.id, "cancelled", run_started.elapsed())
            .await;
        self.finish_observers(workflow).await;
        self.active.remove(&workflow.id);
        info!(workflow_id = %workflow.id, "workflow cancelled");
        Ok(WorkflowStatus::Cancelled)
    }

    async fn compensate_step(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: &watch::Receiver<bool>,
        failed_steps: &mut usize,
    ) {
        let step_id = workflow.steps[index].id.clone();
        let outcome = match self.error_handler.compensate(workflow, index).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(workflow_id = %workflow.id, step_id = %step_id, error = %e, "compensation pass failed");
                return;
            }
        };

        if outcome.retry_requested {
            workflow.steps[index].reset_for_retry();
            if let Err(e) = self.workflows.save(workflow).await {
                warn!(workflow_id = %workflow.id, error = %e, "failed to persist compensation retry");
                return;
            }
            match self.execute_step(workflow, index, cancel.clone()).await {
                Ok(()) => {
                    *failed_steps = failed_steps.saturating_sub(1);
                    info!(workflow_id = %workflow.id, step_id = %step_id, "compensation retry succeeded");
                }
                Err(e) => {
                    let _ = self.error_handler.record_failure(workflow, index, &e).await;
                }
            }
        }

        if let Some(alternate) = outcome.alternate_workflow {
            match self
                .subworkflows
                .execute_sub_workflow(self, workflow, &step_id, &alternate)
                .await
            {
                Ok(_) => info!(workflow_id = %workflow.id, alternate, "alternate workflow completed"),
                Err(e) => {
                    warn!(workflow_id = %workflow.id, alternate, error = %e, "alternate workflow failed")
                }
            }
        }
    }

    /// Dispatch a step, cycling failed attempts back through `pending`
    /// while the retry policy allows.
    async fn run_step_with_recovery(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        loop {
            match self.execute_step(workflow, index, cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(OrchestrationError::Cancelled) => return Err(OrchestrationError::Cancelled),
                Err(err) => {
                    self.error_handler
                        .record_failure(workflow, index, &err)
                        .await?;
                    match self.error_handler.retry_delay(&workflow.steps[index]) {
                        Some(delay) => {
                            debug!(
                                workflow_id = %workflow.id,
                                step_id = %workflow.steps[index].id,
                                backoff_ms = delay.as_millis() as u64,
                                "backing off before retry"
                            );
                            cancellable_sleep(delay, &cancel).await?;
                            self.error_handler.prepare_retry(workflow, index).await?;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }

    pub(crate) async fn execute_step(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        self.wait_for_dependencies(workflow, index, cancel.clone())
            .await?;

        if let Some(gate) = workflow.steps[index].config.condition.clone() {
            if !condition::evaluate(&gate, &workflow.state)? {
                let now = Utc::now();
                let step = &mut workflow.steps[index];
                step.status = StepStatus::Skipped;
                step.started_at = Some(now);
                step.completed_at = Some(now);
                info!(workflow_id = %workflow.id, step_id = %step.id, "condition false, step skipped");
                self.workflows.save(workflow).await?;
                return Ok(());
            }
        }

        let (step_id, step_type) = {
            let step = &mut workflow.steps[index];
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
            (step.id.clone(), step.step_type)
        };
        self.workflows.save(workflow).await?;
        self.metrics.record_step_start(&workflow.id, &step_id).await;
        self.profiler.record_step_start(&workflow.id, &step_id);
        debug!(workflow_id = %workflow.id, step_id = %step_id, step_type = ?step_type, "step started");

        let result = match step_type {
            StepType::Sequential => self.execute_single_task(workflow, index, None, cancel).await,
            StepType::Reduce => {
                self.execute_single_task(workflow, index, Some("reduce".to_string()), cancel)
                    .await
            }
            StepType::Parallel => self.execute_parallel(workflow, index, cancel).await,
            StepType::Map => self.execute_map(workflow, index, cancel).await,
            StepType::Decision => self.execute_decision(workflow, index).await,
            StepType::Branch => self.execute_branch(workflow, index).await,
            StepType::Subworkflow => self.execute_subworkflow_step(workflow, index).await,
        };

        self.profiler.record_step_end(&workflow.id, &step_id);
        match result {
            Ok(()) => {
                let step = &mut workflow.steps[index];
                step.status = StepStatus::Completed;
                step.completed_at = Some(Utc::now());
                self.workflows.save(workflow).await?;
                self.metrics
                    .record_step_complete(&workflow.id, &step_id)
                    .await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Sequential and reduce steps: one task, result merged into state. A
    /// reduce task's input is the whole state snapshot, so the agent sees
    /// the upstream map results.
    async fn execute_single_task(
        &self,
        workflow: &mut Workflow,
        index: usize,
        task_type: Option<String>,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let ctx = WorkerContext {
            task_type,
            ..Default::default()
        };
        let result = self.coordinator.dispatch(workflow, &step, ctx, cancel).await?;
        self.merge_result(workflow, &step.id, &result).await?;
        workflow.steps[index].results = Some(result);
        Ok(())
    }

    /// Merge an agent's result object into workflow state; non-object
    /// results land under `<step_id>_result`.
    async fn merge_result(
        &self,
        workflow: &mut Workflow,
        step_id: &str,
        result: &Value,
    ) -> Result<(), OrchestrationError> {
        match result {
            Value::Object(map) => {
                for (key, value) in map {
                    workflow.state.insert(key.clone(), value.clone());
                    self.state.set(&workflow.id, key, value).await?;
                }
            }
            Value::Null => {}
            other => {
                let key = format!("{}_result", step_id);
                workflow.state.insert(key.clone(), other.clone());
                self.state.set(&workflow.id, &key, other).await?;
            }
        }
        Ok(())
    }

    fn parallel_contexts(workflow: &Workflow, max_workers: usize) -> Vec<WorkerContext> {
        // Dynamic parallel steps draw their work from `state["tasks"]`.
        if let Some(items) = workflow.state.get("tasks").and_then(Value::as_array) {
            if !items.is_empty() {
                return items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| WorkerContext {
                        worker_id: Some(format!("worker-{}", i)),
                        map_index: None,
                        extra_input: [("task".to_string(), item.clone())].into_iter().collect(),
                        task_type: Some("parallel".to_string()),
                    })
                    .collect();
            }
        }
        (0..max_workers)
            .map(|i| WorkerContext {
                worker_id: Some(format!("worker-{}", i)),
                map_index: None,
                extra_input: StateMap::new(),
                task_type: Some("parallel".to_string()),
            })
            .collect()
    }

    async fn execute_parallel(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let max_workers = step
            .config
            .max_workers
            .unwrap_or(workflow.config.max_parallel)
            .max(1);
        let contexts = Self::parallel_contexts(workflow, max_workers);
        let total = contexts.len();

        let outcomes = self
            .drain_worker_queue(workflow, &step, contexts, max_workers, cancel)
            .await;

        let mut failed = 0usize;
        let mut first_error: Option<String> = None;
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(Ok(value)) => {
                    let key = format!("{}_result_{}", step.id, i);
                    workflow.state.insert(key.clone(), value.clone());
                    self.state.set(&workflow.id, &key, &value).await?;
                }
                Some(Err(message)) => {
                    failed += 1;
                    first_error.get_or_insert(message);
                }
                None => {
                    failed += 1;
                    first_error.get_or_insert_with(|| "worker did not run".to_string());
                }
            }
        }

        workflow.steps[index].results = Some(json!({
            "workers": total,
            "failed": failed,
        }));
        if failed > 0 {
            return Err(OrchestrationError::TaskFailed {
                message: format!(
                    "{} of {} parallel workers failed: {}",
                    failed,
                    total,
                    first_error.unwrap_or_default()
                ),
            });
        }
        Ok(())
    }

    /// Fixed-size worker pool draining an indexed queue; at most
    /// `max_workers` tasks are in flight at any instant.
    async fn drain_worker_queue(
        &self,
        workflow: &Workflow,
        step: &Step,
        contexts: Vec<WorkerContext>,
        max_workers: usize,
        cancel: watch::Receiver<bool>,
    ) -> Vec<Option<Result<Value, String>>> {
        let total = contexts.len();
        if total == 0 {
            return Vec::new();
        }
        let (queue_tx, queue_rx) = mpsc::channel(total);
        for work in contexts.into_iter().enumerate() {
            // Capacity equals the queue length; this cannot fail.
            let _ = queue_tx.try_send(work);
        }
        drop(queue_tx);
        let queue = Arc::new(AsyncMutex::new(queue_rx));
        let outcomes: Arc<Mutex<Vec<Option<Result<Value, String>>>>> =
            Arc::new(Mutex::new(vec![None; total]));
        let snapshot = Arc::new(workflow.clone());

        let mut handles = Vec::new();
        for _ in 0..max_workers.min(total) {
            let queue = queue.clone();
            let outcomes = outcomes.clone();
            let snapshot = snapshot.clone();
            let step = step.clone();
            let coordinator = self.coordinator.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { queue.lock().await.recv().await };
                    let (i, ctx) = match next {
                        Some(work) => work,
                        None => break,
                    };
                    let outcome = coordinator
                        .dispatch(&snapshot, &step, ctx, cancel.clone())
                        .await
                        .map_err(|e| e.to_string());
                    outcomes.lock()[i] = Some(outcome);
                }
            }));
        }
        futures::future::join_all(handles).await;

        Arc::try_unwrap(outcomes)
            .map(|mutex| mutex.into_inner())
            .unwrap_or_else(|arc| arc.lock().clone())
    }

    async fn execute_map(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let map_config = step
            .config
            .map
            .clone()
            .ok_or_else(|| OrchestrationError::Validation {
                message: format!("map step {} is missing map config", step.id),
            })?;

        let path = map_config
            .input_path
            .strip_prefix("$.")
            .unwrap_or(&map_config.input_path);
        let items: Vec<Value> = workflow
            .state
            .get(path)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| OrchestrationError::Validation {
                message: format!(
                    "map input {} of step {} is not an array in workflow state",
                    map_config.input_path, step.id
                ),
            })?;
        let total = items.len();

        let ledger = Arc::new(Mutex::new(MapStepState::new(total)));
        let ledger_snapshot = ledger.lock().clone();
        self.state
            .set_map_state(&workflow.id, &step.id, &ledger_snapshot)
            .await?;
        if total == 0 {
            let empty = Value::Array(Vec::new());
            let key = format!("{}_results", step.id);
            workflow.state.insert(key.clone(), empty.clone());
            self.state.set(&workflow.id, &key, &empty).await?;
            workflow.steps[index].results =
                Some(json!({"total": 0, "completed": 0, "failed": 0}));
            return Ok(());
        }

        // Map-local abort flag: under fail_fast the first failure cancels
        // the siblings without touching the workflow-level flag.
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);
        let combined = combine_cancel(cancel.clone(), abort_rx);

        let (queue_tx, queue_rx) = mpsc::channel(total);
        for work in items.into_iter().enumerate() {
            let _ = queue_tx.try_send(work);
        }
        drop(queue_tx);
        let queue = Arc::new(AsyncMutex::new(queue_rx));
        let snapshot = Arc::new(workflow.clone());
        let first_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::new();
        for _ in 0..map_config.max_concurrency.max(1).min(total) {
            let queue = queue.clone();
            let ledger = ledger.clone();
            let snapshot = snapshot.clone();
            let step = step.clone();
            let coordinator = self.coordinator.clone();
            let state = self.state.clone();
            let combined = combined.clone();
            let abort_tx = abort_tx.clone();
            let first_error = first_error.clone();
            let item_alias = map_config.item_alias.clone();
            let error_handling = map_config.error_handling;
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { queue.lock().await.recv().await };
                    let (i, item) = match next {
                        Some(work) => work,
                        None => break,
                    };
                    if *combined.borrow() {
                        break;
                    }
                    let ctx = WorkerContext {
                        worker_id: Some(format!("map-{}", i)),
                        map_index: Some(i),
                        extra_input: [(item_alias.clone(), item)].into_iter().collect(),
                        task_type: Some("map".to_string()),
                    };
                    let outcome = coordinator
                        .dispatch(&snapshot, &step, ctx, combined.clone())
                        .await;
                    let progress = {
                        let mut ledger = ledger.lock();
                        match outcome {
                            Ok(value) => {
                                ledger.results[i] = value;
                                ledger.completed += 1;
                            }
                            Err(e) => {
                                ledger.failed += 1;
                                first_error.lock().get_or_insert(e.to_string());
                                if error_handling == MapErrorHandling::FailFast {
                                    let _ = abort_tx.send(true);
                                }
                            }
                        }
                        ledger.clone()
                    };
                    if let Err(e) = state
                        .set_map_state(&snapshot.id, &step.id, &progress)
                        .await
                    {
                        warn!(step_id = %step.id, error = %e, "failed to persist map progress");
                    }
                }
            }));
        }
        futures::future::join_all(handles).await;

        let final_ledger = ledger.lock().clone();
        self.state
            .set_map_state(&workflow.id, &step.id, &final_ledger)
            .await?;
        let results = Value::Array(final_ledger.results.clone());
        let key = format!("{}_results", step.id);
        workflow.state.insert(key.clone(), results.clone());
        self.state.set(&workflow.id, &key, &results).await?;
        workflow.steps[index].results = Some(json!({
            "total": final_ledger.total,
            "completed": final_ledger.completed,
            "failed": final_ledger.failed,
        }));

        if *cancel.borrow() {
            return Err(OrchestrationError::Cancelled);
        }
        if final_ledger.failed > 0 && map_config.error_handling == MapErrorHandling::FailFast {
            return Err(OrchestrationError::TaskFailed {
                message: format!(
                    "map step {} failed on {} of {} items: {}",
                    step.id,
                    final_ledger.failed,
                    final_ledger.total,
                    first_error.lock().clone().unwrap_or_default()
                ),
            });
        }
        Ok(())
    }

    async fn execute_decision(
        &self,
        workflow: &mut Workflow,
        index: usize,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let node = step
            .config
            .decision
            .clone()
            .ok_or_else(|| OrchestrationError::Validation {
                message: format!("decision step {} is missing decision config", step.id),
            })?;

        let branch_id = condition::select_branch(&node, &workflow.state)?;
        info!(workflow_id = %workflow.id, step_id = %step.id, branch = %branch_id, "decision resolved");

        let key = format!("decision_{}_result", step.id);
        let value = json!(branch_id);
        workflow.state.insert(key.clone(), value.clone());
        self.state.set(&workflow.id, &key, &value).await?;

        let winning = node.branches.iter().find(|b| b.id == branch_id);
        let released: HashSet<String> = winning
            .map(|b| b.next_steps.iter().cloned().collect())
            .unwrap_or_default();
        for target in &released {
            if let Some(target_step) = workflow.step_mut(target) {
                target_step.depends_on.retain(|dep| dep != &step.id);
            }
        }
        // Targets reachable only through losing branches will never be
        // enabled; skip them so their dependents resolve.
        let losing: HashSet<String> = node
            .branches
            .iter()
            .filter(|b| b.id != branch_id)
            .flat_map(|b| b.next_steps.iter().cloned())
            .collect();
        for target in losing.difference(&released) {
            Self::skip_step(workflow, target);
        }

        if let Some(branch) = winning {
            if let Some(nested) = branch.sub_workflow.clone() {
                self.subworkflows
                    .execute_sub_workflow(self, workflow, &step.id, &nested)
                    .await?;
            }
        }

        workflow.steps[index].results = Some(json!({"branch": branch_id}));
        Ok(())
    }

    async fn execute_branch(
        &self,
        workflow: &mut Workflow,
        index: usize,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let branches = step
            .config
            .branches
            .clone()
            .ok_or_else(|| OrchestrationError::Validation {
                message: format!("branch step {} is missing branch config", step.id),
            })?;

        let verdict = condition::evaluate(&branches.condition, &workflow.state)?;
        let (enabled, disabled, nested) = if verdict {
            (branches.true_steps, branches.false_steps, branches.true_workflow)
        } else {
            (branches.false_steps, branches.true_steps, branches.false_workflow)
        };
        info!(workflow_id = %workflow.id, step_id = %step.id, verdict, "branch resolved");

        // Enabled steps were authored to depend on the gate alone.
        for target in &enabled {
            if let Some(target_step) = workflow.step_mut(target) {
                target_step.depends_on.clear();
            }
        }
        for target in &disabled {
            if !enabled.contains(target) {
                Self::skip_step(workflow, target);
            }
        }

        if let Some(nested) = nested {
            self.subworkflows
                .execute_sub_workflow(self, workflow, &step.id, &nested)
                .await?;
        }

        let key = format!("branch_{}_result", step.id);
        let value = json!(verdict);
        workflow.state.insert(key.clone(), value.clone());
        self.state.set(&workflow.id, &key, &value).await?;
        workflow.steps[index].results = Some(json!({"condition": verdict}));
        Ok(())
    }

    fn skip_step(workflow: &mut Workflow, step_id: &str) {
        if let Some(step) = workflow.step_mut(step_id) {
            if step.status == StepStatus::Pending {
                let now = Utc::now();
                step.status = StepStatus::Skipped;
                step.started_at = Some(now);
                step.completed_at = Some(now);
            }
        }
    }

    async fn execute_subworkflow_step(
        &self,
        workflow: &mut Workflow,
        index: usize,
    ) -> Result<(), OrchestrationError> {
        let step = workflow.steps[index].clone();
        let reference =
            step.config
                .sub_workflow
                .clone()
                .ok_or_else(|| OrchestrationError::Validation {
                    message: format!("subworkflow step {} names no workflow", step.id),
                })?;
        let result = self
            .subworkflows
            .execute_sub_workflow(self, workflow, &step.id, &reference)
            .await?;
        workflow.steps[index].results = Some(result);
        Ok(())
    }

    /// Cooperative polling barrier: dependencies must reach a terminal
    /// status before the step may start. Completed and skipped proceed;
    /// failed propagates.
    async fn wait_for_dependencies(
        &self,
        workflow: &mut Workflow,
        index: usize,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), OrchestrationError> {
        let step_id = workflow.steps[index].id.clone();
        let deps = workflow.steps[index].depends_on.clone();
        if deps.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + self.config.dependency_wait_max;

        for dep in deps {
            loop {
                let status = workflow
                    .step(&dep)
                    .map(|s| s.status)
                    .ok_or_else(|| OrchestrationError::Validation {
                        message: format!("step {} depends on unknown step {}", step_id, dep),
                    })?;
                match status {
                    StepStatus::Completed | StepStatus::Skipped => break,
                    StepStatus::Failed => {
                        return Err(OrchestrationError::DependencyFailed {
                            step_id: dep,
                            reason: "dependency step failed".to_string(),
                        });
                    }
                    _ => {
                        if Instant::now() >= deadline {
                            return Err(OrchestrationError::DependencyFailed {
                                step_id: dep,
                                reason: format!(
                                    "timed out after {}s waiting for dependency",
                                    self.config.dependency_wait_max.as_secs()
                                ),
                            });
                        }
                        cancellable_sleep(self.config.dependency_poll_interval, &cancel).await?;
                        *workflow = self.workflows.get(&workflow.id).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Sleep that aborts with [`OrchestrationError::Cancelled`] when the
/// cancellation flag flips. A dropped sender just lets the sleep finish.
pub(crate) async fn cancellable_sleep(
    duration: Duration,
    cancel: &watch::Receiver<bool>,
) -> Result<(), OrchestrationError> {
    if *cancel.borrow() {
        return Err(OrchestrationError::Cancelled);
    }
    let mut cancel = cancel.clone();
    let deadline = Instant::now() + duration;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    let mut watch_open = true;
    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = cancel.changed(), if watch_open => match changed {
                Ok(()) => {
                    if *cancel.borrow() {
                        return Err(OrchestrationError::Cancelled);
                    }
                }
                Err(_) => watch_open = false,
            },
        }
    }
}

/// Merge two cancellation sources into one receiver.
fn combine_cancel(
    mut a: watch::Receiver<bool>,
    mut b: watch::Receiver<bool>,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(*a.borrow() || *b.borrow());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = a.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *a.borrow() {
                        let _ = tx.send(true);
                        return;
                    }
                }
                changed = b.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *b.borrow() {
                        let _ = tx.send(true);
                        return;
                    }
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::model::{Step, StepType};
    use coordination_store::MemoryStore;

    fn orchestrator() -> Orchestrator {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store.clone()));
        Orchestrator::new(store, runtime, OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn execute_rejects_unknown_workflow() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.execute("wf-nope").await,
            Err(OrchestrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn execute_rejects_cyclic_workflow() {
        let orchestrator = orchestrator();
        let mut workflow = Workflow::new("cyclic", "");
        let mut a = Step::new("a", "a", StepType::Sequential);
        a.depends_on = vec!["b".to_string()];
        let mut b = Step::new("b", "b", StepType::Sequential);
        b.depends_on = vec!["a".to_string()];
        workflow.steps = vec![a, b];
        // Persist without validation to exercise the execute-time check.
        orchestrator.workflows.save(&mut workflow).await.unwrap();

        assert!(matches!(
            orchestrator.execute(&workflow.id).await,
            Err(OrchestrationError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_requires_running_workflow() {
        let orchestrator = orchestrator();
        assert!(matches!(
            orchestrator.cancel("wf-idle"),
            Err(OrchestrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancellable_sleep_aborts_on_flag() {
        let (tx, rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            cancellable_sleep(Duration::from_secs(30), &rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(200), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(OrchestrationError::Cancelled)));
    }
}
