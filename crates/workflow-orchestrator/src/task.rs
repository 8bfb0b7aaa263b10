//! Task coordination.
//!
//! One task per container launch: the coordinator persists the task record,
//! subscribes to the completion channel *before* the agent starts (a
//! subscribe-after-launch would race the agent's publish), launches or
//! acquires an agent, then waits on the pub-sub signal, a periodic agent
//! liveness check and the step deadline.

use crate::metrics::MetricsCollector;
use crate::model::{
    CleanupPolicy, ExecutionMode, StateMap, Step, StepType, Task, Workflow,
};
use crate::pool::{AgentPool, PoolManager, PooledAgent};
use crate::runtime::{
    ContainerRuntime, DeploySpec, ENV_MAP_INDEX, ENV_REDIS_HOST, ENV_REDIS_PORT, ENV_STEP_ID,
    ENV_TASK_ID, ENV_WORKER_ID, ENV_WORKFLOW_ID,
};
use crate::{OrchestrationError, OrchestratorConfig};
use chrono::Utc;
use coordination_store::{CoordinationStore, Subscription};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-worker context for parallel and map fan-out.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    pub worker_id: Option<String>,
    pub map_index: Option<usize>,
    /// Step-specific injections merged over the state snapshot.
    pub extra_input: StateMap,
    pub task_type: Option<String>,
}

enum Launched {
    Pooled(Arc<AgentPool>, PooledAgent),
    Direct(String),
}

#[derive(Clone)]
pub struct TaskCoordinator {
    store: Arc<dyn CoordinationStore>,
    runtime: Arc<dyn ContainerRuntime>,
    pools: Arc<PoolManager>,
    metrics: Arc<MetricsCollector>,
    config: OrchestratorConfig,
}

impl TaskCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        pools: Arc<PoolManager>,
        metrics: Arc<MetricsCollector>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            pools,
            metrics,
            config,
        }
    }

    /// Snapshot the workflow state (plus worker injections) into a task.
    pub fn build_task(&self, workflow: &Workflow, step: &Step, ctx: &WorkerContext) -> Task {
        let mut input = workflow.state.clone();
        for (key, value) in &ctx.extra_input {
            input.insert(key.clone(), value.clone());
        }
        if let Some(index) = ctx.map_index {
            input.insert("_map_index".to_string(), json!(index));
        }
        Task {
            task_id: format!("task-{}", Uuid::new_v4()),
            workflow_id: workflow.id.clone(),
            step_id: step.id.clone(),
            worker_id: ctx.worker_id.clone(),
            map_index: ctx.map_index,
            input,
            created_at: Utc::now(),
            task_type: ctx
                .task_type
                .clone()
                .unwrap_or_else(|| format!("{:?}", step.step_type).to_lowercase()),
        }
    }

    pub fn step_timeout(&self, step: &Step) -> Duration {
        match step.config.timeout_seconds {
            Some(seconds) => Duration::from_secs(seconds),
            None => match step.step_type {
                StepType::Parallel | StepType::Map => self.config.parallel_step_timeout,
                _ => self.config.default_step_timeout,
            },
        }
    }

    /// Run one task for the step to completion and return the agent's
    /// result value.
    pub async fn dispatch(
        &self,
        workflow: &Workflow,
        step: &Step,
        ctx: WorkerContext,
        cancel: watch::Receiver<bool>,
    ) -> Result<Value, OrchestrationError> {
        let task = self.build_task(workflow, step, &ctx);
        let timeout = self.step_timeout(step);
        let ttl = timeout + self.config.task_ttl_margin;

        let document = serde_json::to_string(&task).map_err(|e| OrchestrationError::Validation {
            message: format!("unserializable task {}: {}", task.task_id, e),
        })?;
        self.store.set(&task.key(), &document, Some(ttl)).await?;

        // Subscribe first; the agent may publish the moment it starts.
        let subscription = self.store.subscribe(&task.completion_channel()).await?;

        let launched = self.launch(workflow, step, &task).await?;
        let agent_id = match &launched {
            Launched::Pooled(_, agent) => agent.agent_id.clone(),
            Launched::Direct(agent_id) => agent_id.clone(),
        };
        self.store
            .set_add(&format!("workflow:{}:jobs", workflow.id), &agent_id)
            .await?;
        debug!(task_id = %task.task_id, agent_id = %agent_id, step_id = %step.id, "task dispatched");

        let result = self
            .await_completion(&task, &agent_id, timeout, subscription, cancel)
            .await;

        match launched {
            Launched::Pooled(pool, agent) => {
                // Warm agents go back to their pool regardless of outcome.
                pool.release(agent).await;
                self.metrics.record_pool_utilization(self.pools.utilization());
            }
            Launched::Direct(agent_id) => {
                self.cleanup_direct(&agent_id, workflow.config.cleanup_policy, result.is_ok())
                    .await;
            }
        }
        result
    }

    async fn launch(
        &self,
        workflow: &Workflow,
        step: &Step,
        task: &Task,
    ) -> Result<Launched, OrchestrationError> {
        if step.config.execution_mode == ExecutionMode::Pooled {
            let settings = step.config.pool.clone().unwrap_or_default();
            let pool = self.pools.get_or_create(&step.config.image, &settings);
            match pool.acquire().await {
                Ok(agent) => {
                    if agent.usage_count == 0 {
                        self.metrics.record_agent_deployed();
                    } else {
                        self.metrics.record_agent_reused();
                    }
                    // Warm agents learn their work over the per-agent
                    // channel instead of env vars.
                    self.store
                        .publish(&agent.tasks_channel(), &task.task_id)
                        .await?;
                    return Ok(Launched::Pooled(pool, agent));
                }
                Err(OrchestrationError::AtCapacity { image }) => {
                    warn!(image = %image, step_id = %step.id, "pool at capacity, falling back to direct launch");
                }
                Err(e) => return Err(e),
            }
        }

        let agent_id = self.launch_direct(workflow, step, task).await?;
        self.metrics.record_agent_deployed();
        Ok(Launched::Direct(agent_id))
    }

    async fn launch_direct(
        &self,
        workflow: &Workflow,
        step: &Step,
        task: &Task,
    ) -> Result<String, OrchestrationError> {
        let mut env = step.config.env.clone();
        env.insert(ENV_TASK_ID.to_string(), task.task_id.clone());
        env.insert(ENV_WORKFLOW_ID.to_string(), workflow.id.clone());
        env.insert(ENV_STEP_ID.to_string(), step.id.clone());
        if let Some(worker_id) = &task.worker_id {
            env.insert(ENV_WORKER_ID.to_string(), worker_id.clone());
        }
        if let Some(index) = task.map_index {
            env.insert(ENV_MAP_INDEX.to_string(), index.to_string());
        }
        env.insert(ENV_REDIS_HOST.to_string(), self.config.store_host.clone());
        env.insert(ENV_REDIS_PORT.to_string(), self.config.store_port.to_string());

        let limits = step.config.resource_limits.clone().unwrap_or_default();
        let spec = DeploySpec {
            name: format!("{}-{}", step.id, task.task_id),
            image: step.config.image.clone(),
            command: step.config.command.clone(),
            env,
            cpu_limit: limits.cpu_limit,
            memory_limit_mb: limits.memory_limit_mb,
            workflow_id: Some(workflow.id.clone()),
            step_id: Some(step.id.clone()),
            task_id: Some(task.task_id.clone()),
            ..Default::default()
        };
        let handle = self.runtime.deploy(spec).await?;
        self.runtime.start(&handle.id).await?;
        Ok(handle.id)
    }

    async fn cleanup_direct(&self, agent_id: &str, policy: CleanupPolicy, success: bool) {
        let teardown = match policy {
            CleanupPolicy::Always => true,
            // Failed agents stay around for debugging.
            CleanupPolicy::OnSuccess => success,
            CleanupPolicy::Never => false,
        };
        if !teardown {
            return;
        }
        if let Err(e) = self.runtime.stop(agent_id).await {
            debug!(agent_id, error = %e, "stop during cleanup failed");
        }
        if let Err(e) = self.runtime.remove(agent_id).await {
            debug!(agent_id, error = %e, "remove during cleanup failed");
        }
    }

    async fn await_completion(
        &self,
        task: &Task,
        agent_id: &str,
        timeout: Duration,
        mut subscription: Subscription,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Value, OrchestrationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = tokio::time::sleep_until(deadline);
        tokio::pin!(timed_out);
        let mut liveness = tokio::time::interval(self.config.agent_check_interval);
        liveness.tick().await;
        let mut subscription_open = true;
        let mut cancel_open = true;

        if *cancel.borrow() {
            return Err(OrchestrationError::Cancelled);
        }

        loop {
            tokio::select! {
                message = subscription.recv(), if subscription_open => match message.as_deref() {
                    Some("ok") => return self.read_result_with_retry(task).await,
                    Some("error") => {
                        let message = self
                            .store
                            .get(&task.error_key())
                            .await?
                            .unwrap_or_else(|| "agent reported an error".to_string());
                        return Err(OrchestrationError::TaskFailed { message });
                    }
                    Some(other) => {
                        warn!(task_id = %task.task_id, payload = other, "unexpected completion payload");
                    }
                    None => {
                        warn!(task_id = %task.task_id, "completion subscription closed, falling back to polling");
                        subscription_open = false;
                    }
                },
                _ = liveness.tick() => {
                    let terminal = match self.runtime.get(agent_id).await {
                        Ok(handle) => handle.status.is_terminal(),
                        Err(OrchestrationError::NotFound { .. }) => true,
                        Err(e) => {
                            warn!(agent_id, error = %e, "agent liveness check failed");
                            false
                        }
                    };
                    if terminal {
                        // The agent may have written its outcome without
                        // managing to publish.
                        if let Some(value) = self.try_read_result(task).await? {
                            return Ok(value);
                        }
                        if let Some(message) = self.store.get(&task.error_key()).await? {
                            return Err(OrchestrationError::TaskFailed { message });
                        }
                        return Err(OrchestrationError::AgentStoppedWithoutCompletion {
                            agent_id: agent_id.to_string(),
                        });
                    }
                }
                _ = &mut timed_out => {
                    return Err(OrchestrationError::TaskTimeout { seconds: timeout.as_secs() });
                }
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) => {
                        if *cancel.borrow() {
                            return Err(OrchestrationError::Cancelled);
                        }
                    }
                    // Sender gone: nobody can cancel any more.
                    Err(_) => cancel_open = false,
                }
            }
        }
    }

    async fn try_read_result(&self, task: &Task) -> Result<Option<Value>, OrchestrationError> {
        match self.store.get(&task.result_key()).await? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            )),
            None => Ok(None),
        }
    }

    /// The completion signal can land a beat before the result write is
    /// visible; re-read once after a short delay before declaring the
    /// result lost.
    async fn read_result_with_retry(&self, task: &Task) -> Result<Value, OrchestrationError> {
        if let Some(value) = self.try_read_result(task).await? {
            return Ok(value);
        }
        tokio::time::sleep(self.config.result_reread_delay).await;
        if let Some(value) = self.try_read_result(task).await? {
            return Ok(value);
        }
        Err(OrchestrationError::ResultLost {
            task_id: task.task_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{AgentScript, MockRuntime};
    use crate::model::{PoolSettings, StepConfig, StepStatus, Workflow};
    use crate::pool::PoolTimings;
    use coordination_store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        runtime: Arc<MockRuntime>,
        coordinator: TaskCoordinator,
        cancel: watch::Receiver<bool>,
        _cancel_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store.clone()));
        let metrics = Arc::new(MetricsCollector::new(store.clone()));
        let pools = PoolManager::new(
            runtime.clone(),
            Default::default(),
            PoolTimings {
                reap_interval: Duration::from_secs(3600),
                health_interval: Duration::from_secs(3600),
                acquire_grace: Duration::from_millis(20),
                stop_grace: Duration::from_millis(50),
                cleanup_interval: Duration::from_secs(3600),
            },
        );
        let config = OrchestratorConfig {
            agent_check_interval: Duration::from_millis(50),
            result_reread_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let coordinator = TaskCoordinator::new(
            store.clone(),
            runtime.clone(),
            pools,
            metrics,
            config,
        );
        let (cancel_tx, cancel) = watch::channel(false);
        Fixture {
            store,
            runtime,
            coordinator,
            cancel,
            _cancel_tx: cancel_tx,
        }
    }

    fn workflow_with_step(step_type: StepType) -> (Workflow, Step) {
        let mut workflow = Workflow::new("fixture", "");
        workflow
            .state
            .insert("seed".to_string(), json!("value"));
        let mut step = Step::new("work", "work", step_type);
        step.config = StepConfig {
            image: "worker:latest".to_string(),
            ..Default::default()
        };
        step.status = StepStatus::Pending;
        workflow.steps.push(step.clone());
        (workflow, step)
    }

    #[tokio::test]
    async fn dispatch_returns_agent_result() {
        let fx = fixture();
        let (workflow, step) = workflow_with_step(StepType::Sequential);
        fx.runtime
            .script_step("work", AgentScript::Complete(json!({"count": 3})));

        let result = fx
            .coordinator
            .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
            .await
            .unwrap();
        assert_eq!(result, json!({"count": 3}));

        // The agent id was recorded against the workflow.
        let jobs = fx
            .store
            .set_members(&format!("workflow:{}:jobs", workflow.id))
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn task_snapshot_carries_state_and_injections() {
        let fx = fixture();
        let (workflow, step) = workflow_with_step(StepType::Sequential);
        let ctx = WorkerContext {
            worker_id: Some("worker-1".to_string()),
            map_index: Some(4),
            extra_input: [("x".to_string(), json!(10))].into_iter().collect(),
            task_type: None,
        };
        let task = fx.coordinator.build_task(&workflow, &step, &ctx);
        assert_eq!(task.input["seed"], json!("value"));
        assert_eq!(task.input["x"], json!(10));
        assert_eq!(task.input["_map_index"], json!(4));
        assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
        assert_eq!(task.task_type, "sequential");
    }

    #[tokio::test]
    async fn failed_agent_surfaces_task_failed() {
        let fx = fixture();
        let (workflow, step) = workflow_with_step(StepType::Sequential);
        fx.runtime
            .script_step("work", AgentScript::Fail("disk full".to_string()));

        let err = fx
            .coordinator
            .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
            .await
            .unwrap_err();
        match err {
            OrchestrationError::TaskFailed { message } => assert_eq!(message, "disk full"),
            other => panic!("expected TaskFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn silent_exit_with_result_is_salvaged() {
        let fx = fixture();
        let (workflow, step) = workflow_with_step(StepType::Sequential);
        fx.runtime.script_step(
            "work",
            AgentScript::SilentExit {
                result: Some(json!({"salvaged": true})),
            },
        );

        let result = fx
            .coordinator
            .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
            .await
            .unwrap();
        assert_eq!(result, json!({"salvaged": true}));
    }

    #[tokio::test]
    async fn silent_exit_without_result_is_reported() {
        let fx = fixture();
        let (workflow, step) = workflow_with_step(StepType::Sequential);
        fx.runtime
            .script_step("work", AgentScript::SilentExit { result: None });

        let err = fx
            .coordinator
            .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::AgentStoppedWithoutCompletion { .. }
        ));
    }

    #[tokio::test]
    async fn hung_agent_times_out() {
        let fx = fixture();
        let (workflow, mut step) = workflow_with_step(StepType::Sequential);
        step.config.timeout_seconds = Some(1);
        fx.runtime.script_step("work", AgentScript::Hang);

        let started = std::time::Instant::now();
        let err = fx
            .coordinator
            .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::TaskTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pooled_dispatch_reuses_warm_agent() {
        let fx = fixture();
        let (workflow, mut step) = workflow_with_step(StepType::Sequential);
        step.config.execution_mode = ExecutionMode::Pooled;
        step.config.pool = Some(PoolSettings {
            min_size: 1,
            max_size: 2,
            idle_timeout_seconds: 300,
            max_agent_uses: 10,
            warm_up: true,
        });
        fx.runtime
            .script_step("work", AgentScript::Complete(json!({"pooled": true})));

        for _ in 0..3 {
            let result = fx
                .coordinator
                .dispatch(&workflow, &step, WorkerContext::default(), fx.cancel.clone())
                .await
                .unwrap();
            assert_eq!(result, json!({"pooled": true}));
        }
        // Only the warm-up deploy happened; the agent was reused after.
        assert_eq!(fx.runtime.deploy_count(), 1);
    }
}
