//! Failure handling: retries, rollback and compensation.
//!
//! The dispatcher funnels every step failure through here. Retries are a
//! state-machine transition: the handler computes the backoff and resets
//! the step to `pending`; the dispatcher loop picks it back up (no
//! recursive re-entry). When retries are exhausted the workflow's failure
//! strategy decides between failing fast (with a rollback sweep over
//! completed steps), carrying on, or executing the step's compensation
//! actions.

use crate::metrics::MetricsCollector;
use crate::model::{
    CompensationAction, CompensationSpec, CompensationType, Step, StepStatus, Workflow,
};
use crate::monitor::AgentMonitor;
use crate::runtime::{ContainerRuntime, DeploySpec, ENV_STEP_ID, ENV_WORKFLOW_ID};
use crate::state::StateManager;
use crate::store::WorkflowStore;
use crate::OrchestrationError;
use chrono::Utc;
use coordination_store::CoordinationStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Used when a completed step declares no rollback image of its own; the
/// agent is a no-op that simply exits.
pub const DEFAULT_ROLLBACK_IMAGE: &str = "busybox:stable";

/// What a compensation pass asked the dispatcher to do next.
#[derive(Debug, Default)]
pub struct CompensationOutcome {
    pub executed: usize,
    pub failed: usize,
    /// A `retry` action wants the step dispatched one more time.
    pub retry_requested: bool,
    /// An `alternate` action names a replacement workflow to run.
    pub alternate_workflow: Option<String>,
}

pub struct ErrorHandler {
    workflows: WorkflowStore,
    state: StateManager,
    store: Arc<dyn CoordinationStore>,
    runtime: Arc<dyn ContainerRuntime>,
    monitor: AgentMonitor,
    metrics: Arc<MetricsCollector>,
    rollback_wait: Duration,
}

impl ErrorHandler {
    pub fn new(
        workflows: WorkflowStore,
        state: StateManager,
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        monitor: AgentMonitor,
        metrics: Arc<MetricsCollector>,
        rollback_wait: Duration,
    ) -> Self {
        Self {
            workflows,
            state,
            store,
            runtime,
            monitor,
            metrics,
            rollback_wait,
        }
    }

    fn audit_key(workflow_id: &str) -> String {
        format!("workflow:{}:compensation", workflow_id)
    }

    /// Stamp the failure onto the step and persist. Keeps the terminal-step
    /// invariant: a failed step always has both timestamps.
    pub async fn record_failure(
        &self,
        workflow: &mut Workflow,
        step_index: usize,
        err: &OrchestrationError,
    ) -> Result<(), OrchestrationError> {
        let step_id = {
            let step = &mut workflow.steps[step_index];
            let now = Utc::now();
            step.status = StepStatus::Failed;
            step.error = Some(err.to_string());
            step.started_at.get_or_insert(now);
            step.completed_at = Some(now);
            step.id.clone()
        };
        error!(workflow_id = %workflow.id, step_id = %step_id, error = %err, "step failed");
        self.metrics
            .record_step_fail(&workflow.id, &step_id, &err.to_string())
            .await;
        self.workflows.save(workflow).await
    }

    /// Backoff before the next retry, or `None` when the policy is
    /// exhausted (or absent).
    pub fn retry_delay(&self, step: &Step) -> Option<Duration> {
        let policy = step.config.retry_policy.as_ref()?;
        if policy.max_attempts == 0 {
            return None;
        }
        let used = step.retry_count();
        if used >= policy.max_attempts {
            return None;
        }
        Some(policy.backoff_delay(used + 1))
    }

    /// Bump the retry counter and reset the step to `pending` so the
    /// dispatcher loop re-dispatches it.
    pub async fn prepare_retry(
        &self,
        workflow: &mut Workflow,
        step_index: usize,
    ) -> Result<(), OrchestrationError> {
        let (step_id, attempt) = {
            let step = &mut workflow.steps[step_index];
            let attempt = step.retry_count() + 1;
            step.set_retry_count(attempt);
            step.reset_for_retry();
            (step.id.clone(), attempt)
        };
        info!(workflow_id = %workflow.id, step_id = %step_id, attempt, "retrying step");
        self.workflows.save(workflow).await
    }

    /// Execute the step's compensation actions (default: a single notify).
    pub async fn compensate(
        &self,
        workflow: &mut Workflow,
        step_index: usize,
    ) -> Result<CompensationOutcome, OrchestrationError> {
        let (step_id, specs) = {
            let step = &workflow.steps[step_index];
            let specs = step.config.compensation.clone().unwrap_or_else(|| {
                vec![CompensationSpec {
                    action_type: CompensationType::Notify,
                    config: json!({
                        "step_id": step.id,
                        "error": step.error,
                    }),
                }]
            });
            (step.id.clone(), specs)
        };

        let mut outcome = CompensationOutcome::default();
        for spec in specs {
            let mut action = CompensationAction::new(&step_id, spec.action_type, spec.config);
            let result = self
                .execute_action(workflow, &mut action, &mut outcome)
                .await;
            action.executed_at = Some(Utc::now());
            match result {
                Ok(()) => action.status = "completed".to_string(),
                Err(e) => {
                    action.status = "failed".to_string();
                    action.error = Some(e.to_string());
                    outcome.failed += 1;
                    warn!(workflow_id = %workflow.id, step_id = %step_id, error = %e, "compensation action failed");
                    self.metrics
                        .record_error(&workflow.id, &format!("compensation: {}", e))
                        .await;
                }
            }
            outcome.executed += 1;
            self.record_action(&workflow.id, &action).await;
        }
        Ok(outcome)
    }

    async fn execute_action(
        &self,
        workflow: &Workflow,
        action: &mut CompensationAction,
        outcome: &mut CompensationOutcome,
    ) -> Result<(), OrchestrationError> {
        match action.action_type {
            CompensationType::Rollback => {
                let image = action.config["image"]
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| {
                        workflow
                            .step(&action.step_id)
                            .and_then(|s| s.config.rollback_image.clone())
                    })
                    .unwrap_or_else(|| DEFAULT_ROLLBACK_IMAGE.to_string());
                self.run_rollback_agent(&workflow.id, &action.step_id, &image)
                    .await
            }
            CompensationType::Retry => {
                outcome.retry_requested = true;
                Ok(())
            }
            CompensationType::Alternate => {
                match action.config["workflow"].as_str() {
                    Some(workflow_ref) => {
                        outcome.alternate_workflow = Some(workflow_ref.to_string());
                        Ok(())
                    }
                    None => Err(OrchestrationError::CompensationFailed {
                        message: "alternate action names no workflow".to_string(),
                    }),
                }
            }
            CompensationType::Notify => {
                self.state
                    .set(
                        &workflow.id,
                        &format!("compensation_notification_{}", action.id),
                        &action.config,
                    )
                    .await
            }
            CompensationType::Custom => {
                // Named handlers are an extension point; log and move on.
                info!(workflow_id = %workflow.id, config = %action.config, "custom compensation handler invoked");
                Ok(())
            }
        }
    }

    /// Roll back every completed step in reverse order. Failures inside the
    /// sweep are recorded but never stop the remaining rollbacks.
    pub async fn rollback_completed(
        &self,
        workflow: &mut Workflow,
    ) -> Result<usize, OrchestrationError> {
        let targets: Vec<(String, String)> = workflow
            .steps
            .iter()
            .rev()
            .filter(|step| step.status == StepStatus::Completed)
            .map(|step| {
                (
                    step.id.clone(),
                    step.config
                        .rollback_image
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ROLLBACK_IMAGE.to_string()),
                )
            })
            .collect();

        let mut rolled_back = 0;
        for (step_id, image) in targets {
            let mut action = CompensationAction::new(
                &step_id,
                CompensationType::Rollback,
                json!({ "image": image }),
            );
            action.executed_at = Some(Utc::now());
            match self.run_rollback_agent(&workflow.id, &step_id, &image).await {
                Ok(()) => {
                    action.status = "completed".to_string();
                    rolled_back += 1;
                }
                Err(e) => {
                    action.status = "failed".to_string();
                    action.error = Some(e.to_string());
                    warn!(workflow_id = %workflow.id, step_id = %step_id, error = %e, "rollback agent failed, continuing sweep");
                }
            }
            self.record_action(&workflow.id, &action).await;
        }
        info!(workflow_id = %workflow.id, rolled_back, "rollback sweep finished");
        Ok(rolled_back)
    }

    async fn run_rollback_agent(
        &self,
        workflow_id: &str,
        step_id: &str,
        image: &str,
    ) -> Result<(), OrchestrationError> {
        let mut env = std::collections::HashMap::new();
        env.insert(ENV_WORKFLOW_ID.to_string(), workflow_id.to_string());
        env.insert(ENV_STEP_ID.to_string(), step_id.to_string());
        env.insert("ROLLBACK".to_string(), "1".to_string());

        let spec = DeploySpec {
            name: format!("rollback-{}-{}", step_id, Utc::now().timestamp_millis()),
            image: image.to_string(),
            env,
            workflow_id: Some(workflow_id.to_string()),
            step_id: Some(step_id.to_string()),
            ..Default::default()
        };
        let handle = self.runtime.deploy(spec).await?;
        self.runtime.start(&handle.id).await?;

        let wait = self
            .monitor
            .wait_for_completion(&handle.id, self.rollback_wait)
            .await;
        let _ = self.runtime.remove(&handle.id).await;
        match wait {
            Ok(outcome) if outcome.error.is_none() => Ok(()),
            Ok(outcome) => Err(OrchestrationError::CompensationFailed {
                message: outcome
                    .error
                    .unwrap_or_else(|| "rollback agent failed".to_string()),
            }),
            Err(e) => Err(OrchestrationError::CompensationFailed {
                message: e.to_string(),
            }),
        }
    }

    /// Append to the per-workflow audit trail.
    async fn record_action(&self, workflow_id: &str, action: &CompensationAction) {
        match serde_json::to_string(action) {
            Ok(document) => {
                if let Err(e) = self
                    .store
                    .list_push(&Self::audit_key(workflow_id), &document)
                    .await
                {
                    warn!(workflow_id, error = %e, "failed to record compensation action");
                }
            }
            Err(e) => warn!(workflow_id, error = %e, "unserializable compensation action"),
        }
    }

    /// The audit trail, oldest first.
    pub async fn compensation_history(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CompensationAction>, OrchestrationError> {
        let raw = self
            .store
            .list_range(&Self::audit_key(workflow_id), 0, -1)
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|entry| serde_json::from_str(&entry).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::model::{BackoffKind, RetryPolicy, Step, StepType};
    use coordination_store::MemoryStore;

    fn handler() -> (Arc<MemoryStore>, Arc<MockRuntime>, ErrorHandler) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store.clone()));
        let monitor = AgentMonitor::new(runtime.clone())
            .with_poll_interval(Duration::from_millis(10));
        let handler = ErrorHandler::new(
            WorkflowStore::new(store.clone()),
            StateManager::new(store.clone()),
            store.clone(),
            runtime.clone(),
            monitor,
            Arc::new(MetricsCollector::new(store.clone())),
            Duration::from_millis(500),
        );
        (store, runtime, handler)
    }

    fn step_with_policy(max_attempts: u32, retries_used: u32) -> Step {
        let mut step = Step::new("s", "s", StepType::Sequential);
        step.config.retry_policy = Some(RetryPolicy {
            max_attempts,
            backoff: BackoffKind::Exponential,
            delay_ms: 100,
        });
        step.set_retry_count(retries_used);
        step
    }

    #[test]
    fn retry_delay_follows_backoff_and_cap() {
        let (_, _, handler) = handler();
        assert_eq!(
            handler.retry_delay(&step_with_policy(3, 0)),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            handler.retry_delay(&step_with_policy(3, 1)),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            handler.retry_delay(&step_with_policy(3, 2)),
            Some(Duration::from_millis(400))
        );
        assert_eq!(handler.retry_delay(&step_with_policy(3, 3)), None);
        assert_eq!(handler.retry_delay(&step_with_policy(0, 0)), None);
        let no_policy = Step::new("p", "p", StepType::Sequential);
        assert_eq!(handler.retry_delay(&no_policy), None);
    }

    #[tokio::test]
    async fn record_failure_stamps_terminal_fields() {
        let (_, _, handler) = handler();
        let mut workflow = Workflow::new("wf", "");
        workflow.steps.push(Step::new("s", "s", StepType::Sequential));
        handler
            .record_failure(
                &mut workflow,
                0,
                &OrchestrationError::TaskFailed {
                    message: "boom".to_string(),
                },
            )
            .await
            .unwrap();

        let step = &workflow.steps[0];
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap().contains("boom"));
        assert!(step.started_at.is_some() && step.completed_at.is_some());
    }

    #[tokio::test]
    async fn default_compensation_is_a_notify() {
        let (_, _, handler) = handler();
        let mut workflow = Workflow::new("wf", "");
        let mut step = Step::new("s", "s", StepType::Sequential);
        step.error = Some("boom".to_string());
        workflow.steps.push(step);

        let outcome = handler.compensate(&mut workflow, 0).await.unwrap();
        assert_eq!(outcome.executed, 1);
        assert_eq!(outcome.failed, 0);

        let history = handler.compensation_history(&workflow.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action_type, CompensationType::Notify);
        assert_eq!(history[0].status, "completed");

        // The notification payload landed in shared state.
        let state = StateManager::new(handler.store.clone());
        let all = state.get_all(&workflow.id).await.unwrap();
        assert!(all
            .keys()
            .any(|k| k.starts_with("compensation_notification_")));
    }

    #[tokio::test]
    async fn retry_and_alternate_actions_flow_into_outcome() {
        let (_, _, handler) = handler();
        let mut workflow = Workflow::new("wf", "");
        let mut step = Step::new("s", "s", StepType::Sequential);
        step.config.compensation = Some(vec![
            CompensationSpec {
                action_type: CompensationType::Retry,
                config: json!({}),
            },
            CompensationSpec {
                action_type: CompensationType::Alternate,
                config: json!({"workflow": "fallback-template"}),
            },
        ]);
        workflow.steps.push(step);

        let outcome = handler.compensate(&mut workflow, 0).await.unwrap();
        assert!(outcome.retry_requested);
        assert_eq!(outcome.alternate_workflow.as_deref(), Some("fallback-template"));
    }

    #[tokio::test]
    async fn rollback_sweeps_completed_steps_in_reverse() {
        let (_, runtime, handler) = handler();
        let mut workflow = Workflow::new("wf", "");
        for id in ["a", "b", "c"] {
            let mut step = Step::new(id, id, StepType::Sequential);
            step.status = StepStatus::Completed;
            workflow.steps.push(step);
        }
        // The failing step never completed; it is not rolled back.
        let mut failed = Step::new("d", "d", StepType::Sequential);
        failed.status = StepStatus::Failed;
        workflow.steps.push(failed);

        let rolled_back = handler.rollback_completed(&mut workflow).await.unwrap();
        assert_eq!(rolled_back, 3);
        assert_eq!(runtime.deploy_count(), 3);

        let history = handler.compensation_history(&workflow.id).await.unwrap();
        let order: Vec<&str> = history.iter().map(|a| a.step_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert!(history.iter().all(|a| a.status == "completed"));
    }
}
