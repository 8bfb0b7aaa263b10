//! Workflow, step and task data model.
//!
//! Documents serialize with serde to the JSON shapes agents and operator
//! tooling read from the coordination store, so field names and enum
//! spellings here are part of the wire contract.

use crate::condition::Condition;
use crate::OrchestrationError;
use chrono::{DateTime, Utc};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Shared workflow state: user keys to arbitrary JSON values.
pub type StateMap = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Sequential,
    Parallel,
    Map,
    Reduce,
    Decision,
    Branch,
    Subworkflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    FailFast,
    Continue,
    Compensate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    Always,
    OnSuccess,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Standard,
    Pooled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff before the given 1-based retry attempt.
    pub fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let attempt = attempt.max(1);
        let millis = match self.backoff {
            BackoffKind::Constant => self.delay_ms,
            BackoffKind::Linear => self.delay_ms.saturating_mul(attempt as u64),
            BackoffKind::Exponential => {
                self.delay_ms.saturating_mul(1u64 << (attempt - 1).min(32))
            }
        };
        std::time::Duration::from_millis(millis)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            backoff: BackoffKind::Exponential,
            delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default = "default_failure_strategy")]
    pub failure_strategy: FailureStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub enable_profiling: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_cleanup_policy")]
    pub cleanup_policy: CleanupPolicy,
}

fn default_max_parallel() -> usize {
    5
}

fn default_failure_strategy() -> FailureStrategy {
    FailureStrategy::FailFast
}

fn default_cleanup_policy() -> CleanupPolicy {
    CleanupPolicy::Always
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            timeout_seconds: None,
            retry_policy: None,
            failure_strategy: default_failure_strategy(),
            resource_limits: None,
            enable_profiling: false,
            schedule: None,
            cleanup_policy: default_cleanup_policy(),
        }
    }
}

/// Warm-pool sizing for steps running in `pooled` execution mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout_seconds: u64,
    pub max_agent_uses: u32,
    #[serde(default)]
    pub warm_up: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 5,
            idle_timeout_seconds: 300,
            max_agent_uses: 50,
            warm_up: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapErrorHandling {
    FailFast,
    ContinueOnError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// State key holding the input array; a leading `$.` is accepted.
    pub input_path: String,
    /// Key under which each worker sees its item in the task input.
    pub item_alias: String,
    #[serde(default = "default_map_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_map_error_handling")]
    pub error_handling: MapErrorHandling,
}

fn default_map_concurrency() -> usize {
    5
}

fn default_map_error_handling() -> MapErrorHandling {
    MapErrorHandling::ContinueOnError
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub condition: Condition,
    #[serde(default)]
    pub true_steps: Vec<String>,
    #[serde(default)]
    pub false_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_workflow: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionBranch {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionNode {
    pub branches: Vec<DecisionBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationSpec {
    pub action_type: CompensationType,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<BranchConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Vec<CompensationSpec>>,
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Standard
}

pub const RETRY_COUNT_KEY: &str = "retry_count";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub status: StepStatus,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type,
            status: StepStatus::Pending,
            config: StepConfig::default(),
            depends_on: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
            results: None,
            metadata: HashMap::new(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(RETRY_COUNT_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.metadata.insert(RETRY_COUNT_KEY.to_string(), count.to_string());
    }

    /// Reset to `pending` so the dispatcher loop picks the step back up.
    /// The retry counter survives in metadata.
    pub fn reset_for_retry(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.results = None;
    }
}

pub const META_IS_TEMPLATE: &str = "is_template";
pub const META_IS_SUBWORKFLOW: &str = "is_subworkflow";
pub const META_PARENT_WORKFLOW: &str = "parent_workflow_id";
pub const META_PARENT_STEP: &str = "parent_step_id";
pub const META_AGGREGATE_STATUS: &str = "aggregate_status";
pub const META_TRIGGERED_BY: &str = "triggered_by";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub state: StateMap,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: format!("wf-{}", Uuid::new_v4()),
            name: name.into(),
            description: description.into(),
            status: WorkflowStatus::Pending,
            config: WorkflowConfig::default(),
            steps: Vec::new(),
            state: StateMap::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn is_template(&self) -> bool {
        self.metadata.get(META_IS_TEMPLATE).map(|v| v == "true").unwrap_or(false)
    }

    /// Clone this workflow into a fresh run: new id, all runtime state
    /// cleared, steps back to `pending`. Template/trigger metadata stays so
    /// lineage is traceable.
    pub fn clone_for_run(&self) -> Workflow {
        let now = Utc::now();
        let mut run = self.clone();
        run.id = format!("wf-{}", Uuid::new_v4());
        run.status = WorkflowStatus::Pending;
        run.created_at = now;
        run.updated_at = now;
        run.started_at = None;
        run.completed_at = None;
        run.metadata.remove(META_IS_TEMPLATE);
        run.metadata.remove(META_AGGREGATE_STATUS);
        for step in &mut run.steps {
            step.status = StepStatus::Pending;
            step.started_at = None;
            step.completed_at = None;
            step.error = None;
            step.results = None;
            step.metadata.remove(RETRY_COUNT_KEY);
        }
        run
    }

    /// Structural validation: unique step ids, dependency references that
    /// resolve, an acyclic dependency graph, and per-type configuration
    /// invariants.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(OrchestrationError::Validation {
                    message: format!("duplicate step id: {}", step.id),
                });
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(OrchestrationError::Validation {
                        message: format!("step {} depends on unknown step {}", step.id, dep),
                    });
                }
                if dep == &step.id {
                    return Err(OrchestrationError::Validation {
                        message: format!("step {} depends on itself", step.id),
                    });
                }
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for step in &self.steps {
            indices.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }
        for step in &self.steps {
            for dep in &step.depends_on {
                graph.add_edge(indices[dep.as_str()], indices[step.id.as_str()], ());
            }
        }
        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(OrchestrationError::Validation {
                message: "dependency graph contains a cycle".to_string(),
            });
        }

        for step in &self.steps {
            self.validate_step(step)?;
        }
        Ok(())
    }

    fn validate_step(&self, step: &Step) -> Result<(), OrchestrationError> {
        let invalid = |message: String| Err(OrchestrationError::Validation { message });
        match step.step_type {
            StepType::Parallel => {
                if step.config.max_workers == Some(0) {
                    return invalid(format!("parallel step {} has max_workers = 0", step.id));
                }
            }
            StepType::Map => match &step.config.map {
                None => return invalid(format!("map step {} is missing map config", step.id)),
                Some(map) => {
                    if map.input_path.is_empty() {
                        return invalid(format!("map step {} has an empty input_path", step.id));
                    }
                    if map.item_alias.is_empty() {
                        return invalid(format!("map step {} has an empty item_alias", step.id));
                    }
                }
            },
            StepType::Reduce => {
                if step.depends_on.is_empty() {
                    return invalid(format!("reduce step {} has no dependencies", step.id));
                }
            }
            StepType::Decision => {
                if step.config.decision.is_none() {
                    return invalid(format!("decision step {} is missing decision config", step.id));
                }
            }
            StepType::Branch => {
                if step.config.branches.is_none() {
                    return invalid(format!("branch step {} is missing branch config", step.id));
                }
            }
            StepType::Subworkflow => {
                if step.config.sub_workflow.is_none() {
                    return invalid(format!(
                        "subworkflow step {} is missing a workflow reference",
                        step.id
                    ));
                }
            }
            StepType::Sequential => {}
        }
        if step.config.execution_mode == ExecutionMode::Pooled && step.config.pool.is_none() {
            return invalid(format!("pooled step {} is missing pool settings", step.id));
        }
        Ok(())
    }
}

/// Per-launch unit of work handed to an agent container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub workflow_id: String,
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_index: Option<usize>,
    #[serde(default)]
    pub input: StateMap,
    pub created_at: DateTime<Utc>,
    pub task_type: String,
}

impl Task {
    pub fn key(&self) -> String {
        format!("task:{}", self.task_id)
    }

    pub fn result_key(&self) -> String {
        format!("task:{}:result", self.task_id)
    }

    pub fn error_key(&self) -> String {
        format!("task:{}:error", self.task_id)
    }

    pub fn completion_channel(&self) -> String {
        format!("task:{}:complete", self.task_id)
    }
}

/// Progress ledger of a map step, persisted through the state manager so
/// operators can watch fan-out progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapStepState {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<serde_json::Value>,
}

impl MapStepState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            failed: 0,
            results: vec![serde_json::Value::Null; total],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationType {
    Rollback,
    Retry,
    Alternate,
    Notify,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationAction {
    pub id: String,
    pub step_id: String,
    pub action_type: CompensationType,
    #[serde(default)]
    pub config: serde_json::Value,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompensationAction {
    pub fn new(step_id: &str, action_type: CompensationType, config: serde_json::Value) -> Self {
        Self {
            id: format!("comp-{}", Uuid::new_v4()),
            step_id: step_id.to_string(),
            action_type,
            config,
            status: "pending".to_string(),
            executed_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_step_workflow() -> Workflow {
        let mut workflow = Workflow::new("test", "two sequential steps");
        let first = Step::new("one", "first", StepType::Sequential);
        let mut second = Step::new("two", "second", StepType::Sequential);
        second.depends_on = vec!["one".to_string()];
        workflow.steps = vec![first, second];
        workflow
    }

    #[test]
    fn valid_workflow_passes_validation() {
        assert!(two_step_workflow().validate().is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut workflow = two_step_workflow();
        workflow.steps[0].depends_on = vec!["two".to_string()];
        let err = workflow.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut workflow = two_step_workflow();
        workflow.steps[1].depends_on = vec!["ghost".to_string()];
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn map_step_requires_config() {
        let mut workflow = two_step_workflow();
        workflow.steps[1].step_type = StepType::Map;
        assert!(workflow.validate().is_err());

        workflow.steps[1].config.map = Some(MapConfig {
            input_path: "items".to_string(),
            item_alias: "item".to_string(),
            max_concurrency: 2,
            error_handling: MapErrorHandling::ContinueOnError,
        });
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn pooled_step_requires_pool_settings() {
        let mut workflow = two_step_workflow();
        workflow.steps[0].config.execution_mode = ExecutionMode::Pooled;
        assert!(workflow.validate().is_err());
        workflow.steps[0].config.pool = Some(PoolSettings::default());
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn step_type_wire_spelling() {
        let step = Step::new("s", "s", StepType::Subworkflow);
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "subworkflow");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn workflow_roundtrips_through_json() {
        let workflow = two_step_workflow();
        let json = serde_json::to_string(&workflow).unwrap();
        let back: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, workflow.id);
        assert_eq!(back.steps.len(), 2);
        assert_eq!(back.steps[1].depends_on, vec!["one".to_string()]);
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            delay_ms: 100,
        };
        assert_eq!(policy.backoff_delay(1).as_millis(), 100);
        assert_eq!(policy.backoff_delay(2).as_millis(), 200);
        assert_eq!(policy.backoff_delay(3).as_millis(), 400);
    }

    #[test]
    fn clone_for_run_resets_runtime_fields() {
        let mut workflow = two_step_workflow();
        workflow.status = WorkflowStatus::Completed;
        workflow.steps[0].status = StepStatus::Completed;
        workflow.steps[0].set_retry_count(2);
        let run = workflow.clone_for_run();
        assert_ne!(run.id, workflow.id);
        assert_eq!(run.status, WorkflowStatus::Pending);
        assert_eq!(run.steps[0].status, StepStatus::Pending);
        assert_eq!(run.steps[0].retry_count(), 0);
    }
}
