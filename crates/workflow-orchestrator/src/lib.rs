//! Container-native workflow orchestration.
//!
//! This crate executes user-defined directed workflows whose steps run as
//! ephemeral containers ("agents"), coordinated through a shared key/value +
//! pub-sub substrate. It provides:
//! - The workflow/step/task data model and its persistence
//! - A step dispatcher covering sequential, parallel, map, reduce, decision,
//!   branch and sub-workflow execution shapes
//! - Shared workflow state with atomic primitives safe under parallel workers
//! - A warm agent pool that hands running containers to tasks
//! - Retry, rollback and compensation handling on step failure
//! - Lifecycle metrics, per-workflow profiling and trigger scheduling
//!
//! The container runtime and the substrate are consumed as capabilities
//! ([`ContainerRuntime`], [`coordination_store::CoordinationStore`]); nothing
//! here shells out to a container daemon directly.

pub mod condition;
pub mod metrics;
pub mod mock;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod profiler;
pub mod recovery;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod subworkflow;
pub mod task;

pub use condition::{Condition, Operator};
pub use metrics::{MetricsCollector, MetricsSummary};
pub use mock::{AgentScript, MockRuntime};
pub use model::{
    BackoffKind, CleanupPolicy, CompensationAction, CompensationType, ExecutionMode,
    FailureStrategy, MapConfig, MapErrorHandling, MapStepState, PoolSettings, ResourceLimits,
    RetryPolicy, StateMap, Step, StepConfig, StepStatus, StepType, Task, Workflow, WorkflowConfig,
    WorkflowStatus,
};
pub use monitor::{AgentMonitor, AgentOutcome};
pub use orchestrator::Orchestrator;
pub use pool::{AgentPool, PoolManager, PoolStats, PooledAgent, PooledAgentState};
pub use profiler::{PerformanceProfiler, WorkflowProfile};
pub use recovery::ErrorHandler;
pub use runtime::{AgentHandle, AgentStatus, ContainerRuntime, DeploySpec};
pub use scheduler::{Scheduler, Trigger, TriggerType};
pub use state::StateManager;
pub use store::WorkflowStore;
pub use subworkflow::{SubWorkflowExecutor, WorkflowHierarchy};
pub use task::{TaskCoordinator, WorkerContext};

use coordination_store::StoreError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("not found: {resource}")]
    NotFound { resource: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("task failed: {message}")]
    TaskFailed { message: String },

    #[error("task timed out after {seconds}s")]
    TaskTimeout { seconds: u64 },

    #[error("completion published but result missing for task {task_id}")]
    ResultLost { task_id: String },

    #[error("agent {agent_id} stopped without publishing completion")]
    AgentStoppedWithoutCompletion { agent_id: String },

    #[error("agent pool at capacity for image {image}")]
    AtCapacity { image: String },

    #[error("dependency {step_id} failed: {reason}")]
    DependencyFailed { step_id: String, reason: String },

    #[error("no decision branch matched and no default declared")]
    NoBranchMatched,

    #[error("compensation failed: {message}")]
    CompensationFailed { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("container runtime error: {message}")]
    Runtime { message: String },

    #[error(transparent)]
    Substrate(#[from] StoreError),
}

impl OrchestrationError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }
}

/// Tunables of the orchestration core. Defaults match the documented
/// behavior: 5 min sequential / 10 min parallel task deadlines, 2 s
/// dependency polling bounded at 30 min, 2 s agent liveness checks during
/// completion waits and a 100 ms result re-read grace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(with = "serde_duration_secs")]
    pub default_step_timeout: Duration,
    #[serde(with = "serde_duration_secs")]
    pub parallel_step_timeout: Duration,
    #[serde(with = "serde_duration_ms")]
    pub dependency_poll_interval: Duration,
    #[serde(with = "serde_duration_secs")]
    pub dependency_wait_max: Duration,
    #[serde(with = "serde_duration_ms")]
    pub agent_check_interval: Duration,
    #[serde(with = "serde_duration_ms")]
    pub result_reread_delay: Duration,
    #[serde(with = "serde_duration_secs")]
    pub task_ttl_margin: Duration,
    #[serde(with = "serde_duration_ms")]
    pub pool_acquire_grace: Duration,
    #[serde(with = "serde_duration_secs")]
    pub rollback_wait: Duration,
    /// Coordination-store endpoint injected into agent environments.
    pub store_host: String,
    pub store_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(300),
            parallel_step_timeout: Duration::from_secs(600),
            dependency_poll_interval: Duration::from_secs(2),
            dependency_wait_max: Duration::from_secs(30 * 60),
            agent_check_interval: Duration::from_secs(2),
            result_reread_delay: Duration::from_millis(100),
            task_ttl_margin: Duration::from_secs(60),
            pool_acquire_grace: Duration::from_millis(100),
            rollback_wait: Duration::from_secs(30),
            store_host: "127.0.0.1".to_string(),
            store_port: 6379,
        }
    }
}

pub(crate) mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

pub(crate) mod serde_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
