//! Container runtime capability.
//!
//! The orchestrator never talks to a container daemon directly; it consumes
//! this trait. Implementations wrap whatever runs the containers (Docker,
//! a remote runtime API, or [`crate::mock::MockRuntime`] in tests).

use crate::OrchestrationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment variables injected into agent containers. Together with the
/// task keys they form the agent-side contract: read `task:<TASK_ID>`, write
/// `task:<TASK_ID>:result` or `:error`, publish `"ok"`/`"error"` on
/// `task:<TASK_ID>:complete`, exit.
pub const ENV_TASK_ID: &str = "TASK_ID";
pub const ENV_WORKFLOW_ID: &str = "WORKFLOW_ID";
pub const ENV_STEP_ID: &str = "STEP_ID";
pub const ENV_WORKER_ID: &str = "WORKER_ID";
pub const ENV_MAP_INDEX: &str = "MAP_INDEX";
pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";
/// Set on warm pool agents: the channel on which task ids arrive instead of
/// a per-launch `TASK_ID`.
pub const ENV_AGENT_TASKS_CHANNEL: &str = "AGENT_TASKS_CHANNEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopped,
    Failed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandle {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything a runtime needs to materialize an agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploySpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container for the spec without starting it.
    async fn deploy(&self, spec: DeploySpec) -> Result<AgentHandle, OrchestrationError>;

    async fn start(&self, agent_id: &str) -> Result<(), OrchestrationError>;

    async fn stop(&self, agent_id: &str) -> Result<(), OrchestrationError>;

    async fn remove(&self, agent_id: &str) -> Result<(), OrchestrationError>;

    async fn get(&self, agent_id: &str) -> Result<AgentHandle, OrchestrationError>;
}
