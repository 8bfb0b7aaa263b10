//! Scripted container runtime for tests.
//!
//! [`MockRuntime`] implements [`ContainerRuntime`] without a container
//! daemon: every started "container" is a tokio task that honors the agent
//! contract against the coordination store. It reads `task:<id>`, writes the
//! result or error key and publishes `"ok"`/`"error"` on the completion channel.
//! Behaviors are scripted per step id, so integration tests can simulate
//! failures, silent exits and hung agents as well as the happy path.

use crate::model::Task;
use crate::runtime::{
    AgentHandle, AgentStatus, ContainerRuntime, DeploySpec, ENV_AGENT_TASKS_CHANNEL, ENV_TASK_ID,
};
use crate::OrchestrationError;
use async_trait::async_trait;
use chrono::Utc;
use coordination_store::CoordinationStore;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// What an agent does with the task it picks up.
#[derive(Clone)]
pub enum AgentScript {
    /// Write this result and publish `"ok"`.
    Complete(Value),
    /// Write this message to the error key and publish `"error"`.
    Fail(String),
    /// Derive the outcome from the task (worker id, map index, input).
    Compute(Arc<dyn Fn(&Task) -> Result<Value, String> + Send + Sync>),
    /// Exit without publishing; optionally leave a salvageable result.
    SilentExit { result: Option<Value> },
    /// Never complete; the container stays running until stopped.
    Hang,
}

impl std::fmt::Debug for AgentScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(value) => write!(f, "Complete({})", value),
            Self::Fail(message) => write!(f, "Fail({})", message),
            Self::Compute(_) => write!(f, "Compute(..)"),
            Self::SilentExit { result } => write!(f, "SilentExit({:?})", result),
            Self::Hang => write!(f, "Hang"),
        }
    }
}

pub struct MockRuntime {
    store: Arc<dyn CoordinationStore>,
    scripts: Arc<DashMap<String, AgentScript>>,
    containers: Arc<DashMap<String, AgentHandle>>,
    specs: Arc<DashMap<String, DeploySpec>>,
    deploy_count: AtomicUsize,
    work_delay: Duration,
}

impl MockRuntime {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            scripts: Arc::new(DashMap::new()),
            containers: Arc::new(DashMap::new()),
            specs: Arc::new(DashMap::new()),
            deploy_count: AtomicUsize::new(0),
            work_delay: Duration::from_millis(10),
        }
    }

    pub fn with_work_delay(mut self, delay: Duration) -> Self {
        self.work_delay = delay;
        self
    }

    /// Script the behavior of agents launched for the given step id.
    /// Unscripted steps complete with an empty object.
    pub fn script_step(&self, step_id: &str, script: AgentScript) {
        self.scripts.insert(step_id.to_string(), script);
    }

    pub fn deploy_count(&self) -> usize {
        self.deploy_count.load(Ordering::SeqCst)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.containers.iter().map(|entry| entry.key().clone()).collect()
    }

    fn set_status(&self, agent_id: &str, status: AgentStatus) {
        if let Some(mut handle) = self.containers.get_mut(agent_id) {
            handle.status = status;
        }
    }

    /// Execute one task the way a real agent would. Returns `true` when the
    /// container should stop afterwards.
    async fn execute_task(
        store: &Arc<dyn CoordinationStore>,
        scripts: &DashMap<String, AgentScript>,
        task_id: &str,
    ) -> bool {
        let task_key = format!("task:{}", task_id);
        let result_key = format!("task:{}:result", task_id);
        let error_key = format!("task:{}:error", task_id);
        let channel = format!("task:{}:complete", task_id);

        let task: Option<Task> = match store.get(&task_key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        };
        let task = match task {
            Some(task) => task,
            None => {
                warn!(task_id, "mock agent found no task record");
                let _ = store.set(&error_key, "task record missing", None).await;
                let _ = store.publish(&channel, "error").await;
                return true;
            }
        };

        let script = scripts
            .get(&task.step_id)
            .map(|entry| entry.value().clone())
            .unwrap_or(AgentScript::Complete(json!({})));

        match script {
            AgentScript::Complete(value) => {
                let _ = store.set(&result_key, &value.to_string(), None).await;
                let _ = store.publish(&channel, "ok").await;
                true
            }
            AgentScript::Fail(message) => {
                let _ = store.set(&error_key, &message, None).await;
                let _ = store.publish(&channel, "error").await;
                true
            }
            AgentScript::Compute(f) => match f(&task) {
                Ok(value) => {
                    let _ = store.set(&result_key, &value.to_string(), None).await;
                    let _ = store.publish(&channel, "ok").await;
                    true
                }
                Err(message) => {
                    let _ = store.set(&error_key, &message, None).await;
                    let _ = store.publish(&channel, "error").await;
                    true
                }
            },
            AgentScript::SilentExit { result } => {
                if let Some(value) = result {
                    let _ = store.set(&result_key, &value.to_string(), None).await;
                }
                true
            }
            AgentScript::Hang => false,
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn deploy(&self, spec: DeploySpec) -> Result<AgentHandle, OrchestrationError> {
        let handle = AgentHandle {
            id: format!("agent-{}", Uuid::new_v4()),
            name: spec.name.clone(),
            image: spec.image.clone(),
            status: AgentStatus::Created,
            created_at: Utc::now(),
        };
        self.deploy_count.fetch_add(1, Ordering::SeqCst);
        self.containers.insert(handle.id.clone(), handle.clone());
        self.specs.insert(handle.id.clone(), spec);
        debug!(agent_id = %handle.id, image = %handle.image, "mock agent deployed");
        Ok(handle)
    }

    async fn start(&self, agent_id: &str) -> Result<(), OrchestrationError> {
        let spec = self
            .specs
            .get(agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("agent {}", agent_id),
            })?;
        self.set_status(agent_id, AgentStatus::Running);

        let store = self.store.clone();
        let scripts = self.scripts.clone();
        let containers = self.containers.clone();
        let work_delay = self.work_delay;
        let agent_id = agent_id.to_string();

        if let Some(channel) = spec.env.get(ENV_AGENT_TASKS_CHANNEL).cloned() {
            // Warm pool agent: subscribe for task ids and serve until stopped.
            let mut subscription = store.subscribe(&channel).await.map_err(|e| {
                OrchestrationError::runtime(format!("mock pool agent subscribe failed: {}", e))
            })?;
            tokio::spawn(async move {
                while let Some(task_id) = subscription.recv().await {
                    let still_running = containers
                        .get(&agent_id)
                        .map(|h| h.status == AgentStatus::Running)
                        .unwrap_or(false);
                    if !still_running {
                        break;
                    }
                    tokio::time::sleep(work_delay).await;
                    Self::execute_task(&store, &scripts, &task_id).await;
                }
            });
        } else if let Some(task_id) = spec.env.get(ENV_TASK_ID).cloned() {
            // One-shot agent: run the task, then exit.
            tokio::spawn(async move {
                tokio::time::sleep(work_delay).await;
                let stop = Self::execute_task(&store, &scripts, &task_id).await;
                if stop {
                    if let Some(mut handle) = containers.get_mut(&agent_id) {
                        if handle.status == AgentStatus::Running {
                            handle.status = AgentStatus::Stopped;
                        }
                    }
                }
            });
        } else {
            // No task wiring at all (rollback and other fire-and-forget
            // agents): run the command, exit.
            tokio::spawn(async move {
                tokio::time::sleep(work_delay).await;
                if let Some(mut handle) = containers.get_mut(&agent_id) {
                    if handle.status == AgentStatus::Running {
                        handle.status = AgentStatus::Stopped;
                    }
                }
            });
        }
        Ok(())
    }

    async fn stop(&self, agent_id: &str) -> Result<(), OrchestrationError> {
        if self.containers.get(agent_id).is_none() {
            return Err(OrchestrationError::NotFound {
                resource: format!("agent {}", agent_id),
            });
        }
        self.set_status(agent_id, AgentStatus::Stopped);
        Ok(())
    }

    async fn remove(&self, agent_id: &str) -> Result<(), OrchestrationError> {
        self.containers.remove(agent_id);
        self.specs.remove(agent_id);
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<AgentHandle, OrchestrationError> {
        self.containers
            .get(agent_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("agent {}", agent_id),
            })
    }
}
