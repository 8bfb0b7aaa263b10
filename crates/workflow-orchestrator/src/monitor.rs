//! Agent liveness monitoring.
//!
//! Polls the runtime for terminal agent states. Used by compensation (wait
//! for rollback agents) and by anything that launches a container outside
//! the task coordinator's pub-sub path.

use crate::runtime::{AgentStatus, ContainerRuntime};
use crate::OrchestrationError;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub status: AgentStatus,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct AgentMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

impl AgentMonitor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Poll until the agent reaches a terminal status or the timeout
    /// elapses. `failed` and `paused` both surface as errors; a vanished
    /// agent counts as stopped.
    pub async fn wait_for_completion(
        &self,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<AgentOutcome, OrchestrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.runtime.get(agent_id).await {
                Ok(handle) => match handle.status {
                    AgentStatus::Stopped => {
                        debug!(agent_id, "agent stopped");
                        return Ok(AgentOutcome {
                            agent_id: agent_id.to_string(),
                            status: AgentStatus::Stopped,
                            error: None,
                        });
                    }
                    AgentStatus::Failed => {
                        return Ok(AgentOutcome {
                            agent_id: agent_id.to_string(),
                            status: AgentStatus::Failed,
                            error: Some("agent reported failed status".to_string()),
                        });
                    }
                    AgentStatus::Paused => {
                        return Err(OrchestrationError::runtime(format!(
                            "agent {} is paused and will not complete",
                            agent_id
                        )));
                    }
                    _ => {}
                },
                Err(OrchestrationError::NotFound { .. }) => {
                    return Ok(AgentOutcome {
                        agent_id: agent_id.to_string(),
                        status: AgentStatus::Stopped,
                        error: None,
                    });
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(OrchestrationError::TaskTimeout {
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Fan out per-agent waits. All outcomes gathered so far are returned
    /// even when some agents failed or timed out; the aggregate error (if
    /// any) describes the first problem observed.
    pub async fn wait_for_multiple(
        &self,
        agent_ids: &[String],
        timeout: Duration,
    ) -> (Vec<AgentOutcome>, Option<OrchestrationError>) {
        let waits = agent_ids.iter().map(|id| {
            let monitor = self.clone();
            let id = id.clone();
            async move { monitor.wait_for_completion(&id, timeout).await }
        });
        let results = futures::future::join_all(waits).await;

        let mut outcomes = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(outcome) => {
                    if outcome.status == AgentStatus::Failed && first_error.is_none() {
                        first_error = Some(OrchestrationError::runtime(format!(
                            "agent {} failed",
                            outcome.agent_id
                        )));
                    }
                    outcomes.push(outcome);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        (outcomes, first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::runtime::DeploySpec;
    use coordination_store::MemoryStore;

    #[tokio::test]
    async fn wait_resolves_when_agent_stops() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store));
        let handle = runtime
            .deploy(DeploySpec {
                name: "probe".to_string(),
                image: "busybox:stable".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let monitor =
            AgentMonitor::new(runtime.clone()).with_poll_interval(Duration::from_millis(10));
        let waiter = {
            let monitor = monitor.clone();
            let id = handle.id.clone();
            tokio::spawn(async move {
                monitor
                    .wait_for_completion(&id, Duration::from_secs(2))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        runtime.stop(&handle.id).await.unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn wait_times_out_on_running_agent() {
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store));
        let handle = runtime
            .deploy(DeploySpec {
                name: "stuck".to_string(),
                image: "busybox:stable".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let monitor =
            AgentMonitor::new(runtime).with_poll_interval(Duration::from_millis(10));
        let result = monitor
            .wait_for_completion(&handle.id, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(OrchestrationError::TaskTimeout { .. })));
    }
}
