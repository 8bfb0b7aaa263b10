//! Workflow persistence.
//!
//! Whole-document writes: the canonical JSON document lives at
//! `workflow:<id>`, the id is indexed in the `workflows:list` set, and every
//! save broadcasts a snapshot on the `workflow:updates` channel for
//! observers (dashboards, schedulers) that re-read instead of writing.

use crate::model::{Workflow, WorkflowStatus};
use crate::OrchestrationError;
use chrono::Utc;
use coordination_store::CoordinationStore;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub const WORKFLOWS_INDEX: &str = "workflows:list";
pub const UPDATES_CHANNEL: &str = "workflow:updates";

#[derive(Clone)]
pub struct WorkflowStore {
    store: Arc<dyn CoordinationStore>,
}

impl WorkflowStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn key(workflow_id: &str) -> String {
        format!("workflow:{}", workflow_id)
    }

    /// Validate and persist a new workflow.
    pub async fn create(&self, workflow: &mut Workflow) -> Result<(), OrchestrationError> {
        workflow.validate()?;
        self.save(workflow).await
    }

    pub async fn get(&self, workflow_id: &str) -> Result<Workflow, OrchestrationError> {
        let raw = self
            .store
            .get(&Self::key(workflow_id))
            .await?
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("workflow {}", workflow_id),
            })?;
        serde_json::from_str(&raw).map_err(|e| OrchestrationError::Validation {
            message: format!("corrupt workflow document {}: {}", workflow_id, e),
        })
    }

    pub async fn list(
        &self,
        filter: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, OrchestrationError> {
        let ids = self.store.set_members(WORKFLOWS_INDEX).await?;
        let mut workflows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(workflow) => {
                    if filter.map(|status| workflow.status == status).unwrap_or(true) {
                        workflows.push(workflow);
                    }
                }
                // Index entries can outlive expired documents.
                Err(OrchestrationError::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(workflow_id = %id, error = %e, "skipping unreadable workflow");
                    continue;
                }
            }
        }
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    /// The single write path. Serializes the whole document, maintains the
    /// global index and publishes a `workflow_update` notification.
    pub async fn save(&self, workflow: &mut Workflow) -> Result<(), OrchestrationError> {
        workflow.updated_at = Utc::now();
        let document = serde_json::to_string(workflow).map_err(|e| {
            OrchestrationError::Validation {
                message: format!("unserializable workflow {}: {}", workflow.id, e),
            }
        })?;
        self.store.set(&Self::key(&workflow.id), &document, None).await?;
        self.store.set_add(WORKFLOWS_INDEX, &workflow.id).await?;

        let notification = json!({
            "type": "workflow_update",
            "workflow_id": workflow.id,
            "status": workflow.status.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "workflow": workflow,
        });
        self.store
            .publish(UPDATES_CHANNEL, &notification.to_string())
            .await?;
        debug!(workflow_id = %workflow.id, status = workflow.status.as_str(), "workflow saved");
        Ok(())
    }

    /// Load, transition and persist. Stamps `started_at`/`completed_at` on
    /// the corresponding transitions.
    pub async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<Workflow, OrchestrationError> {
        let mut workflow = self.get(workflow_id).await?;
        workflow.status = status;
        match status {
            WorkflowStatus::Running => {
                workflow.started_at.get_or_insert_with(Utc::now);
            }
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled => {
                workflow.completed_at.get_or_insert_with(Utc::now);
            }
            WorkflowStatus::Pending => {}
        }
        self.save(&mut workflow).await?;
        Ok(workflow)
    }

    pub async fn delete(&self, workflow_id: &str) -> Result<bool, OrchestrationError> {
        let removed = self.store.delete(&Self::key(workflow_id)).await?;
        self.store.set_remove(WORKFLOWS_INDEX, workflow_id).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Step, StepType};
    use coordination_store::MemoryStore;

    fn store() -> (Arc<MemoryStore>, WorkflowStore) {
        let memory = Arc::new(MemoryStore::new());
        let workflows = WorkflowStore::new(memory.clone());
        (memory, workflows)
    }

    fn sample() -> Workflow {
        let mut workflow = Workflow::new("sample", "");
        workflow.steps.push(Step::new("only", "only", StepType::Sequential));
        workflow
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let (_, workflows) = store();
        let mut workflow = sample();
        workflows.create(&mut workflow).await.unwrap();

        let loaded = workflows.get(&workflow.id).await.unwrap();
        assert_eq!(loaded.id, workflow.id);
        assert_eq!(loaded.steps.len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let (_, workflows) = store();
        assert!(matches!(
            workflows.get("wf-missing").await,
            Err(OrchestrationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn corrupt_document_surfaces_as_validation() {
        let (memory, workflows) = store();
        memory.set("workflow:wf-bad", "{not json", None).await.unwrap();
        assert!(matches!(
            workflows.get("wf-bad").await,
            Err(OrchestrationError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let (_, workflows) = store();
        let mut pending = sample();
        workflows.create(&mut pending).await.unwrap();
        let mut running = sample();
        running.status = WorkflowStatus::Running;
        workflows.create(&mut running).await.unwrap();

        let all = workflows.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_running = workflows.list(Some(WorkflowStatus::Running)).await.unwrap();
        assert_eq!(only_running.len(), 1);
        assert_eq!(only_running[0].id, running.id);
    }

    #[tokio::test]
    async fn save_publishes_update_notification() {
        let (memory, workflows) = store();
        let mut sub = memory.subscribe(UPDATES_CHANNEL).await.unwrap();

        let mut workflow = sample();
        workflows.create(&mut workflow).await.unwrap();

        let message = sub.recv().await.unwrap();
        let payload: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(payload["type"], "workflow_update");
        assert_eq!(payload["workflow_id"], workflow.id.as_str());
        assert_eq!(payload["status"], "pending");
        assert_eq!(payload["workflow"]["name"], "sample");
    }

    #[tokio::test]
    async fn update_status_stamps_transitions() {
        let (_, workflows) = store();
        let mut workflow = sample();
        workflows.create(&mut workflow).await.unwrap();

        let running = workflows
            .update_status(&workflow.id, WorkflowStatus::Running)
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = workflows
            .update_status(&workflow.id, WorkflowStatus::Completed)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
    }
}
