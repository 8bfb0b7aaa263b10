//! Sub-workflow execution and templates.
//!
//! A sub-workflow step clones a template (or any stored workflow) into a
//! fresh run, seeds it with the parent's state, executes it through the
//! same orchestrator and merges the final child state back into the
//! parent. Templates are ordinary workflows tagged `is_template` in
//! metadata, optionally carrying a lightweight input schema.

use crate::model::{
    StateMap, StepType, Workflow, WorkflowStatus, META_IS_SUBWORKFLOW, META_IS_TEMPLATE,
    META_PARENT_STEP, META_PARENT_WORKFLOW,
};
use crate::orchestrator::Orchestrator;
use crate::state::StateManager;
use crate::store::WorkflowStore;
use crate::OrchestrationError;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

pub const META_INPUT_SCHEMA: &str = "input_schema";
pub const META_TEMPLATE_ID: &str = "template_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHierarchy {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub children: Vec<WorkflowHierarchy>,
}

/// Minimal input schema stored in template metadata: required keys plus
/// optional JSON type tags per key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct InputSchema {
    #[serde(default)]
    required: Vec<String>,
    #[serde(default)]
    types: std::collections::HashMap<String, String>,
}

#[derive(Clone)]
pub struct SubWorkflowExecutor {
    workflows: WorkflowStore,
    state: StateManager,
}

impl SubWorkflowExecutor {
    pub fn new(workflows: WorkflowStore, state: StateManager) -> Self {
        Self { workflows, state }
    }

    /// Persist a workflow as a template.
    pub async fn create_template(
        &self,
        mut workflow: Workflow,
    ) -> Result<String, OrchestrationError> {
        workflow
            .metadata
            .insert(META_IS_TEMPLATE.to_string(), "true".to_string());
        self.workflows.create(&mut workflow).await?;
        info!(template_id = %workflow.id, name = %workflow.name, "template created");
        Ok(workflow.id)
    }

    /// Look up a template by name or id.
    pub async fn find_template(&self, reference: &str) -> Result<Workflow, OrchestrationError> {
        let all = self.workflows.list(None).await?;
        all.into_iter()
            .find(|w| w.is_template() && (w.name == reference || w.id == reference))
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("template {}", reference),
            })
    }

    /// Clone a template into a runnable workflow with the given input
    /// merged into its state. Input is validated against the template's
    /// schema when one is declared.
    pub async fn instantiate_template(
        &self,
        reference: &str,
        input: StateMap,
    ) -> Result<Workflow, OrchestrationError> {
        let template = self.find_template(reference).await?;
        Self::validate_input(&template, &input)?;

        let mut run = template.clone_for_run();
        run.metadata
            .insert(META_TEMPLATE_ID.to_string(), template.id.clone());
        for (key, value) in input {
            run.state.insert(key, value);
        }
        self.workflows.create(&mut run).await?;
        Ok(run)
    }

    fn validate_input(template: &Workflow, input: &StateMap) -> Result<(), OrchestrationError> {
        let raw = match template.metadata.get(META_INPUT_SCHEMA) {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let schema: InputSchema =
            serde_json::from_str(raw).map_err(|e| OrchestrationError::Validation {
                message: format!("template {} has a malformed input schema: {}", template.id, e),
            })?;

        for key in &schema.required {
            if !input.contains_key(key) {
                return Err(OrchestrationError::Validation {
                    message: format!("missing required input key: {}", key),
                });
            }
        }
        for (key, expected) in &schema.types {
            if let Some(value) = input.get(key) {
                let actual = match value {
                    Value::Null => "null",
                    Value::Bool(_) => "boolean",
                    Value::Number(_) => "number",
                    Value::String(_) => "string",
                    Value::Array(_) => "array",
                    Value::Object(_) => "object",
                };
                if actual != expected {
                    return Err(OrchestrationError::Validation {
                        message: format!(
                            "input key {} should be {} but is {}",
                            key, expected, actual
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run a nested workflow for a sub-workflow step: clone, seed with the
    /// parent's state, execute, merge the final child state back.
    pub async fn execute_sub_workflow(
        &self,
        orchestrator: &Orchestrator,
        parent: &mut Workflow,
        parent_step_id: &str,
        workflow_ref: &str,
    ) -> Result<Value, OrchestrationError> {
        let source = match self.find_template(workflow_ref).await {
            Ok(template) => template,
            Err(OrchestrationError::NotFound { .. }) => self.workflows.get(workflow_ref).await?,
            Err(e) => return Err(e),
        };

        let mut child = source.clone_for_run();
        child.state = parent.state.clone();
        child
            .metadata
            .insert(META_PARENT_WORKFLOW.to_string(), parent.id.clone());
        child
            .metadata
            .insert(META_PARENT_STEP.to_string(), parent_step_id.to_string());
        child
            .metadata
            .insert(META_IS_SUBWORKFLOW.to_string(), "true".to_string());
        self.workflows.create(&mut child).await?;
        info!(parent_id = %parent.id, child_id = %child.id, "executing sub-workflow");

        let status = orchestrator.execute(&child.id).await?;

        let finished = self.workflows.get(&child.id).await?;
        for (key, value) in &finished.state {
            parent.state.insert(key.clone(), value.clone());
            self.state.set(&parent.id, key, value).await?;
        }

        Ok(json!({
            "workflow_id": child.id,
            "status": status.as_str(),
        }))
    }

    /// The nesting tree under a workflow, following instantiated
    /// sub-workflow runs via their parent linkage.
    pub fn hierarchy<'a>(
        &'a self,
        workflow_id: &'a str,
    ) -> BoxFuture<'a, Result<WorkflowHierarchy, OrchestrationError>> {
        async move {
            let workflow = self.workflows.get(workflow_id).await?;
            let mut children = Vec::new();
            let has_nested = workflow
                .steps
                .iter()
                .any(|s| s.step_type == StepType::Subworkflow);
            if has_nested {
                let all = self.workflows.list(None).await?;
                for candidate in all {
                    if candidate.metadata.get(META_PARENT_WORKFLOW).map(String::as_str)
                        == Some(workflow_id)
                    {
                        children.push(self.hierarchy(&candidate.id).await?);
                    }
                }
            }
            Ok(WorkflowHierarchy {
                id: workflow.id,
                name: workflow.name,
                status: workflow.status,
                children,
            })
        }
        .boxed()
    }
}
