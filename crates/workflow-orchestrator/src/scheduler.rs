//! Workflow triggers.
//!
//! Three ways a stored workflow becomes a run: a cron schedule (seconds
//! precision), a matching event on a pub-sub channel, or an external call
//! (webhook/manual both land on [`Scheduler::fire`]). Every firing clones
//! the target workflow into a fresh run, merges the trigger's input data
//! into its state and hands the run to the orchestrator in the background.

use crate::model::{StateMap, Workflow, WorkflowStatus, META_TRIGGERED_BY};
use crate::orchestrator::Orchestrator;
use crate::store::WorkflowStore;
use crate::OrchestrationError;
use chrono::{DateTime, Utc};
use coordination_store::CoordinationStore;
use cron::Schedule;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TRIGGERS_INDEX: &str = "triggers:list";
pub const META_SOURCE_WORKFLOW: &str = "source_workflow_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
    Webhook,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    pub channel: String,
    pub event_type: String,
    /// Additional strict-equality matches on top-level message fields.
    #[serde(default)]
    pub filters: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    pub trigger_type: TriggerType,
    /// The workflow cloned on each firing.
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventFilter>,
    #[serde(default)]
    pub input_data: StateMap,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub skip_if_running: bool,
    #[serde(default)]
    pub catch_up: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u64,
}

fn default_enabled() -> bool {
    true
}

impl Trigger {
    pub fn new(name: &str, trigger_type: TriggerType, workflow_id: &str) -> Self {
        Self {
            id: format!("trigger-{}", Uuid::new_v4()),
            name: name.to_string(),
            trigger_type,
            workflow_id: workflow_id.to_string(),
            schedule: None,
            event: None,
            input_data: StateMap::new(),
            enabled: true,
            skip_if_running: false,
            catch_up: false,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            run_count: 0,
        }
    }
}

fn next_occurrence(expression: &str) -> Option<DateTime<Utc>> {
    Schedule::from_str(expression)
        .ok()
        .and_then(|schedule| schedule.upcoming(Utc).next())
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn CoordinationStore>,
    workflows: WorkflowStore,
    orchestrator: Orchestrator,
    loops: Arc<DashMap<String, watch::Sender<bool>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn CoordinationStore>, orchestrator: Orchestrator) -> Self {
        Self {
            workflows: orchestrator.workflows().clone(),
            store,
            orchestrator,
            loops: Arc::new(DashMap::new()),
        }
    }

    fn key(trigger_id: &str) -> String {
        format!("trigger:{}", trigger_id)
    }

    /// Validate, persist and (for schedule/event triggers) start the
    /// firing loop.
    pub async fn register(&self, mut trigger: Trigger) -> Result<String, OrchestrationError> {
        match trigger.trigger_type {
            TriggerType::Schedule => {
                let expression =
                    trigger
                        .schedule
                        .as_deref()
                        .ok_or_else(|| OrchestrationError::Validation {
                            message: format!("schedule trigger {} has no cron expression", trigger.name),
                        })?;
                Schedule::from_str(expression).map_err(|e| OrchestrationError::Validation {
                    message: format!("invalid cron expression {:?}: {}", expression, e),
                })?;
                trigger.next_run = next_occurrence(expression);
            }
            TriggerType::Event => {
                if trigger.event.is_none() {
                    return Err(OrchestrationError::Validation {
                        message: format!("event trigger {} has no event filter", trigger.name),
                    });
                }
            }
            TriggerType::Webhook | TriggerType::Manual => {}
        }
        // The target must exist up front.
        self.workflows.get(&trigger.workflow_id).await?;

        self.save_trigger(&trigger).await?;
        self.store.set_add(TRIGGERS_INDEX, &trigger.id).await?;
        info!(trigger_id = %trigger.id, name = %trigger.name, "trigger registered");

        if trigger.enabled {
            match trigger.trigger_type {
                TriggerType::Schedule => self.spawn_schedule_loop(trigger.clone()),
                TriggerType::Event => self.spawn_event_loop(trigger.clone()),
                _ => {}
            }
        }
        Ok(trigger.id)
    }

    pub async fn get(&self, trigger_id: &str) -> Result<Trigger, OrchestrationError> {
        let raw = self
            .store
            .get(&Self::key(trigger_id))
            .await?
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("trigger {}", trigger_id),
            })?;
        serde_json::from_str(&raw).map_err(|e| OrchestrationError::Validation {
            message: format!("corrupt trigger document {}: {}", trigger_id, e),
        })
    }

    pub async fn list(&self) -> Result<Vec<Trigger>, OrchestrationError> {
        let ids = self.store.set_members(TRIGGERS_INDEX).await?;
        let mut triggers = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(trigger) => triggers.push(trigger),
                Err(OrchestrationError::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(trigger_id = %id, error = %e, "skipping unreadable trigger");
                }
            }
        }
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(triggers)
    }

    pub async fn remove(&self, trigger_id: &str) -> Result<bool, OrchestrationError> {
        if let Some((_, stop)) = self.loops.remove(trigger_id) {
            let _ = stop.send(true);
        }
        let removed = self.store.delete(&Self::key(trigger_id)).await?;
        self.store.set_remove(TRIGGERS_INDEX, trigger_id).await?;
        Ok(removed)
    }

    /// External firing path (webhook and manual triggers). Returns the id
    /// of the launched run, or `None` when `skip_if_running` suppressed it.
    pub async fn fire(&self, trigger_id: &str) -> Result<Option<String>, OrchestrationError> {
        let mut trigger = self.get(trigger_id).await?;
        let run_id = self.fire_trigger(&mut trigger).await?;
        Ok(run_id)
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<(), OrchestrationError> {
        let document =
            serde_json::to_string(trigger).map_err(|e| OrchestrationError::Validation {
                message: format!("unserializable trigger {}: {}", trigger.id, e),
            })?;
        self.store.set(&Self::key(&trigger.id), &document, None).await?;
        Ok(())
    }

    /// Clone the target workflow into a run, merge the trigger input and
    /// execute it in the background. Updates the trigger bookkeeping.
    async fn fire_trigger(
        &self,
        trigger: &mut Trigger,
    ) -> Result<Option<String>, OrchestrationError> {
        if !trigger.enabled {
            return Ok(None);
        }
        if trigger.skip_if_running {
            let running = self.workflows.list(Some(WorkflowStatus::Running)).await?;
            let already = running.iter().any(|w| {
                w.id == trigger.workflow_id
                    || w.metadata.get(META_SOURCE_WORKFLOW) == Some(&trigger.workflow_id)
            });
            if already {
                debug!(trigger_id = %trigger.id, "target already running, skipping fire");
                return Ok(None);
            }
        }

        let source = self.workflows.get(&trigger.workflow_id).await?;
        let mut run = source.clone_for_run();
        run.metadata
            .insert(META_TRIGGERED_BY.to_string(), trigger.id.clone());
        run.metadata
            .insert(META_SOURCE_WORKFLOW.to_string(), trigger.workflow_id.clone());
        for (key, value) in &trigger.input_data {
            run.state.insert(key.clone(), value.clone());
        }
        self.workflows.create(&mut run).await?;

        let orchestrator = self.orchestrator.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.execute(&run_id).await {
                warn!(run_id = %run_id, error = %e, "triggered run failed");
            }
        });

        trigger.last_run = Some(Utc::now());
        trigger.run_count += 1;
        if let Some(expression) = &trigger.schedule {
            trigger.next_run = next_occurrence(expression);
        }
        self.save_trigger(trigger).await?;
        info!(trigger_id = %trigger.id, run_id = %run.id, "trigger fired");
        Ok(Some(run.id))
    }

    fn spawn_schedule_loop(&self, trigger: Trigger) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.loops.insert(trigger.id.clone(), stop_tx);
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut trigger = trigger;
            let expression = match trigger.schedule.clone() {
                Some(expression) => expression,
                None => return,
            };
            loop {
                let next = match next_occurrence(&expression) {
                    Some(next) => next,
                    None => {
                        warn!(trigger_id = %trigger.id, "cron schedule has no upcoming firing");
                        return;
                    }
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(10));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stop_rx.changed() => return,
                }
                if let Err(e) = scheduler.fire_trigger(&mut trigger).await {
                    warn!(trigger_id = %trigger.id, error = %e, "scheduled fire failed");
                }
            }
        });
    }

    fn spawn_event_loop(&self, trigger: Trigger) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.loops.insert(trigger.id.clone(), stop_tx);
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut trigger = trigger;
            let filter = match trigger.event.clone() {
                Some(filter) => filter,
                None => return,
            };
            let mut subscription = match scheduler.store.subscribe(&filter.channel).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(trigger_id = %trigger.id, error = %e, "event subscription failed");
                    return;
                }
            };
            loop {
                let message = tokio::select! {
                    message = subscription.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                    _ = stop_rx.changed() => return,
                };
                if !event_matches(&filter, &message) {
                    continue;
                }
                if let Err(e) = scheduler.fire_trigger(&mut trigger).await {
                    warn!(trigger_id = %trigger.id, error = %e, "event fire failed");
                }
            }
        });
    }

    /// Stop all firing loops.
    pub fn shutdown(&self) {
        for entry in self.loops.iter() {
            let _ = entry.value().send(true);
        }
        self.loops.clear();
    }
}

/// An event message matches when its `event_type` equals the filter's and
/// every filter key is present with exactly the same value.
fn event_matches(filter: &EventFilter, message: &str) -> bool {
    let event: Value = match serde_json::from_str(message) {
        Ok(event) => event,
        Err(_) => return false,
    };
    let event_type = event["event_type"]
        .as_str()
        .or_else(|| event["type"].as_str());
    if event_type != Some(filter.event_type.as_str()) {
        return false;
    }
    filter
        .filters
        .iter()
        .all(|(key, expected)| event.get(key) == Some(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use crate::model::{Step, StepType};
    use crate::OrchestratorConfig;
    use coordination_store::MemoryStore;
    use serde_json::json;

    fn scheduler() -> (Arc<MemoryStore>, Scheduler) {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new(store.clone()));
        let orchestrator =
            Orchestrator::new(store.clone(), runtime, OrchestratorConfig::default());
        (store.clone(), Scheduler::new(store, orchestrator))
    }

    async fn stored_workflow(scheduler: &Scheduler) -> Workflow {
        let mut workflow = Workflow::new("target", "");
        workflow.steps.push(Step::new("only", "only", StepType::Sequential));
        scheduler.workflows.create(&mut workflow).await.unwrap();
        workflow
    }

    async fn find_run(scheduler: &Scheduler, trigger_workflow: &str) -> Option<Workflow> {
        let all = scheduler.workflows.list(None).await.unwrap();
        all.into_iter().find(|w| {
            w.metadata.get(META_SOURCE_WORKFLOW).map(String::as_str) == Some(trigger_workflow)
        })
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let (_, scheduler) = scheduler();
        let workflow = stored_workflow(&scheduler).await;
        let mut trigger = Trigger::new("bad", TriggerType::Schedule, &workflow.id);
        trigger.schedule = Some("not a cron".to_string());
        assert!(matches!(
            scheduler.register(trigger).await,
            Err(OrchestrationError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn schedule_registration_computes_next_run() {
        let (_, scheduler) = scheduler();
        let workflow = stored_workflow(&scheduler).await;
        let mut trigger = Trigger::new("yearly", TriggerType::Schedule, &workflow.id);
        trigger.schedule = Some("0 0 0 1 1 *".to_string());
        let id = scheduler.register(trigger).await.unwrap();

        let stored = scheduler.get(&id).await.unwrap();
        assert!(stored.next_run.is_some());
        assert!(stored.next_run.unwrap() > Utc::now());
        assert_eq!(scheduler.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn manual_fire_clones_and_executes() {
        let (_, scheduler) = scheduler();
        let workflow = stored_workflow(&scheduler).await;
        let mut trigger = Trigger::new("manual", TriggerType::Manual, &workflow.id);
        trigger.input_data.insert("env".to_string(), json!("staging"));
        let id = scheduler.register(trigger).await.unwrap();

        let run_id = scheduler.fire(&id).await.unwrap().unwrap();
        assert_ne!(run_id, workflow.id);

        let run = scheduler.workflows.get(&run_id).await.unwrap();
        assert_eq!(run.state["env"], json!("staging"));
        assert_eq!(run.metadata[META_TRIGGERED_BY], id);

        let fired = scheduler.get(&id).await.unwrap();
        assert_eq!(fired.run_count, 1);
        assert!(fired.last_run.is_some());

        // The background run finishes against the mock runtime.
        for _ in 0..100 {
            let run = scheduler.workflows.get(&run_id).await.unwrap();
            if run.status == WorkflowStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("triggered run never completed");
    }

    #[tokio::test]
    async fn skip_if_running_suppresses_duplicate_runs() {
        let (_, scheduler) = scheduler();
        let workflow = stored_workflow(&scheduler).await;

        // A running clone of the target already exists.
        let mut clone = workflow.clone_for_run();
        clone.status = WorkflowStatus::Running;
        clone
            .metadata
            .insert(META_SOURCE_WORKFLOW.to_string(), workflow.id.clone());
        scheduler.workflows.create(&mut clone).await.unwrap();

        let mut trigger = Trigger::new("guarded", TriggerType::Manual, &workflow.id);
        trigger.skip_if_running = true;
        let id = scheduler.register(trigger).await.unwrap();

        assert_eq!(scheduler.fire(&id).await.unwrap(), None);
        assert_eq!(scheduler.get(&id).await.unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn event_trigger_fires_on_matching_message() {
        let (store, scheduler) = scheduler();
        let workflow = stored_workflow(&scheduler).await;
        let mut trigger = Trigger::new("on-deploy", TriggerType::Event, &workflow.id);
        trigger.event = Some(EventFilter {
            channel: "events".to_string(),
            event_type: "deploy".to_string(),
            filters: [("env".to_string(), json!("prod"))].into_iter().collect(),
        });
        scheduler.register(trigger).await.unwrap();

        // Non-matching messages are ignored; the matching one fires.
        // Re-publish until the event loop (which subscribes asynchronously)
        // has picked it up.
        let mut fired = None;
        for _ in 0..100 {
            store
                .publish("events", &json!({"event_type": "deploy", "env": "dev"}).to_string())
                .await
                .unwrap();
            store
                .publish("events", &json!({"event_type": "deploy", "env": "prod"}).to_string())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some(run) = find_run(&scheduler, &workflow.id).await {
                fired = Some(run);
                break;
            }
        }
        let run = fired.expect("event trigger never fired");
        assert_eq!(
            run.metadata.get(META_SOURCE_WORKFLOW).map(String::as_str),
            Some(workflow.id.as_str())
        );
        scheduler.shutdown();
    }

    #[test]
    fn event_matching_is_strict() {
        let filter = EventFilter {
            channel: "events".to_string(),
            event_type: "deploy".to_string(),
            filters: [("env".to_string(), json!("prod"))].into_iter().collect(),
        };
        assert!(event_matches(
            &filter,
            &json!({"event_type": "deploy", "env": "prod", "extra": 1}).to_string()
        ));
        assert!(!event_matches(
            &filter,
            &json!({"event_type": "deploy", "env": "dev"}).to_string()
        ));
        assert!(!event_matches(
            &filter,
            &json!({"event_type": "rollback", "env": "prod"}).to_string()
        ));
        assert!(!event_matches(&filter, "not json"));
    }
}
