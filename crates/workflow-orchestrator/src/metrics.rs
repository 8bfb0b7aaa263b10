//! Lifecycle metrics.
//!
//! Counters and gauges fed by the dispatcher, the task coordinator and the
//! pools. Recording never fails the caller: a metrics write that cannot
//! reach the substrate is logged and dropped. Completed workflows persist a
//! summary document (7-day TTL) and land on a timeline sorted set so
//! aggregates can be computed over a window; every lifecycle event is also
//! broadcast on `metrics:events`.

use chrono::{DateTime, Utc};
use coordination_store::CoordinationStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const METRICS_EVENTS_CHANNEL: &str = "metrics:events";
const TIMELINE_KEY: &str = "metrics:workflows:timeline";
const WORKFLOW_METRICS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub steps_started: u32,
    pub steps_completed: u32,
    pub steps_failed: u32,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_workflows: u64,
    pub completed_workflows: u64,
    pub failed_workflows: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub agents_deployed: u64,
    pub agents_reused: u64,
    /// reused / (deployed + reused)
    pub pool_efficiency: f64,
    pub pool_utilization: f64,
}

pub struct MetricsCollector {
    store: Arc<dyn CoordinationStore>,
    workflows: DashMap<String, WorkflowMetrics>,
    agents_deployed: AtomicU64,
    agents_reused: AtomicU64,
    pool_utilization: Mutex<f64>,
}

impl MetricsCollector {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            workflows: DashMap::new(),
            agents_deployed: AtomicU64::new(0),
            agents_reused: AtomicU64::new(0),
            pool_utilization: Mutex::new(0.0),
        }
    }

    fn metrics_key(workflow_id: &str) -> String {
        format!("metrics:workflow:{}", workflow_id)
    }

    async fn publish_event(&self, kind: &str, workflow_id: &str, step_id: Option<&str>) {
        let mut event = json!({
            "type": kind,
            "workflow_id": workflow_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(step_id) = step_id {
            event["step_id"] = json!(step_id);
        }
        if let Err(e) = self
            .store
            .publish(METRICS_EVENTS_CHANNEL, &event.to_string())
            .await
        {
            warn!(kind, workflow_id, error = %e, "failed to publish metrics event");
        }
    }

    async fn persist(&self, workflow_id: &str) {
        let entry = match self.workflows.get(workflow_id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        let document = match serde_json::to_string(&entry) {
            Ok(document) => document,
            Err(e) => {
                warn!(workflow_id, error = %e, "unserializable workflow metrics");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&Self::metrics_key(workflow_id), &document, Some(WORKFLOW_METRICS_TTL))
            .await
        {
            warn!(workflow_id, error = %e, "failed to persist workflow metrics");
        }
        let score = Utc::now().timestamp() as f64;
        if let Err(e) = self.store.sorted_add(TIMELINE_KEY, workflow_id, score).await {
            warn!(workflow_id, error = %e, "failed to index workflow metrics");
        }
    }

    pub async fn record_workflow_start(&self, workflow_id: &str) {
        self.workflows.insert(
            workflow_id.to_string(),
            WorkflowMetrics {
                workflow_id: workflow_id.to_string(),
                status: "running".to_string(),
                started_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
                steps_started: 0,
                steps_completed: 0,
                steps_failed: 0,
                errors: Vec::new(),
            },
        );
        self.publish_event("workflow_start", workflow_id, None).await;
    }

    pub async fn record_workflow_complete(&self, workflow_id: &str, duration: Duration) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.status = "completed".to_string();
            entry.completed_at = Some(Utc::now());
            entry.duration_ms = Some(duration.as_millis() as u64);
        }
        self.persist(workflow_id).await;
        self.publish_event("workflow_complete", workflow_id, None).await;
    }

    pub async fn record_workflow_fail(&self, workflow_id: &str, error: &str, duration: Duration) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.status = "failed".to_string();
            entry.completed_at = Some(Utc::now());
            entry.duration_ms = Some(duration.as_millis() as u64);
            entry.errors.push(error.to_string());
        }
        self.persist(workflow_id).await;
        self.publish_event("workflow_fail", workflow_id, None).await;
    }

    pub async fn record_step_start(&self, workflow_id: &str, step_id: &str) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.steps_started += 1;
        }
        self.publish_event("step_start", workflow_id, Some(step_id)).await;
    }

    pub async fn record_step_complete(&self, workflow_id: &str, step_id: &str) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.steps_completed += 1;
        }
        self.publish_event("step_complete", workflow_id, Some(step_id)).await;
    }

    pub async fn record_step_fail(&self, workflow_id: &str, step_id: &str, error: &str) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.steps_failed += 1;
            entry.errors.push(format!("{}: {}", step_id, error));
        }
        self.publish_event("step_fail", workflow_id, Some(step_id)).await;
    }

    pub async fn record_error(&self, workflow_id: &str, error: &str) {
        if let Some(mut entry) = self.workflows.get_mut(workflow_id) {
            entry.errors.push(error.to_string());
        }
        self.publish_event("error", workflow_id, None).await;
    }

    pub fn record_agent_deployed(&self) {
        self.agents_deployed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_agent_reused(&self) {
        self.agents_reused.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_pool_utilization(&self, utilization: f64) {
        *self.pool_utilization.lock() = utilization;
    }

    /// Aggregate over workflows whose completion landed inside the window.
    pub async fn aggregate(&self, window: Duration) -> MetricsSummary {
        let now = Utc::now().timestamp() as f64;
        let min = now - window.as_secs() as f64;
        let ids = self
            .store
            .sorted_range_by_score(TIMELINE_KEY, min, now)
            .await
            .unwrap_or_default();

        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut durations = Vec::new();
        for id in &ids {
            let raw = match self.store.get(&Self::metrics_key(id)).await {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            let entry: WorkflowMetrics = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            match entry.status.as_str() {
                "completed" => completed += 1,
                "failed" => failed += 1,
                _ => {}
            }
            if let Some(duration) = entry.duration_ms {
                durations.push(duration as f64);
            }
        }

        let finished = completed + failed;
        let deployed = self.agents_deployed.load(Ordering::SeqCst);
        let reused = self.agents_reused.load(Ordering::SeqCst);
        MetricsSummary {
            total_workflows: ids.len() as u64,
            completed_workflows: completed,
            failed_workflows: failed,
            success_rate: if finished == 0 {
                1.0
            } else {
                completed as f64 / finished as f64
            },
            average_duration_ms: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            },
            agents_deployed: deployed,
            agents_reused: reused,
            pool_efficiency: if deployed + reused == 0 {
                0.0
            } else {
                reused as f64 / (deployed + reused) as f64
            },
            pool_utilization: *self.pool_utilization.lock(),
        }
    }

    /// Drop timeline entries older than the retention window.
    pub async fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = (Utc::now().timestamp() as f64) - retention.as_secs() as f64;
        match self.store.sorted_remove_below(TIMELINE_KEY, cutoff).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "metrics cleanup failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination_store::MemoryStore;

    fn collector() -> (Arc<MemoryStore>, MetricsCollector) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), MetricsCollector::new(store))
    }

    #[tokio::test]
    async fn workflow_lifecycle_lands_in_aggregate() {
        let (_, metrics) = collector();
        metrics.record_workflow_start("wf-1").await;
        metrics.record_step_start("wf-1", "s1").await;
        metrics.record_step_complete("wf-1", "s1").await;
        metrics
            .record_workflow_complete("wf-1", Duration::from_millis(1200))
            .await;

        metrics.record_workflow_start("wf-2").await;
        metrics.record_step_start("wf-2", "s1").await;
        metrics.record_step_fail("wf-2", "s1", "boom").await;
        metrics
            .record_workflow_fail("wf-2", "boom", Duration::from_millis(300))
            .await;

        let summary = metrics.aggregate(Duration::from_secs(60)).await;
        assert_eq!(summary.total_workflows, 2);
        assert_eq!(summary.completed_workflows, 1);
        assert_eq!(summary.failed_workflows, 1);
        assert!((summary.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((summary.average_duration_ms - 750.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let (store, metrics) = collector();
        let mut sub = store.subscribe(METRICS_EVENTS_CHANNEL).await.unwrap();
        metrics.record_workflow_start("wf-1").await;

        let message = sub.recv().await.unwrap();
        let event: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(event["type"], "workflow_start");
        assert_eq!(event["workflow_id"], "wf-1");
    }

    #[tokio::test]
    async fn pool_efficiency_reflects_reuse() {
        let (_, metrics) = collector();
        metrics.record_agent_deployed();
        metrics.record_agent_reused();
        metrics.record_agent_reused();
        let summary = metrics.aggregate(Duration::from_secs(60)).await;
        assert!((summary.pool_efficiency - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cleanup_trims_old_timeline_entries() {
        let (store, metrics) = collector();
        let old_score = (Utc::now().timestamp() - 10_000) as f64;
        store
            .sorted_add(TIMELINE_KEY, "wf-old", old_score)
            .await
            .unwrap();
        metrics.record_workflow_start("wf-new").await;
        metrics
            .record_workflow_complete("wf-new", Duration::from_millis(10))
            .await;

        let removed = metrics.cleanup(Duration::from_secs(3600)).await;
        assert_eq!(removed, 1);
        let summary = metrics.aggregate(Duration::from_secs(3600)).await;
        assert_eq!(summary.total_workflows, 1);
    }
}
