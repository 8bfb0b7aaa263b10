//! Per-workflow performance profiling.
//!
//! While a workflow runs, a 1 Hz sampler records process memory and the
//! number of in-flight steps; the dispatcher stamps per-step start/end.
//! Stopping the profile synthesizes bottlenecks (a step much longer than
//! its peers, a memory spike) and tuning recommendations, then persists the
//! profile for a day.

use coordination_store::CoordinationStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, warn};

const PROFILE_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_SAMPLES: usize = 7200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProfile {
    pub step_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub memory_bytes: u64,
    pub active_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: String,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowProfile {
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepProfile>,
    #[serde(default)]
    pub samples: Vec<ResourceSample>,
    #[serde(default)]
    pub bottlenecks: Vec<Bottleneck>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

pub struct PerformanceProfiler {
    store: Arc<dyn CoordinationStore>,
    profiles: DashMap<String, Arc<Mutex<WorkflowProfile>>>,
    samplers: DashMap<String, watch::Sender<bool>>,
    sample_interval: Duration,
}

impl PerformanceProfiler {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            profiles: DashMap::new(),
            samplers: DashMap::new(),
            sample_interval: Duration::from_secs(1),
        }
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    fn profile_key(workflow_id: &str) -> String {
        format!("profile:{}", workflow_id)
    }

    fn current_memory(system: &mut System) -> u64 {
        match sysinfo::get_current_pid() {
            Ok(pid) => {
                system.refresh_process(pid);
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            Err(_) => 0,
        }
    }

    /// Allocate a profile and start the resource sampler.
    pub fn start(&self, workflow_id: &str) {
        let profile = Arc::new(Mutex::new(WorkflowProfile {
            workflow_id: workflow_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            samples: Vec::new(),
            bottlenecks: Vec::new(),
            recommendations: Vec::new(),
        }));
        self.profiles.insert(workflow_id.to_string(), profile.clone());

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.samplers.insert(workflow_id.to_string(), stop_tx);
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => return,
                }
                let memory = Self::current_memory(&mut system);
                let mut profile = profile.lock();
                let active_steps = profile
                    .steps
                    .iter()
                    .filter(|s| s.completed_at.is_none())
                    .count();
                if profile.samples.len() < MAX_SAMPLES {
                    profile.samples.push(ResourceSample {
                        timestamp: Utc::now(),
                        memory_bytes: memory,
                        active_steps,
                    });
                }
            }
        });
        debug!(workflow_id, "profiling started");
    }

    pub fn record_step_start(&self, workflow_id: &str, step_id: &str) {
        if let Some(profile) = self.profiles.get(workflow_id) {
            let mut system = System::new();
            let memory = Self::current_memory(&mut system);
            profile.lock().steps.push(StepProfile {
                step_id: step_id.to_string(),
                started_at: Utc::now(),
                completed_at: None,
                duration_ms: None,
                memory_bytes: memory,
            });
        }
    }

    pub fn record_step_end(&self, workflow_id: &str, step_id: &str) {
        if let Some(profile) = self.profiles.get(workflow_id) {
            let mut system = System::new();
            let memory = Self::current_memory(&mut system);
            let mut profile = profile.lock();
            if let Some(step) = profile
                .steps
                .iter_mut()
                .rev()
                .find(|s| s.step_id == step_id && s.completed_at.is_none())
            {
                let now = Utc::now();
                step.completed_at = Some(now);
                step.duration_ms = Some(
                    now.signed_duration_since(step.started_at)
                        .num_milliseconds()
                        .max(0) as u64,
                );
                step.memory_bytes = step.memory_bytes.max(memory);
            }
        }
    }

    /// Stop sampling, synthesize findings, persist and return the profile.
    pub async fn stop(&self, workflow_id: &str) -> Option<WorkflowProfile> {
        if let Some((_, stop_tx)) = self.samplers.remove(workflow_id) {
            let _ = stop_tx.send(true);
        }
        let (_, profile) = self.profiles.remove(workflow_id)?;
        let mut profile = Arc::try_unwrap(profile)
            .map(|mutex| mutex.into_inner())
            .unwrap_or_else(|arc| arc.lock().clone());
        profile.completed_at = Some(Utc::now());
        Self::synthesize(&mut profile);

        match serde_json::to_string(&profile) {
            Ok(document) => {
                if let Err(e) = self
                    .store
                    .set(&Self::profile_key(workflow_id), &document, Some(PROFILE_TTL))
                    .await
                {
                    warn!(workflow_id, error = %e, "failed to persist profile");
                }
            }
            Err(e) => warn!(workflow_id, error = %e, "unserializable profile"),
        }
        Some(profile)
    }

    pub async fn get(&self, workflow_id: &str) -> Option<WorkflowProfile> {
        let raw = self.store.get(&Self::profile_key(workflow_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    /// Bottleneck and recommendation synthesis.
    pub(crate) fn synthesize(profile: &mut WorkflowProfile) {
        let durations: Vec<(String, u64)> = profile
            .steps
            .iter()
            .filter_map(|s| s.duration_ms.map(|d| (s.step_id.clone(), d)))
            .collect();
        if !durations.is_empty() {
            let mean = durations.iter().map(|(_, d)| *d as f64).sum::<f64>() / durations.len() as f64;
            if let Some((step_id, longest)) = durations.iter().max_by_key(|(_, d)| *d) {
                if (*longest as f64) > 3.0 * mean && durations.len() > 1 {
                    profile.bottlenecks.push(Bottleneck {
                        kind: "wait".to_string(),
                        subject: step_id.clone(),
                        detail: format!(
                            "step ran {}ms against a {:.0}ms mean",
                            longest, mean
                        ),
                    });
                }
            }
        }

        let memory: Vec<f64> = profile
            .samples
            .iter()
            .map(|s| s.memory_bytes as f64)
            .filter(|m| *m > 0.0)
            .collect();
        if memory.len() > 1 {
            let mean = memory.iter().sum::<f64>() / memory.len() as f64;
            let max = memory.iter().cloned().fold(0.0, f64::max);
            if max > 2.0 * mean {
                profile.bottlenecks.push(Bottleneck {
                    kind: "memory".to_string(),
                    subject: profile.workflow_id.clone(),
                    detail: format!("peak memory {:.0}B against a {:.0}B mean", max, mean),
                });
            }
        }

        for bottleneck in &profile.bottlenecks {
            match bottleneck.kind.as_str() {
                "wait" => profile.recommendations.push(format!(
                    "step {} dominates the run; check what it waits on",
                    bottleneck.subject
                )),
                "memory" => profile
                    .recommendations
                    .push("memory spikes during the run; lower per-agent memory limits or stagger workers".to_string()),
                _ => {}
            }
        }
        if profile.steps.len() > 10 {
            profile
                .recommendations
                .push("many sequential steps; consider parallelizing independent ones".to_string());
        }
        if profile.samples.len() > 60 {
            profile
                .recommendations
                .push("long-running workflow; enable agent pooling to amortize container start-up".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination_store::MemoryStore;

    fn sample_profile() -> WorkflowProfile {
        WorkflowProfile {
            workflow_id: "wf".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
            samples: Vec::new(),
            bottlenecks: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    fn completed_step(step_id: &str, duration_ms: u64) -> StepProfile {
        let now = Utc::now();
        StepProfile {
            step_id: step_id.to_string(),
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(duration_ms),
            memory_bytes: 0,
        }
    }

    #[test]
    fn long_step_flagged_as_wait_bottleneck() {
        let mut profile = sample_profile();
        profile.steps = vec![
            completed_step("a", 10),
            completed_step("b", 10),
            completed_step("c", 10),
            completed_step("slow", 400),
        ];
        PerformanceProfiler::synthesize(&mut profile);
        assert!(profile
            .bottlenecks
            .iter()
            .any(|b| b.kind == "wait" && b.subject == "slow"));
    }

    #[test]
    fn memory_spike_flagged() {
        let mut profile = sample_profile();
        let now = Utc::now();
        profile.samples = (0..10)
            .map(|i| ResourceSample {
                timestamp: now,
                memory_bytes: if i == 9 { 10_000 } else { 1_000 },
                active_steps: 1,
            })
            .collect();
        PerformanceProfiler::synthesize(&mut profile);
        assert!(profile.bottlenecks.iter().any(|b| b.kind == "memory"));
    }

    #[test]
    fn uniform_profile_has_no_bottlenecks() {
        let mut profile = sample_profile();
        profile.steps = vec![completed_step("a", 100), completed_step("b", 110)];
        PerformanceProfiler::synthesize(&mut profile);
        assert!(profile.bottlenecks.is_empty());
    }

    #[tokio::test]
    async fn start_stop_persists_profile() {
        let store = Arc::new(MemoryStore::new());
        let profiler = PerformanceProfiler::new(store.clone())
            .with_sample_interval(Duration::from_millis(5));
        profiler.start("wf-profiled");
        profiler.record_step_start("wf-profiled", "s1");
        tokio::time::sleep(Duration::from_millis(25)).await;
        profiler.record_step_end("wf-profiled", "s1");

        let profile = profiler.stop("wf-profiled").await.unwrap();
        assert_eq!(profile.steps.len(), 1);
        assert!(profile.steps[0].duration_ms.unwrap() >= 20);
        assert!(!profile.samples.is_empty());

        let loaded = profiler.get("wf-profiled").await.unwrap();
        assert_eq!(loaded.workflow_id, "wf-profiled");
    }
}
