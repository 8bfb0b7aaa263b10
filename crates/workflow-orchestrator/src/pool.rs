//! Warm agent pools.
//!
//! A pool keeps running containers of one image so tasks skip the
//! deploy/start cold path. Agents cycle between an idle queue (a bounded
//! channel) and an active table; background workers reap idle agents past
//! their idle timeout and evict agents the runtime no longer reports as
//! running. [`PoolManager`] is the per-image registry with a global cleanup
//! worker.

use crate::model::PoolSettings;
use crate::runtime::{AgentStatus, ContainerRuntime, DeploySpec, ENV_AGENT_TASKS_CHANNEL};
use crate::OrchestrationError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PooledAgentState {
    Idle,
    Active,
    Terminating,
}

/// Handle around one warm container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledAgent {
    pub agent_id: String,
    pub name: String,
    pub image: String,
    pub state: PooledAgentState,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u32,
    pub healthy: bool,
}

impl PooledAgent {
    /// The channel a warm agent listens on for task ids.
    pub fn tasks_channel(&self) -> String {
        format!("agent:{}:tasks", self.name)
    }
}

/// Worker cadences and grace periods; tests shrink these.
#[derive(Debug, Clone)]
pub struct PoolTimings {
    pub reap_interval: Duration,
    pub health_interval: Duration,
    pub acquire_grace: Duration,
    pub stop_grace: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolTimings {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            acquire_grace: Duration::from_millis(100),
            stop_grace: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub image: String,
    pub current_size: usize,
    pub idle: usize,
    pub active: usize,
    pub utilization: f64,
    pub created_total: u64,
    pub reused_total: u64,
    pub total_uses: u64,
    pub retired_usage_cap: u64,
    pub retired_idle: u64,
    pub retired_unhealthy: u64,
}

struct PoolCounters {
    current_size: usize,
    warmed_up: bool,
}

pub struct AgentPool {
    image: String,
    config: PoolSettings,
    timings: PoolTimings,
    runtime: Arc<dyn ContainerRuntime>,
    base_env: HashMap<String, String>,
    idle_tx: mpsc::Sender<PooledAgent>,
    idle_rx: AsyncMutex<mpsc::Receiver<PooledAgent>>,
    active: DashMap<String, PooledAgent>,
    counters: Mutex<PoolCounters>,
    idle_count: AtomicUsize,
    created_total: AtomicU64,
    reused_total: AtomicU64,
    total_uses: AtomicU64,
    retired_usage_cap: AtomicU64,
    retired_idle: AtomicU64,
    retired_unhealthy: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl AgentPool {
    /// Create the pool and spawn its maintenance workers.
    pub fn spawn(
        image: &str,
        config: PoolSettings,
        runtime: Arc<dyn ContainerRuntime>,
        base_env: HashMap<String, String>,
        timings: PoolTimings,
    ) -> Arc<Self> {
        let capacity = config.max_size.max(1);
        let (idle_tx, idle_rx) = mpsc::channel(capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let pool = Arc::new(Self {
            image: image.to_string(),
            config,
            timings,
            runtime,
            base_env,
            idle_tx,
            idle_rx: AsyncMutex::new(idle_rx),
            active: DashMap::new(),
            counters: Mutex::new(PoolCounters {
                current_size: 0,
                warmed_up: false,
            }),
            idle_count: AtomicUsize::new(0),
            created_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            total_uses: AtomicU64::new(0),
            retired_usage_cap: AtomicU64::new(0),
            retired_idle: AtomicU64::new(0),
            retired_unhealthy: AtomicU64::new(0),
            shutdown_tx,
        });

        Self::spawn_reaper(&pool);
        Self::spawn_health_checker(&pool);
        pool
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn spawn_reaper(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let interval = pool.timings.reap_interval;
        let mut shutdown = pool.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                match weak.upgrade() {
                    Some(pool) => pool.reap_idle().await,
                    None => return,
                }
            }
        });
    }

    fn spawn_health_checker(pool: &Arc<Self>) {
        let weak = Arc::downgrade(pool);
        let interval = pool.timings.health_interval;
        let mut shutdown = pool.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                match weak.upgrade() {
                    Some(pool) => pool.check_health().await,
                    None => return,
                }
            }
        });
    }

    /// Hand out a warm agent: idle queue first (bounded grace), then a new
    /// container while under `max_size`, else [`OrchestrationError::AtCapacity`].
    pub async fn acquire(&self) -> Result<PooledAgent, OrchestrationError> {
        self.ensure_warm().await?;

        let idle = {
            let mut rx = self.idle_rx.lock().await;
            match tokio::time::timeout(self.timings.acquire_grace, rx.recv()).await {
                Ok(Some(agent)) => Some(agent),
                _ => None,
            }
        };

        if let Some(mut agent) = idle {
            self.idle_count.fetch_sub(1, Ordering::SeqCst);
            agent.state = PooledAgentState::Active;
            agent.last_used = Utc::now();
            self.active.insert(agent.agent_id.clone(), agent.clone());
            self.reused_total.fetch_add(1, Ordering::SeqCst);
            debug!(pool = %self.image, agent_id = %agent.agent_id, "reusing warm agent");
            return Ok(agent);
        }

        {
            let mut counters = self.counters.lock();
            if counters.current_size >= self.config.max_size {
                return Err(OrchestrationError::AtCapacity {
                    image: self.image.clone(),
                });
            }
            counters.current_size += 1;
        }

        match self.create_agent().await {
            Ok(mut agent) => {
                agent.state = PooledAgentState::Active;
                agent.last_used = Utc::now();
                self.active.insert(agent.agent_id.clone(), agent.clone());
                Ok(agent)
            }
            Err(e) => {
                self.counters.lock().current_size -= 1;
                Err(e)
            }
        }
    }

    /// Return an agent after a task. Retires it once the usage cap is hit
    /// or the idle queue is saturated; re-enqueues it otherwise.
    pub async fn release(&self, mut agent: PooledAgent) {
        self.active.remove(&agent.agent_id);
        agent.usage_count += 1;
        agent.last_used = Utc::now();
        self.total_uses.fetch_add(1, Ordering::SeqCst);

        if agent.usage_count >= self.config.max_agent_uses {
            debug!(pool = %self.image, agent_id = %agent.agent_id, uses = agent.usage_count, "retiring agent at usage cap");
            self.retired_usage_cap.fetch_add(1, Ordering::SeqCst);
            self.terminate(agent, false).await;
            return;
        }

        agent.state = PooledAgentState::Idle;
        let agent_id = agent.agent_id.clone();
        match self.idle_tx.try_send(agent) {
            Ok(()) => {
                self.idle_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(mpsc::error::TrySendError::Full(agent))
            | Err(mpsc::error::TrySendError::Closed(agent)) => {
                warn!(pool = %self.image, agent_id = %agent_id, "idle queue saturated, terminating agent");
                self.terminate(agent, false).await;
            }
        }
    }

    /// Bring the pool up to `min_size` idle agents before the first
    /// handout.
    async fn ensure_warm(&self) -> Result<(), OrchestrationError> {
        if !self.config.warm_up {
            return Ok(());
        }
        let missing = {
            let mut counters = self.counters.lock();
            if counters.warmed_up {
                return Ok(());
            }
            counters.warmed_up = true;
            let missing = self.config.min_size.saturating_sub(counters.current_size);
            counters.current_size += missing;
            missing
        };
        for _ in 0..missing {
            match self.create_agent().await {
                Ok(agent) => {
                    if self.idle_tx.try_send(agent).is_ok() {
                        self.idle_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    self.counters.lock().current_size -= 1;
                    warn!(pool = %self.image, error = %e, "warm-up agent creation failed");
                }
            }
        }
        info!(pool = %self.image, size = self.config.min_size, "pool warmed up");
        Ok(())
    }

    async fn create_agent(&self) -> Result<PooledAgent, OrchestrationError> {
        let sanitized: String = self
            .image
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let name = format!(
            "pool-{}-{}",
            sanitized,
            &Uuid::new_v4().to_string()[..8]
        );

        let mut env = self.base_env.clone();
        env.insert(
            ENV_AGENT_TASKS_CHANNEL.to_string(),
            format!("agent:{}:tasks", name),
        );
        let mut metadata = HashMap::new();
        metadata.insert("pool_image".to_string(), self.image.clone());

        let spec = DeploySpec {
            name: name.clone(),
            image: self.image.clone(),
            env,
            metadata,
            ..Default::default()
        };
        let handle = self.runtime.deploy(spec).await?;
        self.runtime.start(&handle.id).await?;
        self.created_total.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %self.image, agent_id = %handle.id, "created pool agent");

        let now = Utc::now();
        Ok(PooledAgent {
            agent_id: handle.id,
            name,
            image: self.image.clone(),
            state: PooledAgentState::Idle,
            created_at: now,
            last_used: now,
            usage_count: 0,
            healthy: true,
        })
    }

    /// Stop, wait out the grace period, remove. Emergency termination skips
    /// the grace wait.
    async fn terminate(&self, mut agent: PooledAgent, emergency: bool) {
        agent.state = PooledAgentState::Terminating;
        if let Err(e) = self.runtime.stop(&agent.agent_id).await {
            warn!(agent_id = %agent.agent_id, error = %e, "stop failed during termination");
        }
        if !emergency {
            let deadline = tokio::time::Instant::now() + self.timings.stop_grace;
            loop {
                match self.runtime.get(&agent.agent_id).await {
                    Ok(handle) if !handle.status.is_terminal() => {}
                    _ => break,
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(agent_id = %agent.agent_id, "grace period elapsed, force removing");
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        if let Err(e) = self.runtime.remove(&agent.agent_id).await {
            warn!(agent_id = %agent.agent_id, error = %e, "remove failed during termination");
        }
        self.counters.lock().current_size -= 1;
    }

    /// Drain the idle queue, retire agents idle past the timeout, requeue
    /// the rest.
    pub async fn reap_idle(&self) {
        let mut kept = Vec::new();
        let mut expired = Vec::new();
        {
            let mut rx = self.idle_rx.lock().await;
            while let Ok(agent) = rx.try_recv() {
                self.idle_count.fetch_sub(1, Ordering::SeqCst);
                let idle_for = Utc::now().signed_duration_since(agent.last_used);
                if idle_for.num_seconds() >= self.config.idle_timeout_seconds as i64 {
                    expired.push(agent);
                } else {
                    kept.push(agent);
                }
            }
        }
        for agent in kept {
            if self.idle_tx.try_send(agent).is_ok() {
                self.idle_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        for agent in expired {
            debug!(pool = %self.image, agent_id = %agent.agent_id, "reaping idle agent");
            self.retired_idle.fetch_add(1, Ordering::SeqCst);
            self.terminate(agent, false).await;
        }
    }

    /// Evict active agents the runtime no longer reports as running, then
    /// refill up to `min_size`.
    pub async fn check_health(&self) {
        let active_ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for agent_id in active_ids {
            let running = match self.runtime.get(&agent_id).await {
                Ok(handle) => handle.status == AgentStatus::Running,
                Err(_) => false,
            };
            if !running {
                if let Some((_, mut agent)) = self.active.remove(&agent_id) {
                    warn!(pool = %self.image, agent_id = %agent_id, "evicting unhealthy agent");
                    agent.healthy = false;
                    self.retired_unhealthy.fetch_add(1, Ordering::SeqCst);
                    self.terminate(agent, true).await;
                }
            }
        }

        loop {
            {
                let mut counters = self.counters.lock();
                if !counters.warmed_up || counters.current_size >= self.config.min_size {
                    return;
                }
                counters.current_size += 1;
            }
            match self.create_agent().await {
                Ok(agent) => {
                    if self.idle_tx.try_send(agent).is_ok() {
                        self.idle_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    self.counters.lock().current_size -= 1;
                    warn!(pool = %self.image, error = %e, "replacement agent creation failed");
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let current_size = self.counters.lock().current_size;
        let active = self.active.len();
        PoolStats {
            image: self.image.clone(),
            current_size,
            idle: self.idle_count.load(Ordering::SeqCst),
            active,
            utilization: if current_size == 0 {
                0.0
            } else {
                active as f64 / current_size as f64
            },
            created_total: self.created_total.load(Ordering::SeqCst),
            reused_total: self.reused_total.load(Ordering::SeqCst),
            total_uses: self.total_uses.load(Ordering::SeqCst),
            retired_usage_cap: self.retired_usage_cap.load(Ordering::SeqCst),
            retired_idle: self.retired_idle.load(Ordering::SeqCst),
            retired_unhealthy: self.retired_unhealthy.load(Ordering::SeqCst),
        }
    }

    /// Terminate everything and stop the maintenance workers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let drained: Vec<PooledAgent> = {
            let mut rx = self.idle_rx.lock().await;
            let mut drained = Vec::new();
            while let Ok(agent) = rx.try_recv() {
                self.idle_count.fetch_sub(1, Ordering::SeqCst);
                drained.push(agent);
            }
            drained
        };
        for agent in drained {
            self.terminate(agent, true).await;
        }
        let active_ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for agent_id in active_ids {
            if let Some((_, agent)) = self.active.remove(&agent_id) {
                self.terminate(agent, true).await;
            }
        }
        info!(pool = %self.image, "pool shut down");
    }
}

/// Registry of pools keyed by image; lazily creates on first use and runs a
/// global idle-reaping worker across pools.
pub struct PoolManager {
    runtime: Arc<dyn ContainerRuntime>,
    base_env: HashMap<String, String>,
    timings: PoolTimings,
    pools: DashMap<String, Arc<AgentPool>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        base_env: HashMap<String, String>,
        timings: PoolTimings,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            runtime,
            base_env,
            timings,
            pools: DashMap::new(),
            shutdown_tx,
        });
        Self::spawn_cleanup(&manager);
        manager
    }

    fn spawn_cleanup(manager: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(manager);
        let interval = manager.timings.cleanup_interval;
        let mut shutdown = manager.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let manager = match weak.upgrade() {
                    Some(manager) => manager,
                    None => return,
                };
                let pools: Vec<Arc<AgentPool>> =
                    manager.pools.iter().map(|e| e.value().clone()).collect();
                for pool in pools {
                    pool.reap_idle().await;
                }
            }
        });
    }

    pub fn get_or_create(&self, image: &str, settings: &PoolSettings) -> Arc<AgentPool> {
        self.pools
            .entry(image.to_string())
            .or_insert_with(|| {
                info!(image, "creating agent pool");
                AgentPool::spawn(
                    image,
                    settings.clone(),
                    self.runtime.clone(),
                    self.base_env.clone(),
                    self.timings.clone(),
                )
            })
            .clone()
    }

    pub fn get(&self, image: &str) -> Option<Arc<AgentPool>> {
        self.pools.get(image).map(|e| e.value().clone())
    }

    /// Mean utilization across pools, for the metrics collector.
    pub fn utilization(&self) -> f64 {
        let stats: Vec<PoolStats> = self.pools.iter().map(|e| e.value().stats()).collect();
        if stats.is_empty() {
            return 0.0;
        }
        stats.iter().map(|s| s.utilization).sum::<f64>() / stats.len() as f64
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    pub async fn shutdown_all(&self) {
        let _ = self.shutdown_tx.send(true);
        let pools: Vec<Arc<AgentPool>> = self.pools.iter().map(|e| e.value().clone()).collect();
        for pool in pools {
            pool.shutdown().await;
        }
        self.pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRuntime;
    use coordination_store::MemoryStore;
    use std::collections::HashSet;

    fn test_timings() -> PoolTimings {
        PoolTimings {
            reap_interval: Duration::from_secs(3600),
            health_interval: Duration::from_secs(3600),
            acquire_grace: Duration::from_millis(20),
            stop_grace: Duration::from_millis(50),
            cleanup_interval: Duration::from_secs(3600),
        }
    }

    fn runtime() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::new(Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn pool_reuses_agents_and_retires_at_usage_cap() {
        let pool = AgentPool::spawn(
            "worker:latest",
            PoolSettings {
                min_size: 2,
                max_size: 4,
                idle_timeout_seconds: 300,
                max_agent_uses: 5,
                warm_up: true,
            },
            runtime(),
            HashMap::new(),
            test_timings(),
        );

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let agent = pool.acquire().await.unwrap();
            seen.insert(agent.agent_id.clone());
            pool.release(agent).await;
        }

        let stats = pool.stats();
        assert!(seen.len() <= 4, "at most max_size distinct agents");
        assert_eq!(stats.total_uses, 10);
        assert!(stats.retired_usage_cap <= 2, "at most ceil(10/5) usage-cap retirements");
        assert_eq!(
            stats.current_size,
            stats.idle + stats.active,
            "accounting invariant"
        );
    }

    #[tokio::test]
    async fn pool_returns_at_capacity_when_exhausted() {
        let pool = AgentPool::spawn(
            "worker:latest",
            PoolSettings {
                min_size: 0,
                max_size: 2,
                idle_timeout_seconds: 300,
                max_agent_uses: 50,
                warm_up: false,
            },
            runtime(),
            HashMap::new(),
            test_timings(),
        );

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await,
            Err(OrchestrationError::AtCapacity { .. })
        ));

        pool.release(first).await;
        pool.release(second).await;
        // Capacity frees up once agents are back in the queue.
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn idle_reaper_retires_expired_agents() {
        let pool = AgentPool::spawn(
            "worker:latest",
            PoolSettings {
                min_size: 1,
                max_size: 2,
                idle_timeout_seconds: 0,
                max_agent_uses: 50,
                warm_up: true,
            },
            runtime(),
            HashMap::new(),
            test_timings(),
        );

        let agent = pool.acquire().await.unwrap();
        pool.release(agent).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.reap_idle().await;

        let stats = pool.stats();
        assert!(stats.retired_idle >= 1);
        assert_eq!(stats.current_size, stats.idle + stats.active);
    }

    #[tokio::test]
    async fn health_checker_refills_to_min_size() {
        let mock = runtime();
        let pool = AgentPool::spawn(
            "worker:latest",
            PoolSettings {
                min_size: 2,
                max_size: 4,
                idle_timeout_seconds: 300,
                max_agent_uses: 50,
                warm_up: true,
            },
            mock.clone(),
            HashMap::new(),
            test_timings(),
        );

        let agent = pool.acquire().await.unwrap();
        // Simulate a crashed container behind an active handle.
        mock.stop(&agent.agent_id).await.unwrap();
        pool.check_health().await;

        let stats = pool.stats();
        assert_eq!(stats.retired_unhealthy, 1);
        assert!(stats.current_size >= 2, "refilled to min_size");
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn manager_creates_one_pool_per_image() {
        let manager = PoolManager::new(runtime(), HashMap::new(), test_timings());
        let settings = PoolSettings {
            warm_up: false,
            ..Default::default()
        };
        let a = manager.get_or_create("image-a:1", &settings);
        let b = manager.get_or_create("image-a:1", &settings);
        let c = manager.get_or_create("image-b:1", &settings);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.all_stats().len(), 2);
    }
}
