//! Coordination substrate for the workflow orchestrator.
//!
//! Everything the orchestrator shares with its agents goes through one
//! key/value + pub-sub substrate: workflow documents, shared state hashes,
//! task records and results, completion channels, metrics timelines. This
//! crate provides the typed facade over that substrate as the
//! [`CoordinationStore`] trait, with two implementations:
//!
//! - [`RedisStore`]: the production backend, built on the `redis` crate's
//!   connection manager with retry and command timeouts.
//! - [`MemoryStore`]: a single-process twin of the same contract, used by
//!   the test suites and as a degraded fallback when no Redis is reachable.
//!
//! Values are stored as UTF-8 strings (JSON payloads in practice) so that
//! agents written in any language can read and write them.

pub mod client;
pub mod memory;
pub mod pubsub;
pub mod types;

pub use client::RedisStore;
pub use memory::MemoryStore;
pub use pubsub::PubSubManager;
pub use types::StoreConfig;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection error: {error}")]
    Connection { error: String },

    #[error("serialization error: {error}")]
    Serialization { error: String },

    #[error("deserialization error: {error}")]
    Deserialization { error: String },

    #[error("operation timeout: {operation}")]
    OperationTimeout { operation: String },

    #[error("transaction error: {error}")]
    Transaction { error: String },

    #[error("pub/sub error: {error}")]
    PubSub { error: String },
}

/// A live subscription to a pub-sub channel.
///
/// Messages published after the subscription was established are delivered
/// in order; dropping the subscription ends it.
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: String, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { channel, rx }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Receive the next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }
}

/// The substrate contract consumed by the orchestrator core.
///
/// All operations are atomic at the granularity Redis provides them:
/// `incr`/`hash_incr` are read-modify-write safe under concurrent callers,
/// `hash_compare_and_swap` succeeds for exactly one of two racing writers,
/// and list/set mutations never lose concurrent additions.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // Plain keys
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    // Hashes
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError>;
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;
    /// Atomically replace `field` with `new` iff its current value equals
    /// `old`. A missing field compares equal to `None`.
    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        old: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError>;

    // Lists
    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError>;
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    // Sets
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    // Sorted sets
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;
    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError>;
    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize, StoreError>;

    // Pub-sub
    async fn publish(&self, channel: &str, payload: &str) -> Result<u32, StoreError>;
    /// Subscribe to a channel. Only messages published after this call
    /// returns are delivered; callers that race a publisher must subscribe
    /// before triggering it.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}
