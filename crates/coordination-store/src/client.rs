use crate::pubsub::PubSubManager;
use crate::types::StoreConfig;
use crate::{CoordinationStore, StoreError, Subscription};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Atomic hash-field compare-and-swap. ARGV[2] is "1" when the expected
/// value is "absent", in which case the swap only succeeds if the field
/// does not exist.
const HASH_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if ARGV[2] == '1' then
    if current ~= false then return 0 end
else
    if current == false or current ~= ARGV[3] then return 0 end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
return 1
"#;

/// Redis-backed [`CoordinationStore`].
///
/// Commands run through a shared `ConnectionManager` with a bounded retry
/// loop; the connection is dropped and re-established after a failed or
/// timed-out attempt. Pub-sub uses dedicated connections (one per
/// subscription) managed by [`PubSubManager`].
pub struct RedisStore {
    config: StoreConfig,
    connection: Arc<RwLock<Option<ConnectionManager>>>,
    pubsub: PubSubManager,
}

impl RedisStore {
    pub async fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let pubsub = PubSubManager::new(&config.url())?;
        let store = Self {
            config,
            connection: Arc::new(RwLock::new(None)),
            pubsub,
        };
        store.connect().await?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), StoreError> {
        let start = Instant::now();
        let client = redis::Client::open(self.config.url()).map_err(|e| StoreError::Connection {
            error: format!("failed to open redis client: {}", e),
        })?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection {
                error: format!("failed to create connection manager: {}", e),
            })?;
        *self.connection.write().await = Some(manager);
        info!(elapsed = ?start.elapsed(), host = %self.config.host, "redis connection established");
        Ok(())
    }

    pub async fn ping(&self) -> Result<bool, StoreError> {
        let pong: String = self
            .execute("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(pong == "PONG")
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        {
            let guard = self.connection.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(conn.clone());
            }
        }
        self.connect().await?;
        let guard = self.connection.read().await;
        guard.as_ref().cloned().ok_or_else(|| StoreError::Connection {
            error: "connection unavailable after reconnect".to_string(),
        })
    }

    async fn reset_connection(&self) {
        *self.connection.write().await = None;
    }

    async fn execute<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            let conn = self.connection().await?;
            match tokio::time::timeout(self.config.command_timeout, f(conn)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if attempts >= self.config.max_retries {
                        return Err(StoreError::Connection {
                            error: format!(
                                "{} failed after {} retries: {}",
                                operation, attempts, e
                            ),
                        });
                    }
                    warn!(operation, error = %e, "redis operation failed, retrying");
                }
                Err(_) => {
                    if attempts >= self.config.max_retries {
                        return Err(StoreError::OperationTimeout {
                            operation: operation.to_string(),
                        });
                    }
                    warn!(operation, "redis operation timed out, retrying");
                }
            }
            attempts += 1;
            self.reset_connection().await;
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.execute("get", move |mut conn| {
            let key = key.clone();
            async move { conn.get(&key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        match ttl {
            Some(ttl) => {
                let seconds = ttl.as_secs().max(1);
                self.execute("set", move |mut conn| {
                    let (key, value) = (key.clone(), value.clone());
                    async move { conn.set_ex::<_, _, ()>(&key, &value, seconds).await }
                })
                .await
            }
            None => {
                self.execute("set", move |mut conn| {
                    let (key, value) = (key.clone(), value.clone());
                    async move { conn.set::<_, _, ()>(&key, &value).await }
                })
                .await
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let removed: i64 = self
            .execute("del", move |mut conn| {
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.execute("exists", move |mut conn| {
            let key = key.clone();
            async move { conn.exists(&key).await }
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        let seconds = ttl.as_secs().max(1) as i64;
        self.execute("expire", move |mut conn| {
            let key = key.clone();
            async move { conn.expire(&key, seconds).await }
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let pattern = pattern.to_string();
        self.execute("keys", move |mut conn| {
            let pattern = pattern.clone();
            async move { conn.keys(&pattern).await }
        })
        .await
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let key = key.to_string();
        self.execute("incr", move |mut conn| {
            let key = key.clone();
            async move { conn.incr(&key, delta).await }
        })
        .await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.execute("hget", move |mut conn| {
            let (key, field) = (key.clone(), field.clone());
            async move { conn.hget(&key, &field).await }
        })
        .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let (key, field, value) = (key.to_string(), field.to_string(), value.to_string());
        self.execute("hset", move |mut conn| {
            let (key, field, value) = (key.clone(), field.clone(), value.clone());
            async move { conn.hset::<_, _, _, ()>(&key, &field, &value).await }
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let key = key.to_string();
        self.execute("hgetall", move |mut conn| {
            let key = key.clone();
            async move { conn.hgetall(&key).await }
        })
        .await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let (key, field) = (key.to_string(), field.to_string());
        let removed: i64 = self
            .execute("hdel", move |mut conn| {
                let (key, field) = (key.clone(), field.clone());
                async move { conn.hdel(&key, &field).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let (key, field) = (key.to_string(), field.to_string());
        self.execute("hincrby", move |mut conn| {
            let (key, field) = (key.clone(), field.clone());
            async move { conn.hincr(&key, &field, delta).await }
        })
        .await
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        old: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let field = field.to_string();
        let absent = if old.is_none() { "1" } else { "0" };
        let old = old.unwrap_or_default().to_string();
        let new = new.to_string();
        let swapped: i64 = self
            .execute("hcas", move |mut conn| {
                let (key, field, old, new) = (key.clone(), field.clone(), old.clone(), new.clone());
                async move {
                    redis::Script::new(HASH_CAS_SCRIPT)
                        .key(&key)
                        .arg(&field)
                        .arg(absent)
                        .arg(&old)
                        .arg(&new)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let (key, value) = (key.to_string(), value.to_string());
        let len: i64 = self
            .execute("rpush", move |mut conn| {
                let (key, value) = (key.clone(), value.clone());
                async move { conn.rpush(&key, &value).await }
            })
            .await?;
        Ok(len as usize)
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.execute("lrange", move |mut conn| {
            let key = key.clone();
            async move { conn.lrange(&key, start, stop).await }
        })
        .await
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let key = key.to_string();
        let len: i64 = self
            .execute("llen", move |mut conn| {
                let key = key.clone();
                async move { conn.llen(&key).await }
            })
            .await?;
        Ok(len as usize)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        let added: i64 = self
            .execute("sadd", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.sadd(&key, &member).await }
            })
            .await?;
        Ok(added > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        let removed: i64 = self
            .execute("srem", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.srem(&key, &member).await }
            })
            .await?;
        Ok(removed > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.execute("smembers", move |mut conn| {
            let key = key.clone();
            async move { conn.smembers(&key).await }
        })
        .await
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        self.execute("sismember", move |mut conn| {
            let (key, member) = (key.clone(), member.clone());
            async move { conn.sismember(&key, &member).await }
        })
        .await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        let (key, member) = (key.to_string(), member.to_string());
        let added: i64 = self
            .execute("zadd", move |mut conn| {
                let (key, member) = (key.clone(), member.clone());
                async move { conn.zadd(&key, &member, score).await }
            })
            .await?;
        Ok(added > 0)
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        let key = key.to_string();
        self.execute("zrangebyscore", move |mut conn| {
            let key = key.clone();
            async move { conn.zrangebyscore(&key, min, max).await }
        })
        .await
    }

    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize, StoreError> {
        let key = key.to_string();
        let removed: i64 = self
            .execute("zremrangebyscore", move |mut conn| {
                let key = key.clone();
                async move { conn.zrembyscore(&key, f64::NEG_INFINITY, score).await }
            })
            .await?;
        Ok(removed as usize)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u32, StoreError> {
        let (channel, payload) = (channel.to_string(), payload.to_string());
        let receivers: i64 = self
            .execute("publish", move |mut conn| {
                let (channel, payload) = (channel.clone(), payload.clone());
                async move { conn.publish(&channel, &payload).await }
            })
            .await?;
        Ok(receivers as u32)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.pubsub.subscribe(channel.to_string()).await
    }
}
