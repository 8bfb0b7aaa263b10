use crate::types::glob_match;
use crate::{CoordinationStore, StoreError, Subscription};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory implementation of [`CoordinationStore`].
///
/// A single-process twin of the Redis backend: the same contract, the same
/// atomicity guarantees (each mutation holds the shard lock of its key),
/// the same subscribe-before-publish pub-sub semantics. The test suites run
/// against it; it also serves as a degraded fallback when no Redis is
/// reachable, at the cost of losing everything on restart.
#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, String>,
    hashes: DashMap<String, HashMap<String, String>>,
    lists: DashMap<String, Vec<String>>,
    sets: DashMap<String, HashSet<String>>,
    sorted: DashMap<String, HashMap<String, f64>>,
    expiries: DashMap<String, Instant>,
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_if_expired(&self, key: &str) {
        let expired = match self.expiries.get(key) {
            Some(deadline) => Instant::now() >= *deadline,
            None => return,
        };
        if expired {
            self.expiries.remove(key);
            self.strings.remove(key);
            self.hashes.remove(key);
            self.lists.remove(key);
            self.sets.remove(key);
            self.sorted.remove(key);
        }
    }

    fn remove_everywhere(&self, key: &str) -> bool {
        self.expiries.remove(key);
        let mut removed = false;
        removed |= self.strings.remove(key).is_some();
        removed |= self.hashes.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.sets.remove(key).is_some();
        removed |= self.sorted.remove(key).is_some();
        removed
    }

    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
            || self.sorted.contains_key(key)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.purge_if_expired(key);
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.strings.insert(key.to_string(), value.to_string());
        match ttl {
            Some(ttl) => {
                self.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self.remove_everywhere(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self.key_exists(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        if !self.key_exists(key) {
            return Ok(false);
        }
        self.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|entry| Instant::now() >= *entry.value())
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.remove_everywhere(&key);
        }

        let mut matches = Vec::new();
        for map_keys in [
            self.strings.iter().map(|e| e.key().clone()).collect::<Vec<_>>(),
            self.hashes.iter().map(|e| e.key().clone()).collect(),
            self.lists.iter().map(|e| e.key().clone()).collect(),
            self.sets.iter().map(|e| e.key().clone()).collect(),
            self.sorted.iter().map(|e| e.key().clone()).collect(),
        ] {
            for key in map_keys {
                if glob_match(pattern, &key) && !matches.contains(&key) {
                    matches.push(key);
                }
            }
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.purge_if_expired(key);
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| "0".to_string());
        let current: i64 = entry.parse().map_err(|_| StoreError::Transaction {
            error: format!("value at {} is not an integer", key),
        })?;
        let next = current + delta;
        *entry = next.to_string();
        Ok(next)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.purge_if_expired(key);
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.purge_if_expired(key);
        Ok(self.hashes.get(key).map(|hash| hash.clone()).unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .hashes
            .get_mut(key)
            .map(|mut hash| hash.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        self.purge_if_expired(key);
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        let current: i64 = match entry.get(field) {
            Some(value) => value.parse().map_err(|_| StoreError::Transaction {
                error: format!("field {} of {} is not an integer", field, key),
            })?,
            None => 0,
        };
        let next = current + delta;
        entry.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hash_compare_and_swap(
        &self,
        key: &str,
        field: &str,
        old: Option<&str>,
        new: &str,
    ) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        let mut entry = self.hashes.entry(key.to_string()).or_default();
        let matches = match (entry.get(field), old) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };
        if matches {
            entry.insert(field.to_string(), new.to_string());
        }
        Ok(matches)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.purge_if_expired(key);
        let mut entry = self.lists.entry(key.to_string()).or_default();
        entry.push(value.to_string());
        Ok(entry.len())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key);
        let list = match self.lists.get(key) {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        let len = list.len() as isize;
        let normalize = |index: isize| -> isize {
            if index < 0 {
                (len + index).max(0)
            } else {
                index
            }
        };
        let start = normalize(start);
        let stop = normalize(stop).min(len - 1);
        if start > stop || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=stop as usize].to_vec())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.purge_if_expired(key);
        Ok(self.lists.get(key).map(|list| list.len()).unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .sets
            .get_mut(key)
            .map(|mut set| set.remove(member))
            .unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self.sets.get(key).map(|set| set.contains(member)).unwrap_or(false))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        self.purge_if_expired(key);
        Ok(self
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score)
            .is_none())
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<String>, StoreError> {
        self.purge_if_expired(key);
        let entries = match self.sorted.get(key) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let mut scored: Vec<(String, f64)> = entries
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().map(|(member, _)| member).collect())
    }

    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize, StoreError> {
        self.purge_if_expired(key);
        let mut entries = match self.sorted.get_mut(key) {
            Some(entries) => entries,
            None => return Ok(0),
        };
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, s)| **s <= score)
            .map(|(member, _)| member.clone())
            .collect();
        for member in &doomed {
            entries.remove(member);
        }
        Ok(doomed.len())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u32, StoreError> {
        match self.channels.get(channel) {
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0) as u32),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut broadcast_rx = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarded_channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel = %forwarded_channel, missed, "subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(channel.to_string(), rx))
    }
}
