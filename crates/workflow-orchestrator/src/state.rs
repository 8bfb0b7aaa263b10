//! Per-workflow shared state over the coordination substrate.
//!
//! User state lives in the hash `workflow:<id>:state` with JSON-serialized
//! values, so agents in any language read the same bytes the orchestrator
//! writes. The atomic primitives (`increment`, `append_to_list`,
//! `add_to_set`, `compare_and_swap`) delegate to the substrate's atomic
//! operations and are safe under concurrent parallel/map workers; plain
//! `set` is last-writer-wins per key.

use crate::model::{MapStepState, StateMap};
use crate::OrchestrationError;
use coordination_store::{CoordinationStore, StoreError};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

const MAP_STATE_PREFIX: &str = "_map_state_";

#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn CoordinationStore>,
}

impl StateManager {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    fn state_key(workflow_id: &str) -> String {
        format!("workflow:{}:state", workflow_id)
    }

    fn list_key(workflow_id: &str, key: &str) -> String {
        format!("workflow:{}:state:list:{}", workflow_id, key)
    }

    fn set_key(workflow_id: &str, key: &str) -> String {
        format!("workflow:{}:state:set:{}", workflow_id, key)
    }

    fn encode(value: &Value) -> Result<String, OrchestrationError> {
        serde_json::to_string(value).map_err(|e| {
            OrchestrationError::Substrate(StoreError::Serialization {
                error: e.to_string(),
            })
        })
    }

    /// Stored payloads that fail to decode come back as plain strings
    /// rather than errors; agents are free to write non-JSON values.
    fn decode(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap_or(Value::String(raw))
    }

    pub async fn set(
        &self,
        workflow_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), OrchestrationError> {
        let encoded = Self::encode(value)?;
        self.store
            .hash_set(&Self::state_key(workflow_id), key, &encoded)
            .await?;
        Ok(())
    }

    pub async fn get(&self, workflow_id: &str, key: &str) -> Result<Value, OrchestrationError> {
        self.get_opt(workflow_id, key)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound {
                resource: format!("state key {} of workflow {}", key, workflow_id),
            })
    }

    pub async fn get_opt(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Option<Value>, OrchestrationError> {
        let raw = self
            .store
            .hash_get(&Self::state_key(workflow_id), key)
            .await?;
        Ok(raw.map(Self::decode))
    }

    pub async fn get_all(&self, workflow_id: &str) -> Result<StateMap, OrchestrationError> {
        let raw = self.store.hash_get_all(&Self::state_key(workflow_id)).await?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| (key, Self::decode(value)))
            .collect())
    }

    pub async fn delete(&self, workflow_id: &str, key: &str) -> Result<bool, OrchestrationError> {
        Ok(self
            .store
            .hash_delete(&Self::state_key(workflow_id), key)
            .await?)
    }

    /// Remove the state hash and every list/set companion key.
    pub async fn clear(&self, workflow_id: &str) -> Result<(), OrchestrationError> {
        self.store.delete(&Self::state_key(workflow_id)).await?;
        for pattern in [
            format!("workflow:{}:state:list:*", workflow_id),
            format!("workflow:{}:state:set:*", workflow_id),
        ] {
            for key in self.store.keys(&pattern).await? {
                self.store.delete(&key).await?;
            }
        }
        debug!(workflow_id, "cleared workflow state");
        Ok(())
    }

    /// Atomic counter; the stored value must be an integer-encoded field.
    pub async fn increment(
        &self,
        workflow_id: &str,
        key: &str,
        delta: i64,
    ) -> Result<i64, OrchestrationError> {
        Ok(self
            .store
            .hash_incr(&Self::state_key(workflow_id), key, delta)
            .await?)
    }

    pub async fn append_to_list(
        &self,
        workflow_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<usize, OrchestrationError> {
        let encoded = Self::encode(value)?;
        Ok(self
            .store
            .list_push(&Self::list_key(workflow_id, key), &encoded)
            .await?)
    }

    pub async fn get_list(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Vec<Value>, OrchestrationError> {
        let raw = self
            .store
            .list_range(&Self::list_key(workflow_id, key), 0, -1)
            .await?;
        Ok(raw.into_iter().map(Self::decode).collect())
    }

    pub async fn add_to_set(
        &self,
        workflow_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<bool, OrchestrationError> {
        let encoded = Self::encode(value)?;
        Ok(self
            .store
            .set_add(&Self::set_key(workflow_id, key), &encoded)
            .await?)
    }

    pub async fn get_set(
        &self,
        workflow_id: &str,
        key: &str,
    ) -> Result<Vec<Value>, OrchestrationError> {
        let raw = self
            .store
            .set_members(&Self::set_key(workflow_id, key))
            .await?;
        Ok(raw.into_iter().map(Self::decode).collect())
    }

    /// Compare-and-swap on a state key; `None` expects the key to be
    /// absent. Returns whether the swap happened.
    pub async fn compare_and_swap(
        &self,
        workflow_id: &str,
        key: &str,
        old: Option<&Value>,
        new: &Value,
    ) -> Result<bool, OrchestrationError> {
        let old_encoded = match old {
            Some(value) => Some(Self::encode(value)?),
            None => None,
        };
        let new_encoded = Self::encode(new)?;
        Ok(self
            .store
            .hash_compare_and_swap(
                &Self::state_key(workflow_id),
                key,
                old_encoded.as_deref(),
                &new_encoded,
            )
            .await?)
    }

    pub async fn set_map_state(
        &self,
        workflow_id: &str,
        step_id: &str,
        map_state: &MapStepState,
    ) -> Result<(), OrchestrationError> {
        let value = serde_json::to_value(map_state).map_err(|e| {
            OrchestrationError::Substrate(StoreError::Serialization {
                error: e.to_string(),
            })
        })?;
        self.set(workflow_id, &format!("{}{}", MAP_STATE_PREFIX, step_id), &value)
            .await
    }

    pub async fn get_map_state(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<MapStepState>, OrchestrationError> {
        let value = self
            .get_opt(workflow_id, &format!("{}{}", MAP_STATE_PREFIX, step_id))
            .await?;
        match value {
            Some(value) => {
                let map_state = serde_json::from_value(value).map_err(|e| {
                    OrchestrationError::Substrate(StoreError::Deserialization {
                        error: e.to_string(),
                    })
                })?;
                Ok(Some(map_state))
            }
            None => Ok(None),
        }
    }

    /// Merge an object's fields into workflow state, one key at a time.
    pub async fn merge(&self, workflow_id: &str, values: &StateMap) -> Result<(), OrchestrationError> {
        for (key, value) in values {
            self.set(workflow_id, key, value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination_store::MemoryStore;
    use serde_json::json;

    fn manager() -> StateManager {
        StateManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn set_get_roundtrip_normalizes_json() {
        let state = manager();
        state.set("wf", "count", &json!(5)).await.unwrap();
        state.set("wf", "user", &json!({"name": "ada"})).await.unwrap();
        assert_eq!(state.get("wf", "count").await.unwrap(), json!(5));
        assert_eq!(state.get("wf", "user").await.unwrap(), json!({"name": "ada"}));

        let all = state.get_all("wf").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let state = manager();
        assert!(matches!(
            state.get("wf", "nope").await,
            Err(OrchestrationError::NotFound { .. })
        ));
        assert_eq!(state.get_opt("wf", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_value_returned_as_string() {
        let store = Arc::new(MemoryStore::new());
        let state = StateManager::new(store.clone());
        store
            .hash_set("workflow:wf:state", "raw", "not json at all")
            .await
            .unwrap();
        assert_eq!(
            state.get("wf", "raw").await.unwrap(),
            json!("not json at all")
        );
    }

    #[tokio::test]
    async fn concurrent_increments_sum_exactly() {
        let state = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    state.increment("wf", "counter", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(state.get("wf", "counter").await.unwrap(), json!(200));
    }

    #[tokio::test]
    async fn compare_and_swap_with_absent_sentinel() {
        let state = manager();
        assert!(state
            .compare_and_swap("wf", "owner", None, &json!("a"))
            .await
            .unwrap());
        assert!(!state
            .compare_and_swap("wf", "owner", None, &json!("b"))
            .await
            .unwrap());
        assert!(state
            .compare_and_swap("wf", "owner", Some(&json!("a")), &json!("b"))
            .await
            .unwrap());
        assert_eq!(state.get("wf", "owner").await.unwrap(), json!("b"));
    }

    #[tokio::test]
    async fn list_and_set_helpers() {
        let state = manager();
        state.append_to_list("wf", "log", &json!("one")).await.unwrap();
        state.append_to_list("wf", "log", &json!("two")).await.unwrap();
        assert_eq!(
            state.get_list("wf", "log").await.unwrap(),
            vec![json!("one"), json!("two")]
        );

        assert!(state.add_to_set("wf", "seen", &json!(1)).await.unwrap());
        assert!(!state.add_to_set("wf", "seen", &json!(1)).await.unwrap());
        assert_eq!(state.get_set("wf", "seen").await.unwrap(), vec![json!(1)]);
    }

    #[tokio::test]
    async fn map_state_roundtrip() {
        let state = manager();
        let mut map_state = MapStepState::new(3);
        map_state.completed = 2;
        map_state.results[0] = json!({"ok": true});
        state.set_map_state("wf", "fanout", &map_state).await.unwrap();

        let loaded = state.get_map_state("wf", "fanout").await.unwrap().unwrap();
        assert_eq!(loaded.total, 3);
        assert_eq!(loaded.completed, 2);
        assert_eq!(loaded.results[0], json!({"ok": true}));
        assert_eq!(state.get_map_state("wf", "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_removes_companion_keys() {
        let state = manager();
        state.set("wf", "k", &json!(1)).await.unwrap();
        state.append_to_list("wf", "log", &json!("x")).await.unwrap();
        state.add_to_set("wf", "seen", &json!("y")).await.unwrap();
        state.clear("wf").await.unwrap();
        assert!(state.get_all("wf").await.unwrap().is_empty());
        assert!(state.get_list("wf", "log").await.unwrap().is_empty());
        assert!(state.get_set("wf", "seen").await.unwrap().is_empty());
    }
}
