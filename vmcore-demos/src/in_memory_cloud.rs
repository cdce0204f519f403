//! A toy [`vmcore::Cpi`] backed by an in-process map instead of a real cloud API. Useful for
//! demos, smoke-testing a director wiring, and local development against vmcore without a
//! real cloud account.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use vmcore::{Cpi, CpiError};

/// Hands out sequential `cid`s and remembers which ones are "alive", so a demo can assert on
/// `delete_vm` actually running during compensation.
#[derive(Default)]
pub struct InMemoryCloud {
    next_id: AtomicU64,
    alive: Mutex<HashMap<String, JsonValue>>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alive_cids(&self) -> Vec<String> {
        let mut cids: Vec<String> = self.alive.lock().expect("alive lock poisoned").keys().cloned().collect();
        cids.sort();
        cids
    }
}

#[async_trait]
impl Cpi for InMemoryCloud {
    async fn create_vm(
        &self,
        agent_id: &str,
        _stemcell_cid: &str,
        cloud_properties: &JsonValue,
        _network_settings: &HashMap<String, JsonValue>,
        _disks: &[String],
        _env: &JsonValue,
    ) -> Result<String, CpiError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cid = format!("in-memory-vm-{id}");
        self.alive
            .lock()
            .expect("alive lock poisoned")
            .insert(cid.clone(), cloud_properties.clone());
        tracing::info!(cid, agent_id, "InMemoryCloud created VM");
        Ok(cid)
    }

    async fn delete_vm(&self, cid: &str) -> Result<(), CpiError> {
        let removed = self.alive.lock().expect("alive lock poisoned").remove(cid).is_some();
        if !removed {
            return Err(CpiError::DeleteFailed(format!("no such VM: {cid}")));
        }
        tracing::info!(cid, "InMemoryCloud deleted VM");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_delete_round_trips() {
        let cloud = InMemoryCloud::new();
        let cid = cloud
            .create_vm("agent-1", "stemcell-1", &json!({}), &HashMap::new(), &[], &json!({}))
            .await
            .unwrap();

        assert_eq!(cloud.alive_cids(), vec![cid.clone()]);
        cloud.delete_vm(&cid).await.unwrap();
        assert!(cloud.alive_cids().is_empty());
    }

    #[tokio::test]
    async fn deleting_an_unknown_cid_fails() {
        let cloud = InMemoryCloud::new();
        let err = cloud.delete_vm("never-created").await.unwrap_err();
        assert!(matches!(err, CpiError::DeleteFailed(_)));
    }
}
