//! Cloud Provider Interface contract consumed by the VM factory (spec §6).
//!
//! This crate does not implement a CPI — it consumes whatever pluggable adapter the
//! deployment orchestrator wires in. Protocol framing beyond `create_vm`/`delete_vm` is out
//! of scope (spec §1).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Errors a CPI implementation may raise.
#[derive(Debug, thiserror::Error)]
pub enum CpiError {
    /// VM creation failed. `ok_to_retry` drives the factory's retry loop (spec §4.D step 4).
    #[error("VM creation failed: {message}")]
    VmCreationFailed { message: String, ok_to_retry: bool },
    /// Deletion failed. Callers (the factory's `delete_vm`) log this and never propagate it.
    #[error("VM deletion failed: {0}")]
    DeleteFailed(String),
}

impl CpiError {
    pub fn ok_to_retry(&self) -> bool {
        matches!(self, CpiError::VmCreationFailed { ok_to_retry: true, .. })
    }
}

/// The pluggable cloud adapter. Implementations own the actual IaaS calls; this crate only
/// depends on the two operations named in spec §6.
#[async_trait]
pub trait Cpi: Send + Sync {
    async fn create_vm(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &JsonValue,
        network_settings: &HashMap<String, JsonValue>,
        disks: &[String],
        env: &JsonValue,
    ) -> Result<String, CpiError>;

    async fn delete_vm(&self, cid: &str) -> Result<(), CpiError>;
}
