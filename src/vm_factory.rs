//! VM Factory (spec §4.D): CPI invocation with retry, record creation, cleanup on failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::Config;
use crate::cpi::{Cpi, CpiError};
use crate::model::{DeploymentRef, VmRecord};
use crate::telemetry::{NullSink, TelemetrySink, VmEvent};

#[derive(Debug, thiserror::Error)]
pub enum VmFactoryError {
    #[error(transparent)]
    Cpi(#[from] CpiError),
    #[error("VM creation exhausted {attempts} attempt(s): {message}")]
    RetriesExhausted { attempts: usize, message: String },
}

/// Outcome of one CPI `create_vm` attempt (Design Note 9: explicit outcome sum rather than
/// "rescue-all-retry-none").
enum AttemptOutcome {
    Success(String),
    RetryableFailure(String),
    FatalFailure(VmFactoryError),
}

/// Creates and destroys cloud VMs via a pluggable [`Cpi`], generating agent identity and
/// (optionally) encryption credentials along the way.
pub struct VmFactory {
    cpi: Arc<dyn Cpi>,
    config: Arc<Config>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl VmFactory {
    pub fn new(cpi: Arc<dyn Cpi>, config: Arc<Config>) -> Self {
        Self { cpi, config, telemetry: Arc::new(NullSink) }
    }

    /// Route this factory's [`VmEvent`]s to `sink` instead of discarding them (SPEC_FULL §10;
    /// the `vmcore-prometheus` sibling crate is a `TelemetrySink` implementation).
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    /// Step 1-5 of spec §4.D. On any failure after the CPI call succeeds, the partially
    /// created VM is compensated (`cpi.delete_vm`, errors logged) before the original error
    /// is re-raised — here, that window is just "none": record construction cannot itself
    /// fail, so compensation is only reachable by a caller that fails a later step and calls
    /// back into [`VmFactory::delete_vm`] (the VM creator's compensating block does this).
    pub async fn create(
        &self,
        deployment: DeploymentRef,
        stemcell_cid: &str,
        cloud_properties: &JsonValue,
        network_settings: &HashMap<String, JsonValue>,
        disks: &[String],
        env: JsonValue,
    ) -> Result<VmRecord, VmFactoryError> {
        let agent_id = Uuid::new_v4().to_string();
        let mut env = env;
        let credentials = if let Some(provider) = self.config.encryption() {
            let credentials = provider.generate();
            if let JsonValue::Object(ref mut root) = env {
                let bosh = root.entry("bosh").or_insert_with(|| JsonValue::Object(Default::default()));
                if let JsonValue::Object(ref mut bosh) = bosh {
                    bosh.insert("credentials".into(), credentials.as_env_value());
                }
            }
            Some(credentials)
        } else {
            None
        };

        let cid = self.create_vm_with_retry(&agent_id, stemcell_cid, cloud_properties, network_settings, disks, &env).await?;
        self.telemetry.emit(VmEvent::Created { cid: cid.clone(), agent_id: agent_id.clone() });

        Ok(VmRecord { cid, agent_id, deployment, env, credentials, apply_spec: None })
    }

    async fn create_vm_with_retry(
        &self,
        agent_id: &str,
        stemcell_cid: &str,
        cloud_properties: &JsonValue,
        network_settings: &HashMap<String, JsonValue>,
        disks: &[String],
        env: &JsonValue,
    ) -> Result<String, VmFactoryError> {
        let max_attempts = self.config.max_vm_create_tries();
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            let outcome = match self
                .cpi
                .create_vm(agent_id, stemcell_cid, cloud_properties, network_settings, disks, env)
                .await
            {
                Ok(cid) => AttemptOutcome::Success(cid),
                Err(err) if err.ok_to_retry() => AttemptOutcome::RetryableFailure(err.to_string()),
                Err(err) => AttemptOutcome::FatalFailure(VmFactoryError::Cpi(err)),
            };

            match outcome {
                AttemptOutcome::Success(cid) => return Ok(cid),
                AttemptOutcome::FatalFailure(err) => return Err(err),
                AttemptOutcome::RetryableFailure(message) => {
                    tracing::warn!(attempt, max_attempts, %message, "CPI create_vm failed, retrying");
                    self.telemetry.emit(VmEvent::CreateRetried { attempt, message: message.clone() });
                    last_message = message;
                }
            }
        }

        Err(VmFactoryError::RetriesExhausted { attempts: max_attempts, message: last_message })
    }

    /// Wraps `cpi.delete_vm`, swallowing errors as warnings (spec §4.D: "delete_vm(cid) ...
    /// swallows errors").
    pub async fn delete_vm(&self, cid: &str) {
        if let Err(err) = self.cpi.delete_vm(cid).await {
            tracing::warn!(cid, error = %err, "CPI delete_vm failed during compensation");
        }
        self.telemetry.emit(VmEvent::Compensated { cid: cid.to_string() });
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::FakeCpi;
    use super::*;
    use crate::bus::InProcessBus;
    use serde_json::json;

    fn config() -> Arc<Config> {
        let bus: Arc<dyn crate::bus::Bus> = Arc::new(InProcessBus::new());
        Arc::new(Config::builder(bus).max_vm_create_tries(3).build().unwrap())
    }

    fn deployment() -> DeploymentRef {
        DeploymentRef { id: "dep-1".into(), name: "my-deployment".into() }
    }

    #[tokio::test]
    async fn creates_vm_and_persists_agent_id() {
        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::succeeding("vm-123"));
        let factory = VmFactory::new(cpi, config());

        let vm = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap();

        assert_eq!(vm.cid, "vm-123");
        assert!(!vm.agent_id.is_empty());
        assert!(vm.has_required_fields());
        assert!(vm.credentials.is_none());
    }

    #[tokio::test]
    async fn retries_retryable_failures_up_to_configured_max() {
        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::failing_then_succeeding(1, "vm-456"));
        let factory = VmFactory::new(cpi, config());

        let vm = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap();

        assert_eq!(vm.cid, "vm-456");
    }

    #[tokio::test]
    async fn propagates_once_retries_are_exhausted() {
        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::failing_then_succeeding(10, "never"));
        let factory = VmFactory::new(cpi, config());

        let err = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, VmFactoryError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn non_retryable_failure_propagates_immediately() {
        let cpi = Arc::new(FakeCpi { ok_to_retry: false, fail_times: 10, ..Default::default() });
        let factory = VmFactory::new(cpi.clone(), config());

        let err = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, VmFactoryError::Cpi(_)));
        assert_eq!(cpi.create_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emits_created_and_compensated_telemetry() {
        use crate::telemetry::{MemorySink, VmEvent};

        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::succeeding("vm-1"));
        let sink = Arc::new(MemorySink::new());
        let factory = VmFactory::new(cpi, config()).with_telemetry(sink.clone());

        let vm = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap();
        factory.delete_vm(&vm.cid).await;

        assert_eq!(
            sink.events(),
            vec![
                VmEvent::Created { cid: "vm-1".into(), agent_id: vm.agent_id.clone() },
                VmEvent::Compensated { cid: "vm-1".into() },
            ]
        );
    }

    #[tokio::test]
    async fn delete_vm_swallows_cpi_errors() {
        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::succeeding("vm-1"));
        let factory = VmFactory::new(cpi, config());
        factory.delete_vm("vm-1").await;
    }

    #[tokio::test]
    async fn enables_encryption_when_config_has_a_credentials_provider() {
        use crate::config::DefaultCredentialsProvider;

        let bus: Arc<dyn crate::bus::Bus> = Arc::new(InProcessBus::new());
        let config = Arc::new(
            Config::builder(bus).encryption(Arc::new(DefaultCredentialsProvider)).build().unwrap(),
        );
        let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::succeeding("vm-1"));
        let factory = VmFactory::new(cpi, config);

        let vm = factory
            .create(deployment(), "stemcell-1", &json!({}), &HashMap::new(), &[], json!({}))
            .await
            .unwrap();

        assert!(vm.credentials.is_some());
        assert!(vm.env["bosh"]["credentials"]["crypt_key"].is_string());
    }
}
