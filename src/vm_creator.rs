//! VM Creator (spec §4.E): orchestrates the VM Factory and Agent Client for a batch of
//! instance plans under a bounded worker pool, running the per-VM compensating transaction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agent::{AgentClient, RpcError};
use crate::blob::ResourceManager;
use crate::config::Config;
use crate::event_log::EventLog;
use crate::model::{Instance, InstancePlan, IpReservation, VmRecord};
use crate::sleeper::Sleeper;
use crate::vm_factory::{VmFactory, VmFactoryError};
use crate::worker_pool::{PoolError, WorkerPool};

#[derive(Debug, thiserror::Error)]
pub enum VmCreatorError {
    #[error(transparent)]
    Factory(#[from] VmFactoryError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("disk attach failed: {0}")]
    DiskAttach(String),
    /// The batch's terminal error after drain (spec §4.F, §7: "the first raised error is
    /// re-thrown ... the pool MUST propagate the first failure ... after draining").
    #[error("batch creation failed: {0}")]
    Batch(String),
}

/// Releases an obsolete IP reservation (spec §1: "only the `release` interface is consumed").
#[async_trait]
pub trait IpReservationReleaser: Send + Sync {
    async fn release(&self, reservation: &IpReservation);
}

/// Applies cloud-side metadata to a freshly created VM (spec §4.E step 3b: "empty CPI-level
/// metadata via a metadata updater hook"). A no-op implementation is a legitimate choice for
/// CPIs that don't support tagging.
#[async_trait]
pub trait MetadataUpdater: Send + Sync {
    async fn update_vm_metadata(&self, vm: &VmRecord, instance: &Instance);
}

/// Attaches an instance's persistent disks after VM creation (spec §4.E step 4; "out of
/// scope: disk attachment beyond a single hook").
#[async_trait]
pub trait DiskManager: Send + Sync {
    async fn attach_disks_for(&self, instance: &Instance) -> Result<(), VmCreatorError>;
}

/// Deletes the cloud VM bound to a plan as failure compensation (spec §4.E step 3f).
#[async_trait]
pub trait VmDeleter: Send + Sync {
    async fn delete_for_instance_plan(&self, plan: &InstancePlan);
}

/// Counts from a batch run, for caller-side reporting (SPEC_FULL §14 — plumbing around the
/// batch op, not a new scheduling behavior).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmCreationSummary {
    pub created: usize,
    pub failed: usize,
    pub compensated: usize,
}

struct PlanFailed(String);

impl std::fmt::Debug for PlanFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlanFailed({})", self.0)
    }
}

impl std::fmt::Display for PlanFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PlanFailed {}

/// Default `wait_until_ready` deadline (spec §4.E step 3c).
const AGENT_READY_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct VmCreator {
    factory: Arc<VmFactory>,
    config: Arc<Config>,
    sleeper: Arc<dyn Sleeper>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
    metadata_updater: Arc<dyn MetadataUpdater>,
    disk_manager: Arc<dyn DiskManager>,
    trusted_certs: Arc<str>,
}

impl VmCreator {
    pub fn new(
        factory: Arc<VmFactory>,
        config: Arc<Config>,
        sleeper: Arc<dyn Sleeper>,
        resource_manager: Option<Arc<dyn ResourceManager>>,
        metadata_updater: Arc<dyn MetadataUpdater>,
        disk_manager: Arc<dyn DiskManager>,
        trusted_certs: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            factory,
            config,
            sleeper,
            resource_manager,
            metadata_updater,
            disk_manager,
            trusted_certs: trusted_certs.into(),
        }
    }

    /// Drains `plans` into a worker pool of size `Config.max_threads`, running
    /// [`VmCreator::create_for_instance_plan`] for each under a thread name carrying
    /// `job/index/total` (spec §4.E). Empty input is a no-op. The returned plans carry
    /// whatever mutations succeeded before the pool's first error, in original order.
    pub async fn create_for_instance_plans(
        &self,
        plans: Vec<InstancePlan>,
        ip_releaser: Arc<dyn IpReservationReleaser>,
        vm_deleter: Arc<dyn VmDeleter>,
        event_log: &dyn EventLog,
    ) -> Result<(Vec<InstancePlan>, VmCreationSummary), VmCreatorError> {
        if plans.is_empty() {
            return Ok((plans, VmCreationSummary::default()));
        }

        let total = plans.len();
        let stage = event_log.begin_stage("Creating missing vms", total);
        let pool = WorkerPool::new(self.config.max_threads());
        let results: Arc<Mutex<Vec<Option<InstancePlan>>>> =
            Arc::new(Mutex::new((0..total).map(|_| None).collect()));
        let created = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let compensated = Arc::new(AtomicUsize::new(0));

        for (index, plan) in plans.into_iter().enumerate() {
            let label = plan.instance.diagnostic_label(total);
            let this = self.clone();
            let ip_releaser = ip_releaser.clone();
            let vm_deleter = vm_deleter.clone();
            let stage = stage.clone();
            let results = results.clone();
            let created = created.clone();
            let failed = failed.clone();
            let compensated = compensated.clone();
            let worker_label = label.clone();

            pool.process(label, move || async move {
                let mut plan = plan;
                let disks: Vec<String> = plan
                    .existing
                    .as_ref()
                    .and_then(|existing| existing.persistent_disk_cid.clone())
                    .into_iter()
                    .collect();

                let outcome = this.create_for_instance_plan(&mut plan, &disks, vm_deleter.as_ref()).await;

                match &outcome {
                    Ok(()) => {
                        created.fetch_add(1, Ordering::SeqCst);
                        for reservation in plan.obsolete_reservations() {
                            ip_releaser.release(&reservation).await;
                        }
                        plan.release_obsolete_network_plans();
                    }
                    Err(_) => {
                        failed.fetch_add(1, Ordering::SeqCst);
                        compensated.fetch_add(1, Ordering::SeqCst);
                    }
                }

                stage.advance(&worker_label);
                let failure_message = outcome.as_ref().err().map(|err| err.to_string());
                results.lock().expect("vm creator results lock poisoned")[index] = Some(plan);

                match failure_message {
                    Some(message) => Err(Box::new(PlanFailed(message)) as PoolError),
                    None => Ok(()),
                }
            });
        }

        let pool_result = pool.wrap().await;
        stage.finish();

        let plans: Vec<InstancePlan> = std::mem::take(&mut *results.lock().expect("vm creator results lock poisoned"))
            .into_iter()
            .map(|plan| plan.expect("every index is written exactly once by its worker"))
            .collect();

        let summary = VmCreationSummary {
            created: created.load(Ordering::SeqCst),
            failed: failed.load(Ordering::SeqCst),
            compensated: compensated.load(Ordering::SeqCst),
        };

        match pool_result {
            Ok(()) => Ok((plans, summary)),
            Err(err) => Err(VmCreatorError::Batch(err.to_string())),
        }
    }

    /// Steps 1-6 of spec §4.E for a single plan.
    pub async fn create_for_instance_plan(
        &self,
        plan: &mut InstancePlan,
        disks: &[String],
        vm_deleter: &dyn VmDeleter,
    ) -> Result<(), VmCreatorError> {
        let existing_apply_spec = plan.existing.as_ref().map(|e| e.apply_spec.clone());

        let vm = self
            .factory
            .create(
                plan.instance.deployment.clone(),
                &plan.instance.stemcell.cid,
                &plan.instance.cloud_properties,
                &plan.network_settings(),
                disks,
                plan.instance.env.clone(),
            )
            .await?;

        if let Err(err) = self.bring_vm_online(plan, vm).await {
            tracing::warn!(
                job = %plan.instance.job,
                index = plan.instance.index,
                error = %err,
                "compensating: deleting VM after failure bringing it online"
            );
            vm_deleter.delete_for_instance_plan(plan).await;
            return Err(err);
        }

        // Step 4: disk attachment is post-compensation; its failures propagate uncompensated.
        self.disk_manager.attach_disks_for(&plan.instance).await?;

        // Step 5: apply-state branch.
        let agent = self.agent_client_for(&plan.instance);
        if plan.needs_recreate() {
            let apply_spec = existing_apply_spec.unwrap_or_else(|| json!({}));
            agent.apply(apply_spec.clone()).await?;
            plan.instance.record_applied_spec(apply_spec);
        } else {
            let apply_spec = plan.instance.apply_vm_state();
            agent.apply(apply_spec.clone()).await?;
            plan.instance.record_applied_spec(apply_spec);
        }

        plan.mark_desired_network_plans_as_existing();
        Ok(())
    }

    /// Steps 3a-3e: the compensating block. Any failure here is reported to the caller, which
    /// triggers VM deletion (step 3f) before re-raising.
    async fn bring_vm_online(&self, plan: &mut InstancePlan, vm: VmRecord) -> Result<(), VmCreatorError> {
        self.metadata_updater.update_vm_metadata(&vm, &plan.instance).await;
        plan.instance.bind_to_vm_model(vm);

        let agent = self.agent_client_for(&plan.instance);
        agent.wait_until_ready(AGENT_READY_DEADLINE).await?;

        let settings = plan.instance.update_trusted_certs(&self.trusted_certs);
        agent.update_settings(settings).await?;

        let cloud_properties = plan.instance.cloud_properties.clone();
        plan.instance.update_cloud_properties(cloud_properties);

        Ok(())
    }

    fn agent_client_for(&self, instance: &Instance) -> AgentClient {
        let vm = instance.vm.as_ref().expect("agent client requested before VM bound");
        AgentClient::new(
            vm.agent_id.clone(),
            self.config.bus().clone(),
            self.config.cancelled_handle(),
            self.sleeper.clone(),
            vm.credentials.clone(),
            self.resource_manager.clone(),
        )
    }
}
