//! Data model shared by the VM factory, agent client, and VM creator.
//!
//! These types mirror the spec's §3 data model. Persistence and manifest parsing live
//! outside this crate; `Instance` and `InstancePlan` expose the narrow set of operations the
//! VM creation flow actually calls, as trait-implemented hooks so callers can back them with
//! whatever store they use.

use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::envelope::AgentCredentials;

/// Opaque, provider-specific properties passed through to the CPI untouched.
pub type CloudProperties = JsonValue;

/// Opaque nested environment map merged into the agent's boot environment.
pub type Env = JsonValue;

/// Reference to the owning deployment. Opaque beyond its id for this crate's purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeploymentRef {
    pub id: String,
    pub name: String,
}

/// Base OS image identified by a cloud-side id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stemcell {
    pub cid: String,
}

/// An IP reservation handed out by the (external) IP allocation policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpReservation {
    pub network: String,
    pub address: String,
}

/// One network attachment decision within an instance plan.
#[derive(Clone, Debug)]
pub struct NetworkPlan {
    pub reservation: IpReservation,
    /// Marked for release once this plan's VM is created successfully.
    pub obsolete: bool,
}

/// The desired-vs-actual instance this plan is provisioning, if one already exists.
#[derive(Clone, Debug)]
pub struct ExistingInstance {
    /// The apply spec last known to be running on the existing VM, restored verbatim on
    /// recreation instead of being recomputed (spec §4.E step 5).
    pub apply_spec: JsonValue,
    /// The existing VM's persistent disk cid, if it has one. This is the only disk identity
    /// passed to CPI `create_vm` for the replacement VM (spec §4.E step 2, Design Note 9's
    /// first open question) — further disks are attached post-creation by the disk manager.
    pub persistent_disk_cid: Option<String>,
}

/// Persistent VM record. `cid` is immutable once set; `agent_id` is generated locally and
/// never reused (spec invariant: agent ids are globally unique UUIDv4s).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmRecord {
    pub cid: String,
    pub agent_id: String,
    pub deployment: DeploymentRef,
    pub env: JsonValue,
    pub credentials: Option<AgentCredentials>,
    /// The apply spec currently believed to be running on this VM. `None` until either a
    /// fresh `apply_vm_state` or, on recreation, the restored `existing_apply_spec` is
    /// recorded onto it (spec §4.E step 5).
    pub apply_spec: Option<JsonValue>,
}

impl VmRecord {
    pub fn has_required_fields(&self) -> bool {
        !self.cid.is_empty() && !self.agent_id.is_empty()
    }
}

/// Identity plus desired state for one logical instance in a deployment.
#[derive(Clone, Debug)]
pub struct Instance {
    pub job: String,
    pub index: usize,
    pub deployment: DeploymentRef,
    pub stemcell: Stemcell,
    pub cloud_properties: CloudProperties,
    pub env: Env,
    pub vm: Option<VmRecord>,
}

impl Instance {
    pub fn new(
        job: impl Into<String>,
        index: usize,
        deployment: DeploymentRef,
        stemcell: Stemcell,
        cloud_properties: CloudProperties,
        env: Env,
    ) -> Self {
        Self { job: job.into(), index, deployment, stemcell, cloud_properties, env, vm: None }
    }

    /// `job/index/total` label used for worker naming and log correlation (spec §4.E).
    pub fn diagnostic_label(&self, total: usize) -> String {
        format!("{}/{}/{}", self.job, self.index, total)
    }

    /// Bind the freshly created VM to this instance record.
    pub fn bind_to_vm_model(&mut self, vm: VmRecord) {
        self.vm = Some(vm);
    }

    /// Merge trusted certificates into the instance's desired env, to be pushed to the agent
    /// via `update_settings`. Returns the settings payload the agent call should carry.
    pub fn update_trusted_certs(&mut self, trusted_certs: &str) -> JsonValue {
        if let JsonValue::Object(ref mut map) = self.env {
            map.insert("trusted_certs".into(), JsonValue::String(trusted_certs.to_string()));
        }
        serde_json::json!({ "env": self.env, "trusted_certs": trusted_certs })
    }

    /// Persist the (possibly CPI-normalized) cloud properties back onto this instance.
    pub fn update_cloud_properties(&mut self, cloud_properties: CloudProperties) {
        self.cloud_properties = cloud_properties;
    }

    /// Compute a fresh apply spec for this instance. A real deployment would fold in
    /// packages/jobs/links; here it is the instance's own env plus identity, which is enough
    /// for the agent client's `apply` call to act on.
    pub fn apply_vm_state(&self) -> JsonValue {
        serde_json::json!({
            "job": self.job,
            "index": self.index,
            "deployment": self.deployment.name,
            "env": self.env,
        })
    }

    /// Record the apply spec just pushed to the agent onto the bound `VmRecord`, whether it
    /// was freshly computed or restored from an existing instance on recreation (spec §4.E
    /// step 5).
    pub fn record_applied_spec(&mut self, apply_spec: JsonValue) {
        if let Some(vm) = self.vm.as_mut() {
            vm.apply_spec = Some(apply_spec);
        }
    }
}

/// The desired-vs-actual diff for one logical instance, as consumed by the VM creator.
#[derive(Clone, Debug)]
pub struct InstancePlan {
    pub instance: Instance,
    pub existing: Option<ExistingInstance>,
    pub network_plans: Vec<NetworkPlan>,
    needs_recreate: bool,
}

impl InstancePlan {
    pub fn new(instance: Instance, existing: Option<ExistingInstance>, needs_recreate: bool) -> Self {
        Self { instance, existing, network_plans: Vec::new(), needs_recreate }
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate && self.existing.is_some()
    }

    /// Current (non-obsolete) network settings, keyed by network name, for CPI `create_vm`.
    pub fn network_settings(&self) -> HashMap<String, JsonValue> {
        self.network_plans
            .iter()
            .filter(|p| !p.obsolete)
            .map(|p| {
                (
                    p.reservation.network.clone(),
                    serde_json::json!({ "ip": p.reservation.address }),
                )
            })
            .collect()
    }

    /// Network plans flagged obsolete, to be released after VM creation succeeds (spec
    /// invariant: released exactly once, strictly after CPI success).
    pub fn obsolete_reservations(&self) -> Vec<IpReservation> {
        self.network_plans.iter().filter(|p| p.obsolete).map(|p| p.reservation.clone()).collect()
    }

    /// Drop the released obsolete network plans from the plan's bookkeeping.
    pub fn release_obsolete_network_plans(&mut self) {
        self.network_plans.retain(|p| !p.obsolete);
    }

    /// Mark every remaining (desired) network plan as no longer provisional.
    pub fn mark_desired_network_plans_as_existing(&mut self) {
        for plan in &mut self.network_plans {
            plan.obsolete = false;
        }
    }
}
