//! End-to-end batch scenarios (spec §8), driving the public `VmCreator` surface against an
//! in-process bus and a fake CPI — no real cloud or NATS dependency, matching how the teacher
//! places its cross-module integration tests in `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use vmcore::config::Config;
use vmcore::cpi::{Cpi, CpiError};
use vmcore::event_log::MemoryEventLog;
use vmcore::model::{DeploymentRef, Instance, InstancePlan, IpReservation, Stemcell, VmRecord};
use vmcore::vm_creator::{DiskManager, IpReservationReleaser, MetadataUpdater, VmCreator, VmCreatorError, VmDeleter};
use vmcore::bus::{Bus, InProcessBus};
use vmcore::vm_factory::VmFactory;

#[derive(Default)]
struct FakeCpi {
    created: AtomicUsize,
}

#[async_trait]
impl Cpi for FakeCpi {
    async fn create_vm(
        &self,
        _agent_id: &str,
        _stemcell_cid: &str,
        _cloud_properties: &JsonValue,
        _network_settings: &HashMap<String, JsonValue>,
        _disks: &[String],
        _env: &JsonValue,
    ) -> Result<String, CpiError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("vm-{n}"))
    }

    async fn delete_vm(&self, _cid: &str) -> Result<(), CpiError> {
        Ok(())
    }
}

#[derive(Default)]
struct NoopMetadataUpdater;

#[async_trait]
impl MetadataUpdater for NoopMetadataUpdater {
    async fn update_vm_metadata(&self, _vm: &VmRecord, _instance: &Instance) {}
}

#[derive(Default)]
struct NoopDiskManager;

#[async_trait]
impl DiskManager for NoopDiskManager {
    async fn attach_disks_for(&self, _instance: &Instance) -> Result<(), VmCreatorError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingVmDeleter {
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl VmDeleter for RecordingVmDeleter {
    async fn delete_for_instance_plan(&self, plan: &InstancePlan) {
        if let Some(vm) = &plan.instance.vm {
            self.deleted.lock().unwrap().push(vm.cid.clone());
        }
    }
}

#[derive(Default)]
struct RecordingIpReleaser {
    released: Mutex<Vec<IpReservation>>,
}

#[async_trait]
impl IpReservationReleaser for RecordingIpReleaser {
    async fn release(&self, reservation: &IpReservation) {
        self.released.lock().unwrap().push(reservation.clone());
    }
}

fn instance(job: &str, index: usize) -> Instance {
    Instance::new(
        job,
        index,
        DeploymentRef { id: "dep-1".into(), name: "my-deployment".into() },
        Stemcell { cid: "stemcell-1".into() },
        json!({}),
        json!({}),
    )
}

/// Scenario 1 (spec §8): happy path with N=3 plans. The bus driver replies to `ping`,
/// `update_settings`, and `apply` for each of the three workers; all three should end up with
/// a bound VM record and no compensating deletes.
#[tokio::test]
async fn happy_path_three_plans_creates_three_vms_with_no_deletes() {
    let bus = Arc::new(InProcessBus::new());
    let bus_dyn: Arc<dyn Bus> = bus.clone();
    let config = Arc::new(Config::builder(bus_dyn).max_threads(3).build().unwrap());
    let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::default());
    let factory = Arc::new(VmFactory::new(cpi, config.clone()));
    let creator = VmCreator::new(
        factory,
        config,
        Arc::new(vmcore::InstantSleeper),
        None,
        Arc::new(NoopMetadataUpdater),
        Arc::new(NoopDiskManager),
        "",
    );

    let plans: Vec<InstancePlan> =
        (0..3).map(|i| InstancePlan::new(instance("web", i), None, false)).collect();

    // Each worker issues ping -> update_settings -> apply, in that order, over its own
    // correlated request. The driver just keeps answering whatever is pending with a shape
    // that makes every one of those three calls succeed immediately.
    let driver = tokio::spawn({
        let bus = bus.clone();
        async move {
            let mut answered = 0;
            while answered < 9 {
                if bus.reply_to_any(json!({"value": "pong"})) {
                    answered += 1;
                } else {
                    tokio::task::yield_now().await;
                }
            }
        }
    });

    let event_log = MemoryEventLog::new();
    let deleter: Arc<dyn VmDeleter> = Arc::new(RecordingVmDeleter::default());
    let releaser: Arc<dyn IpReservationReleaser> = Arc::new(RecordingIpReleaser::default());

    let (plans, summary) =
        creator.create_for_instance_plans(plans, releaser, deleter.clone(), &event_log).await.unwrap();

    driver.await.unwrap();

    assert_eq!(summary.created, 3);
    assert_eq!(summary.failed, 0);
    for plan in &plans {
        assert!(plan.instance.vm.is_some());
    }
    assert_eq!(event_log.stages(), vec![("Creating missing vms".to_string(), 3)]);
}

/// Scenario 3 (spec §8): the agent never replies to `ping`. `wait_until_ready` must time out,
/// the VM creator must compensate by deleting the VM, and the plan is left without one.
#[tokio::test]
async fn agent_never_ready_compensates_and_leaves_plan_without_a_vm() {
    tokio::time::pause();

    let bus = Arc::new(InProcessBus::new());
    let bus_dyn: Arc<dyn Bus> = bus;
    let config = Arc::new(Config::builder(bus_dyn).max_threads(1).build().unwrap());
    let cpi: Arc<dyn Cpi> = Arc::new(FakeCpi::default());
    let factory = Arc::new(VmFactory::new(cpi, config.clone()));
    let creator = VmCreator::new(
        factory,
        config,
        Arc::new(vmcore::InstantSleeper),
        None,
        Arc::new(NoopMetadataUpdater),
        Arc::new(NoopDiskManager),
        "",
    );

    let plan = InstancePlan::new(instance("web", 0), None, false);
    let event_log = MemoryEventLog::new();
    let deleter = Arc::new(RecordingVmDeleter::default());
    let deleter_dyn: Arc<dyn VmDeleter> = deleter.clone();
    let releaser: Arc<dyn IpReservationReleaser> = Arc::new(RecordingIpReleaser::default());

    let run = tokio::spawn(async move {
        creator.create_for_instance_plans(vec![plan], releaser, deleter_dyn, &event_log).await
    });

    tokio::time::advance(Duration::from_secs(601)).await;

    let result = run.await.unwrap();
    assert!(result.is_err(), "batch must surface the compensated plan's failure");
    assert_eq!(deleter.deleted.lock().unwrap().len(), 1);
}
