//! Provisions a small batch of VMs end to end against [`vmcore_demos::InMemoryCloud`] and an
//! in-process bus, with no real cloud account or NATS server required.
//!
//! Run with: `cargo run --example in_memory_batch_provisioning`

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use vmcore::bus::{Bus, InProcessBus};
use vmcore::config::Config;
use vmcore::event_log::MemoryEventLog;
use vmcore::model::{DeploymentRef, Instance, InstancePlan, IpReservation, Stemcell, VmRecord};
use vmcore::vm_creator::{DiskManager, IpReservationReleaser, MetadataUpdater, VmCreator, VmCreatorError, VmDeleter};
use vmcore::vm_factory::VmFactory;
use vmcore::{Cpi, InstantSleeper};
use vmcore_demos::InMemoryCloud;

struct NoopMetadataUpdater;
#[async_trait]
impl MetadataUpdater for NoopMetadataUpdater {
    async fn update_vm_metadata(&self, _vm: &VmRecord, _instance: &Instance) {}
}

struct NoopDiskManager;
#[async_trait]
impl DiskManager for NoopDiskManager {
    async fn attach_disks_for(&self, _instance: &Instance) -> Result<(), VmCreatorError> {
        Ok(())
    }
}

#[derive(Default)]
struct PrintingVmDeleter;
#[async_trait]
impl VmDeleter for PrintingVmDeleter {
    async fn delete_for_instance_plan(&self, plan: &InstancePlan) {
        if let Some(vm) = &plan.instance.vm {
            println!("compensating: deleting {}", vm.cid);
        }
    }
}

#[derive(Default)]
struct PrintingIpReleaser;
#[async_trait]
impl IpReservationReleaser for PrintingIpReleaser {
    async fn release(&self, reservation: &IpReservation) {
        println!("releasing unused reservation {:?}", reservation);
    }
}

fn instance(job: &str, index: usize) -> Instance {
    Instance::new(
        job,
        index,
        DeploymentRef { id: "dep-demo".into(), name: "demo-deployment".into() },
        Stemcell { cid: "stemcell-demo".into() },
        json!({}),
        json!({}),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let bus = Arc::new(InProcessBus::new());
    let bus_dyn: Arc<dyn Bus> = bus.clone();
    let config = Arc::new(Config::builder(bus_dyn).max_threads(3).build()?);

    let cloud: Arc<dyn Cpi> = Arc::new(InMemoryCloud::new());
    let factory = Arc::new(VmFactory::new(cloud, config.clone()).with_telemetry(vmcore_demos::stdout_telemetry()));

    let creator = VmCreator::new(
        factory,
        config,
        Arc::new(InstantSleeper),
        None,
        Arc::new(NoopMetadataUpdater),
        Arc::new(NoopDiskManager),
        "demo",
    );

    let plans: Vec<InstancePlan> =
        (0..3).map(|i| InstancePlan::new(instance("web", i), None, false)).collect();

    // Every worker's wait_until_ready() ping, plus update_settings and apply, need a reply.
    // A background task just keeps answering whatever is pending with a generic "pong" shape.
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
    let (plans, summary) = creator
        .create_for_instance_plans(
            plans,
            Arc::new(PrintingIpReleaser),
            Arc::new(PrintingVmDeleter),
            &event_log,
        )
        .await?;
    driver.await?;

    println!("created {} VM(s), {} failed", summary.created, summary.failed);
    let total = plans.len();
    for plan in &plans {
        if let Some(vm) = &plan.instance.vm {
            println!("{}: cid={}", plan.instance.diagnostic_label(total), vm.cid);
        }
    }

    Ok(())
}
