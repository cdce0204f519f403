//! Prometheus metrics sink for `vmcore` (SPEC_FULL §10).
//!
//! Bring your own `prometheus::Registry`; counters are registered once at construction and
//! incremented as [`vmcore::telemetry::VmEvent`]s arrive. Unlike the teacher's
//! `tower::Service`-based sink, [`vmcore::telemetry::TelemetrySink::emit`] is a plain
//! synchronous call, so there is no `Service`/`poll_ready` machinery to carry here.

use std::sync::Arc;

use prometheus::{IntCounter, IntCounterVec, Registry};
use vmcore::telemetry::{TelemetrySink, VmEvent};

/// Counters for VM creation, compensation, CPI retry attempts, RPC retries/timeouts, and
/// long-running task poll iterations.
#[derive(Clone)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    vms_created: IntCounter,
    vms_compensated: IntCounter,
    cpi_create_retries: IntCounter,
    rpc_retries: IntCounterVec,
    rpc_timeouts: IntCounterVec,
    task_poll_iterations: IntCounter,
}

impl PrometheusSink {
    /// Create a sink and register its counters into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric name collides with one already registered.
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let vms_created = IntCounter::new("vmcore_vms_created_total", "VMs created via the CPI")?;
        let vms_compensated = IntCounter::new(
            "vmcore_vms_compensated_total",
            "VMs deleted as failure compensation after a partially completed create",
        )?;
        let cpi_create_retries =
            IntCounter::new("vmcore_cpi_create_retries_total", "Retried CPI create_vm attempts")?;
        let rpc_retries = IntCounterVec::new(
            prometheus::Opts::new("vmcore_rpc_retries_total", "Retried agent RPC calls, by method"),
            &["method"],
        )?;
        let rpc_timeouts = IntCounterVec::new(
            prometheus::Opts::new(
                "vmcore_rpc_timeouts_total",
                "Agent RPC calls that exhausted their retry budget, by method",
            ),
            &["method"],
        )?;
        let task_poll_iterations = IntCounter::new(
            "vmcore_task_poll_iterations_total",
            "poll_task wake-and-check-get_task iterations across all long-running RPCs",
        )?;

        registry.register(Box::new(vms_created.clone()))?;
        registry.register(Box::new(vms_compensated.clone()))?;
        registry.register(Box::new(cpi_create_retries.clone()))?;
        registry.register(Box::new(rpc_retries.clone()))?;
        registry.register(Box::new(rpc_timeouts.clone()))?;
        registry.register(Box::new(task_poll_iterations.clone()))?;

        Ok(Self {
            registry,
            vms_created,
            vms_compensated,
            cpi_create_retries,
            rpc_retries,
            rpc_timeouts,
            task_poll_iterations,
        })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl TelemetrySink for PrometheusSink {
    fn emit(&self, event: VmEvent) {
        match event {
            VmEvent::Created { .. } => self.vms_created.inc(),
            VmEvent::CreateRetried { .. } => self.cpi_create_retries.inc(),
            VmEvent::Compensated { .. } => self.vms_compensated.inc(),
            VmEvent::RpcRetried { method, .. } => {
                self.rpc_retries.with_label_values(&[&method]).inc()
            }
            VmEvent::RpcTimedOut { method, .. } => {
                self.rpc_timeouts.with_label_values(&[&method]).inc()
            }
            VmEvent::TaskPollIteration { .. } => self.task_poll_iterations.inc(),
        }
    }
}
