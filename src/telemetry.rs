//! Domain telemetry events (SPEC_FULL §10): structured observability for VM creation and
//! agent RPC.
//!
//! This is independent of the [`crate::event_log`] stage interface — that trait is the
//! caller-supplied structured event-log UI (out of scope per spec §1); this module is the
//! crate's own instrumentation, grounded on the teacher's `telemetry::{PolicyEvent,
//! TelemetrySink}` shape but generalized from generic retry/circuit-breaker/bulkhead events to
//! this crate's own VM-provisioning and RPC events. Unlike the teacher's `tower::Service`-based
//! sink, emission here is synchronous and best-effort (mirrors [`crate::event_log::EventLog`]),
//! since nothing in this crate's domain needs backpressure on telemetry.

use std::sync::Mutex;
use std::time::Duration;

/// One observable occurrence in the VM creation or agent RPC flow.
#[derive(Debug, Clone, PartialEq)]
pub enum VmEvent {
    /// `VmFactory::create` obtained a cid from the CPI.
    Created { cid: String, agent_id: String },
    /// A CPI `create_vm` attempt failed with `ok_to_retry: true` and is being retried.
    CreateRetried { attempt: usize, message: String },
    /// `VmFactory::delete_vm` ran as failure compensation.
    Compensated { cid: String },
    /// An agent RPC call timed out and is being retried per its method's retry budget.
    RpcRetried { method: String, attempt: usize },
    /// An agent RPC call exhausted its retry budget (or had none) and raised `RpcTimeout`.
    RpcTimedOut { method: String, elapsed: Duration },
    /// `poll_task` slept and re-polled `get_task` once; a long-running apply/drain/compile
    /// waiting many minutes shows up here as a rising count rather than a gap in the logs.
    TaskPollIteration { agent_task_id: String },
}

/// Consumes [`VmEvent`]s. Implementations MUST NOT block the caller meaningfully — this is
/// fire-and-forget observability, not a durable log.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: VmEvent);
}

/// Discards every event. The default for callers that don't need telemetry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: VmEvent) {}
}

/// Emits each event as a `tracing::info!` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: VmEvent) {
        tracing::info!(?event, "vm_event");
    }
}

/// Records every event for test assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<VmEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<VmEvent> {
        self.events.lock().expect("MemorySink events lock poisoned").clone()
    }
}

impl TelemetrySink for MemorySink {
    fn emit(&self, event: VmEvent) {
        self.events.lock().expect("MemorySink events lock poisoned").push(event);
    }
}
