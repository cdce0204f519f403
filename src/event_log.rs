//! Event-log stage interface consumed by the VM creator (spec §4.E).
//!
//! The structured event-log UI itself is out of scope (spec §1) — this crate only needs a
//! stage it can open, advance, and close. A tracing-backed implementation is the default for
//! local runs; an in-memory implementation backs tests.

use std::sync::{Arc, Mutex};

/// One step of a named progress stage (e.g. "Creating missing vms"). Shared (`Arc`) rather
/// than uniquely owned because every worker in the batch advances the same stage
/// concurrently (spec §4.E: the stage is "sized to the number of plans", not to one worker).
pub trait EventLogStage: Send + Sync {
    /// Record one unit of work starting, labelled for diagnostics (spec §4.E: "job/index/total").
    fn advance(&self, label: &str);

    /// Mark the stage complete.
    fn finish(&self);
}

/// Opens named stages sized to an expected unit count.
pub trait EventLog: Send + Sync {
    fn begin_stage(&self, name: &str, total: usize) -> Arc<dyn EventLogStage>;
}

/// Emits `tracing` events for stage progress; the default for local/production runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn begin_stage(&self, name: &str, total: usize) -> Arc<dyn EventLogStage> {
        tracing::info!(stage = name, total, "event-log stage opened");
        Arc::new(TracingStage { name: name.to_string(), total })
    }
}

struct TracingStage {
    name: String,
    total: usize,
}

impl EventLogStage for TracingStage {
    fn advance(&self, label: &str) {
        tracing::debug!(stage = %self.name, total = self.total, label, "event-log stage advanced");
    }

    fn finish(&self) {
        tracing::info!(stage = %self.name, "event-log stage finished");
    }
}

/// Records every `advance`/`finish` call for test assertions.
#[derive(Default)]
pub struct MemoryEventLog {
    stages: Mutex<Vec<(String, usize)>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self) -> Vec<(String, usize)> {
        self.stages.lock().unwrap().clone()
    }
}

impl EventLog for MemoryEventLog {
    fn begin_stage(&self, name: &str, total: usize) -> Arc<dyn EventLogStage> {
        self.stages.lock().unwrap().push((name.to_string(), total));
        Arc::new(MemoryStage { advanced: Mutex::new(Vec::new()), finished: Mutex::new(false) })
    }
}

pub struct MemoryStage {
    advanced: Mutex<Vec<String>>,
    finished: Mutex<bool>,
}

impl MemoryStage {
    pub fn advanced_labels(&self) -> Vec<String> {
        self.advanced.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.lock().unwrap()
    }
}

impl EventLogStage for MemoryStage {
    fn advance(&self, label: &str) {
        self.advanced.lock().unwrap().push(label.to_string());
    }

    fn finish(&self) {
        *self.finished.lock().unwrap() = true;
    }
}
