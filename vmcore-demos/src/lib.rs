//! Ready-to-use recipes ("cookbook") for vmcore callers.
//!
//! These aren't knobs on the library itself — `vmcore` stays unopinionated about retry
//! schedules, bulkhead sizing, and telemetry routing. This crate is the set of defaults a
//! director process reaches for first, the way an application wires the library together
//! rather than something the library prescribes.
//!
//! **Ladder:**
//! - Simple: [`default_create_retry_policy`], [`default_rpc_timeout`]
//! - Intermediate: [`stdout_telemetry`]
//! - Advanced: [`InMemoryCloud`] (a toy CPI for demos and local smoke tests)

use std::sync::Arc;
use std::time::Duration;

use vmcore::{Backoff, Jitter, RetryPolicy, TokioSleeper};

/// A sensible default for CPI `create_vm` retries when composing your own wrapper around a
/// [`vmcore::Cpi`] implementation: 3 attempts, exponential backoff from 500ms, full jitter.
/// (`VmFactory`'s own retry loop is a fixed outcome-sum per Design Note 9 and does not use
/// this policy — this is for retrying the CPI call itself, e.g. around a flaky cloud API
/// client underneath your `Cpi` impl.)
pub fn default_create_retry_policy<E>() -> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    RetryPolicy::builder()
        .max_attempts(3)
        .expect("3 > 0")
        .backoff(Backoff::exponential(Duration::from_millis(500)))
        .with_jitter(Jitter::full())
        .with_sleeper(TokioSleeper::default())
        .build()
}

/// The outer deadline most directors use for a single non-long-running agent RPC, independent
/// of the per-method retry table in [`vmcore::agent::methods`].
pub fn default_rpc_timeout() -> Duration {
    Duration::from_secs(45)
}

/// Wires a [`vmcore::telemetry::TracingSink`] behind an `Arc`, ready to hand to
/// `VmFactory::with_telemetry` / `AgentClient::with_telemetry`.
pub fn stdout_telemetry() -> Arc<dyn vmcore::telemetry::TelemetrySink> {
    Arc::new(vmcore::telemetry::TracingSink)
}

pub mod in_memory_cloud;

pub use in_memory_cloud::InMemoryCloud;
