//! Convenient re-exports for common vmcore types.
pub use crate::{
    agent::{AgentClient, RpcError, RpcTask},
    backoff::Backoff,
    bulkhead::BulkheadPolicy,
    bus::{Bus, InProcessBus},
    clock::{Clock, MonotonicClock},
    config::Config,
    cpi::{Cpi, CpiError},
    envelope::{AgentCredentials, Envelope},
    jitter::Jitter,
    model::{
        CloudProperties, DeploymentRef, Env, ExistingInstance, Instance, InstancePlan,
        IpReservation, NetworkPlan, Stemcell, VmRecord,
    },
    retry::{BuildError, RetryPolicy, RetryPolicyBuilder},
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT},
    vm_creator::{VmCreator, VmCreatorError},
    vm_factory::VmFactory,
    worker_pool::WorkerPool,
    ResilienceError,
};
