//! Process-wide configuration, injected as trait objects rather than a global (Design Note 9).
//!
//! `Config` is immutable after construction except for `cancelled`, which is a read-only
//! observer callers poll cooperatively (spec §5). Every end-to-end scenario in spec §8 is
//! directly fakeable by swapping these fields.

use std::sync::Arc;

use crate::bus::Bus;
use crate::envelope::AgentCredentials;

/// Cooperative cancellation observer (`Config.job_cancelled?` in the spec).
pub trait Cancelled: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Never-cancelled observer, useful as a default in tests and simple embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancelled;

impl Cancelled for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Supplies per-VM credentials when encryption is enabled. Absent means the envelope layer
/// is skipped entirely for that VM.
pub trait CredentialsProvider: Send + Sync {
    fn generate(&self) -> AgentCredentials;
}

/// Default provider: fresh random key material per call, per [`AgentCredentials::generate`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCredentialsProvider;

impl CredentialsProvider for DefaultCredentialsProvider {
    fn generate(&self) -> AgentCredentials {
        AgentCredentials::generate()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroMaxThreads,
    ZeroMaxVmCreateTries,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroMaxThreads => write!(f, "max_threads must be > 0"),
            ConfigError::ZeroMaxVmCreateTries => write!(f, "max_vm_create_tries must be > 0"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process-wide, read-only configuration. Construct via [`ConfigBuilder`].
#[derive(Clone)]
pub struct Config {
    max_threads: usize,
    max_vm_create_tries: usize,
    encryption: Option<Arc<dyn CredentialsProvider>>,
    bus: Arc<dyn Bus>,
    cancelled: Arc<dyn Cancelled>,
}

impl Config {
    pub fn builder(bus: Arc<dyn Bus>) -> ConfigBuilder {
        ConfigBuilder::new(bus)
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn max_vm_create_tries(&self) -> usize {
        self.max_vm_create_tries
    }

    pub fn encryption(&self) -> Option<&Arc<dyn CredentialsProvider>> {
        self.encryption.as_ref()
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn job_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    pub fn cancelled_handle(&self) -> Arc<dyn Cancelled> {
        self.cancelled.clone()
    }
}

pub struct ConfigBuilder {
    max_threads: usize,
    max_vm_create_tries: usize,
    encryption: Option<Arc<dyn CredentialsProvider>>,
    bus: Arc<dyn Bus>,
    cancelled: Arc<dyn Cancelled>,
}

impl ConfigBuilder {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            max_threads: 1,
            max_vm_create_tries: 3,
            encryption: None,
            bus,
            cancelled: Arc::new(NeverCancelled),
        }
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn max_vm_create_tries(mut self, n: usize) -> Self {
        self.max_vm_create_tries = n;
        self
    }

    pub fn encryption(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.encryption = Some(provider);
        self
    }

    pub fn cancelled(mut self, cancelled: Arc<dyn Cancelled>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::ZeroMaxThreads);
        }
        if self.max_vm_create_tries == 0 {
            return Err(ConfigError::ZeroMaxVmCreateTries);
        }
        Ok(Config {
            max_threads: self.max_threads,
            max_vm_create_tries: self.max_vm_create_tries,
            encryption: self.encryption,
            bus: self.bus,
            cancelled: self.cancelled,
        })
    }
}
