//! Explicit method table (Design Note 9): a fixed mapping from RPC method name to its retry
//! count and optional timeout override, replacing the source's dynamic method-name
//! interception with a single `call(name, args)` entry point over a closed list.

use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    /// Additional attempts after the first, applied to `RpcTimeout` only (spec §4.C).
    pub retries: usize,
    /// Per-request timeout; `None` means [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
}

impl MethodSpec {
    pub const fn default_spec() -> Self {
        Self { retries: 0, timeout: None }
    }

    pub fn timeout_or_default(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// Recognized defaults `{get_state: 2, get_task: 2, upload_blob: 3}`; everything else gets 0
/// retries and the default 45 s timeout.
pub fn lookup(method: &str) -> MethodSpec {
    match method {
        "get_state" => MethodSpec { retries: 2, timeout: None },
        "get_task" => MethodSpec { retries: 2, timeout: None },
        "upload_blob" => MethodSpec { retries: 3, timeout: None },
        _ => MethodSpec::default_spec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_defaults_match_spec() {
        assert_eq!(lookup("get_state").retries, 2);
        assert_eq!(lookup("get_task").retries, 2);
        assert_eq!(lookup("upload_blob").retries, 3);
    }

    #[test]
    fn unlisted_methods_get_zero_retries() {
        assert_eq!(lookup("apply").retries, 0);
        assert_eq!(lookup("ping").retries, 0);
    }

    #[test]
    fn default_timeout_is_45_seconds() {
        assert_eq!(lookup("ping").timeout_or_default(), Duration::from_secs(45));
    }
}
