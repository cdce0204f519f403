//! Timeout policy for bounding async operation duration.
//!
//! Semantics
//! - Wraps an async operation and returns `ResilienceError::Timeout` when the deadline elapses.
//! - Uses `tokio::time::timeout`; on timeout the inner future is dropped (not forcibly aborted),
//!   so cancellation-unsafe work may leave partial state. Prefer cancellation-safe primitives or
//!   cooperative cancellation if that matters.
//! - Elapsed is measured from just before invoking the closure to timeout firing and can be
//!   slightly greater than the configured duration due to scheduling/timeout detection overhead.
//! - Requires a Tokio runtime.
//!
//! Invariants:
//! - Duration must be > 0 and ≤ configured maximum.
//! - Successful operations pass through untouched.
//! - Timeouts return `ResilienceError::Timeout` with elapsed ≥ configured timeout.
//!
//! Example
//! ```
//! use vmcore::{ResilienceError, TimeoutPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
//!
//!     let result: Result<_, ResilienceError<std::io::Error>> = timeout
//!         .execute(|| async {
//!             tokio::time::sleep(Duration::from_millis(200)).await;
//!             Ok::<_, ResilienceError<std::io::Error>>(())
//!         })
//!         .await;
//!
//!     match result {
//!         Ok(_) => println!("done"),
//!         Err(e) if e.is_timeout() => {
//!             println!("timed out after {:?}", e.timeout_details().unwrap().1)
//!         }
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```

use crate::ResilienceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum allowed timeout duration (30 days) to avoid runaway timers while permitting long jobs.
/// Intended to guard accidental timeouts of `u64::MAX`; override via [`TimeoutPolicy::new_with_max`]
/// when longer horizons are required.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Errors returned when configuring timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    /// Duration must be greater than zero.
    ZeroDuration,
    /// Duration exceeded configured maximum.
    ExceedsMaximum {
        /// Duration requested by caller.
        requested: Duration,
        /// Maximum allowed duration for this construction.
        limit: Duration,
    },
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutError::ZeroDuration => write!(f, "timeout duration must be > 0"),
            TimeoutError::ExceedsMaximum { requested, limit } => write!(
                f,
                "timeout duration {:?} exceeds maximum allowed {:?}; use new_with_max to override",
                requested, limit
            ),
        }
    }
}

impl std::error::Error for TimeoutError {}

/// Policy that enforces a maximum duration on async operations.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Creates a timeout policy with the specified duration.
    ///
    /// # Errors
    ///
    /// Returns [`TimeoutError::ZeroDuration`] if `duration` is zero.
    /// Returns [`TimeoutError::ExceedsMaximum`] if `duration` exceeds [`MAX_TIMEOUT`].
    #[must_use = "the result must be checked for validation errors"]
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        Self::new_with_max(duration, MAX_TIMEOUT)
    }

    /// Construct with a caller-specified maximum allowed timeout.
    pub fn new_with_max(duration: Duration, max: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::ZeroDuration);
        }
        if duration > max {
            return Err(TimeoutError::ExceedsMaximum { requested: duration, limit: max });
        }
        Ok(Self { duration })
    }

    /// Returns the configured timeout duration.
    #[must_use]
    #[inline]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Execute an operation with a timeout.
    ///
    /// - Returns `Ok(T)` when the operation finishes before the deadline.
    /// - Returns `Err(ResilienceError::Timeout { elapsed, timeout })` when the deadline elapses.
    /// - On timeout, the inner future is dropped (Tokio does not forcibly abort); ensure the
    ///   operation is cancellation-safe if partial work matters.
    /// - `elapsed` is measured from before the operation is invoked and can exceed `timeout`
    ///   slightly due to scheduling/timeout detection overhead.
    ///
    /// # Examples
    /// ```
    /// use vmcore::{ResilienceError, TimeoutPolicy};
    /// use std::time::Duration;
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let timeout = TimeoutPolicy::new(Duration::from_millis(20)).unwrap();
    /// let ok = timeout.execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) }).await;
    /// assert_eq!(ok.unwrap(), 42);
    /// let timed_out = timeout.execute(|| async {
    ///     tokio::time::sleep(Duration::from_millis(100)).await;
    ///     Ok::<_, ResilienceError<std::io::Error>>(())
    /// }).await;
    /// assert!(timed_out.unwrap_err().is_timeout());
    /// # });
    /// ```
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                Err(ResilienceError::Timeout { elapsed, timeout: self.duration })
            }
        }
    }
}
