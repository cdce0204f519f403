//! Error taxonomy for the agent client (spec §4.C response normalization, §7).

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request's deadline elapsed without a reply (spec: `RpcTimeout`).
    #[error("agent RPC timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    /// The agent replied with `{exception: {...}}` (spec: `RpcRemoteException`). `message` is
    /// already formatted as `message + "\n" + backtrace.join("\n")`, with any referenced
    /// blob's contents appended.
    #[error("agent raised: {message}")]
    Remote { message: String, blob: Option<Vec<u8>> },

    /// The agent rejected `upload_blob` as an unknown message (spec: `AgentUnsupportedAction`;
    /// the same "unknown message" shape for `update_settings`/`run_script`/`stop` is instead
    /// logged and swallowed, not raised).
    #[error("agent does not support action: {0}")]
    UnsupportedAction(String),

    /// `Config.job_cancelled?` observed true while a long-running task was in flight (spec:
    /// `TaskCancelled`).
    #[error("task cancelled")]
    Cancelled,

    /// Envelope decryption failed for an inbound reply.
    #[error("encrypted reply could not be decrypted: {0}")]
    Crypt(String),
}
