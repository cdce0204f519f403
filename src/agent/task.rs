//! Reply shape and response normalization for the agent client (spec §3 `RpcTask`, §4.C
//! "Response normalization").

use serde_json::Value as JsonValue;

use super::error::RpcError;
use crate::blob::{download_and_delete_blob, ResourceManager};

/// The agent's reply shape once unwrapped from `{value: ...}` or `{exception: ...}`: either a
/// terminal value or a long-running task handle to be polled via `get_task`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcTask {
    Terminal(JsonValue),
    LongRunning { agent_task_id: String, state: String },
}

impl RpcTask {
    pub fn from_value(value: JsonValue) -> Self {
        if let JsonValue::Object(ref map) = value {
            if let Some(id) = map.get("agent_task_id").and_then(JsonValue::as_str) {
                let state = map.get("state").and_then(JsonValue::as_str).unwrap_or("running").to_string();
                return RpcTask::LongRunning { agent_task_id: id.to_string(), state };
            }
        }
        RpcTask::Terminal(value)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RpcTask::LongRunning { state, .. } if state == "running")
    }
}

/// True when an agent's rejection message matches the "unknown message <name>" shape the
/// source tolerates for a fixed set of methods (spec §4.C).
pub fn is_unknown_message(message: &str) -> bool {
    message.contains("unknown message")
}

/// True for `stop`'s documented timeout-tolerance message.
pub fn is_stop_service_timeout(message: &str) -> bool {
    message.contains("Timed out waiting for service")
}

/// Turn a raw (already decrypted) bus reply into either the unwrapped `value` or an
/// `RpcError::Remote`, per spec §4.C: exception messages are `message + "\n" +
/// backtrace.join("\n")` with any blob's contents appended; `compile_log_id` results are
/// spliced with the downloaded log before being returned.
pub async fn normalize_reply(
    reply: JsonValue,
    resource_manager: Option<&dyn ResourceManager>,
) -> Result<JsonValue, RpcError> {
    if let Some(exception) = reply.get("exception") {
        return Err(exception_to_error(exception, resource_manager).await);
    }

    let mut value = reply.get("value").cloned().unwrap_or(JsonValue::Null);
    splice_compile_log(&mut value, resource_manager).await;
    Ok(value)
}

async fn exception_to_error(
    exception: &JsonValue,
    resource_manager: Option<&dyn ResourceManager>,
) -> RpcError {
    let message = exception.get("message").and_then(JsonValue::as_str).unwrap_or("").to_string();
    let backtrace = exception
        .get("backtrace")
        .and_then(JsonValue::as_array)
        .map(|lines| lines.iter().filter_map(JsonValue::as_str).collect::<Vec<_>>().join("\n"))
        .unwrap_or_default();

    let mut full_message = message;
    if !backtrace.is_empty() {
        full_message.push('\n');
        full_message.push_str(&backtrace);
    }

    let mut blob = None;
    if let Some(blobstore_id) = exception.get("blobstore_id").and_then(JsonValue::as_str) {
        if let Some(resource_manager) = resource_manager {
            match download_and_delete_blob(resource_manager, blobstore_id).await {
                Ok(bytes) => {
                    full_message.push('\n');
                    full_message.push_str(&String::from_utf8_lossy(&bytes));
                    blob = Some(bytes);
                }
                Err(err) => {
                    tracing::warn!(blobstore_id, error = %err, "failed to fetch exception blob");
                }
            }
        }
    }

    RpcError::Remote { message: full_message, blob }
}

async fn splice_compile_log(value: &mut JsonValue, resource_manager: Option<&dyn ResourceManager>) {
    let Some(resource_manager) = resource_manager else { return };
    let Some(compile_log_id) =
        value.pointer("/result/compile_log_id").and_then(JsonValue::as_str).map(str::to_string)
    else {
        return;
    };

    match download_and_delete_blob(resource_manager, &compile_log_id).await {
        Ok(bytes) => {
            if let Some(result) = value.get_mut("result") {
                result["compile_log"] = JsonValue::String(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        Err(err) => {
            tracing::warn!(compile_log_id, error = %err, "failed to fetch compile log blob");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::fakes::FakeResourceManager;
    use serde_json::json;

    #[test]
    fn terminal_value_is_not_a_task_handle() {
        let task = RpcTask::from_value(json!({"state": "done", "value": null}));
        assert!(matches!(task, RpcTask::Terminal(_)));
    }

    #[test]
    fn long_running_value_extracts_task_id_and_state() {
        let task = RpcTask::from_value(json!({"agent_task_id": "t-1", "state": "running"}));
        assert_eq!(task, RpcTask::LongRunning { agent_task_id: "t-1".into(), state: "running".into() });
        assert!(task.is_running());
    }

    #[tokio::test]
    async fn normalizes_plain_value_reply() {
        let value = normalize_reply(json!({"value": {"foo": "bar"}}), None).await.unwrap();
        assert_eq!(value, json!({"foo": "bar"}));
    }

    #[tokio::test]
    async fn exception_reply_formats_message_and_backtrace() {
        let err = normalize_reply(
            json!({"exception": {"message": "boom", "backtrace": ["line1", "line2"]}}),
            None,
        )
        .await
        .unwrap_err();

        match err {
            RpcError::Remote { message, blob } => {
                assert_eq!(message, "boom\nline1\nline2");
                assert!(blob.is_none());
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exception_with_blobstore_id_appends_and_deletes_blob() {
        let manager = FakeResourceManager::with_blob("blob-1", b"stack trace detail".to_vec());
        let err = normalize_reply(
            json!({"exception": {"message": "boom", "blobstore_id": "blob-1"}}),
            Some(&manager),
        )
        .await
        .unwrap_err();

        match err {
            RpcError::Remote { message, blob } => {
                assert!(message.contains("stack trace detail"));
                assert_eq!(blob.unwrap(), b"stack trace detail");
            }
            other => panic!("expected Remote, got {other:?}"),
        }
        assert_eq!(manager.deleted_ids(), vec!["blob-1"]);
    }

    #[tokio::test]
    async fn splices_compile_log_into_value_result() {
        let manager = FakeResourceManager::with_blob("log-1", b"compiled ok".to_vec());
        let value = normalize_reply(
            json!({"value": {"result": {"compile_log_id": "log-1"}}}),
            Some(&manager),
        )
        .await
        .unwrap();

        assert_eq!(value["result"]["compile_log"], "compiled ok");
        assert_eq!(manager.deleted_ids(), vec!["log-1"]);
    }

    #[test]
    fn detects_unknown_message_and_stop_timeout_shapes() {
        assert!(is_unknown_message("unknown message update_settings"));
        assert!(!is_unknown_message("boom"));
        assert!(is_stop_service_timeout("Timed out waiting for service to stop"));
    }
}
