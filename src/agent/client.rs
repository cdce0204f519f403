//! Synchronous-façade agent RPC client (spec §4.C) — the largest component in this crate.
//!
//! Bridges the bus's callback-driven completion into `async fn` via [`Waiter`], applies the
//! method table's per-method retry policy, normalizes replies (exceptions, blob splicing,
//! unknown-message tolerance), and drives task polling for long-running agent operations.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::time::Instant;
use uuid::Uuid;

use super::error::RpcError;
use super::methods;
use super::task::{self, RpcTask};
use crate::blob::ResourceManager;
use crate::bus::{reply_subject, Bus, ReplyCallback, RequestId, Waiter};
use crate::config::Cancelled;
use crate::envelope::{AgentCredentials, Envelope};
use crate::sleeper::Sleeper;
use crate::telemetry::{NullSink, TelemetrySink, VmEvent};

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct AgentClient {
    agent_id: String,
    bus: Arc<dyn Bus>,
    cancelled: Arc<dyn Cancelled>,
    sleeper: Arc<dyn Sleeper>,
    envelope: Option<Envelope>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl AgentClient {
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn Bus>,
        cancelled: Arc<dyn Cancelled>,
        sleeper: Arc<dyn Sleeper>,
        credentials: Option<AgentCredentials>,
        resource_manager: Option<Arc<dyn ResourceManager>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            cancelled,
            sleeper,
            envelope: credentials.map(Envelope::new),
            resource_manager,
            telemetry: Arc::new(NullSink),
        }
    }

    /// Route this client's [`VmEvent`]s to `sink` instead of discarding them (SPEC_FULL §10).
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    fn subject(&self) -> String {
        reply_subject("agent", &self.agent_id)
    }

    /// Builds the `"unique_message_id <uuid>"` positional argument `get_state`/`fetch_logs`
    /// append for server-side dedup/trace correlation, logging the id alongside it (spec §6).
    fn unique_message_id_arg(&self) -> JsonValue {
        let id = Uuid::new_v4();
        tracing::debug!(agent_id = %self.agent_id, unique_message_id = %id, "tagging request with correlation id");
        json!(format!("unique_message_id {id}"))
    }

    fn build_payload(&self, method: &str, args: &[JsonValue]) -> JsonValue {
        let payload = json!({ "protocol": 3, "method": method, "arguments": args });
        match &self.envelope {
            Some(envelope) => envelope.encrypt(&payload),
            None => payload,
        }
    }

    /// One correlated request/reply round trip with a fresh deadline (spec §5: "timeouts are
    /// NOT inherited across retry attempts").
    async fn send_once(
        &self,
        method: &str,
        args: &[JsonValue],
        timeout: Duration,
    ) -> Result<JsonValue, RpcError> {
        let payload = self.build_payload(method, args);
        let (request_id, waiter) = Waiter::register(self.bus.as_ref(), &self.subject(), payload).await;
        let start = Instant::now();

        let reply = match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return Err(RpcError::Remote {
                    message: "bus closed without a reply".to_string(),
                    blob: None,
                })
            }
            Err(_) => {
                // Deadline expired: cancel the transport request so its callback/subscription
                // doesn't linger (spec §4.A/§4.C) — left unattended this accumulates across
                // retries, most visibly in wait_until_ready's ~600 timed-out pings.
                self.bus.cancel_request(&request_id).await;
                return Err(RpcError::Timeout { elapsed: start.elapsed(), timeout });
            }
        };

        let reply = match &self.envelope {
            Some(envelope) if Envelope::is_encrypted_reply(&reply) => {
                envelope.decrypt_or_crypt_error(&reply)
            }
            _ => reply,
        };

        task::normalize_reply(reply, self.resource_manager.as_deref()).await
    }

    /// The method table's entry point: looks up `{retries, timeout_override}` and retries
    /// only on `RpcTimeout` (spec §4.C).
    async fn call(&self, method: &str, args: Vec<JsonValue>) -> Result<JsonValue, RpcError> {
        let spec = methods::lookup(method);
        let timeout = spec.timeout_or_default();
        let attempts = spec.retries + 1;
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.send_once(method, &args, timeout).await {
                Ok(value) => return Ok(value),
                Err(RpcError::Timeout { elapsed, timeout }) if attempt < attempts => {
                    tracing::warn!(method, attempt, attempts, ?elapsed, "agent RPC timed out, retrying");
                    self.telemetry.emit(VmEvent::RpcRetried { method: method.to_string(), attempt });
                    last_err = Some(RpcError::Timeout { elapsed, timeout });
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(RpcError::Timeout { elapsed, .. }) = &last_err {
            self.telemetry.emit(VmEvent::RpcTimedOut { method: method.to_string(), elapsed: *elapsed });
        }
        Err(last_err.expect("loop always runs at least once"))
    }

    /// Poll `get_task(agent_task_id)` every 1.0 s until its state is no longer `"running"`
    /// (spec §4.C "Task polling"), honoring an optional outer deadline and, when
    /// `cancellable`, `Config.job_cancelled?` — sending a best-effort `cancel_task` before
    /// surfacing [`RpcError::Cancelled`] (spec §5, the `drain` cancellation path).
    async fn poll_task(
        &self,
        agent_task_id: &str,
        deadline: Option<(Instant, Duration)>,
        cancellable: bool,
    ) -> Result<JsonValue, RpcError> {
        loop {
            if cancellable && self.cancelled.is_cancelled() {
                if let Err(err) = self.call("cancel_task", vec![json!(agent_task_id)]).await {
                    tracing::warn!(agent_task_id, error = %err, "best-effort cancel_task failed");
                }
                return Err(RpcError::Cancelled);
            }
            if let Some((deadline, outer_timeout)) = deadline {
                if Instant::now() >= deadline {
                    return Err(RpcError::Timeout { elapsed: outer_timeout, timeout: outer_timeout });
                }
            }

            self.sleeper.sleep(TASK_POLL_INTERVAL).await;
            self.telemetry.emit(VmEvent::TaskPollIteration { agent_task_id: agent_task_id.to_string() });

            let reply = self.call("get_task", vec![json!(agent_task_id)]).await?;
            let state = reply.get("state").and_then(JsonValue::as_str).unwrap_or("done");
            if state != "running" {
                return Ok(reply.get("value").cloned().unwrap_or(reply));
            }
        }
    }

    async fn send_with_deadline(
        &self,
        method: &str,
        args: Vec<JsonValue>,
        deadline: Option<(Instant, Duration)>,
        cancellable: bool,
    ) -> Result<JsonValue, RpcError> {
        let value = self.call(method, args).await?;
        match RpcTask::from_value(value.clone()) {
            RpcTask::LongRunning { agent_task_id, state } if state == "running" => {
                self.poll_task(&agent_task_id, deadline, cancellable).await
            }
            RpcTask::LongRunning { .. } => Ok(value.get("value").cloned().unwrap_or(JsonValue::Null)),
            RpcTask::Terminal(value) => Ok(value),
        }
    }

    /// Standard blocking call: issues the RPC and, if the reply is a long-running task
    /// handle, polls until completion with no outer deadline.
    pub async fn send_message(&self, method: &str, args: Vec<JsonValue>) -> Result<JsonValue, RpcError> {
        self.send_with_deadline(method, args, None, false).await
    }

    /// As [`AgentClient::send_message`], but bounds the task-poll wait by `outer_timeout`
    /// (used by `stop` with a 300 s deadline — spec §4.C).
    pub async fn send_message_with_timeout(
        &self,
        method: &str,
        outer_timeout: Duration,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, RpcError> {
        let deadline = Instant::now() + outer_timeout;
        self.send_with_deadline(method, args, Some((deadline, outer_timeout)), false).await
    }

    /// As [`AgentClient::send_message`], but polls `Config.job_cancelled?` during the wait;
    /// on cancellation sends `cancel_task` and surfaces [`RpcError::Cancelled`] (used by
    /// `drain` — spec §4.C, §5).
    pub async fn send_cancellable_message(
        &self,
        method: &str,
        args: Vec<JsonValue>,
    ) -> Result<JsonValue, RpcError> {
        self.send_with_deadline(method, args, None, true).await
    }

    /// Issues the RPC and immediately cancels the reply subscription; any failure is logged,
    /// never raised (spec §4.C; used for `delete_arp_entries`).
    pub async fn fire_and_forget(&self, method: &str, args: Vec<JsonValue>) {
        let payload = self.build_payload(method, &args);
        let request_id = self.bus.send_request(&self.subject(), payload, Box::new(|_| {})).await;
        self.bus.cancel_request(&request_id).await;
    }

    /// Low-level send that hands the raw `request_id` back to the caller; the caller owns
    /// cancellation via [`AgentClient::cancel_sync_dns`] (spec §4.C). Unlike the other
    /// variants this does not decrypt or normalize the reply — it is intentionally "low
    /// level", matching the source's direct callback registration for `sync_dns`.
    pub async fn sync_dns(&self, args: Vec<JsonValue>, callback: ReplyCallback) -> RequestId {
        let payload = self.build_payload("sync_dns", &args);
        self.bus.send_request(&self.subject(), payload, callback).await
    }

    pub async fn cancel_sync_dns(&self, request_id: &str) {
        self.bus.cancel_request(request_id).await;
    }

    pub async fn ping(&self) -> Result<JsonValue, RpcError> {
        self.call("ping", vec![]).await
    }

    /// `get_state` appends a `"unique_message_id <uuid>"` positional argument for
    /// server-side dedup/trace correlation, and logs the id (spec §6).
    pub async fn get_state(&self) -> Result<JsonValue, RpcError> {
        self.send_message("get_state", vec![self.unique_message_id_arg()]).await
    }

    pub async fn apply(&self, spec: JsonValue) -> Result<JsonValue, RpcError> {
        self.send_message("apply", vec![spec]).await
    }

    pub async fn start(&self) -> Result<JsonValue, RpcError> {
        self.send_message("start", vec![]).await
    }

    /// `stop` with a 300 s outer deadline on the task poll; tolerates the agent's "Timed out
    /// waiting for service" shape by logging and swallowing rather than raising (spec §4.C).
    pub async fn stop(&self) -> Result<JsonValue, RpcError> {
        match self.send_message_with_timeout("stop", Duration::from_secs(300), vec![]).await {
            Err(RpcError::Remote { message, .. }) if task::is_stop_service_timeout(&message) => {
                tracing::warn!("stop timed out waiting for service, treating as complete");
                Ok(JsonValue::Null)
            }
            other => other,
        }
    }

    pub async fn prepare(&self, apply_spec: JsonValue) -> Result<JsonValue, RpcError> {
        self.send_message("prepare", vec![apply_spec]).await
    }

    /// `drain` is cancellable mid-task (spec §5 scenario 4).
    pub async fn drain(&self, drain_type: JsonValue) -> Result<JsonValue, RpcError> {
        self.send_cancellable_message("drain", vec![drain_type]).await
    }

    pub async fn compile_package(&self, args: Vec<JsonValue>) -> Result<JsonValue, RpcError> {
        self.send_message("compile_package", args).await
    }

    /// `fetch_logs` appends a `"unique_message_id <uuid>"` positional argument for
    /// server-side dedup/trace correlation, and logs the id (spec §6).
    pub async fn fetch_logs(&self, mut args: Vec<JsonValue>) -> Result<JsonValue, RpcError> {
        args.push(self.unique_message_id_arg());
        self.send_message("fetch_logs", args).await
    }

    pub async fn list_disk(&self) -> Result<JsonValue, RpcError> {
        self.send_message("list_disk", vec![]).await
    }

    pub async fn mount_disk(&self, cid: &str) -> Result<JsonValue, RpcError> {
        self.send_message("mount_disk", vec![json!(cid)]).await
    }

    pub async fn unmount_disk(&self, cid: &str) -> Result<JsonValue, RpcError> {
        self.send_message("unmount_disk", vec![json!(cid)]).await
    }

    pub async fn migrate_disk(&self, from_cid: &str, to_cid: &str) -> Result<JsonValue, RpcError> {
        self.send_message("migrate_disk", vec![json!(from_cid), json!(to_cid)]).await
    }

    pub async fn associate_disks(&self, args: Vec<JsonValue>) -> Result<JsonValue, RpcError> {
        self.send_message("associate_disks", args).await
    }

    /// Tolerates agents that reject a script hook as an unknown message: logs and swallows
    /// rather than raising (spec §4.C).
    pub async fn run_script(&self, name: &str, options: JsonValue) -> Result<JsonValue, RpcError> {
        match self.send_message("run_script", vec![json!(name), options]).await {
            Err(RpcError::Remote { message, .. }) if task::is_unknown_message(&message) => {
                tracing::warn!(script = name, "agent does not recognize run_script, skipping");
                Ok(JsonValue::Null)
            }
            other => other,
        }
    }

    pub async fn run_errand(&self) -> Result<JsonValue, RpcError> {
        self.send_cancellable_message("run_errand", vec![]).await
    }

    /// Tolerates agents that reject `update_settings` as an unknown message (spec §4.C,
    /// scenario 5): logs and swallows, pipeline continues.
    pub async fn update_settings(&self, settings: JsonValue) -> Result<JsonValue, RpcError> {
        match self.send_message("update_settings", vec![settings]).await {
            Err(RpcError::Remote { message, .. }) if task::is_unknown_message(&message) => {
                tracing::warn!("agent does not recognize update_settings, skipping");
                Ok(JsonValue::Null)
            }
            other => other,
        }
    }

    /// Unlike `update_settings`/`run_script`, an unknown-message rejection of `upload_blob`
    /// is raised as a distinct error rather than swallowed (spec §4.C).
    pub async fn upload_blob(&self, blob: JsonValue) -> Result<JsonValue, RpcError> {
        match self.call("upload_blob", vec![blob]).await {
            Err(RpcError::Remote { message, .. }) if task::is_unknown_message(&message) => {
                Err(RpcError::UnsupportedAction("upload_blob".to_string()))
            }
            other => other,
        }
    }

    pub async fn delete_arp_entries(&self, ips: Vec<JsonValue>) {
        self.fire_and_forget("delete_arp_entries", vec![json!(ips)]).await
    }

    pub async fn cancel_task(&self, agent_task_id: &str) -> Result<JsonValue, RpcError> {
        self.call("cancel_task", vec![json!(agent_task_id)]).await
    }

    /// Polls `ping` with a 1.0 s per-request timeout until it succeeds or `deadline` (default
    /// 600 s) elapses (spec §4.C, §5). Per Design Note 9's open question, `Config.job_cancelled?`
    /// is observed once before the first attempt and again only when a `RpcTimeout` fires
    /// between retries — not on every wakeup — preserving the source's slightly lazy
    /// cancellation semantics rather than tightening them.
    pub async fn wait_until_ready(&self, deadline: Duration) -> Result<(), RpcError> {
        if self.cancelled.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        const PER_PING_TIMEOUT: Duration = Duration::from_secs(1);
        let start = Instant::now();

        loop {
            match self.send_once("ping", &[], PER_PING_TIMEOUT).await {
                Ok(_) => return Ok(()),
                Err(RpcError::Timeout { .. }) => {
                    if start.elapsed() >= deadline {
                        return Err(RpcError::Timeout { elapsed: start.elapsed(), timeout: deadline });
                    }
                    if self.cancelled.is_cancelled() {
                        return Err(RpcError::Cancelled);
                    }
                }
                Err(RpcError::Remote { message, .. }) if message.starts_with("restarting agent") => {
                    if start.elapsed() >= deadline {
                        return Err(RpcError::Timeout { elapsed: start.elapsed(), timeout: deadline });
                    }
                    self.sleeper.sleep(Duration::from_millis(200)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::config::NeverCancelled;
    use crate::sleeper::InstantSleeper;

    fn client(bus: Arc<InProcessBus>) -> AgentClient {
        AgentClient::new(
            "agent-1",
            bus,
            Arc::new(NeverCancelled),
            Arc::new(InstantSleeper),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn ping_resolves_when_bus_replies() {
        let bus = Arc::new(InProcessBus::new());
        let client = client(bus.clone());

        let call = tokio::spawn({
            let client = Arc::new(client);
            let client = client.clone();
            async move { client.ping().await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": "pong"}));

        assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn apply_polls_get_task_until_done() {
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.apply(json!({"job": "web"})).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": {"agent_task_id": "t-1", "state": "running"}}));

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": {"state": "done", "value": {"applied": true}}}));

        assert_eq!(call.await.unwrap().unwrap(), json!({"applied": true}));
    }

    #[tokio::test]
    async fn exception_reply_surfaces_as_remote_error() {
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"exception": {"message": "could not start"}}));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Remote { .. }));
    }

    #[tokio::test]
    async fn update_settings_swallows_unknown_message() {
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.update_settings(json!({})).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"exception": {"message": "unknown message update_settings"}}));

        assert_eq!(call.await.unwrap().unwrap(), JsonValue::Null);
    }

    #[tokio::test]
    async fn upload_blob_raises_unsupported_action_on_unknown_message() {
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.upload_blob(json!({})).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"exception": {"message": "unknown message upload_blob"}}));

        assert!(matches!(call.await.unwrap().unwrap_err(), RpcError::UnsupportedAction(_)));
    }

    #[tokio::test]
    async fn wait_until_ready_returns_ok_once_ping_succeeds() {
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.wait_until_ready(Duration::from_secs(5)).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": "pong"}));

        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_until_ready_times_out_when_agent_never_replies() {
        tokio::time::pause();
        let bus = Arc::new(InProcessBus::new());
        let client = Arc::new(client(bus.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.wait_until_ready(Duration::from_millis(10)).await }
        });

        tokio::time::advance(Duration::from_millis(20)).await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
    }

    #[tokio::test]
    async fn fire_and_forget_detaches_immediately() {
        let bus = Arc::new(InProcessBus::new());
        let client = client(bus.clone());

        client.delete_arp_entries(vec![json!("10.0.0.1")]).await;
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn sync_dns_returns_request_id_caller_can_cancel() {
        let bus = Arc::new(InProcessBus::new());
        let client = client(bus.clone());

        let request_id = client.sync_dns(vec![json!([])], Box::new(|_| {})).await;
        assert_eq!(bus.pending_count(), 1);
        client.cancel_sync_dns(&request_id).await;
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn emits_poll_iteration_telemetry_for_each_get_task_round_trip() {
        use crate::telemetry::MemorySink;

        let bus = Arc::new(InProcessBus::new());
        let sink = Arc::new(MemorySink::new());
        let client = Arc::new(client(bus.clone()).with_telemetry(sink.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.apply(json!({"job": "web"})).await }
        });

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": {"agent_task_id": "t-1", "state": "running"}}));

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": {"agent_task_id": "t-1", "state": "running"}}));

        while bus.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        bus.reply_to_any(json!({"value": {"state": "done", "value": {"applied": true}}}));

        assert_eq!(call.await.unwrap().unwrap(), json!({"applied": true}));
        assert_eq!(
            sink.events(),
            vec![
                VmEvent::TaskPollIteration { agent_task_id: "t-1".into() },
                VmEvent::TaskPollIteration { agent_task_id: "t-1".into() },
            ]
        );
    }

    #[tokio::test]
    async fn emits_rpc_timed_out_telemetry_when_a_call_exhausts_its_deadline() {
        use crate::telemetry::MemorySink;

        tokio::time::pause();
        let bus = Arc::new(InProcessBus::new());
        let sink = Arc::new(MemorySink::new());
        let client = Arc::new(client(bus.clone()).with_telemetry(sink.clone()));

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.wait_until_ready(Duration::from_millis(10)).await }
        });

        tokio::time::advance(Duration::from_millis(20)).await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(sink
            .events()
            .iter()
            .any(|event| matches!(event, VmEvent::RpcTimedOut { method, .. } if method == "ping")));
    }
}
