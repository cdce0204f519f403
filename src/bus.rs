//! Bus RPC transport (spec §4.A).
//!
//! Correlated request/reply over a pub/sub bus. The transport is opaque to payload
//! semantics — it ships JSON-shaped maps and invokes a completion callback when a reply
//! lands on the request's dedicated reply subject. It never shares callbacks across clients;
//! each `send_request` gets its own correlation id and its own subscription.
//!
//! The production backing (NATS) lives in the sibling `vmcore-nats` crate; this module
//! defines the trait contract plus an in-process implementation used by tests and by callers
//! who don't need a real bus (e.g. embedding multiple directors and agents in one process).

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Opaque request identifier, unique per `send_request` call.
pub type RequestId = String;

/// A callback invoked exactly once when a reply arrives on the request's reply subject.
pub type ReplyCallback = Box<dyn FnOnce(JsonValue) + Send>;

/// Subjects are formed as `<service>.<client_id>` (spec §4.A).
pub fn reply_subject(service: &str, client_id: &str) -> String {
    format!("{service}.{client_id}")
}

/// The bus transport contract. Implementations MUST NOT interpret payload semantics.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `payload` to `subject`, registering `on_reply` against the request's reply
    /// subject. Returns the `request_id` used for correlation and later cancellation.
    async fn send_request(
        &self,
        subject: &str,
        payload: JsonValue,
        on_reply: ReplyCallback,
    ) -> RequestId;

    /// Detach the callback for `request_id` and best-effort unsubscribe. Safe to call after
    /// the reply has already arrived (no-op in that case).
    async fn cancel_request(&self, request_id: &str);
}

/// In-process bus: delivers replies by directly invoking the stored callback when
/// [`InProcessBus::reply`] is called with a matching request id. Useful for tests and for an
/// embedded director/agent pair in one process.
#[derive(Clone, Default)]
pub struct InProcessBus {
    pending: Arc<Mutex<HashMap<RequestId, ReplyCallback>>>,
    next_id: Arc<Mutex<u64>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a reply to whichever `send_request` produced `request_id`. No-op if the
    /// request was already replied to or cancelled.
    pub fn reply(&self, request_id: &str, payload: JsonValue) {
        let callback = self.pending.lock().expect("InProcessBus pending lock poisoned").remove(request_id);
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Number of requests still awaiting a reply; used by tests to assert on in-flight state.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("InProcessBus pending lock poisoned").len()
    }

    /// Reply to an arbitrary pending request (whichever the map yields first). Useful in
    /// tests driving a client that issues one correlated call at a time, where the exact
    /// request id is an implementation detail.
    pub fn reply_to_any(&self, payload: JsonValue) -> bool {
        let callback = {
            let mut pending = self.pending.lock().expect("InProcessBus pending lock poisoned");
            let key = match pending.keys().next().cloned() {
                Some(key) => key,
                None => return false,
            };
            pending.remove(&key)
        };
        match callback {
            Some(callback) => {
                callback(payload);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn send_request(
        &self,
        _subject: &str,
        _payload: JsonValue,
        on_reply: ReplyCallback,
    ) -> RequestId {
        let mut next_id = self.next_id.lock().expect("InProcessBus next_id lock poisoned");
        *next_id += 1;
        let request_id = format!("req-{next_id}");
        drop(next_id);

        self.pending
            .lock()
            .expect("InProcessBus pending lock poisoned")
            .insert(request_id.clone(), on_reply);
        request_id
    }

    async fn cancel_request(&self, request_id: &str) {
        self.pending.lock().expect("InProcessBus pending lock poisoned").remove(request_id);
    }
}

/// Awaits exactly one reply for a single in-flight correlated call, bridging the bus's
/// callback-driven completion into an `async fn` the agent client can `.await` (spec §4.C:
/// "the client MUST NOT busy-wait"; this is the Tokio-native analogue of the
/// mutex+condvar pattern named in Design Note 9 — `oneshot` already serializes the
/// single-producer/single-consumer handoff under the hood).
pub struct Waiter {
    rx: oneshot::Receiver<JsonValue>,
}

impl Waiter {
    /// Register a new correlated wait against `bus`, returning the request id (for
    /// cancellation) and a waiter that resolves when the bus invokes the reply callback.
    pub async fn register(bus: &dyn Bus, subject: &str, payload: JsonValue) -> (RequestId, Self) {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let request_id = bus
            .send_request(
                subject,
                payload,
                Box::new(move |reply| {
                    if let Some(tx) = tx.lock().expect("Waiter reply tx lock poisoned").take() {
                        let _ = tx.send(reply);
                    }
                }),
            )
            .await;
        (request_id, Self { rx })
    }

    pub async fn wait(self) -> Option<JsonValue> {
        self.rx.await.ok()
    }
}
