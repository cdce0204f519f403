//! NATS-backed [`vmcore::bus::Bus`] transport.
//!
//! Each `send_request` hands the subject and payload to `async_nats::Client::request`, which
//! allocates a private inbox, subscribes to it, publishes with the inbox as the reply-to
//! subject, and resolves with the first reply. That is exactly the one-shot correlated
//! request/reply shape the `Bus` trait asks for, so this crate is a thin adapter rather than
//! hand-rolled subscription bookkeeping: a background task drives the NATS request to
//! completion and invokes the stored callback, while the join handle lets `cancel_request`
//! abort it early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use uuid::Uuid;
use vmcore::bus::{Bus, ReplyCallback, RequestId};

/// A [`Bus`] implementation backed by a real NATS connection.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://127.0.0.1:4222").await?;
/// let bus = vmcore_nats::NatsBus::new(client);
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    inflight: Arc<Mutex<HashMap<RequestId, JoinHandle<()>>>>,
}

impl NatsBus {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client, inflight: Arc::new(Mutex::new(HashMap::new())) }
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn send_request(
        &self,
        subject: &str,
        payload: JsonValue,
        on_reply: ReplyCallback,
    ) -> RequestId {
        let request_id = Uuid::new_v4().to_string();

        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = %err, subject, "failed to serialize bus request payload");
                return request_id;
            }
        };

        let client = self.client.clone();
        let subject_owned = subject.to_string();
        let handle = tokio::spawn(async move {
            match client.request(subject_owned.clone(), bytes.into()).await {
                Ok(message) => match serde_json::from_slice::<JsonValue>(&message.payload) {
                    Ok(value) => on_reply(value),
                    Err(err) => {
                        tracing::warn!(error = %err, subject = %subject_owned, "bus reply was not valid JSON")
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, subject = %subject_owned, "NATS request failed")
                }
            }
        });

        self.inflight
            .lock()
            .expect("NatsBus inflight lock poisoned")
            .insert(request_id.clone(), handle);
        request_id
    }

    async fn cancel_request(&self, request_id: &str) {
        let handle = self.inflight.lock().expect("NatsBus inflight lock poisoned").remove(request_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
