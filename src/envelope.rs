//! Encryption envelope for agent RPC payloads (spec §4.B).
//!
//! When credentials are configured, outbound payloads become `{encrypted_data, session_id}`;
//! inbound payloads shaped that way are decrypted. A decryption failure is never propagated as
//! a Rust error at this layer — it is folded into `{"exception": "CryptError: ..."}` so the
//! agent client's normal exception handling (spec §4.C) picks it up uniformly.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use serde_json::{json, Value as JsonValue};

/// Symmetric key material shared with the in-guest agent.
///
/// Stored on the `VmRecord` and mirrored into `env.bosh.credentials` so the agent can derive
/// the same key without a separate handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentCredentials {
    key: [u8; 32],
}

impl AgentCredentials {
    /// Generate fresh key material for one VM.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Construct from raw key bytes (e.g. restored from persistence).
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// The value injected into `env.bosh.credentials` for the agent to pick up.
    pub fn as_env_value(&self) -> JsonValue {
        json!({ "crypt_key": STANDARD.encode(self.key) })
    }
}

/// Encrypts and decrypts RPC payloads for one agent's credentials.
#[derive(Clone)]
pub struct Envelope {
    credentials: AgentCredentials,
}

impl Envelope {
    pub fn new(credentials: AgentCredentials) -> Self {
        Self { credentials }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.credentials.key))
    }

    /// Wrap an outbound payload as `{encrypted_data, session_id}`.
    ///
    /// Session identifiers are opaque to callers; this layer does not defend against
    /// collisions (spec §4.B), it only needs enough entropy that two concurrent calls from
    /// the same client don't trip each other up.
    pub fn encrypt(&self, payload: &JsonValue) -> JsonValue {
        let plaintext = payload.to_string();
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-256-GCM encryption of a bounded JSON payload cannot fail");

        let mut framed = nonce_bytes.to_vec();
        framed.extend_from_slice(&ciphertext);

        let mut session_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut session_id);

        json!({
            "encrypted_data": STANDARD.encode(framed),
            "session_id": STANDARD.encode(session_id),
        })
    }

    /// Decrypt an inbound reply shaped as `{encrypted_data, session_id}`.
    ///
    /// Per spec §4.B, callers should never propagate this `Result`'s `Err` directly — fold it
    /// into the normalized `{"exception": "CryptError: ..."}` shape via [`decrypt_or_crypt_error`].
    pub fn decrypt(&self, encrypted_data: &str) -> Result<JsonValue, String> {
        let framed =
            STANDARD.decode(encrypted_data).map_err(|e| format!("invalid base64: {e}"))?;
        if framed.len() < 12 {
            return Err("ciphertext shorter than nonce".to_string());
        }
        let (nonce_bytes, ciphertext) = framed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| "decryption failed".to_string())?;

        let text = String::from_utf8(plaintext).map_err(|e| format!("invalid utf-8: {e}"))?;
        serde_json::from_str(&text).map_err(|e| format!("invalid json: {e}"))
    }

    /// Inbound reply shape contains `encrypted_data`, so it should go through decryption.
    pub fn is_encrypted_reply(reply: &JsonValue) -> bool {
        reply.get("encrypted_data").and_then(JsonValue::as_str).is_some()
    }

    /// Decrypt a reply, or fold the failure into `{"exception": "CryptError: ..."}` so
    /// downstream normalization (spec §4.C) handles it the same way as a remote exception.
    pub fn decrypt_or_crypt_error(&self, reply: &JsonValue) -> JsonValue {
        let Some(encrypted_data) = reply.get("encrypted_data").and_then(JsonValue::as_str) else {
            return reply.clone();
        };
        match self.decrypt(encrypted_data) {
            Ok(inner) => inner,
            Err(e) => json!({ "exception": { "message": format!("CryptError: {e}") } }),
        }
    }
}
