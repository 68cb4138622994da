//! Private-stream authentication and secret redaction.
//!
//! The user stream authenticates with the api key triple plus an
//! HMAC-SHA256 signature over (timestamp, method, path, body) and the chain
//! id. Anything resembling a credential is redacted before a payload may be
//! logged.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

/// Field names whose values never reach a log line.
pub const REDACT_KEYS: &[&str] = &[
    "private_key",
    "secret",
    "passphrase",
    "api_key",
    "apikey",
    "signature",
    "authorization",
];

pub const REDACTED: &str = "***REDACTED***";

#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
}

/// Hex HMAC-SHA256 over the canonical request string.
pub fn hmac_signature(
    secret: &str,
    timestamp: i64,
    method: &str,
    path: &str,
    body: &str,
) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Subscribe payload for the private user channel.
pub fn user_subscribe_payload(
    creds: &ApiCredentials,
    chain_id: u64,
    now: DateTime<Utc>,
) -> Value {
    let timestamp = now.timestamp();
    let signature = hmac_signature(&creds.api_secret, timestamp, "GET", "/ws/user", "");
    json!({
        "type": "subscribe",
        "channel": "user",
        "auth": {
            "api_key": creds.api_key,
            "passphrase": creds.api_passphrase,
            "timestamp": timestamp,
            "signature": signature,
            "chain_id": chain_id,
        },
    })
}

/// Is this field name a secret, regardless of case?
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    REDACT_KEYS.iter().any(|k| lower == *k)
}

/// Recursively replace secret values before logging a payload.
pub fn redact_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_secret_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_payload(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_payload).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ApiCredentials {
        ApiCredentials {
            api_key: "key-123".to_string(),
            api_secret: "super-secret".to_string(),
            api_passphrase: "hunter2".to_string(),
        }
    }

    #[test]
    fn test_signature_is_deterministic_hex() {
        let a = hmac_signature("secret", 1_700_000_000, "GET", "/ws/user", "");
        let b = hmac_signature("secret", 1_700_000_000, "GET", "/ws/user", "");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_varies_with_inputs() {
        let base = hmac_signature("secret", 1_700_000_000, "GET", "/ws/user", "");
        assert_ne!(base, hmac_signature("other", 1_700_000_000, "GET", "/ws/user", ""));
        assert_ne!(base, hmac_signature("secret", 1_700_000_001, "GET", "/ws/user", ""));
        assert_ne!(base, hmac_signature("secret", 1_700_000_000, "POST", "/ws/user", ""));
    }

    #[test]
    fn test_subscribe_payload_carries_auth_fields() {
        let now = Utc::now();
        let payload = user_subscribe_payload(&creds(), 137, now);
        assert_eq!(payload["channel"], "user");
        assert_eq!(payload["auth"]["api_key"], "key-123");
        assert_eq!(payload["auth"]["chain_id"], 137);
        assert!(payload["auth"]["signature"].as_str().unwrap().len() == 64);
    }

    #[test]
    fn test_redaction_replaces_secret_fields() {
        let now = Utc::now();
        let payload = user_subscribe_payload(&creds(), 137, now);
        let redacted = redact_payload(&payload);
        assert_eq!(redacted["auth"]["api_key"], REDACTED);
        assert_eq!(redacted["auth"]["passphrase"], REDACTED);
        assert_eq!(redacted["auth"]["signature"], REDACTED);
        // Non-secret fields survive.
        assert_eq!(redacted["channel"], "user");
        assert_eq!(redacted["auth"]["chain_id"], 137);
    }

    #[test]
    fn test_redaction_is_case_insensitive_and_recursive() {
        let value = json!({
            "outer": [{"PRIVATE_KEY": "0xdeadbeef"}, {"ApiKey": "k"}],
            "Signature": "sig",
        });
        let redacted = redact_payload(&value);
        assert_eq!(redacted["outer"][0]["PRIVATE_KEY"], REDACTED);
        assert_eq!(redacted["outer"][1]["ApiKey"], REDACTED);
        assert_eq!(redacted["Signature"], REDACTED);
    }
}
