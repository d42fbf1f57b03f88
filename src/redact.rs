//! Redactor: the mechanism that makes "no credential or business datum ever
//! crosses the trust boundary in logs or metrics" a property an auditor can
//! check by static inspection (spec.md §4.10), not a convention individual
//! call sites must remember to follow.
//!
//! Both pattern tiers are always active, in every build and environment.

use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Tier 1: credentials and secrets. Matched against a lowercased field name
/// as a substring, so `encrypted_key`, `api_key_hint` etc. all match.
const CREDENTIAL_PATTERNS: &[&str] = &[
    "api-key",
    "api_key",
    "apikey",
    "secret",
    "token",
    "password",
    "passphrase",
    "private-key",
    "private_key",
    "jwt",
    "authorization",
    "encrypted",
    "master_key",
    "master-key",
    "credential",
];

/// Tier 2: business data and PII.
const BUSINESS_PATTERNS: &[&str] = &[
    "user-id",
    "user_id",
    "account-id",
    "account_id",
    "exchange",
    "broker",
    "balance",
    "equity",
    "amount",
    "price",
    "pnl",
    "fee",
    "deposit",
    "withdrawal",
    "trade",
    "position",
    "order",
    "quantity",
    "size",
    "volume",
    "synced",
    "count",
    "name",
    "email",
    "phone",
    "address",
    "ssn",
    "tax-id",
    "tax_id",
    "venue",
];

fn field_is_sensitive(field_name: &str) -> bool {
    let lower = field_name.to_lowercase();
    CREDENTIAL_PATTERNS
        .iter()
        .chain(BUSINESS_PATTERNS.iter())
        .any(|pattern| lower.contains(pattern))
}

/// Descend a JSON-like value, replacing every value whose key matches either
/// pattern tier with the literal string `[REDACTED]`. Array elements are
/// recursed into without a field name (arrays carry no keys to match), so
/// only object fields are ever redacted directly; nested objects inside an
/// array are still filtered per their own keys.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if field_is_sensitive(key) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Redact a serializable value, returning it re-serialized. Used at the
/// logging/metrics/RPC-error choke points rather than scattering `redact()`
/// calls through call sites.
pub fn redact_serializable<T: serde::Serialize>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(v) => redact(&v),
        Err(_) => Value::String(REDACTED.to_string()),
    }
}

/// Verify that no field in `value` that matches a redaction pattern still
/// carries a non-redacted value. Used by tests (spec.md §8: "for every log
/// line and every metric sample emitted...").
pub fn assert_fully_redacted(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().all(|(key, val)| {
            if field_is_sensitive(key) {
                matches!(val, Value::String(s) if s == REDACTED)
            } else {
                assert_fully_redacted(val)
            }
        }),
        Value::Array(items) => items.iter().all(assert_fully_redacted),
        _ => true,
    }
}

/// Collects a `tracing::Event`'s fields into a JSON object so they can be
/// passed through [`redact`] before anything is printed.
struct FieldCollector(serde_json::Map<String, Value>);

impl tracing::field::Visit for FieldCollector {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), serde_json::json!(format!("{value:?}")));
    }
}

/// A `tracing_subscriber::Layer` that redacts every event's fields before a
/// single byte reaches the sink. This is the mechanical enforcement point
/// spec.md §4.10 calls for: every log line in the process passes through
/// here, so there is one place to audit rather than one discipline to trust
/// at every `tracing::info!`/`warn!`/`error!` call site.
pub struct RedactingLayer {
    sink: std::sync::Arc<dyn Fn(&str) + Send + Sync>,
}

impl RedactingLayer {
    /// Prints redacted lines to stdout. Used by the Bootstrapper at startup.
    pub fn stdout() -> Self {
        Self { sink: std::sync::Arc::new(|line: &str| println!("{line}")) }
    }

    /// Construct with an arbitrary sink. Tests use this to capture output
    /// instead of printing it.
    pub fn with_sink(sink: std::sync::Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        Self { sink }
    }
}

impl<S> tracing_subscriber::Layer<S> for RedactingLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut collector = FieldCollector(serde_json::Map::new());
        event.record(&mut collector);
        let redacted = redact(&Value::Object(collector.0));

        let metadata = event.metadata();
        let line = format!(
            "{} {} {}: {}",
            chrono::Utc::now().to_rfc3339(),
            metadata.level(),
            metadata.target(),
            redacted
        );
        (self.sink)(&line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_credential_tier() {
        let input = json!({ "api_key": "abc", "encrypted_secret": "xyz", "ok": 1 });
        let out = redact(&input);
        assert_eq!(out["api_key"], REDACTED);
        assert_eq!(out["encrypted_secret"], REDACTED);
        assert_eq!(out["ok"], 1);
    }

    #[test]
    fn redacts_business_tier() {
        let input = json!({
            "user_id": "u1",
            "venue": "binance",
            "total_equity": 1234.5,
            "snapshots_created": 3,
        });
        let out = redact(&input);
        assert_eq!(out["user_id"], REDACTED);
        assert_eq!(out["venue"], REDACTED);
        assert_eq!(out["total_equity"], REDACTED);
        // "snapshots_created" contains "count"? no — but matches no pattern
        // directly except via substring checks; verify deliberately.
        assert!(field_is_sensitive("snapshots_created") == false || out["snapshots_created"] == REDACTED);
    }

    #[test]
    fn recurses_into_nested_objects_and_arrays() {
        let input = json!({
            "breakdown": [
                { "market": "spot", "equity": 10.0 },
                { "market": "swap", "equity": 20.0 }
            ]
        });
        let out = redact(&input);
        assert_eq!(out["breakdown"][0]["equity"], REDACTED);
        assert_eq!(out["breakdown"][1]["equity"], REDACTED);
        // "market" is not itself a pattern, so the string is preserved.
        assert_eq!(out["breakdown"][0]["market"], "spot");
    }

    #[test]
    fn leaves_non_sensitive_fields_untouched() {
        let input = json!({ "status": "ok", "version": "1.0.0" });
        let out = redact(&input);
        assert_eq!(out, input);
    }

    #[test]
    fn assert_fully_redacted_detects_leaks() {
        let clean = json!({ "user_id": REDACTED });
        assert!(assert_fully_redacted(&clean));

        let leaky = json!({ "user_id": "u1" });
        assert!(!assert_fully_redacted(&leaky));
    }

    #[test]
    fn redacting_layer_scrubs_event_fields_before_the_sink_sees_them() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::SubscriberExt;

        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink_captured = captured.clone();
        let layer = RedactingLayer::with_sink(Arc::new(move |line: &str| {
            sink_captured.lock().unwrap().push(line.to_string());
        }));
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(user_id = "secret-user", api_key = "shh", total_equity = 42.0, "syncing");
        });

        let lines = captured.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(REDACTED));
        assert!(!lines[0].contains("secret-user"));
        assert!(!lines[0].contains("shh"));
        assert!(!lines[0].contains("42"));
    }
}
