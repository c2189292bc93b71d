//! Outbound forwarding of Bitrix24 events
//!
//! Dispatched as a detached task after the caller's response is finalized;
//! failures are logged and never reach the caller.

use serde_json::Value;

/// Forward an event payload to the outbound URL, optionally reduced to the
/// configured field subset.
pub async fn forward_event(
    http: &reqwest::Client,
    url: &str,
    forward_fields: &[String],
    payload: &Value,
) -> anyhow::Result<()> {
    let body = filter_fields(payload, forward_fields);
    let response = http.post(url).json(&body).send().await?;
    response.error_for_status()?;
    Ok(())
}

/// Keep only the configured fields; an empty list forwards the payload
/// untouched. Fields absent from the payload are dropped, not nulled.
pub fn filter_fields(payload: &Value, forward_fields: &[String]) -> Value {
    if forward_fields.is_empty() {
        return payload.clone();
    }
    let Value::Object(obj) = payload else {
        return payload.clone();
    };
    let mut filtered = serde_json::Map::new();
    for field in forward_fields {
        if let Some(value) = obj.get(field) {
            filtered.insert(field.clone(), value.clone());
        }
    }
    Value::Object(filtered)
}
