//! Home Assistant MQTT statestream decoding.
//!
//! The statestream publishes every entity under
//! `<prefix>/<domain>/<object_id>/<field>`, where `<field>` is `state`,
//! `last_changed`, or an attribute name. State payloads are plain strings
//! (sometimes JSON-quoted), timestamps are ISO 8601, attributes are JSON
//! values.

use serde_json::Value;

/// One decoded statestream field update.
#[derive(Debug, Clone, PartialEq)]
pub enum StateField {
    State(String),
    LastChanged(i64),
    Attribute(String, Value),
}

/// Split a statestream topic into `(entity_id, field)`.
///
/// Returns None for topics outside the prefix or with a nested field path.
pub fn parse_statestream_topic<'a>(topic: &'a str, prefix: &str) -> Option<(String, &'a str)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;

    let mut parts = rest.splitn(3, '/');
    let domain = parts.next()?;
    let object_id = parts.next()?;
    let field = parts.next()?;

    if domain.is_empty() || object_id.is_empty() || field.is_empty() || field.contains('/') {
        return None;
    }

    Some((format!("{}.{}", domain, object_id), field))
}

/// Decode a field payload.
///
/// `last_updated` is ignored: it moves on every attribute refresh, while
/// the automations key off `last_changed` (actual state transitions).
pub fn decode_field(field: &str, payload: &[u8]) -> Option<StateField> {
    let text = std::str::from_utf8(payload).ok()?;

    match field {
        "state" => Some(StateField::State(unquote(text).to_string())),
        "last_changed" => parse_timestamp_ms(unquote(text)).map(StateField::LastChanged),
        "last_updated" => None,
        _ => {
            let value = serde_json::from_str(text)
                .unwrap_or_else(|_| Value::String(text.to_string()));
            Some(StateField::Attribute(field.to_string(), value))
        }
    }
}

/// Parse an ISO 8601 timestamp into epoch milliseconds.
pub fn parse_timestamp_ms(text: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Strip one layer of JSON string quoting, if present.
fn unquote(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        assert_eq!(
            parse_statestream_topic("statestream/light/hall/state", "statestream"),
            Some(("light.hall".to_string(), "state"))
        );
        assert_eq!(
            parse_statestream_topic("statestream/binary_sensor/motion/last_changed", "statestream"),
            Some(("binary_sensor.motion".to_string(), "last_changed"))
        );

        // Outside the prefix, or missing pieces.
        assert_eq!(parse_statestream_topic("other/light/hall/state", "statestream"), None);
        assert_eq!(parse_statestream_topic("statestream/light/hall", "statestream"), None);
        assert_eq!(
            parse_statestream_topic("statestream/light/hall/deeply/nested", "statestream"),
            None
        );
    }

    #[test]
    fn test_decode_state() {
        assert_eq!(
            decode_field("state", b"on"),
            Some(StateField::State("on".to_string()))
        );
        // Some statestream configurations JSON-quote the state.
        assert_eq!(
            decode_field("state", b"\"off\""),
            Some(StateField::State("off".to_string()))
        );
    }

    #[test]
    fn test_decode_last_changed() {
        let field = decode_field("last_changed", b"\"2024-05-01T12:00:00+00:00\"").unwrap();
        assert_eq!(field, StateField::LastChanged(1_714_564_800_000));

        assert_eq!(decode_field("last_changed", b"garbage"), None);
    }

    #[test]
    fn test_decode_attribute() {
        assert_eq!(
            decode_field("brightness", b"128"),
            Some(StateField::Attribute(
                "brightness".to_string(),
                serde_json::json!(128)
            ))
        );
        // Non-JSON payloads are kept as raw strings.
        assert_eq!(
            decode_field("friendly_name", b"Hallway Light"),
            Some(StateField::Attribute(
                "friendly_name".to_string(),
                serde_json::json!("Hallway Light")
            ))
        );
    }

    #[test]
    fn test_last_updated_ignored() {
        assert_eq!(decode_field("last_updated", b"\"2024-05-01T12:00:00+00:00\""), None);
    }

    #[test]
    fn test_non_utf8_payload_ignored() {
        assert_eq!(decode_field("state", &[0xff, 0xfe]), None);
    }
}
