//! Purpose: Define the stable JSON envelope the CLI prints for client events.
//! Exports: `event_json`, `event_kind`.
//! Role: Shared contract helper for CLI stdout (one JSON object per event).
//! Invariants: Envelope is `{"event": {"kind", "time", ...}}`; fields are additive-only.
//! Invariants: Error events keep the error kind name used by `{"error": ...}` output.
use crate::api::Event;
use serde_json::{Map, Value, json};

pub fn event_kind(event: &Event) -> &'static str {
    match event {
        Event::UpdateDone { .. } => "UpdateDone",
        Event::GotValue { .. } => "GotValue",
        Event::DataChanged { .. } => "DataChanged",
        Event::FirstRemoved { .. } => "FirstRemoved",
        Event::TagList { .. } => "TagList",
        Event::Error { .. } => "Error",
    }
}

pub fn event_json(event: &Event, time: &str) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(event_kind(event)));
    inner.insert("time".to_string(), json!(time));
    match event {
        Event::UpdateDone { tag, operation } => {
            inner.insert("tag".to_string(), json!(tag));
            inner.insert("operation".to_string(), json!(operation.as_str()));
        }
        Event::GotValue { tag, value }
        | Event::DataChanged { tag, value }
        | Event::FirstRemoved { tag, value } => {
            inner.insert("tag".to_string(), json!(tag));
            inner.insert("value".to_string(), value.clone());
        }
        Event::TagList { tags } => {
            inner.insert("tags".to_string(), json!(tags));
        }
        Event::Error { kind, message } => {
            inner.insert("error_kind".to_string(), json!(format!("{kind:?}")));
            inner.insert("message".to_string(), json!(message));
        }
    }

    let mut outer = Map::new();
    outer.insert("event".to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::event_json;
    use crate::api::{ErrorKind, Event, Operation};
    use serde_json::json;

    #[test]
    fn value_events_carry_tag_and_value() {
        let event = Event::GotValue {
            tag: "score".to_string(),
            value: json!({"points": 3}),
        };
        let value = event_json(&event, "2026-02-01T00:00:00Z");
        let obj = value
            .get("event")
            .and_then(|v| v.as_object())
            .expect("event object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("GotValue"));
        assert_eq!(
            obj.get("time").and_then(|v| v.as_str()),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(obj.get("tag").and_then(|v| v.as_str()), Some("score"));
        assert_eq!(obj.get("value"), Some(&json!({"points": 3})));
    }

    #[test]
    fn update_and_error_events_have_their_own_fields() {
        let done = event_json(
            &Event::UpdateDone {
                tag: "t".to_string(),
                operation: Operation::AppendValueToList,
            },
            "now",
        );
        assert_eq!(done["event"]["operation"], json!("AppendValueToList"));

        let failed = event_json(
            &Event::Error {
                kind: ErrorKind::Offline,
                message: "Offline: no network connectivity".to_string(),
            },
            "now",
        );
        assert_eq!(failed["event"]["kind"], json!("Error"));
        assert_eq!(failed["event"]["error_kind"], json!("Offline"));
        assert!(failed["event"].get("tag").is_none());
    }
}
