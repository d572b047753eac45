//! Host trigger envelopes.
//!
//! Storage and queue triggers both deliver `{"messages": [{"details": …}]}`.
//! Storage details carry `bucket_id`/`object_id`; queue details carry the
//! message body as a JSON string. Hosts sometimes double-encode the whole
//! event as a JSON string, which [`TriggerEvent::parse`] also accepts.
//! A message whose details match neither shape is kept as
//! [`TriggerDetails::Other`] so the rest of the event still runs.

use crate::types::UploadNotification;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerEvent {
    #[serde(default)]
    pub messages: Vec<TriggerMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerMessage {
    #[serde(default)]
    pub details: TriggerDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TriggerDetails {
    Upload(UploadNotification),
    Queue { message: QueueMessageBody },
    Other(serde_json::Value),
}

impl Default for TriggerDetails {
    fn default() -> Self {
        Self::Other(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueMessageBody {
    pub body: String,
}

impl TriggerEvent {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<serde_json::Value>(raw)? {
            serde_json::Value::String(inner) => serde_json::from_str(&inner),
            value => serde_json::from_value(value),
        }
    }

    pub fn uploads(&self) -> impl Iterator<Item = &UploadNotification> {
        self.messages.iter().filter_map(|m| match &m.details {
            TriggerDetails::Upload(n) => Some(n),
            TriggerDetails::Queue { .. } | TriggerDetails::Other(_) => None,
        })
    }

    pub fn queue_bodies(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().filter_map(|m| match &m.details {
            TriggerDetails::Queue { message } => Some(message.body.as_str()),
            TriggerDetails::Upload(_) | TriggerDetails::Other(_) => None,
        })
    }

    /// Details of messages that are neither uploads nor queue deliveries.
    pub fn unrecognized(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.messages.iter().filter_map(|m| match &m.details {
            TriggerDetails::Other(value) => Some(value),
            TriggerDetails::Upload(_) | TriggerDetails::Queue { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_trigger() {
        let raw = r#"{"messages":[{"event_metadata":{"event_type":"ObjectCreate"},
            "details":{"bucket_id":"photos","object_id":"P1.jpg"}}]}"#;
        let event = TriggerEvent::parse(raw).unwrap();
        let uploads: Vec<_> = event.uploads().collect();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].bucket_id, "photos");
        assert_eq!(uploads[0].object_id, "P1.jpg");
        assert_eq!(event.queue_bodies().count(), 0);
    }

    #[test]
    fn test_queue_trigger_batch() {
        let raw = r#"{"messages":[
            {"details":{"queue_id":"q","message":{"message_id":"1","body":"{\"a\":1}"}}},
            {"details":{"queue_id":"q","message":{"message_id":"2","body":"second"}}}
        ]}"#;
        let event = TriggerEvent::parse(raw).unwrap();
        let bodies: Vec<_> = event.queue_bodies().collect();
        assert_eq!(bodies, vec![r#"{"a":1}"#, "second"]);
        assert_eq!(event.uploads().count(), 0);
    }

    #[test]
    fn test_double_encoded_event() {
        let inner = r#"{"messages":[{"details":{"bucket_id":"b","object_id":"k"}}]}"#;
        let raw = serde_json::to_string(inner).unwrap();
        let event = TriggerEvent::parse(&raw).unwrap();
        assert_eq!(event.uploads().count(), 1);
    }

    #[test]
    fn test_unknown_details_kept_apart() {
        let raw = r#"{"messages":[
            {"details":{"x":1}},
            {"details":{"bucket_id":"photos","object_id":"P1.jpg"}},
            {"details":{"message":{"id":"no body"}}},
            {"event_metadata":{}}
        ]}"#;
        let event = TriggerEvent::parse(raw).unwrap();
        assert_eq!(event.uploads().count(), 1);
        assert_eq!(event.queue_bodies().count(), 0);
        let other: Vec<_> = event.unrecognized().collect();
        assert_eq!(other.len(), 3);
        assert_eq!(other[0], &serde_json::json!({"x": 1}));
        assert_eq!(other[2], &serde_json::Value::Null);
    }

    #[test]
    fn test_malformed_event_rejected() {
        assert!(TriggerEvent::parse("not json").is_err());
        assert!(TriggerEvent::parse(r#"{"messages":{"details":{}}}"#).is_err());
    }

    #[test]
    fn test_empty_event() {
        let event = TriggerEvent::parse("{}").unwrap();
        assert!(event.messages.is_empty());
    }
}
