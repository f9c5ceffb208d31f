//! # Outbound Payload
//!
//! The JSON message pushed to browsers for every telemetry event:
//!
//! ```json
//! { "IotData": "...", "MessageDate": "2024-03-01T12:00:00.000Z", "DeviceId": "dev-1" }
//! ```

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use crate::ingestors::PartitionEvent;

/// One client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundPayload {
    /// Event body: UTF-8 text as is, anything else as base64.
    pub iot_data: String,
    /// Enqueue time of the event, or the relay's clock when the broker gave none.
    #[serde(serialize_with = "serialize_iso_millis")]
    pub message_date: DateTime<Utc>,
    /// Originating device, omitted when unknown.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl OutboundPayload {
    /// Builds the payload for `event`, falling back to `now` for the date.
    pub fn from_event(event: PartitionEvent, now: DateTime<Utc>) -> Self {
        let iot_data = match String::from_utf8(event.body) {
            Ok(text) => text,
            Err(e) => general_purpose::STANDARD.encode(e.into_bytes()),
        };
        Self {
            iot_data,
            message_date: event.enqueued_time_utc.unwrap_or(now),
            device_id: event.origin_id,
        }
    }

    /// Serializes to the JSON text pushed to clients.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn serialize_iso_millis<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&date.to_rfc3339_opts(SecondsFormat::Millis, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn text_body_without_timestamp_uses_now() {
        let event = PartitionEvent {
            body: b"42".to_vec(),
            enqueued_time_utc: None,
            origin_id: Some("dev-1".to_string()),
        };
        let json = OutboundPayload::from_event(event, now()).to_json().unwrap();
        assert_eq!(
            json,
            r#"{"IotData":"42","MessageDate":"2024-03-01T12:00:00.000Z","DeviceId":"dev-1"}"#
        );
    }

    #[test]
    fn enqueued_time_wins_and_missing_device_is_omitted() {
        let enqueued = Utc.timestamp_millis_opt(1_709_294_400_123).unwrap();
        let event = PartitionEvent {
            body: br#"{"temperature":21.5}"#.to_vec(),
            enqueued_time_utc: Some(enqueued),
            origin_id: None,
        };
        let value: serde_json::Value =
            serde_json::from_str(&OutboundPayload::from_event(event, now()).to_json().unwrap()).unwrap();
        assert_eq!(value["IotData"], r#"{"temperature":21.5}"#);
        assert_eq!(value["MessageDate"], "2024-03-01T12:00:00.123Z");
        assert!(value.get("DeviceId").is_none());
    }

    #[test]
    fn binary_body_is_base64() {
        let event = PartitionEvent {
            body: vec![0xff, 0x00, 0x10],
            enqueued_time_utc: None,
            origin_id: None,
        };
        assert_eq!(OutboundPayload::from_event(event, now()).iot_data, "/wAQ");
    }
}
