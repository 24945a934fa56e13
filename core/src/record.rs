use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::{BridgeError, SerializationError};
use crate::source::RawMessage;
use crate::topic::{self, NamingPolicy};

/// How message payloads are decoded into record values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ValueFormat {
    #[default]
    Bytes,
    String,
    Json,
}

impl FromStr for ValueFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" => Ok(ValueFormat::Bytes),
            "string" => Ok(ValueFormat::String),
            "json" => Ok(ValueFormat::Json),
            _ => Err("expected Bytes, String or Json".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RecordValue {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl RecordValue {
    fn decode(payload: &[u8], format: ValueFormat) -> Result<Self, BridgeError> {
        match format {
            ValueFormat::Bytes => Ok(RecordValue::Bytes(payload.to_vec())),
            ValueFormat::String => std::str::from_utf8(payload)
                .map(|text| RecordValue::Text(text.to_string()))
                .map_err(|e| {
                    BridgeError::Serialization(SerializationError::Utf8 {
                        reason: e.to_string(),
                    })
                }),
            ValueFormat::Json => Ok(RecordValue::Json(serde_json::from_slice(payload)?)),
        }
    }

    /// The value as bytes, for sinks that write raw payloads.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        match self {
            RecordValue::Bytes(bytes) => Ok(bytes.clone()),
            RecordValue::Text(text) => Ok(text.as_bytes().to_vec()),
            RecordValue::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

/// A record handed to the downstream pipeline. One per received message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    /// Topic name after applying the naming policy.
    pub topic: String,
    pub key: Option<String>,
    pub value: RecordValue,
    /// Partition of the broker topic the message came from, if partitioned.
    pub partition: Option<i32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub headers: HashMap<String, String>,
    /// Qualified logical topic the message was read from.
    pub source_partition: String,
    /// Broker message id of the message.
    pub source_offset: String,
}

impl OutputRecord {
    /// Builds a record from a broker message.
    ///
    /// Partition sub-topics collapse to their logical topic before the naming
    /// policy is applied, so no policy exposes a partition suffix. The event
    /// time is preferred over the publish time for the record timestamp.
    pub fn from_raw(
        message: &RawMessage,
        policy: NamingPolicy,
        format: ValueFormat,
    ) -> Result<Self, BridgeError> {
        let (logical, partition) = topic::logical_topic(&message.topic);
        let topic = topic::resolve(logical, policy)?;
        let value = RecordValue::decode(&message.payload, format)?;

        let millis = message.event_time.unwrap_or(message.publish_time);
        let timestamp = i64::try_from(millis)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Self {
            topic,
            key: message.key.clone(),
            value,
            partition,
            timestamp,
            headers: message.properties.clone(),
            source_partition: logical.to_string(),
            source_offset: message.message_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::AckHandle;

    fn raw(topic: &str, payload: &[u8]) -> RawMessage {
        RawMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            key: Some("k1".to_string()),
            properties: HashMap::from([("origin".to_string(), "test".to_string())]),
            publish_time: 1_700_000_000_000,
            event_time: None,
            message_id: "7:3:2".to_string(),
            ack: AckHandle(0),
        }
    }

    #[test]
    fn test_partition_suffix_never_leaks() {
        let message = raw("persistent://public/default/orders-partition-2", b"x");

        let record = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::Bytes).unwrap();
        assert_eq!(record.topic, "orders");
        assert_eq!(record.partition, Some(2));
        assert_eq!(record.source_partition, "persistent://public/default/orders");

        let record =
            OutputRecord::from_raw(&message, NamingPolicy::FullyQualified, ValueFormat::Bytes).unwrap();
        assert_eq!(record.topic, "persistent://public/default/orders");
    }

    #[test]
    fn test_metadata_is_carried() {
        let mut message = raw("persistent://public/default/orders", b"payload");
        let record = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::Bytes).unwrap();
        assert_eq!(record.key.as_deref(), Some("k1"));
        assert_eq!(record.headers.get("origin").map(String::as_str), Some("test"));
        assert_eq!(record.source_offset, "7:3:2");
        assert_eq!(record.partition, None);
        assert_eq!(record.timestamp.unwrap().timestamp_millis(), 1_700_000_000_000);

        message.event_time = Some(1_600_000_000_000);
        let record = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::Bytes).unwrap();
        assert_eq!(record.timestamp.unwrap().timestamp_millis(), 1_600_000_000_000);
    }

    #[test]
    fn test_value_formats() {
        let message = raw("orders", br#"{"id": 42}"#);
        let record = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::Json).unwrap();
        assert_eq!(record.value, RecordValue::Json(serde_json::json!({"id": 42})));
        assert_eq!(record.value.to_bytes().unwrap(), br#"{"id":42}"#.to_vec());

        let record = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::String).unwrap();
        assert_eq!(record.value, RecordValue::Text(r#"{"id": 42}"#.to_string()));
    }

    #[test]
    fn test_undecodable_payloads_are_skippable() {
        let message = raw("orders", &[0xff, 0xfe]);
        let err = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::String).unwrap_err();
        assert!(err.should_skip_message());

        let err = OutputRecord::from_raw(&message, NamingPolicy::NameOnly, ValueFormat::Json).unwrap_err();
        assert!(err.should_skip_message());
    }

    #[test]
    fn test_value_format_parse() {
        assert_eq!("json".parse::<ValueFormat>(), Ok(ValueFormat::Json));
        assert_eq!("Bytes".parse::<ValueFormat>(), Ok(ValueFormat::Bytes));
        assert!("avro".parse::<ValueFormat>().is_err());
    }
}
