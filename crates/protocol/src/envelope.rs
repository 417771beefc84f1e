//! Message envelope: `{"header": {...}, "payload": {...}}`.
//!
//! The bus only ever *emits* the object form. On input it also tolerates the
//! legacy `[header, payload]` array form used by the older of the two worker
//! runtimes in the original implementation (see spec.md's Open Questions).

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reserved message types. Workers may register handlers for additional
/// application-specific types, but these are always present in a worker's
/// default handler table.
pub mod message_type {
    pub const OBSERVATION: &str = "observation";
    pub const SERVICE: &str = "service";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const STATUS: &str = "status";
    pub const ALERT: &str = "alert";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from: String,
}

impl Header {
    pub fn new(kind: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            from: from.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Value,
}

impl Envelope {
    pub fn new(header: Header, payload: Value) -> Self {
        Self { header, payload }
    }

    /// Serialize to the canonical `{"header":...,"payload":...}` wire form.
    /// This is the only form ever emitted onto the bus.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

// Accepts both `{"header": ..., "payload": ...}` and the legacy
// `[header, payload]` array form on input.
impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EnvelopeVisitor;

        impl<'de> Visitor<'de> for EnvelopeVisitor {
            type Value = Envelope;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object {header,payload} or a [header, payload] array")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Envelope, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut header: Option<Header> = None;
                let mut payload: Option<Value> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "header" => header = Some(map.next_value()?),
                        "payload" => payload = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                let header = header.ok_or_else(|| de::Error::missing_field("header"))?;
                let payload = payload.ok_or_else(|| de::Error::missing_field("payload"))?;
                Ok(Envelope { header, payload })
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Envelope, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let header: Header = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let payload: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Ok(Envelope { header, payload })
            }
        }

        deserializer.deserialize_any(EnvelopeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_object_form() {
        let raw = r#"{"header":{"type":"observation","from":"com1"},"payload":{"id":"x"}}"#;
        let env = Envelope::from_json_slice(raw.as_bytes()).unwrap();
        assert_eq!(env.header.kind, "observation");
        assert_eq!(env.header.from, "com1");
    }

    #[test]
    fn decodes_legacy_array_form() {
        let raw = r#"[{"type":"service","from":"x"},{"action":"stop"}]"#;
        let env = Envelope::from_json_slice(raw.as_bytes()).unwrap();
        assert_eq!(env.header.kind, "service");
        assert_eq!(env.payload["action"], "stop");
    }

    #[test]
    fn never_emits_array_form() {
        let env = Envelope::new(Header::new("observation", "a"), serde_json::json!({}));
        let s = env.to_json_string().unwrap();
        assert!(s.starts_with('{'));
    }

    #[test]
    fn rejects_invalid_json() {
        let raw = b"not json";
        assert!(Envelope::from_json_slice(raw).is_err());
    }
}
