//! Message contract between the receiver and the sender.
//!
//! The receiver publishes an [`OutboundMessage`]: the claim payload as the
//! message body plus typed `ClaimNumber` and `Timestamp` attributes. The
//! sender is handed a [`DeliveryEvent`], shaped like a cloud queue trigger
//! event, carrying the same body and attributes plus a per-delivery receipt
//! handle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Seconds a freshly sent claim stays invisible before its first delivery.
pub const DELAY_SECONDS: u32 = 10;

/// Attribute carrying the string-encoded claim number.
pub const CLAIM_NUMBER_ATTRIBUTE: &str = "ClaimNumber";

/// Attribute carrying the ISO-8601 creation time of the message.
pub const TIMESTAMP_ATTRIBUTE: &str = "Timestamp";

/// Delivery attribute holding how many times the message has been received.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

// =============================================================================
// Claim identity
// =============================================================================

/// String-encoded numeric claim identifier, the CRM's external key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimNumber(String);

impl ClaimNumber {
    /// Accept a JSON number, or a string that holds one.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self(canonical_number(n))),
            Value::String(s) => {
                let trimmed = s.trim();
                if !trimmed.is_empty() && trimmed.parse::<f64>().is_ok_and(f64::is_finite) {
                    Some(Self(trimmed.to_string()))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Render a JSON number the way ECMAScript's `Number#toString` does, so
/// `33`, `33.0` and `3.3e1` all key the same CRM record.
fn canonical_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }

    let Some(f) = n.as_f64() else {
        return n.to_string();
    };

    if f == 0.0 {
        return "0".to_string();
    }

    let magnitude = f.abs();
    if (1e-6..1e21).contains(&magnitude) {
        // Display is the shortest round-trip form and never uses an exponent.
        return f.to_string();
    }

    let exponential = format!("{f:e}");
    match exponential.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => exponential,
    }
}

impl fmt::Display for ClaimNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Outbound message (receiver → queue)
// =============================================================================

/// Declared type of a message attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeDataType {
    String,
    Number,
}

impl AttributeDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeDataType::String => "String",
            AttributeDataType::Number => "Number",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "String" => Some(AttributeDataType::String),
            "Number" => Some(AttributeDataType::Number),
            _ => None,
        }
    }
}

/// Typed message attribute; values always travel as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "DataType")]
    pub data_type: AttributeDataType,
    #[serde(rename = "StringValue")]
    pub string_value: String,
}

impl MessageAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: AttributeDataType::String,
            string_value: value.into(),
        }
    }

    pub fn number(value: impl Into<String>) -> Self {
        Self {
            data_type: AttributeDataType::Number,
            string_value: value.into(),
        }
    }
}

/// Message the receiver hands to the queue. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "MessageBody")]
    pub message_body: String,
    #[serde(rename = "DelaySeconds")]
    pub delay_seconds: u32,
    #[serde(rename = "MessageAttributes")]
    pub message_attributes: BTreeMap<String, MessageAttribute>,
}

impl OutboundMessage {
    /// Build the queue message for a claim.
    ///
    /// `payload` is serialized on its own; the `{body, number}` envelope never
    /// reaches the queue.
    pub fn for_claim(
        payload: &Map<String, Value>,
        claim_number: &ClaimNumber,
        timestamp: String,
    ) -> serde_json::Result<Self> {
        let message_body = serde_json::to_string(payload)?;

        let mut message_attributes = BTreeMap::new();
        message_attributes.insert(
            CLAIM_NUMBER_ATTRIBUTE.to_string(),
            MessageAttribute::number(claim_number.as_str()),
        );
        message_attributes.insert(TIMESTAMP_ATTRIBUTE.to_string(), MessageAttribute::string(timestamp));

        Ok(Self {
            message_body,
            delay_seconds: DELAY_SECONDS,
            message_attributes,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&MessageAttribute> {
        self.message_attributes.get(name)
    }
}

/// Queue acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub request_id: String,
}

// =============================================================================
// Delivery event (queue → sender)
// =============================================================================

/// Queue-triggered event handed to the sender.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<DeliveryRecord>,
}

impl DeliveryEvent {
    pub fn single(record: DeliveryRecord) -> Self {
        Self {
            records: vec![record],
        }
    }
}

/// One delivery of one message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    #[serde(default)]
    pub message_id: String,
    /// Token for this delivery attempt; redeliveries carry a new one.
    pub receipt_handle: String,
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub message_attributes: HashMap<String, DeliveryAttribute>,
}

impl DeliveryRecord {
    /// String value of a message attribute, if present.
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.message_attributes
            .get(name)
            .and_then(|a| a.string_value.as_deref())
    }
}

/// Message attribute as it appears on a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttribute {
    pub string_value: Option<String>,
    pub data_type: String,
}

impl From<&MessageAttribute> for DeliveryAttribute {
    fn from(attribute: &MessageAttribute) -> Self {
        Self {
            string_value: Some(attribute.string_value.clone()),
            data_type: attribute.data_type.as_str().to_string(),
        }
    }
}
