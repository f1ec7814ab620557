//! Receiver: validates an inbound claim event and enqueues it.
//!
//! The receiver sits on the untrusted side of the system. Every event is
//! checked before anything touches the network, and every failure becomes
//! one of a small set of result strings; nothing is raised to the caller.
//! There is no retry here: the caller is synchronous and can resubmit.
//!
//! The queue is a standard at-least-once queue. Duplicate deliveries are
//! harmless because the sender upserts on the claim number. Two quick
//! updates to the same claim can still be delivered out of order and the
//! older one may win in the CRM; this is accepted, not handled.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::queue::{ClaimNumber, OutboundMessage, QueueClient, SendReceipt};
use crate::settings::ConfigSource;

pub const SENT_MESSAGE: &str = "Sent to queue";
pub const INVALID_INPUT_MESSAGE: &str =
    "You passed an event that is not proper JSON or lacks a body or claim number";
pub const CONFIG_ERROR_MESSAGE: &str = "Error accessing config";
pub const SEND_FAILED_MESSAGE: &str = "Error calling queue";

/// Result of one receiver invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverOutcome {
    /// The queue acknowledged the message.
    Sent { request_id: String },
    /// Not JSON, or `body` / `number` missing or unusable.
    InvalidInput,
    /// Queue settings could not be read.
    ConfigError,
    /// The queue did not acknowledge the send.
    SendFailed,
}

impl ReceiverOutcome {
    /// Human-readable result string returned to the caller.
    pub fn message(&self) -> &'static str {
        match self {
            ReceiverOutcome::Sent { .. } => SENT_MESSAGE,
            ReceiverOutcome::InvalidInput => INVALID_INPUT_MESSAGE,
            ReceiverOutcome::ConfigError => CONFIG_ERROR_MESSAGE,
            ReceiverOutcome::SendFailed => SEND_FAILED_MESSAGE,
        }
    }

    /// Short machine-readable status.
    pub fn code(&self) -> &'static str {
        match self {
            ReceiverOutcome::Sent { .. } => "sent",
            ReceiverOutcome::InvalidInput => "invalid_input",
            ReceiverOutcome::ConfigError => "config_error",
            ReceiverOutcome::SendFailed => "send_failed",
        }
    }
}

/// Inbound event as the API gateway hands it over.
#[derive(Debug, Deserialize)]
struct ClaimEvent {
    body: Option<Value>,
    number: Option<Value>,
}

/// A claim event that passed intake validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedClaim {
    payload: Map<String, Value>,
    claim_number: ClaimNumber,
}

impl ValidatedClaim {
    /// Validate raw event bytes.
    pub fn from_event(raw: &[u8]) -> RelayResult<Self> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|e| RelayError::InvalidInput(format!("event is not JSON: {e}")))?;
        if !value.is_object() {
            return Err(RelayError::InvalidInput("event is not a JSON object".to_string()));
        }

        let event: ClaimEvent = serde_json::from_value(value)
            .map_err(|e| RelayError::InvalidInput(format!("event has an unexpected shape: {e}")))?;

        let payload = match event.body {
            Some(Value::Object(payload)) => payload,
            Some(_) => return Err(RelayError::InvalidInput("body is not an object".to_string())),
            None => return Err(RelayError::InvalidInput("body is missing".to_string())),
        };

        let number = event
            .number
            .ok_or_else(|| RelayError::InvalidInput("number is missing".to_string()))?;
        let claim_number = ClaimNumber::from_json(&number)
            .ok_or_else(|| RelayError::InvalidInput(format!("number {number} is not numeric")))?;

        Ok(Self {
            payload,
            claim_number,
        })
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn claim_number(&self) -> &ClaimNumber {
        &self.claim_number
    }

    /// Queue message for this claim, stamped with the current time.
    pub fn to_message(&self) -> RelayResult<OutboundMessage> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        OutboundMessage::for_claim(&self.payload, &self.claim_number, timestamp)
            .map_err(|e| RelayError::InvalidInput(format!("failed to serialize claim: {e}")))
    }
}

/// Validates inbound claims and sends them to the queue.
#[derive(Clone)]
pub struct Receiver {
    queue: Arc<dyn QueueClient>,
    settings: Arc<dyn ConfigSource>,
}

impl Receiver {
    pub fn new(queue: Arc<dyn QueueClient>, settings: Arc<dyn ConfigSource>) -> Self {
        Self { queue, settings }
    }

    /// Handle one inbound event. Never fails; the outcome says what happened.
    pub async fn handle(&self, event: &[u8]) -> ReceiverOutcome {
        info!(event_length = event.len(), "claim_event_received");

        let claim = match ValidatedClaim::from_event(event) {
            Ok(claim) => claim,
            Err(e) => {
                warn!(error = %e, "claim_event_invalid");
                return ReceiverOutcome::InvalidInput;
            }
        };

        let message = match claim.to_message() {
            Ok(message) => message,
            Err(e) => {
                warn!(claim_number = %claim.claim_number, error = %e, "claim_message_build_failed");
                return ReceiverOutcome::InvalidInput;
            }
        };

        let queue_url = match self.settings.receiver_settings().await {
            Ok(settings) => settings.queue_url,
            Err(e) => {
                error!(claim_number = %claim.claim_number, error = %e, "receiver_config_failed");
                return ReceiverOutcome::ConfigError;
            }
        };

        match self.send(&message, &queue_url).await {
            Ok(receipt) => {
                info!(
                    claim_number = %claim.claim_number,
                    request_id = %receipt.request_id,
                    "claim_enqueued"
                );
                ReceiverOutcome::Sent {
                    request_id: receipt.request_id,
                }
            }
            Err(e) => {
                error!(claim_number = %claim.claim_number, error = %e, "claim_send_failed");
                ReceiverOutcome::SendFailed
            }
        }
    }

    /// Exactly one send attempt; an empty request id counts as a failure.
    async fn send(&self, message: &OutboundMessage, queue_url: &str) -> RelayResult<SendReceipt> {
        let receipt = self.queue.send(message, queue_url).await?;

        if receipt.request_id.is_empty() {
            return Err(RelayError::Transport(
                "queue response carried no request id".to_string(),
            ));
        }

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AttributeDataType, MockQueueClient, CLAIM_NUMBER_ATTRIBUTE, TIMESTAMP_ATTRIBUTE};
    use crate::settings::{MockConfigSource, ReceiverSettings};

    const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/632522679498/defaultQueue";
    const CLAIM_EVENT: &str = r#"{"body":{"Name":"Joe Schmo's testing claim"},"number":33}"#;

    fn configured() -> MockConfigSource {
        let mut settings = MockConfigSource::new();
        settings.expect_receiver_settings().returning(|| {
            Ok(ReceiverSettings {
                queue_url: QUEUE_URL.to_string(),
            })
        });
        settings
    }

    fn receiver(queue: MockQueueClient, settings: MockConfigSource) -> Receiver {
        Receiver::new(Arc::new(queue), Arc::new(settings))
    }

    #[tokio::test]
    async fn test_sends_claim_to_queue() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_send()
            .withf(|message, queue_url| {
                let number = message.attribute(CLAIM_NUMBER_ATTRIBUTE);
                let timestamp = message.attribute(TIMESTAMP_ATTRIBUTE);
                message.message_body == r#"{"Name":"Joe Schmo's testing claim"}"#
                    && message.delay_seconds == 10
                    && number.map(|a| (a.data_type, a.string_value.as_str()))
                        == Some((AttributeDataType::Number, "33"))
                    && timestamp.map(|a| a.data_type) == Some(AttributeDataType::String)
                    && queue_url == QUEUE_URL
            })
            .times(1)
            .returning(|_, _| {
                Ok(SendReceipt {
                    request_id: "req-1".to_string(),
                })
            });

        let outcome = receiver(queue, configured()).handle(CLAIM_EVENT.as_bytes()).await;

        assert_eq!(
            outcome,
            ReceiverOutcome::Sent {
                request_id: "req-1".to_string()
            }
        );
        assert_eq!(outcome.message(), "Sent to queue");
    }

    #[tokio::test]
    async fn test_accepts_numeric_string_claim_number() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_send()
            .withf(|message, _| {
                message.attribute(CLAIM_NUMBER_ATTRIBUTE).map(|a| a.string_value.as_str()) == Some("33")
            })
            .times(1)
            .returning(|_, _| {
                Ok(SendReceipt {
                    request_id: "req-2".to_string(),
                })
            });

        let event = r#"{"body":{"Name":"claim"},"number":"33"}"#;
        let outcome = receiver(queue, configured()).handle(event.as_bytes()).await;

        assert!(matches!(outcome, ReceiverOutcome::Sent { .. }));
    }

    #[tokio::test]
    async fn test_rejects_invalid_events_without_side_effects() {
        let invalid_events = [
            format!("}}{CLAIM_EVENT}22"),
            r#"{"notWhatWereLookingFor":"ValueHere"}"#.to_string(),
            r#"{"body":{"Name":"claim"}}"#.to_string(),
            r#"{"number":33}"#.to_string(),
            r#"{"body":null,"number":33}"#.to_string(),
            r#"{"body":{"Name":"claim"},"number":null}"#.to_string(),
            r#"{"body":"just a string","number":33}"#.to_string(),
            r#"{"body":{"Name":"claim"},"number":"CLM-33"}"#.to_string(),
            r#"[1,2,3]"#.to_string(),
            r#"[{"Name":"claim"},33]"#.to_string(),
            String::new(),
        ];

        for event in invalid_events {
            // Neither mock has expectations, so any call would panic.
            let outcome = receiver(MockQueueClient::new(), MockConfigSource::new())
                .handle(event.as_bytes())
                .await;

            assert_eq!(outcome, ReceiverOutcome::InvalidInput, "event: {event}");
            assert_eq!(outcome.message(), INVALID_INPUT_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_config_failure_skips_send() {
        let mut settings = MockConfigSource::new();
        settings
            .expect_receiver_settings()
            .times(1)
            .returning(|| Err(RelayError::Config("local_config.json missing".to_string())));

        let outcome = receiver(MockQueueClient::new(), settings)
            .handle(CLAIM_EVENT.as_bytes())
            .await;

        assert_eq!(outcome, ReceiverOutcome::ConfigError);
        assert_eq!(outcome.message(), "Error accessing config");
    }

    #[tokio::test]
    async fn test_send_failure_is_reported_not_retried() {
        let mut queue = MockQueueClient::new();
        queue
            .expect_send()
            .times(1)
            .returning(|_, _| Err(RelayError::Transport("connection refused".to_string())));

        let outcome = receiver(queue, configured()).handle(CLAIM_EVENT.as_bytes()).await;

        assert_eq!(outcome, ReceiverOutcome::SendFailed);
        assert_eq!(outcome.message(), SEND_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn test_send_without_request_id_fails() {
        let mut queue = MockQueueClient::new();
        queue.expect_send().times(1).returning(|_, _| {
            Ok(SendReceipt {
                request_id: String::new(),
            })
        });

        let outcome = receiver(queue, configured()).handle(CLAIM_EVENT.as_bytes()).await;

        assert_eq!(outcome, ReceiverOutcome::SendFailed);
    }

    #[test]
    fn test_validated_claim_keeps_payload_only() {
        let claim = ValidatedClaim::from_event(CLAIM_EVENT.as_bytes()).unwrap();
        let message = claim.to_message().unwrap();

        assert_eq!(claim.claim_number().as_str(), "33");
        assert_eq!(claim.payload().len(), 1);
        assert!(!message.message_body.contains("number"));

        let round_trip: Map<String, Value> = serde_json::from_str(&message.message_body).unwrap();
        assert_eq!(&round_trip, claim.payload());
    }

    #[test]
    fn test_timestamp_is_iso_8601_millis() {
        let claim = ValidatedClaim::from_event(CLAIM_EVENT.as_bytes()).unwrap();
        let message = claim.to_message().unwrap();
        let timestamp = &message.attribute(TIMESTAMP_ATTRIBUTE).unwrap().string_value;

        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
        assert!(timestamp.ends_with('Z'));
        assert_eq!(timestamp.len(), "2021-01-25T23:23:46.375Z".len());
    }
}
