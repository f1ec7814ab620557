//! Sender: upserts a delivered claim into the CRM, then deletes the message.
//!
//! Deliveries come from our own queue, so the payload is not re-validated:
//! the receiver already did that and the body is forwarded to the CRM as-is.
//!
//! Each step depends on the previous one:
//!
//! ```text
//! received → token_acquired → upserted → acknowledged
//!     ↓            ↓              ↓             ↘
//! config_failed token_failed upsert_failed    ack_failed
//! ```
//!
//! The three `*_failed` states return an error and leave the message on the
//! queue, which redelivers it later (and dead-letters it after too many
//! attempts). `ack_failed` is not an error: the claim is already in the CRM
//! and a redelivery only repeats an idempotent upsert.
//!
//! Only one record per event is processed.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::crm::{AccessToken, CrmClient, UpsertResponse};
use crate::error::{RelayError, RelayResult};
use crate::queue::{DeliveryEvent, QueueClient, CLAIM_NUMBER_ATTRIBUTE, RECEIVE_COUNT_ATTRIBUTE};
use crate::settings::{ConfigSource, SenderSettings};

pub const ACK_FAILED_MESSAGE: &str = "Error deleting from queue or the message doesnt exist";

/// Where a delivery got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    TokenAcquired,
    Upserted,
    Acknowledged,
    ConfigFailed,
    TokenFailed,
    UpsertFailed,
    AckFailed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Received => "received",
            DeliveryState::TokenAcquired => "token_acquired",
            DeliveryState::Upserted => "upserted",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::ConfigFailed => "config_failed",
            DeliveryState::TokenFailed => "token_failed",
            DeliveryState::UpsertFailed => "upsert_failed",
            DeliveryState::AckFailed => "ack_failed",
        }
    }

    /// States that abort the invocation and leave the message for redelivery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryState::ConfigFailed | DeliveryState::TokenFailed | DeliveryState::UpsertFailed
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery from the internal queue, taken at face value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedDelivery {
    pub message_id: String,
    pub receipt_handle: String,
    pub claim_number: String,
    pub payload: String,
    pub receive_count: Option<u32>,
}

impl TrustedDelivery {
    /// Take the first record of the event.
    ///
    /// Fails only when there is nothing to work with: no record, or no claim
    /// number to key the upsert on.
    pub fn from_event(event: &DeliveryEvent) -> RelayResult<Self> {
        let record = event
            .records
            .first()
            .ok_or_else(|| RelayError::MalformedDelivery("event carries no records".to_string()))?;

        if event.records.len() > 1 {
            warn!(
                record_count = event.records.len(),
                "delivery_batch_unsupported_processing_first"
            );
        }

        let claim_number = record
            .attribute_value(CLAIM_NUMBER_ATTRIBUTE)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                RelayError::MalformedDelivery(format!(
                    "message {} has no {CLAIM_NUMBER_ATTRIBUTE} attribute",
                    record.message_id
                ))
            })?;

        Ok(Self {
            message_id: record.message_id.clone(),
            receipt_handle: record.receipt_handle.clone(),
            claim_number: claim_number.to_string(),
            payload: record.body.clone(),
            receive_count: record
                .attributes
                .get(RECEIVE_COUNT_ATTRIBUTE)
                .and_then(|c| c.parse().ok()),
        })
    }
}

/// Outcome of a delivery whose upsert succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct SenderReport {
    pub claim_number: String,
    /// `Acknowledged` or `AckFailed`.
    pub state: DeliveryState,
    pub upsert: UpsertResponse,
    /// Soft error recorded when the delete failed.
    pub ack_error: Option<String>,
}

impl SenderReport {
    pub fn acknowledged(&self) -> bool {
        self.state == DeliveryState::Acknowledged
    }
}

/// Tracks and logs the state of one delivery.
struct DeliveryTracker<'a> {
    delivery: &'a TrustedDelivery,
    state: DeliveryState,
}

impl<'a> DeliveryTracker<'a> {
    fn new(delivery: &'a TrustedDelivery) -> Self {
        info!(
            message_id = %delivery.message_id,
            claim_number = %delivery.claim_number,
            receive_count = ?delivery.receive_count,
            state = %DeliveryState::Received,
            "delivery_received"
        );
        Self {
            delivery,
            state: DeliveryState::Received,
        }
    }

    fn advance(&mut self, next: DeliveryState) {
        if next.is_fatal() || next == DeliveryState::AckFailed {
            warn!(
                message_id = %self.delivery.message_id,
                claim_number = %self.delivery.claim_number,
                from = %self.state,
                to = %next,
                "delivery_state_changed"
            );
        } else {
            info!(
                message_id = %self.delivery.message_id,
                claim_number = %self.delivery.claim_number,
                from = %self.state,
                to = %next,
                "delivery_state_changed"
            );
        }
        self.state = next;
    }

    /// Move to a fatal state and hand the error back for propagation.
    fn fail(&mut self, next: DeliveryState, e: RelayError) -> RelayError {
        self.advance(next);
        error!(
            message_id = %self.delivery.message_id,
            claim_number = %self.delivery.claim_number,
            state = %next,
            error = %e,
            "delivery_failed_leaving_for_redelivery"
        );
        e
    }
}

/// Relays queue deliveries into the CRM.
#[derive(Clone)]
pub struct Sender {
    queue: Arc<dyn QueueClient>,
    crm: Arc<dyn CrmClient>,
    settings: Arc<dyn ConfigSource>,
}

impl Sender {
    pub fn new(queue: Arc<dyn QueueClient>, crm: Arc<dyn CrmClient>, settings: Arc<dyn ConfigSource>) -> Self {
        Self { queue, crm, settings }
    }

    /// Handle one queue delivery.
    ///
    /// Returns an error for every failure that should lead to redelivery.
    pub async fn handle(&self, event: &DeliveryEvent) -> RelayResult<SenderReport> {
        let delivery = TrustedDelivery::from_event(event).inspect_err(|e| {
            error!(error = %e, "delivery_unreadable");
        })?;
        let mut tracker = DeliveryTracker::new(&delivery);

        let settings = match self.settings.sender_settings().await {
            Ok(settings) => settings,
            Err(e) => return Err(tracker.fail(DeliveryState::ConfigFailed, e)),
        };
        let base_url = match settings.crm_base_url() {
            Ok(url) => url,
            Err(e) => return Err(tracker.fail(DeliveryState::ConfigFailed, e)),
        };

        let token = match self.crm.fetch_token(&base_url, &settings.credentials()).await {
            Ok(token) => token,
            Err(e) => return Err(tracker.fail(DeliveryState::TokenFailed, e)),
        };
        tracker.advance(DeliveryState::TokenAcquired);

        let upsert = match self.upsert(&base_url, &token, &delivery).await {
            Ok(upsert) => upsert,
            Err(e) => return Err(tracker.fail(DeliveryState::UpsertFailed, e)),
        };
        tracker.advance(DeliveryState::Upserted);

        let ack_error = self.acknowledge(&delivery, &settings).await;
        tracker.advance(if ack_error.is_some() {
            DeliveryState::AckFailed
        } else {
            DeliveryState::Acknowledged
        });

        Ok(SenderReport {
            claim_number: delivery.claim_number.clone(),
            state: tracker.state,
            upsert,
            ack_error,
        })
    }

    async fn upsert(
        &self,
        base_url: &url::Url,
        token: &AccessToken,
        delivery: &TrustedDelivery,
    ) -> RelayResult<UpsertResponse> {
        let response = self
            .crm
            .upsert_claim(base_url, token, &delivery.claim_number, &delivery.payload)
            .await?;

        // Implementations already check this; a fake or a future client might not.
        if !response.is_success() {
            return Err(RelayError::UpsertRejected {
                claim_number: delivery.claim_number.clone(),
                reason: format!("success flag was {:?}", response.success),
            });
        }

        Ok(response)
    }

    /// Delete the delivery. Failures are returned as a soft error string.
    async fn acknowledge(&self, delivery: &TrustedDelivery, settings: &SenderSettings) -> Option<String> {
        match self.queue.delete(&delivery.receipt_handle, &settings.queue_url).await {
            Ok(()) => {
                info!(
                    message_id = %delivery.message_id,
                    claim_number = %delivery.claim_number,
                    "delivery_deleted"
                );
                None
            }
            Err(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    claim_number = %delivery.claim_number,
                    error = %e,
                    "delivery_delete_failed_claim_already_upserted"
                );
                Some(ACK_FAILED_MESSAGE.to_string())
            }
        }
    }
}
