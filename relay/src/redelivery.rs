//! What happens to a delivery after the sender has seen it.
//!
//! A successful delivery was already deleted by the sender. A failed one is
//! held for the visibility timeout and then released back to the queue, so
//! the next attempt gets a fresh receipt handle. The broker dead-letters the
//! message once it has been received `MAX_RECEIVE_COUNT` times.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::error::RelayResult;
use crate::queue::{AmqpQueue, DeliveryEvent, DeliveryRecord};
use crate::sender::{Sender, SenderReport};

/// Hands an unfinished delivery back to the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryRelease: Send + Sync {
    async fn release(&self, receipt_handle: &str) -> RelayResult<()>;
}

#[async_trait]
impl DeliveryRelease for AmqpQueue {
    async fn release(&self, receipt_handle: &str) -> RelayResult<()> {
        AmqpQueue::release(self, receipt_handle).await
    }
}

/// Final disposition of one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Upserted; the sender deleted it (or tried to).
    Completed(SenderReport),
    /// Failed and handed back for another attempt.
    Released,
    /// Failed and could not be handed back. The broker requeues it once the
    /// channel that holds it closes.
    ReleaseFailed,
}

/// Run one delivery through the sender and settle it.
pub async fn settle_delivery(
    sender: &Sender,
    release: &dyn DeliveryRelease,
    record: DeliveryRecord,
    visibility_timeout: Duration,
) -> Disposition {
    let receipt_handle = record.receipt_handle.clone();
    let message_id = record.message_id.clone();

    let e = match sender.handle(&DeliveryEvent::single(record)).await {
        Ok(report) => {
            info!(
                message_id = %message_id,
                claim_number = %report.claim_number,
                state = %report.state,
                created = ?report.upsert.created,
                "rabbitmq_delivery_completed"
            );
            return Disposition::Completed(report);
        }
        Err(e) => e,
    };

    warn!(
        message_id = %message_id,
        error = %e,
        visibility_timeout_secs = visibility_timeout.as_secs(),
        "rabbitmq_delivery_failed_will_retry"
    );

    tokio::time::sleep(visibility_timeout).await;

    match release.release(&receipt_handle).await {
        Ok(()) => Disposition::Released,
        Err(e) => {
            error!(
                message_id = %message_id,
                error = %e,
                "rabbitmq_release_failed"
            );
            Disposition::ReleaseFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::{AccessToken, MockCrmClient, UpsertResponse};
    use crate::error::RelayError;
    use crate::queue::{DeliveryAttribute, MockQueueClient, CLAIM_NUMBER_ATTRIBUTE};
    use crate::settings::{MockConfigSource, SenderSettings};
    use crate::sender::DeliveryState;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::time::Instant;

    const RECEIPT_HANDLE: &str = "3.17";
    const QUEUE_URL: &str = "claims";

    fn record() -> DeliveryRecord {
        let mut message_attributes = HashMap::new();
        message_attributes.insert(
            CLAIM_NUMBER_ATTRIBUTE.to_string(),
            DeliveryAttribute {
                string_value: Some("33".to_string()),
                data_type: "Number".to_string(),
            },
        );

        DeliveryRecord {
            message_id: "msg-1".to_string(),
            receipt_handle: RECEIPT_HANDLE.to_string(),
            body: r#"{"Name":"Joe Schmo's testing claim"}"#.to_string(),
            attributes: HashMap::new(),
            message_attributes,
        }
    }

    fn configured() -> MockConfigSource {
        let mut settings = MockConfigSource::new();
        settings.expect_sender_settings().returning(|| {
            Ok(SenderSettings {
                sf_instance_name: "example.my.salesforce.com".to_string(),
                client_id: "client-id".to_string(),
                client_secret: "client-secret".to_string(),
                username: "user@example.com".to_string(),
                password: "pass".to_string(),
                security_token: "TOKEN".to_string(),
                queue_url: QUEUE_URL.to_string(),
            })
        });
        settings
    }

    fn crm(upsert_succeeds: bool) -> MockCrmClient {
        let mut crm = MockCrmClient::new();
        crm.expect_fetch_token()
            .returning(|_, _| Ok(AccessToken::new("00Dxx!abc")));
        crm.expect_upsert_claim().returning(move |_, _, claim_number, _| {
            if upsert_succeeds {
                Ok(UpsertResponse {
                    id: Some("a0B".to_string()),
                    success: Some(true),
                    created: Some(true),
                    errors: vec![],
                })
            } else {
                Err(RelayError::UpsertRejected {
                    claim_number: claim_number.to_string(),
                    reason: "UNABLE_TO_LOCK_ROW".to_string(),
                })
            }
        });
        crm
    }

    #[tokio::test]
    async fn test_success_is_not_released() {
        let mut queue = MockQueueClient::new();
        queue.expect_delete().times(1).returning(|_, _| Ok(()));
        let sender = Sender::new(Arc::new(queue), Arc::new(crm(true)), Arc::new(configured()));

        let mut release = MockDeliveryRelease::new();
        release.expect_release().times(0);

        let disposition = settle_delivery(&sender, &release, record(), Duration::ZERO).await;

        match disposition {
            Disposition::Completed(report) => assert_eq!(report.state, DeliveryState::Acknowledged),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_is_released_once_after_timeout() {
        let queue = MockQueueClient::new();
        let sender = Sender::new(Arc::new(queue), Arc::new(crm(false)), Arc::new(configured()));

        let mut release = MockDeliveryRelease::new();
        release
            .expect_release()
            .withf(|receipt_handle| receipt_handle == RECEIPT_HANDLE)
            .times(1)
            .returning(|_| Ok(()));

        let started = Instant::now();
        let disposition = settle_delivery(&sender, &release, record(), Duration::from_millis(50)).await;

        assert_eq!(disposition, Disposition::Released);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unreadable_delivery_is_released() {
        let mut unreadable = record();
        unreadable.message_attributes.clear();
        let sender = Sender::new(
            Arc::new(MockQueueClient::new()),
            Arc::new(MockCrmClient::new()),
            Arc::new(MockConfigSource::new()),
        );

        let mut release = MockDeliveryRelease::new();
        release.expect_release().times(1).returning(|_| Ok(()));

        let disposition = settle_delivery(&sender, &release, unreadable, Duration::ZERO).await;

        assert_eq!(disposition, Disposition::Released);
    }

    #[tokio::test]
    async fn test_release_failure_is_reported() {
        let sender = Sender::new(
            Arc::new(MockQueueClient::new()),
            Arc::new(crm(false)),
            Arc::new(configured()),
        );

        let mut release = MockDeliveryRelease::new();
        release
            .expect_release()
            .times(1)
            .returning(|_| Err(RelayError::Transport("channel closed".to_string())));

        let disposition = settle_delivery(&sender, &release, record(), Duration::ZERO).await;

        assert_eq!(disposition, Disposition::ReleaseFailed);
    }
}
