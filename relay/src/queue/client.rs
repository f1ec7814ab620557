//! Queue collaborator interface.

use async_trait::async_trait;
use url::Url;

use super::types::{OutboundMessage, SendReceipt};
use crate::error::RelayResult;

/// Durable at-least-once queue.
///
/// Implementations only need to acknowledge sends and honour deletes by
/// receipt handle; redelivery and dead-lettering are the broker's business.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Send one message. Succeeds only when the queue hands back a request id.
    async fn send(&self, message: &OutboundMessage, queue_url: &str) -> RelayResult<SendReceipt>;

    /// Delete the delivery identified by `receipt_handle`.
    async fn delete(&self, receipt_handle: &str, queue_url: &str) -> RelayResult<()>;
}

/// Resolve the queue name a queue URL points at.
///
/// A URL (`https://sqs.us-east-1.amazonaws.com/1234/claims`) names the queue
/// with its last path segment; anything that is not a URL is taken as the
/// name itself.
pub fn queue_name(queue_url: &str) -> Option<String> {
    let trimmed = queue_url.trim();
    if trimmed.is_empty() {
        return None;
    }

    match Url::parse(trimmed) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .map(str::to_string),
        Err(_) => Some(trimmed.to_string()),
    }
}
