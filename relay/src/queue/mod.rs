//! Queue module: the receiver → sender message contract and the queue client.
//!
//! ## Architecture
//!
//! ```text
//! Receiver → QueueClient::send → claims queue → Sender → QueueClient::delete
//! ```
//!
//! The queue is at-least-once and unordered. A message may reach the sender
//! more than once, and two updates to the same claim may arrive in either
//! order.

pub mod amqp;
pub mod client;
pub mod types;

pub use amqp::{delivery_record, AmqpQueue, QueueTopology, ReceiptHandle};
pub use client::{queue_name, QueueClient};
pub use types::{
    AttributeDataType, ClaimNumber, DeliveryAttribute, DeliveryEvent, DeliveryRecord,
    MessageAttribute, OutboundMessage, SendReceipt, CLAIM_NUMBER_ATTRIBUTE, DELAY_SECONDS,
    RECEIVE_COUNT_ATTRIBUTE, TIMESTAMP_ATTRIBUTE,
};

#[cfg(test)]
pub use client::MockQueueClient;
