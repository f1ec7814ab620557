//! RabbitMQ implementation of [`QueueClient`].
//!
//! Each logical queue `q` is backed by three broker queues:
//!
//! ```text
//! send → q.delay ──(expires after DelaySeconds)──▶ q ──(delivery limit)──▶ q.dead_letter
//! ```
//!
//! `q` is a quorum queue so the broker counts deliveries and dead-letters a
//! message once it has been received `max_receive_count` times. Nothing in
//! this crate consumes `q.dead_letter`.
//!
//! Receipt handles are `<generation>.<delivery tag>`. Delivery tags are only
//! meaningful on the channel that issued them, so the generation is bumped
//! on every reconnect and handles from an older channel are refused.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use super::client::{queue_name, QueueClient};
use super::types::{
    AttributeDataType, DeliveryAttribute, DeliveryRecord, MessageAttribute, OutboundMessage,
    SendReceipt, RECEIVE_COUNT_ATTRIBUTE,
};
use crate::error::{RelayError, RelayResult};

const DATA_TYPE_KEY: &str = "DataType";
const STRING_VALUE_KEY: &str = "StringValue";

/// Broker header quorum queues use to count earlier deliveries.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Names of the broker queues behind one logical queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub main: String,
    pub delay: String,
    pub dead_letter: String,
}

impl QueueTopology {
    pub fn new(name: &str) -> Self {
        Self {
            main: name.to_string(),
            delay: format!("{name}.delay"),
            dead_letter: format!("{name}.dead_letter"),
        }
    }

    fn from_url(queue_url: &str) -> RelayResult<Self> {
        queue_name(queue_url)
            .map(|name| Self::new(&name))
            .ok_or_else(|| RelayError::Config(format!("queue url {queue_url:?} names no queue")))
    }
}

/// Opaque per-delivery token, scoped to one channel generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptHandle {
    pub generation: u64,
    pub delivery_tag: u64,
}

impl ReceiptHandle {
    pub fn encode(&self) -> String {
        format!("{}.{}", self.generation, self.delivery_tag)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let (generation, tag) = raw.split_once('.')?;
        Some(Self {
            generation: generation.parse().ok()?,
            delivery_tag: tag.parse().ok()?,
        })
    }
}

/// RabbitMQ queue client with connection management.
///
/// The same channel publishes, consumes and acknowledges, so receipt handles
/// handed out by [`AmqpQueue::consume`] can be honoured by
/// [`QueueClient::delete`].
#[derive(Clone)]
pub struct AmqpQueue {
    inner: Arc<AmqpQueueInner>,
}

struct AmqpQueueInner {
    url: String,
    max_receive_count: u32,
    state: RwLock<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    generation: u64,
    declared: HashSet<String>,
}

impl AmqpQueue {
    /// Create a client for the broker at `url`. Connects lazily.
    pub fn new(url: String, max_receive_count: u32) -> Self {
        Self {
            inner: Arc::new(AmqpQueueInner {
                url,
                max_receive_count,
                state: RwLock::new(ChannelState::default()),
            }),
        }
    }

    /// Ensure we have a valid channel and return it with its generation.
    async fn ensure_connected(&self) -> RelayResult<(Channel, u64)> {
        {
            let state = self.inner.state.read().await;
            if let Some(ch) = state.channel.as_ref() {
                if ch.status().connected() {
                    return Ok((ch.clone(), state.generation));
                }
            }
        }

        let mut state = self.inner.state.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = state.channel.as_ref() {
            if ch.status().connected() {
                return Ok((ch.clone(), state.generation));
            }
        }

        info!("rabbitmq_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default()).await?;

        info!("rabbitmq_connected");

        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;

        state.generation += 1;
        state.declared.clear();
        state.connection = Some(conn);
        state.channel = Some(ch.clone());

        info!(generation = state.generation, "rabbitmq_channel_created");

        Ok((ch, state.generation))
    }

    /// Declare the broker queues behind `topology` once per channel.
    async fn ensure_declared(&self, channel: &Channel, topology: &QueueTopology) -> RelayResult<()> {
        if self.inner.state.read().await.declared.contains(&topology.main) {
            return Ok(());
        }

        channel
            .queue_declare(&topology.dead_letter, durable(), FieldTable::default())
            .await?;

        let mut main_args = FieldTable::default();
        main_args.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        main_args.insert(
            "x-delivery-limit".into(),
            AMQPValue::LongInt(delivery_limit(self.inner.max_receive_count)),
        );
        main_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        main_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(topology.dead_letter.as_str().into()),
        );
        channel.queue_declare(&topology.main, durable(), main_args).await?;

        let mut delay_args = FieldTable::default();
        delay_args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
        delay_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(topology.main.as_str().into()),
        );
        channel.queue_declare(&topology.delay, durable(), delay_args).await?;

        info!(
            queue = %topology.main,
            delay_queue = %topology.delay,
            dead_letter_queue = %topology.dead_letter,
            max_receive_count = self.inner.max_receive_count,
            "rabbitmq_queues_declared"
        );

        self.inner.state.write().await.declared.insert(topology.main.clone());

        Ok(())
    }

    /// Start consuming the queue `queue_url` points at.
    ///
    /// Returns the consumer and the generation its receipt handles belong to.
    pub async fn consume(
        &self,
        queue_url: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> anyhow::Result<(Consumer, u64)> {
        let topology = QueueTopology::from_url(queue_url)?;
        let (channel, generation) = self.ensure_connected().await?;
        self.ensure_declared(&channel, &topology).await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .context("Failed to set QoS")?;

        info!(prefetch_count = prefetch, "rabbitmq_qos_set");

        let consumer = channel
            .basic_consume(
                &topology.main,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("Failed to start consumer")?;

        info!(queue = %topology.main, generation = generation, "rabbitmq_consumer_started");

        Ok((consumer, generation))
    }

    /// Hand a delivery back to the queue for a later attempt.
    pub async fn release(&self, receipt_handle: &str) -> RelayResult<()> {
        let (channel, handle) = self.channel_for(receipt_handle).await?;

        channel
            .basic_nack(
                handle.delivery_tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await?;

        info!(receipt_handle = %receipt_handle, "rabbitmq_delivery_released");

        Ok(())
    }

    /// Channel a receipt handle belongs to, if it is still the live one.
    async fn channel_for(&self, receipt_handle: &str) -> RelayResult<(Channel, ReceiptHandle)> {
        let handle = ReceiptHandle::parse(receipt_handle)
            .ok_or_else(|| RelayError::Transport(format!("unrecognised receipt handle {receipt_handle:?}")))?;

        let state = self.inner.state.read().await;
        match state.channel.as_ref() {
            Some(ch) if ch.status().connected() && state.generation == handle.generation => {
                Ok((ch.clone(), handle))
            }
            _ => Err(RelayError::Transport(format!(
                "receipt handle {receipt_handle:?} expired with its channel"
            ))),
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut state = self.inner.state.write().await;

        if let Some(ch) = state.channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = state.connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_queue_closed");
    }
}

#[async_trait]
impl QueueClient for AmqpQueue {
    async fn send(&self, message: &OutboundMessage, queue_url: &str) -> RelayResult<SendReceipt> {
        let topology = QueueTopology::from_url(queue_url)?;
        let (channel, _) = self.ensure_connected().await?;
        self.ensure_declared(&channel, &topology).await?;

        let message_id = Uuid::new_v4().to_string();
        let expiration_ms = u64::from(message.delay_seconds) * 1000;

        let confirmation = channel
            .basic_publish(
                "",
                &topology.delay,
                BasicPublishOptions::default(),
                message.message_body.as_bytes(),
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.as_str().into())
                    .with_timestamp(Utc::now().timestamp().max(0) as u64)
                    .with_expiration(expiration_ms.to_string().into())
                    .with_headers(attributes_to_headers(message)),
            )
            .await?
            .await?;

        if !confirmation.is_ack() {
            warn!(queue = %topology.main, message_id = %message_id, "rabbitmq_publish_not_confirmed");
            return Err(RelayError::Transport(format!(
                "broker did not confirm message {message_id}"
            )));
        }

        info!(
            queue = %topology.main,
            message_id = %message_id,
            body_length = message.message_body.len(),
            delay_seconds = message.delay_seconds,
            "rabbitmq_claim_published"
        );

        Ok(SendReceipt {
            request_id: message_id,
        })
    }

    async fn delete(&self, receipt_handle: &str, queue_url: &str) -> RelayResult<()> {
        let (channel, handle) = self.channel_for(receipt_handle).await?;

        channel
            .basic_ack(handle.delivery_tag, BasicAckOptions::default())
            .await?;

        info!(queue_url = %queue_url, receipt_handle = %receipt_handle, "rabbitmq_delivery_deleted");

        Ok(())
    }
}

/// `x-delivery-limit` counts redeliveries, not receives.
fn delivery_limit(max_receive_count: u32) -> i32 {
    i32::try_from(max_receive_count.saturating_sub(1)).unwrap_or(i32::MAX)
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

/// Encode message attributes as `{ name: { DataType, StringValue } }` headers.
fn attributes_to_headers(message: &OutboundMessage) -> FieldTable {
    let mut headers = FieldTable::default();

    for (name, attribute) in &message.message_attributes {
        let mut entry = FieldTable::default();
        entry.insert(
            DATA_TYPE_KEY.into(),
            AMQPValue::LongString(attribute.data_type.as_str().into()),
        );
        entry.insert(
            STRING_VALUE_KEY.into(),
            AMQPValue::LongString(attribute.string_value.as_str().into()),
        );
        headers.insert(ShortString::from(name.as_str()), AMQPValue::FieldTable(entry));
    }

    headers
}

/// Decode attribute headers written by [`attributes_to_headers`].
fn headers_to_attributes(headers: &FieldTable) -> HashMap<String, DeliveryAttribute> {
    headers
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let AMQPValue::FieldTable(entry) = value else {
                return None;
            };
            let data_type = field(entry, DATA_TYPE_KEY)
                .and_then(amqp_string)
                .and_then(|raw| AttributeDataType::parse(&raw))?;
            let string_value = field(entry, STRING_VALUE_KEY).and_then(amqp_string);

            let attribute = MessageAttribute {
                data_type,
                string_value: string_value.unwrap_or_default(),
            };
            Some((name.as_str().to_string(), DeliveryAttribute::from(&attribute)))
        })
        .collect()
}

fn field<'a>(table: &'a FieldTable, key: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(name, _)| name.as_str() == key)
        .map(|(_, value)| value)
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(long_string(s)),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

fn long_string(s: &LongString) -> String {
    String::from_utf8_lossy(s.as_bytes()).into_owned()
}

fn delivery_count(headers: &FieldTable) -> u64 {
    match field(headers, DELIVERY_COUNT_HEADER) {
        Some(AMQPValue::LongLongInt(n)) => (*n).max(0) as u64,
        Some(AMQPValue::LongInt(n)) => (*n).max(0) as u64,
        Some(AMQPValue::ShortInt(n)) => (*n).max(0) as u64,
        _ => 0,
    }
}

/// Convert a broker delivery into the record the sender consumes.
pub fn delivery_record(delivery: &Delivery, generation: u64) -> DeliveryRecord {
    let receipt_handle = ReceiptHandle {
        generation,
        delivery_tag: delivery.delivery_tag,
    };

    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let empty = FieldTable::default();
    let headers = delivery.properties.headers().as_ref().unwrap_or(&empty);

    let mut attributes = HashMap::new();
    attributes.insert(
        RECEIVE_COUNT_ATTRIBUTE.to_string(),
        (delivery_count(headers) + 1).to_string(),
    );

    DeliveryRecord {
        message_id,
        receipt_handle: receipt_handle.encode(),
        body: String::from_utf8_lossy(&delivery.data).into_owned(),
        attributes,
        message_attributes: headers_to_attributes(headers),
    }
}
