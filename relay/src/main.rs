//! Claims Sender - RabbitMQ consumer that upserts claims into Salesforce.
//!
//! Each delivery from the claims queue is upserted by claim number and only
//! then deleted from the queue. Failed deliveries go back to the queue for a
//! later attempt.

mod consumer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use claims_relay::{AmqpQueue, Config, ConfigSource, FileConfigSource, SalesforceClient, Sender};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("sender_starting");

    let config = Config::from_env();
    tracing::info!(
        cloudamqp_url_set = !config.cloudamqp_url.is_empty(),
        sender_config_path = %config.sender_config_path,
        concurrency = config.worker_concurrency,
        visibility_timeout_secs = config.visibility_timeout_secs,
        crm_sobject = %config.crm_sobject,
        "config_loaded"
    );

    let settings = Arc::new(FileConfigSource::new(
        &config.receiver_config_path,
        &config.sender_config_path,
    ));

    // The queue to consume comes from the same file the sender re-reads per delivery.
    let queue_url = settings
        .sender_settings()
        .await
        .context("Failed to read sender settings")?
        .queue_url;

    let queue = AmqpQueue::new(config.cloudamqp_url.clone(), config.max_receive_count);
    let crm = SalesforceClient::from_config(&config).context("Failed to create CRM client")?;
    let sender = Sender::new(Arc::new(queue.clone()), Arc::new(crm), settings);

    let result = consumer::run(Arc::new(config), queue.clone(), sender, queue_url).await;

    queue.close().await;

    result
}
