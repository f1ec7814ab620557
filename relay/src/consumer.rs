//! RabbitMQ consumer loop for the sender.
//!
//! Each delivery is settled by [`settle_delivery`] on its own task; the
//! prefetch count bounds how many run at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::signal;
use tracing::{error, info, warn};

use claims_relay::queue::delivery_record;
use claims_relay::{settle_delivery, AmqpQueue, Config, Sender};

const CONSUMER_TAG: &str = "claims-sender";

/// Wait before re-subscribing after the broker closed the consumer.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Consume `queue_url` until SIGINT/SIGTERM.
pub async fn run(config: Arc<Config>, queue: AmqpQueue, sender: Sender, queue_url: String) -> Result<()> {
    let prefetch_count = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
    let visibility_timeout = Duration::from_secs(config.visibility_timeout_secs);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    'subscribe: loop {
        let (mut consumer, generation) = queue
            .consume(&queue_url, CONSUMER_TAG, prefetch_count)
            .await
            .context("Failed to start consumer")?;

        info!(generation = generation, "sender_ready");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("sender_stopping");
                    break 'subscribe;
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let record = delivery_record(&delivery, generation);

                            info!(
                                message_id = %record.message_id,
                                receipt_handle = %record.receipt_handle,
                                "rabbitmq_delivery_received"
                            );

                            let queue = queue.clone();
                            let sender = sender.clone();

                            tokio::spawn(async move {
                                settle_delivery(&sender, &queue, record, visibility_timeout).await;
                            });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!(generation = generation, "rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        // Unacked deliveries of the dead channel are already back on the queue.
        tokio::select! {
            _ = &mut shutdown => {
                info!("sender_stopping");
                break 'subscribe;
            }
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }

    info!("sender_shutdown_complete");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "sigint_handler_unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
