//! Claims relay - at-least-once delivery of claim updates into Salesforce.
//!
//! This library provides shared modules for the two relay binaries:
//! - `claims-receiver`: Thin web server that validates claim events and enqueues them
//! - `claims-sender`: Queue consumer that upserts claims into the CRM
//!
//! ## Architecture
//!
//! ```text
//! POST /claims → Receiver → claims.delay → claims → Sender → Salesforce upsert
//!                                             ↓
//!                                     claims.dead_letter
//! ```
//!
//! A message is deleted only after the CRM confirmed the upsert, so every
//! claim update reaches the CRM at least once. Upserts are keyed on the claim
//! number, which makes redelivery harmless.

pub mod config;
pub mod crm;
pub mod error;
pub mod queue;
pub mod receiver;
pub mod redelivery;
pub mod sender;
pub mod settings;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use crm::{CrmClient, SalesforceClient};
pub use error::{RelayError, RelayResult};
pub use queue::{AmqpQueue, DeliveryEvent, OutboundMessage, QueueClient};
pub use receiver::{Receiver, ReceiverOutcome, ValidatedClaim};
pub use redelivery::{settle_delivery, DeliveryRelease, Disposition};
pub use sender::{DeliveryState, Sender, SenderReport, TrustedDelivery};
pub use settings::{ConfigSource, FileConfigSource, ReceiverSettings, SenderSettings};
pub use web::AppState;
