//! CRM module: Salesforce token exchange and claim upsert.
//!
//! Claims are upserted by their external claim number rather than the
//! Salesforce record id, so sending the same claim twice updates one record
//! instead of creating a duplicate.

pub mod client;
pub mod types;

pub use client::{CrmClient, SalesforceClient};
pub use types::{AccessToken, CrmCredentials, TokenResponse, UpsertResponse};

#[cfg(test)]
pub use client::MockCrmClient;
