//! Collaborator settings read at the start of every invocation.
//!
//! The receiver only needs the queue URL. The sender additionally needs the
//! Salesforce connected-app credentials. Both are plain JSON files so they can
//! be rotated without restarting the process.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{error, info};
use url::Url;

use crate::crm::CrmCredentials;
use crate::error::{RelayError, RelayResult};

/// Settings the receiver needs to enqueue a claim.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReceiverSettings {
    pub queue_url: String,
}

/// Settings the sender needs to reach the CRM and acknowledge deliveries.
#[derive(Clone, Deserialize)]
pub struct SenderSettings {
    /// Salesforce instance host (`example.my.salesforce.com`) or base URL
    pub sf_instance_name: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
    pub queue_url: String,
}

impl SenderSettings {
    /// Credentials for the CRM token exchange.
    pub fn credentials(&self) -> CrmCredentials {
        CrmCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            security_token: self.security_token.clone(),
        }
    }

    /// Base URL of the Salesforce instance.
    ///
    /// A bare host name is reached over HTTPS; anything carrying a scheme is
    /// used as given.
    pub fn crm_base_url(&self) -> RelayResult<Url> {
        let instance = self.sf_instance_name.trim();
        if instance.is_empty() {
            return Err(RelayError::Config("sf_instance_name is empty".to_string()));
        }

        let raw = if instance.contains("://") {
            instance.to_string()
        } else {
            format!("https://{instance}")
        };

        let url = Url::parse(&raw)
            .map_err(|e| RelayError::Config(format!("invalid sf_instance_name {instance:?}: {e}")))?;

        if url.cannot_be_a_base() {
            return Err(RelayError::Config(format!(
                "sf_instance_name {instance:?} cannot be used as a base URL"
            )));
        }

        Ok(url)
    }
}

impl fmt::Debug for SenderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderSettings")
            .field("sf_instance_name", &self.sf_instance_name)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("security_token", &"<redacted>")
            .field("queue_url", &self.queue_url)
            .finish()
    }
}

/// Source of collaborator settings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn receiver_settings(&self) -> RelayResult<ReceiverSettings>;

    async fn sender_settings(&self) -> RelayResult<SenderSettings>;
}

/// Reads settings from JSON files on every call.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    receiver_path: PathBuf,
    sender_path: PathBuf,
}

impl FileConfigSource {
    pub fn new(receiver_path: impl Into<PathBuf>, sender_path: impl Into<PathBuf>) -> Self {
        Self {
            receiver_path: receiver_path.into(),
            sender_path: sender_path.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn receiver_settings(&self) -> RelayResult<ReceiverSettings> {
        read_json(&self.receiver_path).await
    }

    async fn sender_settings(&self) -> RelayResult<SenderSettings> {
        read_json(&self.sender_path).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> RelayResult<T> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        error!(path = %path.display(), error = %e, "config_read_failed");
        RelayError::Config(format!("failed to read {}: {e}", path.display()))
    })?;

    let parsed = serde_json::from_slice(&raw).map_err(|e| {
        error!(path = %path.display(), error = %e, "config_parse_failed");
        RelayError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;

    info!(path = %path.display(), bytes = raw.len(), "config_loaded");

    Ok(parsed)
}
