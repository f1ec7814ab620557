//! Salesforce REST payloads.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connected-app credentials for the OAuth password grant.
#[derive(Clone)]
pub struct CrmCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub security_token: String,
}

impl CrmCredentials {
    /// Form fields for `POST /services/oauth2/token`.
    ///
    /// Salesforce expects the security token appended to the password.
    pub fn token_form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("grant_type", "password".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("username", self.username.clone()),
            ("password", format!("{}{}", self.password, self.security_token)),
        ]
    }
}

impl fmt::Debug for CrmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Bearer token issued by the token endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// Token endpoint response. Only `access_token` matters.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub instance_url: Option<String>,
}

/// Upsert endpoint response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    /// `true` when the upsert inserted a new record.
    #[serde(default)]
    pub created: Option<bool>,
    #[serde(default)]
    pub errors: Vec<Value>,
}

impl UpsertResponse {
    /// Only an explicit `success: true` counts.
    pub fn is_success(&self) -> bool {
        self.success == Some(true)
    }
}
