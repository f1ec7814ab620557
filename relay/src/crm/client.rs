//! CRM collaborator interface and its Salesforce REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::{error, info};
use url::Url;

use super::types::{AccessToken, CrmCredentials, TokenResponse, UpsertResponse};
use crate::config::Config;
use crate::error::{RelayError, RelayResult};

/// Longest slice of a CRM error body copied into logs and errors.
const BODY_PREVIEW_LIMIT: usize = 500;

/// Claims system of record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Exchange credentials for a bearer token.
    async fn fetch_token(&self, base_url: &Url, credentials: &CrmCredentials) -> RelayResult<AccessToken>;

    /// Update-or-insert the claim keyed by its external claim number.
    ///
    /// `payload` is sent verbatim as the JSON request body.
    async fn upsert_claim(
        &self,
        base_url: &Url,
        token: &AccessToken,
        claim_number: &str,
        payload: &str,
    ) -> RelayResult<UpsertResponse>;
}

/// Salesforce REST client.
#[derive(Debug, Clone)]
pub struct SalesforceClient {
    http: Client,
    api_version: String,
    sobject: String,
    external_id_field: String,
}

impl SalesforceClient {
    pub fn new(
        timeout: Duration,
        api_version: impl Into<String>,
        sobject: impl Into<String>,
        external_id_field: impl Into<String>,
    ) -> RelayResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            api_version: api_version.into(),
            sobject: sobject.into(),
            external_id_field: external_id_field.into(),
        })
    }

    pub fn from_config(config: &Config) -> RelayResult<Self> {
        Self::new(
            Duration::from_millis(config.request_timeout_ms),
            config.crm_api_version.clone(),
            config.crm_sobject.clone(),
            config.crm_external_id_field.clone(),
        )
    }

    fn token_url(&self, base_url: &Url) -> RelayResult<Url> {
        with_segments(base_url, &["services", "oauth2", "token"])
    }

    fn upsert_url(&self, base_url: &Url, claim_number: &str) -> RelayResult<Url> {
        with_segments(
            base_url,
            &[
                "services",
                "data",
                self.api_version.as_str(),
                "sobjects",
                self.sobject.as_str(),
                self.external_id_field.as_str(),
                claim_number,
            ],
        )
    }
}

#[async_trait]
impl CrmClient for SalesforceClient {
    async fn fetch_token(&self, base_url: &Url, credentials: &CrmCredentials) -> RelayResult<AccessToken> {
        let url = self.token_url(base_url)?;

        info!(url = %url, client_id = %credentials.client_id, "crm_token_request");

        let response = self
            .http
            .post(url)
            .form(&credentials.token_form())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!(status_code = status.as_u16(), body_preview = %preview(&body), "crm_token_rejected");
            return Err(RelayError::Auth(format!("token endpoint returned {status}")));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            error!(error = %e, body_preview = %preview(&body), "crm_token_unparseable");
            RelayError::Auth(format!("token response was not understood: {e}"))
        })?;

        match parsed.access_token.filter(|t| !t.is_empty()) {
            Some(token) => {
                info!(instance_url = ?parsed.instance_url, "crm_token_acquired");
                Ok(AccessToken::new(token))
            }
            None => {
                error!("crm_token_missing");
                Err(RelayError::Auth("token response lacked access_token".to_string()))
            }
        }
    }

    async fn upsert_claim(
        &self,
        base_url: &Url,
        token: &AccessToken,
        claim_number: &str,
        payload: &str,
    ) -> RelayResult<UpsertResponse> {
        let url = self.upsert_url(base_url, claim_number)?;

        info!(url = %url, claim_number = %claim_number, payload_length = payload.len(), "crm_upsert_request");

        let response = self
            .http
            .patch(url)
            .bearer_auth(token.secret())
            .header(header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        let rejected = |reason: String| RelayError::UpsertRejected {
            claim_number: claim_number.to_string(),
            reason,
        };

        if !status.is_success() {
            error!(
                claim_number = %claim_number,
                status_code = status.as_u16(),
                body_preview = %preview(&body),
                "crm_upsert_http_error"
            );
            return Err(rejected(describe_status(status, &body)));
        }

        let parsed: UpsertResponse = serde_json::from_str(&body).map_err(|e| {
            error!(claim_number = %claim_number, error = %e, body_preview = %preview(&body), "crm_upsert_unparseable");
            rejected(format!("response was not understood: {e}"))
        })?;

        if !parsed.is_success() {
            error!(claim_number = %claim_number, errors = ?parsed.errors, "crm_upsert_unsuccessful");
            return Err(rejected(format!("success flag was {:?}", parsed.success)));
        }

        info!(
            claim_number = %claim_number,
            record_id = ?parsed.id,
            created = ?parsed.created,
            "crm_upsert_succeeded"
        );

        Ok(parsed)
    }
}

/// Append path segments to `base_url`, percent-encoding each one.
fn with_segments(base_url: &Url, segments: &[&str]) -> RelayResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| RelayError::Config(format!("{base_url} cannot be used as a base URL")))?;
        path.pop_if_empty().extend(segments);
    }
    Ok(url)
}

fn describe_status(status: StatusCode, body: &str) -> String {
    if body.is_empty() {
        format!("CRM returned {status}")
    } else {
        format!("CRM returned {status}: {}", preview(body))
    }
}

fn preview(body: &str) -> &str {
    match body.char_indices().nth(BODY_PREVIEW_LIMIT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CLAIM_BODY: &str = r#"{"Name":"Joe Schmo's testing claim"}"#;

    fn client() -> SalesforceClient {
        SalesforceClient::new(Duration::from_secs(5), "v50.0", "Claim__c", "Claim_Number__c").unwrap()
    }

    fn credentials() -> CrmCredentials {
        CrmCredentials {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            username: "user@example.com".to_string(),
            password: "pass".to_string(),
            security_token: "TOKEN".to_string(),
        }
    }

    fn base(server: &MockServer) -> Url {
        Url::parse(&server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_token_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .and(body_string_contains("grant_type=password"))
            .and(body_string_contains("client_id=client-id"))
            .and(body_string_contains("password=passTOKEN"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"access_token":"00Dxx!abc","instance_url":"https://example.my.salesforce.com"}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let token = client().fetch_token(&base(&server), &credentials()).await.unwrap();
        assert_eq!(token.secret(), "00Dxx!abc");
    }

    #[tokio::test]
    async fn test_fetch_token_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_client_id","error_description":"client identifier invalid"}"#),
            )
            .mount(&server)
            .await;

        let result = client().fetch_token(&base(&server), &credentials()).await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_fetch_token_without_access_token() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"token_type":"Bearer"}"#))
            .mount(&server)
            .await;

        let result = client().fetch_token(&base(&server), &credentials()).await;
        assert!(matches!(result, Err(RelayError::Auth(_))));
    }

    #[tokio::test]
    async fn test_fetch_token_unreachable_is_transport_error() {
        let base = Url::parse("http://127.0.0.1:1").unwrap();

        let result = client().fetch_token(&base, &credentials()).await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_upsert_claim_success() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/services/data/v50.0/sobjects/Claim__c/Claim_Number__c/33"))
            .and(header("authorization", "Bearer 00Dxx!abc"))
            .and(header("content-type", "application/json"))
            .and(body_string(CLAIM_BODY))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_string(r#"{"id":"a0B5e000001","success":true,"errors":[],"created":true}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let response = client()
            .upsert_claim(&base(&server), &AccessToken::new("00Dxx!abc"), "33", CLAIM_BODY)
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.created, Some(true));
        assert_eq!(response.id.as_deref(), Some("a0B5e000001"));
    }

    #[tokio::test]
    async fn test_upsert_claim_success_false() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .and(path("/services/data/v50.0/sobjects/Claim__c/Claim_Number__c/33"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"success":false,"errors":[{"statusCode":"REQUIRED_FIELD_MISSING"}]}"#,
            ))
            .mount(&server)
            .await;

        let result = client()
            .upsert_claim(&base(&server), &AccessToken::new("t"), "33", CLAIM_BODY)
            .await;

        assert!(matches!(
            result,
            Err(RelayError::UpsertRejected { ref claim_number, .. }) if claim_number == "33"
        ));
    }

    #[tokio::test]
    async fn test_upsert_claim_unauthorized() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(401).set_body_string(
                r#"[{"message":"Session expired or invalid","errorCode":"INVALID_SESSION_ID"}]"#,
            ))
            .mount(&server)
            .await;

        let result = client()
            .upsert_claim(&base(&server), &AccessToken::new("1"), "33", CLAIM_BODY)
            .await;

        assert!(matches!(result, Err(RelayError::UpsertRejected { .. })));
    }

    #[tokio::test]
    async fn test_upsert_claim_empty_body_is_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let result = client()
            .upsert_claim(&base(&server), &AccessToken::new("t"), "33", CLAIM_BODY)
            .await;

        assert!(matches!(result, Err(RelayError::UpsertRejected { .. })));
    }

    #[test]
    fn test_upsert_url_encodes_claim_number() {
        let url = client()
            .upsert_url(&Url::parse("https://example.my.salesforce.com").unwrap(), "33/../x")
            .unwrap();

        assert_eq!(
            url.as_str(),
            "https://example.my.salesforce.com/services/data/v50.0/sobjects/Claim__c/Claim_Number__c/33%2F..%2Fx"
        );
    }

    #[test]
    fn test_token_url_keeps_base_path() {
        let url = client()
            .token_url(&Url::parse("http://127.0.0.1:9000/mock/").unwrap())
            .unwrap();

        assert_eq!(url.as_str(), "http://127.0.0.1:9000/mock/services/oauth2/token");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let long = "é".repeat(BODY_PREVIEW_LIMIT + 10);
        assert_eq!(preview(&long).chars().count(), BODY_PREVIEW_LIMIT);
        assert_eq!(preview("short"), "short");
    }
}
