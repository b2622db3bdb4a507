//! Cloud token broker client
//!
//! The broker hosts the redirect URI on our behalf. A "cloud token" is a
//! mailbox: we create it, the browser redirect fills it in, we read it, and
//! finally we claim it so it cannot be consumed twice.

use super::AuthError;
use crate::config::BrokerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle of a broker resource: pending -> fulfilled -> claimed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudTokenStatus {
    Pending,
    Fulfilled,
    Claimed,
    /// Anything the broker sends that we don't know about
    #[serde(other)]
    Unknown,
}

/// Broker-side cloud token resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudToken {
    #[serde(default)]
    pub id: String,
    pub status: CloudTokenStatus,
    /// Query parameters captured from the browser redirect
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: HashMap<String, String>,
    /// Resource URL used for polling and claiming
    #[serde(default)]
    pub url: String,
    /// Redirect URI handed to the identity provider
    #[serde(default)]
    pub fulfillment_url: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl CloudToken {
    pub fn is_fulfilled(&self) -> bool {
        self.status == CloudTokenStatus::Fulfilled
    }

    /// Authorization code captured by the redirect, if any
    pub fn code(&self) -> Option<&str> {
        self.params
            .get("code")
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Envelope every broker endpoint wraps its payload in
#[derive(Debug, Deserialize)]
struct CloudTokenResponse {
    cloud_token: CloudToken,
}

/// Network surface of the broker
#[async_trait]
pub trait CloudBroker: Send + Sync {
    /// Create a new pending resource. Failure is fatal for the login attempt.
    async fn create_cloud_token(&self) -> Result<CloudToken, AuthError>;

    /// Read the current resource state. Failures are retried by the poller.
    async fn fetch_status(&self, url: &str) -> Result<CloudToken>;

    /// Mark the resource consumed
    async fn claim(&self, url: &str) -> Result<(), AuthError>;
}

/// reqwest-backed broker client
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrokerClient {
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build broker HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn create_url(&self) -> String {
        format!("{}/api/cloud_tokens", self.base_url)
    }
}

#[async_trait]
impl CloudBroker for BrokerClient {
    async fn create_cloud_token(&self) -> Result<CloudToken, AuthError> {
        tracing::debug!("Creating broker cloud token at {}", self.create_url());

        let response = self
            .client
            .post(self.create_url())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::BrokerUnavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::BrokerUnavailable(format!(
                "create returned {}: {}",
                status, text
            )));
        }

        let body: CloudTokenResponse = response.json().await.map_err(|e| {
            AuthError::BrokerUnavailable(format!("unreadable create response: {}", e))
        })?;

        let token = body.cloud_token;
        if token.url.is_empty() || token.fulfillment_url.is_empty() {
            return Err(AuthError::BrokerUnavailable(
                "create response is missing url or fulfillment_url".to_string(),
            ));
        }

        tracing::debug!("Broker cloud token {} created", token.id);
        Ok(token)
    }

    async fn fetch_status(&self, url: &str) -> Result<CloudToken> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to fetch cloud token status")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Cloud token status request failed ({}): {}", status, text);
        }

        let body: CloudTokenResponse = response
            .json()
            .await
            .context("Failed to parse cloud token status")?;

        Ok(body.cloud_token)
    }

    async fn claim(&self, url: &str) -> Result<(), AuthError> {
        let response = self
            .client
            .put(url)
            .json(&serde_json::json!({ "status": "claimed" }))
            .send()
            .await
            .map_err(|e| AuthError::BrokerUnavailable(format!("claim failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AuthError::BrokerUnavailable(format!(
                "claim returned {}: {}",
                status, text
            )));
        }

        tracing::debug!("Claimed cloud token at {}", url);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_response() {
        let body: CloudTokenResponse = serde_json::from_str(
            r#"{
                "cloud_token": {
                    "id": "ct_1",
                    "created_at": "2024-06-18T10:00:00Z",
                    "updated_at": "2024-06-18T10:00:00Z",
                    "params": null,
                    "status": "pending",
                    "url": "https://broker/api/cloud_tokens/ct_1",
                    "fulfillment_url": "https://broker/cloud_tokens/ct_1/fulfill"
                },
                "errors": [],
                "status": 200,
                "success": true
            }"#,
        )
        .unwrap();

        let token = body.cloud_token;
        assert_eq!(token.id, "ct_1");
        assert_eq!(token.status, CloudTokenStatus::Pending);
        assert!(token.params.is_empty());
        assert!(token.code().is_none());
    }

    #[test]
    fn parses_sparse_status_response() {
        let body: CloudTokenResponse = serde_json::from_str(
            r#"{"cloud_token": {"status": "fulfilled", "params": {"code": "abc123", "state": "ct_1"}}}"#,
        )
        .unwrap();

        assert!(body.cloud_token.is_fulfilled());
        assert_eq!(body.cloud_token.code(), Some("abc123"));
    }

    #[test]
    fn unknown_status_is_not_an_error() {
        let body: CloudTokenResponse =
            serde_json::from_str(r#"{"cloud_token": {"status": "expired"}}"#).unwrap();
        assert_eq!(body.cloud_token.status, CloudTokenStatus::Unknown);
        assert!(!body.cloud_token.is_fulfilled());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = BrokerClient::new(&BrokerConfig {
            base_url: "http://127.0.0.1:9000/".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(client.create_url(), "http://127.0.0.1:9000/api/cloud_tokens");
    }
}
