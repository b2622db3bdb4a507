//! Microsoft Entra ID (Azure AD) public client
//!
//! Speaks the v2.0 authorize/token endpoints for the authorization code and
//! refresh token grants. Token signatures are not verified; the account id is
//! taken from `client_info` (or, failing that, the id token payload).

use super::identity::{
    AccessTokenEntry, Account, AuthCodeRequest, AuthCodeUrlParams, AuthenticationResult,
    CachePlugin, IdentityProvider, RefreshTokenEntry, SilentRequest, TokenCache,
};
use super::AuthError;
use crate::config::AzureConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    client_info: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Error response from the token endpoint
#[derive(Debug, Deserialize)]
struct TokenError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientInfo {
    uid: String,
    utid: String,
}

#[derive(Debug, Default, Deserialize)]
struct IdTokenClaims {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    preferred_username: Option<String>,
}

/// Entra ID client bound to one application registration
pub struct EntraIdClient {
    client: reqwest::Client,
    client_id: String,
    authority: url::Url,
}

impl EntraIdClient {
    pub fn new(config: &AzureConfig) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            anyhow::bail!("azure.client_id is not configured");
        }
        let authority = url::Url::parse(config.authority.trim_end_matches('/'))
            .with_context(|| format!("Invalid authority URL: {}", config.authority))?;

        Ok(Self {
            client: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            authority,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/oauth2/v2.0/{}",
            self.authority.as_str().trim_end_matches('/'),
            name
        )
    }

    fn environment(&self) -> String {
        self.authority.host_str().unwrap_or_default().to_string()
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(self.endpoint("token"))
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .context("Failed to reach token endpoint")?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<TokenError>(&text) {
                anyhow::bail!(
                    "{} ({}): {}",
                    error.error,
                    status,
                    error.error_description.unwrap_or_default()
                );
            }
            anyhow::bail!("Token request failed ({}): {}", status, text);
        }

        serde_json::from_str(&text).context("Failed to parse token response")
    }

    /// Derive the account from the response; `None` if it carries no identity
    fn account_from(&self, response: &TokenResponse) -> Option<Account> {
        let claims = response
            .id_token
            .as_deref()
            .and_then(|t| decode_segment::<IdTokenClaims>(t.split('.').nth(1)?))
            .unwrap_or_default();

        let (oid, tid) = match response
            .client_info
            .as_deref()
            .and_then(decode_segment::<ClientInfo>)
        {
            Some(info) => (info.uid, info.utid),
            None => (claims.oid.clone().or(claims.sub.clone())?, claims.tid.clone()?),
        };

        Some(Account {
            home_account_id: format!("{}.{}", oid, tid),
            environment: self.environment(),
            tenant_id: tid,
            username: claims.preferred_username,
        })
    }

    fn record_grant(
        &self,
        cache: &mut TokenCache,
        account: Account,
        response: TokenResponse,
        requested_scopes: &[String],
    ) -> AuthenticationResult {
        let lifetime = chrono::Duration::seconds(response.expires_in.unwrap_or(3600));
        let expires_on = Utc::now() + lifetime;
        let scopes = response
            .scope
            .as_deref()
            .map(|s| s.split(' ').map(str::to_string).collect())
            .unwrap_or_else(|| requested_scopes.to_vec());

        cache.store(
            account.clone(),
            AccessTokenEntry {
                secret: response.access_token.clone(),
                expires_on,
                scopes: scopes.clone(),
            },
            response.refresh_token.map(|secret| RefreshTokenEntry {
                secret,
                client_id: self.client_id.clone(),
            }),
        );

        AuthenticationResult {
            access_token: response.access_token,
            account,
            expires_on,
            scopes,
        }
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Option<T> {
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[async_trait]
impl IdentityProvider for EntraIdClient {
    fn auth_code_url(&self, params: &AuthCodeUrlParams) -> Result<String> {
        let mut url = url::Url::parse(&self.endpoint("authorize"))
            .context("Failed to build authorize URL")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("response_mode", "query")
                .append_pair("redirect_uri", &params.redirect_uri)
                .append_pair("scope", &params.scopes.join(" "))
                .append_pair("state", &params.state)
                .append_pair("client_info", "1");
            if let Some(prompt) = &params.prompt {
                query.append_pair("prompt", prompt);
            }
        }
        Ok(url.into())
    }

    async fn acquire_token_by_code(
        &self,
        request: &AuthCodeRequest,
        plugin: &dyn CachePlugin,
    ) -> Result<AuthenticationResult, AuthError> {
        let scope = request.scopes.join(" ");
        let response = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "authorization_code"),
                ("code", request.code.as_str()),
                ("redirect_uri", request.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("client_info", "1"),
            ])
            .await
            .map_err(|e| AuthError::TokenExchange(format!("{:#}", e)))?;

        let account = self.account_from(&response).ok_or_else(|| {
            AuthError::TokenExchange("token response did not identify an account".to_string())
        })?;

        let mut cache = TokenCache::default();
        plugin.before_access(&mut cache).await?;
        let result = self.record_grant(&mut cache, account, response, &request.scopes);
        plugin.after_access(&cache, true).await?;

        tracing::info!("Redeemed authorization code for {}", result.account.home_account_id);
        Ok(result)
    }

    async fn acquire_token_silent(
        &self,
        request: &SilentRequest,
        plugin: &dyn CachePlugin,
    ) -> Result<AuthenticationResult> {
        let home_id = request.account.home_account_id.as_str();
        let mut cache = TokenCache::default();
        plugin.before_access(&mut cache).await?;

        if !request.force_refresh {
            if let Some(cached) = cache.access_token(home_id).filter(|t| t.is_fresh(Utc::now())) {
                let result = AuthenticationResult {
                    access_token: cached.secret.clone(),
                    account: request.account.clone(),
                    expires_on: cached.expires_on,
                    scopes: cached.scopes.clone(),
                };
                plugin.after_access(&cache, false).await?;
                return Ok(result);
            }
        }

        let refresh = cache.refresh_token(home_id).cloned();
        plugin.after_access(&cache, false).await?;
        let Some(refresh) = refresh else {
            anyhow::bail!("No refresh token cached for account {}", home_id);
        };

        let scope = request.scopes.join(" ");
        let response = self
            .token_request(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh.secret.as_str()),
                ("scope", scope.as_str()),
                ("client_info", "1"),
            ])
            .await
            .context("Refresh token grant failed")?;

        let account = self
            .account_from(&response)
            .unwrap_or_else(|| request.account.clone());

        let mut cache = TokenCache::default();
        plugin.before_access(&mut cache).await?;
        let result = self.record_grant(&mut cache, account, response, &request.scopes);
        plugin.after_access(&cache, true).await?;

        tracing::debug!("Silently refreshed token for {}", home_id);
        Ok(result)
    }

    async fn account_by_home_id(
        &self,
        home_account_id: &str,
        plugin: &dyn CachePlugin,
    ) -> Result<Option<Account>> {
        let mut cache = TokenCache::default();
        plugin.before_access(&mut cache).await?;
        let account = cache.account(home_account_id).cloned();
        plugin.after_access(&cache, false).await?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> EntraIdClient {
        EntraIdClient::new(&AzureConfig {
            client_id: "client-123".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn encode(json: &str) -> String {
        URL_SAFE_NO_PAD.encode(json)
    }

    #[test]
    fn authorize_url_carries_broker_redirect_and_state() {
        let url = client()
            .auth_code_url(&AuthCodeUrlParams {
                scopes: vec![
                    "https://database.windows.net/.default".to_string(),
                    "offline_access".to_string(),
                ],
                redirect_uri: "https://broker/ct_1/fulfill".to_string(),
                state: "ct_1".to_string(),
                prompt: Some("consent".to_string()),
            })
            .unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        assert_eq!(parsed.path(), "/organizations/oauth2/v2.0/authorize");
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["redirect_uri"], "https://broker/ct_1/fulfill");
        assert_eq!(query["state"], "ct_1");
        assert_eq!(query["prompt"], "consent");
        assert_eq!(
            query["scope"],
            "https://database.windows.net/.default offline_access"
        );
    }

    #[test]
    fn missing_client_id_is_rejected() {
        assert!(EntraIdClient::new(&AzureConfig::default()).is_err());
    }

    #[test]
    fn account_prefers_client_info() {
        let response = TokenResponse {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: Some(format!(
                "h.{}.s",
                encode(r#"{"oid":"other","tid":"other-t","preferred_username":"dba@contoso.com"}"#)
            )),
            client_info: Some(encode(r#"{"uid":"oid-1","utid":"tid-1"}"#)),
            expires_in: Some(3600),
            scope: None,
        };

        let account = client().account_from(&response).unwrap();
        assert_eq!(account.home_account_id, "oid-1.tid-1");
        assert_eq!(account.tenant_id, "tid-1");
        assert_eq!(account.username.as_deref(), Some("dba@contoso.com"));
        assert_eq!(account.environment, "login.microsoftonline.com");
    }

    #[test]
    fn account_falls_back_to_id_token() {
        let response = TokenResponse {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: Some(format!("h.{}.s", encode(r#"{"oid":"o","tid":"t"}"#))),
            client_info: None,
            expires_in: None,
            scope: None,
        };
        assert_eq!(client().account_from(&response).unwrap().home_account_id, "o.t");
    }

    #[test]
    fn response_without_identity_has_no_account() {
        let response = TokenResponse {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: None,
            client_info: None,
            expires_in: None,
            scope: None,
        };
        assert!(client().account_from(&response).is_none());
    }

    /// Counts hook calls so bracketing can be checked
    #[derive(Default)]
    struct CountingPlugin {
        before: std::sync::atomic::AtomicUsize,
        after: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl CachePlugin for CountingPlugin {
        async fn before_access(&self, _cache: &mut TokenCache) -> Result<(), AuthError> {
            self.before.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn after_access(&self, _cache: &TokenCache, changed: bool) -> Result<(), AuthError> {
            assert!(!changed);
            self.after.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn silent_without_refresh_token_still_closes_hooks() {
        let plugin = CountingPlugin::default();
        let request = SilentRequest {
            account: Account {
                home_account_id: "o.t".to_string(),
                environment: "login.microsoftonline.com".to_string(),
                tenant_id: "t".to_string(),
                username: None,
            },
            scopes: vec!["https://database.windows.net/.default".to_string()],
            force_refresh: true,
        };

        let err = client()
            .acquire_token_silent(&request, &plugin)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("No refresh token"));
        assert_eq!(plugin.before.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(plugin.after.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
