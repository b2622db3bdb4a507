//! Identity provider seam
//!
//! The orchestrator talks to the provider through `IdentityProvider`. Any call
//! that reads or writes tokens brackets its work with the `CachePlugin` hooks
//! it is handed, so the provider never owns persistence itself.

use super::AuthError;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signed-in account as the provider identifies it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// `<object id>.<tenant id>`
    pub home_account_id: String,
    pub environment: String,
    pub tenant_id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenEntry {
    pub secret: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenEntry {
    pub secret: String,
    pub expires_on: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl AccessTokenEntry {
    /// Still usable, with a 5 minute safety margin
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_on > now + chrono::Duration::minutes(5)
    }
}

/// In-memory token cache, keyed by home account id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    pub accounts: BTreeMap<String, Account>,
    #[serde(default)]
    pub refresh_tokens: BTreeMap<String, RefreshTokenEntry>,
    #[serde(default)]
    pub access_tokens: BTreeMap<String, AccessTokenEntry>,
}

impl TokenCache {
    /// Replace the contents with a previously serialized cache
    pub fn deserialize(&mut self, blob: &str) -> Result<()> {
        *self = serde_json::from_str(blob)?;
        Ok(())
    }

    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.refresh_tokens.is_empty() && self.access_tokens.is_empty()
    }

    pub fn account(&self, home_account_id: &str) -> Option<&Account> {
        self.accounts.get(home_account_id)
    }

    pub fn refresh_token(&self, home_account_id: &str) -> Option<&RefreshTokenEntry> {
        self.refresh_tokens.get(home_account_id)
    }

    pub fn access_token(&self, home_account_id: &str) -> Option<&AccessTokenEntry> {
        self.access_tokens.get(home_account_id)
    }

    /// Record the outcome of a token grant
    pub fn store(
        &mut self,
        account: Account,
        access_token: AccessTokenEntry,
        refresh_token: Option<RefreshTokenEntry>,
    ) {
        let key = account.home_account_id.clone();
        if let Some(refresh) = refresh_token {
            self.refresh_tokens.insert(key.clone(), refresh);
        }
        self.access_tokens.insert(key.clone(), access_token);
        self.accounts.insert(key, account);
    }
}

/// Hooks the provider calls around every cache access
#[async_trait]
pub trait CachePlugin: Send + Sync {
    /// Load persisted state into `cache` before the provider reads it
    async fn before_access(&self, cache: &mut TokenCache) -> Result<(), AuthError>;

    /// Called after the provider is done; persists only when `changed`
    async fn after_access(&self, cache: &TokenCache, changed: bool) -> Result<(), AuthError>;
}

/// Parameters for the browser-facing authorization URL
#[derive(Debug, Clone)]
pub struct AuthCodeUrlParams {
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub state: String,
    pub prompt: Option<String>,
}

/// Authorization code redemption
#[derive(Debug, Clone)]
pub struct AuthCodeRequest {
    pub code: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    pub state: String,
}

/// Silent acquisition from cached refresh material
#[derive(Debug, Clone)]
pub struct SilentRequest {
    pub account: Account,
    pub scopes: Vec<String>,
    /// Skip any cached access token and go straight to the refresh grant
    pub force_refresh: bool,
}

/// Successful token acquisition
#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    pub access_token: String,
    pub account: Account,
    pub expires_on: DateTime<Utc>,
    pub scopes: Vec<String>,
}

/// Identity provider client surface used by the sign-in flow
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Build the consent page URL the browser should open
    fn auth_code_url(&self, params: &AuthCodeUrlParams) -> Result<String>;

    /// Redeem an authorization code
    async fn acquire_token_by_code(
        &self,
        request: &AuthCodeRequest,
        cache: &dyn CachePlugin,
    ) -> Result<AuthenticationResult, AuthError>;

    /// Obtain a token without user interaction
    async fn acquire_token_silent(
        &self,
        request: &SilentRequest,
        cache: &dyn CachePlugin,
    ) -> Result<AuthenticationResult>;

    /// Look up a cached account
    async fn account_by_home_id(
        &self,
        home_account_id: &str,
        cache: &dyn CachePlugin,
    ) -> Result<Option<Account>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            home_account_id: "oid.tid".to_string(),
            environment: "login.microsoftonline.com".to_string(),
            tenant_id: "tid".to_string(),
            username: Some("dba@contoso.com".to_string()),
        }
    }

    #[test]
    fn cache_blob_restores_entries() {
        let mut cache = TokenCache::default();
        cache.store(
            account(),
            AccessTokenEntry {
                secret: "at".to_string(),
                expires_on: Utc::now(),
                scopes: vec!["https://database.windows.net/.default".to_string()],
            },
            Some(RefreshTokenEntry {
                secret: "rt".to_string(),
                client_id: "client".to_string(),
            }),
        );

        let mut restored = TokenCache::default();
        restored.deserialize(&cache.serialize().unwrap()).unwrap();
        assert_eq!(restored, cache);
        assert_eq!(restored.refresh_token("oid.tid").unwrap().secret, "rt");
    }

    #[test]
    fn refresh_token_survives_grant_without_rotation() {
        let mut cache = TokenCache::default();
        let entry = |secret: &str| AccessTokenEntry {
            secret: secret.to_string(),
            expires_on: Utc::now(),
            scopes: vec![],
        };
        cache.store(
            account(),
            entry("at1"),
            Some(RefreshTokenEntry {
                secret: "rt".to_string(),
                client_id: "client".to_string(),
            }),
        );
        cache.store(account(), entry("at2"), None);

        assert_eq!(cache.access_token("oid.tid").unwrap().secret, "at2");
        assert_eq!(cache.refresh_token("oid.tid").unwrap().secret, "rt");
    }

    #[test]
    fn access_token_freshness_has_margin() {
        let now = Utc::now();
        let token = |minutes| AccessTokenEntry {
            secret: "at".to_string(),
            expires_on: now + chrono::Duration::minutes(minutes),
            scopes: vec![],
        };
        assert!(token(10).is_fresh(now));
        assert!(!token(2).is_fresh(now));
        assert!(!token(-1).is_fresh(now));
    }
}
