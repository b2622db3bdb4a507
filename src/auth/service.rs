//! Sign-in orchestration
//!
//! Tries a silent refresh first. Only when that yields nothing does it create
//! a broker resource, send the user to the consent page, wait for the broker
//! to capture the redirect, claim the resource and redeem the code.

use super::broker::CloudBroker;
use super::cache_plugin::CacheAdapter;
use super::identity::{AuthCodeRequest, AuthCodeUrlParams, IdentityProvider, SilentRequest};
use super::poll::{CancellationFlag, PollingCoordinator};
use super::{AuthConfig, AuthError, AuthOptions, AzureAuthType};
use crate::config::Config;
use crate::storage::{RecordId, TokenCacheStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where a sign-in currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    SilentRefreshAttempted,
    InteractiveFlowStarted,
    BrowserPending,
    PollingOutstanding,
    CodeExchangePending,
    Authenticated,
    Failed,
    /// Cancelled or timed out while waiting for the browser
    Abandoned,
}

/// Outcome of a silent refresh; absence is routine, not a failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SilentRefresh {
    Token(AuthConfig),
    Absent,
}

/// Sends the user to the consent page; owned by the UI
pub trait BrowserLauncher: Send + Sync {
    fn open(&self, url: &str) -> anyhow::Result<()>;
}

/// Brokered Azure AD sign-in for one token cache record
pub struct AzureAuthService {
    client_id: String,
    scopes: Vec<String>,
    timeout: Duration,
    broker: Arc<dyn CloudBroker>,
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn TokenCacheStore>,
    browser: Arc<dyn BrowserLauncher>,
    poller: PollingCoordinator,
    cancel: CancellationFlag,
    session: Option<CacheAdapter>,
    state: Mutex<AuthState>,
}

impl AzureAuthService {
    pub fn new(
        config: &Config,
        broker: Arc<dyn CloudBroker>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn TokenCacheStore>,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            client_id: config.azure.client_id.clone(),
            scopes: config.azure.scopes.clone(),
            timeout: config.polling.timeout(),
            broker,
            provider,
            store,
            browser,
            poller: PollingCoordinator::default().with_interval(config.polling.interval()),
            cancel: CancellationFlag::new(),
            session: None,
            state: Mutex::new(AuthState::Idle),
        }
    }

    /// Swap the poller, e.g. for one driven by a manual clock
    pub fn with_poller(mut self, poller: PollingCoordinator) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load the token cache record the session will work on
    pub async fn init(&mut self, id: RecordId) -> Result<(), AuthError> {
        if id <= 0 {
            return Err(AuthError::RecordNotFound(id));
        }

        let record = self.store.load(id).await?;
        tracing::debug!("Loaded token cache {} for sign-in", id);
        self.session = Some(CacheAdapter::new(
            Arc::new(tokio::sync::Mutex::new(record)),
            self.store.clone(),
        ));
        self.set_state(AuthState::Idle);
        Ok(())
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: AuthState) {
        tracing::trace!("Auth state -> {:?}", state);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Flag observed by the poller at its next boundary
    pub fn cancel(&self) {
        tracing::info!("Sign-in cancellation requested");
        self.cancel.cancel();
    }

    /// Handle for cancelling from another task (e.g. a Ctrl-C handler)
    pub fn cancel_handle(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub async fn auth(
        &self,
        auth_type: AzureAuthType,
        options: &AuthOptions,
    ) -> Result<AuthConfig, AuthError> {
        match AuthConfig::shape(auth_type, &self.client_id, options) {
            Some(config) => Ok(config),
            None => self.access_token().await,
        }
    }

    async fn access_token(&self) -> Result<AuthConfig, AuthError> {
        let session = self.session.as_ref().ok_or_else(|| {
            AuthError::Other(anyhow::anyhow!("init must be called before auth"))
        })?;
        self.cancel.reset();

        if let SilentRefresh::Token(config) = self.try_refresh(session).await {
            tracing::info!("Signed in silently with cached refresh token");
            self.set_state(AuthState::Authenticated);
            return Ok(config);
        }

        match self.interactive(session).await {
            Ok(config) => {
                self.set_state(AuthState::Authenticated);
                Ok(config)
            }
            Err(e) => {
                self.set_state(match e {
                    AuthError::UserDidNotComplete => AuthState::Abandoned,
                    _ => AuthState::Failed,
                });
                Err(e)
            }
        }
    }

    /// Attempt a forced refresh for the linked account; never fails
    async fn try_refresh(&self, session: &CacheAdapter) -> SilentRefresh {
        self.set_state(AuthState::SilentRefreshAttempted);

        let home_id = {
            let record = session.record().lock().await;
            if !record.has_home_account() {
                tracing::debug!("No linked account yet, skipping silent refresh");
                return SilentRefresh::Absent;
            }
            record.home_account_id.clone()
        };

        let account = match self.provider.account_by_home_id(&home_id, session).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::debug!("Account {} not in token cache", home_id);
                return SilentRefresh::Absent;
            }
            Err(e) => {
                tracing::info!("Token cache lookup failed: {:#}", e);
                return SilentRefresh::Absent;
            }
        };

        let request = SilentRequest {
            account,
            scopes: self.scopes.clone(),
            force_refresh: true,
        };
        match self.provider.acquire_token_silent(&request, session).await {
            Ok(result) => SilentRefresh::Token(AuthConfig::access_token(result.access_token)),
            Err(e) => {
                tracing::info!("refresh failed: {:#}", e);
                SilentRefresh::Absent
            }
        }
    }

    async fn interactive(&self, session: &CacheAdapter) -> Result<AuthConfig, AuthError> {
        self.set_state(AuthState::InteractiveFlowStarted);
        if self.cancel.is_cancelled() {
            tracing::info!("Sign-in cancelled before contacting the broker");
            return Err(AuthError::UserDidNotComplete);
        }

        tracing::debug!("Getting cloud token from broker");
        let cloud_token = self.broker.create_cloud_token().await?;

        let auth_url = self.provider.auth_code_url(&AuthCodeUrlParams {
            scopes: self.scopes.clone(),
            redirect_uri: cloud_token.fulfillment_url.clone(),
            state: cloud_token.id.clone(),
            prompt: Some("consent".to_string()),
        })?;

        self.set_state(AuthState::BrowserPending);
        if let Err(e) = self.browser.open(&auth_url) {
            tracing::warn!("Failed to open browser: {:#}", e);
        }

        let started_at = self.poller.now();
        self.set_state(AuthState::PollingOutstanding);
        tracing::debug!("Waiting for browser sign-in on {}", cloud_token.url);

        let fulfilled = self
            .poller
            .wait_for_fulfillment(
                self.broker.as_ref(),
                &cloud_token.url,
                started_at,
                self.timeout,
                &self.cancel,
            )
            .await
            .ok_or(AuthError::UserDidNotComplete)?;

        self.broker.claim(&cloud_token.url).await?;

        let code = fulfilled
            .code()
            .ok_or(AuthError::MissingAuthorizationCode)?
            .to_string();

        self.set_state(AuthState::CodeExchangePending);
        let result = self
            .provider
            .acquire_token_by_code(
                &AuthCodeRequest {
                    code,
                    scopes: self.scopes.clone(),
                    redirect_uri: cloud_token.fulfillment_url.clone(),
                    state: cloud_token.id.clone(),
                },
                session,
            )
            .await?;

        session.record().lock().await.home_account_id = result.account.home_account_id.clone();
        session.persist().await?;

        tracing::info!(
            "Signed in as {}",
            result
                .account
                .username
                .as_deref()
                .unwrap_or(&result.account.home_account_id)
        );
        Ok(AuthConfig::access_token(result.access_token))
    }
}
