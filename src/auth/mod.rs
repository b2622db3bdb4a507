//! Azure AD authentication for database connections
//!
//! Interactive sign-in goes through a cloud token broker because the desktop
//! client cannot listen for the browser redirect itself. The other auth types
//! only shape connection options and never touch the network.

mod broker;
mod cache_plugin;
mod entra;
mod error;
mod identity;
mod poll;
mod service;

pub use broker::{BrokerClient, CloudBroker, CloudToken, CloudTokenStatus};
pub use cache_plugin::{CacheAdapter, SharedRecord};
pub use entra::EntraIdClient;
pub use error::AuthError;
pub use identity::{
    AccessTokenEntry, Account, AuthCodeRequest, AuthCodeUrlParams, AuthenticationResult,
    CachePlugin, IdentityProvider, RefreshTokenEntry, SilentRequest, TokenCache,
};
pub use poll::{
    CancellationFlag, Clock, ManualClock, PollingCoordinator, Sleeper, SystemClock, TokioSleeper,
    DEFAULT_POLL_INTERVAL,
};
pub use service::{AuthState, AzureAuthService, BrowserLauncher, SilentRefresh};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Auth mode requested by the connection form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AzureAuthType {
    /// Driver default credential chain; rarely works from a desktop client
    Default,
    Password,
    /// Interactive browser sign-in via the broker
    AccessToken,
    MsiVm,
    ServicePrincipalSecret,
}

impl AzureAuthType {
    /// Auth types offered in the UI, with display names
    pub fn supported() -> &'static [(AzureAuthType, &'static str)] {
        &[
            (AzureAuthType::AccessToken, "Azure AD SSO"),
            (AzureAuthType::ServicePrincipalSecret, "Azure Service Principal Secret"),
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AzureAuthType::Default => "default",
            AzureAuthType::Password => "password",
            AzureAuthType::AccessToken => "access-token",
            AzureAuthType::MsiVm => "msi-vm",
            AzureAuthType::ServicePrincipalSecret => "service-principal-secret",
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, AzureAuthType::AccessToken)
    }
}

impl fmt::Display for AzureAuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AzureAuthType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "default" => Ok(AzureAuthType::Default),
            "password" => Ok(AzureAuthType::Password),
            "access-token" | "sso" => Ok(AzureAuthType::AccessToken),
            "msi-vm" | "msi" => Ok(AzureAuthType::MsiVm),
            "service-principal-secret" | "service-principal" => {
                Ok(AzureAuthType::ServicePrincipalSecret)
            }
            other => anyhow::bail!("Unknown Azure auth type: {}", other),
        }
    }
}

/// Caller-supplied inputs for the non-interactive types
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOptions {
    pub password: Option<String>,
    pub user_name: Option<String>,
    pub tenant_id: Option<String>,
    pub msi_endpoint: Option<String>,
    pub client_secret: Option<String>,
}

/// Authentication type understood by the database driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthConfigType {
    #[serde(rename = "azure-active-directory-default")]
    Default,
    #[serde(rename = "azure-active-directory-password")]
    Password,
    #[serde(rename = "azure-active-directory-msi-vm")]
    MsiVm,
    #[serde(rename = "azure-active-directory-service-principal-secret")]
    ServicePrincipalSecret,
    #[serde(rename = "azure-active-directory-access-token")]
    AccessToken,
}

/// Connection options; which fields are set depends on the type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfigOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msi_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// Provider-agnostic auth descriptor handed to the connection layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthConfigType,
    pub options: AuthConfigOptions,
}

impl AuthConfig {
    pub fn access_token(token: impl Into<String>) -> Self {
        Self {
            auth_type: AuthConfigType::AccessToken,
            options: AuthConfigOptions {
                token: Some(token.into()),
                ..Default::default()
            },
        }
    }

    /// Connection options for the non-interactive types; `None` for `AccessToken`,
    /// which needs a sign-in. An empty `client_id` is left out.
    pub fn shape(
        auth_type: AzureAuthType,
        client_id: &str,
        options: &AuthOptions,
    ) -> Option<Self> {
        let client_id = Some(client_id.to_string()).filter(|c| !c.trim().is_empty());
        let (auth_type, options) = match auth_type {
            AzureAuthType::AccessToken => return None,
            AzureAuthType::Password => (
                AuthConfigType::Password,
                AuthConfigOptions {
                    user_name: options.user_name.clone(),
                    password: options.password.clone(),
                    client_id,
                    tenant_id: options.tenant_id.clone(),
                    ..Default::default()
                },
            ),
            AzureAuthType::MsiVm => (
                AuthConfigType::MsiVm,
                AuthConfigOptions {
                    client_id,
                    msi_endpoint: options.msi_endpoint.clone(),
                    ..Default::default()
                },
            ),
            AzureAuthType::ServicePrincipalSecret => (
                AuthConfigType::ServicePrincipalSecret,
                AuthConfigOptions {
                    client_id,
                    client_secret: options.client_secret.clone(),
                    tenant_id: options.tenant_id.clone(),
                    ..Default::default()
                },
            ),
            AzureAuthType::Default => (
                AuthConfigType::Default,
                AuthConfigOptions {
                    client_id,
                    ..Default::default()
                },
            ),
        };
        Some(Self { auth_type, options })
    }

    /// Copy safe to print or log
    pub fn redacted(&self) -> Self {
        let mask = |v: &Option<String>| v.as_ref().map(|s| mask_secret(s));
        Self {
            auth_type: self.auth_type,
            options: AuthConfigOptions {
                token: mask(&self.options.token),
                password: mask(&self.options.password),
                client_secret: mask(&self.options.client_secret),
                ..self.options.clone()
            },
        }
    }
}

/// Keep a short prefix so tokens stay recognisable in logs
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(6).collect();
    if secret.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{}***", prefix)
    }
}
