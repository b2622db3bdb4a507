//! azure-broker-auth: Azure AD sign-in for database connections
//!
//! This library provides:
//! - Brokered interactive sign-in for clients that cannot host a redirect listener
//! - Silent refresh from an encrypted, persistent token cache
//! - Connection auth descriptors for the non-interactive Azure AD modes

pub mod auth;
pub mod config;
pub mod secure_store;
pub mod storage;

pub use auth::{AuthConfig, AuthError, AuthOptions, AzureAuthService, AzureAuthType};
pub use config::Config;
pub use storage::{SqliteTokenCacheStore, TokenCacheRecord, TokenCacheStore};
