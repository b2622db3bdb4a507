//! Command handlers for the azauth binary

use anyhow::{Context, Result};
use azure_broker_auth::auth::{BrokerClient, BrowserLauncher, EntraIdClient};
use azure_broker_auth::secure_store::FieldCipher;
use azure_broker_auth::{
    AuthConfig, AuthOptions, AzureAuthService, AzureAuthType, Config, SqliteTokenCacheStore,
    TokenCacheStore,
};
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

pub struct LoginFlags {
    pub open_browser: bool,
    pub show_token: bool,
}

/// Prints the consent URL and optionally opens it
struct ConsoleBrowser {
    open_browser: bool,
}

impl BrowserLauncher for ConsoleBrowser {
    fn open(&self, url: &str) -> Result<()> {
        eprintln!();
        eprintln!("{}", "Azure AD Sign-in".bold().cyan());
        eprintln!();
        eprintln!("If the browser doesn't open automatically, visit:");
        eprintln!("  {}", url);
        eprintln!();
        eprintln!("Waiting for sign-in... (Ctrl+C to cancel)");

        if self.open_browser {
            open::that(url).context("Could not open browser automatically")?;
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn open_store(config: &Config) -> Result<SqliteTokenCacheStore> {
    let cipher = FieldCipher::load_or_create(&config.storage.key_path()?)?;
    SqliteTokenCacheStore::open(config.storage.database_path()?, cipher)
}

pub async fn run_account_add(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let record = store.create().await?;
    println!("{}", record.id);
    Ok(())
}

pub async fn run_account_show(config: &Config, id: i64) -> Result<()> {
    let store = open_store(config)?;
    let record = store.load(id).await?;

    println!("{} {}", "Token cache entry:".bold(), record.id);
    println!("  Database:       {}", store.path().display());
    if record.has_home_account() {
        println!("  Linked account: {}", record.home_account_id.green());
    } else {
        println!("  Linked account: {}", "none (sign in with `azauth login`)".yellow());
    }
    println!(
        "  Cached tokens:  {}",
        if record.serialized_cache.is_some() {
            "yes"
        } else {
            "no"
        }
    );
    Ok(())
}

pub fn run_types() {
    println!("{}", "Supported Azure AD auth types:".bold());
    for (auth_type, name) in AzureAuthType::supported() {
        println!("  {:<28} {}", auth_type.as_str().green(), name);
    }
}

pub async fn run_login(
    config: &Config,
    id: i64,
    auth_type: &str,
    options: AuthOptions,
    flags: LoginFlags,
) -> Result<()> {
    let auth_type: AzureAuthType = auth_type.parse()?;

    // Non-interactive types are pure option shaping
    let auth = if !auth_type.is_interactive() {
        AuthConfig::shape(auth_type, &config.azure.client_id, &options)
            .context("Auth type requires a browser sign-in")?
    } else {
        match sign_in(config, id, auth_type, &options, flags.open_browser).await {
            Ok(auth) => auth,
            Err(e) if e.is_user_retryable() => {
                eprintln!("{}", e.to_string().yellow());
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        }
    };

    let printable = if flags.show_token {
        auth
    } else {
        auth.redacted()
    };
    println!("{}", serde_json::to_string_pretty(&printable)?);
    Ok(())
}

async fn sign_in(
    config: &Config,
    id: i64,
    auth_type: AzureAuthType,
    options: &AuthOptions,
    open_browser: bool,
) -> Result<AuthConfig, azure_broker_auth::AuthError> {
    let store: Arc<dyn TokenCacheStore> = Arc::new(open_store(config)?);
    let broker = Arc::new(BrokerClient::new(&config.broker)?);
    let provider = Arc::new(EntraIdClient::new(&config.azure)?);
    let browser = Arc::new(ConsoleBrowser { open_browser });

    let mut service = AzureAuthService::new(config, broker, provider, store, browser);
    service.init(id).await?;

    // First Ctrl+C abandons the sign-in, a second one quits
    let cancel = service.cancel_handle();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("{}", "Cancelling sign-in... (Ctrl+C again to quit)".yellow());
        cancel.cancel();
    })
    .map_err(anyhow::Error::from)?;

    service.auth(auth_type, options).await
}
