use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(name = "azauth")]
#[command(author, version, about = "azauth - Azure AD sign-in for database connections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage token cache entries
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Authenticate and print the connection auth descriptor
    Login {
        /// Token cache entry to sign in with
        id: i64,

        /// Auth type (access-token, password, msi-vm, service-principal-secret, default)
        #[arg(short = 't', long = "type", default_value = "access-token")]
        auth_type: String,

        /// User name for password auth
        #[arg(long)]
        user: Option<String>,

        /// Password for password auth
        #[arg(long)]
        password: Option<String>,

        /// Tenant id for password / service principal auth
        #[arg(long)]
        tenant: Option<String>,

        /// MSI endpoint for msi-vm auth
        #[arg(long)]
        msi_endpoint: Option<String>,

        /// Client secret for service principal auth
        #[arg(long)]
        client_secret: Option<String>,

        /// Print the sign-in URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Print secrets unmasked
        #[arg(long)]
        show_token: bool,
    },

    /// List the auth types offered for Azure SQL connections
    Types,
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create an empty token cache entry and print its id
    Add,

    /// Show whether an entry is linked to a signed-in account
    Show {
        /// Token cache entry id
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "azure_broker_auth=debug,azauth=debug"
    } else {
        "azure_broker_auth=info,azauth=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = cli::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Account { action } => match action {
            AccountAction::Add => cli::run_account_add(&config).await?,
            AccountAction::Show { id } => cli::run_account_show(&config, id).await?,
        },
        Commands::Login {
            id,
            auth_type,
            user,
            password,
            tenant,
            msi_endpoint,
            client_secret,
            no_browser,
            show_token,
        } => {
            let options = azure_broker_auth::AuthOptions {
                password,
                user_name: user,
                tenant_id: tenant,
                msi_endpoint,
                client_secret,
            };
            cli::run_login(
                &config,
                id,
                &auth_type,
                options,
                cli::LoginFlags {
                    open_browser: !no_browser,
                    show_token,
                },
            )
            .await?;
        }
        Commands::Types => cli::run_types(),
    }

    Ok(())
}
