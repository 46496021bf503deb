use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use soundmate_server::auth::{AuthRequestStore, AuthorizationFlow, InMemoryAuthRequestStore};
use soundmate_server::config;
use soundmate_server::provider::HttpProviderApi;
use soundmate_server::server::{run_server, ServerState};

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 5000)]
    pub port: u16,

    /// OAuth client id registered with the streaming provider.
    /// Can also be specified in config file.
    #[clap(long)]
    pub client_id: Option<String>,

    /// Redirect URI the provider sends the browser back to after consent.
    #[clap(long)]
    pub redirect_uri: Option<String>,

    /// Provider authorization endpoint.
    #[clap(long)]
    pub authorize_url: Option<String>,

    /// Base URL of the provider's accounts host (token grants).
    #[clap(long)]
    pub accounts_base_url: Option<String>,

    /// Base URL of the provider's API host.
    #[clap(long)]
    pub api_base_url: Option<String>,

    /// Seconds between sweeps of expired authorization requests.
    #[clap(long, default_value_t = 60)]
    pub auth_sweep_interval_secs: u64,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            port: args.port,
            client_id: args.client_id.clone(),
            redirect_uri: args.redirect_uri.clone(),
            authorize_url: args.authorize_url.clone(),
            accounts_base_url: args.accounts_base_url.clone(),
            api_base_url: args.api_base_url.clone(),
            auth_sweep_interval_secs: args.auth_sweep_interval_secs,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  port: {}", app_config.port);
    info!("  redirect_uri: {}", app_config.redirect_uri);
    info!("  accounts_base_url: {}", app_config.accounts_base_url);
    info!("  api_base_url: {}", app_config.api_base_url);

    let provider = Arc::new(HttpProviderApi::new(
        app_config.client_id.clone(),
        app_config.accounts_base_url.clone(),
        app_config.api_base_url.clone(),
    )?);

    let auth_store = Arc::new(InMemoryAuthRequestStore::new());
    let shutdown_token = CancellationToken::new();

    // Sweep expired authorization requests in the background.
    let sweep_store = auth_store.clone();
    let sweep_cancel = shutdown_token.child_token();
    let sweep_interval = app_config.auth_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let swept = sweep_store.sweep_expired().await;
            if swept > 0 {
                info!("Swept {} expired authorization requests", swept);
            }
        }
    });

    let flow = AuthorizationFlow::new(
        auth_store,
        provider.clone(),
        app_config.authorize_url.clone(),
        app_config.client_id.clone(),
        app_config.redirect_uri.clone(),
    );

    let server_state = ServerState {
        flow: Arc::new(flow),
        provider,
        redirect_uri: app_config.redirect_uri.clone(),
    };

    let server_shutdown = shutdown_token.child_token();
    tokio::select! {
        result = run_server(server_state, app_config.port, server_shutdown) => {
            if let Err(err) = result {
                error!("Server exited with error: {:?}", err);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    shutdown_token.cancel();
    info!("Shutdown complete");
    Ok(())
}
