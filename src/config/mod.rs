//! Server configuration.
//!
//! Configuration comes from CLI arguments and an optional TOML file; TOML
//! values override CLI values where present.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_AUTHORIZE_URL: &str = "https://accounts.spotify.com/authorize";
pub const DEFAULT_ACCOUNTS_BASE_URL: &str = "https://accounts.spotify.com";
pub const DEFAULT_API_BASE_URL: &str = "https://api.spotify.com";

/// CLI arguments that take part in config resolution.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub port: u16,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorize_url: Option<String>,
    pub accounts_base_url: Option<String>,
    pub api_base_url: Option<String>,
    pub auth_sweep_interval_secs: u64,
}

/// TOML file configuration. Every field is optional; anything absent falls
/// back to the CLI value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub authorize_url: Option<String>,
    pub accounts_base_url: Option<String>,
    pub api_base_url: Option<String>,
    pub auth_sweep_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub client_id: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub accounts_base_url: String,
    pub api_base_url: String,
    /// How often expired authorization requests are swept out.
    pub auth_sweep_interval: Duration,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let client_id = match file.client_id.or_else(|| cli.client_id.clone()) {
            Some(id) if !id.is_empty() => id,
            _ => bail!("client_id must be specified via --client-id or in config file"),
        };

        let redirect_uri = match file.redirect_uri.or_else(|| cli.redirect_uri.clone()) {
            Some(uri) if !uri.is_empty() => uri,
            _ => bail!("redirect_uri must be specified via --redirect-uri or in config file"),
        };

        let port = file.port.unwrap_or(cli.port);

        let authorize_url = file
            .authorize_url
            .or_else(|| cli.authorize_url.clone())
            .unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string());
        let accounts_base_url = file
            .accounts_base_url
            .or_else(|| cli.accounts_base_url.clone())
            .unwrap_or_else(|| DEFAULT_ACCOUNTS_BASE_URL.to_string());
        let api_base_url = file
            .api_base_url
            .or_else(|| cli.api_base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let auth_sweep_interval = Duration::from_secs(
            file.auth_sweep_interval_secs
                .unwrap_or(cli.auth_sweep_interval_secs)
                .max(1),
        );

        Ok(Self {
            port,
            client_id,
            redirect_uri,
            authorize_url,
            accounts_base_url,
            api_base_url,
            auth_sweep_interval,
        })
    }
}
