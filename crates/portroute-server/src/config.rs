//! Server configuration: TOML file + CLI overrides.

use portroute_core::{RouteError, RouteResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub rules: RulesSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[api]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_bind")]
    pub bind: String,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            bind: default_api_bind(),
        }
    }
}

/// `[rules]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesSection {
    #[serde(default = "default_rules_path")]
    pub path: String,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            path: default_rules_path(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_api_port() -> u16 {
    19999
}
fn default_api_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_rules_path() -> String {
    "./rules.csv".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_addr: SocketAddr,
    pub rules_path: PathBuf,
    pub connect_timeout: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing config file is not an error: defaults apply.
    pub fn load(
        config_path: Option<&Path>,
        cli_rules: Option<&str>,
        cli_api_port: Option<u16>,
    ) -> RouteResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| RouteError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let api_port = cli_api_port.unwrap_or(file_config.api.port);
        let api_ip: IpAddr = file_config
            .api
            .bind
            .parse()
            .map_err(|_| RouteError::Config(format!("bad api bind address: {}", file_config.api.bind)))?;
        let rules_str = cli_rules
            .map(|s| s.to_string())
            .unwrap_or(file_config.rules.path);

        Ok(Self {
            api_addr: SocketAddr::new(api_ip, api_port),
            rules_path: expand_tilde_str(&rules_str),
            connect_timeout: Duration::from_secs(file_config.relay.connect_timeout_secs),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    PathBuf::from(s)
}
