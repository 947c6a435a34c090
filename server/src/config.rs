use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::state::GatewaySettings;

/// bazaar realtime gateway
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "bazaar-gateway", version, about = "bazaar realtime chat gateway")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "BAZAAR_PORT", default_value = "8000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BAZAAR_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./bazaar.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "BAZAAR_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "BAZAAR_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Gateway timing and URL settings (loaded from [gateway] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub gateway: GatewayConfig,
}

/// The `[gateway]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Seconds between `ping` frames on each connection (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds a presence entry lives without a heartbeat (default: 300)
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_secs: u64,

    /// Seconds between expired presence sweeps (default: 60)
    #[serde(default = "default_presence_sweep_interval")]
    pub presence_sweep_interval_secs: u64,

    /// Base URL for media upload and download links
    #[serde(default = "default_media_base_url")]
    pub media_base_url: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            presence_ttl_secs: default_presence_ttl(),
            presence_sweep_interval_secs: default_presence_sweep_interval(),
            media_base_url: default_media_base_url(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_presence_ttl() -> u64 {
    300
}

fn default_presence_sweep_interval() -> u64 {
    60
}

fn default_media_base_url() -> String {
    "http://localhost:8000/media".to_string()
}

impl GatewayConfig {
    /// Runtime settings. Zero intervals are raised to one second.
    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            presence_ttl: Duration::from_secs(self.presence_ttl_secs.max(1)),
            presence_sweep_interval: Duration::from_secs(self.presence_sweep_interval_secs.max(1)),
            media_base_url: self.media_base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_address: "0.0.0.0".to_string(),
            config: "./bazaar.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BAZAAR_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Self::figment(&config_path)
            .merge(Serialized::defaults(cli))
            .extract()
    }

    /// Defaults, TOML and environment layers without the CLI on top.
    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("BAZAAR_").split("__"))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# bazaar gateway configuration
# Place this file at ./bazaar.toml or specify with --config <path>
# All settings can be overridden via environment variables (BAZAAR_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8000)
# port = 8000

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for SQLite database and JWT signing key
# data_dir = "./data"

# ---- Realtime gateway ----
# Nested keys can also be set from the environment, e.g.
# BAZAAR_GATEWAY__PRESENCE_TTL_SECS=120
# [gateway]

# Seconds between ping frames sent to each client
# heartbeat_interval_secs = 30

# Seconds a user stays online without a heartbeat
# presence_ttl_secs = 300

# Seconds between sweeps of expired presence entries
# presence_sweep_interval_secs = 60

# Base URL used to build media upload/download links
# media_base_url = "http://localhost:8000/media"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_as_toml_and_matches_defaults() {
        let path = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(path.path(), generate_config_template()).unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.path()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.gateway.presence_ttl_secs, 300);
    }

    #[test]
    fn test_gateway_table_overrides_defaults() {
        let path = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            path.path(),
            "port = 9100\n[gateway]\nheartbeat_interval_secs = 5\nmedia_base_url = \"https://cdn.example/media/\"\n",
        )
        .unwrap();

        let config: Config = Config::figment(path.path().to_str().unwrap()).extract().unwrap();
        assert_eq!(config.port, 9100);

        let settings = config.gateway.settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.presence_ttl, Duration::from_secs(300));
        assert_eq!(settings.media_base_url, "https://cdn.example/media");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let gateway = GatewayConfig {
            heartbeat_interval_secs: 0,
            presence_sweep_interval_secs: 0,
            ..GatewayConfig::default()
        };
        let settings = gateway.settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(settings.presence_sweep_interval, Duration::from_secs(1));
    }
}
