use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/client.json";
pub const DEFAULT_SERVER_URL: &str = "https://mudates.tiguleni.com";

const API_URL_ENV: &str = "CHAT_API_URL";
const SOCKET_URL_ENV: &str = "CHAT_SOCKET_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_url: String,
    pub socket_url: String,
    pub join_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub max_upload_bytes: u64,
    /// Send over REST when the socket is down.
    pub http_fallback: bool,
    /// Consecutive history failures after which an error is shown even
    /// though messages are still on screen. Unset keeps them quiet.
    pub surface_history_errors_after: Option<u32>,
    pub session_db_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_SERVER_URL.to_string(),
            socket_url: "wss://mudates.tiguleni.com/ws".to_string(),
            join_timeout_ms: 8_000,
            send_timeout_ms: 8_000,
            reconnect_delay_ms: 500,
            max_reconnect_delay_ms: 10_000,
            max_upload_bytes: 10 * 1024 * 1024,
            http_fallback: true,
            surface_history_errors_after: None,
            session_db_path: "data/session.db".to_string(),
        }
    }
}

impl AppConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Environment variables (after `.env` is loaded) win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                log::info!("Using {API_URL_ENV}={url}");
                self.api_url = url;
            }
        }
        if let Ok(url) = env::var(SOCKET_URL_ENV) {
            if !url.trim().is_empty() {
                log::info!("Using {SOCKET_URL_ENV}={url}");
                self.socket_url = url;
            }
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let mut config = read_config_file(Path::new(path));
    config.apply_env_overrides();
    config
}

fn read_config_file(path: &Path) -> AppConfig {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
