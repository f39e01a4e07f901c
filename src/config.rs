use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, error, warn};

/// Room server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,
    pub cloud_pod: Option<String>,

    /// JWT secret key. Without it websocket and service routes are open.
    pub cloud_auth_jwt_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        load_env_files();

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Parsed list of CORS origins
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .as_deref()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_pod: None,
            cloud_auth_jwt_secret: None,
        }
    }
}

/// Client session timings and endpoints.
///
/// Loaded from `COLABRI_SESSION_*` variables; every duration is in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_room_service_url")]
    pub room_service_url: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_save_confirm_timeout_ms")]
    pub save_confirm_timeout_ms: u64,
    #[serde(default = "default_save_settle_delay_ms")]
    pub save_settle_delay_ms: u64,
    #[serde(default = "default_sync_cooldown_ms")]
    pub sync_cooldown_ms: u64,
    #[serde(default = "default_typing_timeout_ms")]
    pub typing_timeout_ms: u64,
    #[serde(default = "default_typing_emit_interval_ms")]
    pub typing_emit_interval_ms: u64,
    #[serde(default = "default_leave_dedupe_ms")]
    pub leave_dedupe_ms: u64,
    #[serde(default = "default_room_poll_ms")]
    pub room_poll_ms: u64,
    #[serde(default = "default_autosave_ms")]
    pub autosave_ms: u64,
    #[serde(default = "default_doc_backoff_base_ms")]
    pub doc_backoff_base_ms: u64,
    #[serde(default = "default_doc_backoff_cap_ms")]
    pub doc_backoff_cap_ms: u64,
    #[serde(default = "default_doc_resync_ms")]
    pub doc_resync_ms: u64,
    #[serde(default = "default_event_backoff_cap_ms")]
    pub event_backoff_cap_ms: u64,
}

impl SessionConfig {
    /// Load the session configuration, falling back to defaults
    pub fn load() -> Self {
        load_env_files();
        match envy::prefixed("COLABRI_SESSION_").from_env::<SessionConfig>() {
            Ok(config) => config,
            Err(e) => {
                warn!("Invalid session configuration, using defaults: {}", e);
                SessionConfig::default()
            }
        }
    }

    /// Event channel websocket endpoint
    pub fn events_url(&self) -> String {
        format!("{}/ws/events", self.server_url.trim_end_matches('/'))
    }

    /// Replication websocket endpoint for a room
    pub fn docs_url(&self, room_id: &str) -> String {
        format!("{}/ws/docs/{}", self.server_url.trim_end_matches('/'), room_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn save_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.save_confirm_timeout_ms)
    }

    pub fn save_settle_delay(&self) -> Duration {
        Duration::from_millis(self.save_settle_delay_ms)
    }

    pub fn sync_cooldown(&self) -> Duration {
        Duration::from_millis(self.sync_cooldown_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn typing_emit_interval(&self) -> Duration {
        Duration::from_millis(self.typing_emit_interval_ms)
    }

    pub fn leave_dedupe(&self) -> Duration {
        Duration::from_millis(self.leave_dedupe_ms)
    }

    pub fn room_poll(&self) -> Duration {
        Duration::from_millis(self.room_poll_ms)
    }

    pub fn autosave(&self) -> Duration {
        Duration::from_millis(self.autosave_ms)
    }

    pub fn doc_backoff_base(&self) -> Duration {
        Duration::from_millis(self.doc_backoff_base_ms)
    }

    pub fn doc_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.doc_backoff_cap_ms)
    }

    pub fn doc_resync(&self) -> Duration {
        Duration::from_millis(self.doc_resync_ms)
    }

    pub fn event_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.event_backoff_cap_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            room_service_url: default_room_service_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            save_confirm_timeout_ms: default_save_confirm_timeout_ms(),
            save_settle_delay_ms: default_save_settle_delay_ms(),
            sync_cooldown_ms: default_sync_cooldown_ms(),
            typing_timeout_ms: default_typing_timeout_ms(),
            typing_emit_interval_ms: default_typing_emit_interval_ms(),
            leave_dedupe_ms: default_leave_dedupe_ms(),
            room_poll_ms: default_room_poll_ms(),
            autosave_ms: default_autosave_ms(),
            doc_backoff_base_ms: default_doc_backoff_base_ms(),
            doc_backoff_cap_ms: default_doc_backoff_cap_ms(),
            doc_resync_ms: default_doc_resync_ms(),
            event_backoff_cap_ms: default_event_backoff_cap_ms(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

fn load_env_files() {
    // Try to load from app.env file first
    if std::path::Path::new("app.env").exists() {
        dotenvy::from_filename("app.env").ok();
    } else {
        // Fallback to .env file
        dotenvy::dotenv().ok();
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "colabri-code".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_server_url() -> String {
    "ws://127.0.0.1:3000".to_string()
}

fn default_room_service_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_save_confirm_timeout_ms() -> u64 {
    10_000
}

fn default_save_settle_delay_ms() -> u64 {
    500
}

fn default_sync_cooldown_ms() -> u64 {
    60_000
}

fn default_typing_timeout_ms() -> u64 {
    5_000
}

fn default_typing_emit_interval_ms() -> u64 {
    1_000
}

fn default_leave_dedupe_ms() -> u64 {
    5_000
}

fn default_room_poll_ms() -> u64 {
    3_000
}

fn default_autosave_ms() -> u64 {
    5_000
}

fn default_doc_backoff_base_ms() -> u64 {
    250
}

fn default_doc_backoff_cap_ms() -> u64 {
    2_500
}

fn default_doc_resync_ms() -> u64 {
    10_000
}

fn default_event_backoff_cap_ms() -> u64 {
    5_000
}
