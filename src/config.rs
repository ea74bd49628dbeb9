use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub geo: GeoConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the PocketBase instance, e.g. `https://db.danusin.app`.
    pub base_url: String,
    /// Static auth token attached to every request, if set.
    pub auth_token: Option<String>,
    pub locations_collection: String,
    pub users_collection: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// How often the latest raw position sample is persisted (seconds).
    /// Raw samples arriving between ticks are not written.
    pub update_interval_seconds: u64,
    /// Consecutive write failures before the coordinator flags a degraded
    /// state instead of emitting one warning per failure.
    pub failure_threshold: u32,
    /// No user interaction for this long stops sharing automatically (seconds).
    pub inactivity_timeout_seconds: u64,
    /// Trailing window within which a stale-but-recent location record still
    /// counts towards the initial presence fetch (minutes).
    pub freshness_window_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    pub high_accuracy: bool,
    /// Time allowed for a position fix before the watch reports a timeout
    /// error (seconds). Cached fixes are never used.
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Id of the signed-in user this agent acts as.
    pub user_id: String,
    pub user_name: Option<String>,
    /// When true the agent shares a simulated random walk.
    pub demo_share: bool,
    /// When true the agent runs against the in-memory store instead of a
    /// PocketBase instance.
    pub offline: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            backend: BackendConfig {
                base_url: env::var("DANUSIN_BACKEND_URL")
                    .unwrap_or_else(|_| "http://localhost:8090".to_string()),
                auth_token: env::var("DANUSIN_AUTH_TOKEN").ok(),
                locations_collection: env::var("DANUSIN_LOCATIONS_COLLECTION")
                    .unwrap_or_else(|_| "danusin_locations".to_string()),
                users_collection: env::var("DANUSIN_USERS_COLLECTION")
                    .unwrap_or_else(|_| "users".to_string()),
                request_timeout_seconds: parse_env("DANUSIN_REQUEST_TIMEOUT_SECONDS", 20),
            },
            sync: SyncConfig {
                update_interval_seconds: parse_env("DANUSIN_UPDATE_INTERVAL_SECONDS", 12),
                failure_threshold: parse_env("DANUSIN_FAILURE_THRESHOLD", 3),
                inactivity_timeout_seconds: parse_env("DANUSIN_INACTIVITY_TIMEOUT_SECONDS", 120),
                freshness_window_minutes: parse_env("DANUSIN_FRESHNESS_WINDOW_MINUTES", 15),
            },
            geo: GeoConfig {
                high_accuracy: parse_bool_env("DANUSIN_GEO_HIGH_ACCURACY", true),
                acquire_timeout_seconds: parse_env("DANUSIN_GEO_TIMEOUT_SECONDS", 15),
            },
            agent: AgentConfig {
                user_id: env::var("DANUSIN_USER_ID")
                    .map_err(|_| ConfigError::MissingEnv("DANUSIN_USER_ID".to_string()))?,
                user_name: env::var("DANUSIN_USER_NAME").ok(),
                demo_share: parse_bool_env("DANUSIN_DEMO_SHARE", false),
                offline: parse_bool_env("DANUSIN_OFFLINE_DEMO", false),
            },
        })
    }
}

impl SyncConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_seconds)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_minutes * 60)
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl GeoConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendConfig {
                base_url: "http://localhost:8090".to_string(),
                auth_token: None,
                locations_collection: "danusin_locations".to_string(),
                users_collection: "users".to_string(),
                request_timeout_seconds: 20,
            },
            sync: SyncConfig {
                update_interval_seconds: 12,
                failure_threshold: 3,
                inactivity_timeout_seconds: 120,
                freshness_window_minutes: 15,
            },
            geo: GeoConfig {
                high_accuracy: true,
                acquire_timeout_seconds: 15,
            },
            agent: AgentConfig {
                user_id: String::new(),
                user_name: None,
                demo_share: false,
                offline: false,
            },
        }
    }
}
