//! Runtime configuration: one JSON file per network plus secrets from the
//! environment.
//!
//! ```json
//! {
//!   "network_id": "bdx",
//!   "timezone": "Europe/Paris",
//!   "timetable_dir": "gtfs/bdx",
//!   "overrides_path": "overrides.json",
//!   "fleet_catalog": "fleet.csv",
//!   "trip_updates": {
//!     "url": "https://example.org/gtfs-rt/trip-updates",
//!     "format": "gtfs-rt-protobuf",
//!     "auth": { "type": "url_param", "param_name": "key" },
//!     "key_env": "BDX_API_KEY"
//!   },
//!   "vehicle_positions": { "url": "https://example.org/gtfs-rt/vehicles", "format": "gtfs-rt-protobuf" },
//!   "refresh": { "trip_updates_secs": 30, "vehicles_secs": 15, "overrides_secs": 30 }
//! }
//! ```

use async_trait::async_trait;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::decode::FeedFormat;
use crate::error::ConfigError;
use crate::fetch::HttpClient;
use crate::fetch::auth::{ApiKey, UrlParam};
use crate::fetch::BasicClient;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// How an endpoint expects its API key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedAuth {
    /// No authentication required.
    #[default]
    None,
    /// API key appended as a URL query parameter with the given name.
    UrlParam { param_name: String },
    /// API key sent as an HTTP header with the given name.
    Header { header_name: String },
    /// API key sent as `Authorization: Bearer <key>`.
    Bearer,
}

impl FeedAuth {
    /// Returns `true` if any authentication credentials are needed.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, FeedAuth::None)
    }
}

/// Resolves a secret reference into its plaintext value.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get(&self, reference: &str) -> Result<String, ConfigError>;
}

/// Secrets from environment variables (`.env` is loaded at startup).
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvKeyStore;

#[async_trait]
impl KeyStore for EnvKeyStore {
    async fn get(&self, reference: &str) -> Result<String, ConfigError> {
        std::env::var(reference)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingSecret(reference.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub format: FeedFormat,
    #[serde(default)]
    pub auth: FeedAuth,
    /// Name of the variable holding the key, required unless `auth` is `none`.
    #[serde(default)]
    pub key_env: Option<String>,
}

impl EndpointConfig {
    /// HTTP client with this endpoint's authentication applied.
    pub async fn client<K: KeyStore + ?Sized>(
        &self,
        keys: &K,
    ) -> Result<Box<dyn HttpClient>, ConfigError> {
        let basic = BasicClient::with_timeout(REQUEST_TIMEOUT)?;
        if !self.auth.requires_auth() {
            return Ok(Box::new(basic));
        }

        let reference = self.key_env.as_deref().ok_or(ConfigError::MissingKeyEnv)?;
        let key = keys.get(reference).await?;
        debug!(url = %self.url, auth = ?self.auth, "Endpoint credentials resolved");

        let client: Box<dyn HttpClient> = match &self.auth {
            FeedAuth::None => Box::new(basic),
            FeedAuth::UrlParam { param_name } => Box::new(UrlParam {
                inner: basic,
                param_name: param_name.clone(),
                key,
            }),
            FeedAuth::Header { header_name } => Box::new(ApiKey::new(basic, header_name, &key)?),
            FeedAuth::Bearer => Box::new(ApiKey::bearer(basic, &key)?),
        };
        Ok(client)
    }
}

fn default_trip_updates_secs() -> u64 {
    30
}

fn default_vehicles_secs() -> u64 {
    15
}

fn default_overrides_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshIntervals {
    #[serde(default = "default_trip_updates_secs")]
    pub trip_updates_secs: u64,
    #[serde(default = "default_vehicles_secs")]
    pub vehicles_secs: u64,
    #[serde(default = "default_overrides_secs")]
    pub overrides_secs: u64,
}

impl Default for RefreshIntervals {
    fn default() -> Self {
        Self {
            trip_updates_secs: default_trip_updates_secs(),
            vehicles_secs: default_vehicles_secs(),
            overrides_secs: default_overrides_secs(),
        }
    }
}

impl RefreshIntervals {
    pub fn trip_updates(&self) -> Duration {
        Duration::from_secs(self.trip_updates_secs.max(1))
    }

    pub fn vehicles(&self) -> Duration {
        Duration::from_secs(self.vehicles_secs.max(1))
    }

    pub fn overrides(&self) -> Duration {
        Duration::from_secs(self.overrides_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    pub network_id: String,
    pub timezone: String,
    pub timetable_dir: PathBuf,
    pub overrides_path: PathBuf,
    #[serde(default)]
    pub fleet_catalog: Option<PathBuf>,
    pub trip_updates: EndpointConfig,
    #[serde(default)]
    pub vehicle_positions: Option<EndpointConfig>,
    #[serde(default)]
    pub refresh: RefreshIntervals,
}

impl ReconcilerConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.tz()?;
        Ok(config)
    }

    /// Agency timezone, e.g. `Europe/Paris`.
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        parse_timezone(&self.timezone)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::Timezone(name.to_string()))
}
