//! Configuration loading for SafeWalk.
//!
//! The file lives at `~/.safewalk/config.toml`. Every section and key is
//! optional; [`SafewalkConfig::resolve`] fills in defaults and validates the
//! result into [`Settings`], which is what the rest of the workspace consumes.
//!
//! ```toml
//! [directions]
//! api_key = "${ORS_API_KEY}"
//!
//! [backend]
//! base_url = "https://safewalk.example.org"
//! token = "${SAFEWALK_TOKEN}"
//!
//! [monitor]
//! deviation_threshold_meters = 25.0
//!
//! [challenge]
//! timeout_secs = 10
//! timeout_policy = "treat_as_passed"
//!
//! [scorer]
//! max_samples = 5
//! ```
//!
//! String values support `${VAR}` environment expansion so secrets can stay
//! out of the file.

mod device;

pub use device::{DeviceIdError, device_id_path, load_or_create_device_id, resolve_device_id};

use safewalk_types::{Secret, TimeoutPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use thiserror::Error;

/// Default walking directions endpoint.
pub const DEFAULT_DIRECTIONS_URL: &str =
    "https://api.openrouteservice.org/v2/directions/foot-walking";

// The deployed app versions used 25 m, 50 m and 1 m.
const DEFAULT_DEVIATION_THRESHOLD_METERS: f64 = 25.0;
const DEFAULT_CHALLENGE_TIMEOUT_SECS: u64 = 10;
const MAX_CHALLENGE_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_MAX_POLLS: u32 = 5;
const DEFAULT_MAX_SAMPLES: usize = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Raw file contents. See the crate docs for the layout.
#[derive(Debug, Default, Deserialize)]
pub struct SafewalkConfig {
    pub directions: Option<DirectionsConfig>,
    pub backend: Option<BackendConfig>,
    pub monitor: Option<MonitorConfig>,
    pub challenge: Option<ChallengeConfig>,
    pub scorer: Option<ScorerConfig>,
    pub device: Option<DeviceConfig>,
}

#[derive(Default, Deserialize)]
pub struct DirectionsConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for DirectionsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionsConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Default, Deserialize)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    /// Permit plain `http://` endpoints. Default: false.
    #[serde(default)]
    pub allow_insecure_http: bool,
    pub request_timeout_secs: Option<u64>,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("allow_insecure_http", &self.allow_insecure_http)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MonitorConfig {
    /// Off-route distance that triggers a challenge. Default: 25.
    pub deviation_threshold_meters: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChallengeConfig {
    /// Wait before the first server timer check. Default: 10.
    pub timeout_secs: Option<u64>,
    /// Wait between timer checks that report "not elapsed". Default: 2.
    pub poll_interval_secs: Option<u64>,
    /// Timer checks before the challenge times out locally. Default: 5.
    pub max_polls: Option<u32>,
    /// `"treat_as_passed"` (default) or `"escalate"`.
    #[serde(default)]
    pub timeout_policy: TimeoutPolicy,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScorerConfig {
    /// Route points sent to the classifier per assessment. Default: 5.
    pub max_samples: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceConfig {
    /// Platform-provided hardware id. When unset a random id is generated
    /// and persisted next to the config file.
    pub id: Option<String>,
}

/// Validated, defaulted settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub directions: DirectionsSettings,
    pub backend: BackendSettings,
    pub monitor: DeviationSettings,
    pub challenge: ChallengeSettings,
    pub scorer: ScorerSettings,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DirectionsSettings {
    pub base_url: String,
    pub api_key: Secret,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub base_url: Option<String>,
    pub token: Option<Secret>,
    pub allow_insecure_http: bool,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviationSettings {
    pub deviation_threshold_meters: f64,
}

impl Default for DeviationSettings {
    fn default() -> Self {
        Self {
            deviation_threshold_meters: DEFAULT_DEVIATION_THRESHOLD_METERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_polls: u32,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_CHALLENGE_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_polls: DEFAULT_MAX_POLLS,
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScorerSettings {
    pub max_samples: usize,
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self {
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unclosed: keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expanded(value: Option<&String>) -> Option<String> {
    value
        .map(|v| expand_env_vars(v))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SafewalkConfig {
    /// Load `~/.safewalk/config.toml`. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Apply defaults and validate.
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let directions = self.directions.as_ref();
        let directions = DirectionsSettings {
            base_url: expanded(directions.and_then(|d| d.base_url.as_ref()))
                .unwrap_or_else(|| DEFAULT_DIRECTIONS_URL.to_string()),
            api_key: Secret::new(
                expanded(directions.and_then(|d| d.api_key.as_ref())).unwrap_or_default(),
            ),
        };

        let backend = self.backend.as_ref();
        let request_timeout_secs = backend
            .and_then(|b| b.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.request_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        let backend = BackendSettings {
            base_url: expanded(backend.and_then(|b| b.base_url.as_ref())),
            token: expanded(backend.and_then(|b| b.token.as_ref())).map(Secret::new),
            allow_insecure_http: backend.is_some_and(|b| b.allow_insecure_http),
            request_timeout: Duration::from_secs(request_timeout_secs),
        };

        let threshold = self
            .monitor
            .as_ref()
            .and_then(|m| m.deviation_threshold_meters)
            .unwrap_or(DEFAULT_DEVIATION_THRESHOLD_METERS);
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "monitor.deviation_threshold_meters",
                reason: format!("must be a positive number of meters, got {threshold}"),
            });
        }

        let challenge = self.challenge.as_ref();
        let timeout_secs = challenge
            .and_then(|c| c.timeout_secs)
            .unwrap_or(DEFAULT_CHALLENGE_TIMEOUT_SECS);
        let poll_interval_secs = challenge
            .and_then(|c| c.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if !(1..=MAX_CHALLENGE_TIMEOUT_SECS).contains(&timeout_secs) {
            return Err(ConfigError::Invalid {
                field: "challenge.timeout_secs",
                reason: format!(
                    "must be between 1 and {MAX_CHALLENGE_TIMEOUT_SECS}, got {timeout_secs}"
                ),
            });
        }
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "challenge.poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        let challenge = ChallengeSettings {
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_polls: challenge
                .and_then(|c| c.max_polls)
                .unwrap_or(DEFAULT_MAX_POLLS)
                .max(1),
            timeout_policy: challenge.map(|c| c.timeout_policy).unwrap_or_default(),
        };

        let max_samples = self
            .scorer
            .as_ref()
            .and_then(|s| s.max_samples)
            .unwrap_or(DEFAULT_MAX_SAMPLES);
        if max_samples == 0 {
            return Err(ConfigError::Invalid {
                field: "scorer.max_samples",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Settings {
            directions,
            backend,
            monitor: DeviationSettings {
                deviation_threshold_meters: threshold,
            },
            challenge,
            scorer: ScorerSettings { max_samples },
            device_id: expanded(self.device.as_ref().and_then(|d| d.id.as_ref())),
        })
    }
}

/// `~/.safewalk`, home of the config file, logs and device id.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".safewalk"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}
