//! Gateway configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use smartheat_core::{TARGET_MODE, TransportConfig};
use smartheat_types::{DEFAULT_COAP_PORT, DeviceAddress, LinkPrefix};

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Thermostat list and heating tables (JSON).
    pub thermostats_path: PathBuf,
    /// Local queue settings.
    pub storage: StorageConfig,
    /// Upload and directory server.
    pub server: ServerConfig,
    /// Identity of this gateway.
    pub gateway: GatewayIdentity,
    /// How thermostats are reached.
    pub devices: DevicesConfig,
    /// Cycle timing.
    pub cycle: CycleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thermostats_path: local_data_file("thermostats.json"),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            gateway: GatewayIdentity::default(),
            devices: DevicesConfig::default(),
            cycle: CycleConfig::default(),
        }
    }
}

impl Config {
    /// Read `gateway.toml` from the user configuration directory, or fall
    /// back to the defaults when there is none.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Parse a TOML file. Missing sections and keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.into(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.into(),
            source,
        })
    }

    /// [`Config::load`] followed by [`Config::validate`].
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.into(),
                source,
            })?;
        }
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.into(),
            source,
        })
    }

    /// Check every section and report all problems at once.
    ///
    /// # Example
    ///
    /// ```
    /// use smartheat_gateway::Config;
    ///
    /// assert!(Config::default().validate().is_ok());
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Problems::default();

        self.storage.check(&mut problems);
        self.server.check(&mut problems);
        self.gateway.check(&mut problems);
        self.devices.check(&mut problems);
        self.cycle.check(&mut problems);
        problems.require(
            !self.thermostats_path.as_os_str().is_empty(),
            "thermostats_path",
            "thermostat configuration path cannot be empty",
        );

        problems.into_result()
    }
}

/// Where the telemetry queue lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: smartheat_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    fn check(&self, problems: &mut Problems) {
        problems.require(
            !self.path.as_os_str().is_empty(),
            "storage.path",
            "database path cannot be empty",
        );
    }
}

/// Upload and directory server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the REST API.
    pub url: String,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/".to_string(),
            timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    fn check(&self, problems: &mut Problems) {
        let scheme_ok = ["http://", "https://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        problems.require(
            scheme_ok,
            "server.url",
            format!("URL must start with http:// or https://, got '{}'", self.url),
        );
        problems.require(
            self.timeout_secs > 0,
            "server.timeout_secs",
            "timeout must be at least 1 second",
        );
    }

    /// Request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Identity of this gateway on the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayIdentity {
    /// MAC address the server knows this gateway by. Required for `refresh`.
    pub mac: Option<String>,
}

impl GatewayIdentity {
    fn check(&self, problems: &mut Problems) {
        if let Some(Err(e)) = self.mac.as_deref().map(DeviceAddress::from_mac) {
            problems.push("gateway.mac", e.to_string());
        }
    }
}

/// How thermostats are addressed and paced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Network prefix the MAC-derived interface identifier is appended to.
    pub prefix: LinkPrefix,
    /// CoAP port.
    pub port: u16,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Wait between dependent requests to the same device, in milliseconds.
    pub pacing_ms: u64,
    /// Operating mode every thermostat must be in.
    pub target_mode: String,
    /// How many times the current target is read before giving up.
    pub target_retries: u32,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            prefix: LinkPrefix::default(),
            port: DEFAULT_COAP_PORT,
            request_timeout_secs: 10,
            pacing_ms: 3000,
            target_mode: TARGET_MODE.to_string(),
            target_retries: 3,
        }
    }
}

impl DevicesConfig {
    fn check(&self, problems: &mut Problems) {
        problems.require(self.port != 0, "devices.port", "port cannot be 0");
        problems.require(
            self.request_timeout_secs > 0,
            "devices.request_timeout_secs",
            "request timeout must be at least 1 second",
        );
        problems.require(
            self.pacing_ms > 0,
            "devices.pacing_ms",
            "requests to one thermostat must be paced",
        );
        problems.require(
            !self.target_mode.trim().is_empty(),
            "devices.target_mode",
            "target mode cannot be empty",
        );
        problems.require(
            self.target_retries > 0,
            "devices.target_retries",
            "target must be read at least once",
        );
    }

    /// Pacing delay between dependent requests.
    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Transport settings for these devices.
    pub fn transport(&self) -> TransportConfig {
        TransportConfig::default()
            .port(self.port)
            .timeout(Duration::from_secs(self.request_timeout_secs))
    }
}

/// Minimum cycle interval in seconds.
pub const MIN_CYCLE_INTERVAL: u64 = 10;

/// Cycle timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Seconds between cycle starts in `run` mode.
    pub interval_secs: u64,
    /// Upper bound on the device phases of one cycle, in seconds.
    pub deadline_secs: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            deadline_secs: 240,
        }
    }
}

impl CycleConfig {
    fn check(&self, problems: &mut Problems) {
        problems.require(
            self.interval_secs >= MIN_CYCLE_INTERVAL,
            "cycle.interval_secs",
            format!(
                "interval {} is too short (minimum {} seconds)",
                self.interval_secs, MIN_CYCLE_INTERVAL
            ),
        );
        problems.require(
            self.deadline_secs > 0,
            "cycle.deadline_secs",
            "deadline must be at least 1 second",
        );
    }

    /// Loop period.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Cycle deadline.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Cannot encode configuration: {0}")]
    Serialize(toml::ser::Error),
    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration:{}", bullet_list(.0))]
    Validation(Vec<ValidationError>),
}

/// One rejected setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted key, e.g. `devices.port`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Accumulates validation failures across sections.
#[derive(Debug, Default)]
struct Problems(Vec<ValidationError>);

impl Problems {
    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.0.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    fn require(&mut self, ok: bool, field: &str, message: impl Into<String>) {
        if !ok {
            self.push(field, message);
        }
    }

    fn into_result(self) -> Result<(), ConfigError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(self.0))
        }
    }
}

fn bullet_list(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| format!("\n  - {}", e)).collect()
}

/// `gateway.toml` in the user configuration directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_default()
        .join("smartheat")
        .join("gateway.toml")
}

fn local_data_file(name: &str) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_default()
        .join("smartheat")
        .join(name)
}
