//! HTTP client for the heating server's REST API.
//!
//! The server plays two roles for the gateway: it accepts uploaded
//! telemetry, and it is the directory that knows which thermostats belong to
//! this gateway and what their heating tables are.
//!
//! | Request | Purpose |
//! |---------|---------|
//! | `GET /` | connectivity probe |
//! | `GET device/thermostat/lookup/?mac=` | thermostat by MAC |
//! | `POST <thermostat>/temperature/` | `{datetime, value}` |
//! | `POST <thermostat>/meta_entry/` | `{datetime, rssi}` |
//! | `GET device/raspberry/lookup/?mac=` | gateway and its thermostats |
//! | `GET <heating_table_url>` | heating table entries |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use smartheat_types::{HeatingTableEntry, TelemetryKind, TelemetryRecord};

/// Error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The server is not reachable.
    #[error("Server not reachable at {url}: {source}")]
    NotReachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// HTTP request failed after the connection was made.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Invalid base URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The server answered with a non-2xx status.
    #[error("{url} returned {status}: {message}")]
    Api {
        url: String,
        status: u16,
        message: String,
    },

    /// The server does not know the device.
    #[error("Unknown device {0}")]
    UnknownDevice(String),

    /// The gateway is registered but not linked to a residence.
    #[error("Gateway {0} is not linked to a residence")]
    NotLinked(String),

    /// The response body did not have the expected shape.
    #[error("Unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl ServerError {
    /// Whether the failure is the network rather than the server's answer.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ServerError::NotReachable { .. } => true,
            ServerError::Request(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Why an upload did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// The server could not be reached; the record should be retried.
    #[error("No connection to the server: {0}")]
    Connectivity(String),

    /// The server was reached but did not accept the record.
    #[error("Upload rejected: {0}")]
    Rejected(String),
}

impl From<ServerError> for UploadError {
    fn from(err: ServerError) -> Self {
        if err.is_connectivity() {
            UploadError::Connectivity(err.to_string())
        } else {
            UploadError::Rejected(err.to_string())
        }
    }
}

/// Destination for stored telemetry.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Whether the server can be reached at all.
    async fn is_connected(&self) -> bool;

    /// Upload one record.
    async fn upload(&self, record: &TelemetryRecord) -> Result<(), UploadError>;
}

/// A thermostat linked to this gateway, as listed by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedThermostat {
    /// Thermostat MAC.
    pub mac: String,
    /// Where its heating table is published.
    pub heating_table_url: Option<String>,
}

/// Source of the thermostat list and heating tables.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Thermostats linked to the gateway with MAC `gateway_mac`.
    async fn linked_thermostats(
        &self,
        gateway_mac: &str,
    ) -> Result<Vec<LinkedThermostat>, ServerError>;

    /// Entries of the heating table published at `url`.
    async fn heating_table(&self, url: &str) -> Result<Vec<HeatingTableEntry>, ServerError>;
}

// ==========================================================================
// Wire types
// ==========================================================================

#[derive(Debug, Deserialize)]
struct ThermostatDevice {
    mac: Option<String>,
    thermostat: Option<Thermostat>,
}

#[derive(Debug, Deserialize)]
struct Thermostat {
    url: Option<String>,
    heating_table_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RaspberryDevice {
    residence: Option<serde_json::Value>,
    #[serde(default)]
    thermostat_devices: Vec<ThermostatDevice>,
}

#[derive(Debug, Serialize)]
struct TemperatureUpload {
    #[serde(with = "time::serde::rfc3339")]
    datetime: OffsetDateTime,
    value: f32,
}

#[derive(Debug, Serialize)]
struct MetaUpload {
    #[serde(with = "time::serde::rfc3339")]
    datetime: OffsetDateTime,
    rssi: f32,
}

// ==========================================================================
// HttpServer
// ==========================================================================

/// HTTP client for the heating server.
#[derive(Debug, Clone)]
pub struct HttpServer {
    client: Client,
    base_url: String,
}

impl HttpServer {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ServerError::Request)?;
        Self::with_client(base_url, client)
    }

    /// Create a client with a custom reqwest Client.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self, ServerError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ServerError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        // Relative resource paths are appended, so keep exactly one slash.
        let base_url = format!("{}/", base_url.trim_end_matches('/'));
        Ok(Self { client, base_url })
    }

    /// The base URL, with a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of the thermostat known by `mac`.
    async fn thermostat_url(&self, mac: &str) -> Result<String, ServerError> {
        let url = format!("{}device/thermostat/lookup/", self.base_url);
        let device: ThermostatDevice = match self.get(&url, &[("mac", mac)]).await {
            Err(ServerError::Api { status: 404, .. }) => {
                return Err(ServerError::UnknownDevice(mac.to_string()));
            }
            other => other?,
        };

        device
            .thermostat
            .and_then(|t| t.url)
            .ok_or_else(|| ServerError::InvalidResponse {
                url,
                message: format!("no thermostat linked to device {}", mac),
            })
    }

    /// Upload a temperature measurement.
    pub async fn upload_temperature(&self, record: &TelemetryRecord) -> Result<(), ServerError> {
        let thermostat = self.thermostat_url(&record.mac).await?;
        let body = TemperatureUpload {
            datetime: record.timestamp,
            value: record.value,
        };
        self.post_json(&format!("{}temperature/", with_slash(&thermostat)), &body)
            .await
    }

    /// Upload a signal strength measurement.
    pub async fn upload_meta(&self, record: &TelemetryRecord) -> Result<(), ServerError> {
        let thermostat = self.thermostat_url(&record.mac).await?;
        let body = MetaUpload {
            datetime: record.timestamp,
            rssi: record.value,
        };
        self.post_json(&format!("{}meta_entry/", with_slash(&thermostat)), &body)
            .await
    }

    // ======================================================================
    // Internal HTTP helpers
    // ======================================================================

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ServerError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| not_reachable(url, e))?;

        let response = check_status(url, response).await?;
        response
            .json()
            .await
            .map_err(|e| ServerError::InvalidResponse {
                url: url.to_string(),
                message: e.to_string(),
            })
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<(), ServerError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| not_reachable(url, e))?;

        check_status(url, response).await?;
        Ok(())
    }
}

fn with_slash(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

fn not_reachable(url: &str, err: reqwest::Error) -> ServerError {
    if err.is_connect() || err.is_timeout() {
        ServerError::NotReachable {
            url: url.to_string(),
            source: err,
        }
    } else {
        ServerError::Request(err)
    }
}

async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ServerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .ok()
        .filter(|body| !body.is_empty())
        .unwrap_or_else(|| status.to_string());

    Err(ServerError::Api {
        url: url.to_string(),
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Uploader for HttpServer {
    async fn is_connected(&self) -> bool {
        // Any HTTP answer counts; only transport failures mean offline.
        self.client.get(&self.base_url).send().await.is_ok()
    }

    async fn upload(&self, record: &TelemetryRecord) -> Result<(), UploadError> {
        let result = match record.kind {
            TelemetryKind::Temperature => self.upload_temperature(record).await,
            TelemetryKind::Rssi => self.upload_meta(record).await,
        };
        result.map_err(UploadError::from)
    }
}

#[async_trait]
impl Directory for HttpServer {
    async fn linked_thermostats(
        &self,
        gateway_mac: &str,
    ) -> Result<Vec<LinkedThermostat>, ServerError> {
        let url = format!("{}device/raspberry/lookup/", self.base_url);
        let gateway: RaspberryDevice = match self.get(&url, &[("mac", gateway_mac)]).await {
            Err(ServerError::Api { status: 404, .. }) => {
                return Err(ServerError::UnknownDevice(gateway_mac.to_string()));
            }
            other => other?,
        };

        if gateway.residence.as_ref().is_none_or(|r| r.is_null()) {
            return Err(ServerError::NotLinked(gateway_mac.to_string()));
        }

        Ok(gateway
            .thermostat_devices
            .into_iter()
            .filter_map(|device| {
                let mac = device.mac?;
                Some(LinkedThermostat {
                    mac,
                    heating_table_url: device.thermostat.and_then(|t| t.heating_table_url),
                })
            })
            .collect())
    }

    async fn heating_table(&self, url: &str) -> Result<Vec<HeatingTableEntry>, ServerError> {
        self.get(url, &[]).await
    }
}
