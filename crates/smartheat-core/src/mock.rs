//! Mock thermostat transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] by answering requests from an
//! in-memory table of [`MockThermostat`]s, so device logic can be tested
//! without a border router or real hardware.
//!
//! # Features
//!
//! - **Resource emulation**: temperature, heartbeat, mode and target resources
//! - **Failure injection**: timeouts, transport errors, response codes, and
//!   a number of transient failures before recovering
//! - **Latency simulation**: per-device delays, for concurrency tests
//! - **Request log**: every request with its arrival time, for pacing checks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use smartheat_types::DeviceAddress;

use crate::coap::{Method, ResponseCode};
use crate::error::RequestFailure;
use crate::thermostat::{HEARTBEAT_PATH, MODE_PATH, TARGET_PATH, TEMPERATURE_PATH, format_temperature};
use crate::transport::{Response, Transport};

/// Injected failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Never answer; the request times out.
    Timeout,
    /// Fail with a transport error.
    Transport,
    /// Answer every request with this response code.
    Code(ResponseCode),
}

/// State of one emulated thermostat.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use smartheat_core::mock::MockThermostat;
///
/// let thermostat = MockThermostat::new(20.5)
///     .with_rssi(-70)
///     .with_mode("manual")
///     .with_latency(Duration::from_millis(250));
/// assert_eq!(thermostat.mode, "manual");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MockThermostat {
    /// Room temperature served at `/sensors/temperature`.
    pub temperature: f32,
    /// Raw payload served at `/debug/heartbeat`.
    pub heartbeat: String,
    /// Current operating mode.
    pub mode: String,
    /// Current target temperature.
    pub target: f32,
    /// Delay before every answer.
    pub latency: Duration,
    /// Permanent failure, if any.
    pub failure: Option<MockFailure>,
    /// Number of upcoming requests that time out before the device recovers.
    pub transient_failures: u32,
}

impl MockThermostat {
    /// A healthy thermostat reading `temperature`.
    pub fn new(temperature: f32) -> Self {
        Self {
            temperature,
            heartbeat: heartbeat_payload(-60),
            mode: "manual".to_string(),
            target: 20.0,
            latency: Duration::ZERO,
            failure: None,
            transient_failures: 0,
        }
    }

    /// Serve a heartbeat with this signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i32) -> Self {
        self.heartbeat = heartbeat_payload(rssi);
        self
    }

    /// Serve this raw heartbeat payload.
    #[must_use]
    pub fn with_heartbeat(mut self, payload: impl Into<String>) -> Self {
        self.heartbeat = payload.into();
        self
    }

    /// Start in this operating mode.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Start with this target temperature.
    #[must_use]
    pub fn with_target(mut self, target: f32) -> Self {
        self.target = target;
        self
    }

    /// Delay every answer.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Time out the next `count` requests, then recover.
    #[must_use]
    pub fn with_transient_failures(mut self, count: u32) -> Self {
        self.transient_failures = count;
        self
    }

    /// Fail every request.
    #[must_use]
    pub fn failing(mut self, failure: MockFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Answer a request that got past failure injection.
    fn handle(&mut self, method: Method, path: &str, payload: Option<&str>) -> Response {
        match (method, path) {
            (Method::Get, TEMPERATURE_PATH) => {
                Response::new(ResponseCode::CONTENT, format_temperature(self.temperature))
            }
            (Method::Get, HEARTBEAT_PATH) => Response::new(ResponseCode::CONTENT, self.heartbeat.clone()),
            (Method::Get, MODE_PATH) => Response::new(ResponseCode::CONTENT, self.mode.clone()),
            (Method::Put, MODE_PATH) => match payload {
                Some(mode) => {
                    self.mode = mode.to_string();
                    Response::new(ResponseCode::CHANGED, mode.to_string())
                }
                None => Response::new(ResponseCode::BAD_REQUEST, ""),
            },
            (Method::Get, TARGET_PATH) => {
                Response::new(ResponseCode::CONTENT, format_temperature(self.target))
            }
            (Method::Put, TARGET_PATH) => match payload.and_then(|p| p.trim().parse::<f32>().ok()) {
                Some(target) => {
                    self.target = target;
                    Response::new(ResponseCode::CHANGED, format_temperature(target))
                }
                None => Response::new(ResponseCode::BAD_REQUEST, ""),
            },
            _ => Response::new(ResponseCode::NOT_FOUND, ""),
        }
    }
}

fn heartbeat_payload(rssi: i32) -> String {
    format!("version:mock-1.0,uptime:3600,rssi:{}", rssi)
}

/// A request seen by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// Destination device.
    pub address: DeviceAddress,
    /// Request method.
    pub method: Method,
    /// Resource path.
    pub path: String,
    /// Request payload.
    pub payload: Option<String>,
    /// When the request was issued.
    pub at: Instant,
}

/// In-memory [`Transport`] answering from emulated thermostats.
///
/// Requests to an address with no registered thermostat time out.
///
/// # Example
///
/// ```
/// use smartheat_core::{DeviceClient, DeviceAddress};
/// use smartheat_core::mock::{MockThermostat, MockTransport};
///
/// #[tokio::main]
/// async fn main() {
///     let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap();
///     let transport = MockTransport::new();
///     transport.add_device(address, MockThermostat::new(21.0)).await;
///
///     let client = DeviceClient::new(transport);
///     assert_eq!(client.read_temperature(&address).await.unwrap(), 21.0);
/// }
/// ```
#[derive(Debug)]
pub struct MockTransport {
    devices: RwLock<HashMap<DeviceAddress, MockThermostat>>,
    requests: RwLock<Vec<RecordedRequest>>,
    request_count: AtomicU32,
    timeout: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// An empty transport with a 10 second timeout.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            requests: RwLock::new(Vec::new()),
            request_count: AtomicU32::new(0),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set how long a failing request takes to time out.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register (or replace) a thermostat.
    pub async fn add_device(&self, address: DeviceAddress, thermostat: MockThermostat) {
        self.devices.write().await.insert(address, thermostat);
    }

    /// Current state of a thermostat.
    pub async fn device(&self, address: &DeviceAddress) -> Option<MockThermostat> {
        self.devices.read().await.get(address).cloned()
    }

    /// Modify a registered thermostat in place.
    pub async fn update_device(&self, address: &DeviceAddress, update: impl FnOnce(&mut MockThermostat)) {
        if let Some(thermostat) = self.devices.write().await.get_mut(address) {
            update(thermostat);
        }
    }

    /// Every request seen so far, in arrival order.
    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().await.clone()
    }

    /// Requests seen so far for one device, in arrival order.
    pub async fn requests_to(&self, address: &DeviceAddress) -> Vec<RecordedRequest> {
        self.requests
            .read()
            .await
            .iter()
            .filter(|r| r.address == *address)
            .cloned()
            .collect()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    async fn time_out(&self) -> Result<Response, RequestFailure> {
        tokio::time::sleep(self.timeout).await;
        Err(RequestFailure::timeout(self.timeout))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response, RequestFailure> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.requests.write().await.push(RecordedRequest {
            address: *address,
            method,
            path: path.to_string(),
            payload: payload.map(str::to_string),
            at: Instant::now(),
        });

        // Decide the outcome under the lock, but sleep without it.
        let outcome = {
            let mut devices = self.devices.write().await;
            devices.get_mut(address).map(|thermostat| {
                let failure = if thermostat.transient_failures > 0 {
                    thermostat.transient_failures -= 1;
                    Some(MockFailure::Timeout)
                } else {
                    thermostat.failure
                };
                (thermostat.latency, failure)
            })
        };
        let Some((latency, failure)) = outcome else {
            return self.time_out().await;
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(MockFailure::Timeout) => self.time_out().await,
            Some(MockFailure::Transport) => Err(RequestFailure::transport("network unreachable")),
            Some(MockFailure::Code(code)) => Ok(Response::new(code, "")),
            None => {
                let mut devices = self.devices.write().await;
                match devices.get_mut(address) {
                    Some(thermostat) => Ok(thermostat.handle(method, path, payload)),
                    None => Err(RequestFailure::transport("device removed")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> DeviceAddress {
        DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap()
    }

    #[tokio::test]
    async fn test_resources() {
        let transport = MockTransport::new();
        transport
            .add_device(address(), MockThermostat::new(21.0).with_target(19.0))
            .await;

        let response = transport
            .request(&address(), Method::Get, TARGET_PATH, None)
            .await
            .unwrap();
        assert_eq!(response.payload_str(), "19.0");

        let response = transport
            .request(&address(), Method::Put, TARGET_PATH, Some("22.5"))
            .await
            .unwrap();
        assert_eq!(response.code, ResponseCode::CHANGED);
        assert_eq!(transport.device(&address()).await.unwrap().target, 22.5);

        let response = transport
            .request(&address(), Method::Put, TARGET_PATH, Some("warm"))
            .await
            .unwrap();
        assert_eq!(response.code, ResponseCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_device_times_out() {
        let transport = MockTransport::new().with_timeout(Duration::from_secs(4));
        let start = Instant::now();
        let err = transport
            .request(&address(), Method::Get, TEMPERATURE_PATH, None)
            .await
            .unwrap_err();
        assert_eq!(err, RequestFailure::timeout(Duration::from_secs(4)));
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover() {
        let transport = MockTransport::new();
        transport
            .add_device(address(), MockThermostat::new(21.0).with_transient_failures(1))
            .await;

        assert!(transport
            .request(&address(), Method::Get, TEMPERATURE_PATH, None)
            .await
            .is_err());
        assert!(transport
            .request(&address(), Method::Get, TEMPERATURE_PATH, None)
            .await
            .is_ok());
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_request_log() {
        let transport = MockTransport::new();
        transport.add_device(address(), MockThermostat::new(21.0)).await;
        transport
            .request(&address(), Method::Put, MODE_PATH, Some("radio target"))
            .await
            .unwrap();

        let requests = transport.requests_to(&address()).await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, MODE_PATH);
        assert_eq!(requests[0].payload.as_deref(), Some("radio target"));
    }
}
