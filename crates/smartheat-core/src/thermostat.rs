//! Typed thermostat resource operations.
//!
//! | Resource | Methods | Payload |
//! |----------|---------|---------|
//! | `/sensors/temperature` | GET | room temperature, decimal |
//! | `/debug/heartbeat` | GET | `version:…,uptime:…,rssi:…` |
//! | `/set/mode` | GET, PUT | operating mode string |
//! | `/set/target` | GET, PUT | target temperature, decimal |

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use smartheat_types::{DeviceAddress, ParseError};

use crate::client::DeviceClient;
use crate::coap::Method;
use crate::error::{Error, Result};
use crate::retry::{RetryPolicy, retry};
use crate::transport::{Response, Transport};

/// Room temperature sensor.
pub const TEMPERATURE_PATH: &str = "/sensors/temperature";
/// Diagnostic heartbeat.
pub const HEARTBEAT_PATH: &str = "/debug/heartbeat";
/// Operating mode.
pub const MODE_PATH: &str = "/set/mode";
/// Target temperature.
pub const TARGET_PATH: &str = "/set/target";

/// Mode in which the thermostat follows the target set over the radio.
pub const TARGET_MODE: &str = "radio target";

/// Parsed `/debug/heartbeat` payload.
///
/// Only `rssi` is required; the other fields are informational and are
/// `None` when absent or malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    /// Firmware version string.
    pub version: Option<String>,
    /// Seconds since boot.
    pub uptime: Option<u64>,
    /// Signal strength of the last received frame, in dBm.
    pub rssi: f32,
}

impl FromStr for Heartbeat {
    type Err = ParseError;

    /// Parse `version:<v>,uptime:<s>,rssi:<dbm>`. Fields may come in any
    /// order; unknown or malformed fields are ignored.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut version = None;
        let mut uptime = None;
        let mut rssi = None;

        for (key, value) in s.split(',').filter_map(|field| field.split_once(':')) {
            let value = value.trim();
            match key.trim() {
                "version" if !value.is_empty() => version = Some(value.to_string()),
                "uptime" => uptime = value.parse().ok(),
                "rssi" => rssi = Some(value),
                _ => {}
            }
        }

        let rssi = rssi.ok_or_else(|| {
            ParseError::InvalidValue(format!("heartbeat '{}' has no rssi", s.trim()))
        })?;
        let rssi = rssi
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::InvalidValue(format!("heartbeat rssi '{}'", rssi)))?;

        Ok(Self {
            version,
            uptime,
            rssi,
        })
    }
}

impl fmt::Display for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(version) = &self.version {
            write!(f, "version:{},", version)?;
        }
        if let Some(uptime) = self.uptime {
            write!(f, "uptime:{},", uptime)?;
        }
        write!(f, "rssi:{}", self.rssi)
    }
}

/// Format a temperature as a decimal string, always with a fractional part.
pub fn format_temperature(celsius: f32) -> String {
    if celsius.fract() == 0.0 {
        format!("{:.1}", celsius)
    } else {
        celsius.to_string()
    }
}

/// Whether two temperatures are the same setpoint at the thermostat's
/// 0.1 degree resolution.
pub fn same_setpoint(a: f32, b: f32) -> bool {
    (a * 10.0).round() == (b * 10.0).round()
}

fn parse_temperature(path: &str, response: &Response) -> Result<f32> {
    let payload = response.payload_str();
    payload
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::invalid_payload(path, payload.to_string()))
}

impl<T: Transport> DeviceClient<T> {
    /// Request `path` and fail unless the response is in the 2.xx class.
    async fn fetch(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response> {
        let response = self.request(address, method, path, payload).await?;
        if !response.is_success() {
            return Err(Error::Unsuccessful {
                path: path.to_string(),
                class: response.status_class(),
                detail: response.status_detail(),
            });
        }
        Ok(response)
    }

    /// Read the room temperature in degrees Celsius.
    pub async fn read_temperature(&self, address: &DeviceAddress) -> Result<f32> {
        let response = self.fetch(address, Method::Get, TEMPERATURE_PATH, None).await?;
        parse_temperature(TEMPERATURE_PATH, &response)
    }

    /// Read and parse the heartbeat.
    pub async fn read_heartbeat(&self, address: &DeviceAddress) -> Result<Heartbeat> {
        let response = self.fetch(address, Method::Get, HEARTBEAT_PATH, None).await?;
        let payload = response.payload_str();
        payload
            .parse()
            .map_err(|_| Error::invalid_payload(HEARTBEAT_PATH, payload.to_string()))
    }

    /// Read the current operating mode.
    pub async fn read_mode(&self, address: &DeviceAddress) -> Result<String> {
        let response = self.fetch(address, Method::Get, MODE_PATH, None).await?;
        Ok(response.payload_str().trim().to_string())
    }

    /// Set the operating mode.
    pub async fn write_mode(&self, address: &DeviceAddress, mode: &str) -> Result<()> {
        self.fetch(address, Method::Put, MODE_PATH, Some(mode)).await?;
        Ok(())
    }

    /// Read the current target temperature.
    pub async fn read_target(&self, address: &DeviceAddress) -> Result<f32> {
        let response = self.fetch(address, Method::Get, TARGET_PATH, None).await?;
        parse_temperature(TARGET_PATH, &response)
    }

    /// Read the current target temperature, making up to `attempts` reads
    /// with `pacing` between a failed read and the next one.
    pub async fn read_target_paced(
        &self,
        address: &DeviceAddress,
        attempts: u32,
        pacing: Duration,
    ) -> Result<f32> {
        let policy = RetryPolicy::paced(attempts, pacing);
        retry(&policy, "read_target", || self.read_target(address)).await
    }

    /// Set the target temperature.
    pub async fn write_target(&self, address: &DeviceAddress, celsius: f32) -> Result<()> {
        let payload = format_temperature(celsius);
        self.fetch(address, Method::Put, TARGET_PATH, Some(&payload))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::ResponseCode;
    use crate::mock::{MockFailure, MockThermostat, MockTransport};
    use tokio::time::Instant;

    fn address() -> DeviceAddress {
        DeviceAddress::from_mac("2e:ff:ff:00:22:8b").unwrap()
    }

    async fn client_with(thermostat: MockThermostat) -> DeviceClient<MockTransport> {
        let transport = MockTransport::new();
        transport.add_device(address(), thermostat).await;
        DeviceClient::new(transport)
    }

    #[test]
    fn test_heartbeat_parse() {
        let heartbeat: Heartbeat = "version:1.4.2,uptime:86400,rssi:-71".parse().unwrap();
        assert_eq!(heartbeat.version.as_deref(), Some("1.4.2"));
        assert_eq!(heartbeat.uptime, Some(86400));
        assert_eq!(heartbeat.rssi, -71.0);

        let reordered: Heartbeat = "rssi:-60, uptime:5, version:abc".parse().unwrap();
        assert_eq!(reordered.rssi, -60.0);
    }

    #[test]
    fn test_heartbeat_keeps_rssi_when_other_fields_are_bad() {
        let heartbeat: Heartbeat = "uptime:soon,rssi:-68,junk".parse().unwrap();
        assert_eq!(heartbeat.rssi, -68.0);
        assert_eq!(heartbeat.version, None);
        assert_eq!(heartbeat.uptime, None);
        assert_eq!(heartbeat.to_string(), "rssi:-68");
    }

    #[test]
    fn test_heartbeat_parse_errors() {
        assert!("version:1,uptime:2".parse::<Heartbeat>().is_err());
        assert!("version:1,uptime:2,rssi:loud".parse::<Heartbeat>().is_err());
        assert!("garbage".parse::<Heartbeat>().is_err());
    }

    #[test]
    fn test_heartbeat_rejects_non_finite_rssi() {
        for payload in ["rssi:nan", "rssi:NaN", "rssi:inf", "version:1,rssi:-inf"] {
            assert!(payload.parse::<Heartbeat>().is_err(), "{}", payload);
        }
    }

    #[test]
    fn test_format_temperature() {
        assert_eq!(format_temperature(21.0), "21.0");
        assert_eq!(format_temperature(16.5), "16.5");
        assert_eq!(format_temperature(21.25), "21.25");
    }

    #[test]
    fn test_same_setpoint() {
        assert!(same_setpoint(21.04, 21.0));
        assert!(same_setpoint(18.5, 18.5));
        assert!(!same_setpoint(21.1, 21.0));
        assert!(!same_setpoint(16.0, 21.0));
    }

    #[tokio::test]
    async fn test_read_temperature_and_heartbeat() {
        let client = client_with(MockThermostat::new(20.5).with_rssi(-65)).await;
        assert_eq!(client.read_temperature(&address()).await.unwrap(), 20.5);
        assert_eq!(client.read_heartbeat(&address()).await.unwrap().rssi, -65.0);
    }

    #[tokio::test]
    async fn test_mode_roundtrip() {
        let client = client_with(MockThermostat::new(20.0).with_mode("manual")).await;
        assert_eq!(client.read_mode(&address()).await.unwrap(), "manual");
        client.write_mode(&address(), TARGET_MODE).await.unwrap();
        assert_eq!(client.read_mode(&address()).await.unwrap(), TARGET_MODE);
    }

    #[tokio::test]
    async fn test_write_target_sends_decimal_string() {
        let client = client_with(MockThermostat::new(20.0)).await;
        client.write_target(&address(), 21.5).await.unwrap();
        assert_eq!(client.read_target(&address()).await.unwrap(), 21.5);

        let requests = client.transport().requests().await;
        let put = requests.iter().find(|r| r.method == Method::Put).unwrap();
        assert_eq!(put.payload.as_deref(), Some("21.5"));
    }

    #[tokio::test]
    async fn test_unsuccessful_response() {
        let client = client_with(
            MockThermostat::new(20.0).failing(MockFailure::Code(ResponseCode::INTERNAL_SERVER_ERROR)),
        )
        .await;
        let err = client.read_temperature(&address()).await.unwrap_err();
        assert_eq!(
            err,
            Error::Unsuccessful {
                path: TEMPERATURE_PATH.to_string(),
                class: 5,
                detail: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let client = client_with(MockThermostat::new(20.0).with_heartbeat("not a heartbeat")).await;
        let err = client.read_heartbeat(&address()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPayload { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_target_paced_retries() {
        let client = client_with(MockThermostat::new(20.0).with_target(18.0).with_transient_failures(2)).await;

        let start = Instant::now();
        let target = client
            .read_target_paced(&address(), 3, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(target, 18.0);
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(client.transport().request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_target_paced_gives_up() {
        let client = client_with(MockThermostat::new(20.0).failing(MockFailure::Timeout)).await;
        let err = client
            .read_target_paced(&address(), 3, Duration::from_secs(3))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Request(_)));
        assert_eq!(client.transport().request_count(), 3);
    }
}
