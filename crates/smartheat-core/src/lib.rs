//! CoAP device client for smart heating thermostats.
//!
//! This crate talks to low-power thermostats that sit behind a 6LoWPAN
//! border router. Each thermostat is addressed by an IPv6 address derived
//! from its MAC (see [`DeviceAddress`]) and exposes a handful of CoAP
//! resources.
//!
//! # Features
//!
//! - **CoAP codec**: confirmable requests, piggybacked and separate responses
//! - **UDP transport**: per-request timeout with retransmission backoff
//! - **Request logging**: every request/response pair is traced
//! - **Typed operations**: temperature, heartbeat, operating mode, target
//! - **Mock transport**: in-memory thermostats with failure injection
//!
//! # Quick Start
//!
//! ```no_run
//! use smartheat_core::{DeviceAddress, DeviceClient, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = DeviceClient::new(UdpTransport::default());
//!     let address = DeviceAddress::from_mac("2e:ff:ff:00:22:8b")?;
//!
//!     let temperature = client.read_temperature(&address).await?;
//!     let heartbeat = client.read_heartbeat(&address).await?;
//!     println!("{:.1} °C, rssi {} dBm", temperature, heartbeat.rssi);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod coap;
pub mod error;
pub mod mock;
pub mod retry;
pub mod thermostat;
pub mod transport;

pub use smartheat_types as types;

pub use client::DeviceClient;
pub use coap::{CodecError, Message, Method, ResponseCode};
pub use error::{Error, RequestFailure, Result};
pub use mock::{MockFailure, MockThermostat, MockTransport};
pub use retry::{RetryPolicy, retry};
pub use thermostat::{
    HEARTBEAT_PATH, Heartbeat, MODE_PATH, TARGET_MODE, TARGET_PATH, TEMPERATURE_PATH,
    format_temperature, same_setpoint,
};
pub use transport::{Response, Transport, TransportConfig, UdpTransport};

pub use smartheat_types::{DeviceAddress, LinkPrefix};
