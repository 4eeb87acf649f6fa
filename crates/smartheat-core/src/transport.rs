//! Request/response transport to thermostats.
//!
//! [`Transport`] is the seam between the typed thermostat operations and the
//! network: [`UdpTransport`] speaks CoAP over UDP, and
//! [`crate::mock::MockTransport`] answers from in-memory state for tests.

use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use smartheat_types::{DEFAULT_COAP_PORT, DeviceAddress};

use crate::coap::{Message, MessageType, Method, ResponseCode};
use crate::error::RequestFailure;

/// Largest datagram accepted from a device.
const MAX_DATAGRAM_SIZE: usize = 1152;

/// A response exactly as received from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code.
    pub code: ResponseCode,
    /// Raw payload.
    pub payload: Bytes,
}

impl Response {
    /// Create a response.
    pub fn new(code: ResponseCode, payload: impl Into<Bytes>) -> Self {
        Self {
            code,
            payload: payload.into(),
        }
    }

    /// Response code class (`code / 32`).
    pub fn status_class(&self) -> u8 {
        self.code.class()
    }

    /// Response code detail (`code % 32`).
    pub fn status_detail(&self) -> u8 {
        self.code.detail()
    }

    /// Whether the response code is in the 2.xx class.
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// The payload decoded as UTF-8, with invalid sequences replaced.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A way of exchanging one request/response pair with a device.
///
/// Implementations never return an unsuccessful response code as an error:
/// any response that arrives is returned as-is.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `method path` with an optional text payload and wait for the
    /// response, bounded by the transport's timeout.
    async fn request(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response, RequestFailure>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn request(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response, RequestFailure> {
        (**self).request(address, method, path, payload).await
    }
}

/// Configuration for [`UdpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Destination UDP port.
    pub port: u16,
    /// Upper bound for a whole exchange, retransmissions included.
    pub timeout: Duration,
    /// Wait before the first retransmission; doubled after each one.
    pub ack_timeout: Duration,
    /// Maximum number of retransmissions.
    pub max_retransmit: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_COAP_PORT,
            timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
            max_retransmit: 4,
        }
    }
}

impl TransportConfig {
    /// Set the destination port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the overall request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the initial retransmission wait.
    #[must_use]
    pub fn ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    /// Set the maximum number of retransmissions.
    #[must_use]
    pub fn max_retransmit(mut self, max_retransmit: u32) -> Self {
        self.max_retransmit = max_retransmit;
        self
    }
}

/// CoAP over UDP.
///
/// Every request uses a fresh ephemeral socket connected to the device, so
/// concurrent requests to different devices never see each other's traffic.
#[derive(Debug)]
pub struct UdpTransport {
    config: TransportConfig,
    next_message_id: AtomicU16,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl UdpTransport {
    /// Create a transport with the given configuration.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            next_message_id: AtomicU16::new(rand::random()),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self, target: SocketAddr) -> Result<UdpSocket, RequestFailure> {
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(socket)
    }

    /// Send `request` until it is answered, retransmitting with exponential
    /// backoff while no acknowledgement has been seen.
    async fn exchange(&self, socket: &UdpSocket, request: &Message) -> Result<Response, RequestFailure> {
        let datagram = request.encode()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut wait = self.config.ack_timeout;
        let mut transmissions = 0u32;
        let mut acknowledged = false;

        loop {
            if !acknowledged && transmissions <= self.config.max_retransmit {
                if transmissions > 0 {
                    debug!(
                        "Retransmitting message {} ({}/{})",
                        request.message_id, transmissions, self.config.max_retransmit
                    );
                }
                socket.send(&datagram).await?;
                transmissions += 1;
            }

            let deadline = Instant::now() + wait;
            while let Ok(received) = timeout_at(deadline, socket.recv(&mut buf)).await {
                let len = received?;
                let message = match Message::decode(&buf[..len]) {
                    Ok(message) => message,
                    Err(err) => {
                        debug!("Ignoring malformed datagram: {}", err);
                        continue;
                    }
                };

                match Self::match_reply(request, &message) {
                    Reply::Unrelated => {}
                    Reply::Acknowledged => acknowledged = true,
                    Reply::Reset => return Err(RequestFailure::transport("request reset by device")),
                    Reply::Response { confirm } => {
                        if confirm {
                            socket
                                .send(&Message::empty_ack(message.message_id).encode()?)
                                .await?;
                        }
                        return Ok(Response::new(message.response_code(), message.payload));
                    }
                }
            }

            wait = wait.saturating_mul(2);
        }
    }

    fn match_reply(request: &Message, reply: &Message) -> Reply {
        let same_id = reply.message_id == request.message_id;
        let same_token = reply.token == request.token;
        let empty = reply.response_code().is_empty();

        match reply.kind {
            MessageType::Acknowledgement if same_id && empty => Reply::Acknowledged,
            MessageType::Acknowledgement if same_id && same_token => Reply::Response { confirm: false },
            MessageType::Reset if same_id => Reply::Reset,
            MessageType::Confirmable if same_token && !empty => Reply::Response { confirm: true },
            MessageType::NonConfirmable if same_token && !empty => Reply::Response { confirm: false },
            _ => Reply::Unrelated,
        }
    }
}

/// How a received message relates to the outstanding request.
enum Reply {
    Unrelated,
    Acknowledged,
    Reset,
    Response { confirm: bool },
}

#[async_trait]
impl Transport for UdpTransport {
    async fn request(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response, RequestFailure> {
        let target = address.socket_addr(self.config.port);
        let token: [u8; 4] = rand::random();
        let request = Message::request(method, self.next_message_id(), &token, path, payload);

        let exchange = async {
            let socket = self.connect(target).await?;
            self.exchange(&socket, &request).await
        };

        match timeout(self.config.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(RequestFailure::timeout(self.config.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        Message::request(Method::Get, 10, &[1, 2, 3, 4], "/sensors/temperature", None)
    }

    #[test]
    fn test_response_accessors() {
        let response = Response::new(ResponseCode::CONTENT, "21.5");
        assert_eq!(response.status_class(), 2);
        assert_eq!(response.status_detail(), 5);
        assert!(response.is_success());
        assert_eq!(response.payload_str(), "21.5");
    }

    #[test]
    fn test_match_piggybacked() {
        let request = request();
        let reply = Message::response_to(&request, ResponseCode::CONTENT, "20.0", 0);
        assert!(matches!(
            UdpTransport::match_reply(&request, &reply),
            Reply::Response { confirm: false }
        ));
    }

    #[test]
    fn test_match_separate_response() {
        let request = request();
        let ack = Message::empty_ack(request.message_id);
        assert!(matches!(UdpTransport::match_reply(&request, &ack), Reply::Acknowledged));

        let mut separate = Message::response_to(&request, ResponseCode::CONTENT, "20.0", 99);
        separate.kind = MessageType::Confirmable;
        separate.message_id = 99;
        assert!(matches!(
            UdpTransport::match_reply(&request, &separate),
            Reply::Response { confirm: true }
        ));
    }

    #[test]
    fn test_match_ignores_foreign_messages() {
        let request = request();
        let mut other = Message::response_to(&request, ResponseCode::CONTENT, "20.0", 0);
        other.message_id = 11;
        other.token = Bytes::from_static(&[9, 9]);
        assert!(matches!(UdpTransport::match_reply(&request, &other), Reply::Unrelated));

        let mut reset = Message::empty_ack(request.message_id);
        reset.kind = MessageType::Reset;
        assert!(matches!(UdpTransport::match_reply(&request, &reset), Reply::Reset));
    }

    #[test]
    fn test_config_builder() {
        let config = TransportConfig::default()
            .port(5684)
            .timeout(Duration::from_secs(3))
            .max_retransmit(1);
        assert_eq!(config.port, 5684);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.max_retransmit, 1);
        assert_eq!(config.ack_timeout, Duration::from_secs(2));
    }
}
