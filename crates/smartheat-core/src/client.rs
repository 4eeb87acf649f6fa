//! Logging device client.

use tracing::{error, info};

use smartheat_types::DeviceAddress;

use crate::coap::Method;
use crate::error::RequestFailure;
use crate::transport::{Response, Transport};

/// Client for thermostat requests over any [`Transport`].
///
/// Every exchange is logged: the request line at `info`, then the response
/// at `info` when it is successful and at `error` otherwise. Logging never
/// changes what is returned.
#[derive(Debug, Clone)]
pub struct DeviceClient<T> {
    transport: T,
}

impl<T: Transport> DeviceClient<T> {
    /// Create a client over `transport`.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Issue one request and return the response exactly as received.
    ///
    /// Timeouts and transport errors are returned as [`RequestFailure`]; an
    /// unsuccessful response code is still `Ok`.
    pub async fn request(
        &self,
        address: &DeviceAddress,
        method: Method,
        path: &str,
        payload: Option<&str>,
    ) -> Result<Response, RequestFailure> {
        let line = match payload {
            Some(payload) => format!("{} {}{} \"{}\"", method, address.uri(), path, payload),
            None => format!("{} {}{}", method, address.uri(), path),
        };
        info!("{}", line);

        let result = self.transport.request(address, method, path, payload).await;

        match &result {
            Ok(response) if response.is_success() => {
                info!("{}: {}, {:?}", line, response.code, response.payload_str());
            }
            Ok(response) => {
                error!("{}: {}, {:?}", line, response.code, response.payload_str());
            }
            Err(RequestFailure::Timeout { duration }) => {
                error!("Request timed out after {:?}: {}", duration, line);
            }
            Err(err) => {
                error!("Request failed: {}: {}", line, err);
            }
        }

        result
    }
}
