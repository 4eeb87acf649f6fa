//! Error types for smartheat-core.
//!
//! Device communication distinguishes two layers of failure:
//!
//! - [`RequestFailure`]: the exchange itself did not complete (no response
//!   within the timeout, or a socket/codec error). Returned by
//!   [`crate::Transport`] implementations and by [`crate::DeviceClient::request`].
//! - [`Error`]: everything a typed thermostat operation can fail with, which
//!   adds a valid exchange carrying an unsuccessful response code, and a
//!   successful response whose payload cannot be interpreted.
//!
//! | Error | Retry? | Notes |
//! |-------|--------|-------|
//! | [`RequestFailure::Timeout`] | Yes | Constrained devices sleep and drop packets |
//! | [`RequestFailure::Transport`] | Yes | Border router or route may be flapping |
//! | [`Error::Unsuccessful`] | Yes | The device answered 4.xx/5.xx |
//! | [`Error::InvalidPayload`] | No | Firmware mismatch |
//! | [`Error::InvalidAddress`] | No | Fix the configured MAC |

use std::time::Duration;

use thiserror::Error;

use smartheat_types::AddressError;

use crate::coap::CodecError;

/// Failure of a single request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RequestFailure {
    /// No matching response arrived within the request timeout.
    #[error("Request timed out after {duration:?}")]
    Timeout {
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// Socket, routing or protocol failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RequestFailure {
    /// Create a timeout failure.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a transport failure from any displayable cause.
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }

    /// Whether this failure is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for RequestFailure {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err)
    }
}

impl From<CodecError> for RequestFailure {
    fn from(err: CodecError) -> Self {
        Self::transport(err)
    }
}

/// Errors that can occur when operating a thermostat.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The thermostat's MAC address cannot be mapped to a device address.
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    /// The request/response exchange did not complete.
    #[error(transparent)]
    Request(#[from] RequestFailure),

    /// The device answered with a non-success response code.
    #[error("Unsuccessful response {class}.{detail:02} for {path}")]
    Unsuccessful {
        /// Resource path of the request.
        path: String,
        /// Response code class.
        class: u8,
        /// Response code detail.
        detail: u8,
    },

    /// The device answered successfully but the payload could not be parsed.
    #[error("Invalid payload from {path}: {payload:?}")]
    InvalidPayload {
        /// Resource path of the request.
        path: String,
        /// The payload as received.
        payload: String,
    },
}

impl Error {
    /// Create an invalid payload error.
    pub fn invalid_payload(path: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::InvalidPayload {
            path: path.into(),
            payload: payload.into(),
        }
    }

    /// Whether the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Request(_) => true,
            Error::Unsuccessful { .. } => true,
            Error::InvalidPayload { .. } => false,
            Error::InvalidAddress(_) => false,
        }
    }
}

/// Result type alias using smartheat-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
