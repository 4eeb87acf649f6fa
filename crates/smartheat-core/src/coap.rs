//! CoAP message codec (RFC 7252).
//!
//! Only the subset the thermostats speak is implemented: confirmable GET/PUT
//! requests addressed with Uri-Path options, text payloads, and the response
//! codes and message types needed to match piggybacked and separate
//! responses. Unknown options are decoded and kept but never interpreted.
//!
//! # Wire format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```

use core::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol version carried in every message.
pub const VERSION: u8 = 1;

/// Option number of Uri-Path.
pub const OPTION_URI_PATH: u16 = 11;

/// Marker byte separating options from the payload.
const PAYLOAD_MARKER: u8 = 0xFF;

/// Longest token allowed by the protocol.
const MAX_TOKEN_LEN: usize = 8;

/// Largest value an extended option delta or length can carry.
const MAX_EXTENDED: usize = 269 + u16::MAX as usize;

/// Errors raised while encoding or decoding a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The datagram ended before the structure it announced.
    #[error("Message truncated")]
    Truncated,

    /// The version bits are not 1.
    #[error("Unsupported CoAP version {0}")]
    UnsupportedVersion(u8),

    /// Token length above 8.
    #[error("Invalid token length {0}")]
    InvalidTokenLength(usize),

    /// Reserved nibble value or payload marker with no payload.
    #[error("Malformed option: {0}")]
    MalformedOption(&'static str),

    /// An option value too long to encode.
    #[error("Option {number} too long ({len} bytes)")]
    OptionTooLong {
        /// Option number.
        number: u16,
        /// Value length.
        len: usize,
    },
}

/// Message type (the `T` bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Requires an acknowledgement.
    Confirmable = 0,
    /// Does not require an acknowledgement.
    NonConfirmable = 1,
    /// Acknowledges a confirmable message, possibly carrying a response.
    Acknowledgement = 2,
    /// Rejects a message the receiver cannot process.
    Reset = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read a resource.
    Get,
    /// Replace a resource.
    Put,
}

impl Method {
    /// The request code (class 0).
    pub fn code(&self) -> u8 {
        match self {
            Method::Get => 0x01,
            Method::Put => 0x03,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Put => write!(f, "PUT"),
        }
    }
}

/// A response code split into class and detail (`class = code / 32`,
/// `detail = code % 32`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    /// 2.04 Changed.
    pub const CHANGED: ResponseCode = ResponseCode::new(2, 4);
    /// 2.05 Content.
    pub const CONTENT: ResponseCode = ResponseCode::new(2, 5);
    /// 4.00 Bad Request.
    pub const BAD_REQUEST: ResponseCode = ResponseCode::new(4, 0);
    /// 4.04 Not Found.
    pub const NOT_FOUND: ResponseCode = ResponseCode::new(4, 4);
    /// 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode::new(5, 0);

    /// Compose a code from its class and detail.
    pub const fn new(class: u8, detail: u8) -> Self {
        Self((class << 5) | (detail & 0x1f))
    }

    /// The code class.
    pub fn class(&self) -> u8 {
        self.0 / 32
    }

    /// The code detail.
    pub fn detail(&self) -> u8 {
        self.0 % 32
    }

    /// Whether the code is in the success class (`2 <= class < 3`).
    pub fn is_success(&self) -> bool {
        (2..3).contains(&self.class())
    }

    /// Whether this is the empty code 0.00 used by bare ACK and RST.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// One option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number.
    pub number: u16,
    /// Raw value.
    pub value: Bytes,
}

/// A CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageType,
    /// Method or response code.
    pub code: u8,
    /// Message ID, used to match ACK/RST with CON.
    pub message_id: u16,
    /// Token, used to match responses with requests.
    pub token: Bytes,
    /// Options, in the order they were added or decoded.
    pub options: Vec<CoapOption>,
    /// Payload (empty when absent).
    pub payload: Bytes,
}

impl Message {
    /// Build a confirmable request for `path`.
    ///
    /// `path` is split on `/` into Uri-Path options; empty segments are
    /// skipped.
    pub fn request(
        method: Method,
        message_id: u16,
        token: &[u8],
        path: &str,
        payload: Option<&str>,
    ) -> Self {
        let options = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| CoapOption {
                number: OPTION_URI_PATH,
                value: Bytes::copy_from_slice(segment.as_bytes()),
            })
            .collect();

        Self {
            kind: MessageType::Confirmable,
            code: method.code(),
            message_id,
            token: Bytes::copy_from_slice(token),
            options,
            payload: payload
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .unwrap_or_default(),
        }
    }

    /// Build a response to `request` carrying `code` and `payload`.
    ///
    /// A confirmable request gets a piggybacked ACK; anything else gets a
    /// non-confirmable response with a fresh `message_id`.
    pub fn response_to(request: &Message, code: ResponseCode, payload: &str, message_id: u16) -> Self {
        let (kind, message_id) = match request.kind {
            MessageType::Confirmable => (MessageType::Acknowledgement, request.message_id),
            _ => (MessageType::NonConfirmable, message_id),
        };
        Self {
            kind,
            code: code.0,
            message_id,
            token: request.token.clone(),
            options: Vec::new(),
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    /// An empty acknowledgement for `message_id`.
    pub fn empty_ack(message_id: u16) -> Self {
        Self {
            kind: MessageType::Acknowledgement,
            code: 0,
            message_id,
            token: Bytes::new(),
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// The response code of this message.
    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    /// The request path reassembled from Uri-Path options.
    pub fn uri_path(&self) -> String {
        let segments: Vec<String> = self
            .options
            .iter()
            .filter(|opt| opt.number == OPTION_URI_PATH)
            .map(|opt| String::from_utf8_lossy(&opt.value).into_owned())
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// Serialize the message.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(self.token.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        buf.put_u8((VERSION << 6) | ((self.kind as u8) << 4) | self.token.len() as u8);
        buf.put_u8(self.code);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        // Stable sort keeps repeated options (path segments) in order.
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|opt| opt.number);

        let mut previous = 0u16;
        for opt in options {
            if opt.value.len() > MAX_EXTENDED {
                return Err(CodecError::OptionTooLong {
                    number: opt.number,
                    len: opt.value.len(),
                });
            }
            let delta = usize::from(opt.number - previous);
            let (delta_nibble, delta_ext) = split_extended(delta);
            let (len_nibble, len_ext) = split_extended(opt.value.len());
            buf.put_u8((delta_nibble << 4) | len_nibble);
            delta_ext.write(&mut buf);
            len_ext.write(&mut buf);
            buf.put_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    /// Parse a datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        let mut buf = datagram;
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated);
        }

        let first = buf.get_u8();
        let version = first >> 6;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = MessageType::from_bits(first >> 4);
        let token_len = usize::from(first & 0x0f);
        if token_len > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(token_len));
        }
        let code = buf.get_u8();
        let message_id = buf.get_u16();

        if buf.remaining() < token_len {
            return Err(CodecError::Truncated);
        }
        let token = buf.copy_to_bytes(token_len);

        let mut options = Vec::new();
        let mut payload = Bytes::new();
        let mut number = 0usize;
        while buf.has_remaining() {
            let header = buf.get_u8();
            if header == PAYLOAD_MARKER {
                if !buf.has_remaining() {
                    return Err(CodecError::MalformedOption("payload marker without payload"));
                }
                payload = buf.copy_to_bytes(buf.remaining());
                break;
            }

            let delta = read_extended(header >> 4, &mut buf)?;
            let len = read_extended(header & 0x0f, &mut buf)?;
            number += delta;
            let option_number = u16::try_from(number)
                .map_err(|_| CodecError::MalformedOption("option number overflow"))?;
            if buf.remaining() < len {
                return Err(CodecError::Truncated);
            }
            options.push(CoapOption {
                number: option_number,
                value: buf.copy_to_bytes(len),
            });
        }

        Ok(Self {
            kind,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// Extended bytes following an option header nibble.
enum Extended {
    None,
    One(u8),
    Two(u16),
}

impl Extended {
    fn write(&self, buf: &mut BytesMut) {
        match self {
            Extended::None => {}
            Extended::One(v) => buf.put_u8(*v),
            Extended::Two(v) => buf.put_u16(*v),
        }
    }
}

/// Split a delta or length into its header nibble and extended bytes.
///
/// Callers guarantee `value <= MAX_EXTENDED`.
fn split_extended(value: usize) -> (u8, Extended) {
    if value < 13 {
        (value as u8, Extended::None)
    } else if value < 269 {
        (13, Extended::One((value - 13) as u8))
    } else {
        (14, Extended::Two((value - 269) as u16))
    }
}

fn read_extended(nibble: u8, buf: &mut &[u8]) -> Result<usize, CodecError> {
    match nibble {
        0..=12 => Ok(usize::from(nibble)),
        13 => {
            if buf.remaining() < 1 {
                return Err(CodecError::Truncated);
            }
            Ok(usize::from(buf.get_u8()) + 13)
        }
        14 => {
            if buf.remaining() < 2 {
                return Err(CodecError::Truncated);
            }
            Ok(usize::from(buf.get_u16()) + 269)
        }
        _ => Err(CodecError::MalformedOption("reserved nibble 15")),
    }
}
