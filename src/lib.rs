//! # wsclient
//! A client implementation of the WebSocket protocol (RFC 6455) built around a sans-io
//! protocol engine and a callback-driven application API.
//!
//! The crate is split in two layers:
//!
//! - The **protocol engine** ([`frame`], [`codec`], [`handshake`], [`assembler`] and
//!   [`connection`]) is pure: it never touches a socket. It turns bytes into frames, frames
//!   into messages, and application calls into bytes waiting to be written. All of the
//!   protocol rules live here: masking, control-frame constraints, fragmentation,
//!   UTF-8 validation, the close handshake and close-code mapping.
//!
//! - The **runtime layer** ([`WebSocket`], [`Options`], [`dispatch`], [`trust`]) drives the
//!   engine from a tokio task over TCP, TLS or any caller-supplied duplex stream, and
//!   delivers events to a [`Handler`] on a serial [`Executor`].
//!
//! # Features
//! - `logging`: Enables debug logging for connection negotiation and frame processing using
//!   the `log` crate.
//! - `json`: Enables [`WebSocket::send_json`].
//!
//! # Client Example
//! ```no_run
//! use wsclient::{CloseInfo, Handler, Message, WebSocket};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_message(&mut self, message: Message) {
//!         println!("{message:?}");
//!     }
//!
//!     fn on_close(&mut self, info: CloseInfo) {
//!         println!("closed with {:?}", info.code);
//!     }
//! }
//!
//! # fn main() -> wsclient::Result<()> {
//! let ws = WebSocket::new("wss://echo.websocket.org".parse()?, Printer);
//! // sends are accepted once `on_open` has been called
//! ws.open()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Memory Safety
//! - Maximum frame payload and message sizes are configurable (1 MiB and 2 MiB by default)
//! - Text messages are validated as UTF-8 before they reach the application
//! - Decoder and reassembly buffers never escape the connection that owns them

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod assembler;
pub mod close;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod handshake;
mod mask;
mod native;
mod options;
pub mod trust;

use std::io;

use thiserror::Error;

pub use assembler::Message;
pub use close::{CloseCode, CloseInfo};
pub use connection::{Connection, Event, ReadyState};
pub use dispatch::{Executor, Handler, Immediate, SerialQueue};
pub use frame::{Frame, OpCode};
pub use native::*;
pub use options::{Options, CLOSE_TIMEOUT, MAX_MESSAGE_SIZE, MAX_PAYLOAD_READ};
pub use trust::{PinnedCertificates, TrustGate};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Reasons the opening handshake can fail.
///
/// Every variant is fatal: the connection never reaches [`ReadyState::Open`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The server answered with something other than `101 Switching Protocols`.
    #[error("Unexpected HTTP status: {0}")]
    BadStatus(u16),

    /// The `Upgrade: websocket` or `Connection: Upgrade` header is missing.
    #[error("Missing upgrade headers")]
    MissingUpgradeHeader,

    /// `Sec-WebSocket-Accept` is absent or does not match the key we sent.
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,

    /// The server selected a subprotocol the client never offered.
    #[error("Server selected an unrequested subprotocol: {0}")]
    UnrequestedProtocol(String),

    /// The server enabled an extension the client never offered.
    #[error("Server enabled an unrequested extension: {0}")]
    UnrequestedExtension(String),

    /// The response head could not be parsed as HTTP/1.1.
    #[error("Malformed handshake response: {0}")]
    Malformed(String),

    /// The response head did not terminate within the allowed size.
    #[error("Handshake response too large")]
    ResponseTooLarge,
}

/// Protocol violations detected while decoding or reassembling frames.
///
/// Each one makes the client close the connection with status code 1002, except
/// [`FrameError::PayloadTooLarge`] which maps to 1009.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A 64-bit payload length with the most significant bit set.
    #[error("Invalid payload length")]
    InvalidLength,

    /// A server frame carrying a masking key.
    #[error("Server frames must not be masked")]
    UnexpectedMask,

    /// A client frame without a masking key (server role only).
    #[error("Client frames must be masked")]
    MissingMask,

    /// A fragmented control frame, or one with a payload over 125 bytes.
    #[error("Invalid control frame")]
    InvalidControlFrame,

    /// An opcode that RFC 6455 reserves.
    #[error("Unknown opcode (byte={0})")]
    UnknownOpcode(u8),

    /// A frame or message over the configured size limit.
    #[error("Payload too large")]
    PayloadTooLarge,

    /// RSV1-3 bits set without a negotiated extension.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A new data frame while a fragmented message is still in progress.
    #[error("Unexpected opcode during fragmented message")]
    UnexpectedOpcode,

    /// A continuation frame with no fragmented message in progress.
    #[error("Unexpected continuation frame")]
    UnexpectedContinuation,

    /// A close frame with a one byte payload or a status code that may not appear on the wire.
    #[error("Invalid close frame")]
    InvalidCloseFrame,
}

/// Errors in the content of a completed message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// A text message or close reason that is not valid UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUtf8,
}

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into a few groups:
///
/// - Negotiation failures ([`WebSocketError::Handshake`])
/// - Protocol violations ([`WebSocketError::Frame`], [`WebSocketError::Message`])
/// - Transport failures ([`WebSocketError::IoError`])
/// - API misuse (calling `open` twice, sending before the connection is open, ...)
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The opening handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer violated the framing rules.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The peer sent an invalid message.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Returned when attempting to send on a connection that is closing or closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// Returned when attempting to send before the opening handshake completed.
    #[error("Connection is not open")]
    NotOpen,

    /// A WebSocket instance can only be opened once.
    #[error("WebSocket was already opened")]
    AlreadyOpened,

    /// The close status code may not be sent by an endpoint.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Close reasons are limited to 123 bytes of UTF-8.
    #[error("Close reason is longer than 123 bytes")]
    CloseReasonTooLong,

    /// Returned when attempting to establish a WebSocket connection with an invalid URL scheme.
    /// Only "ws://", "wss://", "http://" and "https://" schemes are valid.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// The URL has no host to connect to.
    #[error("URL has no host")]
    MissingHost,

    /// The trust gate refused the peer's certificate chain.
    #[error("Peer certificate chain rejected")]
    CertificateRejected,

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// The host name is not valid for TLS server name indication.
    #[error(transparent)]
    InvalidDnsName(#[from] tokio_rustls::rustls::pki_types::InvalidDnsNameError),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or network timeouts.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// The status code the client sends when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::Frame(FrameError::PayloadTooLarge) => CloseCode::Size,
            WebSocketError::Frame(_) => CloseCode::Protocol,
            WebSocketError::Message(MessageError::InvalidUtf8) => CloseCode::Invalid,
            _ => CloseCode::Error,
        }
    }
}
