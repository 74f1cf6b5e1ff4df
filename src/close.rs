//! # Close
//!
//! Status codes and payloads of the closing handshake, as defined in
//! [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
//!
//! A close frame payload is either empty, or a big-endian `u16` status code followed by an
//! optional UTF-8 reason. Because control frames are limited to 125 bytes, the reason can be
//! at most [`MAX_REASON_LEN`] bytes long.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{FrameError, MessageError, WebSocketError};

/// Largest close reason that fits in a control frame next to the status code.
pub const MAX_REASON_LEN: usize = 123;

/// Status code carried by a close frame.
///
/// Codes 1004, 1005, 1006 and 1015 are reserved: they describe how a connection ended
/// locally and never appear on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001, an endpoint is going away (server shutdown, page navigation).
    Away,
    /// 1002, an endpoint detected a protocol error.
    Protocol,
    /// 1003, an endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005, reserved: the peer's close frame carried no status code.
    Status,
    /// 1006, reserved: the connection dropped without a close frame.
    Abnormal,
    /// 1007, a message contained data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    /// 1008, an endpoint received a message that violates its policy.
    Policy,
    /// 1009, a message was too big to process.
    Size,
    /// 1010, the client expected the server to negotiate an extension.
    Extension,
    /// 1011, the server hit an unexpected condition.
    Error,
    /// 1012, the service is restarting.
    Restart,
    /// 1013, the service is overloaded, try again later.
    Again,
    /// 1015, reserved: the TLS handshake failed.
    Tls,
    /// 1004 and 1016-2999, reserved for future revisions of the protocol.
    Reserved(u16),
    /// 3000-3999, registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999, available for private use by applications.
    Library(u16),
    /// Anything outside of the ranges above.
    Bad(u16),
}

impl CloseCode {
    /// Returns `true` if an endpoint may send this code in a close frame.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            CloseCode::Status
                | CloseCode::Abnormal
                | CloseCode::Tls
                | CloseCode::Reserved(_)
                | CloseCode::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1005 => CloseCode::Status,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            1015 => CloseCode::Tls,
            1004 | 1014 | 1016..=2999 => CloseCode::Reserved(code),
            3000..=3999 => CloseCode::Iana(code),
            4000..=4999 => CloseCode::Library(code),
            _ => CloseCode::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

/// How a connection ended, reported once through [`Handler::on_close`](crate::Handler::on_close).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// The status code of the first close frame of the exchange, or
    /// [`CloseCode::Abnormal`] when no close frame was exchanged.
    pub code: CloseCode,
    /// The reason that accompanied `code`, possibly empty.
    pub reason: String,
    /// `true` when both close frames were exchanged before the transport went away.
    pub was_clean: bool,
}

/// Parses the payload of a received close frame.
///
/// Returns `None` as the code when the payload is empty.
pub fn parse_payload(payload: &[u8]) -> Result<(Option<CloseCode>, String), WebSocketError> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(FrameError::InvalidCloseFrame.into()),
        _ => {
            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_allowed() {
                return Err(FrameError::InvalidCloseFrame.into());
            }

            let reason =
                std::str::from_utf8(&payload[2..]).map_err(|_| MessageError::InvalidUtf8)?;
            Ok((Some(code), reason.to_owned()))
        }
    }
}

/// Builds the payload of a close frame.
pub fn payload(code: CloseCode, reason: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + reason.len());
    buf.put_u16(code.into());
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

/// Checks that an application supplied code and reason can go on the wire.
pub fn validate(code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
    if !code.is_allowed() {
        return Err(WebSocketError::InvalidCloseCode(code.into()));
    }
    if reason.len() > MAX_REASON_LEN {
        return Err(WebSocketError::CloseReasonTooLong);
    }
    Ok(())
}

/// Cuts `reason` down to [`MAX_REASON_LEN`] bytes on a character boundary.
pub(crate) fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
