//! # Handshake
//!
//! The client side of the opening handshake ([RFC 6455 Section 4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-4.1)).
//!
//! [`ClientHandshake`] builds the HTTP/1.1 upgrade request once and then validates the server's
//! response as its bytes arrive. Bytes that follow the response head belong to the frame layer
//! and are handed back in [`NegotiatedHandshake::leftover`].
use base64::prelude::*;
use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use url::{Position, Url};

use crate::{HandshakeError, Result, WebSocketError};

/// The GUID appended to the key before hashing, from RFC 6455.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response heads larger than this are refused.
pub const MAX_RESPONSE_HEAD: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Headers the handshake owns. Caller supplied values for these are ignored.
const PROTECTED_HEADERS: [HeaderName; 7] = [
    header::HOST,
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_KEY,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_PROTOCOL,
    header::SEC_WEBSOCKET_EXTENSIONS,
];

/// Computes the `Sec-WebSocket-Accept` value for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Returns `true` for the schemes a client can connect to.
pub(crate) fn is_supported_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss" | "http" | "https")
}

/// Returns `true` if `url` is reached over TLS.
pub(crate) fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "wss" | "https")
}

/// Serializes the upgrade request for `url`.
///
/// `protocols` are offered in order. `headers` are appended after the handshake's own headers;
/// an `Origin` there replaces the one derived from the URL.
pub fn build_request(
    url: &Url,
    key: &str,
    protocols: &[String],
    headers: &HeaderMap,
) -> Result<BytesMut> {
    let host = url.host_str().ok_or(WebSocketError::MissingHost)?;
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let target = &url[Position::BeforePath..Position::AfterQuery];

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"GET ");
    buf.put_slice(if target.is_empty() { "/" } else { target }.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    put_header(&mut buf, "Host", authority.as_bytes());
    put_header(&mut buf, "Upgrade", b"websocket");
    put_header(&mut buf, "Connection", b"Upgrade");
    put_header(&mut buf, "Sec-WebSocket-Key", key.as_bytes());
    put_header(&mut buf, "Sec-WebSocket-Version", b"13");

    if !protocols.is_empty() {
        put_header(&mut buf, "Sec-WebSocket-Protocol", protocols.join(", ").as_bytes());
    }

    if !headers.contains_key(header::ORIGIN) {
        let origin_scheme = if is_secure(url) { "https" } else { "http" };
        put_header(
            &mut buf,
            "Origin",
            format!("{origin_scheme}://{authority}").as_bytes(),
        );
    }

    for (name, value) in headers {
        if PROTECTED_HEADERS.contains(name) {
            continue;
        }
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }

    buf.put_slice(b"\r\n");
    Ok(buf)
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

/// The outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedHandshake {
    /// The subprotocol the server selected, if any.
    pub protocol: Option<String>,
    /// Bytes received after the response head. They are the start of the frame stream.
    pub leftover: Bytes,
}

/// State of an outstanding opening handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    key: String,
    expected_accept: String,
    protocols: Vec<String>,
    request: Bytes,
}

impl ClientHandshake {
    /// Prepares a handshake for `url` with a fresh key.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidHttpScheme`] unless the scheme is `ws`, `wss`, `http` or `https`.
    /// - [`WebSocketError::MissingHost`] if the URL has no host.
    pub fn new(url: &Url, protocols: Vec<String>, headers: &HeaderMap) -> Result<Self> {
        Self::with_key(url, generate_key(), protocols, headers)
    }

    pub(crate) fn with_key(
        url: &Url,
        key: String,
        protocols: Vec<String>,
        headers: &HeaderMap,
    ) -> Result<Self> {
        if !is_supported_scheme(url) {
            return Err(WebSocketError::InvalidHttpScheme);
        }

        let request = build_request(url, &key, &protocols, headers)?.freeze();
        Ok(Self {
            expected_accept: accept_key(&key),
            key,
            protocols,
            request,
        })
    }

    /// The `Sec-WebSocket-Key` sent with the request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The serialized upgrade request.
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// The subprotocols offered to the server.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    /// Validates the response accumulated in `buf`.
    ///
    /// Returns `Ok(None)` until the whole response head has arrived. On success the head is
    /// consumed from `buf` and everything after it is returned as leftover.
    pub fn parse_response(
        &self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<NegotiatedHandshake>, HandshakeError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut raw_headers);

        let head_len = match response.parse(&buf[..]) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) if buf.len() > MAX_RESPONSE_HEAD => {
                return Err(HandshakeError::ResponseTooLarge)
            }
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(err) => return Err(HandshakeError::Malformed(err.to_string())),
        };
        if head_len > MAX_RESPONSE_HEAD {
            return Err(HandshakeError::ResponseTooLarge);
        }

        let status = response.code.unwrap_or_default();
        let mut headers = HeaderMap::with_capacity(response.headers.len());
        for raw in response.headers.iter() {
            let name = HeaderName::from_bytes(raw.name.as_bytes())
                .map_err(|err| HandshakeError::Malformed(err.to_string()))?;
            let value = HeaderValue::from_bytes(raw.value)
                .map_err(|err| HandshakeError::Malformed(err.to_string()))?;
            headers.append(name, value);
        }

        let protocol = self.verify(status, &headers)?;

        let _ = buf.split_to(head_len);
        let leftover = buf.split().freeze();

        Ok(Some(NegotiatedHandshake { protocol, leftover }))
    }

    fn verify(
        &self,
        status: u16,
        headers: &HeaderMap,
    ) -> std::result::Result<Option<String>, HandshakeError> {
        if status != 101 {
            return Err(HandshakeError::BadStatus(status));
        }

        if !has_token(headers, header::UPGRADE, "websocket")
            || !has_token(headers, header::CONNECTION, "upgrade")
        {
            return Err(HandshakeError::MissingUpgradeHeader);
        }

        let accept = headers
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .map(|h| h.as_bytes().trim_ascii());
        if accept != Some(self.expected_accept.as_bytes()) {
            return Err(HandshakeError::AcceptMismatch);
        }

        let protocol = match headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
            Some(value) => {
                let value = String::from_utf8_lossy(value.as_bytes()).trim().to_owned();
                if !self.protocols.iter().any(|p| *p == value) {
                    return Err(HandshakeError::UnrequestedProtocol(value));
                }
                Some(value)
            }
            None => None,
        };

        if let Some(value) = headers.get(header::SEC_WEBSOCKET_EXTENSIONS) {
            return Err(HandshakeError::UnrequestedExtension(
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }

        Ok(protocol)
    }
}

/// Checks that a comma separated header contains `token`, ignoring case.
fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
