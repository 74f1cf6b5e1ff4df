use std::{sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio_rustls::TlsConnector;

use crate::trust::TrustGate;

/// The maximum allowed payload size for reading, set to 1 MiB.
///
/// Frames with a payload size larger than this limit will be rejected to ensure memory safety
/// and prevent excessively large messages from impacting performance.
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// The maximum size of a reassembled message, set to 2 MiB.
///
/// Fragmented messages whose accumulated size grows past this limit close the connection
/// with status code 1009.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// How long the client waits for the peer's close frame, once its own has been sent, before it
/// drops the transport.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration options for a WebSocket connection.
///
/// `Options` allows users to set parameters that govern the behavior of a WebSocket connection,
/// including payload size limits, offered subprotocols, extra handshake headers and the way
/// the server certificate is trusted.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use wsclient::Options;
///
/// let options = Options::default()
///     .with_protocols(["chat"])
///     .with_max_payload_read(64 * 1024)
///     .with_handshake_timeout(Duration::from_secs(10));
/// ```
#[derive(Clone, Default)]
pub struct Options {
    /// Maximum allowed payload size of a single incoming frame, in bytes.
    ///
    /// If a frame exceeds this size, the connection is closed with status code 1009.
    ///
    /// Default: 1 MiB (1,048,576 bytes) as defined in [`MAX_PAYLOAD_READ`]
    pub max_payload_read: Option<usize>,

    /// Maximum size of a reassembled message, in bytes.
    ///
    /// Default: 2 MiB (2,097,152 bytes) as defined in [`MAX_MESSAGE_SIZE`], or twice the
    /// configured `max_payload_read` value if that is set.
    pub max_message_size: Option<usize>,

    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in order of preference.
    pub protocols: Vec<String>,

    /// Extra headers sent with the upgrade request.
    ///
    /// Headers the handshake owns (`Host`, `Upgrade`, `Connection` and the `Sec-WebSocket-*`
    /// family) are ignored. An `Origin` here replaces the one derived from the URL.
    pub headers: HeaderMap,

    /// Grace period for the closing handshake.
    ///
    /// Default: [`CLOSE_TIMEOUT`]
    pub close_timeout: Option<Duration>,

    /// Upper bound for connecting and completing the opening handshake. Unbounded by default.
    pub handshake_timeout: Option<Duration>,

    /// When `true`, sending on a closing or closed connection fails with
    /// [`WebSocketError::ConnectionClosed`](crate::WebSocketError::ConnectionClosed) instead of
    /// being silently dropped.
    ///
    /// Default: `false`
    pub error_on_closed_send: bool,

    /// Decides whether the server's certificate chain is trusted.
    ///
    /// When set, the gate replaces the usual validation against the web PKI roots.
    pub trust_gate: Option<Arc<dyn TrustGate>>,

    /// TLS connector used for `wss` and `https` URLs instead of the default one.
    pub tls_connector: Option<TlsConnector>,
}

impl Options {
    /// Sets the maximum allowed payload size for incoming frames.
    pub fn with_max_payload_read(self, size: usize) -> Self {
        Self {
            max_payload_read: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a reassembled message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Sets the subprotocols offered during the handshake.
    pub fn with_protocols<I, S>(self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Adds a header to the upgrade request.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets how long to wait for the peer's close frame.
    pub fn with_close_timeout(self, timeout: Duration) -> Self {
        Self {
            close_timeout: Some(timeout),
            ..self
        }
    }

    /// Bounds the time spent connecting and negotiating.
    pub fn with_handshake_timeout(self, timeout: Duration) -> Self {
        Self {
            handshake_timeout: Some(timeout),
            ..self
        }
    }

    /// Makes sends on a closing or closed connection return an error.
    pub fn with_error_on_closed_send(self) -> Self {
        Self {
            error_on_closed_send: true,
            ..self
        }
    }

    /// Installs a gate that decides whether the server's certificates are trusted.
    pub fn with_trust_gate(self, gate: impl TrustGate + 'static) -> Self {
        Self {
            trust_gate: Some(Arc::new(gate)),
            ..self
        }
    }

    /// Uses `connector` for TLS connections.
    pub fn with_tls_connector(self, connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
            ..self
        }
    }

    pub(crate) fn payload_limit(&self) -> usize {
        self.max_payload_read.unwrap_or(MAX_PAYLOAD_READ)
    }

    pub(crate) fn message_limit(&self) -> usize {
        self.max_message_size.unwrap_or(
            self.max_payload_read
                .map(|payload_read| payload_read.saturating_mul(2))
                .unwrap_or(MAX_MESSAGE_SIZE),
        )
    }

    pub(crate) fn close_grace(&self) -> Duration {
        self.close_timeout.unwrap_or(CLOSE_TIMEOUT)
    }
}
