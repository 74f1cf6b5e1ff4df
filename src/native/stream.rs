use std::{
    io,
    pin::{pin, Pin},
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    client::TlsStream,
    rustls::{
        self,
        pki_types::{CertificateDer, ServerName, TrustAnchor},
    },
    TlsConnector,
};
use url::{Host, Url};

use crate::{handshake, trust::DeferredVerifier, Options, Result, WebSocketError};

/// A TCP stream, optionally wrapped in TLS.
pub(crate) enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    /// The certificate chain presented by the server, end entity first.
    ///
    /// Empty for plain connections.
    pub(crate) fn peer_certificates(&self) -> Vec<CertificateDer<'static>> {
        match self {
            Self::Plain(_) => Vec::new(),
            Self::Tls(stream) => stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|chain| chain.to_vec())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => pin!(stream).poll_read(cx, buf),
            Self::Tls(stream) => pin!(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => pin!(stream).poll_write(cx, buf),
            Self::Tls(stream) => pin!(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => pin!(stream).poll_flush(cx),
            Self::Tls(stream) => pin!(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => pin!(stream).poll_shutdown(cx),
            Self::Tls(stream) => pin!(stream).poll_shutdown(cx),
        }
    }
}

/// Opens the transport for `url`: TCP, plus TLS for `wss` and `https`.
pub(crate) async fn connect(url: &Url, options: &Options) -> Result<MaybeTlsStream> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_owned(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(WebSocketError::MissingHost),
    };
    let port = url
        .port_or_known_default()
        .ok_or(WebSocketError::InvalidHttpScheme)?;

    let tcp_stream = TcpStream::connect((host.as_str(), port)).await?;
    tcp_stream.set_nodelay(true)?;

    if !handshake::is_secure(url) {
        return Ok(MaybeTlsStream::Plain(tcp_stream));
    }

    let connector = options
        .tls_connector
        .clone()
        .unwrap_or_else(|| tls_connector(options.trust_gate.is_some()));
    let domain = ServerName::try_from(host)?;

    #[cfg(feature = "logging")]
    log::debug!("starting TLS handshake with {domain:?}");

    let stream = connector.connect(domain, tcp_stream).await?;
    Ok(MaybeTlsStream::Tls(Box::new(stream)))
}

/// Creates a TLS connector for secure WebSocket connections.
/// If the crypto provider hasn't been set, [*ring*](https://github.com/briansmith/ring) will be used.
///
/// With `deferred` unset, the server chain is validated against the web PKI roots. With it set,
/// any chain is accepted during the TLS handshake and a [`TrustGate`](crate::TrustGate) decides
/// afterwards.
///
/// # Panics
/// Panics if the crypto provider supports none of the TLS protocol versions.
pub(crate) fn tls_connector(deferred: bool) -> TlsConnector {
    // define the provider if any, fallback to ring
    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .expect("versions");

    let mut config = if deferred {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DeferredVerifier::new(&provider)))
            .with_no_client_auth()
    } else {
        let mut root_cert_store = rustls::RootCertStore::empty();
        root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
            subject: ta.subject.clone(),
            subject_public_key_info: ta.subject_public_key_info.clone(),
            name_constraints: ta.name_constraints.clone(),
        }));

        builder
            .with_root_certificates(root_cert_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec!["http/1.1".into()];

    TlsConnector::from(Arc::new(config))
}
