//! # Trust
//!
//! Certificate trust for `wss` connections.
//!
//! By default the server chain is validated against the web PKI roots. A [`TrustGate`]
//! configured through [`Options::with_trust_gate`](crate::Options::with_trust_gate) replaces that
//! validation: the TLS handshake then accepts any chain, only checking that the server owns the
//! key it presents, and the gate is consulted exactly once with the peer's chain before the
//! upgrade request is written. A rejected chain fails the connection with
//! [`WebSocketError::CertificateRejected`](crate::WebSocketError::CertificateRejected).
use std::sync::Arc;

use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::WebPkiSupportedAlgorithms,
    pki_types::{CertificateDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};

/// Decides whether a server certificate chain is trusted.
///
/// The chain is ordered as the server sent it, end entity first.
pub trait TrustGate: Send + Sync {
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> bool;
}

impl<F> TrustGate for F
where
    F: Fn(&[CertificateDer<'_>]) -> bool + Send + Sync,
{
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> bool {
        self(chain)
    }
}

/// Trusts a chain if any of its certificates is byte-for-byte one of the pinned ones.
///
/// Cloning is cheap: the set is shared.
#[derive(Debug, Clone, Default)]
pub struct PinnedCertificates {
    pinned: Arc<Vec<CertificateDer<'static>>>,
}

impl PinnedCertificates {
    /// Pins the given DER encoded certificates.
    pub fn new<I>(certificates: I) -> Self
    where
        I: IntoIterator<Item = CertificateDer<'static>>,
    {
        Self {
            pinned: Arc::new(certificates.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }
}

impl TrustGate for PinnedCertificates {
    fn evaluate(&self, chain: &[CertificateDer<'_>]) -> bool {
        chain
            .iter()
            .any(|cert| self.pinned.iter().any(|pin| pin.as_ref() == cert.as_ref()))
    }
}

/// A verifier that leaves the trust decision to a [`TrustGate`].
///
/// Handshake signatures are still verified, so the peer must hold the private key of the
/// certificate it presents.
#[derive(Debug)]
pub(crate) struct DeferredVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredVerifier {
    pub(crate) fn new(provider: &rustls::crypto::CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for DeferredVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn test_pinned_matches_any_chain_member() {
        let gate = PinnedCertificates::new([cert(b"intermediate")]);
        assert_eq!(gate.len(), 1);

        assert!(gate.evaluate(&[cert(b"leaf"), cert(b"intermediate")]));
        assert!(!gate.evaluate(&[cert(b"leaf"), cert(b"other")]));
        assert!(!gate.evaluate(&[]));
    }

    #[test]
    fn test_empty_pin_set_rejects_everything() {
        let gate = PinnedCertificates::default();
        assert!(gate.is_empty());
        assert!(!gate.evaluate(&[cert(b"leaf")]));
    }

    fn two_certificates(chain: &[CertificateDer<'_>]) -> bool {
        chain.len() == 2
    }

    #[test]
    fn test_function_gate() {
        let gate: Arc<dyn TrustGate> = Arc::new(two_certificates);
        assert!(gate.evaluate(&[cert(b"a"), cert(b"b")]));
        assert!(!gate.evaluate(&[cert(b"a")]));
    }
}
