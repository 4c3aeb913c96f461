//! TLS settings shared by the client and the server.

use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::CertificateDer,
};
use std::{fmt, sync::Arc};

/// The application protocol identifier offered via ALPN.
pub const ALPN_ID: &[u8] = b"gemini";

/// TLS 1.2 is the floor, 1.3 is preferred.
pub(crate) static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Handshake signature checks for verifiers that skip chain validation.
///
/// Whatever a verifier decides about the certificate itself, the peer must
/// still prove it holds the matching private key.
#[derive(Debug, Clone)]
pub(crate) struct SignatureCheck {
    provider: Arc<CryptoProvider>,
}

impl SignatureCheck {
    pub(crate) fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }

    pub(crate) fn tls12(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    pub(crate) fn tls13(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    pub(crate) fn schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Decides whether the protocol negotiated during the handshake is acceptable.
#[derive(Clone, Default)]
pub enum VerifyAlpn {
    /// Accept `gemini`, or no protocol at all (many servers do not speak ALPN).
    #[default]
    Permissive,
    /// Only accept `gemini`.
    Strict,
    /// Accept anything.
    Any,
    /// Let the caller decide.
    Custom(Arc<dyn Fn(Option<&[u8]>) -> bool + Send + Sync>),
}

impl VerifyAlpn {
    /// Whether `negotiated` passes this check.
    pub fn accepts(&self, negotiated: Option<&[u8]>) -> bool {
        match self {
            Self::Permissive => negotiated.is_none_or(|id| id == ALPN_ID),
            Self::Strict => negotiated == Some(ALPN_ID),
            Self::Any => true,
            Self::Custom(check) => check(negotiated),
        }
    }
}

impl fmt::Debug for VerifyAlpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permissive => f.write_str("Permissive"),
            Self::Strict => f.write_str("Strict"),
            Self::Any => f.write_str("Any"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
