//! Certificates and keys presented during the handshake.

use crate::error::Result;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use std::{fmt, time::Duration};
use time::OffsetDateTime;

/// A certificate chain and the private key belonging to its first entry.
///
/// Used both as a client certificate and as the server's own identity.
/// Loading these from disk is left to the caller.
pub struct Identity {
    /// Leaf first.
    pub cert_chain: Vec<CertificateDer<'static>>,
    /// The leaf's private key.
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Create an identity from an already loaded chain and key.
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }

    /// Generate a self-signed ECDSA P-256 certificate.
    ///
    /// `names` become subject alternative names, the first one (if any) is
    /// also used as the common name. The certificate is valid from a minute
    /// ago for `validity`.
    pub fn self_signed(names: &[&str], validity: Duration) -> Result<Self> {
        let mut params = CertificateParams::new(
            names.iter().map(|name| name.to_string()).collect::<Vec<_>>(),
        )?;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = now + validity;

        let mut subject = DistinguishedName::new();
        subject.push(DnType::CommonName, names.first().copied().unwrap_or("gemini"));
        params.distinguished_name = subject;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
        })
    }

    /// SHA-256 fingerprint of the leaf certificate.
    pub fn fingerprint(&self) -> Option<String> {
        self.cert_chain.first().map(|cert| fingerprint(cert))
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex-encoded SHA-256 digest of a DER certificate.
pub fn fingerprint(cert: &[u8]) -> String {
    hex::encode(Sha256::digest(cert))
}
