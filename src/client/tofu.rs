//! How the client decides to trust a server certificate.

use crate::{
    error::{Error, Result},
    identity::fingerprint,
    tls::SignatureCheck,
};
use rustls::{
    DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::CryptoProvider,
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::{debug, warn};

/// The result of a TOFU verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TofuResult {
    /// The host is known and the certificate matches.
    Match,
    /// The host is known but the certificate does not match.
    Mismatch,
    /// The host was unknown and has just been learned.
    New,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct KnownHostsFile {
    known_hosts: HashMap<String, String>, // hostname -> fingerprint
}

/// A trust-on-first-use (TOFU) store of hostnames and their certificate fingerprints.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    hosts: Arc<RwLock<HashMap<String, String>>>,
    path: Option<PathBuf>,
}

impl KnownHosts {
    /// A store that lives as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a store persisted as JSON at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let hosts = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let file: KnownHostsFile = serde_json::from_reader(reader)?;
            file.known_hosts
        } else {
            HashMap::new()
        };

        Ok(Self {
            hosts: Arc::new(RwLock::new(hosts)),
            path: Some(path),
        })
    }

    fn save_to_disk(&self, hosts: &HashMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let writer = BufWriter::new(File::create(path)?);
        let file = KnownHostsFile {
            known_hosts: hosts.clone(),
        };
        serde_json::to_writer_pretty(writer, &file)?;

        Ok(())
    }

    /// The fingerprint pinned for `hostname`, if any.
    pub fn fingerprint(&self, hostname: &str) -> Option<String> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .cloned()
    }

    /// Check a presented fingerprint, learning the host if it is unknown.
    pub fn verify_or_learn(&self, hostname: &str, claimed_fingerprint: &str) -> Result<TofuResult> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);

        match hosts.get(hostname) {
            Some(known) if known == claimed_fingerprint => Ok(TofuResult::Match),
            Some(_) => Ok(TofuResult::Mismatch),
            None => {
                hosts.insert(hostname.to_string(), claimed_fingerprint.to_string());
                self.save_to_disk(&hosts)?;

                Ok(TofuResult::New)
            }
        }
    }

    /// Forget a host, e.g. after its operator announced a new certificate.
    pub fn forget(&self, hostname: &str) -> Result<bool> {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let removed = hosts.remove(hostname).is_some();
        if removed {
            self.save_to_disk(&hosts)?;
        }

        Ok(removed)
    }
}

/// How the client decides whether to trust a server certificate.
#[derive(Debug, Clone)]
pub enum ServerTrust {
    /// Pin the first certificate seen per host.
    Tofu(KnownHosts),
    /// Regular CA validation against the Mozilla root set.
    WebPki,
    /// Trust every certificate. For tests and local development.
    AcceptAny,
}

impl Default for ServerTrust {
    fn default() -> Self {
        Self::Tofu(KnownHosts::in_memory())
    }
}

impl ServerTrust {
    pub(crate) fn verifier(&self, provider: &Arc<CryptoProvider>) -> Result<Arc<dyn ServerCertVerifier>> {
        let signatures = SignatureCheck::new(provider.clone());

        let verifier: Arc<dyn ServerCertVerifier> = match self {
            Self::Tofu(hosts) => Arc::new(TofuVerifier {
                hosts: hosts.clone(),
                signatures,
            }),
            Self::WebPki => {
                let roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                    .build()
                    .map_err(|e| Error::Tls(rustls::Error::General(e.to_string())))?
            }
            Self::AcceptAny => Arc::new(AcceptAnyVerifier { signatures }),
        };

        Ok(verifier)
    }
}

fn hostname(server_name: &ServerName<'_>) -> Option<String> {
    match server_name {
        ServerName::DnsName(name) => Some(name.as_ref().to_string()),
        ServerName::IpAddress(ip) => Some(std::net::IpAddr::from(*ip).to_string()),
        _ => None,
    }
}

/// A TOFU `ServerCertVerifier` for TLS connections.
#[derive(Debug)]
struct TofuVerifier {
    hosts: KnownHosts,
    signatures: SignatureCheck,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let not_valid = rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName);
        let Some(hostname) = hostname(server_name) else {
            return Err(not_valid);
        };
        let fingerprint = fingerprint(end_entity);

        match self.hosts.verify_or_learn(&hostname, &fingerprint) {
            Ok(TofuResult::Match) => Ok(ServerCertVerified::assertion()),
            Ok(TofuResult::New) => {
                debug!(%hostname, %fingerprint, "learned new host certificate");
                Ok(ServerCertVerified::assertion())
            }
            Ok(TofuResult::Mismatch) => {
                warn!(%hostname, %fingerprint, "certificate does not match the pinned fingerprint");
                Err(rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure))
            }
            Err(err) => {
                warn!(%hostname, "failed to record host certificate: {err}");
                Err(rustls::Error::General(err.to_string()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.signatures.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.signatures.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.signatures.schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyVerifier {
    signatures: SignatureCheck,
}

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.signatures.tls12(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.signatures.tls13(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.signatures.schemes()
    }
}
