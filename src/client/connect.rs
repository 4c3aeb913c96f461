//! TCP plus TLS to a server.

use super::tofu::ServerTrust;
use crate::{
    error::{Error, Result, TimeoutPhase},
    identity::Identity,
    tls::{ALPN_ID, PROTOCOL_VERSIONS, VerifyAlpn, crypto_provider},
    url::Origin,
};
use rustls::{
    ClientConfig,
    client::danger::ServerCertVerifier,
    crypto::CryptoProvider,
    pki_types::ServerName,
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// The encrypted channel to a server.
pub type ClientStream = tokio_rustls::client::TlsStream<TcpStream>;

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocolVersion {
    /// TLS 1.3.
    Tls1_3,
    /// TLS 1.2.
    Tls1_2,
    /// An unknown TLS protocol version.
    Unknown,
}

/// The protocol version negotiated on `stream`.
pub fn protocol_version(stream: &ClientStream) -> TlsProtocolVersion {
    stream
        .get_ref()
        .1
        .protocol_version()
        .map(|v| match v {
            rustls::ProtocolVersion::TLSv1_3 => TlsProtocolVersion::Tls1_3,
            rustls::ProtocolVersion::TLSv1_2 => TlsProtocolVersion::Tls1_2,
            _ => TlsProtocolVersion::Unknown,
        })
        .unwrap_or(TlsProtocolVersion::Unknown)
}

/// Opens TLS connections to Gemini servers.
#[derive(Debug, Clone)]
pub struct Connector {
    provider: Arc<CryptoProvider>,
    verifier: Arc<dyn ServerCertVerifier>,
    verify_alpn: VerifyAlpn,
}

impl Connector {
    /// A connector checking server certificates per `trust`.
    pub fn new(trust: &ServerTrust, verify_alpn: VerifyAlpn) -> Result<Self> {
        let provider = crypto_provider();
        let verifier = trust.verifier(&provider)?;

        Ok(Self {
            provider,
            verifier,
            verify_alpn,
        })
    }

    fn config(&self, identity: Option<&Identity>) -> Result<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(PROTOCOL_VERSIONS)?
            .dangerous()
            .with_custom_certificate_verifier(self.verifier.clone());

        let mut config = match identity {
            Some(identity) => builder.with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_ID.to_vec()];

        Ok(config)
    }

    /// Establish a TLS connection with `origin`, presenting `identity` if given.
    ///
    /// `timeout` covers everything from the TCP connect to the end of the
    /// handshake. On expiry, or if the negotiated ALPN protocol is refused,
    /// the connection is dropped.
    pub async fn connect(
        &self,
        origin: &Origin,
        identity: Option<&Identity>,
        timeout: Option<Duration>,
    ) -> Result<ClientStream> {
        let connector = TlsConnector::from(Arc::new(self.config(identity)?));
        let domain = ServerName::try_from(origin.host.clone())?;

        let handshake = async {
            let tcp_stream = TcpStream::connect((origin.host.as_str(), origin.port)).await?;
            Ok::<_, Error>(connector.connect(domain, tcp_stream).await?)
        };
        let stream = match timeout {
            Some(after) => tokio::time::timeout(after, handshake).await.map_err(|_| Error::Timeout {
                phase: TimeoutPhase::Connect,
                after,
            })??,
            None => handshake.await?,
        };

        let negotiated = stream.get_ref().1.alpn_protocol();
        if !self.verify_alpn.accepts(negotiated) {
            debug!(%origin, ?negotiated, "refusing ALPN protocol");
            return Err(Error::AlpnMismatch {
                negotiated: negotiated.map(<[u8]>::to_vec),
            });
        }
        debug!(
            %origin,
            version = ?protocol_version(&stream),
            client_cert = identity.is_some(),
            "connected"
        );

        Ok(stream)
    }
}
