//! A Gemini server.
//!
//! [`Server`] accepts TLS connections, reads one request line from each and
//! hands it to a [`Handler`] together with a [`ResponseWriter`]. Every
//! connection runs in its own task.

pub mod request;
pub mod response;
mod verifier;

use crate::{
    error::{Error, Result, TimeoutPhase},
    identity::{Identity, fingerprint},
    parser::{RequestHeader, read_header},
    status::Status,
    tls::{ALPN_ID, PROTOCOL_VERSIONS, SignatureCheck, VerifyAlpn, crypto_provider},
};
use async_trait::async_trait;
use request::Request;
use response::ResponseWriter;
use rustls::ServerConfig;
use std::{fmt, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    time::Instant,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use verifier::SelfSignedClientVerifier;

/// Pause after a failed accept (`EMFILE` and friends persist).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The encrypted channel to a client.
pub type ServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Application logic, called once per request.
///
/// Whatever the handler leaves unfinished is finished for it: an untouched
/// response becomes `20` with an empty body. If the handler fails before
/// sending a header, the client gets `40`.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Answer `request` through `response`.
    async fn handle(&self, request: Request, response: &mut ResponseWriter) -> Result<()>;
}

#[async_trait]
impl<H: Handler> Handler for Arc<H> {
    async fn handle(&self, request: Request, response: &mut ResponseWriter) -> Result<()> {
        (**self).handle(request, response).await
    }
}

/// Options for [`Server`].
#[derive(Clone)]
pub struct ServerOptions {
    /// The certificate the server presents.
    pub identity: Identity,
    /// Connections whose negotiated protocol fails this are closed without a response.
    pub verify_alpn: VerifyAlpn,
    /// Offer `gemini` via ALPN. Off by default, some clients fail the
    /// handshake when the server selects a protocol.
    pub advertise_alpn: bool,
    /// Ask clients for a certificate during the handshake. Never required.
    pub request_client_certs: bool,
    /// Time allowed from accepting a connection until its request line has
    /// been read, handshake included.
    pub request_timeout: Option<Duration>,
}

impl ServerOptions {
    /// Defaults for a server presenting `identity`.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            verify_alpn: VerifyAlpn::default(),
            advertise_alpn: false,
            request_client_certs: true,
            request_timeout: Some(Duration::from_secs(20)),
        }
    }

    /// Set the ALPN check.
    pub fn verify_alpn(mut self, verify: VerifyAlpn) -> Self {
        self.verify_alpn = verify;
        self
    }

    /// Set [`advertise_alpn`](Self::advertise_alpn).
    pub fn advertise_alpn(mut self, advertise: bool) -> Self {
        self.advertise_alpn = advertise;
        self
    }

    /// Set [`request_client_certs`](Self::request_client_certs).
    pub fn request_client_certs(mut self, request: bool) -> Self {
        self.request_client_certs = request;
        self
    }

    /// Set [`request_timeout`](Self::request_timeout). `None` waits forever.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn tls_config(&self) -> Result<ServerConfig> {
        let provider = crypto_provider();
        let builder = ServerConfig::builder_with_provider(provider.clone()).with_protocol_versions(PROTOCOL_VERSIONS)?;
        let builder = if self.request_client_certs {
            builder.with_client_cert_verifier(Arc::new(SelfSignedClientVerifier::new(SignatureCheck::new(provider))))
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder.with_single_cert(self.identity.cert_chain.clone(), self.identity.key.clone_key())?;
        if self.advertise_alpn {
            config.alpn_protocols = vec![ALPN_ID.to_vec()];
        }

        Ok(config)
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("identity", &self.identity)
            .field("verify_alpn", &self.verify_alpn)
            .field("advertise_alpn", &self.advertise_alpn)
            .field("request_client_certs", &self.request_client_certs)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// What every connection task needs.
struct Shared {
    acceptor: TlsAcceptor,
    verify_alpn: VerifyAlpn,
    request_timeout: Option<Duration>,
}

/// A bound Gemini server.
pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind to `addr` and build the TLS acceptor.
    pub async fn bind(addr: impl ToSocketAddrs, options: ServerOptions) -> Result<Self> {
        let acceptor = TlsAcceptor::from(Arc::new(options.tls_config()?));
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "listening");

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                acceptor,
                verify_alpn: options.verify_alpn,
                request_timeout: options.request_timeout,
            }),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve<H: Handler>(self, handler: H) -> Result<()> {
        self.serve_with_shutdown(handler, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Connections already accepted are left to finish on their own.
    pub async fn serve_with_shutdown<H, F>(self, handler: H, shutdown: F) -> Result<()>
    where
        H: Handler,
        F: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let shared = self.shared.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(&shared, &*handler, stream, peer_addr).await {
                                debug!(%peer_addr, "connection failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("failed to accept connection: {err}");
                        accept_backoff().await;
                    }
                },
            }
        }
    }
}

async fn accept_backoff() {
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

/// Run `future` unless `deadline` passes first.
async fn before<T>(deadline: Option<(Instant, Duration)>, future: impl Future<Output = Result<T>>) -> Result<T> {
    match deadline {
        Some((at, after)) => tokio::time::timeout_at(at, future).await.map_err(|_| Error::Timeout {
            phase: TimeoutPhase::Request,
            after,
        })?,
        None => future.await,
    }
}

async fn handle_connection<H: Handler>(
    shared: &Shared,
    handler: &H,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    let deadline = shared.request_timeout.map(|after| (Instant::now() + after, after));

    let handshake = async { shared.acceptor.accept(stream).await.map_err(Error::from) };
    let mut stream = before(deadline, handshake).await?;

    let negotiated = stream.get_ref().1.alpn_protocol();
    if !shared.verify_alpn.accepts(negotiated) {
        debug!(%peer_addr, ?negotiated, "refusing ALPN protocol, closing connection");
        stream.shutdown().await?;
        return Ok(());
    }
    let client_fingerprint = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| fingerprint(cert));

    // anything the client sent after the request line is ignored
    let (header, _) = before(deadline, read_header::<RequestHeader, _>(&mut stream)).await?;
    debug!(%peer_addr, url = %header.url, client_cert = client_fingerprint.is_some(), "received request");

    let mut response = ResponseWriter::new(stream);
    let request = match Request::new(header.url, client_fingerprint, peer_addr) {
        Ok(request) => request,
        Err(err) => {
            debug!(%peer_addr, "invalid request URL: {err}");
            return response.bad_request("invalid URL").await;
        }
    };

    if let Err(err) = handler.handle(request, &mut response).await {
        warn!(%peer_addr, "handler failed: {err}");
        if !response.header_sent() {
            response.send_header(Status::TEMPORARY_FAILURE, "").await?;
        }
    }

    response.end().await
}
