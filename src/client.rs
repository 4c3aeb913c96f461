//! The Gemini client. [`Client`] drives each request through an explicit state machine.

pub mod certs;
pub mod connect;
pub mod request;
/// What [`Client::request`] returns.
pub mod response;
pub mod tofu;

use crate::{
    error::{Error, Result, TimeoutPhase},
    identity::Identity,
    parser::{Body, ResponseHeader, read_header},
    tls::VerifyAlpn,
    url::{DEFAULT_PORT, DEFAULT_SCHEME, Origin, resolve, resolve_redirect},
};
use certs::{CertificateStore, TransientCertStore};
use connect::{ClientStream, Connector};
use futures::{FutureExt, future::BoxFuture};
use request::Request;
use response::Response;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tofu::ServerTrust;
use tokio::{io::AsyncWriteExt, time::Instant};
use tracing::{debug, info};
use url::Url;

/// Client-side timeouts. `None` disables a timer.
///
/// `headers` and `body` are measured from the moment the connection is
/// established, not from when the request was handed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus TLS handshake.
    pub connect: Option<Duration>,
    /// Until the response header has been parsed.
    pub headers: Option<Duration>,
    /// Until the first byte of the body has arrived.
    pub body: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(60)),
            headers: Some(Duration::from_secs(20)),
            body: None,
        }
    }
}

/// Whether redirects are followed.
#[derive(Clone, Default)]
pub enum FollowRedirects {
    /// Hand the `3x` response to the caller.
    #[default]
    Never,
    /// Follow every redirect (up to `max_redirects`).
    Always,
    /// Ask, given the number of redirects followed so far and the redirect response.
    Predicate(Arc<dyn Fn(u32, &ResponseHeader) -> bool + Send + Sync>),
}

impl FollowRedirects {
    fn allows(&self, redirects: u32, header: &ResponseHeader) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::Predicate(follow) => follow(redirects, header),
        }
    }
}

impl From<bool> for FollowRedirects {
    fn from(follow: bool) -> Self {
        if follow { Self::Always } else { Self::Never }
    }
}

impl fmt::Debug for FollowRedirects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Always => f.write_str("Always"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// What the user is asked before a certificate is sent to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPrompt {
    /// Where the certificate would be sent.
    pub origin: Origin,
    /// The server's `meta`.
    pub reason: String,
}

/// Asks whether a client certificate may be used. May take as long as it likes.
pub type ConfirmClientCert = Arc<dyn Fn(CertPrompt) -> BoxFuture<'static, bool> + Send + Sync>;

/// Options for [`Client`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Host that bare paths like `/foo` are resolved against.
    pub hostname: String,
    /// Port that bare paths are resolved against.
    pub port: u16,
    /// How server certificates are checked.
    pub trust: ServerTrust,
    /// A certificate presented on every connection.
    pub identity: Option<Arc<Identity>>,
    /// Redirect policy.
    pub follow_redirects: FollowRedirects,
    /// Give up after this many redirects. `None` follows forever.
    pub max_redirects: Option<u32>,
    /// Whether to answer certificate requests (`60`–`62`) at all.
    pub use_client_certs: bool,
    /// Asked before a transient certificate is first sent to an origin.
    pub confirm_client_cert: ConfirmClientCert,
    /// Where transient certificates come from.
    pub cert_store: Arc<dyn CertificateStore>,
    /// Connect, header and body timers.
    pub timeouts: Timeouts,
    /// Check applied to the negotiated ALPN protocol.
    pub verify_alpn: VerifyAlpn,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            trust: ServerTrust::default(),
            identity: None,
            follow_redirects: FollowRedirects::Never,
            max_redirects: Some(10),
            use_client_certs: false,
            confirm_client_cert: Arc::new(|_: CertPrompt| futures::future::ready(false).boxed()),
            cert_store: Arc::new(TransientCertStore::new()),
            timeouts: Timeouts::default(),
            verify_alpn: VerifyAlpn::default(),
        }
    }
}

impl ClientOptions {
    /// The defaults: no redirects, no client certificates, TOFU trust.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set [`hostname`](Self::hostname).
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set [`port`](Self::port).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set how server certificates are checked.
    pub fn trust(mut self, trust: ServerTrust) -> Self {
        self.trust = trust;
        self
    }

    /// Present `identity` on every connection.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }

    /// Set the redirect policy. `true` follows every redirect.
    pub fn follow_redirects(mut self, follow: impl Into<FollowRedirects>) -> Self {
        self.follow_redirects = follow.into();
        self
    }

    /// Follow a redirect only if `follow(redirects_so_far, response)` says so.
    pub fn follow_redirects_if<F>(mut self, follow: F) -> Self
    where
        F: Fn(u32, &ResponseHeader) -> bool + Send + Sync + 'static,
    {
        self.follow_redirects = FollowRedirects::Predicate(Arc::new(follow));
        self
    }

    /// Set [`max_redirects`](Self::max_redirects).
    pub fn max_redirects(mut self, max: Option<u32>) -> Self {
        self.max_redirects = max;
        self
    }

    /// Answer certificate requests with transient certificates.
    pub fn use_client_certs(mut self, use_client_certs: bool) -> Self {
        self.use_client_certs = use_client_certs;
        self
    }

    /// Ask `confirm` before a transient certificate is first sent to an origin.
    pub fn confirm_client_cert<F, Fut>(mut self, confirm: F) -> Self
    where
        F: Fn(CertPrompt) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.confirm_client_cert = Arc::new(move |prompt| confirm(prompt).boxed());
        self
    }

    /// Take transient certificates from `store`.
    pub fn cert_store(mut self, store: impl CertificateStore + 'static) -> Self {
        self.cert_store = Arc::new(store);
        self
    }

    /// Replace all timers at once.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set [`Timeouts::connect`].
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    /// Set [`Timeouts::headers`].
    pub fn headers_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.headers = timeout;
        self
    }

    /// Set [`Timeouts::body`].
    pub fn body_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeouts.body = timeout;
        self
    }

    /// Set the ALPN check.
    pub fn verify_alpn(mut self, verify: VerifyAlpn) -> Self {
        self.verify_alpn = verify;
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("trust", &self.trust)
            .field("identity", &self.identity)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("use_client_certs", &self.use_client_certs)
            .field("timeouts", &self.timeouts)
            .field("verify_alpn", &self.verify_alpn)
            .finish_non_exhaustive()
    }
}

/// One logical request, carried across redirects and certificate challenges.
struct Exchange {
    url: Url,
    origin: Origin,
    redirects: u32,
    identity: Option<Arc<Identity>>,
    /// Whether `identity` came from the certificate store.
    transient: bool,
}

enum State {
    Connecting,
    AwaitingHeader {
        stream: ClientStream,
        connected_at: Instant,
        request: Request,
    },
    Redirecting(Response),
    CertChallenge(Response),
    Done(Response),
}

/// A client for the Gemini protocol.
pub struct Client {
    options: ClientOptions,
    connector: Connector,
}

impl Client {
    /// Build a client. Fails if the TLS configuration cannot be built.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let connector = Connector::new(&options.trust, options.verify_alpn.clone())?;
        Ok(Self { options, connector })
    }

    /// The options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Request `url_or_path`, following redirects and answering certificate
    /// requests as configured.
    ///
    /// Returns once a response header has been received that needs no
    /// further action. The body is read from the returned [`Response`].
    pub async fn request(&self, url_or_path: &str) -> Result<Response> {
        let url = resolve(url_or_path, &self.options.hostname, self.options.port)?;
        let mut exchange = Exchange {
            origin: Origin::from_url(&url)?,
            url,
            redirects: 0,
            identity: self.options.identity.clone(),
            transient: false,
        };

        let mut state = State::Connecting;
        loop {
            state = match state {
                State::Connecting => self.connect(&exchange).await?,
                State::AwaitingHeader {
                    stream,
                    connected_at,
                    request,
                } => {
                    let response = self.await_header(&exchange, stream, connected_at, request).await?;
                    self.interpret(&exchange, response).await?
                }
                State::Redirecting(response) => self.redirect(&mut exchange, response)?,
                State::CertChallenge(response) => self.cert_challenge(&mut exchange, response).await?,
                State::Done(response) => return Ok(response),
            };
        }
    }

    async fn connect(&self, exchange: &Exchange) -> Result<State> {
        let request = Request::new(exchange.url.clone())?;
        debug!(url = %exchange.url, origin = %exchange.origin, "connecting");

        let stream = self
            .connector
            .connect(
                &exchange.origin,
                exchange.identity.as_deref(),
                self.options.timeouts.connect,
            )
            .await?;

        Ok(State::AwaitingHeader {
            stream,
            connected_at: Instant::now(),
            request,
        })
    }

    async fn await_header(
        &self,
        exchange: &Exchange,
        mut stream: ClientStream,
        connected_at: Instant,
        request: Request,
    ) -> Result<Response> {
        let timeouts = self.options.timeouts;
        let exchange_header = async move {
            // the write side stays open, the server closes the connection
            stream.write_all(request.to_string().as_bytes()).await?;
            stream.flush().await?;
            let (header, rest) = read_header::<ResponseHeader, _>(&mut stream).await?;
            Ok::<_, Error>((header, rest, stream))
        };

        let (header, rest, stream) = tokio::select! {
            biased;
            result = exchange_header => result?,
            after = expire(connected_at, timeouts.headers) => {
                return Err(Error::Timeout { phase: TimeoutPhase::Headers, after });
            }
            after = expire(connected_at, timeouts.body) => {
                return Err(Error::Timeout { phase: TimeoutPhase::Body, after });
            }
        };
        debug!(url = %exchange.url, status = %header.status, meta = %header.meta, "received header");

        let deadline = timeouts.body.map(|after| (connected_at + after, after));
        Ok(Response {
            header,
            url: exchange.url.clone(),
            redirects: exchange.redirects,
            body: Body::spawn(rest, stream, deadline),
        })
    }

    async fn interpret(&self, exchange: &Exchange, response: Response) -> Result<State> {
        let status = response.status();

        if status.is_redirect() {
            if self.options.follow_redirects.allows(exchange.redirects, &response.header) {
                return Ok(State::Redirecting(response));
            }
            return Ok(State::Done(response));
        }
        if status.is_cert_rejection() {
            if exchange.transient {
                self.options.cert_store.delete(&exchange.origin).await;
            }
            return Err(Error::CertificateRejected {
                response: response.header,
            });
        }
        if status.is_cert_request() {
            return Ok(State::CertChallenge(response));
        }

        Ok(State::Done(response))
    }

    fn redirect(&self, exchange: &mut Exchange, response: Response) -> Result<State> {
        let target = resolve_redirect(&exchange.url, &response.header.meta)?;
        if target.scheme() != DEFAULT_SCHEME {
            debug!(%target, "not following cross-protocol redirect");
            return Ok(State::Done(response));
        }
        if let Some(max) = self.options.max_redirects {
            if exchange.redirects >= max {
                return Err(Error::TooManyRedirects(exchange.redirects + 1));
            }
        }

        let origin = Origin::from_url(&target)?;
        if origin != exchange.origin && exchange.transient {
            // transient certificates belong to the origin they were made for
            exchange.identity = self.options.identity.clone();
            exchange.transient = false;
        }
        info!(from = %exchange.url, to = %target, "following redirect");

        exchange.url = target;
        exchange.origin = origin;
        exchange.redirects += 1;

        Ok(State::Connecting)
    }

    async fn cert_challenge(&self, exchange: &mut Exchange, response: Response) -> Result<State> {
        let Response { header, .. } = response;

        if !self.options.use_client_certs {
            return Err(Error::ClientCertsDisabled { response: header });
        }
        if exchange.transient {
            return Err(Error::CertificateRequestedAgain { response: header });
        }

        let prompt = CertPrompt {
            origin: exchange.origin.clone(),
            reason: header.meta.clone(),
        };
        if !(self.options.confirm_client_cert)(prompt).await {
            return Err(Error::ClientCertDeclined {
                origin: exchange.origin.clone(),
                response: header,
            });
        }

        let identity = self.options.cert_store.get(&exchange.origin).await?;
        info!(origin = %exchange.origin, reason = %header.meta, "presenting transient client certificate");
        exchange.identity = Some(identity);
        exchange.transient = true;

        Ok(State::Connecting)
    }
}

/// Resolves `after` past `start`, or never if there is no timeout.
async fn expire(start: Instant, after: Option<Duration>) -> Duration {
    match after {
        Some(after) => {
            tokio::time::sleep_until(start + after).await;
            after
        }
        None => std::future::pending().await,
    }
}

/// Send a single request with the given options.
pub async fn request(url_or_path: &str, options: ClientOptions) -> Result<Response> {
    Client::new(options)?.request(url_or_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    fn header(status: Status, meta: &str) -> ResponseHeader {
        ResponseHeader {
            status,
            meta: meta.to_string(),
        }
    }

    #[test]
    fn follow_redirects_from_bool() {
        let redirect = header(Status::REDIRECT_TEMPORARY, "/foo");
        assert!(FollowRedirects::from(true).allows(0, &redirect));
        assert!(!FollowRedirects::from(false).allows(0, &redirect));
    }

    #[test]
    fn follow_redirects_predicate_sees_count_and_response() {
        let options = ClientOptions::new().follow_redirects_if(|count, response| {
            count < 2 && response.status == Status::REDIRECT_PERMANENT
        });
        let permanent = header(Status::REDIRECT_PERMANENT, "/foo");
        let temporary = header(Status::REDIRECT_TEMPORARY, "/foo");

        assert!(options.follow_redirects.allows(1, &permanent));
        assert!(!options.follow_redirects.allows(2, &permanent));
        assert!(!options.follow_redirects.allows(0, &temporary));
    }

    #[test]
    fn defaults() {
        let options = ClientOptions::default();
        assert_eq!(options.port, 1965);
        assert!(!options.use_client_certs);
        assert_eq!(options.max_redirects, Some(10));
        assert_eq!(options.timeouts.connect, Some(Duration::from_secs(60)));
        assert_eq!(options.timeouts.body, None);
    }

    #[tokio::test]
    async fn default_confirmation_declines() {
        let options = ClientOptions::default();
        let prompt = CertPrompt {
            origin: Origin::new("example.org", 1965),
            reason: "who are you?".to_string(),
        };
        assert!(!(options.confirm_client_cert)(prompt).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_without_timeout_never_fires() {
        let never = expire(Instant::now(), None);
        let result = tokio::time::timeout(Duration::from_secs(3600), never).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_gemini_url_is_refused_before_connecting() {
        let client = Client::new(ClientOptions::new().trust(ServerTrust::AcceptAny)).unwrap();
        let err = client.request("https://example.org/").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedScheme(_)));
    }
}
