use async_trait::async_trait;
use gemwire::{
    CertificateStore, Client, ClientOptions, Error, Handler, Identity, KnownHosts, Origin, ResponseHeader, Result,
    ResponseWriter, Server, ServerOptions, ServerTrust, Status, TimeoutPhase, TransientCertStore, VerifyAlpn,
    client::connect::Connector,
    parser::read_header,
    server::request::Request,
};
use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::oneshot,
    time::sleep,
};

const LATENCY: Duration = Duration::from_millis(500);

struct TestHandler;

#[async_trait]
impl Handler for TestHandler {
    async fn handle(&self, request: Request, response: &mut ResponseWriter) -> Result<()> {
        match request.path() {
            "/foo" => {
                sleep(LATENCY).await;
                if request.client_fingerprint().is_none() {
                    return response.request_transient_cert("/foo is secret!").await;
                }
                response.write_str("foo").await?;
                response.write_str("!").await
            }
            "/bar" => {
                sleep(LATENCY).await;
                response.redirect("/foo", false).await
            }
            "/slow-body" => {
                response.send_header(Status::SUCCESS, "text/plain").await?;
                sleep(LATENCY).await;
                response.write_str("late").await
            }
            "/members" => match request.client_fingerprint() {
                None => response.request_transient_cert("members only").await,
                Some(_) => response.send_header(Status::CERT_NOT_ACCEPTED, "not a member").await,
            },
            "/always-challenge" => response.request_transient_cert("again").await,
            "/loop" => response.redirect("/loop", false).await,
            "/elsewhere" => response.redirect("https://example.org/", true).await,
            "/fail" => Err(Error::Io(io::Error::other("boom"))),
            "/private" => match request.client_fingerprint() {
                None => response.request_transient_cert("who are you?").await,
                Some(fingerprint) => response.write_str(fingerprint).await,
            },
            "/whoami" => {
                let fingerprint = request.client_fingerprint().unwrap_or("anonymous").to_string();
                response.write_str(&fingerprint).await
            }
            _ => response.gone().await,
        }
    }
}

struct Running {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

fn identity() -> Identity {
    Identity::self_signed(&["localhost"], Duration::from_secs(3600)).unwrap()
}

async fn start(options: ServerOptions) -> Running {
    let server = Server::bind("127.0.0.1:0", options).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown, stopped) = oneshot::channel::<()>();

    tokio::spawn(server.serve_with_shutdown(Arc::new(TestHandler), async {
        stopped.await.ok();
    }));

    Running {
        addr,
        _shutdown: shutdown,
    }
}

async fn start_default() -> Running {
    start(ServerOptions::new(identity())).await
}

fn options(server: &Running) -> ClientOptions {
    ClientOptions::new()
        .hostname("127.0.0.1")
        .port(server.addr.port())
        .trust(ServerTrust::AcceptAny)
}

fn with_certs(server: &Running) -> ClientOptions {
    options(server)
        .follow_redirects(true)
        .use_client_certs(true)
        .confirm_client_cert(|_| async { true })
}

async fn raw_exchange(server: &Running, request: &[u8]) -> io::Result<String> {
    let connector = Connector::new(&ServerTrust::AcceptAny, VerifyAlpn::default()).unwrap();
    let origin = Origin::new("127.0.0.1", server.addr.port());
    let mut stream = connector.connect(&origin, None, None).await?;

    stream.write_all(request).await?;
    stream.flush().await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test]
async fn redirect_is_returned_when_not_followed() {
    let server = start_default().await;

    let response = gemwire::client::request("/bar", options(&server)).await.unwrap();
    assert_eq!(response.status_code(), 30);
    assert_eq!(response.meta(), "/foo");
    assert_eq!(response.redirects, 0);
}

#[tokio::test]
async fn redirect_then_certificate_challenge() {
    let server = start_default().await;

    let response = gemwire::client::request("/bar", with_certs(&server)).await.unwrap();
    assert_eq!(response.status_code(), 20);
    assert_eq!(response.redirects, 1);
    assert_eq!(response.url.path(), "/foo");
    assert_eq!(response.text().await.unwrap(), "foo!");
}

#[tokio::test]
async fn certificate_challenge_with_client_certs_disabled() {
    let server = start_default().await;

    let err = gemwire::client::request("/bar", with_certs(&server).use_client_certs(false))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "server request client cert, but client is configured not to send one"
    );
    assert_eq!(err.response().map(|r| r.status), Some(Status::TRANSIENT_CERT_REQUESTED));
}

#[tokio::test]
async fn headers_timeout() {
    let server = start_default().await;

    let options = with_certs(&server).headers_timeout(Some(Duration::from_millis(100)));
    let err = gemwire::client::request("/bar", options).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "timeout waiting for response headers");
}

#[tokio::test]
async fn body_timeout_before_headers() {
    let server = start_default().await;

    let options = with_certs(&server).body_timeout(Some(Duration::from_millis(100)));
    let err = gemwire::client::request("/bar", options).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "timeout waiting for first byte of the response");
}

#[tokio::test]
async fn body_timeout_after_headers() {
    let server = start_default().await;

    let options = options(&server).body_timeout(Some(Duration::from_millis(200)));
    let response = gemwire::client::request("/slow-body", options).await.unwrap();
    assert_eq!(response.status_code(), 20);
    assert_eq!(response.mime_type().unwrap().essence(), "text/plain");

    let err = response.text().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { phase: TimeoutPhase::Body, .. }));
}

#[tokio::test]
async fn declined_confirmation() {
    let server = start_default().await;

    let options = with_certs(&server).confirm_client_cert(|prompt| async move {
        assert_eq!(prompt.reason, "/foo is secret!");
        false
    });
    let err = gemwire::client::request("/foo", options).await.unwrap_err();
    assert!(matches!(err, Error::ClientCertDeclined { .. }));
}

#[derive(Clone, Default)]
struct RecordingStore {
    inner: TransientCertStore,
    deleted: Arc<Mutex<Vec<Origin>>>,
}

#[async_trait]
impl CertificateStore for RecordingStore {
    async fn get(&self, origin: &Origin) -> Result<Arc<Identity>> {
        self.inner.get(origin).await
    }

    async fn delete(&self, origin: &Origin) -> bool {
        self.deleted.lock().unwrap().push(origin.clone());
        self.inner.delete(origin).await
    }
}

#[tokio::test]
async fn rejected_certificate_is_deleted() {
    let server = start_default().await;
    let store = RecordingStore::default();

    let err = gemwire::client::request("/members", with_certs(&server).cert_store(store.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CertificateRejected { .. }));
    assert_eq!(err.to_string(), "not a member");
    assert_eq!(*store.deleted.lock().unwrap(), vec![Origin::new("127.0.0.1", server.addr.port())]);
}

#[tokio::test]
async fn repeated_challenge_is_an_error() {
    let server = start_default().await;

    let err = gemwire::client::request("/always-challenge", with_certs(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CertificateRequestedAgain { .. }));
}

#[tokio::test]
async fn transient_certificate_is_reused_per_origin() {
    let server = start_default().await;
    let store = TransientCertStore::new();
    let client = Client::new(with_certs(&server).cert_store(store.clone())).unwrap();

    let first = client.request("/private").await.unwrap().text().await.unwrap();
    let second = client.request("/private").await.unwrap().text().await.unwrap();
    assert_eq!(first, second);

    let origin = Origin::new("127.0.0.1", server.addr.port());
    assert_eq!(store.get(&origin).await.unwrap().fingerprint(), Some(first));
}

#[tokio::test]
async fn static_identity_is_presented_unasked() {
    let server = start_default().await;
    let identity = identity();
    let expected = identity.fingerprint().unwrap();

    let response = gemwire::client::request("/whoami", options(&server).identity(identity))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), expected);
}

#[tokio::test]
async fn redirect_limit() {
    let server = start_default().await;

    let options = options(&server).follow_redirects(true).max_redirects(Some(2));
    let err = gemwire::client::request("/loop", options).await.unwrap_err();
    assert!(matches!(err, Error::TooManyRedirects(3)));
}

#[tokio::test]
async fn redirect_predicate_and_cross_protocol_redirects() {
    let server = start_default().await;

    let only_permanent = options(&server).follow_redirects_if(|_, header| header.status == Status::REDIRECT_PERMANENT);
    let response = gemwire::client::request("/bar", only_permanent.clone()).await.unwrap();
    assert_eq!(response.status(), Status::REDIRECT_TEMPORARY);

    let response = gemwire::client::request("/elsewhere", only_permanent).await.unwrap();
    assert_eq!(response.status(), Status::REDIRECT_PERMANENT);
    assert_eq!(response.meta(), "https://example.org/");
}

#[tokio::test]
async fn handler_failure_answers_temporary_failure() {
    let server = start_default().await;

    let response = gemwire::client::request("/fail", options(&server)).await.unwrap();
    assert_eq!(response.status(), Status::TEMPORARY_FAILURE);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn absolute_url_overrides_default_origin() {
    let server = start_default().await;

    let url = format!("gemini://127.0.0.1:{}/nothing-here", server.addr.port());
    let response = gemwire::client::request(&url, ClientOptions::new().trust(ServerTrust::AcceptAny))
        .await
        .unwrap();
    assert_eq!(response.status(), Status::GONE);
    assert_eq!(response.status_message(), "Gone");
}

#[tokio::test]
async fn connection_refused_is_a_transport_error() {
    let server = start_default().await;
    let port = server.addr.port();
    drop(server);
    sleep(Duration::from_millis(50)).await;

    let err = gemwire::client::request("/", ClientOptions::new().port(port).trust(ServerTrust::AcceptAny))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn connect_timeout_covers_the_handshake() {
    // accepts TCP but never answers the ClientHello
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let options = ClientOptions::new()
        .port(port)
        .trust(ServerTrust::AcceptAny)
        .connect_timeout(Some(Duration::from_millis(100)));
    let started = tokio::time::Instant::now();
    let err = gemwire::client::request("/", options).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(err, Error::Timeout { phase: TimeoutPhase::Connect, .. }));
    assert_eq!(err.to_string(), "connect timeout");
    assert!(started.elapsed() < Duration::from_secs(5));
    silent.abort();
}

#[tokio::test]
async fn refused_alpn_closes_without_response() {
    let refuse_all = VerifyAlpn::Custom(Arc::new(|_: Option<&[u8]>| false));
    let server = start(ServerOptions::new(identity()).verify_alpn(refuse_all)).await;

    let connector = Connector::new(&ServerTrust::AcceptAny, VerifyAlpn::default()).unwrap();
    let origin = Origin::new("127.0.0.1", server.addr.port());
    let mut stream = connector.connect(&origin, None, None).await.unwrap();
    let err = read_header::<ResponseHeader, _>(&mut stream).await.unwrap_err();
    assert!(matches!(err, Error::ClosedBeforeHeader("response")));

    let result = gemwire::client::request("/other", options(&server)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn invalid_request_url_answers_bad_request() {
    let server = start_default().await;

    let response = raw_exchange(&server, b"gemini://exa mple.org/\r\n").await.unwrap();
    assert_eq!(response, "59 invalid URL\r\n");
}

#[tokio::test]
async fn idle_connection_is_dropped() {
    let server = start(ServerOptions::new(identity()).request_timeout(Some(Duration::from_millis(100)))).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), raw_exchange(&server, b"")).await;
    let response = closed.expect("server should close the idle connection");
    assert!(response.map_or(true, |text| text.is_empty()));
}

#[tokio::test]
async fn strict_alpn_needs_an_advertising_server() {
    let quiet = start_default().await;
    let err = gemwire::client::request("/other", options(&quiet).verify_alpn(VerifyAlpn::Strict))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlpnMismatch { negotiated: None }));

    let advertising = start(ServerOptions::new(identity()).advertise_alpn(true)).await;
    let response = gemwire::client::request("/other", options(&advertising).verify_alpn(VerifyAlpn::Strict))
        .await
        .unwrap();
    assert_eq!(response.status(), Status::GONE);
}

#[tokio::test]
async fn tofu_pins_the_first_certificate() {
    let first_identity = identity();
    let pinned = first_identity.fingerprint().unwrap();
    let first = start(ServerOptions::new(first_identity)).await;
    let second = start_default().await;

    let hosts = KnownHosts::in_memory();
    let tofu = |server: &Running| options(server).trust(ServerTrust::Tofu(hosts.clone()));

    let response = gemwire::client::request("/other", tofu(&first)).await.unwrap();
    assert_eq!(response.status(), Status::GONE);
    assert_eq!(hosts.fingerprint("127.0.0.1"), Some(pinned.clone()));

    // same host, different certificate
    assert!(gemwire::client::request("/other", tofu(&second)).await.is_err());
    assert_eq!(hosts.fingerprint("127.0.0.1"), Some(pinned));
}
