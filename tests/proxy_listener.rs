use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use http::header::HOST;
use http::{Request, Response};
use hyper::body::Incoming;
use muzeum::ca::{self, CertificateAuthority};
use muzeum::proxy::{ProxyListener, ResponseBody, Serving, full};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

async fn echo(req: Request<Incoming>) -> Response<ResponseBody> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    Response::new(full(format!("{} {}", host, req.uri().path())))
}

struct Proxy {
    serving: Serving,
    http: SocketAddr,
    https: SocketAddr,
    client_config: Arc<ClientConfig>,
    connector: TlsConnector,
}

async fn start() -> Proxy {
    let mut pem = Vec::new();
    ca::generate(&mut pem, "muzeum-test").unwrap();
    let authority = Arc::new(CertificateAuthority::load(&pem).unwrap());

    let mut roots = RootCertStore::empty();
    roots.add(authority.certificate_der().clone()).unwrap();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let client_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let client_config = Arc::new(client_config);

    let listener = ProxyListener::bind(authority, "127.0.0.1:0", "127.0.0.1:0")
        .await
        .unwrap();
    let http = listener.http_addr().unwrap();
    let https = listener.https_addr();

    Proxy {
        serving: listener.serve(echo),
        http,
        https,
        connector: TlsConnector::from(Arc::clone(&client_config)),
        client_config,
    }
}

fn server_name(name: &str) -> ServerName<'static> {
    ServerName::try_from(name.to_string()).unwrap()
}

/// Reads one response head byte by byte, then its `content-length` body.
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, String) {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.unwrap();
    (head, String::from_utf8(body).unwrap())
}

async fn get<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    host: &str,
    path: &str,
) -> (String, String) {
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host);
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();
    read_response(stream).await
}

/// Tests that plain HTTP requests are served without TLS.
#[tokio::test]
async fn plaintext_request_reaches_handler() {
    let proxy = start().await;
    let mut stream = TcpStream::connect(proxy.http).await.unwrap();

    let (head, body) = get(&mut stream, "registry.test", "/index").await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, "registry.test /index");

    proxy.serving.shutdown().await;
}

/// Tests that a CONNECT tunnel gets the literal response and then behaves
/// like a direct TLS connection.
#[tokio::test]
async fn connect_tunnel_serves_tls() {
    let proxy = start().await;
    let mut stream = TcpStream::connect(proxy.http).await.unwrap();

    stream
        .write_all(b"CONNECT registry.test:443 HTTP/1.1\r\nHost: registry.test:443\r\n\r\n")
        .await
        .unwrap();
    let mut established = [0u8; 17];
    stream.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 OK\n\n");

    let mut tls = proxy
        .connector
        .connect(server_name("registry.test"), stream)
        .await
        .unwrap();
    let (head, body) = get(&mut tls, "registry.test", "/v2/").await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(body, "registry.test /v2/");

    proxy.serving.shutdown().await;
}

/// Tests that a CONNECT sent after earlier requests on the same connection
/// is also handed to the TLS side.
#[tokio::test]
async fn connect_after_keep_alive_request() {
    let proxy = start().await;
    let mut stream = TcpStream::connect(proxy.http).await.unwrap();

    let (_, body) = get(&mut stream, "registry.test", "/first").await;
    assert_eq!(body, "registry.test /first");

    stream
        .write_all(b"CONNECT mirror.test:443 HTTP/1.1\r\nHost: mirror.test:443\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));

    let mut tls = proxy
        .connector
        .connect(server_name("mirror.test"), stream)
        .await
        .unwrap();
    let (_, body) = get(&mut tls, "mirror.test", "/second").await;
    assert_eq!(body, "mirror.test /second");

    proxy.serving.shutdown().await;
}

/// Sends pending TLS records and feeds received ones until `done` holds.
async fn drive_tls(
    tls: &mut ClientConnection,
    stream: &mut TcpStream,
    mut done: impl FnMut(&mut ClientConnection) -> bool,
) {
    loop {
        while tls.wants_write() {
            let mut out = Vec::new();
            tls.write_tls(&mut out).unwrap();
            stream.write_all(&out).await.unwrap();
        }
        if done(tls) {
            return;
        }
        let mut buf = vec![0u8; 16 * 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before the exchange finished");
        tls.read_tls(&mut &buf[..n]).unwrap();
        tls.process_new_packets().unwrap();
    }
}

/// Tests that a ClientHello sent together with a mid-connection CONNECT,
/// before the client has read the CONNECT response, still reaches the TLS
/// side.
#[tokio::test]
async fn pipelined_client_hello_after_connect() {
    let proxy = start().await;
    let mut stream = TcpStream::connect(proxy.http).await.unwrap();

    let (_, body) = get(&mut stream, "registry.test", "/first").await;
    assert_eq!(body, "registry.test /first");

    let mut tls =
        ClientConnection::new(Arc::clone(&proxy.client_config), server_name("pipelined.test"))
            .unwrap();
    let mut request =
        b"CONNECT pipelined.test:443 HTTP/1.1\r\nHost: pipelined.test:443\r\n\r\n".to_vec();
    tls.write_tls(&mut request).unwrap();
    stream.write_all(&request).await.unwrap();

    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"));

    drive_tls(&mut tls, &mut stream, |tls| !tls.is_handshaking()).await;
    tls.writer()
        .write_all(b"GET /tunnel HTTP/1.1\r\nHost: pipelined.test\r\n\r\n")
        .unwrap();

    let mut plain = Vec::new();
    drive_tls(&mut tls, &mut stream, |tls| {
        // WouldBlock only means no more plaintext is buffered yet.
        let _ = tls.reader().read_to_end(&mut plain);
        plain.ends_with(b"pipelined.test /tunnel")
    })
    .await;
    assert!(String::from_utf8_lossy(&plain).starts_with("HTTP/1.1 200 OK"));

    proxy.serving.shutdown().await;
}

/// Tests a direct TLS connection with SNI.
#[tokio::test]
async fn direct_tls_with_sni() {
    let proxy = start().await;
    let stream = TcpStream::connect(proxy.https).await.unwrap();

    let mut tls = proxy
        .connector
        .connect(server_name("packages.test"), stream)
        .await
        .unwrap();
    let (_, body) = get(&mut tls, "packages.test", "/simple/").await;
    assert_eq!(body, "packages.test /simple/");

    proxy.serving.shutdown().await;
}

/// Tests that a client without SNI gets a certificate for the address it
/// connected to.
#[tokio::test]
async fn direct_tls_without_sni() {
    let proxy = start().await;
    let stream = TcpStream::connect(proxy.https).await.unwrap();

    let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut tls = proxy
        .connector
        .connect(ServerName::IpAddress(ip.into()), stream)
        .await
        .unwrap();
    let (_, body) = get(&mut tls, "127.0.0.1", "/").await;
    assert_eq!(body, "127.0.0.1 /");

    proxy.serving.shutdown().await;
}

/// Tests that binding an address already in use is reported.
#[tokio::test]
async fn bind_failure_is_fatal() {
    let proxy = start().await;

    let mut pem = Vec::new();
    ca::generate(&mut pem, "muzeum-test").unwrap();
    let authority = Arc::new(CertificateAuthority::load(&pem).unwrap());
    let taken = proxy.http.to_string();

    let err = ProxyListener::bind(authority, &taken, "127.0.0.1:0")
        .await
        .unwrap_err();
    assert!(matches!(err, muzeum::proxy::ProxyError::Bind { .. }));

    proxy.serving.shutdown().await;
}
