//! Serving loops for the plaintext and TLS sides of the proxy.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{Connection, Injector, MergedListener};
use super::tls::TlsAcceptor;
use super::{ProxyError, RequestHandler, ResponseBody, empty};
use crate::ca::CertificateAuthority;

/// Response written on the raw socket once a CONNECT is accepted.
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\n\n";
const CONNECT_PREFIX: &[u8] = b"CONNECT ";
/// Upper bound for a CONNECT request head read off the raw socket.
const MAX_CONNECT_HEAD: usize = 8 * 1024;
const PEEK_RETRY_INTERVAL: Duration = Duration::from_millis(5);
const PEEK_ATTEMPTS: usize = 200;

/// The bound plaintext and TLS ports, ready to serve.
#[derive(Debug)]
pub struct ProxyListener {
    http: TcpListener,
    merged: Arc<MergedListener>,
    acceptor: TlsAcceptor,
}

impl ProxyListener {
    /// Binds the plaintext listener on `http_addr` and the TLS listener on
    /// `https_addr`. Either bind failing is fatal.
    pub async fn bind(
        authority: Arc<CertificateAuthority>,
        http_addr: &str,
        https_addr: &str,
    ) -> Result<Self, ProxyError> {
        let http = bind(http_addr).await?;
        let https = bind(https_addr).await?;
        let merged = Arc::new(MergedListener::new(https)?);

        info!(
            "proxy listening on {} (http) and {} (https)",
            http.local_addr()?,
            merged.local_addr()
        );

        Ok(Self {
            http,
            merged,
            acceptor: TlsAcceptor::new(authority),
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.http.local_addr()?)
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.merged.local_addr()
    }

    pub fn merged(&self) -> &Arc<MergedListener> {
        &self.merged
    }

    /// Starts serving both ports with `handler`.
    pub fn serve<H: RequestHandler>(self, handler: H) -> Serving {
        let handler = Arc::new(handler);
        let shutdown = CancellationToken::new();
        let (errors_tx, errors) = mpsc::channel(2);

        let plaintext = tokio::spawn(serve_plaintext(
            self.http,
            self.merged.injector(),
            Arc::clone(&handler),
            shutdown.clone(),
            errors_tx.clone(),
        ));
        let tls = tokio::spawn(serve_tls(
            Arc::clone(&self.merged),
            self.acceptor,
            handler,
            shutdown.clone(),
            errors_tx,
        ));

        Serving {
            errors,
            merged: self.merged,
            shutdown,
            tasks: vec![plaintext, tls],
        }
    }
}

/// Binds `addr`; a bare `:port` means all IPv4 interfaces.
async fn bind(addr: &str) -> Result<TcpListener, ProxyError> {
    let resolved = match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => addr.to_string(),
    };
    TcpListener::bind(resolved.as_str())
        .await
        .map_err(|source| ProxyError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Handle to the running serving tasks.
#[derive(Debug)]
pub struct Serving {
    errors: mpsc::Receiver<ProxyError>,
    merged: Arc<MergedListener>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Serving {
    /// Waits for the first fatal error of either serving task.
    pub async fn wait(&mut self) -> ProxyError {
        self.errors.recv().await.unwrap_or(ProxyError::Closed)
    }

    /// Closes the merged listener and stops both serving tasks. Connections
    /// already being served run to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.merged.close();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("serving task failed: {}", e);
            }
        }
    }
}

async fn serve_plaintext<H: RequestHandler>(
    listener: TcpListener,
    injector: Injector,
    handler: Arc<H>,
    shutdown: CancellationToken,
    errors: mpsc::Sender<ProxyError>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                let _ = errors.send(ProxyError::Accept(e)).await;
                return;
            }
        };
        debug!("accepted connection from {}", peer_addr);

        let injector = injector.clone();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(e) = handle_plaintext(stream, injector, handler).await {
                debug!("connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn serve_tls<H: RequestHandler>(
    merged: Arc<MergedListener>,
    acceptor: TlsAcceptor,
    handler: Arc<H>,
    shutdown: CancellationToken,
    errors: mpsc::Sender<ProxyError>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = merged.accept() => accepted,
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                if !shutdown.is_cancelled() {
                    let _ = errors.send(e).await;
                }
                return;
            }
        };

        let acceptor = acceptor.clone();
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let peer_addr = stream.peer_addr().ok();
            if let Err(e) = handle_tls(stream, acceptor, handler).await {
                debug!("TLS connection error from {:?}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_tls<H: RequestHandler>(
    stream: Connection,
    acceptor: TlsAcceptor,
    handler: Arc<H>,
) -> Result<(), ProxyError> {
    let (tls_stream, sni) = acceptor.accept(stream).await?;
    debug!("serving TLS connection for {:?}", sni);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    ServerBuilder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(ProxyError::Http)
}

/// Serves one plaintext connection. A connection opening with CONNECT is
/// answered on the raw socket and handed to the TLS side; anything else is
/// served as HTTP/1.
async fn handle_plaintext<H: RequestHandler>(
    mut stream: TcpStream,
    injector: Injector,
    handler: Arc<H>,
) -> Result<(), ProxyError> {
    if starts_with_connect(&stream).await? {
        let target = read_connect_head(&mut stream).await?;
        debug!("CONNECT {}", target);

        stream.write_all(CONNECT_ESTABLISHED).await?;
        stream.flush().await?;
        if !injector.push(stream).await {
            debug!("dropping tunnel to {}: listener closed", target);
        }
        return Ok(());
    }

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let injector = injector.clone();
        async move {
            if req.method() == Method::CONNECT {
                return Ok::<_, Infallible>(hijack(req, injector));
            }
            Ok(handler.handle(req).await)
        }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .map_err(|e| ProxyError::Http(Box::new(e)))
}

/// Takes over a connection that sent CONNECT after earlier requests.
fn hijack(req: Request<Incoming>, injector: Injector) -> Response<ResponseBody> {
    let target = req.uri().to_string();
    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!("CONNECT {} upgrade failed: {}", target, e);
                return;
            }
        };
        let parts = match upgraded.downcast::<TokioIo<TcpStream>>() {
            Ok(parts) => parts,
            Err(_) => {
                debug!("dropping tunnel to {}: unexpected transport", target);
                return;
            }
        };
        // Bytes the client sent past the CONNECT head, usually its ClientHello.
        let conn = Connection::with_prefix(parts.io.into_inner(), parts.read_buf);
        if !injector.push(conn).await {
            debug!("dropping tunnel to {}: listener closed", target);
        }
    });
    Response::new(empty())
}

/// Peeks until the first bytes either match or rule out `CONNECT `.
async fn starts_with_connect(stream: &TcpStream) -> Result<bool, ProxyError> {
    let mut buf = [0u8; CONNECT_PREFIX.len()];
    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        if n == 0 || buf[..n] != CONNECT_PREFIX[..n] {
            return Ok(false);
        }
        if n == CONNECT_PREFIX.len() {
            return Ok(true);
        }
        tokio::time::sleep(PEEK_RETRY_INTERVAL).await;
    }
    Ok(false)
}

/// Consumes the CONNECT request head byte by byte so that nothing after
/// it is read, and returns the request target.
async fn read_connect_head(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut head = Vec::with_capacity(256);
    while !(head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n")) {
        if head.len() >= MAX_CONNECT_HEAD {
            return Err(ProxyError::MalformedConnect);
        }
        head.push(stream.read_u8().await?);
    }

    let text = String::from_utf8_lossy(&head);
    text.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
        .ok_or(ProxyError::MalformedConnect)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn serving() -> (Serving, Arc<MergedListener>) {
        let mut pem = Vec::new();
        crate::ca::generate(&mut pem, "muzeum-test").unwrap();
        let authority = Arc::new(CertificateAuthority::load(&pem).unwrap());
        let listener = ProxyListener::bind(authority, "127.0.0.1:0", "127.0.0.1:0")
            .await
            .unwrap();
        let merged = Arc::clone(listener.merged());
        let serving = listener.serve(|_req: Request<Incoming>| async { Response::new(empty()) });
        (serving, merged)
    }

    async fn connected() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap());
        let (client, server) = tokio::join!(client, listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    /// Tests detecting CONNECT split across two writes.
    #[tokio::test]
    async fn detects_connect_split_across_writes() {
        let (mut client, server) = connected().await;
        client.write_all(b"CON").await.unwrap();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write_all(b"NECT host:443 HTTP/1.1\r\n\r\n").await.unwrap();
            client
        });

        assert!(starts_with_connect(&server).await.unwrap());
        drop(writer.await.unwrap());
    }

    /// Tests that other methods and closed sockets are not CONNECT.
    #[tokio::test]
    async fn other_methods_are_not_connect() {
        let (mut client, server) = connected().await;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(!starts_with_connect(&server).await.unwrap());

        let (client, server) = connected().await;
        drop(client);
        assert!(!starts_with_connect(&server).await.unwrap());
    }

    /// Tests that bytes after the CONNECT head stay on the socket.
    #[tokio::test]
    async fn connect_head_is_consumed_exactly() {
        let (mut client, mut server) = connected().await;
        client
            .write_all(b"CONNECT registry.test:443 HTTP/1.1\nHost: registry.test:443\n\n\x16\x03")
            .await
            .unwrap();

        assert_eq!(
            read_connect_head(&mut server).await.unwrap(),
            "registry.test:443"
        );
        let mut rest = [0u8; 2];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0x16, 0x03]);
    }

    /// Tests that an oversized CONNECT head is rejected.
    #[tokio::test]
    async fn oversized_connect_head_is_rejected() {
        let (mut client, mut server) = connected().await;
        let mut head = b"CONNECT a:443 HTTP/1.1\r\n".to_vec();
        head.extend(std::iter::repeat_n(b'x', MAX_CONNECT_HEAD));
        client.write_all(&head).await.unwrap();

        assert!(matches!(
            read_connect_head(&mut server).await,
            Err(ProxyError::MalformedConnect)
        ));
    }

    /// Tests that a TLS-port accept failure ends serving with that failure.
    #[tokio::test]
    async fn accept_failure_reaches_wait() {
        let (mut serving, merged) = serving().await;

        merged.fail(&std::io::Error::other("too many open files"));
        let err = tokio::time::timeout(Duration::from_secs(5), serving.wait())
            .await
            .unwrap();
        match err {
            ProxyError::Accept(e) => assert_eq!(e.to_string(), "too many open files"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(merged.accept().await, Err(ProxyError::Accept(_))));

        serving.shutdown().await;
    }

    /// Tests that a listener closed outside of shutdown is reported as closed.
    #[tokio::test]
    async fn closed_listener_reaches_wait() {
        let (mut serving, merged) = serving().await;

        merged.close();
        let err = tokio::time::timeout(Duration::from_secs(5), serving.wait())
            .await
            .unwrap();
        assert!(matches!(err, ProxyError::Closed));

        serving.shutdown().await;
    }
}
