//! Accept queue shared by the TLS port and hijacked CONNECT sockets.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProxyError;

/// Connections that may wait in the merged queue. A full queue stalls both
/// TLS-port accepts and CONNECT hand-offs.
pub const ACCEPT_QUEUE_CAPACITY: usize = 5;

/// A queued socket, plus any bytes already read off it before the hand-off.
///
/// Reads return the buffered bytes first, then continue on the socket.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    prefix: Bytes,
}

impl Connection {
    pub fn with_prefix(stream: TcpStream, prefix: Bytes) -> Self {
        Self { stream, prefix }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

impl From<TcpStream> for Connection {
    fn from(stream: TcpStream) -> Self {
        Self::with_prefix(stream, Bytes::new())
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Close signal shared by the listener, its forwarder and injectors.
#[derive(Debug, Default)]
struct CloseState {
    token: CancellationToken,
    /// Kind and message of the accept error that closed the listener.
    failure: OnceLock<(io::ErrorKind, String)>,
}

impl CloseState {
    fn fail(&self, error: &io::Error) {
        let _ = self.failure.set((error.kind(), error.to_string()));
        self.token.cancel();
    }

    /// The error every `accept` returns once closed.
    fn error(&self) -> ProxyError {
        match self.failure.get() {
            Some((kind, message)) => ProxyError::Accept(io::Error::new(*kind, message.clone())),
            None => ProxyError::Closed,
        }
    }
}

/// Pushes raw sockets into a [`MergedListener`].
#[derive(Debug, Clone)]
pub struct Injector {
    sender: mpsc::Sender<Connection>,
    state: Arc<CloseState>,
}

impl Injector {
    /// Queues `conn` for the TLS path. Returns false, dropping the
    /// connection, when the listener is closed.
    pub async fn push(&self, conn: impl Into<Connection>) -> bool {
        if self.state.token.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.state.token.cancelled() => false,
            sent = self.sender.send(conn.into()) => sent.is_ok(),
        }
    }
}

/// Merges connections accepted on the TLS port with injected ones.
///
/// Both sources are indistinguishable to [`accept`](Self::accept).
#[derive(Debug)]
pub struct MergedListener {
    local_addr: SocketAddr,
    receiver: Mutex<mpsc::Receiver<Connection>>,
    injector: Injector,
}

impl MergedListener {
    /// Takes ownership of `listener` and forwards its connections into the
    /// queue from a background task until closed or an accept fails.
    pub fn new(listener: TcpListener) -> Result<Self, ProxyError> {
        let local_addr = listener.local_addr()?;
        let (sender, receiver) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let injector = Injector {
            sender,
            state: Arc::new(CloseState::default()),
        };

        tokio::spawn(forward(listener, injector.clone()));

        Ok(Self {
            local_addr,
            receiver: Mutex::new(receiver),
            injector,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    /// Waits for the next connection.
    ///
    /// After a TLS-port accept failure every call returns that failure as
    /// [`ProxyError::Accept`]; after [`close`](Self::close) it returns
    /// [`ProxyError::Closed`].
    pub async fn accept(&self) -> Result<Connection, ProxyError> {
        let state = &self.injector.state;
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = state.token.cancelled() => Err(state.error()),
            conn = receiver.recv() => conn.ok_or_else(|| state.error()),
        }
    }

    /// Stops accepting on the TLS port and fails all further `accept` calls.
    pub fn close(&self) {
        self.injector.state.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.injector.state.token.is_cancelled()
    }

    /// Closes the listener as if the TLS port had failed with `error`.
    #[cfg(test)]
    pub(crate) fn fail(&self, error: &io::Error) {
        self.injector.state.fail(error);
    }
}

impl Drop for MergedListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn forward(listener: TcpListener, injector: Injector) {
    let local_addr = listener.local_addr().ok();
    loop {
        let accepted = tokio::select! {
            _ = injector.state.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                debug!("accepted TLS connection from {}", peer);
                if !injector.push(conn).await {
                    break;
                }
            }
            Err(e) => {
                warn!("TLS listener failed: {}", e);
                injector.state.fail(&e);
                break;
            }
        }
    }
    if let Some(addr) = local_addr {
        debug!("TLS listener on {} stopped", addr);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    async fn bound() -> MergedListener {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        MergedListener::new(listener).unwrap()
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap());
        let (client, server) = tokio::join!(client, listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    /// Tests that connections to the TLS port come out of `accept`.
    #[tokio::test]
    async fn accepts_direct_connections() {
        let merged = bound().await;
        let client = TcpStream::connect(merged.local_addr()).await.unwrap();

        let accepted = merged.accept().await.unwrap();
        assert_eq!(accepted.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    /// Tests that injected sockets come out of `accept`.
    #[tokio::test]
    async fn accepts_injected_connections() {
        let merged = bound().await;
        let (client, server) = socket_pair().await;

        assert!(merged.injector().push(server).await);
        let accepted = merged.accept().await.unwrap();
        assert_eq!(accepted.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    /// Tests that pushes block once the queue holds its full capacity.
    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let merged = bound().await;
        let injector = merged.injector();
        let mut clients = Vec::new();

        for _ in 0..ACCEPT_QUEUE_CAPACITY {
            let (client, server) = socket_pair().await;
            clients.push(client);
            assert!(injector.push(server).await);
        }

        let (_client, server) = socket_pair().await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), injector.push(server)).await;
        assert!(blocked.is_err());

        merged.accept().await.unwrap();
        let (_client, server) = socket_pair().await;
        assert!(injector.push(server).await);
    }

    /// Tests that closing fails `accept`, refuses pushes and releases the port.
    #[tokio::test]
    async fn close_stops_accept_and_push() {
        let merged = bound().await;
        let addr = merged.local_addr();
        let injector = merged.injector();

        merged.close();
        assert!(merged.is_closed());
        assert!(matches!(merged.accept().await, Err(ProxyError::Closed)));

        let (_client, server) = socket_pair().await;
        assert!(!injector.push(server).await);

        // The forwarder drops the TLS-port listener once it observes the close.
        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused);
    }

    /// Tests that a TLS-port failure closes the listener and is reported by
    /// every later `accept`.
    #[tokio::test]
    async fn accept_failure_is_reported() {
        let merged = bound().await;
        let injector = merged.injector();

        merged.fail(&io::Error::other("too many open files"));
        assert!(merged.is_closed());

        for _ in 0..2 {
            match merged.accept().await {
                Err(ProxyError::Accept(e)) => assert_eq!(e.to_string(), "too many open files"),
                other => panic!("unexpected accept result: {:?}", other.map(|_| ())),
            }
        }

        let (_client, server) = socket_pair().await;
        assert!(!injector.push(server).await);
    }

    /// Tests that bytes read before a hand-off are replayed ahead of the
    /// socket.
    #[tokio::test]
    async fn buffered_prefix_is_read_first() {
        let (mut client, server) = socket_pair().await;
        let mut conn = Connection::with_prefix(server, Bytes::from_static(b"hello "));

        client.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 11];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        conn.write_all(b"ack").await.unwrap();
        let mut ack = [0u8; 3];
        client.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"ack");
    }
}
