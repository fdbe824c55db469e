//! TLS-terminating front end.
//!
//! [`ProxyListener`] accepts plain HTTP on one port and TLS on another.
//! `CONNECT` requests on the plain port are answered in place and their
//! sockets re-enter the TLS path, so tunneled and direct TLS connections
//! are served identically with certificates signed per server name.

mod listener;
mod server;
mod tls;

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::ca::CaError;
use crate::storage::ByteStream;

pub use listener::{ACCEPT_QUEUE_CAPACITY, Connection, Injector, MergedListener};
pub use server::{ProxyListener, Serving};
pub use tls::TlsAcceptor;

/// Body type produced by request handlers.
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("listener closed")]
    Closed,
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("failed to configure TLS: {0}")]
    TlsConfig(#[from] rustls::Error),
    #[error("failed to obtain certificate: {0}")]
    Certificate(#[from] CaError),
    #[error("malformed CONNECT request")]
    MalformedConnect,
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handles one decrypted (or plain) HTTP request.
///
/// Any `Fn(Request<Incoming>) -> impl Future<Output = Response<ResponseBody>>`
/// closure is a handler.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<ResponseBody>> + Send + 'static,
{
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody> {
        (self)(request).await
    }
}

/// A body holding `bytes`.
pub fn full(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// A body streaming from `reader` until EOF.
pub fn stream(reader: ByteStream) -> ResponseBody {
    StreamBody::new(ReaderStream::new(reader).map_ok(Frame::data)).boxed_unsync()
}
