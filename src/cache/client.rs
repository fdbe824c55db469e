//! HTTP client capability used to reach upstream repositories.

use async_trait::async_trait;
use futures::TryStreamExt;
use http::{Request, Response};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::FetchError;
use crate::storage::ByteStream;

/// Sends one request and returns the response with a streaming body.
///
/// Implemented for [`reqwest::Client`]; tests substitute their own.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: Request<()>) -> Result<Response<ByteStream>, FetchError>;
}

#[async_trait]
impl HttpClient for reqwest::Client {
    async fn send(&self, request: Request<()>) -> Result<Response<ByteStream>, FetchError> {
        let (parts, ()) = request.into_parts();
        debug!("{} {}", parts.method, parts.uri);

        let upstream = self
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .send()
            .await
            .map_err(|e| FetchError::Transport(Box::new(e)))?;

        let status = upstream.status();
        let version = upstream.version();
        let headers = upstream.headers().clone();
        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let body: ByteStream = Box::pin(StreamReader::new(stream));

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.version_mut() = version;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Unconditional GET of `url`; any non-2xx status becomes
/// [`FetchError::Status`].
pub async fn fetch(client: &dyn HttpClient, url: &str) -> Result<ByteStream, FetchError> {
    let request = Request::get(url).body(())?;
    let response = client.send(request).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status { status });
    }
    Ok(response.into_body())
}
