//! ETag-revalidated cache of a single upstream URL.

use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use http::header::{ETAG, IF_NONE_MATCH};
use http::{HeaderValue, Request, StatusCode};
use tokio::io::AsyncReadExt;
use tracing::debug;

use super::{FetchError, HttpClient};
use crate::storage::ByteStream;

/// Result of [`Resource::get`].
pub struct Fetched {
    pub body: ByteStream,
    /// False when the upstream confirmed the cached body is current.
    pub updated: bool,
}

impl fmt::Debug for Fetched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("updated", &self.updated)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    etag: Option<HeaderValue>,
    body: Bytes,
}

/// A mutable upstream file, such as a repository index.
///
/// Freshness is decided by the origin: every `get` issues a conditional
/// request and the cached body is only served on `304 Not Modified`.
pub struct Resource {
    client: Arc<dyn HttpClient>,
    url: String,
    state: RwLock<Snapshot>,
}

impl Resource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Arc::new(reqwest::Client::new()), url)
    }

    pub fn with_client(client: Arc<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            state: RwLock::new(Snapshot::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn get(&self) -> Result<Fetched, FetchError> {
        let known = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut request = Request::get(self.url.as_str()).body(())?;
        if let Some(etag) = &known.etag {
            request.headers_mut().insert(IF_NONE_MATCH, etag.clone());
        }

        let response = self.client.send(request).await?;

        match response.status() {
            StatusCode::NOT_MODIFIED if known.etag.is_some() => {
                debug!("{} not modified", self.url);
                Ok(Fetched {
                    body: Box::pin(Cursor::new(known.body)),
                    updated: false,
                })
            }
            StatusCode::OK => {
                let Some(etag) = response.headers().get(ETAG).cloned() else {
                    debug!("{} has no ETag, not caching", self.url);
                    *self.state.write().unwrap_or_else(PoisonError::into_inner) =
                        Snapshot::default();
                    return Ok(Fetched {
                        body: response.into_body(),
                        updated: true,
                    });
                };

                let mut buffer = Vec::new();
                response.into_body().read_to_end(&mut buffer).await?;
                let body = Bytes::from(buffer);

                debug!("cached {} bytes of {} at {:?}", body.len(), self.url, etag);
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = Snapshot {
                    etag: Some(etag),
                    body: body.clone(),
                };

                Ok(Fetched {
                    body: Box::pin(Cursor::new(body)),
                    updated: true,
                })
            }
            status => Err(FetchError::Status { status }),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}
