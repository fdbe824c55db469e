//! Request handler mirroring upstream package repositories.
//!
//! Each repository is routed by optional host and path prefix. Index files
//! named in `revalidate` change in place upstream and go through a
//! [`Resource`]; every other file is treated as immutable and stored through
//! a [`ReadThroughCache`] under the repository's own storage directory.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use http::header::{ALLOW, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use tracing::{debug, warn};

use crate::cache::{FetchError, HttpClient, ReadThroughCache, Resource, fetch};
use crate::config::RepositoryConfig;
use crate::proxy::{RequestHandler, ResponseBody, empty, full, stream};
use crate::storage::{DirectoryDriver, StorageDriver, validate_path};

/// Response header telling whether a revalidated file changed upstream.
pub const X_CACHE: &str = "x-cache";

struct Repository {
    name: String,
    host: Option<String>,
    prefix: String,
    upstream: String,
    revalidate: HashSet<String>,
    cache: ReadThroughCache,
    resources: RwLock<HashMap<String, Arc<Resource>>>,
}

impl Repository {
    /// Returns the part of `path` below this repository's prefix.
    fn relative<'a>(&self, host: Option<&str>, path: &'a str) -> Option<&'a str> {
        if let Some(expected) = &self.host
            && !host.is_some_and(|host| host.eq_ignore_ascii_case(expected))
        {
            return None;
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }

    fn upstream_url(&self, relative: &str) -> String {
        format!("{}{}", self.upstream, relative)
    }

    fn resource(&self, client: &Arc<dyn HttpClient>, relative: &str) -> Arc<Resource> {
        if let Some(resource) = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(relative)
        {
            return Arc::clone(resource);
        }

        let mut resources = self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let resource = resources.entry(relative.to_string()).or_insert_with(|| {
            Arc::new(Resource::with_client(
                Arc::clone(client),
                self.upstream_url(relative),
            ))
        });
        Arc::clone(resource)
    }
}

/// Routes requests to configured upstream repositories.
pub struct Mirror {
    repositories: Vec<Repository>,
    client: Arc<dyn HttpClient>,
}

impl Mirror {
    pub fn new(
        repositories: &[RepositoryConfig],
        storage: Arc<dyn StorageDriver>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        let repositories = repositories
            .iter()
            .map(|repo| Repository {
                name: repo.name.clone(),
                host: repo.host.clone(),
                prefix: repo.path.trim_end_matches('/').to_string(),
                upstream: repo.upstream.trim_end_matches('/').to_string(),
                revalidate: repo.revalidate.iter().cloned().collect(),
                cache: ReadThroughCache::new(Arc::new(DirectoryDriver::new(
                    &repo.name,
                    Arc::clone(&storage),
                ))),
                resources: RwLock::new(HashMap::new()),
            })
            .collect();

        Self {
            repositories,
            client,
        }
    }

    /// Picks the repository with the longest matching prefix.
    fn route<'a>(&self, host: Option<&str>, path: &'a str) -> Option<(&Repository, &'a str)> {
        self.repositories
            .iter()
            .filter_map(|repo| Some((repo, repo.relative(host, path)?)))
            .max_by_key(|(repo, _)| (repo.host.is_some(), repo.prefix.len()))
    }

    /// Serves one request. Only the method, host and path are used.
    pub async fn respond<B>(&self, request: &Request<B>) -> Response<ResponseBody> {
        let method = request.method();
        if method != Method::GET && method != Method::HEAD {
            let mut response = status_response(StatusCode::METHOD_NOT_ALLOWED);
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let host = request_host(request);
        let path = request.uri().path();
        let Some((repo, relative)) = self.route(host.as_deref(), path) else {
            debug!("no repository for {:?} {}", host, path);
            return status_response(StatusCode::NOT_FOUND);
        };
        if validate_path(relative).is_err() {
            return status_response(StatusCode::NOT_FOUND);
        }

        debug!("{} {} via {}", method, relative, repo.name);
        let result = if is_revalidated(repo, relative) {
            self.revalidated(repo, relative).await
        } else {
            self.cached(repo, relative).await
        };

        let mut response = match result {
            Ok(response) => response,
            Err(e) => error_response(&repo.name, relative, e),
        };
        if method == Method::HEAD {
            *response.body_mut() = empty();
        }
        response
    }

    async fn revalidated(
        &self,
        repo: &Repository,
        relative: &str,
    ) -> Result<Response<ResponseBody>, FetchError> {
        let fetched = repo.resource(&self.client, relative).get().await?;
        let mut response = Response::new(stream(fetched.body));
        let state = if fetched.updated {
            "fetched"
        } else {
            "revalidated"
        };
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(state));
        Ok(response)
    }

    async fn cached(
        &self,
        repo: &Repository,
        relative: &str,
    ) -> Result<Response<ResponseBody>, FetchError> {
        let url = repo.upstream_url(relative);
        let body = repo
            .cache
            .read(relative, || fetch(self.client.as_ref(), &url))
            .await?;
        Ok(Response::new(stream(body)))
    }
}

#[async_trait]
impl RequestHandler for Mirror {
    async fn handle(&self, request: Request<Incoming>) -> Response<ResponseBody> {
        // Mirrored requests carry no body worth reading.
        let (parts, _body) = request.into_parts();
        self.respond(&Request::from_parts(parts, ())).await
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.repositories.iter().map(|r| r.name.as_str()).collect();
        f.debug_struct("Mirror")
            .field("repositories", &names)
            .finish_non_exhaustive()
    }
}

fn is_revalidated(repo: &Repository, relative: &str) -> bool {
    relative
        .rsplit('/')
        .next()
        .is_some_and(|name| repo.revalidate.contains(name))
}

/// Host from the request target, else from the `Host` header, without port.
fn request_host<B>(request: &Request<B>) -> Option<String> {
    if let Some(host) = request.uri().host() {
        return Some(host.to_string());
    }
    let header = request.headers().get(HOST)?.to_str().ok()?;
    Some(strip_port(header).to_string())
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => authority,
    }
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// Upstream statuses pass through; anything else is a bad gateway.
fn error_response(repo: &str, relative: &str, error: FetchError) -> Response<ResponseBody> {
    match error.status() {
        Some(status) => {
            debug!("{}{}: upstream responded {}", repo, relative, status);
            status_response(status)
        }
        None => {
            warn!("{}{}: {}", repo, relative, error);
            let mut response = Response::new(full(error.to_string()));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            response
        }
    }
}
