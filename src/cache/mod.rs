//! Caches that shield slow upstream package sources.
//!
//! [`ReadThroughCache`] persists immutable artifacts into a storage driver;
//! [`Resource`] keeps the last body of a single mutable URL in memory and
//! revalidates it with `If-None-Match`.

mod client;
mod read_through;
mod resource;

use http::StatusCode;
use thiserror::Error;

use crate::storage::StorageError;

pub use client::{HttpClient, fetch};
pub use read_through::ReadThroughCache;
pub use resource::{Fetched, Resource};

#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream answered with a status the caller cannot use.
    #[error("upstream responded {status}")]
    Status { status: StatusCode },
    #[error("invalid upstream request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("failed to read upstream body: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl FetchError {
    /// The upstream status code, for errors that carry one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests the status error's code and message.
    #[test]
    fn status_error_carries_code_and_reason() {
        let err = FetchError::Status {
            status: StatusCode::NOT_FOUND,
        };
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(err.to_string(), "upstream responded 404 Not Found");

        let io = FetchError::from(std::io::Error::other("reset"));
        assert_eq!(io.status(), None);
    }
}
