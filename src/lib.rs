//! Artifact registry gateway.
//!
//! The gateway terminates TLS for any host its clients ask for, using leaf
//! certificates signed on demand by a local root CA, and mirrors upstream
//! package repositories behind a storage-backed cache.
//!
//! # Architecture
//!
//! - [`ca::CertificateAuthority`] signs and caches leaf certificates per
//!   server name or address.
//! - [`proxy::ProxyListener`] accepts plain HTTP and TLS. `CONNECT` requests
//!   on the plain port are hijacked and re-enter the TLS path, so tunneled
//!   and direct TLS clients reach the same handler.
//! - [`cache::ReadThroughCache`] stores immutable artifacts on first use;
//!   [`cache::Resource`] revalidates mutable index files with ETags.
//! - [`mirror::Mirror`] routes requests to configured upstreams.
//!
//! # Example
//!
//! ```no_run
//! use muzeum::{Gateway, GatewayConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = GatewayConfig::load("config.yaml")?;
//! Gateway::new(config).run().await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod cache;
pub mod config;
pub mod mirror;
pub mod proxy;
pub mod storage;

pub use config::{ConfigError, GatewayConfig};

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use ca::CertificateAuthority;
use cache::HttpClient;
use mirror::Mirror;
use proxy::ProxyListener;

/// Wires the configured authority, storage and repositories to the proxy.
#[derive(Debug)]
pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serves until either listener fails or the process is interrupted.
    pub async fn run(self) -> Result<()> {
        let pem = self.config.certificate.read();
        let authority = CertificateAuthority::load(&pem).with_context(|| {
            format!(
                "failed to load CA from {:?} and {:?}",
                self.config.certificate.crt, self.config.certificate.key
            )
        })?;

        let storage = self.config.storage.build();
        info!("using {} storage", storage.name());

        let client: Arc<dyn HttpClient> = Arc::new(reqwest::Client::new());
        let mirror = Mirror::new(&self.config.repositories, storage, client);
        info!("mirroring {} repositories", self.config.repositories.len());

        let listen = &self.config.listen;
        let listener = ProxyListener::bind(Arc::new(authority), &listen.http, &listen.https)
            .await
            .context("failed to start proxy")?;
        let mut serving = listener.serve(mirror);

        let result = tokio::select! {
            err = serving.wait() => Err(anyhow::Error::new(err).context("proxy stopped")),
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for interrupt")?;
                info!("shutting down");
                Ok(())
            }
        };

        serving.shutdown().await;
        result
    }
}
