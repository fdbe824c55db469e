//! TLS termination with certificates signed per connection.

use std::sync::Arc;

use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio_rustls::LazyConfigAcceptor;
use tokio_rustls::server::TlsStream;
use tracing::debug;

use super::{Connection, ProxyError};
use crate::ca::CertificateAuthority;

/// TLS acceptor that reads the ClientHello, obtains a certificate for the
/// requested server name and completes the handshake with it.
#[derive(Clone)]
pub struct TlsAcceptor {
    authority: Arc<CertificateAuthority>,
    provider: Arc<CryptoProvider>,
}

impl TlsAcceptor {
    pub fn new(authority: Arc<CertificateAuthority>) -> Self {
        Self {
            authority,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        }
    }

    /// Performs the handshake on `stream`.
    ///
    /// Without SNI the certificate is issued for the local address the
    /// client connected to. Returns the TLS stream and the SNI, if any.
    pub async fn accept(
        &self,
        stream: Connection,
    ) -> Result<(TlsStream<Connection>, Option<String>), ProxyError> {
        let local_ip = stream.local_addr()?.ip();

        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(ProxyError::TlsHandshake)?;
        let sni = start.client_hello().server_name().map(str::to_owned);

        let authority = Arc::clone(&self.authority);
        let name = sni.clone().unwrap_or_default();
        // Key generation is CPU bound; keep it off the reactor.
        let key = tokio::task::spawn_blocking(move || authority.sign(&name, Some(local_ip)))
            .await
            .map_err(std::io::Error::other)??;

        let tls_stream = start
            .into_stream(self.server_config(key)?)
            .await
            .map_err(ProxyError::TlsHandshake)?;

        debug!("TLS handshake completed, SNI: {:?}", sni);

        Ok((tls_stream, sni))
    }

    fn server_config(&self, key: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>, ProxyError> {
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SignedCertResolver { key }));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

/// Serves the certificate signed for this connection's ClientHello.
struct SignedCertResolver {
    key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SignedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SignedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}
