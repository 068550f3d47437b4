//! HTTPS server that obtains its certificates on demand
//!
//! Each connection's ClientHello is read before any TLS configuration is
//! chosen. The certificate selector then supplies the certificate for the
//! requested host name, the handshake completes with it, and the decrypted
//! stream is served by the configured router over HTTP/1.1 or HTTP/2.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ServerBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::crypto::{ring, CryptoProvider};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info};
use vpki_cert::{ClientHelloInfo, SignerCapability};

use crate::cache::CacheConfig;
use crate::clock::Clock;
use crate::error::CertSelectionError;
use crate::metrics::CertErrorCounter;
use crate::selector::CertificateSelector;

#[derive(Debug, Error)]
pub enum TlsServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Certificate selection failed: {0}")]
    CertificateError(#[from] CertSelectionError),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("TLS handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    pub bind_addr: SocketAddr,
    pub cache: CacheConfig,
    /// Protocols offered through ALPN, most preferred first
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Limit on reading the ClientHello and on completing the handshake
    pub handshake_timeout: Duration,
}

impl Default for TlsServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 443)),
            cache: CacheConfig::default(),
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Hands rustls the certificate chosen before the handshake started
///
/// `None` makes rustls abort the handshake with a fatal alert.
#[derive(Debug)]
struct SelectedCertificate(Option<Arc<CertifiedKey>>);

impl ResolvesServerCert for SelectedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.clone()
    }
}

/// State shared by every connection task
struct ConnectionContext {
    selector: CertificateSelector,
    provider: Arc<CryptoProvider>,
    alpn_protocols: Vec<Vec<u8>>,
    handshake_timeout: Duration,
}

impl ConnectionContext {
    fn server_config(
        &self,
        key: Option<Arc<CertifiedKey>>,
    ) -> Result<Arc<ServerConfig>, TlsServerError> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsServerError::TlsError(e.to_string()))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(SelectedCertificate(key)));
        config.alpn_protocols = self.alpn_protocols.clone();
        Ok(Arc::new(config))
    }
}

pub struct TlsServer {
    config: TlsServerConfig,
    selector: CertificateSelector,
}

impl TlsServer {
    /// Create a server whose certificates come from `signer`
    pub fn new(config: TlsServerConfig, signer: SignerCapability) -> Self {
        let selector = CertificateSelector::new(signer, config.cache.clone());
        Self { config, selector }
    }

    /// Like `new`, judging certificate freshness against `clock`
    pub fn with_clock(
        config: TlsServerConfig,
        signer: SignerCapability,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let selector = CertificateSelector::with_clock(signer, config.cache.clone(), clock);
        Self { config, selector }
    }

    /// Report certificate selection failures to `errors`
    pub fn with_error_counter(mut self, errors: Arc<dyn CertErrorCounter>) -> Self {
        self.selector = self.selector.with_error_counter(errors);
        self
    }

    pub fn config(&self) -> &TlsServerConfig {
        &self.config
    }

    pub fn selector(&self) -> &CertificateSelector {
        &self.selector
    }

    /// Bind the configured address and serve `router` until the listener fails
    pub async fn serve(self, router: Router) -> Result<(), TlsServerError> {
        info!("TLS server starting on {}", self.config.bind_addr);

        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                let port = self.config.bind_addr.port();
                let address = self.config.bind_addr.ip().to_string();
                let reason = e.to_string();
                TlsServerError::BindError {
                    address,
                    port,
                    reason,
                }
            })?;

        self.serve_listener(listener, router).await
    }

    /// Serve `router` on an already bound listener
    pub async fn serve_listener(
        self,
        listener: TcpListener,
        router: Router,
    ) -> Result<(), TlsServerError> {
        let local_addr = listener.local_addr()?;
        info!("TLS server listening on {}", local_addr);

        let context = Arc::new(ConnectionContext {
            selector: self.selector,
            provider: Arc::new(ring::default_provider()),
            alpn_protocols: self.config.alpn_protocols,
            handshake_timeout: self.config.handshake_timeout,
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let context = context.clone();
                    let router = router.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, peer_addr, context, router).await
                        {
                            debug!("TLS connection error from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("TLS listener accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        context: Arc<ConnectionContext>,
        router: Router,
    ) -> Result<(), TlsServerError> {
        debug!("New TLS connection from {}", peer_addr);

        let timeout = context.handshake_timeout;

        let start = tokio::time::timeout(
            timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| TlsServerError::HandshakeTimeout(timeout))??;
        let hello = ClientHelloInfo::from_client_hello(&start.client_hello());

        let key = match context.selector.select(&hello).await {
            Ok(key) => key,
            Err(e) => {
                // Finish the handshake without a certificate so the client
                // receives an alert rather than a closed socket
                let tls_config = context.server_config(None)?;
                let _ = tokio::time::timeout(timeout, start.into_stream(tls_config)).await;
                return Err(e.into());
            }
        };
        let tls_config = context.server_config(Some(key))?;

        let tls_stream = tokio::time::timeout(timeout, start.into_stream(tls_config))
            .await
            .map_err(|_| TlsServerError::HandshakeTimeout(timeout))?
            .map_err(|e| TlsServerError::TlsError(format!("Handshake failed: {}", e)))?;

        debug!(
            "TLS handshake completed for {} (SNI: {})",
            peer_addr,
            hello.server_name()
        );

        ServerBuilder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(router))
            .await
            .map_err(|e| TlsServerError::HttpError(e.to_string()))
    }
}

/// Listen on `addr` and serve `handler` over TLS with certificates from `signer`
pub async fn listen_and_serve_tls(
    addr: SocketAddr,
    handler: Router,
    signer: SignerCapability,
) -> Result<(), TlsServerError> {
    let config = TlsServerConfig {
        bind_addr: addr,
        ..Default::default()
    };
    TlsServer::new(config, signer).serve(handler).await
}
