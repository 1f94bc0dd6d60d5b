//! TCP listener with HTTP/1.1 and HTTP/2 support.
//!
//! One listener type serves the gateway, the admin API and the redirect
//! service. TLS connections pick HTTP/1.1 or HTTP/2 via ALPN; cleartext
//! connections use HTTP/1.1, or HTTP/2 with prior knowledge (h2c).

use crate::body::ProxyBody;
use crate::connection::ConnectionLimiter;
use crate::error::{ProxyError, Result};
use crate::tls::HttpProtocol;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// HTTP listener that accepts connections and spawns one task per connection.
///
/// # Example
///
/// ```no_run
/// use rust_edgemesh::gateway::{EdgeGateway, GatewayConfig};
/// use rust_edgemesh::cache::ResponseCache;
/// use rust_edgemesh::listener::Listener;
/// use rust_edgemesh::registry::RegistryStore;
/// use rust_edgemesh::router::Router;
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (shutdown_tx, _) = broadcast::channel(1);
///     let router = Arc::new(Router::new(RegistryStore::default(), Duration::from_secs(30)));
///     let cache = Arc::new(ResponseCache::new(Default::default()));
///     let gateway = EdgeGateway::new(router, cache, GatewayConfig::default())?;
///     let listener = Listener::bind("127.0.0.1:3000", gateway).await?;
///     listener.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener<S> {
    tcp_listener: TcpListener,
    service: S,
    addr: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    default_protocol: HttpProtocol,
    limiter: Option<ConnectionLimiter>,
}

impl<S> Listener<S>
where
    S: Service<Request<Incoming>, Response = Response<ProxyBody>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    async fn bind_tcp(addr: &str) -> Result<(TcpListener, SocketAddr)> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| ProxyError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        Ok((tcp_listener, local_addr))
    }

    /// Binds a cleartext HTTP/1.1 listener.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(service))]
    pub async fn bind(addr: &str, service: S) -> Result<Self> {
        let (tcp_listener, local_addr) = Self::bind_tcp(addr).await?;
        info!("bound to {} (HTTP/1.1)", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
            tls_acceptor: None,
            default_protocol: HttpProtocol::Http1,
            limiter: None,
        })
    }

    /// Binds a TLS listener negotiating `protocol` via ALPN.
    #[instrument(level = "info", skip(service, acceptor))]
    pub async fn bind_with_tls(
        addr: &str,
        service: S,
        acceptor: TlsAcceptor,
        protocol: HttpProtocol,
    ) -> Result<Self> {
        let (tcp_listener, local_addr) = Self::bind_tcp(addr).await?;
        info!("bound to {} (TLS with {:?} support)", local_addr, protocol);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
            tls_acceptor: Some(acceptor),
            default_protocol: protocol,
            limiter: None,
        })
    }

    /// Binds with HTTP/2 prior knowledge (h2c).
    #[instrument(level = "info", skip(service))]
    pub async fn bind_h2c(addr: &str, service: S) -> Result<Self> {
        let (tcp_listener, local_addr) = Self::bind_tcp(addr).await?;
        info!("bound to {} (h2c - HTTP/2 cleartext)", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
            tls_acceptor: None,
            default_protocol: HttpProtocol::Http2,
            limiter: None,
        })
    }

    /// Caps concurrent connections. Connections over the limit are closed
    /// right after accept.
    pub fn with_connection_limit(mut self, limiter: ConnectionLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn default_protocol(&self) -> HttpProtocol {
        self.default_protocol
    }

    /// Serves incoming connections until a shutdown signal is received.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let guard = match &self.limiter {
                                Some(limiter) => match limiter.try_acquire() {
                                    Some(guard) => Some(guard),
                                    None => {
                                        drop(stream);
                                        continue;
                                    }
                                },
                                None => None,
                            };

                            debug!("accepted connection from {}", peer_addr);
                            let service = self.service.clone();
                            let tls_acceptor = self.tls_acceptor.clone();
                            let default_protocol = self.default_protocol;

                            tokio::spawn(async move {
                                let _guard = guard;
                                let result = match tls_acceptor {
                                    Some(acceptor) => {
                                        Self::handle_tls_connection(stream, service, acceptor).await
                                    }
                                    None if default_protocol == HttpProtocol::Http2 => {
                                        Self::serve_http2(TokioIo::new(stream), service).await
                                    }
                                    None => Self::serve_http1(TokioIo::new(stream), service).await,
                                };

                                if let Err(e) = result {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn handle_tls_connection(
        stream: TcpStream,
        service: S,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;

        let protocol = {
            let (_, server_conn) = tls_stream.get_ref();
            HttpProtocol::from_alpn(server_conn.alpn_protocol())
        };
        debug!("negotiated protocol: {:?}", protocol);

        match protocol {
            HttpProtocol::Http2 => Self::serve_http2(TokioIo::new(tls_stream), service).await,
            _ => Self::serve_http1(TokioIo::new(tls_stream), service).await,
        }
    }

    async fn serve_http1<I>(io: TokioIo<I>, service: S) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }

    async fn serve_http2<I>(io: TokioIo<I>, service: S) -> Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http2::Builder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(ProxyError::Http)
    }
}
