//! Edge gateway service: header gate, response cache and forwarding.

use crate::body::{self, ProxyBody};
use crate::cache::{self, CacheKey, CachedResponse, ResponseCache};
use crate::error::{ProxyError, Result};
use crate::metrics::Metrics;
use crate::model::InflightGuard;
use crate::router::{RouteTarget, Router};
use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tower::Service;
use tracing::{debug, info, instrument, warn};

const X_CACHE: &str = "x-cache";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Shared secret the gateway attaches to every forwarded request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeToken {
    pub header: String,
    pub value: String,
}

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bound on waiting for backend response headers.
    pub request_timeout: Duration,
    /// Largest request body that is buffered and forwarded.
    pub max_body_bytes: usize,
    pub edge_token: Option<EdgeToken>,
    /// Value sent as `x-forwarded-proto`.
    pub forwarded_proto: &'static str,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 10 * 1024 * 1024,
            edge_token: None,
            forwarded_proto: "http",
        }
    }
}

/// Response body that keeps the instance's in-flight slot until the body
/// has been fully streamed or dropped.
struct TrackedBody {
    inner: Incoming,
    _guard: InflightGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Edge gateway implementing `tower::Service`.
///
/// For each request it replaces any client-supplied copy of the edge token
/// with the configured one, asks the [`Router`] for a backend, serves
/// cacheable reads from the [`ResponseCache`] and forwards everything else.
/// A backend timeout is retried once on another healthy instance.
#[derive(Clone)]
pub struct EdgeGateway {
    router: Arc<Router>,
    cache: Arc<ResponseCache>,
    client: Client<HttpConnector, Full<Bytes>>,
    edge_token: Option<(HeaderName, HeaderValue)>,
    config: Arc<GatewayConfig>,
}

impl EdgeGateway {
    /// Creates a gateway.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidConfig` if the edge token is not a valid
    /// header name and value.
    pub fn new(
        router: Arc<Router>,
        cache: Arc<ResponseCache>,
        config: GatewayConfig,
    ) -> Result<Self> {
        let edge_token = match &config.edge_token {
            Some(token) => {
                let name = HeaderName::from_bytes(token.header.as_bytes()).map_err(|e| {
                    ProxyError::InvalidConfig(format!("edge token header '{}': {}", token.header, e))
                })?;
                let mut value = HeaderValue::from_str(&token.value).map_err(|e| {
                    ProxyError::InvalidConfig(format!("edge token value: {}", e))
                })?;
                value.set_sensitive(true);
                Some((name, value))
            }
            None => None,
        };

        Ok(Self {
            router,
            cache,
            client: Client::builder(TokioExecutor::new()).build_http(),
            edge_token,
            config: Arc::new(config),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let method = req.method().to_string();
        let (mut parts, body) = req.into_parts();

        if let Some((name, value)) = &self.edge_token {
            parts.headers.remove(name);
            parts.headers.insert(name.clone(), value.clone());
        }

        let target = match self.router.route(parts.uri.path(), &parts.headers) {
            Ok(target) => target,
            Err(e) => {
                let status = e.status_code();
                debug!(path = %parts.uri.path(), error = %e, "routing failed");
                Metrics::record_request(&method, status.as_u16(), "none", start.elapsed().as_secs_f64());
                return body::text(status, &e.to_string());
            }
        };
        let mut route_name = target.route.name.clone();

        let mut cache_key = if target.route.cache_policy.is_enabled()
            && cache::is_cacheable_method(&parts.method)
        {
            let key = self.cache.key(
                &route_name,
                target.revision,
                &parts.method,
                &parts.uri,
                &parts.headers,
            );
            if let Some(hit) = self.cache.get(&key) {
                Metrics::record_cache_lookup(&route_name, "hit");
                Metrics::record_request(&method, hit.status.as_u16(), &route_name, start.elapsed().as_secs_f64());
                debug!(route = %route_name, "cache hit");
                return Self::cached_response(&hit, "HIT");
            }
            Metrics::record_cache_lookup(&route_name, "miss");
            Some(key)
        } else {
            Metrics::record_cache_lookup(&route_name, "bypass");
            None
        };

        let request_body = match Limited::new(body, self.config.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                let status = if e.downcast_ref::<LengthLimitError>().is_some() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                warn!(route = %route_name, error = %e, "failed to read request body");
                Metrics::record_request(&method, status.as_u16(), &route_name, start.elapsed().as_secs_f64());
                return body::text(status, "Invalid request body");
            }
        };

        let target = if self.router.admits(&target) {
            target
        } else {
            debug!(route = %route_name, upstream = %target.instance.address, "instance left rotation while reading the request, rerouting");
            let previous = (target.route_id, target.revision);
            drop(target);
            match self.router.route(parts.uri.path(), &parts.headers) {
                Ok(target) => {
                    if (target.route_id, target.revision) != previous {
                        cache_key = None;
                    }
                    route_name = target.route.name.clone();
                    target
                }
                Err(e) => {
                    let status = e.status_code();
                    debug!(path = %parts.uri.path(), error = %e, "rerouting failed");
                    Metrics::record_request(&method, status.as_u16(), &route_name, start.elapsed().as_secs_f64());
                    return body::text(status, &e.to_string());
                }
            }
        };

        let host = parts
            .headers
            .get(header::HOST)
            .cloned()
            .or_else(|| {
                parts
                    .uri
                    .authority()
                    .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            });
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(self.config.forwarded_proto),
        );
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }

        let outbound = Outbound {
            method: parts.method,
            uri: parts.uri,
            headers,
            body: request_body,
        };

        let mut target = target;
        let mut result = self.forward(&target, &outbound).await;
        if matches!(result, Err(ProxyError::BackendTimeout { .. })) {
            if let Some(other) = self.router.select_other(&target) {
                warn!(route = %route_name, from = %target.instance.address, to = %other.instance.address, "backend timed out, retrying on another instance");
                target = other;
                result = self.forward(&target, &outbound).await;
            }
        }

        let upstream = target.instance.address.clone();
        let response = match result {
            Ok(response) => self.finish(target, response, cache_key).await,
            Err(e) => {
                let status = match &e {
                    ProxyError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                };
                warn!(route = %route_name, error = %e, "forwarding failed");
                body::text(status, status.canonical_reason().unwrap_or("Bad Gateway"))
            }
        };

        let status = response.status().as_u16();
        let duration = start.elapsed().as_secs_f64();
        info!(
            method = %method,
            status = status,
            route = %route_name,
            upstream = %upstream,
            duration_ms = duration * 1000.0,
            "request completed"
        );
        Metrics::record_request(&method, status, &route_name, duration);
        response
    }

    /// Sends one attempt to the target instance.
    #[instrument(level = "debug", skip_all, fields(upstream = %target.instance.address))]
    async fn forward(
        &self,
        target: &RouteTarget,
        outbound: &Outbound,
    ) -> Result<Response<Incoming>> {
        let address = &target.instance.address;
        let uri = build_upstream_uri(address, target.route.origin_path.as_deref(), &outbound.uri)?;

        let mut req = Request::new(Full::new(outbound.body.clone()));
        *req.method_mut() = outbound.method.clone();
        *req.uri_mut() = uri;
        *req.headers_mut() = outbound.headers.clone();

        debug!("forwarding to {}", req.uri());

        match timeout(self.config.request_timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(ProxyError::BackendUnavailable {
                address: address.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ProxyError::BackendTimeout {
                address: address.clone(),
                duration_ms: u64::try_from(self.config.request_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    /// Turns a backend response into the client response, storing it in the
    /// cache when allowed.
    async fn finish(
        &self,
        target: RouteTarget,
        response: Response<Incoming>,
        cache_key: Option<CacheKey>,
    ) -> Response<ProxyBody> {
        let (mut parts, incoming) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let ttl = cache_key.as_ref().and_then(|_| {
            (parts.status == StatusCode::OK)
                .then(|| {
                    cache::ttl_for(
                        &target.route.cache_policy,
                        &parts.headers,
                        self.cache.config().default_ttl(),
                    )
                })
                .flatten()
        });

        match (cache_key, ttl) {
            (Some(key), Some(ttl)) => {
                let bytes = match incoming.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        warn!(upstream = %target.instance.address, error = %e, "failed to read backend body");
                        return body::text(StatusCode::BAD_GATEWAY, "Bad Gateway");
                    }
                };
                drop(target);

                let cached = CachedResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body: bytes,
                };
                let response = Self::cached_response(&cached, "MISS");
                self.cache.insert(key, cached, ttl);
                response
            }
            (key, _) => {
                if key.is_some() {
                    parts
                        .headers
                        .insert(X_CACHE, HeaderValue::from_static("MISS"));
                }
                let body = TrackedBody {
                    inner: incoming,
                    _guard: target.into_guard(),
                }
                .boxed();
                Response::from_parts(parts, body)
            }
        }
    }

    fn cached_response(cached: &CachedResponse, state: &'static str) -> Response<ProxyBody> {
        let mut response = Response::new(body::full(cached.body.clone()));
        *response.status_mut() = cached.status;
        *response.headers_mut() = cached.headers.clone();
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static(state));
        response
    }
}

/// Request parts replayable across attempts.
struct Outbound {
    method: http::Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

/// Builds `http://{address}{origin_path}{path_and_query}`.
pub fn build_upstream_uri(address: &str, origin_path: Option<&str>, original: &Uri) -> Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}{}{}", address, origin_path.unwrap_or(""), path_and_query);
    uri.parse().map_err(|e| ProxyError::BackendUnavailable {
        address: address.to_string(),
        reason: format!("failed to build upstream URI: {}", e),
    })
}

/// Removes connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

impl<B> Service<Request<B>> for EdgeGateway
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    #[instrument(level = "debug", skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    fn call(&mut self, req: Request<B>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_upstream_uri() {
        let original: Uri = "/auth/health?deep=1".parse().unwrap();
        let uri = build_upstream_uri("10.0.0.1:8080", None, &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/auth/health?deep=1");

        let uri = build_upstream_uri("10.0.0.1:8080", Some("/webapp"), &original).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:8080/webapp/auth/health?deep=1");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::ACCEPT));
    }

    #[test]
    fn test_invalid_edge_token_rejected() {
        let registry = crate::registry::RegistryStore::default();
        let router = Arc::new(Router::new(registry, Duration::from_secs(30)));
        let cache = Arc::new(ResponseCache::new(Default::default()));
        let config = GatewayConfig {
            edge_token: Some(EdgeToken {
                header: "bad header".to_string(),
                value: "v".to_string(),
            }),
            ..Default::default()
        };
        assert!(matches!(
            EdgeGateway::new(router, cache, config),
            Err(ProxyError::InvalidConfig(_))
        ));
    }
}
