//! Plain HTTP service that redirects every request to HTTPS.

use crate::body::{self, ProxyBody};
use http::header::{HeaderValue, HOST, LOCATION};
use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::debug;

#[derive(Clone)]
pub struct RedirectService {
    /// Used when the request carries no `Host`.
    public_hostname: Arc<str>,
}

impl RedirectService {
    pub fn new(public_hostname: impl Into<Arc<str>>) -> Self {
        Self {
            public_hostname: public_hostname.into(),
        }
    }

    fn location<B>(&self, req: &Request<B>) -> String {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .map(strip_port)
            .filter(|h| !h.is_empty())
            .unwrap_or(&*self.public_hostname);
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("https://{}{}", host, path_and_query)
    }
}

/// Drops a `:port` suffix, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map(|end| &host[..=end]).unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

impl<B> Service<Request<B>> for RedirectService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let location = self.location(&req);
        debug!(location = %location, "redirecting to https");

        let response = match HeaderValue::from_str(&location) {
            Ok(value) => {
                let mut response = body::text(StatusCode::MOVED_PERMANENTLY, "Moved Permanently");
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => body::text(StatusCode::BAD_REQUEST, "Bad Request"),
        };
        ready(Ok(response))
    }
}
