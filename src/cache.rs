//! Bounded TTL response cache for routes with caching enabled.

use crate::model::{CachePolicy, MAX_CACHE_TTL_SECS};
use bytes::Bytes;
use http::header::{HeaderName, CACHE_CONTROL};
use http::{HeaderMap, Method, StatusCode, Uri};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of stored responses.
    pub max_entries: usize,
    /// TTL for `default` policy responses without `max-age`.
    pub default_ttl_secs: u64,
    /// Request headers that take part in the cache key.
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            default_ttl_secs: 60,
            vary_headers: vec!["accept".to_string(), "accept-encoding".to_string()],
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Identifies one cached response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

/// A stored upstream response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
struct Entry {
    response: Arc<CachedResponse>,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Response cache shared by all gateway connections.
#[derive(Debug)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    vary: Vec<HeaderName>,
    config: CacheConfig,
}

/// Only safe, idempotent reads are cached.
pub fn is_cacheable_method(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Returns how long a response may be stored, or `None` if it must not be.
///
/// `no-store`, `no-cache` and `private` are never stored. A `custom` policy
/// uses its own TTL; `default` prefers `s-maxage`, then `max-age`, then the
/// configured default.
pub fn ttl_for(policy: &CachePolicy, headers: &HeaderMap, default_ttl: Duration) -> Option<Duration> {
    let mut max_age = None;
    let mut s_maxage = None;

    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            return None;
        };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.split_once('=') {
                Some(("max-age", secs)) => max_age = delta_seconds(secs),
                Some(("s-maxage", secs)) => s_maxage = delta_seconds(secs),
                None if matches!(directive.as_str(), "no-store" | "no-cache" | "private") => {
                    return None
                }
                _ => {}
            }
        }
    }

    let ttl = match policy {
        CachePolicy::Disabled => return None,
        CachePolicy::Custom { ttl_secs } => Duration::from_secs(*ttl_secs),
        CachePolicy::Default => s_maxage
            .or(max_age)
            .map(Duration::from_secs)
            .unwrap_or(default_ttl),
    };

    let ttl = ttl.min(Duration::from_secs(MAX_CACHE_TTL_SECS));
    (!ttl.is_zero()).then_some(ttl)
}

/// Parses a `Cache-Control` delta-seconds value. Values too large to
/// represent are capped at [`MAX_CACHE_TTL_SECS`].
fn delta_seconds(value: &str) -> Option<u64> {
    let value = value.trim_matches('"');
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(
        value
            .parse::<u64>()
            .map_or(MAX_CACHE_TTL_SECS, |secs| secs.min(MAX_CACHE_TTL_SECS)),
    )
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let vary = config
            .vary_headers
            .iter()
            .filter_map(|name| match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    warn!(header = %name, "ignoring invalid cache vary header");
                    None
                }
            })
            .collect();
        Self {
            entries: Mutex::new(HashMap::new()),
            vary,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Builds the key for a request. The route revision is part of the key,
    /// so replacing a route definition orphans its old entries.
    pub fn key(
        &self,
        route: &str,
        revision: u64,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> CacheKey {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut key = format!("{}\u{1f}{}\u{1f}{}\u{1f}{}", route, revision, method, path_and_query);
        for name in &self.vary {
            key.push('\u{1f}');
            if let Some(value) = headers.get(name) {
                key.push_str(&String::from_utf8_lossy(value.as_bytes()));
            }
        }
        CacheKey(key)
    }

    /// Returns a fresh entry. Expired entries are dropped on access.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CachedResponse>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(Arc::clone(&entry.response)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Stores a response for `ttl`, evicting expired entries first and then
    /// the oldest ones when full.
    pub fn insert(&self, key: CacheKey, response: CachedResponse, ttl: Duration) {
        if self.config.max_entries == 0 {
            return;
        }
        let now = Instant::now();
        let Some(expires_at) = now.checked_add(ttl) else {
            debug!(ttl_secs = ttl.as_secs(), "ttl out of range, not caching");
            return;
        };
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            entries.retain(|_, e| e.expires_at > now);
            while entries.len() >= self.config.max_entries {
                let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                debug!("evicting oldest cache entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            Entry {
                response: Arc::new(response),
                inserted_at: now,
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn cached(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        }
    }

    fn key(cache: &ResponseCache, path: &str) -> CacheKey {
        let uri: Uri = path.parse().unwrap();
        cache.key("api", 1, &Method::GET, &uri, &HeaderMap::new())
    }

    #[test]
    fn test_ttl_from_policy_and_headers() {
        let default_ttl = Duration::from_secs(60);
        let mut headers = HeaderMap::new();
        assert_eq!(
            ttl_for(&CachePolicy::Default, &headers, default_ttl),
            Some(default_ttl)
        );

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=5"));
        assert_eq!(
            ttl_for(&CachePolicy::Default, &headers, default_ttl),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            ttl_for(&CachePolicy::Custom { ttl_secs: 30 }, &headers, default_ttl),
            Some(Duration::from_secs(30))
        );

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=5, s-maxage=9"));
        assert_eq!(
            ttl_for(&CachePolicy::Default, &headers, default_ttl),
            Some(Duration::from_secs(9))
        );

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        assert_eq!(ttl_for(&CachePolicy::Default, &headers, default_ttl), None);

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=60"));
        assert_eq!(
            ttl_for(&CachePolicy::Custom { ttl_secs: 30 }, &headers, default_ttl),
            None
        );

        assert_eq!(
            ttl_for(&CachePolicy::Disabled, &HeaderMap::new(), default_ttl),
            None
        );
    }

    #[test]
    fn test_huge_max_age_is_capped() {
        let cap = Some(Duration::from_secs(MAX_CACHE_TTL_SECS));
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("max-age=18446744073709551615"),
        );
        assert_eq!(ttl_for(&CachePolicy::Default, &headers, Duration::ZERO), cap);

        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("s-maxage=99999999999999999999999"),
        );
        assert_eq!(ttl_for(&CachePolicy::Default, &headers, Duration::ZERO), cap);

        assert_eq!(
            ttl_for(
                &CachePolicy::Custom { ttl_secs: u64::MAX },
                &HeaderMap::new(),
                Duration::ZERO
            ),
            cap
        );
        assert_eq!(
            ttl_for(&CachePolicy::Default, &HeaderMap::new(), Duration::MAX),
            cap
        );

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=-5"));
        assert_eq!(
            ttl_for(&CachePolicy::Default, &headers, Duration::from_secs(7)),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_insert_with_unrepresentable_ttl_is_skipped() {
        let cache = ResponseCache::new(CacheConfig::default());
        let forever = key(&cache, "/forever");
        let capped = key(&cache, "/capped");

        cache.insert(forever.clone(), cached("forever"), Duration::MAX);
        assert!(cache.get(&forever).is_none());

        cache.insert(
            capped.clone(),
            cached("capped"),
            Duration::from_secs(MAX_CACHE_TTL_SECS),
        );
        assert_eq!(&cache.get(&capped).unwrap().body[..], b"capped");
    }

    #[test]
    fn test_key_includes_revision_and_vary_headers() {
        let cache = ResponseCache::new(CacheConfig::default());
        let uri: Uri = "/a?x=1".parse().unwrap();
        let mut headers = HeaderMap::new();

        let k1 = cache.key("api", 1, &Method::GET, &uri, &headers);
        let k2 = cache.key("api", 2, &Method::GET, &uri, &headers);
        assert_ne!(k1, k2);

        headers.insert("accept", HeaderValue::from_static("application/json"));
        let k3 = cache.key("api", 1, &Method::GET, &uri, &headers);
        assert_ne!(k1, k3);

        // Headers outside the vary list do not matter.
        headers.insert("user-agent", HeaderValue::from_static("curl"));
        assert_eq!(k3, cache.key("api", 1, &Method::GET, &uri, &headers));

        assert_ne!(k1, cache.key("api", 1, &Method::HEAD, &uri, &HeaderMap::new()));
    }

    #[test]
    fn test_get_and_expiry() {
        let cache = ResponseCache::new(CacheConfig::default());
        let fresh = key(&cache, "/fresh");
        let stale = key(&cache, "/stale");

        cache.insert(fresh.clone(), cached("fresh"), Duration::from_secs(60));
        cache.insert(stale.clone(), cached("stale"), Duration::ZERO);

        assert_eq!(&cache.get(&fresh).unwrap().body[..], b"fresh");
        assert!(cache.get(&stale).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_evicts_oldest() {
        let cache = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        let a = key(&cache, "/a");
        let b = key(&cache, "/b");
        let c = key(&cache, "/c");

        cache.insert(a.clone(), cached("a"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(b.clone(), cached("b"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(c.clone(), cached("c"), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn test_cacheable_methods() {
        assert!(is_cacheable_method(&Method::GET));
        assert!(is_cacheable_method(&Method::HEAD));
        assert!(!is_cacheable_method(&Method::POST));
    }
}
