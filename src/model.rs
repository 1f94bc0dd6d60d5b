//! Registry data model: routes, backend instances and health bookkeeping.

use crate::error::RegistryError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lowest accepted route priority (evaluated first).
pub const MIN_PRIORITY: u32 = 1;
/// Highest accepted route priority.
pub const MAX_PRIORITY: u32 = 50_000;
/// Longest TTL a cached response may have, 2^31 seconds.
pub const MAX_CACHE_TTL_SECS: u64 = 1 << 31;
/// Longest health check interval or grace period, one day.
pub const MAX_PROBE_DELAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Highest accepted instance weight.
pub const MAX_WEIGHT: u32 = 1_000;
/// Longest accepted route name.
pub const MAX_NAME_LEN: usize = 64;
/// Longest accepted path pattern.
pub const MAX_PATTERN_LEN: usize = 128;

/// Stable identifier of a registered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(pub u64);

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a registered backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(InstanceId)
    }
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Exact,
    Prefix(String),
    Glob(Arc<Regex>),
}

/// A request path pattern.
///
/// `*` matches any run of characters (including `/`) and `?` matches exactly
/// one character. Patterns without wildcards match exactly; a single trailing
/// `*` is a plain prefix match. Anything else is compiled to an anchored regex
/// once, at parse time.
#[derive(Clone)]
pub struct PathPattern {
    raw: String,
    matcher: PathMatcher,
}

impl PathPattern {
    /// Parses and validates a pattern.
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        if raw.is_empty() {
            return Err(RegistryError::InvalidRoute(
                "path pattern must not be empty".to_string(),
            ));
        }
        if !raw.starts_with('/') {
            return Err(RegistryError::InvalidRoute(format!(
                "path pattern '{}' must start with '/'",
                raw
            )));
        }
        if raw.len() > MAX_PATTERN_LEN {
            return Err(RegistryError::InvalidRoute(format!(
                "path pattern exceeds {} characters",
                MAX_PATTERN_LEN
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RegistryError::InvalidRoute(format!(
                "path pattern '{}' contains whitespace or control characters",
                raw
            )));
        }

        let stars = raw.matches('*').count();
        let has_question = raw.contains('?');

        let matcher = if stars == 0 && !has_question {
            PathMatcher::Exact
        } else if stars == 1 && !has_question && raw.ends_with('*') {
            PathMatcher::Prefix(raw[..raw.len() - 1].to_string())
        } else {
            let mut expr = String::with_capacity(raw.len() + 8);
            expr.push('^');
            let mut literal = String::new();
            for c in raw.chars() {
                match c {
                    '*' | '?' => {
                        expr.push_str(&regex::escape(&literal));
                        literal.clear();
                        expr.push_str(if c == '*' { ".*" } else { "." });
                    }
                    _ => literal.push(c),
                }
            }
            expr.push_str(&regex::escape(&literal));
            expr.push('$');
            let regex = Regex::new(&expr).map_err(|e| {
                RegistryError::InvalidRoute(format!("path pattern '{}': {}", raw, e))
            })?;
            PathMatcher::Glob(Arc::new(regex))
        };

        Ok(Self {
            raw: raw.to_string(),
            matcher,
        })
    }

    /// Returns the pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Checks if the request path matches.
    pub fn matches(&self, path: &str) -> bool {
        match &self.matcher {
            PathMatcher::Exact => path == self.raw,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathMatcher::Glob(regex) => regex.is_match(path),
        }
    }
}

impl PartialEq for PathPattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PathPattern {}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathPattern").field(&self.raw).finish()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for PathPattern {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PathPattern> for String {
    fn from(pattern: PathPattern) -> Self {
        pattern.raw
    }
}

impl Serialize for PathPattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for PathPattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathPattern::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A header a request must carry to reach a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredHeader {
    /// Header name (case-insensitive).
    pub name: String,
    /// Exact expected value.
    pub value: String,
}

impl RequiredHeader {
    /// Creates a required header.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Checks that the name and value are valid HTTP header tokens.
    pub fn validate(&self) -> Result<(), RegistryError> {
        http::HeaderName::from_bytes(self.name.as_bytes()).map_err(|_| {
            RegistryError::InvalidRoute(format!("invalid header name '{}'", self.name))
        })?;
        http::HeaderValue::from_str(&self.value).map_err(|_| {
            RegistryError::InvalidRoute(format!("invalid value for header '{}'", self.name))
        })?;
        if self.value.is_empty() {
            return Err(RegistryError::InvalidRoute(format!(
                "value for header '{}' must not be empty",
                self.name
            )));
        }
        Ok(())
    }

    /// Returns true if the headers carry this header with the expected value.
    pub fn is_satisfied_by(&self, headers: &http::HeaderMap) -> bool {
        headers
            .get(self.name.as_str())
            .is_some_and(|v| v == self.value.as_str())
    }
}

/// Response caching behavior of a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CachePolicy {
    /// Never cache, always forward.
    Disabled,
    /// Cache using upstream `max-age` or the configured default TTL.
    #[default]
    Default,
    /// Cache with a fixed TTL.
    Custom {
        #[serde(rename = "ttlSecs", alias = "ttl_secs")]
        ttl_secs: u64,
    },
}

impl CachePolicy {
    /// Returns true unless caching is disabled.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CachePolicy::Disabled)
    }
}

/// Health check configuration of a route.
///
/// With no `path` the probe is a plain TCP connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// HTTP path to GET.
    pub path: Option<String>,
    /// Probe interval.
    #[serde(alias = "interval_ms")]
    pub interval_ms: u64,
    /// Probe timeout.
    #[serde(alias = "timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive successes before marking healthy.
    #[serde(alias = "healthy_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before marking unhealthy.
    #[serde(alias = "unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Probing is suppressed for this long after an instance registers.
    #[serde(alias = "grace_ms")]
    pub grace_ms: u64,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: None,
            interval_ms: 10_000,
            timeout_ms: 5_000,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            grace_ms: 0,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl HealthCheckSpec {
    /// Sets the HTTP probe path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Sets interval and timeout.
    pub fn with_timing(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval_ms = millis(interval);
        self.timeout_ms = millis(timeout);
        self
    }

    /// Sets the healthy and unhealthy thresholds.
    pub fn with_thresholds(mut self, healthy: u32, unhealthy: u32) -> Self {
        self.healthy_threshold = healthy;
        self.unhealthy_threshold = unhealthy;
        self
    }

    /// Sets the grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace_ms = millis(grace);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    /// Validates ranges and the probe path.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.interval_ms == 0 || self.timeout_ms == 0 {
            return Err(RegistryError::InvalidRoute(
                "health check interval and timeout must be greater than zero".to_string(),
            ));
        }
        if self.interval_ms > MAX_PROBE_DELAY_MS || self.grace_ms > MAX_PROBE_DELAY_MS {
            return Err(RegistryError::InvalidRoute(format!(
                "health check interval and grace must not exceed {} ms",
                MAX_PROBE_DELAY_MS
            )));
        }
        if self.timeout_ms > self.interval_ms {
            return Err(RegistryError::InvalidRoute(
                "health check timeout must not exceed the interval".to_string(),
            ));
        }
        if !(1..=10).contains(&self.healthy_threshold)
            || !(1..=10).contains(&self.unhealthy_threshold)
        {
            return Err(RegistryError::InvalidRoute(
                "health check thresholds must be between 1 and 10".to_string(),
            ));
        }
        if let Some(path) = &self.path {
            if !path.starts_with('/') || path.chars().any(char::is_whitespace) {
                return Err(RegistryError::InvalidRoute(format!(
                    "invalid health check path '{}'",
                    path
                )));
            }
        }
        Ok(())
    }
}

/// A named rule mapping a path pattern to a group of backend instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoute {
    /// Unique route name.
    pub name: String,
    /// Path pattern matched against the request path.
    #[serde(alias = "path_pattern")]
    pub path_pattern: PathPattern,
    /// Lower values are evaluated first.
    pub priority: u32,
    /// Header the request must carry.
    #[serde(default, alias = "required_header")]
    pub required_header: Option<RequiredHeader>,
    /// Response caching behavior.
    #[serde(default, alias = "cache_policy")]
    pub cache_policy: CachePolicy,
    /// Health check override; the configured defaults apply when absent.
    #[serde(default, alias = "health_check")]
    pub health_check: Option<HealthCheckSpec>,
    /// Prefix prepended to the forwarded path.
    #[serde(default, alias = "origin_path")]
    pub origin_path: Option<String>,
}

impl ServiceRoute {
    /// Creates a route with no header requirement and default caching.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        priority: u32,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            name: name.into(),
            path_pattern: PathPattern::parse(pattern)?,
            priority,
            required_header: None,
            cache_policy: CachePolicy::Default,
            health_check: None,
            origin_path: None,
        })
    }

    /// Requires the given header on matching requests.
    pub fn with_required_header(mut self, header: RequiredHeader) -> Self {
        self.required_header = Some(header);
        self
    }

    /// Sets the cache policy.
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets the health check.
    pub fn with_health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    /// Sets the origin path prefix.
    pub fn with_origin_path(mut self, origin_path: impl Into<String>) -> Self {
        self.origin_path = Some(origin_path.into());
        self
    }

    /// Validates the route shape.
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_name(&self.name)?;

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(RegistryError::InvalidRoute(format!(
                "priority {} outside {}..={}",
                self.priority, MIN_PRIORITY, MAX_PRIORITY
            )));
        }

        if let Some(header) = &self.required_header {
            header.validate()?;
        }

        if let CachePolicy::Custom { ttl_secs } = self.cache_policy {
            if ttl_secs == 0 || ttl_secs > MAX_CACHE_TTL_SECS {
                return Err(RegistryError::InvalidRoute(format!(
                    "custom cache ttl must be between 1 and {} seconds",
                    MAX_CACHE_TTL_SECS
                )));
            }
        }

        if let Some(spec) = &self.health_check {
            spec.validate()?;
        }

        if let Some(origin) = &self.origin_path {
            if !origin.starts_with('/')
                || origin.ends_with('/')
                || origin.chars().any(|c| c.is_whitespace() || c == '?' || c == '#')
            {
                return Err(RegistryError::InvalidRoute(format!(
                    "origin path '{}' must start with '/' and not end with '/'",
                    origin
                )));
            }
        }

        Ok(())
    }
}

/// Validates a route name: 1-64 characters of `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::InvalidRoute(
            "route name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidRoute(format!(
            "route name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RegistryError::InvalidRoute(format!(
            "route name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn default_weight() -> u32 {
    1
}

/// Registration request for a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// `host:port` of the backend.
    pub address: String,
    /// Relative selection weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl InstanceSpec {
    /// Creates a spec with weight 1.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            weight: default_weight(),
        }
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Validates the address and weight.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let (host, port) = self.address.rsplit_once(':').ok_or_else(|| {
            RegistryError::InvalidInstance(format!(
                "address '{}' must be host:port",
                self.address
            ))
        })?;
        if host.is_empty()
            || host
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '?' | '#'))
        {
            return Err(RegistryError::InvalidInstance(format!(
                "invalid host in address '{}'",
                self.address
            )));
        }
        match port.parse::<u16>() {
            Ok(p) if p != 0 => {}
            _ => {
                return Err(RegistryError::InvalidInstance(format!(
                    "invalid port in address '{}'",
                    self.address
                )))
            }
        }
        if !(1..=MAX_WEIGHT).contains(&self.weight) {
            return Err(RegistryError::InvalidInstance(format!(
                "weight {} outside 1..={}",
                self.weight, MAX_WEIGHT
            )));
        }
        Ok(())
    }
}

/// Liveness of a backend instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Registered, not yet proven healthy.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// Being removed; receives no new requests.
    Draining,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Draining => "draining",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts requests currently forwarded to an instance.
///
/// Shared by every snapshot copy of the same instance.
#[derive(Debug, Clone, Default)]
pub struct InflightCounter(Arc<AtomicUsize>);

impl InflightCounter {
    /// Marks a request as in flight until the guard is dropped.
    pub fn acquire(&self) -> InflightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InflightGuard(Arc::clone(&self.0))
    }

    /// Returns the number of requests in flight.
    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases one in-flight slot when dropped.
#[derive(Debug)]
pub struct InflightGuard(Arc<AtomicUsize>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One concrete endpoint serving a route.
#[derive(Debug, Clone)]
pub struct BackendInstance {
    pub id: InstanceId,
    /// Name of the owning route.
    pub route_name: String,
    pub address: String,
    pub weight: u32,
    pub health_state: HealthState,
    pub registered_at: Instant,
    pub last_probe_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub draining_since: Option<Instant>,
    pub inflight: InflightCounter,
}

impl BackendInstance {
    /// Creates an instance in the `unknown` state.
    pub fn new(id: InstanceId, route_name: impl Into<String>, spec: &InstanceSpec) -> Self {
        Self {
            id,
            route_name: route_name.into(),
            address: spec.address.clone(),
            weight: spec.weight,
            health_state: HealthState::Unknown,
            registered_at: Instant::now(),
            last_probe_at: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            draining_since: None,
            inflight: InflightCounter::default(),
        }
    }

    /// Returns true if the router may pick this instance.
    pub fn is_routable(&self) -> bool {
        self.health_state == HealthState::Healthy
    }

    /// Returns true while the instance is being removed.
    pub fn is_draining(&self) -> bool {
        self.health_state == HealthState::Draining
    }

    /// Marks the instance as draining.
    pub fn start_draining(&mut self, at: Instant) {
        self.health_state = HealthState::Draining;
        self.draining_since.get_or_insert(at);
    }

    /// Applies one probe result and returns the new state if it changed.
    ///
    /// At most one transition happens per probe. Draining instances only
    /// record the probe time.
    pub fn apply_probe(
        &mut self,
        success: bool,
        spec: &HealthCheckSpec,
        at: Instant,
    ) -> Option<HealthState> {
        self.last_probe_at = Some(at);
        if self.is_draining() {
            return None;
        }

        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.health_state != HealthState::Healthy
                && self.consecutive_successes >= spec.healthy_threshold
            {
                self.health_state = HealthState::Healthy;
                return Some(HealthState::Healthy);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.health_state != HealthState::Unhealthy
                && self.consecutive_failures >= spec.unhealthy_threshold
            {
                self.health_state = HealthState::Unhealthy;
                return Some(HealthState::Unhealthy);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn test_pattern_exact() {
        let p = PathPattern::parse("/health").unwrap();
        assert!(p.matches("/health"));
        assert!(!p.matches("/health/"));
        assert!(!p.matches("/healthz"));
    }

    #[test]
    fn test_pattern_trailing_star_is_prefix() {
        let p = PathPattern::parse("/auth/*").unwrap();
        assert!(p.matches("/auth/health"));
        assert!(p.matches("/auth/"));
        assert!(p.matches("/auth/a/b/c"));
        assert!(!p.matches("/auth"));
        assert!(!p.matches("/authx/health"));
    }

    #[test]
    fn test_pattern_catch_all() {
        let p = PathPattern::parse("/*").unwrap();
        assert!(p.matches("/"));
        assert!(p.matches("/anything/at/all"));
    }

    #[test]
    fn test_pattern_inner_wildcards() {
        let p = PathPattern::parse("/api/*/users/?").unwrap();
        assert!(p.matches("/api/v1/users/1"));
        assert!(p.matches("/api/v1/beta/users/x"));
        assert!(!p.matches("/api/v1/users/12"));
        assert!(!p.matches("/api/users/1"));
    }

    #[test]
    fn test_pattern_escapes_regex_metacharacters() {
        let p = PathPattern::parse("/files/*.tar.gz").unwrap();
        assert!(p.matches("/files/release.tar.gz"));
        assert!(!p.matches("/files/releaseXtarXgz"));
    }

    #[test]
    fn test_pattern_rejects_malformed() {
        assert!(PathPattern::parse("").is_err());
        assert!(PathPattern::parse("api/*").is_err());
        assert!(PathPattern::parse("/with space").is_err());
        assert!(PathPattern::parse(&format!("/{}", "a".repeat(MAX_PATTERN_LEN))).is_err());
    }

    #[test]
    fn test_pattern_serde_roundtrip_validates() {
        let p: PathPattern = serde_json::from_str("\"/gateway/*\"").unwrap();
        assert_eq!(p.as_str(), "/gateway/*");
        assert!(serde_json::from_str::<PathPattern>("\"gateway\"").is_err());
    }

    #[test]
    fn test_required_header_case_insensitive_name() {
        let header = RequiredHeader::new("X-Cloudfront-Access-Token", "secret");
        let mut headers = HeaderMap::new();
        headers.insert("x-cloudfront-access-token", HeaderValue::from_static("secret"));
        assert!(header.is_satisfied_by(&headers));

        headers.insert("x-cloudfront-access-token", HeaderValue::from_static("other"));
        assert!(!header.is_satisfied_by(&headers));
        assert!(!header.is_satisfied_by(&HeaderMap::new()));
    }

    #[test]
    fn test_route_validation() {
        let route = ServiceRoute::new("auth", "/auth/*", 11).unwrap();
        assert!(route.validate().is_ok());

        let bad_name = ServiceRoute::new("", "/x", 1).unwrap();
        assert!(matches!(
            bad_name.validate(),
            Err(RegistryError::InvalidRoute(_))
        ));

        let bad_chars = ServiceRoute::new("a b", "/x", 1).unwrap();
        assert!(bad_chars.validate().is_err());

        let bad_priority = ServiceRoute::new("p", "/x", 0).unwrap();
        assert!(bad_priority.validate().is_err());
        let bad_priority = ServiceRoute::new("p", "/x", MAX_PRIORITY + 1).unwrap();
        assert!(bad_priority.validate().is_err());

        let bad_header = ServiceRoute::new("h", "/x", 1)
            .unwrap()
            .with_required_header(RequiredHeader::new("bad header", "v"));
        assert!(bad_header.validate().is_err());

        let bad_origin = ServiceRoute::new("o", "/x", 1)
            .unwrap()
            .with_origin_path("/webapp/");
        assert!(bad_origin.validate().is_err());

        let zero_ttl = ServiceRoute::new("c", "/x", 1)
            .unwrap()
            .with_cache_policy(CachePolicy::Custom { ttl_secs: 0 });
        assert!(zero_ttl.validate().is_err());

        let huge_ttl = ServiceRoute::new("c", "/x", 1)
            .unwrap()
            .with_cache_policy(CachePolicy::Custom { ttl_secs: u64::MAX });
        assert!(huge_ttl.validate().is_err());

        let max_ttl = ServiceRoute::new("c", "/x", 1)
            .unwrap()
            .with_cache_policy(CachePolicy::Custom {
                ttl_secs: MAX_CACHE_TTL_SECS,
            });
        assert!(max_ttl.validate().is_ok());
    }

    #[test]
    fn test_route_deserializes_camel_case() {
        let json = r#"{
            "name": "api",
            "pathPattern": "/api/*",
            "priority": 20,
            "requiredHeader": {"name": "x-edge-token", "value": "t"},
            "cachePolicy": {"type": "custom", "ttlSecs": 30}
        }"#;
        let route: ServiceRoute = serde_json::from_str(json).unwrap();
        assert_eq!(route.path_pattern.as_str(), "/api/*");
        assert_eq!(route.cache_policy, CachePolicy::Custom { ttl_secs: 30 });
        assert!(route.health_check.is_none());
    }

    #[test]
    fn test_instance_spec_validation() {
        assert!(InstanceSpec::new("10.0.0.1:8080").validate().is_ok());
        assert!(InstanceSpec::new("backend.internal:80").validate().is_ok());
        assert!(InstanceSpec::new("[::1]:8080").validate().is_ok());
        assert!(InstanceSpec::new("10.0.0.1").validate().is_err());
        assert!(InstanceSpec::new(":8080").validate().is_err());
        assert!(InstanceSpec::new("host:0").validate().is_err());
        assert!(InstanceSpec::new("http://host:80").validate().is_err());
        assert!(InstanceSpec::new("host:80")
            .with_weight(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_health_check_validation() {
        assert!(HealthCheckSpec::default().validate().is_ok());
        let timeout_too_long = HealthCheckSpec::default()
            .with_timing(Duration::from_secs(1), Duration::from_secs(2));
        assert!(timeout_too_long.validate().is_err());
        let bad_threshold = HealthCheckSpec::default().with_thresholds(0, 3);
        assert!(bad_threshold.validate().is_err());
        let bad_path = HealthCheckSpec::default().with_path("health");
        assert!(bad_path.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let spec = HealthCheckSpec::default()
            .with_timing(Duration::MAX, Duration::from_secs(5))
            .with_grace(Duration::MAX);
        assert_eq!(spec.interval_ms, u64::MAX);
        assert_eq!(spec.grace_ms, u64::MAX);
        assert_eq!(spec.timeout(), Duration::from_secs(5));
        assert!(spec.validate().is_err());
    }

    fn instance() -> BackendInstance {
        BackendInstance::new(InstanceId(1), "api", &InstanceSpec::new("127.0.0.1:80"))
    }

    #[test]
    fn test_probe_transitions_to_healthy_after_threshold() {
        let spec = HealthCheckSpec::default().with_thresholds(3, 2);
        let mut inst = instance();
        let now = Instant::now();

        assert_eq!(inst.apply_probe(true, &spec, now), None);
        assert_eq!(inst.health_state, HealthState::Unknown);
        assert_eq!(inst.apply_probe(true, &spec, now), None);
        assert_eq!(inst.health_state, HealthState::Unknown);
        assert_eq!(
            inst.apply_probe(true, &spec, now),
            Some(HealthState::Healthy)
        );
        assert!(inst.is_routable());
        // Already healthy, no repeated transition.
        assert_eq!(inst.apply_probe(true, &spec, now), None);
    }

    #[test]
    fn test_probe_failure_resets_success_streak() {
        let spec = HealthCheckSpec::default().with_thresholds(2, 2);
        let mut inst = instance();
        let now = Instant::now();

        inst.apply_probe(true, &spec, now);
        inst.apply_probe(false, &spec, now);
        assert_eq!(inst.consecutive_successes, 0);
        assert_eq!(inst.consecutive_failures, 1);
        assert_eq!(inst.apply_probe(true, &spec, now), None);
        assert_eq!(
            inst.apply_probe(true, &spec, now),
            Some(HealthState::Healthy)
        );
    }

    #[test]
    fn test_probe_transitions_to_unhealthy_after_threshold() {
        let spec = HealthCheckSpec::default().with_thresholds(1, 3);
        let mut inst = instance();
        let now = Instant::now();
        inst.apply_probe(true, &spec, now);
        assert!(inst.is_routable());

        assert_eq!(inst.apply_probe(false, &spec, now), None);
        assert_eq!(inst.apply_probe(false, &spec, now), None);
        assert_eq!(
            inst.apply_probe(false, &spec, now),
            Some(HealthState::Unhealthy)
        );
        assert!(!inst.is_routable());
    }

    #[test]
    fn test_probe_ignored_while_draining() {
        let spec = HealthCheckSpec::default().with_thresholds(1, 1);
        let mut inst = instance();
        let now = Instant::now();
        inst.start_draining(now);
        assert_eq!(inst.apply_probe(true, &spec, now), None);
        assert_eq!(inst.health_state, HealthState::Draining);
        assert_eq!(inst.last_probe_at, Some(now));
    }

    #[test]
    fn test_inflight_guard_releases_on_drop() {
        let inst = instance();
        let copy = inst.clone();
        let guard = inst.inflight.acquire();
        assert_eq!(copy.inflight.current(), 1);
        drop(guard);
        assert_eq!(copy.inflight.current(), 0);
    }
}
