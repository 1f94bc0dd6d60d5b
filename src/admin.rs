//! Admin/control API: JSON CRUD over the registry plus health and metrics.
//!
//! | Method | Path | Result |
//! |---|---|---|
//! | `GET` | `/health` | 200 |
//! | `GET` | `/metrics` | Prometheus text |
//! | `GET` | `/routes` | all routes with instances |
//! | `POST` | `/routes` | 201, 409 if the name exists |
//! | `GET` | `/routes/{name}` | 200 or 404 |
//! | `PUT` | `/routes/{name}` | 201 created, 200 replaced, 409 on conflict |
//! | `DELETE` | `/routes/{name}` | 202 drain scheduled, or 404 |
//! | `POST` | `/routes/{name}/instances` | 201 or 404 |
//! | `DELETE` | `/instances/{id}[?force=true]` | 202 (200 when forced), or 404 |
//! | `PUT` | `/instances/{id}/health` | 200 |
//!
//! Every write is applied to the registry before the response is sent.

use crate::body::{self, ProxyBody};
use crate::error::RegistryError;
use crate::metrics::Metrics;
use crate::model::{
    BackendInstance, CachePolicy, HealthCheckSpec, HealthState, InstanceId, InstanceSpec, RouteId,
    ServiceRoute,
};
use crate::registry::{RegistryStore, RouteEntry};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, info, warn};

/// Largest accepted admin request body.
const MAX_ADMIN_BODY: usize = 64 * 1024;
const JSON: &str = "application/json";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    id: InstanceId,
    route: String,
    address: String,
    weight: u32,
    state: HealthState,
    inflight: usize,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_probe_ms_ago: Option<u64>,
}

impl From<&BackendInstance> for InstanceView {
    fn from(instance: &BackendInstance) -> Self {
        Self {
            id: instance.id,
            route: instance.route_name.clone(),
            address: instance.address.clone(),
            weight: instance.weight,
            state: instance.health_state,
            inflight: instance.inflight.current(),
            consecutive_successes: instance.consecutive_successes,
            consecutive_failures: instance.consecutive_failures,
            last_probe_ms_ago: instance
                .last_probe_at
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RouteView {
    id: RouteId,
    name: String,
    path_pattern: String,
    priority: u32,
    revision: u64,
    required_header: Option<String>,
    cache_policy: CachePolicy,
    health_check: HealthCheckSpec,
    origin_path: Option<String>,
    instances: Vec<InstanceView>,
}

impl RouteView {
    fn new(entry: &RouteEntry, registry: &RegistryStore) -> Self {
        let route = &entry.route;
        Self {
            id: entry.id,
            name: route.name.clone(),
            path_pattern: route.path_pattern.as_str().to_string(),
            priority: route.priority,
            revision: entry.revision,
            // The header value is a shared secret; only its name is shown.
            required_header: route.required_header.as_ref().map(|h| h.name.clone()),
            cache_policy: route.cache_policy,
            health_check: registry.health_spec(route),
            origin_path: route.origin_path.clone(),
            instances: entry.instances.iter().map(InstanceView::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthUpdate {
    state: HealthState,
}

/// Admin service over a [`RegistryStore`].
#[derive(Clone)]
pub struct AdminService {
    registry: RegistryStore,
}

impl AdminService {
    pub fn new(registry: RegistryStore) -> Self {
        Self { registry }
    }

    async fn handle<B>(self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().trim_end_matches('/').to_string();
        let query = req.uri().query().unwrap_or("").to_string();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        debug!(method = %method, path = %path, "admin request");

        let result = match (&method, segments.as_slice()) {
            (&Method::GET, ["health"]) => Ok(body::text(StatusCode::OK, "healthy")),
            (&Method::GET, ["metrics"]) => Ok(self.metrics()),
            (&Method::GET, ["routes"]) => Ok(self.list_routes()),
            (&Method::POST, ["routes"]) => self.create_route(req).await,
            (&Method::GET, ["routes", name]) => Ok(self.get_route(name)),
            (&Method::PUT, ["routes", name]) => self.put_route(name, req).await,
            (&Method::DELETE, ["routes", name]) => Ok(self.delete_route(name)),
            (&Method::POST, ["routes", name, "instances"]) => self.add_instance(name, req).await,
            (&Method::DELETE, ["instances", id]) => Ok(self.delete_instance(id, &query)),
            (&Method::PUT, ["instances", id, "health"]) => self.set_health(id, req).await,
            (_, ["health" | "metrics" | "routes"])
            | (_, ["routes", _])
            | (_, ["routes", _, "instances"])
            | (_, ["instances", _])
            | (_, ["instances", _, "health"]) => Ok(error_json(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            )),
            _ => Ok(error_json(StatusCode::NOT_FOUND, "not found")),
        };

        result.unwrap_or_else(|response| response)
    }

    fn metrics(&self) -> Response<ProxyBody> {
        match Metrics::encode() {
            Ok(text) => body::response(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => {
                warn!("failed to encode metrics: {}", e);
                error_json(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
            }
        }
    }

    fn list_routes(&self) -> Response<ProxyBody> {
        let snapshot = self.registry.snapshot();
        let routes: Vec<RouteView> = snapshot
            .routes()
            .iter()
            .map(|entry| RouteView::new(entry, &self.registry))
            .collect();
        let draining: Vec<InstanceView> = snapshot.draining().iter().map(InstanceView::from).collect();
        json_response(
            StatusCode::OK,
            &json!({ "version": snapshot.version(), "routes": routes, "draining": draining }),
        )
    }

    fn get_route(&self, name: &str) -> Response<ProxyBody> {
        let snapshot = self.registry.snapshot();
        match snapshot.route(name) {
            Some(entry) => json_response(StatusCode::OK, &RouteView::new(entry, &self.registry)),
            None => registry_error(&RegistryError::RouteNotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn create_route<B>(&self, req: Request<B>) -> Result<Response<ProxyBody>, Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let route: ServiceRoute = read_json(req).await?;
        let name = route.name.clone();
        let id = self.registry.create_route(route).map_err(|e| registry_error(&e))?;
        info!(route = %name, id = %id, "route created via admin api");
        Ok(json_response(StatusCode::CREATED, &json!({ "id": id, "name": name })))
    }

    /// The path names the route; a `name` in the body must agree with it.
    async fn put_route<B>(
        &self,
        name: &str,
        req: Request<B>,
    ) -> Result<Response<ProxyBody>, Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let mut value: serde_json::Value = read_json(req).await?;
        let Some(fields) = value.as_object_mut() else {
            return Err(error_json(StatusCode::BAD_REQUEST, "expected a JSON object"));
        };
        match fields.get("name").and_then(|n| n.as_str()) {
            Some(body_name) if body_name != name => {
                return Err(error_json(
                    StatusCode::BAD_REQUEST,
                    "route name in body does not match path",
                ));
            }
            _ => {
                fields.insert("name".to_string(), json!(name));
            }
        }
        let route: ServiceRoute = serde_json::from_value(value)
            .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid route: {}", e)))?;

        let outcome = self.registry.upsert_route(route).map_err(|e| registry_error(&e))?;
        let status = if outcome.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Ok(json_response(
            status,
            &json!({ "id": outcome.id, "created": outcome.created, "changed": outcome.changed }),
        ))
    }

    fn delete_route(&self, name: &str) -> Response<ProxyBody> {
        match self.registry.remove_route(name) {
            Ok(draining) => json_response(StatusCode::ACCEPTED, &json!({ "draining": draining })),
            Err(e) => registry_error(&e),
        }
    }

    async fn add_instance<B>(
        &self,
        name: &str,
        req: Request<B>,
    ) -> Result<Response<ProxyBody>, Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let spec: InstanceSpec = read_json(req).await?;
        let id = self
            .registry
            .add_instance(name, spec)
            .map_err(|e| registry_error(&e))?;
        Ok(json_response(StatusCode::CREATED, &json!({ "id": id })))
    }

    fn delete_instance(&self, id: &str, query: &str) -> Response<ProxyBody> {
        let id = match parse_instance_id(id) {
            Ok(id) => id,
            Err(response) => return response,
        };
        let force = query
            .split('&')
            .any(|pair| pair == "force=true" || pair == "force=1");

        if force {
            match self.registry.force_remove_instance(id) {
                Ok(()) => json_response(StatusCode::OK, &json!({ "id": id, "removed": true })),
                Err(e) => registry_error(&e),
            }
        } else {
            match self.registry.remove_instance(id) {
                Ok(()) => json_response(StatusCode::ACCEPTED, &json!({ "id": id, "draining": true })),
                Err(e) => registry_error(&e),
            }
        }
    }

    async fn set_health<B>(
        &self,
        id: &str,
        req: Request<B>,
    ) -> Result<Response<ProxyBody>, Response<ProxyBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        let id = parse_instance_id(id)?;
        let update: HealthUpdate = read_json(req).await?;
        self.registry
            .set_instance_health(id, update.state)
            .map_err(|e| registry_error(&e))?;
        Ok(json_response(
            StatusCode::OK,
            &json!({ "id": id, "state": update.state }),
        ))
    }
}

fn parse_instance_id(raw: &str) -> Result<InstanceId, Response<ProxyBody>> {
    raw.parse::<InstanceId>()
        .map_err(|_| error_json(StatusCode::BAD_REQUEST, "instance id must be an integer"))
}

/// Collects a bounded body and decodes it as JSON.
async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<ProxyBody>>
where
    T: DeserializeOwned,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let collected = Limited::new(req.into_body(), MAX_ADMIN_BODY)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                error_json(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")
            } else {
                error_json(StatusCode::BAD_REQUEST, "failed to read request body")
            }
        })?;
    serde_json::from_slice(&collected.to_bytes())
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("malformed JSON: {}", e)))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(value) {
        Ok(bytes) => body::response(status, JSON, bytes),
        Err(e) => {
            warn!("failed to serialize admin response: {}", e);
            body::text(StatusCode::INTERNAL_SERVER_ERROR, "serialization failed")
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> Response<ProxyBody> {
    json_response(status, &json!({ "error": message }))
}

fn registry_error(err: &RegistryError) -> Response<ProxyBody> {
    debug!(error = %err, "admin request rejected");
    error_json(err.status_code(), &err.to_string())
}

impl<B> Service<Request<B>> for AdminService
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(req).await) })
    }
}
