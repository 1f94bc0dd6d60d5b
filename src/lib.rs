//! Rust Edgemesh - self-hosted edge gateway and service registry
//!
//! Terminates TLS, routes requests by path pattern and priority to weighted
//! backend instances, gates routes on a gateway-injected shared header,
//! health-checks backends and exposes a JSON admin API over the registry.

pub mod admin;
pub mod balancer;
pub mod body;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod health;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod redirect;
pub mod registry;
pub mod router;
pub mod tls;
