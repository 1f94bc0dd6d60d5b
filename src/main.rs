use rust_edgemesh::admin::AdminService;
use rust_edgemesh::cache::ResponseCache;
use rust_edgemesh::config::ProxyConfig;
use rust_edgemesh::connection::ConnectionLimiter;
use rust_edgemesh::gateway::EdgeGateway;
use rust_edgemesh::health::HealthMonitor;
use rust_edgemesh::listener::Listener;
use rust_edgemesh::redirect::RedirectService;
use rust_edgemesh::registry::RegistryStore;
use rust_edgemesh::router::Router;
use rust_edgemesh::tls::{build_acceptor, HttpProtocol, PemFileProvider};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rust Edgemesh gateway");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(ProxyConfig::load()?);
    info!(
        "config: gateway={}, admin={}, redirect={:?}, hostname={}, tls={}, timeout={}ms",
        config.listen_addr,
        config.admin_addr,
        config.redirect_addr,
        config.public_hostname,
        config.tls.is_some(),
        config.request_timeout_ms
    );

    let registry = RegistryStore::new(config.registry_config());
    config.register_routes(&registry)?;

    let router = Arc::new(Router::new(registry.clone(), config.no_healthy_alert_after()));
    let cache = Arc::new(ResponseCache::new(config.cache.clone()));
    let gateway = EdgeGateway::new(router, cache, config.gateway_config())?;
    let limiter = ConnectionLimiter::new(config.max_connections);

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let gateway_listener = match &config.tls {
        Some(files) => {
            let provider = PemFileProvider::new(&files.cert_path, &files.key_path);
            let acceptor = build_acceptor(&provider, HttpProtocol::Auto)?;
            Listener::bind_with_tls(&config.listen_addr, gateway, acceptor, HttpProtocol::Auto)
                .await?
        }
        None => Listener::bind(&config.listen_addr, gateway).await?,
    }
    .with_connection_limit(limiter);
    info!("gateway listening on {}", gateway_listener.local_addr());

    let admin_listener =
        Listener::bind(&config.admin_addr, AdminService::new(registry.clone())).await?;
    info!(
        "admin api on {} (/health, /metrics, /routes, /instances)",
        admin_listener.local_addr()
    );

    let mut gateway_task = spawn_listener("gateway", gateway_listener, &shutdown_tx);
    let mut admin_task = spawn_listener("admin", admin_listener, &shutdown_tx);

    let mut background: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    if let Some(addr) = &config.redirect_addr {
        let redirect_listener =
            Listener::bind(addr, RedirectService::new(config.public_hostname.as_str())).await?;
        info!("redirecting http on {} to https", redirect_listener.local_addr());
        background.push(("redirect", spawn_listener("redirect", redirect_listener, &shutdown_tx)));
    }

    let monitor = HealthMonitor::new(registry, config.health_monitor_config());
    background.push(("health", tokio::spawn(monitor.run(shutdown_tx.subscribe()))));

    let mut gateway_finished = false;
    let mut admin_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut gateway_task => {
            gateway_finished = true;
            match res {
                Ok(()) => info!("gateway task completed"),
                Err(err) => error!("gateway task join error: {}", err),
            }
        }
        res = &mut admin_task => {
            admin_finished = true;
            match res {
                Ok(()) => info!("admin task completed"),
                Err(err) => error!("admin task join error: {}", err),
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !gateway_finished {
        background.push(("gateway", gateway_task));
    }
    if !admin_finished {
        background.push(("admin", admin_task));
    }

    for (name, task) in background {
        match task.await {
            Ok(()) => info!("{} task completed", name),
            Err(err) => error!("{} task join error: {}", name, err),
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn spawn_listener<S>(
    name: &'static str,
    listener: Listener<S>,
    shutdown_tx: &broadcast::Sender<()>,
) -> JoinHandle<()>
where
    S: tower::Service<
            http::Request<hyper::body::Incoming>,
            Response = http::Response<rust_edgemesh::body::ProxyBody>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = listener.serve(shutdown_rx).await {
            error!("{} listener error: {}", name, e);
        }
    })
}
