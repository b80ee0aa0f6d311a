// src/main.rs
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use dns_forwarder::{
    config,
    health::HealthCheck,
    metrics::MetricsRegistry,
    policy::{create_policy, Spray},
    server::{bind_udp, Forwarder},
    transport::{TlsClientConfig, Transport},
    upstream::build_pool,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dns_forwarder=debug".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("loading configuration from: {}", config_path);
    let config = config::load_config(&config_path).await?;

    let transport = Arc::new(Transport::new(
        config.transport.force_tcp,
        config.transport.prefer_udp,
        config.transport.expire(),
    ));
    if let Some(tls) = &config.transport.tls {
        let tls_config = TlsClientConfig::new(&tls.server_name, tls.ca_file.as_deref())?;
        transport.set_tls(tls_config);
    }

    let pool = build_pool(&config.upstreams, &transport);

    let mut health_check = HealthCheck::new(pool, config.check_interval(), Arc::clone(&transport))
        .with_max_fails(config.max_fails);
    if let Some(kind) = config.policy {
        health_check = health_check.with_policy(create_policy(kind));
    }
    if config.spray {
        health_check = health_check.with_spray(Box::new(Spray));
    }

    let mut metrics = None;
    if config.metrics.enabled {
        let registry = MetricsRegistry::new()?;
        let collector = registry.collector();
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, registry, config.metrics.path.clone());
        health_check = health_check.with_metrics(collector.clone());
        metrics = Some(collector);
    }

    let health_check = Arc::new(health_check);
    health_check.start();

    let socket = bind_udp(config.listen).await?;
    let mut forwarder = Forwarder::new(Arc::clone(&health_check));
    if let Some(collector) = metrics {
        forwarder = forwarder.with_metrics(collector);
    }
    let forwarder = Arc::new(forwarder);

    tokio::select! {
        result = forwarder.run(socket) => {
            if let Err(err) = result {
                error!(%err, "forwarder exited");
            }
        }
        _ = shutdown_signal() => {}
    }

    health_check.stop().await;
    info!("shutdown complete");
    Ok(())
}

fn start_metrics_server(addr: SocketAddr, registry: MetricsRegistry, path: String) {
    let registry = Arc::new(registry);
    let path = Arc::new(path);
    let service_path = path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    if req.uri().path() == path.as_str() {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(registry.gather()))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    info!("metrics server listening on http://{}{}", addr, path.as_str());

    tokio::spawn(async move {
        if let Err(err) = Server::bind(&addr).serve(make_service).await {
            error!(%err, "metrics server error");
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
