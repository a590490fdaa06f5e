#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use rampart::{
    BasicAuthenticator, GatewayService, HttpClientAdapter, HttpHandler, StaticDiscovery,
    config::{GatewayConfig, GatewayConfigBuilder, HealthCheckConfig},
    customers::{self, CustomersConfig},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A running customers service; stops when dropped.
pub struct Customers {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Customers {
    pub async fn start(error_failures: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let config = CustomersConfig {
            error_failures,
            interval: Duration::from_millis(50),
            buffer: 16,
        };
        tokio::spawn(customers::serve(listener, config, shutdown.clone()));
        Self { addr, shutdown }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for Customers {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A running gateway; stops when dropped.
pub struct Gateway {
    pub addr: SocketAddr,
    pub service: Arc<GatewayService>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub async fn start(config: GatewayConfig) -> Self {
        let discovery = Arc::new(StaticDiscovery::from_config(&config, None).unwrap());
        let service = Arc::new(
            GatewayService::new(
                &config,
                discovery,
                Arc::new(BasicAuthenticator::new(&config.users)),
                Arc::new(HttpClientAdapter::new().unwrap()),
            )
            .await
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let app = HttpHandler::new(service.clone()).into_router();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
        });

        Self {
            addr,
            service,
            shutdown,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Gateway config fronting `customers` with health probing off.
pub fn gateway_config(customers: &Customers) -> GatewayConfigBuilder {
    GatewayConfig::builder()
        .listen_addr("127.0.0.1:0")
        .service("customers", [customers.url()])
        .user("jlong", "password")
        .health_check(HealthCheckConfig {
            enabled: false,
            ..HealthCheckConfig::default()
        })
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}
