use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::config_providers::file::take_receiver,
    config::{models::GatewayConfig, validation::GatewayConfigValidator},
    ports::config_provider::ConfigProvider,
};

/// Fetches the gateway configuration as JSON from a URL and polls it for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    poller: CancellationToken,
}

impl HttpConfigProvider {
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let url = url.into();
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("Failed to build config HTTP client")?;
        let poller = CancellationToken::new();

        tokio::spawn(Self::poll(
            client.clone(),
            url.clone(),
            poll_interval,
            tx,
            poller.clone(),
        ));

        Ok(Self {
            url,
            client,
            update_rx: std::sync::Mutex::new(Some(rx)),
            poller,
        })
    }

    async fn poll(
        client: Client,
        url: String,
        poll_interval: Duration,
        tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) {
        let mut last_hash: Option<u64> = None;
        let mut interval = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            // GatewayConfig has no Hash; its JSON form stands in for it.
            let hash = match Self::fetch_config(&client, &url).await {
                Ok(config) => match serde_json::to_string(&config) {
                    Ok(json) => {
                        let mut hasher = DefaultHasher::new();
                        json.hash(&mut hasher);
                        hasher.finish()
                    }
                    Err(e) => {
                        tracing::warn!("Failed to serialize remote config: {}", e);
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to poll remote config: {:#}", e);
                    continue;
                }
            };

            match last_hash {
                Some(last) if last != hash => {
                    tracing::info!("Remote configuration changed");
                    let _ = tx.try_send(());
                }
                _ => {}
            }
            last_hash = Some(hash);
        }
    }

    async fn fetch_config(client: &Client, url: &str) -> Result<GatewayConfig> {
        client
            .get(url)
            .send()
            .await
            .wrap_err_with(|| format!("Failed to fetch config from {url}"))?
            .error_for_status()
            .wrap_err("Config endpoint returned an error status")?
            .json::<GatewayConfig>()
            .await
            .wrap_err("Failed to parse JSON config")
    }
}

impl Drop for HttpConfigProvider {
    fn drop(&mut self) {
        self.poller.cancel();
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let config = Self::fetch_config(&self.client, &self.url).await?;
        GatewayConfigValidator::validate(&config)
            .wrap_err_with(|| format!("Invalid configuration from {}", self.url))?;
        Ok(config)
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        take_receiver(&self.update_rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, routing::get};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::RouteConfig;

    fn config(path: &str) -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:9999")
            .service("customers", ["http://127.0.0.1:8080"])
            .route(RouteConfig::new("customers", path, "lb://customers"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_config_provider() -> Result<()> {
        let state = Arc::new(Mutex::new(config("/customers")));

        let served = state.clone();
        let app = Router::new().route(
            "/config",
            get(move || async move { Json(served.lock().unwrap().clone()) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/config", listener.local_addr()?);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpConfigProvider::new(url, Duration::from_millis(100))?;
        let loaded = provider.load_config().await?;
        assert_eq!(loaded.routes[0].path, "/customers");

        let mut rx = provider.watch();
        // Let the poller record the first version.
        tokio::time::sleep(Duration::from_millis(250)).await;
        *state.lock().unwrap() = config("/people/**");

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(
            matches!(notification, Ok(Some(()))),
            "Timed out waiting for config update"
        );
        assert_eq!(provider.load_config().await?.routes[0].path, "/people/**");
        Ok(())
    }
}
