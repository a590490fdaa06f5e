use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    metrics::UpstreamRequestTimer,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

const USER_AGENT: &str = concat!("Rampart/", env!("CARGO_PKG_VERSION"));

/// Upstream HTTP client using Hyper with Rustls.
///
/// * Sets `Host` from the target URI and a default `User-Agent`
/// * Bounds the wait for response headers; bodies stream without a deadline
/// * Performs HEAD based health probes
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }
        tracing::debug!("Loaded {} native root certificates", root_cert_store.len());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector);
        Ok(Self { client })
    }

    fn add_common_headers(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let host = match (req.uri().host(), req.uri().port_u16()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "Outgoing URI has no host: {}",
                    req.uri()
                )));
            }
        };
        let host = HeaderValue::from_str(&host)
            .map_err(|e| HttpClientError::InvalidRequest(format!("Invalid host '{host}': {e}")))?;

        let headers = req.headers_mut();
        headers.insert(header::HOST, host);
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        wait: Duration,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::add_common_headers(&mut req)?;
        *req.version_mut() = Version::HTTP_11;

        let upstream = format!(
            "{}://{}",
            req.uri().scheme_str().unwrap_or("http"),
            req.uri()
                .authority()
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        );
        let span = tracing::info_span!(
            "upstream_request",
            upstream.url = %upstream,
            http.method = %req.method(),
            http.path = %req.uri().path(),
            http.status_code = tracing::field::Empty,
        );

        let client = self.client.clone();
        async move {
            let method = req.method().clone();
            let uri = req.uri().clone();
            let _timer = UpstreamRequestTimer::new(&upstream);

            let response = match timeout(wait, client.request(req)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!("Request to {} {} failed: {}", method, uri, e);
                    return Err(HttpClientError::ConnectionError(e.to_string()));
                }
                Err(_) => {
                    tracing::Span::current().record("http.status_code", 599u16);
                    tracing::warn!("Request to {} {} timed out after {:?}", method, uri, wait);
                    return Err(HttpClientError::Timeout(wait));
                }
            };

            tracing::Span::current().record("http.status_code", response.status().as_u16());
            let (mut parts, body) = response.into_parts();
            // The body is re-framed by the inbound server.
            parts.headers.remove(header::TRANSFER_ENCODING);
            Ok(Response::from_parts(parts, AxumBody::new(body)))
        }
        .instrument(span)
        .await
    }

    async fn health_check(&self, url: &str, wait: Duration) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("HEAD")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, USER_AGENT)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        match timeout(wait, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // Drain so the connection can be reused.
                let _ = response.into_body().collect().await;
                tracing::debug!("Health check for {} result: {}", url, is_healthy);
                Ok(is_healthy)
            }
            Ok(Err(err)) => {
                tracing::debug!("Health check error for {}: {}", url, err);
                Ok(false)
            }
            Err(_) => {
                tracing::debug!("Health check timeout for {}", url);
                Err(HttpClientError::Timeout(wait))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(HttpClientAdapter::new().is_ok());
    }

    #[test]
    fn test_common_headers() {
        let mut req = Request::builder()
            .uri("http://127.0.0.1:8080/hello")
            .body(AxumBody::empty())
            .unwrap();
        HttpClientAdapter::add_common_headers(&mut req).unwrap();

        assert_eq!(req.headers().get(header::HOST).unwrap(), "127.0.0.1:8080");
        assert!(
            req.headers()
                .get(header::USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("Rampart/")
        );

        let mut relative = Request::builder()
            .uri("/hello")
            .body(AxumBody::empty())
            .unwrap();
        assert!(matches!(
            HttpClientAdapter::add_common_headers(&mut relative),
            Err(HttpClientError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let client = HttpClientAdapter::new().unwrap();
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        let result = client.send_request(req, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(HttpClientError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_health_check_invalid_url() {
        let client = HttpClientAdapter::new().unwrap();
        let result = client.health_check("invalid-url", Duration::from_secs(1)).await;
        assert!(matches!(result, Ok(false)));
    }
}
