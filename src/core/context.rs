use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, header};

use crate::{core::route::PathVars, ports::authenticator::Principal};

/// Longest chain of internal forwards (breaker fallbacks) a request may take.
pub const MAX_FORWARD_DEPTH: u8 = 4;

/// Everything the filter chain knows about an inbound request.
///
/// The body is buffered so retries can replay it; cloning a context is cheap.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Path and query as seen by the next filter; rewrite filters replace it.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<SocketAddr>,
    pub principal: Option<Principal>,
    pub path_vars: PathVars,
    pub route_id: Option<String>,
    pub request_id: String,
    pub forward_depth: u8,
    /// The client asked for a WebSocket upgrade.
    pub websocket: bool,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
            principal: None,
            path_vars: PathVars::new(),
            route_id: None,
            request_id: uuid::Uuid::new_v4().to_string(),
            forward_depth: 0,
            websocket: false,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_client_addr(mut self, addr: SocketAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// Host used for host predicates: the URI authority, else the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.uri.host().or_else(|| {
            self.headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
    }

    /// Client IP, preferring the first `X-Forwarded-For` hop.
    pub fn client_ip(&self) -> Option<String> {
        #[allow(clippy::collapsible_if)]
        if let Some(forwarded_for) = self.headers.get("x-forwarded-for") {
            if let Ok(value) = forwarded_for.to_str() {
                if let Some(first) = value.split(',').next().map(str::trim) {
                    if !first.is_empty() {
                        return Some(first.to_string());
                    }
                }
            }
        }
        self.client_addr.map(|addr| addr.ip().to_string())
    }

    /// Replace the path, keeping the query string.
    pub fn set_path(&mut self, path: &str) -> Result<(), http::Error> {
        let path_and_query = match self.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
        self.uri = Uri::builder().path_and_query(path_and_query).build()?;
        Ok(())
    }
}
