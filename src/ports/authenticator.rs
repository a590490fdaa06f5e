use async_trait::async_trait;
use http::HeaderMap;
use serde::Serialize;

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub name: String,
}

/// Result of inspecting a request's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// No credentials were presented.
    Anonymous,
    Authenticated(Principal),
    /// Credentials were presented and did not check out.
    Rejected,
}

/// Credential store boundary. The gateway only consumes the decision.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthDecision;
}
