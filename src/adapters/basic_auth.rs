//! HTTP Basic authentication against the configured user store.
use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderMap, header};

use crate::{
    config::UserConfig,
    ports::authenticator::{AuthDecision, Authenticator, Principal},
};

#[derive(Debug, Default)]
pub struct BasicAuthenticator {
    users: HashMap<String, String>,
}

impl BasicAuthenticator {
    pub fn new(users: &[UserConfig]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone()))
                .collect(),
        }
    }

    fn decode(value: &str) -> Option<(String, String)> {
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some((username.to_string(), password.to_string()))
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> AuthDecision {
        let Some(value) = headers.get(header::AUTHORIZATION) else {
            return AuthDecision::Anonymous;
        };

        let Some((username, password)) = value.to_str().ok().and_then(Self::decode) else {
            tracing::debug!("Malformed Authorization header");
            return AuthDecision::Rejected;
        };

        match self.users.get(&username) {
            Some(expected) if *expected == password => {
                AuthDecision::Authenticated(Principal { name: username })
            }
            _ => {
                tracing::debug!("Rejected credentials for user '{}'", username);
                AuthDecision::Rejected
            }
        }
    }
}
