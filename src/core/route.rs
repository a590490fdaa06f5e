//! Route definitions and their request predicates.
//!
//! A [`Route`] is built once from configuration and never mutated; route tables
//! hold them behind `Arc` so a published table can be shared by every request
//! that matched against it.
use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use regex::Regex;
use thiserror::Error;

use crate::core::{
    backend::InstanceUrl,
    filter_chain::Filter,
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPath { pattern: String, reason: String },

    #[error("Invalid host pattern '{pattern}': {reason}")]
    InvalidHost { pattern: String, reason: String },

    #[error("Invalid route target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Invalid filter on route '{route}': {reason}")]
    InvalidFilter { route: String, reason: String },
}

/// Variables captured by `{name}` segments.
pub type PathVars = HashMap<String, String>;

/// Compiled path predicate.
///
/// `**` spans any number of segments (including none), `*` matches within one
/// segment and `{name}` captures one whole segment. A single trailing slash on
/// the request path is tolerated.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    names: Vec<String>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPath {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("path patterns must start with '/'"));
        }

        let mut expr = String::from("^");
        let mut names = Vec::new();
        let mut ends_with_globstar = false;

        if pattern != "/" {
            for segment in pattern[1..].split('/') {
                ends_with_globstar = segment == "**";
                if ends_with_globstar {
                    expr.push_str("(?:/.*)?");
                    continue;
                }
                expr.push('/');
                Self::push_segment(&mut expr, &mut names, segment).map_err(|r| invalid(&r))?;
            }
        }

        if ends_with_globstar {
            expr.push('$');
        } else if pattern == "/" {
            expr.push_str("/$");
        } else {
            expr.push_str("/?$");
        }

        let regex = Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
            names,
        })
    }

    fn push_segment(expr: &mut String, names: &mut Vec<String>, segment: &str) -> Result<(), String> {
        let mut chars = segment.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => expr.push_str("[^/]*"),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) if ch.is_ascii_alphanumeric() || ch == '_' => name.push(ch),
                            Some(ch) => return Err(format!("unexpected '{ch}' in variable name")),
                            None => return Err("unterminated '{'".to_string()),
                        }
                    }
                    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
                        return Err(format!("invalid variable name '{name}'"));
                    }
                    if names.contains(&name) {
                        return Err(format!("variable '{name}' appears twice"));
                    }
                    expr.push_str(&format!("(?P<{name}>[^/]+)"));
                    names.push(name);
                }
                '}' => return Err("unbalanced '}'".to_string()),
                other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a request path, returning captured variables on success.
    pub fn matches(&self, path: &str) -> Option<PathVars> {
        let captures = self.regex.captures(path)?;
        Some(
            self.names
                .iter()
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }
}

/// Case-insensitive glob on the request host (port ignored). `*` matches
/// within one label, `**` across labels.
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    regex: Regex,
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        if pattern.is_empty() || pattern.contains('/') || pattern.contains(':') {
            return Err(RouteError::InvalidHost {
                pattern: pattern.to_string(),
                reason: "expected a host name glob without scheme, port or path".to_string(),
            });
        }

        let mut expr = String::from("(?i)^");
        let mut rest = pattern;
        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix("**") {
                expr.push_str(".+");
                rest = stripped;
            } else if let Some(stripped) = rest.strip_prefix('*') {
                expr.push_str("[^.]+");
                rest = stripped;
            } else {
                let next = rest.find('*').unwrap_or(rest.len());
                expr.push_str(&regex::escape(&rest[..next]));
                rest = &rest[next..];
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| RouteError::InvalidHost {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `host` may carry a port, which is ignored.
    pub fn matches(&self, host: &str) -> bool {
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        };
        self.regex.is_match(name)
    }
}

/// Response produced by the gateway itself.
#[derive(Debug, Clone)]
pub struct StaticResponse {
    pub status: StatusCode,
    pub content_type: HeaderValue,
    pub body: Bytes,
}

/// Where a matched request ends up.
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Logical service resolved through discovery (`lb://name`).
    Service(String),
    /// Fixed base URI.
    Uri(InstanceUrl),
    Respond(StaticResponse),
}

impl RouteTarget {
    pub fn parse_uri(uri: &str) -> Result<Self, RouteError> {
        let invalid = |reason: String| RouteError::InvalidTarget {
            target: uri.to_string(),
            reason,
        };

        if let Some(service) = uri.strip_prefix("lb://") {
            let service = service.trim_end_matches('/');
            if service.is_empty() || service.contains('/') {
                return Err(invalid("expected lb://<service-name>".to_string()));
            }
            return Ok(RouteTarget::Service(service.to_string()));
        }

        InstanceUrl::new(uri)
            .map(RouteTarget::Uri)
            .map_err(|e| invalid(e.to_string()))
    }

    /// Identity used for breakers that do not name themselves.
    pub fn describe(&self) -> String {
        match self {
            RouteTarget::Service(name) => format!("lb://{name}"),
            RouteTarget::Uri(url) => url.to_string(),
            RouteTarget::Respond(response) => format!("respond:{}", response.status.as_u16()),
        }
    }
}

/// Immutable, compiled route.
#[derive(Debug)]
pub struct Route {
    pub id: String,
    pub path: PathPattern,
    pub host: Option<HostPattern>,
    pub priority: i32,
    pub target: RouteTarget,
    pub filters: Vec<Filter>,
}

impl Route {
    pub fn matches(&self, host: Option<&str>, path: &str) -> Option<PathVars> {
        if let Some(pattern) = &self.host {
            if !host.is_some_and(|h| pattern.matches(h)) {
                return None;
            }
        }
        self.path.matches(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globstar_matches_any_depth() {
        let pattern = PathPattern::parse("/error/**").unwrap();
        assert!(pattern.matches("/error").is_some());
        assert!(pattern.matches("/error/").is_some());
        assert!(pattern.matches("/error/alice").is_some());
        assert!(pattern.matches("/error/a/b/c").is_some());
        assert!(pattern.matches("/errors").is_none());
        assert!(pattern.matches("/other/error").is_none());
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let pattern = PathPattern::parse("/api/*/items").unwrap();
        assert!(pattern.matches("/api/v1/items").is_some());
        assert!(pattern.matches("/api/v1/v2/items").is_none());
    }

    #[test]
    fn test_variables_are_captured() {
        let pattern = PathPattern::parse("/error/{id}").unwrap();
        let vars = pattern.matches("/error/alice").unwrap();
        assert_eq!(vars.get("id").map(String::as_str), Some("alice"));
        assert!(pattern.matches("/error/alice/more").is_none());
        assert!(pattern.matches("/error/alice/").is_some());
    }

    #[test]
    fn test_literal_and_root() {
        let hello = PathPattern::parse("/hello").unwrap();
        assert!(hello.matches("/hello").is_some());
        assert!(hello.matches("/hello/").is_some());
        assert!(hello.matches("/hellooo").is_none());

        let root = PathPattern::parse("/").unwrap();
        assert!(root.matches("/").is_some());
        assert!(root.matches("/x").is_none());

        let everything = PathPattern::parse("/**").unwrap();
        assert!(everything.matches("/").is_some());
        assert!(everything.matches("/anything/at/all").is_some());
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = PathPattern::parse("/files/a.b").unwrap();
        assert!(pattern.matches("/files/a.b").is_some());
        assert!(pattern.matches("/files/axb").is_none());
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(PathPattern::parse("hello").is_err());
        assert!(PathPattern::parse("/a/{id").is_err());
        assert!(PathPattern::parse("/a/{id}/{id}").is_err());
        assert!(PathPattern::parse("/a/{1x}").is_err());
    }

    #[test]
    fn test_host_pattern() {
        let pattern = HostPattern::parse("*.example.org").unwrap();
        assert!(pattern.matches("api.example.org"));
        assert!(pattern.matches("API.Example.org:8443"));
        assert!(!pattern.matches("example.org"));
        assert!(!pattern.matches("a.b.example.org"));

        let deep = HostPattern::parse("**.example.org").unwrap();
        assert!(deep.matches("a.b.example.org"));

        assert!(HostPattern::parse("http://x").is_err());
    }

    #[test]
    fn test_parse_targets() {
        assert!(matches!(
            RouteTarget::parse_uri("lb://customers").unwrap(),
            RouteTarget::Service(name) if name == "customers"
        ));
        assert!(matches!(
            RouteTarget::parse_uri("http://localhost:8080").unwrap(),
            RouteTarget::Uri(_)
        ));
        assert!(RouteTarget::parse_uri("lb://").is_err());
        assert!(RouteTarget::parse_uri("tcp://x").is_err());
    }
}
