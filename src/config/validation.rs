#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr};

use eyre::Result;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use regex::Regex;

use crate::{
    config::models::{
        CircuitBreakerConfig, FilterConfig, GatewayConfig, HealthCheckConfig, RateLimitBy,
        RateLimitConfig, RetryConfig, RouteConfig, StreamingConfig, UpstreamConfig,
    },
    core::route::{HostPattern, PathPattern, RouteTarget},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }

        for route in &config.routes {
            if let Err(mut route_errors) = Self::validate_single_route(route, config) {
                errors.append(&mut route_errors);
            }
        }

        if let Err(conflicts) = Self::check_route_conflicts(&config.routes) {
            errors.extend(conflicts);
        }

        for (name, service) in &config.services {
            if service.instances.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("services.{name}.instances"),
                    message: "A service needs at least one instance".to_string(),
                });
            }
            for (i, instance) in service.instances.iter().enumerate() {
                if let Err(e) =
                    Self::validate_url(instance, &format!("services.{name}.instances[{i}]"))
                {
                    errors.push(e);
                }
            }
        }

        for (i, user) in config.users.iter().enumerate() {
            if user.username.is_empty() || user.username.contains(':') {
                errors.push(ValidationError::InvalidField {
                    field: format!("users[{i}].username"),
                    message: "Usernames must be non-empty and must not contain ':'".to_string(),
                });
            }
        }

        if let Err(mut health_check_errors) =
            Self::validate_health_check_config(&config.health_check)
        {
            errors.append(&mut health_check_errors);
        }

        if let Err(e) = Self::validate_upstream_config(&config.upstream) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_streaming_config(&config.streaming) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate a single route configuration
    fn validate_single_route(
        route: &RouteConfig,
        config: &GatewayConfig,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let id = &route.id;

        if id.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "route id".to_string(),
            });
        }

        if let Err(e) = PathPattern::parse(&route.path) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{id}' path"),
                message: e.to_string(),
            });
        }

        if let Some(host) = &route.host {
            if let Err(e) = HostPattern::parse(host) {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{id}' host"),
                    message: e.to_string(),
                });
            }
        }

        match (&route.uri, &route.respond) {
            (Some(_), Some(_)) | (None, None) => {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{id}'"),
                    message: "Exactly one of 'uri' or 'respond' must be set".to_string(),
                });
            }
            (Some(uri), None) => match RouteTarget::parse_uri(uri) {
                Ok(RouteTarget::Service(service)) => {
                    if !config.services.contains_key(&service) {
                        errors.push(ValidationError::InvalidField {
                            field: format!("route '{id}' uri"),
                            message: format!("Unknown service '{service}'"),
                        });
                    }
                }
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: format!("route '{id}' uri"),
                    message: e.to_string(),
                }),
            },
            (None, Some(respond)) => {
                if StatusCode::from_u16(respond.status).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{id}' respond.status"),
                        message: format!("Invalid status code {}", respond.status),
                    });
                }
                if HeaderValue::from_str(&respond.content_type).is_err() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("route '{id}' respond.content_type"),
                        message: "Content type is not a valid header value".to_string(),
                    });
                }
            }
        }

        for (i, filter) in route.filters.iter().enumerate() {
            let field = format!("route '{id}' filters[{i}]");
            let result = match filter {
                FilterConfig::AuthRequired => {
                    if config.users.is_empty() {
                        Err(ValidationError::InvalidField {
                            field,
                            message: "auth_required is used but no users are configured"
                                .to_string(),
                        })
                    } else {
                        Ok(())
                    }
                }
                FilterConfig::RateLimit(rate) => Self::validate_rate_limit(&field, rate),
                FilterConfig::Retry(retry) => Self::validate_retry(&field, retry),
                FilterConfig::CircuitBreaker(breaker) => {
                    Self::validate_circuit_breaker(&field, breaker)
                }
                FilterConfig::Rewrite { pattern, .. } => Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| ValidationError::InvalidField {
                        field,
                        message: format!("Invalid rewrite pattern: {e}"),
                    }),
                FilterConfig::SetPath { template } => {
                    if template.starts_with('/') {
                        Ok(())
                    } else {
                        Err(ValidationError::InvalidField {
                            field,
                            message: "set_path template must start with '/'".to_string(),
                        })
                    }
                }
                FilterConfig::AddRequestHeader { name, value } => {
                    if HeaderName::from_bytes(name.as_bytes()).is_err()
                        || HeaderValue::from_str(value).is_err()
                    {
                        Err(ValidationError::InvalidField {
                            field,
                            message: format!("Invalid header '{name}: {value}'"),
                        })
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_rate_limit(field: &str, config: &RateLimitConfig) -> ValidationResult<()> {
        if config.capacity == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.capacity"),
                message: "Rate limit capacity must be greater than 0".to_string(),
            });
        }

        if !(config.refill_rate.is_finite() && config.refill_rate > 0.0) {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.refill_rate"),
                message: "Refill rate must be a positive number of tokens per second".to_string(),
            });
        }

        if config.by == RateLimitBy::Header && config.header_name.is_none() {
            return Err(ValidationError::MissingField {
                field: format!("{field}.header_name"),
            });
        }

        if StatusCode::from_u16(config.status_code).is_err() {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.status_code"),
                message: format!("Invalid status code {}", config.status_code),
            });
        }

        Ok(())
    }

    fn validate_retry(field: &str, config: &RetryConfig) -> ValidationResult<()> {
        if config.max_attempts == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.max_attempts"),
                message: "max_attempts counts the first try and must be at least 1".to_string(),
            });
        }

        if let Some(bad) = config
            .statuses
            .iter()
            .find(|code| StatusCode::from_u16(**code).is_err())
        {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.statuses"),
                message: format!("Invalid status code {bad}"),
            });
        }

        if let Some(bad) = config
            .methods
            .iter()
            .find(|m| Method::from_bytes(m.as_bytes()).is_err())
        {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.methods"),
                message: format!("Invalid method '{bad}'"),
            });
        }

        if let Some(backoff) = &config.backoff {
            for (name, value) in [
                ("first_backoff", &backoff.first_backoff),
                ("max_backoff", &backoff.max_backoff),
            ] {
                if humantime::parse_duration(value).is_err() {
                    return Err(ValidationError::InvalidField {
                        field: format!("{field}.backoff.{name}"),
                        message: format!("Invalid duration '{value}'"),
                    });
                }
            }
            if !(backoff.factor.is_finite() && backoff.factor >= 1.0) {
                return Err(ValidationError::InvalidField {
                    field: format!("{field}.backoff.factor"),
                    message: "Backoff factor must be >= 1".to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_circuit_breaker(field: &str, config: &CircuitBreakerConfig) -> ValidationResult<()> {
        if config.failure_threshold == 0 {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.failure_threshold"),
                message: "Failure threshold must be greater than 0".to_string(),
            });
        }

        if humantime::parse_duration(&config.open_duration).is_err() {
            return Err(ValidationError::InvalidField {
                field: format!("{field}.open_duration"),
                message: format!("Invalid duration '{}'", config.open_duration),
            });
        }

        if let Some(fallback) = &config.fallback {
            let path = fallback.strip_prefix("forward:").unwrap_or(fallback);
            if !path.starts_with('/') {
                return Err(ValidationError::InvalidField {
                    field: format!("{field}.fallback"),
                    message: "Fallback must be a gateway path such as 'forward:/fallback'"
                        .to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_health_check_config(
        config: &HealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.unhealthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.healthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Health check path must start with '/'".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_upstream_config(config: &UpstreamConfig) -> ValidationResult<()> {
        if humantime::parse_duration(&config.request_timeout).is_err() {
            return Err(ValidationError::InvalidField {
                field: "upstream.request_timeout".to_string(),
                message: format!("Invalid duration '{}'", config.request_timeout),
            });
        }
        Ok(())
    }

    fn validate_streaming_config(config: &StreamingConfig) -> ValidationResult<()> {
        if config.buffer_capacity == 0 {
            return Err(ValidationError::InvalidField {
                field: "streaming.buffer_capacity".to_string(),
                message: "Buffer capacity must be greater than 0".to_string(),
            });
        }
        if config.max_event_bytes == 0 {
            return Err(ValidationError::InvalidField {
                field: "streaming.max_event_bytes".to_string(),
                message: "Maximum event size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Route ids must be unique; identical path + host predicates would make
    /// the later route unreachable.
    fn check_route_conflicts(routes: &[RouteConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut ids = HashSet::new();
        let mut predicates = HashSet::new();

        for route in routes {
            if !ids.insert(route.id.as_str()) {
                errors.push(ValidationError::RouteConflict {
                    message: format!("Duplicate route id '{}'", route.id),
                });
            }
            let predicate = (route.path.as_str(), route.host.as_deref());
            if !predicates.insert(predicate) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "Route '{}' repeats path '{}' with the same host and can never match",
                        route.id, route.path
                    ),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        errors
            .iter()
            .enumerate()
            .map(|(i, e)| format!("  {}. {e}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{RateLimitConfig, RetryConfig, StaticResponseConfig};

    fn base_config() -> GatewayConfig {
        GatewayConfig::builder()
            .listen_addr("127.0.0.1:9999")
            .service("customers", ["http://127.0.0.1:8080"])
            .user("jlong", "pw")
            .route(RouteConfig::new("errors", "/error/**", "lb://customers"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_config() {
        assert!(GatewayConfigValidator::validate(&base_config()).is_ok());
    }

    #[test]
    fn test_unknown_service() {
        let mut config = base_config();
        config
            .routes
            .push(RouteConfig::new("other", "/other/**", "lb://nope"));
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown service 'nope'"));
    }

    #[test]
    fn test_uri_and_respond_are_exclusive() {
        let mut config = base_config();
        let mut route = RouteConfig::new("both", "/both", "http://localhost:1");
        route.respond = Some(StaticResponseConfig {
            status: 200,
            content_type: "text/plain".to_string(),
            body: String::new(),
        });
        config.routes.push(route);
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_zero_capacity_and_attempts() {
        let mut config = base_config();
        config.routes[0]
            .filters
            .push(FilterConfig::RateLimit(RateLimitConfig::per_principal(0, 1.0)));
        config.routes[0]
            .filters
            .push(FilterConfig::Retry(RetryConfig::attempts(0)));
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("capacity"));
        assert!(message.contains("max_attempts"));
    }

    #[test]
    fn test_auth_without_users() {
        let mut config = base_config();
        config.users.clear();
        config.routes[0].filters.push(FilterConfig::AuthRequired);
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_routes() {
        let mut config = base_config();
        config
            .routes
            .push(RouteConfig::new("errors", "/error/**", "lb://customers"));
        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Duplicate route id"));
    }

    #[test]
    fn test_bad_rewrite_pattern() {
        let mut config = base_config();
        config.routes[0].filters.push(FilterConfig::Rewrite {
            pattern: "(".to_string(),
            replacement: "/".to_string(),
        });
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }
}
