/// Configuration written by `rampart init`: the customers demo behind every
/// resilience filter.
pub const SAMPLE_CONFIG: &str = r#"# Rampart gateway configuration

listen_addr = "127.0.0.1:9999"

[logging]
level = "info"
format = "pretty"

[health_check]
enabled = true
interval_secs = 10
timeout_secs = 2
path = "/health"

[upstream]
request_timeout = "30s"

[streaming]
buffer_capacity = 64
overflow = "block"
max_event_bytes = 65536

# Static discovery: logical service name -> instances
[services.customers]
instances = ["http://127.0.0.1:8080"]

[[users]]
username = "jlong"
password = "password"

# Live customer feed over SSE
[[routes]]
id = "customers"
path = "/customers"
uri = "lb://customers"

# ... and over WebSocket
[[routes]]
id = "customers-ws"
path = "/ws/customers"
uri = "lb://customers"

# Retried up to five tries in total
[[routes]]
id = "errors"
path = "/error/**"
uri = "lb://customers"
filters = [{ type = "retry", max_attempts = 5 }]

# Authenticated callers get five requests, then one more per second
[[routes]]
id = "hello"
path = "/hello"
uri = "lb://customers"
filters = [
    { type = "auth_required" },
    { type = "rate_limit", by = "principal", capacity = 5, refill_rate = 1.0 },
]

# Falls back to a canned answer while the breaker is open
[[routes]]
id = "guarded"
path = "/guarded/**"
uri = "lb://customers"
filters = [
    { type = "rewrite", pattern = "^/guarded/(?P<rest>.*)$", replacement = "/${rest}" },
    { type = "circuit_breaker", failure_threshold = 3, open_duration = "10s", fallback = "forward:/fallback" },
]

[[routes]]
id = "fallback"
path = "/fallback"
respond = { status = 200, body = "customers are taking a break" }
"#;
