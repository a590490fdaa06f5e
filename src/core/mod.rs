pub mod backend;
pub mod circuit_breaker;
pub mod context;
pub mod filter_chain;
pub mod gateway;
pub mod load_balancer;
pub mod rate_limiter;
pub mod retry;
pub mod route;
pub mod router;
pub mod streaming;

pub use gateway::{GatewayService, GatewaySettings};
pub use load_balancer::{LoadBalancer, LoadBalancerFactory};
pub use router::{RouteTable, Router};
