pub mod auth;
pub mod context;
pub mod forwarder;
pub mod gateway;
pub mod health_cache;
pub mod pipeline;
pub mod rate_limiter;
pub mod registry;

pub use auth::{AuthenticatedUser, TokenVerifier};
pub use context::{RequestContext, ResponseState};
pub use forwarder::{ProxyForwarder, ProxyInterceptor};
pub use gateway::GatewayService;
pub use health_cache::{HealthCache, HealthRecord, HealthStatus};
pub use pipeline::{RequestPipeline, Stage};
pub use rate_limiter::{LimiterClass, RateLimiters};
pub use registry::{Route, RouteTable, ServiceDescriptor, ServiceRegistry};
