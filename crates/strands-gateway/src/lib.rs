//! The gateway: authentication, per-client rate limiting, and proxy routing
//! to the internal services with retries and per-downstream breakers.

pub mod auth;
pub mod http;
pub mod proxy;
pub mod rate_limit;

pub use auth::{AuthContext, AuthManager, CredentialStore, InMemoryCredentials, UserRole};
pub use proxy::{ProxyRouter, RouteRule};
pub use rate_limit::RateLimiter;
