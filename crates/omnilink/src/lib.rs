//! omnilink: resilient stdio bridge to an out-of-process language-analysis server.
//!
//! The process manager spawns the server and hands its stdio to a
//! [`Client`] as a [`Channel`]. From there:
//!
//! - requests are framed with `Content-Length` headers and correlated with
//!   responses by `seq`/`request_seq` ([`tracker`])
//! - server events fan out to registered listeners ([`events`])
//! - [`Client::request`] adds bounded retry with backoff ([`retry`]) around a
//!   circuit breaker ([`circuit_breaker`])

pub mod bridge;
pub mod circuit_breaker;
mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod tracker;

pub use bridge::protocol::{Arguments, Event, Response};
pub use bridge::transport::Channel;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{Client, ClientBuilder};
pub use config::{BridgeConfig, CircuitBreakerConfig, ConfigError, RetryConfig};
pub use error::{BridgeError, ErrorKind};
pub use events::{EventDispatcher, EventListener, SubscriptionId};
pub use retry::RetryPolicy;
pub use tracker::{ErrorHook, RequestTracker, ResponseHandle};
