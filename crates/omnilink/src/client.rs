//! Caller-facing facade over one server connection.
//!
//! [`Client::submit`] is the raw path: register, enqueue, return a handle.
//! [`Client::request`] is the resilient path: the retry policy wraps the
//! circuit breaker, which wraps submit + wait.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Arguments, Response};
use crate::bridge::transport::Channel;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{BridgeConfig, ConfigError};
use crate::error::BridgeError;
use crate::events::{EventDispatcher, EventListener, SubscriptionId};
use crate::retry::RetryPolicy;
use crate::tracker::{ErrorHook, RequestTracker, ResponseHandle};

/// Options applied when connecting a [`Client`].
pub struct ClientBuilder {
    config: BridgeConfig,
    retry_policy: Option<RetryPolicy>,
    error_hook: Option<ErrorHook>,
}

impl ClientBuilder {
    /// Replace the policy built from `config.retry`, e.g. to set a predicate.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Observe transport failures of submitted requests.
    pub fn error_hook(mut self, hook: impl Fn(u64, &BridgeError) + Send + Sync + 'static) -> Self {
        self.error_hook = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and start the tracker on `channel`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self, channel: Channel) -> Result<Client, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let dispatcher = Arc::new(EventDispatcher::new(config.dispatcher_pool_size));
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        let retry = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::new(config.retry.clone()));
        let tracker = RequestTracker::start(
            channel,
            Arc::clone(&config),
            Arc::clone(&dispatcher),
            self.error_hook,
        );

        Ok(Client {
            tracker,
            dispatcher,
            breaker,
            retry,
            config,
            shutdown: CancellationToken::new(),
        })
    }
}

pub struct Client {
    tracker: RequestTracker,
    dispatcher: Arc<EventDispatcher>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    config: Arc<BridgeConfig>,
    shutdown: CancellationToken,
}

impl Client {
    pub fn builder(config: BridgeConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            retry_policy: None,
            error_hook: None,
        }
    }

    /// Connect with default options.
    pub fn connect(channel: Channel, config: BridgeConfig) -> Result<Self, ConfigError> {
        Self::builder(config).connect(channel)
    }

    /// Submit without retry or circuit breaking. Never blocks.
    pub fn submit(
        &self,
        command: impl Into<String>,
        arguments: Arguments,
    ) -> Result<ResponseHandle, BridgeError> {
        self.tracker.submit(command, arguments)
    }

    /// Submit and wait under the retry policy and circuit breaker.
    ///
    /// Each attempt is a fresh request with its own correlation id and waits
    /// up to the configured request timeout.
    pub async fn request(
        &self,
        command: &str,
        arguments: Arguments,
    ) -> Result<Response, BridgeError> {
        self.retry
            .execute_async(&self.shutdown, || {
                let arguments = arguments.clone();
                async move {
                    self.breaker
                        .call_async(|| async { self.tracker.submit(command, arguments)?.wait().await })
                        .await
                }
            })
            .await
    }

    /// Listen for one event name.
    pub fn subscribe(
        &self,
        event_name: impl Into<String>,
        listener: Arc<dyn EventListener>,
    ) -> SubscriptionId {
        self.dispatcher.register_listener(event_name, listener)
    }

    /// Listen for every event.
    pub fn subscribe_all(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.dispatcher.register_global_listener(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Cancel pending requests and retry waits, stop the loops and the
    /// dispatcher. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.shutdown().await;
        self.dispatcher.close();
    }

    pub fn is_running(&self) -> bool {
        self.tracker.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.tracker.is_connected()
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.pending_count()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn failure_count(&self) -> u32 {
        self.breaker.failure_count()
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}
