//! Builder-style configuration for [`crate::Client`].

use overpass_core::events::EventListeners;
use overpass_core::{Clock, SystemClock};
use overpass_runner::{DefaultQueryRunner, DefaultQueryRunnerConfig};
use std::sync::Arc;

use crate::QueryRunner;

/// The main public Overpass API instance.
pub const DEFAULT_INSTANCE: &str = "https://overpass-api.de/api/";

/// User-Agent sent with every request, identifying this library and its version.
pub fn default_user_agent() -> String {
    format!(
        "overpass-client/{} (https://github.com/overpass-rs/overpass)",
        env!("CARGO_PKG_VERSION")
    )
}

/// Raised when building a [`ClientConfig`] violates one of its invariants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientConfigError {
    /// `concurrency` was <= 0.
    #[error("concurrency must be > 0, got {0}")]
    InvalidConcurrency(usize),
    /// `status_timeout_secs` was set but not finite and positive.
    #[error("status_timeout_secs must be finite and > 0, got {0}")]
    InvalidStatusTimeout(f64),
    /// `user_agent` is not a valid HTTP header value.
    #[error("user_agent '{0}' is not a valid header value")]
    InvalidUserAgent(String),
    /// The underlying HTTP session could not be built.
    #[error("failed to build HTTP session: {0}")]
    BuildFailed(String),
}

/// Configuration for a [`crate::Client`].
pub struct ClientConfig {
    pub(crate) base_url: String,
    pub(crate) user_agent: String,
    pub(crate) concurrency: usize,
    pub(crate) status_timeout_secs: Option<f64>,
    pub(crate) runner: Arc<dyn QueryRunner>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) event_listeners: EventListeners,
}

impl ClientConfig {
    /// Starts a builder with the documented defaults: the main public
    /// instance, a library-identifying user agent, `concurrency = 32`, no
    /// status timeout, and the default retry/backoff/cache runner.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    base_url: String,
    user_agent: String,
    concurrency: usize,
    status_timeout_secs: Option<f64>,
    runner: Option<Arc<dyn QueryRunner>>,
    clock: Arc<dyn Clock>,
    event_listeners: EventListeners,
}

impl ClientConfigBuilder {
    /// Starts a new builder with the documented defaults.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_INSTANCE.to_string(),
            user_agent: default_user_agent(),
            concurrency: 32,
            status_timeout_secs: None,
            runner: None,
            clock: Arc::new(SystemClock),
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the base URL of the Overpass API instance to talk to.
    /// Must end with a trailing slash, f.e. `"https://overpass-api.de/api/"`.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets the `User-Agent` header sent with every request.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the maximum number of simultaneous connections. In practice the
    /// amount of concurrent queries may be further limited by the number of
    /// slots the server advertises for this IP. Must be > 0.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Bounds how long a `/api/status` request may take. `None` (the
    /// default) means no timeout beyond the remaining run budget, if any.
    pub fn status_timeout_secs(mut self, status_timeout_secs: f64) -> Self {
        self.status_timeout_secs = Some(status_timeout_secs);
        self
    }

    /// Overrides the query runner. Defaults to
    /// [`overpass_runner::DefaultQueryRunner`] with its own defaults.
    pub fn runner(mut self, runner: Arc<dyn QueryRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Overrides the clock used for try timestamps, cooldown sleeps, and
    /// backoff. Intended for tests; production code should leave this at
    /// the default [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a listener for client-level events (tries, cooldowns, backoff).
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: overpass_core::events::EventListener + 'static,
    {
        self.event_listeners.add(listener);
        self
    }

    /// Builds the configuration, validating `concurrency` and
    /// `status_timeout_secs`.
    pub fn build(self) -> Result<ClientConfig, ClientConfigError> {
        if self.concurrency == 0 {
            return Err(ClientConfigError::InvalidConcurrency(self.concurrency));
        }
        if let Some(t) = self.status_timeout_secs {
            if !t.is_finite() || t <= 0.0 {
                return Err(ClientConfigError::InvalidStatusTimeout(t));
            }
        }

        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(DefaultQueryRunner::new(
                DefaultQueryRunnerConfig::builder()
                    .build()
                    .expect("default runner config is always valid"),
            ))
        });

        Ok(ClientConfig {
            base_url: self.base_url,
            user_agent: self.user_agent,
            concurrency: self.concurrency,
            status_timeout_secs: self.status_timeout_secs,
            runner,
            clock: self.clock,
            event_listeners: self.event_listeners,
        })
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
