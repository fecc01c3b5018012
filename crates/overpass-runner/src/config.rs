use overpass_cache::CacheProvider;
use overpass_core::events::EventListeners;
use std::sync::Arc;

/// Raised when building a [`DefaultQueryRunnerConfig`] violates one of its
/// invariants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerConfigError {
    /// `max_tries` was set below 1.
    #[error("max_tries must be >= 1, got {0}")]
    InvalidMaxTries(u32),
}

/// Configuration for [`crate::DefaultQueryRunner`].
pub struct DefaultQueryRunnerConfig {
    pub(crate) max_tries: u32,
    pub(crate) cache_ttl_secs: u64,
    pub(crate) cache_provider: Option<Arc<dyn CacheProvider>>,
    pub(crate) event_listeners: EventListeners,
}

impl DefaultQueryRunnerConfig {
    /// Starts a builder with the documented defaults: `max_tries = 5`,
    /// caching disabled.
    pub fn builder() -> DefaultQueryRunnerConfigBuilder {
        DefaultQueryRunnerConfigBuilder::new()
    }
}

/// Builder for [`DefaultQueryRunnerConfig`].
pub struct DefaultQueryRunnerConfigBuilder {
    max_tries: u32,
    cache_ttl_secs: u64,
    cache_provider: Option<Arc<dyn CacheProvider>>,
    event_listeners: EventListeners,
}

impl DefaultQueryRunnerConfigBuilder {
    /// Starts a new builder with `max_tries = 5` and caching disabled.
    pub fn new() -> Self {
        Self {
            max_tries: 5,
            cache_ttl_secs: 0,
            cache_provider: None,
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the maximum number of tries before giving up. Must be >= 1.
    ///
    /// ```
    /// use overpass_runner::DefaultQueryRunnerConfig;
    ///
    /// let config = DefaultQueryRunnerConfig::builder().max_tries(3).build().unwrap();
    /// ```
    pub fn max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Sets how long a successful result is cached for. Zero disables
    /// caching (the default).
    pub fn cache_ttl_secs(mut self, cache_ttl_secs: u64) -> Self {
        self.cache_ttl_secs = cache_ttl_secs;
        self
    }

    /// Sets the cache backend. Required if `cache_ttl_secs` is non-zero;
    /// defaults to [`overpass_cache::FileCacheProvider::temp_dir`] otherwise.
    pub fn cache_provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.cache_provider = Some(provider);
        self
    }

    /// Registers a listener for runner-level events (backoff, cache lookups).
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: overpass_core::events::EventListener + 'static,
    {
        self.event_listeners.add(listener);
        self
    }

    /// Builds the configuration, validating `max_tries`.
    pub fn build(self) -> Result<DefaultQueryRunnerConfig, RunnerConfigError> {
        if self.max_tries < 1 {
            return Err(RunnerConfigError::InvalidMaxTries(self.max_tries));
        }

        let cache_provider = self.cache_provider.or_else(|| {
            if self.cache_ttl_secs > 0 {
                Some(Arc::new(overpass_cache::FileCacheProvider::temp_dir()) as Arc<dyn CacheProvider>)
            } else {
                None
            }
        });

        Ok(DefaultQueryRunnerConfig {
            max_tries: self.max_tries,
            cache_ttl_secs: self.cache_ttl_secs,
            cache_provider,
            event_listeners: self.event_listeners,
        })
    }
}

impl Default for DefaultQueryRunnerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
