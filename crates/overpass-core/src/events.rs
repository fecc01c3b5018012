//! A minimal event system for observability across the client, runner, and cache.
//!
//! A single event enum per observable subsystem, a listener trait, and a
//! listener collection that swallows (and optionally logs/counts) panicking
//! listeners so one bad listener can't take down a query run.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use std::any::Any;

/// Events emitted while running a query.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A try was started.
    TryStarted { nb_tries: u32, timestamp: Instant },
    /// A try succeeded.
    TrySucceeded {
        nb_tries: u32,
        timestamp: Instant,
        response_bytes: usize,
    },
    /// A try failed.
    TryFailed {
        nb_tries: u32,
        timestamp: Instant,
        message: String,
    },
    /// The client is sleeping out a server-reported cooldown.
    Cooldown { duration: Duration, timestamp: Instant },
    /// The default runner is backing off before retrying a busy server.
    Backoff { duration: Duration, timestamp: Instant },
    /// A cache lookup resolved.
    CacheLookup { hit: bool, timestamp: Instant },
}

impl ClientEvent {
    /// A stable, short name for this event's kind, used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::TryStarted { .. } => "try_started",
            ClientEvent::TrySucceeded { .. } => "try_succeeded",
            ClientEvent::TryFailed { .. } => "try_failed",
            ClientEvent::Cooldown { .. } => "cooldown",
            ClientEvent::Backoff { .. } => "backoff",
            ClientEvent::CacheLookup { .. } => "cache_lookup",
        }
    }
}

/// Receives [`ClientEvent`]s emitted during a query run.
pub trait EventListener: Send + Sync {
    /// Called synchronously whenever an event occurs.
    fn on_event(&self, event: &ClientEvent);
}

type BoxedEventListener = Arc<dyn EventListener>;

/// A collection of event listeners, cloneable and shareable across tasks.
#[derive(Clone, Default)]
pub struct EventListeners {
    listeners: Vec<BoxedEventListener>,
}

impl EventListeners {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Returns `true` if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Emits an event to every registered listener.
    ///
    /// A panicking listener is caught so the remaining listeners still run;
    /// with the `tracing` feature enabled the panic is logged as a warning,
    /// with `metrics` enabled a counter is incremented.
    pub fn emit(&self, event: &ClientEvent) {
        for listener in &self.listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if let Err(_panic_payload) = result {
                #[cfg(feature = "tracing")]
                log_listener_panic(event, _panic_payload.as_ref());

                #[cfg(feature = "metrics")]
                record_listener_panic_metric(event);
            }
        }
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}

/// A function-based [`EventListener`].
pub struct FnListener<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    f: F,
}

impl<F> FnListener<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    /// Wraps `f` as an [`EventListener`].
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventListener for FnListener<F>
where
    F: Fn(&ClientEvent) + Send + Sync,
{
    fn on_event(&self, event: &ClientEvent) {
        (self.f)(event)
    }
}

#[cfg(feature = "tracing")]
fn log_listener_panic(event: &ClientEvent, panic_payload: &(dyn Any + Send)) {
    let panic_message = panic_payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic_payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    tracing::warn!(
        event_kind = event.kind(),
        panic_message = %panic_message,
        "overpass event listener panicked"
    );
}

#[cfg(feature = "metrics")]
fn record_listener_panic_metric(event: &ClientEvent) {
    metrics::counter!(
        "overpass_event_listener_panics_total",
        "event_kind" => event.kind()
    )
    .increment(1);
}
