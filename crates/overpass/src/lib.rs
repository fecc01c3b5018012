//! Rate-limit-aware, retrying async client for the [Overpass
//! API](https://wiki.openstreetmap.org/wiki/Overpass_API), the read-only query
//! service over OpenStreetMap data.
//!
//! `overpass` wraps the quirks of running non-trivial queries against a public,
//! heavily rate-limited instance: polling `/api/status` to size a slot
//! semaphore, honoring server-announced cooldowns, retrying on transient
//! failures with exponential backoff, doubling `timeout`/`maxsize` settings
//! when the server rejects a query for exceeding them, and optionally caching
//! results to disk across runs.
//!
//! # Quick Start
//!
//! ```no_run
//! use overpass::{Client, ClientConfig, Query, QueryContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::builder().build()?)?;
//! let query = Query::new("[out:json]; node(1); out;", QueryContext::new())?;
//! client.run_query(&query, true).await?;
//! let response = query.response().expect("run_query succeeded");
//! println!("{response}");
//! # Ok(())
//! # }
//! ```
//!
//! # Crate Layout
//!
//! This crate re-exports the public API of its component crates:
//!
//! - [`overpass_query`] - the [`Query`] object: settings, state transitions, fingerprinting
//! - [`overpass_client`] - the [`Client`]: HTTP session, slot semaphore, try-loop orchestration
//! - [`overpass_runner`] - the retry/backoff/cache policy a [`Client`] delegates to
//! - [`overpass_error`] - the [`ClientError`] taxonomy
//! - [`overpass_status`] - the `/api/status` parser
//! - [`overpass_cache`] - the file-backed result cache
//! - [`overpass_core`] - the clock abstraction and event system shared by the above

pub use overpass_cache::{CacheProvider, FileCacheProvider};
pub use overpass_client::{
    default_user_agent, Client, ClientConfig, ClientConfigBuilder, ClientConfigError,
    DEFAULT_INSTANCE,
};
pub use overpass_core::{ClientEvent, Clock, EventListener, MockClock, SystemClock};
pub use overpass_error::{ClientError, GiveupCause, QueryContext, QueryRejectCause};
pub use overpass_query::{Query, QueryBuildError, RequestTimeout};
pub use overpass_runner::{DefaultQueryRunner, DefaultQueryRunnerConfig, QueryRunner};
pub use overpass_status::Status;
