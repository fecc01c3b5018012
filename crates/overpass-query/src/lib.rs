//! The mutable Overpass query object: settings rewriting, fingerprinting,
//! and the six state transitions that drive a query across retries.

mod error;
mod query;
mod settings;

pub use error::QueryBuildError;
pub use query::{Query, RequestTimeout};
pub use settings::{DEFAULT_MAXSIZE_BYTES, DEFAULT_TIMEOUT_SECS};
