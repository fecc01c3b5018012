//! The query runner abstraction and its default retry/backoff/cache policy.

mod config;
mod default_runner;

pub use config::{DefaultQueryRunnerConfig, DefaultQueryRunnerConfigBuilder, RunnerConfigError};
pub use default_runner::DefaultQueryRunner;

use futures::future::BoxFuture;
use overpass_core::Clock;
use overpass_error::ClientError;
use overpass_query::Query;

/// A runner is consulted before every try, and once after the last try.
///
/// Returning normally with the query done surfaces success; returning
/// normally with the query still pending performs one more try. Raising
/// `query.error()` gives up with that error; any other `ClientError` is a
/// runner bug the client wraps as a programming error.
pub trait QueryRunner: Send + Sync {
    /// Consults the policy for `query`'s current state.
    fn call<'a>(&'a self, query: &'a Query, clock: &'a dyn Clock) -> BoxFuture<'a, Result<(), ClientError>>;
}

/// Fibonacci back-off in seconds, keyed by try count: `1, 2, 3, 5, 8, 13, ...`.
pub fn fibonacci_backoff_secs(nb_tries: u32) -> f64 {
    let (mut a, mut b) = (1.0_f64, 2.0_f64);
    for _ in 0..nb_tries {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}
