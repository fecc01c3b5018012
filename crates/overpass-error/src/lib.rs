//! Error taxonomy for the Overpass API client.
//!
//! `ClientError` is a single, closed, `#[non_exhaustive]` enum rather than a
//! hierarchy of types: the original design has abstract parents
//! (`CallError`, `QueryError`, `ResponseError`) with children, including one
//! diamond (`QueryResponseError` is both a `QueryError` and a
//! `ResponseError`). Rust has no multiple inheritance, so the diamond is
//! flattened into the `ResponseError` variant carrying an optional
//! `query_kwargs` field; `is_query_response()` is true exactly when that
//! field is set.

use std::fmt;
use std::time::Duration;

mod kwargs;
pub use kwargs::QueryContext;

/// Why a `QueryRejectError` was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRejectCause {
    /// Gateway-level rejection: the server is overloaded.
    TooBusy,
    /// Per-IP slot budget exhausted.
    TooManyQueries,
    /// The query was cancelled by the server for exceeding `[timeout:*]`.
    ExceededTimeout,
    /// The query was cancelled by the server for exceeding `[maxsize:*]`.
    ExceededMaxsize,
}

impl fmt::Display for QueryRejectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryRejectCause::TooBusy => "server too busy",
            QueryRejectCause::TooManyQueries => "too many queries",
            QueryRejectCause::ExceededTimeout => "exceeded timeout",
            QueryRejectCause::ExceededMaxsize => "exceeded maxsize",
        };
        f.write_str(s)
    }
}

/// Why the run budget was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveupCause {
    /// Not enough budget left to even call `/api/status` before a cooldown.
    RunTimeoutBeforeStatusCall,
    /// The server-reported cooldown alone would exceed the remaining budget.
    RunTimeoutByCooldown,
    /// Not enough budget left to start another try.
    RunTimeoutBeforeQueryCall,
    /// The effective `[timeout:*]` for the next try would not exceed a prior
    /// server-observed cancel-by-timeout, so another try cannot succeed.
    ExpectingQueryTimeout,
    /// The run budget elapsed while a request was in flight.
    RunTimeoutDuringQueryCall,
}

impl fmt::Display for GiveupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GiveupCause::RunTimeoutBeforeStatusCall => "run budget exhausted before status call",
            GiveupCause::RunTimeoutByCooldown => "cooldown would exceed run budget",
            GiveupCause::RunTimeoutBeforeQueryCall => "run budget exhausted before query call",
            GiveupCause::ExpectingQueryTimeout => "next try cannot exceed prior observed timeout",
            GiveupCause::RunTimeoutDuringQueryCall => "run budget exhausted during query call",
        };
        f.write_str(s)
    }
}

/// The closed error hierarchy produced by the client, runner, and response
/// classifier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The runner itself raised something other than a [`ClientError`].
    #[error("runner error: {message}")]
    RunnerError {
        /// Description of the underlying panic or error.
        message: String,
    },

    /// The HTTP call failed without producing a response.
    #[error("call failed: {message}")]
    CallError {
        /// Description of the transport failure.
        message: String,
    },

    /// The request exceeded its deadline before a response arrived.
    #[error("call timed out after {after_secs:.1}s")]
    CallTimeoutError {
        /// How long the request ran before timing out.
        after_secs: f64,
    },

    /// A response was received but could not be interpreted.
    ///
    /// `query_kwargs` is set exactly when this represents the `QueryResponseError`
    /// diamond case: a query failed but the cause could not be classified into
    /// one of the `QueryRejectError` causes. [`ClientError::is_query_response`]
    /// reports this.
    #[error("response error: {message}")]
    ResponseError {
        /// HTTP status code of the response, if known.
        status: Option<u16>,
        /// Raw response body (truncated by the caller if very large).
        body: String,
        /// Human-readable description of what went wrong.
        message: String,
        /// Set when this error originated from a query whose rejection
        /// cause could not be classified (the `QueryResponseError` case).
        query_kwargs: Option<QueryContext>,
    },

    /// The run budget was exhausted.
    #[error("giving up: {cause} (after {after_secs:.1}s)")]
    GiveupError {
        /// Context of the query that gave up.
        kwargs: QueryContext,
        /// Elapsed run duration at the moment of giving up.
        after_secs: f64,
        /// Why the run gave up.
        cause: GiveupCause,
    },

    /// The query language itself was rejected (parse/static/encoding error).
    /// Never retried.
    #[error("query language error: {}", remarks.join("; "))]
    QueryLanguageError {
        /// Context of the offending query.
        kwargs: QueryContext,
        /// Raw error fragments reported by the server.
        remarks: Vec<String>,
    },

    /// The server rejected the query for a recognized, recoverable reason.
    #[error("query rejected: {cause}")]
    QueryRejectError {
        /// Context of the rejected query.
        kwargs: QueryContext,
        /// Raw error fragments reported by the server.
        remarks: Vec<String>,
        /// The recognized rejection cause.
        cause: QueryRejectCause,
        /// Extracted from "Query timed out ... after D seconds." messages.
        timed_out_after_secs: Option<u64>,
        /// Extracted from "... using about M MB of RAM." messages, converted to MiB.
        oom_using_mib: Option<u64>,
    },

    /// `RunQuery` was called on a query object that already has a run in
    /// progress.
    #[error("query is already running")]
    AlreadyRunningError {
        /// Context of the query already in flight.
        kwargs: QueryContext,
    },
}

impl ClientError {
    /// Whether the default runner should retry after this error.
    pub fn should_retry(&self) -> bool {
        match self {
            ClientError::RunnerError { .. } => false,
            ClientError::CallError { .. } => true,
            ClientError::CallTimeoutError { .. } => true,
            ClientError::ResponseError { .. } => true,
            ClientError::GiveupError { .. } => false,
            ClientError::QueryLanguageError { .. } => false,
            ClientError::QueryRejectError { .. } => true,
            ClientError::AlreadyRunningError { .. } => false,
        }
    }

    /// True for a `ResponseError` whose status is >= 500, or whose body
    /// failed JSON decoding entirely.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            ClientError::ResponseError { status: Some(s), .. } if *s >= 500
        ) || matches!(
            self,
            ClientError::ResponseError { status: None, .. }
        )
    }

    /// True for the diamond `QueryResponseError` case: a `ResponseError`
    /// that originated from a query whose rejection cause could not be
    /// classified.
    pub fn is_query_response(&self) -> bool {
        matches!(self, ClientError::ResponseError { query_kwargs: Some(_), .. })
    }

    /// True for [`ClientError::CallTimeoutError`].
    pub fn is_call_timeout(&self) -> bool {
        matches!(self, ClientError::CallTimeoutError { .. })
    }

    /// True for [`QueryRejectCause::TooBusy`] rejections.
    pub fn is_too_busy(&self) -> bool {
        matches!(
            self,
            ClientError::QueryRejectError { cause: QueryRejectCause::TooBusy, .. }
        )
    }

    /// True for [`QueryRejectCause::TooManyQueries`] rejections.
    pub fn is_too_many_queries(&self) -> bool {
        matches!(
            self,
            ClientError::QueryRejectError { cause: QueryRejectCause::TooManyQueries, .. }
        )
    }

    /// True for [`QueryRejectCause::ExceededTimeout`] rejections.
    pub fn is_exceeding_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::QueryRejectError { cause: QueryRejectCause::ExceededTimeout, .. }
        )
    }

    /// True for [`QueryRejectCause::ExceededMaxsize`] rejections.
    pub fn is_exceeding_maxsize(&self) -> bool {
        matches!(
            self,
            ClientError::QueryRejectError { cause: QueryRejectCause::ExceededMaxsize, .. }
        )
    }

    /// The `timed_out_after_secs` duration, if this is an `ExceededTimeout`
    /// rejection that reported one.
    pub fn timed_out_after(&self) -> Option<Duration> {
        match self {
            ClientError::QueryRejectError {
                timed_out_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}
