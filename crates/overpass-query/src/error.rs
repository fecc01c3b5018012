//! Construction-time validation errors, distinct from the runtime
//! [`overpass_error::ClientError`] hierarchy.

/// Raised when building a [`crate::Query`] or its timeout configuration
/// violates one of the documented boundary invariants.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryBuildError {
    /// `timeout_secs` was set below 1.
    #[error("timeout_secs must be >= 1, got {0}")]
    InvalidTimeout(i64),
    /// `maxsize_mib` was not finite or not positive.
    #[error("maxsize_mib must be finite and > 0, got {0}")]
    InvalidMaxsize(f64),
    /// `run_timeout_secs` was not finite or not positive.
    #[error("run_timeout_secs must be finite and > 0, got {0}")]
    InvalidRunTimeout(f64),
    /// A `request_timeout` field was <= 0.
    #[error("request timeout field '{field}' must be > 0, got {value}")]
    InvalidRequestTimeout {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },
    /// `input_code` declared a non-`json` `[out:*]` setting.
    #[error("[out:*] must be json, input_code declared '{0}'")]
    NonJsonOutput(String),
}
