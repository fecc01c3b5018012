//! The mutable query object and its state transitions.

use crate::error::QueryBuildError;
use crate::settings::{self, DEFAULT_MAXSIZE_BYTES, DEFAULT_TIMEOUT_SECS};
use overpass_core::Clock;
use overpass_error::{ClientError, QueryContext};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

const COPYRIGHT_NOTICE: &str = "The data included in this document is from www.openstreetmap.org. The data is made available under ODbL.";

/// Per-request socket and total timeout budget, independent of the
/// server-side `[timeout:*]` setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestTimeout {
    /// Total HTTP call budget excluding the server-side query execution time.
    pub total_without_query_secs: f64,
    /// Socket connect timeout, if bounded separately.
    pub sock_connect_secs: Option<f64>,
    /// Per-read socket timeout, if bounded separately.
    pub each_sock_read_secs: Option<f64>,
}

impl RequestTimeout {
    /// Builds a request timeout, validating that every set field is positive
    /// and finite.
    pub fn new(
        total_without_query_secs: f64,
        sock_connect_secs: Option<f64>,
        each_sock_read_secs: Option<f64>,
    ) -> Result<Self, QueryBuildError> {
        check_positive_finite("total_without_query_secs", total_without_query_secs)?;
        if let Some(v) = sock_connect_secs {
            check_positive_finite("sock_connect_secs", v)?;
        }
        if let Some(v) = each_sock_read_secs {
            check_positive_finite("each_sock_read_secs", v)?;
        }
        Ok(Self {
            total_without_query_secs,
            sock_connect_secs,
            each_sock_read_secs,
        })
    }
}

fn check_positive_finite(field: &'static str, value: f64) -> Result<(), QueryBuildError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(QueryBuildError::InvalidRequestTimeout { field, value })
    }
}

impl Default for RequestTimeout {
    fn default() -> Self {
        Self {
            total_without_query_secs: 20.0,
            sock_connect_secs: None,
            each_sock_read_secs: None,
        }
    }
}

struct QueryState {
    settings: BTreeMap<String, String>,
    run_timeout_secs: Option<f64>,
    request_timeout: RequestTimeout,
    nb_tries: u32,
    error: Option<ClientError>,
    response: Option<Arc<Value>>,
    response_bytes: usize,
    time_start: Option<Instant>,
    time_start_try: Option<Instant>,
    time_start_request: Option<Instant>,
    time_end_try: Option<Instant>,
    max_timed_out_after_secs: Option<u64>,
}

impl QueryState {
    fn new(settings: BTreeMap<String, String>) -> Self {
        Self {
            settings,
            run_timeout_secs: None,
            request_timeout: RequestTimeout::default(),
            nb_tries: 0,
            error: None,
            response: None,
            response_bytes: 0,
            time_start: None,
            time_start_try: None,
            time_start_request: None,
            time_end_try: None,
            max_timed_out_after_secs: None,
        }
    }
}

/// One logical Overpass query, across all of its tries.
///
/// Mutation happens only through the six state transitions below, and only
/// while holding the run lock (see [`Query::try_acquire_run_lock`]); readers
/// can call the accessor methods freely from any task.
pub struct Query {
    input_code: String,
    kwargs: QueryContext,
    run_lock: AsyncMutex<()>,
    state: Mutex<QueryState>,
}

impl Query {
    /// Builds a new, pending query from `input_code`.
    ///
    /// Fails if `input_code` declares a non-`json` `[out:*]` setting (the
    /// core always requests JSON).
    pub fn new(input_code: impl Into<String>, kwargs: QueryContext) -> Result<Self, QueryBuildError> {
        let input_code = input_code.into();
        let settings = settings::parse_settings(&input_code)?;
        Ok(Self {
            input_code,
            kwargs,
            run_lock: AsyncMutex::new(()),
            state: Mutex::new(QueryState::new(settings)),
        })
    }

    /// The original, unmodified Overpass QL source.
    pub fn input_code(&self) -> &str {
        &self.input_code
    }

    /// User-attached identifiers for logging and telemetry.
    pub fn kwargs(&self) -> &QueryContext {
        &self.kwargs
    }

    /// Attempts to acquire the run lock without blocking.
    ///
    /// Returns [`ClientError::AlreadyRunningError`] if another task already
    /// holds it — queries are not meant to be run concurrently from two
    /// places at once.
    pub fn try_acquire_run_lock(&self) -> Result<MutexGuard<'_, ()>, ClientError> {
        self.run_lock
            .try_lock()
            .map_err(|_| ClientError::AlreadyRunningError {
                kwargs: self.kwargs.clone(),
            })
    }

    /// Current try count.
    pub fn nb_tries(&self) -> u32 {
        self.state.lock().expect("query state mutex poisoned").nb_tries
    }

    /// The error of the most recent try, if any.
    pub fn error(&self) -> Option<ClientError> {
        self.state.lock().expect("query state mutex poisoned").error.clone()
    }

    /// The successful response, if the query is done.
    pub fn response(&self) -> Option<Arc<Value>> {
        self.state.lock().expect("query state mutex poisoned").response.clone()
    }

    /// Byte length of the successful response body.
    pub fn response_bytes(&self) -> usize {
        self.state.lock().expect("query state mutex poisoned").response_bytes
    }

    /// `true` once a successful response has been recorded.
    pub fn done(&self) -> bool {
        self.state.lock().expect("query state mutex poisoned").response.is_some()
    }

    /// `true` if the query succeeded on its very first try (a cache hit, per
    /// the default runner).
    pub fn was_cached(&self) -> bool {
        let state = self.state.lock().expect("query state mutex poisoned");
        state.response.is_some() && state.nb_tries == 0
    }

    /// The largest server-observed cancel-by-timeout of any prior try.
    pub fn max_timed_out_after_secs(&self) -> Option<u64> {
        self.state
            .lock()
            .expect("query state mutex poisoned")
            .max_timed_out_after_secs
    }

    /// Current `[timeout:*]` setting, in seconds.
    pub fn timeout_secs(&self) -> u64 {
        let state = self.state.lock().expect("query state mutex poisoned");
        state.settings["timeout"].parse().unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Overrides the `[timeout:*]` setting. The default runner only ever
    /// increases this value.
    ///
    /// `value` must be >= 1.
    pub fn set_timeout_secs(&self, value: u64) -> Result<(), QueryBuildError> {
        if value < 1 {
            return Err(QueryBuildError::InvalidTimeout(value as i64));
        }
        let mut state = self.state.lock().expect("query state mutex poisoned");
        state.settings.insert("timeout".to_string(), value.to_string());
        Ok(())
    }

    /// Current `[maxsize:*]` setting, in mebibytes.
    pub fn maxsize_mib(&self) -> u64 {
        let state = self.state.lock().expect("query state mutex poisoned");
        let bytes: u64 = state.settings["maxsize"].parse().unwrap_or(DEFAULT_MAXSIZE_BYTES);
        bytes / 1024 / 1024
    }

    /// Overrides the `[maxsize:*]` setting, given in mebibytes. The default
    /// runner only ever increases this value.
    ///
    /// `value` must be > 0.
    pub fn set_maxsize_mib(&self, value: u64) -> Result<(), QueryBuildError> {
        if value == 0 {
            return Err(QueryBuildError::InvalidMaxsize(value as f64));
        }
        let mut state = self.state.lock().expect("query state mutex poisoned");
        state
            .settings
            .insert("maxsize".to_string(), (value * 1024 * 1024).to_string());
        Ok(())
    }

    /// The wall-clock budget across all tries, if any.
    pub fn run_timeout_secs(&self) -> Option<f64> {
        self.state.lock().expect("query state mutex poisoned").run_timeout_secs
    }

    /// Sets the wall-clock budget across all tries.
    pub fn set_run_timeout_secs(&self, value: Option<f64>) -> Result<(), QueryBuildError> {
        if let Some(v) = value {
            if !v.is_finite() || v <= 0.0 {
                return Err(QueryBuildError::InvalidRunTimeout(v));
            }
        }
        self.state.lock().expect("query state mutex poisoned").run_timeout_secs = value;
        Ok(())
    }

    /// The per-request socket/total timeout budget.
    pub fn request_timeout(&self) -> RequestTimeout {
        self.state.lock().expect("query state mutex poisoned").request_timeout
    }

    /// Sets the per-request socket/total timeout budget.
    pub fn set_request_timeout(&self, value: RequestTimeout) {
        self.state.lock().expect("query state mutex poisoned").request_timeout = value;
    }

    /// The effective QL sent to the server: the current settings declaration
    /// followed by the settings-stripped body.
    pub fn code(&self) -> String {
        let state = self.state.lock().expect("query state mutex poisoned");
        settings::rewrite(&state.settings, &self.input_code)
    }

    /// The effective QL sent to the server for a single try whose
    /// `[timeout:*]` is bounded below the configured `timeout_secs` (f.e. by
    /// the remaining run budget), without mutating the query's own settings
    /// so that a later retry still starts from the configured value.
    pub fn code_with_timeout_secs(&self, timeout_secs: u64) -> String {
        let mut settings = self.state.lock().expect("query state mutex poisoned").settings.clone();
        settings.insert("timeout".to_string(), timeout_secs.to_string());
        settings::rewrite(&settings, &self.input_code)
    }

    /// Stable digest of `input_code` with the settings declaration removed,
    /// used as the cache key.
    pub fn cache_key(&self) -> String {
        let stripped = settings::strip_settings(&self.input_code);
        settings::fingerprint(&stripped)
    }

    /// Total run duration so far.
    pub fn run_duration_secs(&self, clock: &dyn Clock) -> Option<f64> {
        let state = self.state.lock().expect("query state mutex poisoned");
        let start = state.time_start?;
        let end = state.time_end_try.unwrap_or_else(|| clock.now());
        Some(end.duration_since(start).as_secs_f64())
    }

    /// Duration of the most recent HTTP request, if it has finished and the
    /// response was not served from cache.
    pub fn request_duration_secs(&self) -> Option<f64> {
        let state = self.state.lock().expect("query state mutex poisoned");
        let start = state.time_start_request?;
        let end = state.time_end_try?;
        Some(end.duration_since(start).as_secs_f64())
    }

    /// `true` if `run_timeout_secs` is set and has been exceeded.
    pub fn run_timeout_elapsed(&self, clock: &dyn Clock) -> bool {
        let run_timeout = match self.run_timeout_secs() {
            Some(t) => t,
            None => return false,
        };
        matches!(self.run_duration_secs(clock), Some(d) if d > run_timeout)
    }

    /// Remaining run budget, rounded up to whole seconds, clamped to >= 0.
    pub fn run_duration_left_secs(&self, clock: &dyn Clock) -> Option<u64> {
        let run_timeout = self.run_timeout_secs()?;
        let elapsed = self.run_duration_secs(clock).unwrap_or(0.0);
        Some((run_timeout - elapsed).ceil().max(0.0) as u64)
    }

    /// The Overpass API version that produced the successful response.
    pub fn api_version(&self) -> Option<String> {
        let response = self.response()?;
        response.get("generator")?.as_str().map(str::to_string)
    }

    /// `timestamp_osm_base` of the successful response.
    pub fn timestamp_osm(&self) -> Option<String> {
        let response = self.response()?;
        response
            .get("osm3s")?
            .get("timestamp_osm_base")?
            .as_str()
            .map(str::to_string)
    }

    /// `timestamp_areas_base` of the successful response, when present.
    ///
    /// Absence is benign: not every query touches area data, so this field
    /// is optional even on success.
    pub fn timestamp_areas(&self) -> Option<String> {
        let response = self.response()?;
        response
            .get("osm3s")?
            .get("timestamp_areas_base")?
            .as_str()
            .map(str::to_string)
    }

    /// Copyright notice from the successful response, or the standard OSM
    /// notice if the query has not yet succeeded.
    pub fn copyright(&self) -> String {
        self.response()
            .and_then(|r| {
                r.get("osm3s")?
                    .get("copyright")?
                    .as_str()
                    .map(str::to_string)
            })
            .unwrap_or_else(|| COPYRIGHT_NOTICE.to_string())
    }

    /// Marks the beginning of a new try.
    pub fn begin_try(&self, clock: &dyn Clock) {
        let mut state = self.state.lock().expect("query state mutex poisoned");
        let now = clock.now();
        if state.time_start.is_none() {
            state.time_start = Some(now);
        }
        state.time_start_try = Some(now);
        state.time_start_request = None;
        state.time_end_try = None;
    }

    /// Marks the moment the HTTP request for the current try was sent.
    pub fn begin_request(&self, clock: &dyn Clock) {
        self.state.lock().expect("query state mutex poisoned").time_start_request = Some(clock.now());
    }

    /// Records a successful try.
    pub fn succeed_try(&self, clock: &dyn Clock, response: Value, nbytes: usize) {
        let mut state = self.state.lock().expect("query state mutex poisoned");
        state.time_end_try = Some(clock.now());
        state.response = Some(Arc::new(response));
        state.response_bytes = nbytes;
        state.error = None;
    }

    /// Records a failed try.
    pub fn fail_try(&self, err: ClientError) {
        let mut state = self.state.lock().expect("query state mutex poisoned");
        if let Some(secs) = err.timed_out_after().map(|d| d.as_secs()) {
            state.max_timed_out_after_secs = Some(
                state
                    .max_timed_out_after_secs
                    .map_or(secs, |prev| prev.max(secs)),
            );
        }
        state.error = Some(err);
    }

    /// Marks the end of the current try, advancing `nb_tries`.
    pub fn end_try(&self) {
        self.state.lock().expect("query state mutex poisoned").nb_tries += 1;
    }

    /// Reinitializes the query to its just-created state, preserving only
    /// `input_code` and `kwargs`.
    pub fn reset(&self) {
        let settings = settings::parse_settings(&self.input_code)
            .expect("input_code already validated at construction");
        *self.state.lock().expect("query state mutex poisoned") = QueryState::new(settings);
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let query = if self.kwargs.is_empty() {
            "query <no kwargs>".to_string()
        } else {
            format!("query {}", self.kwargs)
        };

        let state = self.state.lock().expect("query state mutex poisoned");
        let size_mib = state.response_bytes as f64 / 1024.0 / 1024.0;

        let details = if state.nb_tries == 0 && state.response.is_none() {
            "pending".to_string()
        } else if state.response.is_some() {
            format!("{size_mib:.2}mb")
        } else {
            let tries = if state.nb_tries == 1 { "try" } else { "tries" };
            format!("failing after {} {tries}", state.nb_tries)
        };

        write!(f, "{query} ({details})")
    }
}
