//! The [`Client`] itself: HTTP session, lazily-sized slot semaphore, and the
//! per-query try loop.

use crate::config::ClientConfig;
use futures::FutureExt;
use overpass_core::events::{ClientEvent, EventListeners};
use overpass_core::Clock;
use overpass_error::{ClientError, GiveupCause};
use overpass_query::Query;
use overpass_response::RawResponse;
use overpass_status::Status;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};

use crate::config::ClientConfigError;
use crate::QueryRunner;

static KILLED_PID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\(pid (\d+)\)").expect("valid regex"));

/// A client for the Overpass API.
///
/// Requests are rate-limited according to the number of slots the server
/// advertises for this client's IP. By default, queries are retried whenever
/// the server is too busy, or the rate limit was exceeded; custom
/// [`QueryRunner`]s can implement other strategies.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
    concurrency: usize,
    status_timeout_secs: Option<f64>,
    runner: Arc<dyn QueryRunner>,
    clock: Arc<dyn Clock>,
    event_listeners: EventListeners,
    semaphore: OnceCell<Arc<Semaphore>>,
}

impl Client {
    /// Builds a client from `config`.
    ///
    /// Fails if `config.user_agent` is not a valid header value, or the
    /// underlying HTTP session cannot be constructed.
    pub fn new(config: ClientConfig) -> Result<Self, ClientConfigError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let ua_value = reqwest::header::HeaderValue::from_str(&config.user_agent)
            .map_err(|_| ClientConfigError::InvalidUserAgent(config.user_agent.clone()))?;
        headers.insert(reqwest::header::USER_AGENT, ua_value);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .pool_max_idle_per_host(config.concurrency)
            .build()
            .map_err(|e| ClientConfigError::BuildFailed(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url,
            user_agent: config.user_agent,
            concurrency: config.concurrency,
            status_timeout_secs: config.status_timeout_secs,
            runner: config.runner,
            clock: config.clock,
            event_listeners: config.event_listeners,
            semaphore: OnceCell::new(),
        })
    }

    /// Checks the current API status.
    pub async fn status(&self) -> Result<Status, ClientError> {
        let timeout = self.status_timeout_secs.map(Duration::from_secs_f64);
        self.status_with_timeout(timeout).await
    }

    /// Cancels all running queries for this client's IP.
    ///
    /// Uses a fresh, ephemeral HTTP session so that a wedged connection pool
    /// or an exhausted slot semaphore cannot block termination.
    ///
    /// Returns the number of distinct queries that were terminated.
    pub async fn cancel_queries(&self, timeout_secs: Option<f64>) -> Result<usize, ClientError> {
        let fresh = reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| ClientError::CallError { message: e.to_string() })?;

        let mut req = fresh.get(format!("{}kill_my_queries", self.base_url));
        let timeout = timeout_secs.map(Duration::from_secs_f64);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let response = req.send().await.map_err(|e| map_reqwest_err(e, timeout))?;
        let body = response.text().await.map_err(|e| map_reqwest_err(e, timeout))?;

        let pids: HashSet<&str> = KILLED_PID_RE
            .captures_iter(&body)
            .map(|caps| caps.get(1).expect("group 1 always matches").as_str())
            .collect();

        Ok(pids.len())
    }

    /// Cancels all running queries (best-effort) and releases the session.
    ///
    /// Errors from [`cancel_queries`](Self::cancel_queries) are swallowed:
    /// by the time a caller wants to close a client, a failure to cancel
    /// in-flight queries is not actionable.
    pub async fn close(&self) {
        let _ = self.cancel_queries(None).await;
    }

    /// Sends `query` to the API and awaits its completion.
    ///
    /// "Running" the query entails acquiring a slot from the semaphore, the
    /// query request itself (which may be retried per the configured
    /// [`QueryRunner`]), status requests when the server is busy, and
    /// cooldown periods.
    ///
    /// The query runner is invoked before every try, and once after the
    /// last try.
    ///
    /// # Errors
    ///
    /// Returns the error of the last try if the query failed and
    /// `raise_on_failure` is `true`; the same error is also recorded on
    /// `query.error()`. A [`ClientError::RunnerError`] is always returned
    /// regardless of `raise_on_failure`, since a runner bug is not specific
    /// to this one query.
    pub async fn run_query(&self, query: &Query, raise_on_failure: bool) -> Result<(), ClientError> {
        let _guard = query.try_acquire_run_lock()?;

        if query.done() {
            return Ok(());
        }
        if query.nb_tries() > 0 {
            query.reset();
        }

        loop {
            match self.invoke_runner(query).await {
                RunnerOutcome::Continue => {}
                RunnerOutcome::Done => return Ok(()),
                RunnerOutcome::GiveUp(err) => {
                    return if raise_on_failure { Err(err) } else { Ok(()) };
                }
                RunnerOutcome::RunnerBug(err) => return Err(err),
            }

            if query.done() {
                return Ok(());
            }

            self.try_once(query).await;
        }
    }

    async fn invoke_runner(&self, query: &Query) -> RunnerOutcome {
        let outcome = AssertUnwindSafe(self.runner.call(query, &*self.clock)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {
                if query.done() {
                    RunnerOutcome::Done
                } else {
                    RunnerOutcome::Continue
                }
            }
            Ok(Err(err)) => {
                if query.error().as_ref() == Some(&err) {
                    RunnerOutcome::GiveUp(err)
                } else {
                    RunnerOutcome::RunnerBug(ClientError::RunnerError {
                        message: format!("query runner raised a ClientError other than query.error: {err}"),
                    })
                }
            }
            Err(panic_payload) => RunnerOutcome::RunnerBug(ClientError::RunnerError {
                message: panic_message(panic_payload.as_ref()),
            }),
        }
    }

    async fn try_once(&self, query: &Query) {
        query.begin_try(&*self.clock);

        self.event_listeners.emit(&ClientEvent::TryStarted {
            nb_tries: query.nb_tries(),
            timestamp: self.clock.now(),
        });

        match self.try_once_inner(query).await {
            Ok((value, nbytes)) => {
                query.succeed_try(&*self.clock, value, nbytes);
                self.event_listeners.emit(&ClientEvent::TrySucceeded {
                    nb_tries: query.nb_tries(),
                    timestamp: self.clock.now(),
                    response_bytes: nbytes,
                });
                #[cfg(feature = "metrics")]
                metrics::counter!("overpass_tries_total", "outcome" => "success").increment(1);
                query.end_try();
            }
            Err(err) => {
                self.event_listeners.emit(&ClientEvent::TryFailed {
                    nb_tries: query.nb_tries(),
                    timestamp: self.clock.now(),
                    message: err.to_string(),
                });
                #[cfg(feature = "metrics")]
                metrics::counter!("overpass_tries_total", "outcome" => "failure").increment(1);

                // A giveup raised before a request was ever dispatched (no slot
                // acquired, no budget left, cooldown exceeding the run budget, ...)
                // does not count as a completed try: `EndTry` is the last of the
                // documented transitions, and these giveups abort before it.
                // `RunTimeoutDuringQueryCall` is the one giveup cause that only
                // fires after `BeginRequest`, so that one still completes the try.
                let aborted_before_dispatch = matches!(
                    &err,
                    ClientError::GiveupError { cause, .. }
                        if *cause != GiveupCause::RunTimeoutDuringQueryCall
                );
                query.fail_try(err);
                if !aborted_before_dispatch {
                    query.end_try();
                }
            }
        }
    }

    async fn try_once_inner(&self, query: &Query) -> Result<(Value, usize), ClientError> {
        self.cooldown_phase(query).await?;

        let effective_timeout = self.effective_timeout_secs(query)?;
        let total_budget_secs = effective_timeout as f64 + query.request_timeout().total_without_query_secs;
        if total_budget_secs <= 0.0 {
            return Err(self.giveup(query, GiveupCause::RunTimeoutBeforeQueryCall));
        }
        let total_budget = Duration::from_secs_f64(total_budget_secs);

        let _permit = self.acquire_slot(query).await?;

        query.begin_request(&*self.clock);

        #[cfg(feature = "tracing")]
        tracing::info!(%query, "calling interpreter endpoint");

        let code = if effective_timeout == query.timeout_secs() {
            query.code()
        } else {
            query.code_with_timeout_secs(effective_timeout)
        };

        let response = self
            .http
            .post(format!("{}interpreter", self.base_url))
            .timeout(total_budget)
            .form(&[("data", code.as_str())])
            .send()
            .await
            .map_err(|e| self.map_request_err(e, query, total_budget))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        let body = response
            .text()
            .await
            .map_err(|e| self.map_request_err(e, query, total_budget))?;
        let nbytes = body.len();

        let raw = RawResponse { content_type, status, body };

        overpass_response::classify(&raw, query.kwargs())
            .map(|value| (value, nbytes))
            .map_err(|err| self.maybe_giveup_during_query(err, query))
    }

    async fn cooldown_phase(&self, query: &Query) -> Result<(), ClientError> {
        let Some(err) = query.error() else {
            return Ok(());
        };
        if !err.is_too_many_queries() {
            return Ok(());
        }

        let status_timeout = self.status_call_budget(query)?;
        let status = self.status_with_timeout(status_timeout).await?;

        if let Some(left) = query.run_duration_left_secs(&*self.clock) {
            if status.cooldown_secs > left {
                return Err(self.giveup(query, GiveupCause::RunTimeoutByCooldown));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(%query, cooldown_secs = status.cooldown_secs, "waiting out server-reported cooldown");

        self.event_listeners.emit(&ClientEvent::Cooldown {
            duration: Duration::from_secs(status.cooldown_secs),
            timestamp: self.clock.now(),
        });

        self.clock.sleep(Duration::from_secs(status.cooldown_secs)).await;
        Ok(())
    }

    fn status_call_budget(&self, query: &Query) -> Result<Option<Duration>, ClientError> {
        let run_left_secs = match query.run_timeout_secs() {
            Some(_) => {
                let left = query
                    .run_duration_left_secs(&*self.clock)
                    .expect("run_timeout_secs is set");
                if left == 0 {
                    return Err(self.giveup(query, GiveupCause::RunTimeoutBeforeStatusCall));
                }
                Some(left as f64)
            }
            None => None,
        };

        let combined = match (run_left_secs, self.status_timeout_secs) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        Ok(combined.map(Duration::from_secs_f64))
    }

    fn effective_timeout_secs(&self, query: &Query) -> Result<u64, ClientError> {
        let configured = query.timeout_secs();
        let left = query.run_duration_left_secs(&*self.clock);

        if left == Some(0) {
            return Err(self.giveup(query, GiveupCause::RunTimeoutBeforeQueryCall));
        }

        let effective = match left {
            Some(left) => configured.min(left),
            None => configured,
        };

        if let Some(max_prior) = query.max_timed_out_after_secs() {
            if effective <= max_prior {
                return Err(self.giveup(query, GiveupCause::ExpectingQueryTimeout));
            }
        }

        Ok(effective)
    }

    async fn acquire_slot(&self, query: &Query) -> Result<tokio::sync::OwnedSemaphorePermit, ClientError> {
        let semaphore = self.ensure_semaphore().await?;
        let acquire = Arc::clone(&semaphore).acquire_owned();

        match query.run_duration_left_secs(&*self.clock) {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), acquire).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_closed)) => Err(ClientError::CallError {
                    message: "slot semaphore closed".to_string(),
                }),
                Err(_elapsed) => Err(self.giveup(query, GiveupCause::RunTimeoutBeforeQueryCall)),
            },
            None => acquire.await.map_err(|_closed| ClientError::CallError {
                message: "slot semaphore closed".to_string(),
            }),
        }
    }

    async fn ensure_semaphore(&self) -> Result<Arc<Semaphore>, ClientError> {
        self.semaphore
            .get_or_try_init(|| async {
                let status = self.status().await?;
                let capacity = status
                    .slots
                    .map(|s| s as usize)
                    .unwrap_or(self.concurrency)
                    .min(self.concurrency)
                    .max(1);
                Ok::<_, ClientError>(Arc::new(Semaphore::new(capacity)))
            })
            .await
            .cloned()
    }

    async fn status_with_timeout(&self, timeout: Option<Duration>) -> Result<Status, ClientError> {
        let mut req = self.http.get(format!("{}status", self.base_url));
        if let Some(t) = timeout {
            req = req.timeout(t);
        }

        let response = req.send().await.map_err(|e| map_reqwest_err(e, timeout))?;
        let body = response.text().await.map_err(|e| map_reqwest_err(e, timeout))?;

        overpass_status::parse_status(&body)
    }

    fn map_request_err(&self, err: reqwest::Error, query: &Query, total_budget: Duration) -> ClientError {
        self.maybe_giveup_during_query(map_reqwest_err(err, Some(total_budget)), query)
    }

    fn maybe_giveup_during_query(&self, err: ClientError, query: &Query) -> ClientError {
        if matches!(err, ClientError::CallTimeoutError { .. }) && query.run_timeout_elapsed(&*self.clock) {
            self.giveup(query, GiveupCause::RunTimeoutDuringQueryCall)
        } else {
            err
        }
    }

    fn giveup(&self, query: &Query, cause: GiveupCause) -> ClientError {
        ClientError::GiveupError {
            kwargs: query.kwargs().clone(),
            after_secs: query.run_duration_secs(&*self.clock).unwrap_or(0.0),
            cause,
        }
    }
}

enum RunnerOutcome {
    Continue,
    Done,
    GiveUp(ClientError),
    RunnerBug(ClientError),
}

fn map_reqwest_err(err: reqwest::Error, total_budget: Option<Duration>) -> ClientError {
    if err.is_timeout() {
        ClientError::CallTimeoutError {
            after_secs: total_budget.map(|d| d.as_secs_f64()).unwrap_or(0.0),
        }
    } else {
        ClientError::CallError { message: err.to_string() }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use overpass_core::MockClock;
    use overpass_error::QueryContext;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn success_body() -> serde_json::Value {
        json!({
            "version": 0.6,
            "generator": "Overpass API",
            "osm3s": {"timestamp_osm_base": "2024-01-01T00:00:00Z", "copyright": "OSM"},
            "elements": [],
        })
    }

    async fn client_for(server: &MockServer) -> Client {
        let config = ClientConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .build()
            .unwrap();
        Client::new(config).unwrap()
    }

    #[tokio::test]
    async fn status_parses_server_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Rate limit: 2\n2 slots available now.\n"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let status = client.status().await.unwrap();
        assert_eq!(status.slots, Some(2));
        assert_eq!(status.free_slots, Some(2));
    }

    #[tokio::test]
    async fn cancel_queries_counts_unique_pids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kill_my_queries"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "Killing query (pid 123)...\nKilling query (pid 456)...\nKilling query (pid 123)...\n",
            ))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let killed = client.cancel_queries(None).await.unwrap();
        assert_eq!(killed, 2);
    }

    #[tokio::test]
    async fn run_query_succeeds_on_first_try() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Rate limit: 0\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interpreter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(success_body())
                    .insert_header("content-type", "application/json"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let query = Query::new("node(1);out;", QueryContext::new()).unwrap();

        client.run_query(&query, true).await.unwrap();

        assert!(query.done());
        assert_eq!(query.nb_tries(), 1);
        assert!(!query.was_cached());
    }

    #[tokio::test]
    async fn run_query_twice_raises_already_running() {
        let server = MockServer::start().await;
        let config = ClientConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .clock(Arc::new(MockClock::new()))
            .build()
            .unwrap();
        let client = Client::new(config).unwrap();
        let query = Arc::new(Query::new("node(1);out;", QueryContext::new()).unwrap());

        let _guard = query.try_acquire_run_lock().unwrap();
        let err = client.run_query(&query, true).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyRunningError { .. }));
    }

    #[tokio::test]
    async fn query_language_error_surfaces_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Rate limit: 0\n"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interpreter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(
                        r#"<p><strong style="color:#FF0000">Error</strong>: line 1: parse error: Key expected - '%' found.</p>"#,
                    )
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let query = Query::new("node(1);out;", QueryContext::new()).unwrap();

        let err = client.run_query(&query, true).await.unwrap_err();
        assert!(matches!(err, ClientError::QueryLanguageError { .. }));
        assert_eq!(query.nb_tries(), 1);
    }

    /// A giveup that fires before any request is dispatched (here, a cooldown
    /// that would exceed the run budget) must not count as a completed try:
    /// only the one real attempt that reached the server counted.
    #[tokio::test]
    async fn giveup_before_dispatch_does_not_inflate_try_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "Rate limit: 1\nSlot available after: 2024-01-01T00:00:20Z, in 20 seconds.\n",
            ))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/interpreter"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(
                        r#"<p><strong style="color:#FF0000">Error</strong>: Too many queries sent by this client. Please check /api/status for the quota of your IP address. </p>"#,
                    )
                    .insert_header("content-type", "text/html"),
            )
            .mount(&server)
            .await;

        let config = ClientConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .clock(Arc::new(MockClock::new()))
            .build()
            .unwrap();
        let client = Client::new(config).unwrap();
        let query = Query::new("node(1);out;", QueryContext::new()).unwrap();
        query.set_run_timeout_secs(Some(19.0)).unwrap();

        let err = client.run_query(&query, true).await.unwrap_err();
        assert!(matches!(err, ClientError::GiveupError { .. }));
        assert_eq!(query.nb_tries(), 1);
    }

    /// A run whose budget is already exhausted (no cooldown and no prior
    /// `ExceededTimeout` in play, e.g. a slow `CallError` or a Fibonacci
    /// backoff that alone consumed the whole budget) must give up before
    /// ever acquiring a slot or computing a request with `[timeout:0]`,
    /// rather than racing a zero-duration slot-acquisition timeout.
    #[tokio::test]
    async fn exhausted_run_budget_gives_up_before_acquiring_slot() {
        let server = MockServer::start().await;
        let clock = Arc::new(MockClock::new());
        let config = ClientConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .clock(Arc::clone(&clock))
            .build()
            .unwrap();
        let client = Client::new(config).unwrap();
        let query = Query::new("node(1);out;", QueryContext::new()).unwrap();
        query.set_run_timeout_secs(Some(5.0)).unwrap();

        query.begin_try(&*clock);
        clock.advance(Duration::from_secs(6));

        let err = client.try_once_inner(&query).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::GiveupError {
                cause: GiveupCause::RunTimeoutBeforeQueryCall,
                ..
            }
        ));
    }
}
