use crate::config::DefaultQueryRunnerConfig;
use crate::{fibonacci_backoff_secs, QueryRunner};
use futures::future::BoxFuture;
use overpass_cache::CacheProvider;
use overpass_core::events::ClientEvent;
use overpass_core::Clock;
use overpass_error::{ClientError, QueryRejectCause};
use overpass_query::Query;

/// The default query runner.
///
/// It retries with an increasing Fibonacci back-off when the server is too
/// busy, doubles `[timeout:*]`/`[maxsize:*]` when the server cancelled a
/// query for exceeding them, limits the number of tries, and can optionally
/// cache successful results by fingerprint.
///
/// It does *not* limit total run time (that is the client's `run_timeout_secs`
/// budget) and never lowers either setting.
pub struct DefaultQueryRunner {
    config: DefaultQueryRunnerConfig,
}

impl DefaultQueryRunner {
    /// Builds a runner from `config`.
    pub fn new(config: DefaultQueryRunnerConfig) -> Self {
        Self { config }
    }

    async fn cache_read(&self, query: &Query) {
        if self.config.cache_ttl_secs == 0 {
            return;
        }
        let Some(provider) = &self.config.cache_provider else {
            return;
        };

        if let Some(response) = provider.read(&query.cache_key()).await {
            let nbytes = serde_json::to_vec(&response).map(|v| v.len()).unwrap_or(0);
            query.succeed_try(&overpass_core::SystemClock, response, nbytes);
            self.config.event_listeners.emit(&ClientEvent::CacheLookup {
                hit: true,
                timestamp: std::time::Instant::now(),
            });
        } else {
            self.config.event_listeners.emit(&ClientEvent::CacheLookup {
                hit: false,
                timestamp: std::time::Instant::now(),
            });
        }
    }

    async fn cache_write(&self, query: &Query) {
        if self.config.cache_ttl_secs == 0 {
            return;
        }
        let Some(provider) = &self.config.cache_provider else {
            return;
        };
        let Some(response) = query.response() else {
            return;
        };

        provider
            .write(&query.cache_key(), &response, self.config.cache_ttl_secs)
            .await;
    }
}

impl QueryRunner for DefaultQueryRunner {
    fn call<'a>(&'a self, query: &'a Query, clock: &'a dyn Clock) -> BoxFuture<'a, Result<(), ClientError>> {
        Box::pin(async move {
            if query.nb_tries() == 0 {
                self.cache_read(query).await;
            }

            if query.done() {
                if !query.was_cached() {
                    self.cache_write(query).await;
                }
                return Ok(());
            }

            let Some(err) = query.error() else {
                // First try of a fresh query: nothing to decide yet.
                return Ok(());
            };

            if !err.should_retry() || query.nb_tries() == self.config.max_tries {
                return Err(err);
            }

            if let ClientError::QueryRejectError { cause, .. } = &err {
                match cause {
                    QueryRejectCause::TooBusy => {
                        let backoff = fibonacci_backoff_secs(query.nb_tries());
                        self.config.event_listeners.emit(&ClientEvent::Backoff {
                            duration: std::time::Duration::from_secs_f64(backoff),
                            timestamp: clock.now(),
                        });
                        clock.sleep(std::time::Duration::from_secs_f64(backoff)).await;
                    }
                    QueryRejectCause::TooManyQueries => {
                        // The client enforces the cooldown; nothing to do here.
                    }
                    QueryRejectCause::ExceededTimeout => {
                        let doubled = query.timeout_secs() * 2;
                        query
                            .set_timeout_secs(doubled)
                            .expect("doubled timeout is always >= 1");
                    }
                    QueryRejectCause::ExceededMaxsize => {
                        let doubled = query.maxsize_mib() * 2;
                        query
                            .set_maxsize_mib(doubled)
                            .expect("doubled maxsize is always > 0");
                    }
                }
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overpass_cache::CacheProvider;
    use overpass_core::SystemClock;
    use overpass_error::QueryContext;

    fn ctx() -> QueryContext {
        QueryContext::new()
    }

    #[tokio::test]
    async fn first_call_on_fresh_query_is_a_noop() {
        let runner = DefaultQueryRunner::new(DefaultQueryRunnerConfig::builder().build().unwrap());
        let query = Query::new("node(1);out;", ctx()).unwrap();

        runner.call(&query, &SystemClock).await.unwrap();
        assert!(!query.done());
        assert_eq!(query.nb_tries(), 0);
    }

    #[tokio::test]
    async fn exceeded_timeout_doubles_setting() {
        let runner = DefaultQueryRunner::new(DefaultQueryRunnerConfig::builder().build().unwrap());
        let query = Query::new("[timeout:30];node(1);out;", ctx()).unwrap();

        query.begin_try(&SystemClock);
        query.fail_try(ClientError::QueryRejectError {
            kwargs: ctx(),
            remarks: vec![],
            cause: QueryRejectCause::ExceededTimeout,
            timed_out_after_secs: Some(30),
            oom_using_mib: None,
        });
        query.end_try();

        runner.call(&query, &SystemClock).await.unwrap();
        assert_eq!(query.timeout_secs(), 60);
    }

    #[tokio::test]
    async fn exceeded_maxsize_doubles_setting() {
        let runner = DefaultQueryRunner::new(DefaultQueryRunnerConfig::builder().build().unwrap());
        let query = Query::new("[maxsize:268435456];node(1);out;", ctx()).unwrap();

        query.begin_try(&SystemClock);
        query.fail_try(ClientError::QueryRejectError {
            kwargs: ctx(),
            remarks: vec![],
            cause: QueryRejectCause::ExceededMaxsize,
            timed_out_after_secs: None,
            oom_using_mib: Some(300),
        });
        query.end_try();

        runner.call(&query, &SystemClock).await.unwrap();
        assert_eq!(query.maxsize_mib(), 512);
    }

    #[tokio::test]
    async fn gives_up_after_max_tries() {
        let runner = DefaultQueryRunner::new(
            DefaultQueryRunnerConfig::builder().max_tries(1).build().unwrap(),
        );
        let query = Query::new("node(1);out;", ctx()).unwrap();

        query.begin_try(&SystemClock);
        query.fail_try(ClientError::QueryRejectError {
            kwargs: ctx(),
            remarks: vec![],
            cause: QueryRejectCause::TooBusy,
            timed_out_after_secs: None,
            oom_using_mib: None,
        });
        query.end_try();

        let err = runner.call(&query, &SystemClock).await.unwrap_err();
        assert!(matches!(err, ClientError::QueryRejectError { .. }));
    }

    #[tokio::test]
    async fn query_language_error_is_never_retried() {
        let runner = DefaultQueryRunner::new(DefaultQueryRunnerConfig::builder().build().unwrap());
        let query = Query::new("node(1);out;", ctx()).unwrap();

        query.begin_try(&SystemClock);
        query.fail_try(ClientError::QueryLanguageError {
            kwargs: ctx(),
            remarks: vec!["parse error: Key expected".into()],
        });
        query.end_try();

        let err = runner.call(&query, &SystemClock).await.unwrap_err();
        assert!(matches!(err, ClientError::QueryLanguageError { .. }));
    }

    #[tokio::test]
    async fn cache_hit_populates_response_with_zero_tries() {
        let dir = std::env::temp_dir().join(format!("overpass-runner-test-{}", std::process::id()));
        let provider = std::sync::Arc::new(overpass_cache::FileCacheProvider::new(dir));
        let query = Query::new("node(1);out;", ctx()).unwrap();

        let response = serde_json::json!({"elements": []});
        provider.write(&query.cache_key(), &response, 60).await;

        let runner = DefaultQueryRunner::new(
            DefaultQueryRunnerConfig::builder()
                .cache_ttl_secs(60)
                .cache_provider(provider)
                .build()
                .unwrap(),
        );

        runner.call(&query, &SystemClock).await.unwrap();
        assert!(query.done());
        assert!(query.was_cached());
        assert_eq!(query.nb_tries(), 0);
    }
}
