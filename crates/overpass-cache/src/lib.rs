//! A cache mapping a query's fingerprint to its last successful JSON
//! response, with a TTL and a process-wide disable switch.

use futures::future::BoxFuture;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const EXPIRATION_KEY: &str = "__expiration__";

static FORCE_DISABLED: AtomicBool = AtomicBool::new(false);

/// Globally disables caching for the rest of the process's lifetime.
///
/// Mirrors the Python implementation's CI heuristic
/// (`GITHUB_ACTIONS` set and not running under the test harness): call this
/// at startup in environments where cached responses must never leak across
/// CI runs.
pub fn force_disable_caching() {
    FORCE_DISABLED.store(true, Ordering::Relaxed);
}

/// Whether caching is currently force-disabled, either via
/// [`force_disable_caching`] or the default CI heuristic.
pub fn is_caching_force_disabled() -> bool {
    FORCE_DISABLED.load(Ordering::Relaxed) || default_ci_disable()
}

fn default_ci_disable() -> bool {
    let is_ci = std::env::var_os("GITHUB_ACTIONS").is_some();
    let is_unit_test = cfg!(test) || std::env::var_os("OVERPASS_IS_TEST").is_some();
    is_ci && !is_unit_test
}

/// Reads and writes cached query results by fingerprint.
pub trait CacheProvider: Send + Sync {
    /// Looks up `cache_key`, returning the cached response if present and
    /// not expired.
    fn read(&self, cache_key: &str) -> BoxFuture<'_, Option<Value>>;

    /// Stores `response` under `cache_key`, expiring after `ttl_secs`.
    ///
    /// A `ttl_secs` of zero is a no-op: TTL zero disables caching.
    fn write<'a>(&'a self, cache_key: &'a str, response: &'a Value, ttl_secs: u64) -> BoxFuture<'a, ()>;
}

/// The default [`CacheProvider`]: one JSON file per key in a directory,
/// with an extra `__expiration__` field recording the epoch-seconds
/// deadline.
#[derive(Debug, Clone)]
pub struct FileCacheProvider {
    dir: PathBuf,
}

impl FileCacheProvider {
    /// Creates a provider backed by `dir`, creating it lazily on first
    /// write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Creates a provider backed by the OS temporary directory, matching
    /// the default cache location.
    pub fn temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("overpass-cache"))
    }

    fn file_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{cache_key}.json"))
    }
}

impl CacheProvider for FileCacheProvider {
    fn read(&self, cache_key: &str) -> BoxFuture<'_, Option<Value>> {
        let path = self.file_path(cache_key);
        Box::pin(async move {
            if is_caching_force_disabled() {
                return None;
            }

            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(_) => return None,
            };

            let mut value: Value = match serde_json::from_str(&contents) {
                Ok(v) => v,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(path = %path.display(), "malformed cache file, ignoring");
                    return None;
                }
            };

            let expiration = value
                .get(EXPIRATION_KEY)
                .and_then(Value::as_u64)
                .unwrap_or(0);

            if expiration <= now_epoch_secs() {
                #[cfg(feature = "tracing")]
                tracing::debug!(path = %path.display(), "cache entry expired");
                return None;
            }

            if let Some(obj) = value.as_object_mut() {
                obj.remove(EXPIRATION_KEY);
            }

            #[cfg(feature = "metrics")]
            metrics::counter!("overpass_cache_hits_total").increment(1);

            Some(value)
        })
    }

    fn write<'a>(&'a self, cache_key: &'a str, response: &'a Value, ttl_secs: u64) -> BoxFuture<'a, ()> {
        let path = self.file_path(cache_key);
        Box::pin(async move {
            if ttl_secs == 0 || is_caching_force_disabled() {
                return;
            }

            let mut value = response.clone();
            if let Some(obj) = value.as_object_mut() {
                obj.insert(
                    EXPIRATION_KEY.to_string(),
                    Value::from(now_epoch_secs() + ttl_secs),
                );
            }

            if let Some(parent) = path.parent() {
                if tokio::fs::create_dir_all(parent).await.is_err() {
                    return;
                }
            }

            let serialized = match serde_json::to_vec(&value) {
                Ok(bytes) => bytes,
                Err(_) => return,
            };

            if tokio::fs::write(&path, serialized).await.is_err() {
                #[cfg(feature = "tracing")]
                tracing::warn!(path = %path.display(), "failed to write cache file");
            }
        })
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
