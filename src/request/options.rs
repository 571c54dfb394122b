use super::ResponseCache;
use crate::http::ApiError;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub type SuccessCallback<P, T> = Arc<dyn Fn(&T, &P) + Send + Sync>;
pub type ErrorCallback<P> = Arc<dyn Fn(&ApiError, &P) + Send + Sync>;
pub type FinallyCallback<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// How calls to `run` are admitted to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    #[default]
    Immediate,
    /// Execute once the calls have been quiet for the window.
    Debounce(Duration),
    /// Execute at most once per window, with one trailing execution.
    Throttle(Duration),
}

pub struct CachePolicy<T> {
    pub key: String,
    /// `None` keeps the entry until it is explicitly overwritten.
    pub ttl: Option<Duration>,
    pub store: ResponseCache<T>,
}

pub struct RequestOptions<P, T> {
    pub manual: bool,
    pub default_params: Option<P>,
    pub on_success: Option<SuccessCallback<P, T>>,
    pub on_error: Option<ErrorCallback<P>>,
    pub on_finally: Option<FinallyCallback<P>>,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub schedule: Schedule,
    pub cache: Option<CachePolicy<T>>,
}

impl<P, T> Default for RequestOptions<P, T> {
    fn default() -> Self {
        Self {
            manual: false,
            default_params: None,
            on_success: None,
            on_error: None,
            on_finally: None,
            retry_count: 0,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            schedule: Schedule::Immediate,
            cache: None,
        }
    }
}

impl<P, T> RequestOptions<P, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manual controller only runs when asked to.
    pub fn with_manual(mut self, manual: bool) -> Self {
        self.manual = manual;
        self
    }

    pub fn with_default_params(mut self, params: P) -> Self {
        self.default_params = Some(params);
        self
    }

    pub fn with_on_success(mut self, f: impl Fn(&T, &P) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&ApiError, &P) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_on_finally(mut self, f: impl Fn(&P) + Send + Sync + 'static) -> Self {
        self.on_finally = Some(Arc::new(f));
        self
    }

    /// Extra attempts after the first failure.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Replaces any throttle window.
    pub fn with_debounce(mut self, wait: Duration) -> Self {
        self.schedule = Schedule::Debounce(wait);
        self
    }

    /// Replaces any debounce window.
    pub fn with_throttle(mut self, wait: Duration) -> Self {
        self.schedule = Schedule::Throttle(wait);
        self
    }

    pub fn with_cache(self, key: impl Into<String>, ttl: Option<Duration>) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.with_shared_cache(ResponseCache::new(), key, ttl)
    }

    /// Use `store` so controllers holding the same store and key see each
    /// other's results.
    pub fn with_shared_cache(
        mut self,
        store: ResponseCache<T>,
        key: impl Into<String>,
        ttl: Option<Duration>,
    ) -> Self {
        self.cache = Some(CachePolicy {
            key: key.into(),
            ttl,
            store,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_and_throttle_replace_each_other() {
        let options = RequestOptions::<(), ()>::new()
            .with_debounce(Duration::from_millis(300))
            .with_throttle(Duration::from_millis(500));
        assert_eq!(options.schedule, Schedule::Throttle(Duration::from_millis(500)));

        let options = options.with_debounce(Duration::from_millis(200));
        assert_eq!(options.schedule, Schedule::Debounce(Duration::from_millis(200)));
    }

    #[test]
    fn retry_interval_defaults_to_one_second() {
        let options = RequestOptions::<(), ()>::new().with_retry_count(3);
        assert_eq!(options.retry_count, 3);
        assert_eq!(options.retry_interval, DEFAULT_RETRY_INTERVAL);
        assert!(!options.manual);
    }
}
