use crate::cache::EmptyCache;
use crate::PersistentCache;
use std::borrow::Borrow;
use std::time::Duration;

/// Configuration options of a [`crate::FeatureRepository`].
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use featgate::RepositoryOptions;
///
/// let options = RepositoryOptions::builder()
///     .stale_ttl(Duration::from_secs(30))
///     .max_entries(100)
///     .build();
/// ```
pub struct RepositoryOptions {
    stale_ttl: Duration,
    max_age: Duration,
    http_timeout: Duration,
    max_entries: usize,
    stream_initial_backoff: Duration,
    stream_max_backoff: Duration,
    stream_read_timeout: Duration,
    cache: Box<dyn PersistentCache>,
}

impl RepositoryOptions {
    /// Creates a new [`RepositoryOptionsBuilder`].
    pub fn builder() -> RepositoryOptionsBuilder {
        RepositoryOptionsBuilder::new()
    }

    /// Age after which a cached payload is refreshed in the background.
    pub fn stale_ttl(&self) -> &Duration {
        &self.stale_ttl
    }

    /// Age after which a cached payload is not served anymore.
    pub fn max_age(&self) -> &Duration {
        &self.max_age
    }

    /// Get the configured HTTP request timeout.
    pub fn http_timeout(&self) -> &Duration {
        &self.http_timeout
    }

    /// Maximum number of cached payloads.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Delay before the first stream reconnection attempt.
    pub fn stream_initial_backoff(&self) -> &Duration {
        &self.stream_initial_backoff
    }

    /// Upper bound of the stream reconnection delay.
    pub fn stream_max_backoff(&self) -> &Duration {
        &self.stream_max_backoff
    }

    /// Longest silence tolerated on an open stream before it is reconnected.
    pub fn stream_read_timeout(&self) -> &Duration {
        &self.stream_read_timeout
    }

    /// Get the configured [`PersistentCache`] implementation.
    pub fn cache(&self) -> &dyn PersistentCache {
        self.cache.borrow()
    }
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        RepositoryOptionsBuilder::new().build()
    }
}

/// Builder to create [`RepositoryOptions`].
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use featgate::RepositoryOptions;
///
/// let options = RepositoryOptions::builder()
///     .http_timeout(Duration::from_secs(5))
///     .build();
/// ```
pub struct RepositoryOptionsBuilder {
    stale_ttl: Option<Duration>,
    max_age: Option<Duration>,
    http_timeout: Option<Duration>,
    max_entries: Option<usize>,
    stream_initial_backoff: Option<Duration>,
    stream_max_backoff: Option<Duration>,
    stream_read_timeout: Option<Duration>,
    cache: Option<Box<dyn PersistentCache>>,
}

impl RepositoryOptionsBuilder {
    pub(crate) fn new() -> Self {
        Self {
            stale_ttl: None,
            max_age: None,
            http_timeout: None,
            max_entries: None,
            stream_initial_backoff: None,
            stream_max_backoff: None,
            stream_read_timeout: None,
            cache: None,
        }
    }

    /// Set the age after which a cached payload is served stale and refreshed in the background.
    /// Default value is `60` seconds.
    pub fn stale_ttl(mut self, stale_ttl: Duration) -> Self {
        self.stale_ttl = Some(stale_ttl);
        self
    }

    /// Set the age after which a cached payload is refetched before serving.
    /// Default value is `24` hours.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Set the HTTP request timeout.
    /// Default value is `30` seconds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use featgate::RepositoryOptions;
    ///
    /// let builder = RepositoryOptions::builder()
    ///     .http_timeout(Duration::from_secs(60));
    /// ```
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of cached payloads. The oldest payload is evicted first.
    /// Default value is `10`.
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Set the stream reconnection delays. The delay doubles on every failed attempt
    /// up to `max`. Default values are `1` and `60` seconds.
    pub fn stream_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.stream_initial_backoff = Some(initial);
        self.stream_max_backoff = Some(max);
        self
    }

    /// Set how long an open stream may stay silent before it is dropped and reconnected.
    /// Default value is `5` minutes.
    pub fn stream_read_timeout(mut self, timeout: Duration) -> Self {
        self.stream_read_timeout = Some(timeout);
        self
    }

    /// Set a [`PersistentCache`] implementation used for caching.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::{PersistentCache, RepositoryOptions};
    ///
    /// let builder = RepositoryOptions::builder()
    ///     .cache(Box::new(CustomCache{}));
    ///
    /// struct CustomCache {}
    ///
    /// impl PersistentCache for CustomCache {
    ///     fn read(&self, key: &str) -> Option<String> {
    ///         // read from cache
    ///         None
    ///     }
    ///
    ///     fn write(&self, key: &str, value: &str) {
    ///         // write to cache
    ///     }
    /// }
    /// ```
    pub fn cache(mut self, cache: Box<dyn PersistentCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Create the [`RepositoryOptions`] from the configuration made on the builder.
    pub fn build(self) -> RepositoryOptions {
        let stream_initial_backoff = self
            .stream_initial_backoff
            .unwrap_or(Duration::from_secs(1));
        RepositoryOptions {
            stale_ttl: self.stale_ttl.unwrap_or(Duration::from_secs(60)),
            max_age: self.max_age.unwrap_or(Duration::from_secs(24 * 60 * 60)),
            http_timeout: self.http_timeout.unwrap_or(Duration::from_secs(30)),
            max_entries: self.max_entries.unwrap_or(10).max(1),
            stream_initial_backoff,
            stream_max_backoff: self
                .stream_max_backoff
                .unwrap_or(Duration::from_secs(60))
                .max(stream_initial_backoff),
            stream_read_timeout: self
                .stream_read_timeout
                .unwrap_or(Duration::from_secs(5 * 60)),
            cache: self.cache.unwrap_or(Box::new(EmptyCache::new())),
        }
    }
}

#[cfg(test)]
mod options_tests {
    use crate::options::RepositoryOptions;
    use std::time::Duration;

    #[test]
    fn defaults() {
        let options = RepositoryOptions::default();
        assert_eq!(*options.stale_ttl(), Duration::from_secs(60));
        assert_eq!(*options.max_age(), Duration::from_secs(86400));
        assert_eq!(*options.http_timeout(), Duration::from_secs(30));
        assert_eq!(options.max_entries(), 10);
        assert_eq!(*options.stream_initial_backoff(), Duration::from_secs(1));
        assert_eq!(*options.stream_max_backoff(), Duration::from_secs(60));
        assert_eq!(*options.stream_read_timeout(), Duration::from_secs(300));
        assert!(options.cache().read("key").is_none());
    }

    #[test]
    fn bounds() {
        let options = RepositoryOptions::builder()
            .max_entries(0)
            .stream_backoff(Duration::from_secs(5), Duration::from_secs(1))
            .build();
        assert_eq!(options.max_entries(), 1);
        assert_eq!(*options.stream_max_backoff(), Duration::from_secs(5));
    }
}
