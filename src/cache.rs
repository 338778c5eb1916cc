/// A cache API used to persist fetched feature payloads across restarts.
///
/// The repository hydrates its in-memory cache from here on a miss and writes every
/// successfully fetched payload back.
pub trait PersistentCache: Sync + Send {
    /// Gets the actual value from the cache identified by the given `key`.
    fn read(&self, key: &str) -> Option<String>;

    /// Writes the given `value` to the cache by the given `key`.
    fn write(&self, key: &str, value: &str);
}

/// [`PersistentCache`] that stores nothing. Used when no cache is configured.
pub struct EmptyCache {}

impl EmptyCache {
    pub fn new() -> Self {
        Self {}
    }
}

impl PersistentCache for EmptyCache {
    fn read(&self, _: &str) -> Option<String> {
        None
    }
    fn write(&self, _: &str, _: &str) {}
}
