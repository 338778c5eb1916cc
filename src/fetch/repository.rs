use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use eventsource_client as es;
use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use crate::constants::{CACHE_KEY_SEPARATOR, FEATURES_EVENT};
use crate::errors::ClientError;
use crate::fetch::fetcher::{FeatureFetcher, FetchResponse};
use crate::fetch::stream::{run_stream, stream_client, stream_url};
use crate::model::feature::{entry_from_cached_json, entry_from_json, FeatureApiResponse, FeatureEntry};
use crate::options::RepositoryOptions;
use crate::utils::sha1;

type SharedFetch = Shared<BoxFuture<'static, Option<Arc<FeatureApiResponse>>>>;
type SubscriberCallback = Arc<dyn Fn(Arc<FeatureApiResponse>) + Send + Sync>;

static SHARED: Mutex<Option<Arc<FeatureRepository>>> = Mutex::new(None);

pub(crate) fn cache_key(api_host: &str, client_key: &str) -> String {
    format!("{api_host}{CACHE_KEY_SEPARATOR}{client_key}")
}

struct CacheEntry {
    entry: FeatureEntry,
    stale_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(entry: FeatureEntry, options: &RepositoryOptions) -> Self {
        let after = |duration: &std::time::Duration| {
            let delta = TimeDelta::from_std(*duration).unwrap_or(TimeDelta::MAX);
            entry
                .fetch_time
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        };
        Self {
            stale_at: after(options.stale_ttl()),
            expires_at: after(options.max_age()),
            entry,
        }
    }
}

struct StreamHandle {
    callbacks: HashMap<u64, SubscriberCallback>,
    cancellation_token: CancellationToken,
}

#[derive(Default)]
struct RepositoryState {
    cache: HashMap<String, CacheEntry>,
    active_fetches: HashMap<String, SharedFetch>,
    streams: HashMap<String, StreamHandle>,
}

struct RepositoryInner {
    options: RepositoryOptions,
    fetcher: FeatureFetcher,
    state: Mutex<RepositoryState>,
    next_subscriber_id: AtomicU64,
}

impl RepositoryInner {
    fn lock(&self) -> MutexGuard<'_, RepositoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts `entry`, evicting the oldest entries over the limit. Returns the serialized
    /// entry so it can be persisted once the lock is released.
    fn store(&self, state: &mut RepositoryState, key: &str, entry: FeatureEntry) -> String {
        let serialized = entry.serialize();
        state
            .cache
            .insert(key.to_owned(), CacheEntry::new(entry, &self.options));
        while state.cache.len() > self.options.max_entries() {
            let oldest = state
                .cache
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .min_by_key(|(_, cached)| cached.entry.fetch_time)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(oldest) => {
                    debug!("Evicting cached features of '{oldest}'");
                    state.cache.remove(&oldest);
                }
                None => break,
            }
        }
        serialized
    }

    fn persist(&self, key: &str, serialized: &str) {
        self.options.cache().write(&sha1(key), serialized);
    }

    fn read_persisted(&self, key: &str) -> Option<FeatureEntry> {
        let cached = self.options.cache().read(&sha1(key))?;
        if cached.is_empty() {
            return None;
        }
        match entry_from_cached_json(cached.as_str()) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(event_id = 2201; "Failed to read the persisted features. {err}");
                None
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: &str,
        api_host: &str,
        client_key: &str,
    ) -> Option<Arc<FeatureApiResponse>> {
        let response = self.fetcher.fetch(api_host, client_key).await;
        let (payload, serialized) = {
            let mut state = self.lock();
            state.active_fetches.remove(key);
            match response {
                FetchResponse::Fetched(entry) => {
                    let payload = Arc::clone(&entry.payload);
                    let serialized = self.store(&mut state, key, entry);
                    (payload, serialized)
                }
                FetchResponse::Failed(_) => return None,
            }
        };
        self.persist(key, &serialized);
        Some(payload)
    }

    fn apply_stream_event(&self, key: &str, event: &es::Event) {
        if event.event_type != FEATURES_EVENT {
            debug!("Ignoring stream event '{}'", event.event_type);
            return;
        }
        let entry = match entry_from_json(event.data.as_str(), Utc::now()) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(event_id = 2202; "Dropping malformed stream event. {err}");
                return;
            }
        };
        let payload = Arc::clone(&entry.payload);
        let (serialized, callbacks) = {
            let mut state = self.lock();
            let serialized = self.store(&mut state, key, entry);
            let callbacks = state
                .streams
                .get(key)
                .map(|handle| handle.callbacks.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default();
            (serialized, callbacks)
        };
        self.persist(key, &serialized);
        for callback in callbacks {
            let payload = Arc::clone(&payload);
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!(event_id = 2203; "A feature subscriber panicked while handling an update.");
            }
        }
    }

    fn unsubscribe(&self, key: &str, id: u64) {
        let mut state = self.lock();
        let Some(handle) = state.streams.get_mut(key) else {
            return;
        };
        handle.callbacks.remove(&id);
        if handle.callbacks.is_empty() {
            handle.cancellation_token.cancel();
            state.streams.remove(key);
            debug!("Closed the stream of '{key}'");
        }
    }
}

/// Fetches, caches and refreshes feature payloads.
///
/// Payloads are cached per `(api host, client key)` pair. A fresh payload is served from
/// memory, a stale one is served while a single background refresh runs, and an expired
/// or missing one is fetched before returning. Concurrent loads of the same key share one
/// HTTP request.
///
/// Most applications use the process-wide [`FeatureRepository::shared`] instance; tests and
/// multi-tenant services create their own.
///
/// # Examples
///
/// ```no_run
/// use featgate::{FeatureRepository, RepositoryOptions};
///
/// #[tokio::main]
/// async fn main() {
///     let repository = FeatureRepository::new(RepositoryOptions::default()).unwrap();
///     let payload = repository.load_features("https://cdn.example.com", "client-key").await;
/// }
/// ```
pub struct FeatureRepository {
    inner: Arc<RepositoryInner>,
}

impl FeatureRepository {
    /// Creates a new repository with its own cache.
    ///
    /// # Errors
    ///
    /// This method fails if the underlying HTTP clients can't be initialized.
    pub fn new(options: RepositoryOptions) -> Result<Self, ClientError> {
        let fetcher = FeatureFetcher::new(*options.http_timeout())?;
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                options,
                fetcher,
                state: Mutex::new(RepositoryState::default()),
                next_subscriber_id: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the process-wide repository, creating it with default options on first use.
    ///
    /// # Errors
    ///
    /// This method fails if the underlying HTTP clients can't be initialized.
    pub fn shared() -> Result<Arc<FeatureRepository>, ClientError> {
        let mut shared = SHARED.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(repository) = shared.as_ref() {
            return Ok(Arc::clone(repository));
        }
        let repository = Arc::new(FeatureRepository::new(RepositoryOptions::default())?);
        *shared = Some(Arc::clone(&repository));
        Ok(repository)
    }

    /// Returns the feature payload of `client_key`, fetching it when needed.
    ///
    /// Returns [`None`] when there is no usable cached payload and fetching fails.
    pub async fn load_features(
        &self,
        api_host: &str,
        client_key: &str,
    ) -> Option<Arc<FeatureApiResponse>> {
        let key = cache_key(api_host, client_key);
        self.hydrate(&key);

        let fetch = {
            let mut state = self.inner.lock();
            let now = Utc::now();
            let cached = state.cache.get(&key).and_then(|cached| {
                (now < cached.expires_at)
                    .then(|| (Arc::clone(&cached.entry.payload), now >= cached.stale_at))
            });
            match cached {
                Some((payload, false)) => return Some(payload),
                Some((payload, true)) => {
                    debug!("Serving stale features of '{key}' while refreshing");
                    drop(self.start_fetch(&mut state, &key, api_host, client_key));
                    return Some(payload);
                }
                None => self.start_fetch(&mut state, &key, api_host, client_key),
            }
        };
        fetch.await
    }

    /// Fetches the payload of `client_key` regardless of the cached one's age.
    ///
    /// Joins an already running fetch of the same key.
    pub async fn refresh(&self, api_host: &str, client_key: &str) -> Option<Arc<FeatureApiResponse>> {
        let key = cache_key(api_host, client_key);
        let fetch = {
            let mut state = self.inner.lock();
            self.start_fetch(&mut state, &key, api_host, client_key)
        };
        fetch.await
    }

    /// Drops every cached payload. Running fetches and streams are not affected.
    pub fn clear_cache(&self) {
        self.inner.lock().cache.clear();
    }

    /// Opens (or joins) the payload stream of `client_key` and calls `callback` with every
    /// pushed payload. Pushed payloads also replace the cached one.
    ///
    /// The stream stays open until the last [`Subscription`] of the key is dropped. Must be
    /// called within a Tokio runtime.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use featgate::FeatureRepository;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let repository = FeatureRepository::shared().unwrap();
    ///     let subscription = repository.subscribe("https://cdn.example.com", "client-key", |payload| {
    ///         println!("{} features received", payload.features.len());
    ///     });
    /// }
    /// ```
    pub fn subscribe<F>(&self, api_host: &str, client_key: &str, callback: F) -> Subscription
    where
        F: Fn(Arc<FeatureApiResponse>) + Send + Sync + 'static,
    {
        let key = cache_key(api_host, client_key);
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock();
        match state.streams.get_mut(&key) {
            Some(handle) => {
                handle.callbacks.insert(id, Arc::new(callback));
            }
            None => {
                let token = CancellationToken::new();
                self.start_stream(&key, api_host, client_key, token.clone());
                state.streams.insert(
                    key.clone(),
                    StreamHandle {
                        callbacks: HashMap::from([(id, Arc::new(callback) as SubscriberCallback)]),
                        cancellation_token: token,
                    },
                );
            }
        }
        Subscription {
            repository: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    fn hydrate(&self, key: &str) {
        if self.inner.lock().cache.contains_key(key) {
            return;
        }
        if let Some(entry) = self.inner.read_persisted(key) {
            let mut state = self.inner.lock();
            if !state.cache.contains_key(key) {
                debug!("Loaded persisted features of '{key}'");
                self.inner.store(&mut state, key, entry);
            }
        }
    }

    fn start_fetch(
        &self,
        state: &mut RepositoryState,
        key: &str,
        api_host: &str,
        client_key: &str,
    ) -> SharedFetch {
        if let Some(active) = state.active_fetches.get(key) {
            return active.clone();
        }
        let inner = Arc::clone(&self.inner);
        let (task_key, task_host, task_client_key) =
            (key.to_owned(), api_host.to_owned(), client_key.to_owned());
        let handle = tokio::spawn(async move {
            inner
                .fetch_and_store(&task_key, &task_host, &task_client_key)
                .await
        });
        let fetch = async move {
            handle.await.unwrap_or_else(|err| {
                error!(event_id = 2204; "Feature fetch task failed. {err}");
                None
            })
        }
        .boxed()
        .shared();
        state.active_fetches.insert(key.to_owned(), fetch.clone());
        fetch
    }

    fn start_stream(&self, key: &str, api_host: &str, client_key: &str, token: CancellationToken) {
        let url = stream_url(api_host, client_key);
        let client = match stream_client(&url, &self.inner.options) {
            Ok(client) => client,
            Err(err) => {
                error!(event_id = err.kind.as_u8(); "{}", err);
                return;
            }
        };
        let weak = Arc::downgrade(&self.inner);
        let retry_delay = *self.inner.options.stream_max_backoff();
        let key = key.to_owned();
        tokio::spawn(run_stream(client, url, retry_delay, token, move |event| {
            match weak.upgrade() {
                Some(inner) => {
                    inner.apply_stream_event(&key, event);
                    true
                }
                None => false,
            }
        }));
    }
}

/// Handle of a payload stream subscription. Dropping it unsubscribes.
pub struct Subscription {
    repository: Weak<RepositoryInner>,
    key: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.repository.upgrade() {
            inner.unsubscribe(&self.key, self.id);
        }
    }
}
