use crate::errors::{ClientError, ErrorKind};
use crate::eval::details::{Assignment, FeatureResult};
use crate::fetch::repository::FeatureRepository;
use crate::model::experiment::Experiment;
use crate::modes::RefreshStrategy;
use crate::sticky::StickyBucketStore;
use crate::{Attributes, Client, Context};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

pub(crate) struct Options {
    api_host: String,
    client_key: String,
    decryption_key: Option<String>,
    refresh_strategy: RefreshStrategy,
}

impl Options {
    pub(crate) fn api_host(&self) -> &str {
        &self.api_host
    }

    pub(crate) fn client_key(&self) -> &str {
        &self.client_key
    }

    pub(crate) fn decryption_key(&self) -> Option<&str> {
        self.decryption_key.as_deref()
    }

    pub(crate) fn refresh_strategy(&self) -> &RefreshStrategy {
        &self.refresh_strategy
    }
}

/// Builder to create a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use featgate::{Attributes, Client, RefreshStrategy};
///
/// let builder = Client::builder("https://cdn.example.com", "client-key")
///     .attributes(Attributes::new().id("user-42"))
///     .refresh_strategy(RefreshStrategy::ServerSentEvents);
///
/// let client = builder.build().unwrap();
/// ```
pub struct ClientBuilder {
    api_host: String,
    client_key: String,
    decryption_key: Option<String>,
    attributes: Option<Attributes>,
    forced_features: Option<HashMap<String, Value>>,
    forced_variations: Option<HashMap<String, usize>>,
    tracking_callback: Option<Box<dyn Fn(&Experiment, &Assignment) + Send + Sync>>,
    feature_usage_callback: Option<Box<dyn Fn(&str, &FeatureResult) + Send + Sync>>,
    sticky_bucket_store: Option<Arc<dyn StickyBucketStore>>,
    url: Option<String>,
    enabled: bool,
    qa_mode: bool,
    refresh_strategy: Option<RefreshStrategy>,
    repository: Option<Arc<FeatureRepository>>,
}

impl ClientBuilder {
    pub(crate) fn new(api_host: &str, client_key: &str) -> Self {
        Self {
            api_host: api_host.to_owned(),
            client_key: client_key.to_owned(),
            decryption_key: None,
            attributes: None,
            forced_features: None,
            forced_variations: None,
            tracking_callback: None,
            feature_usage_callback: None,
            sticky_bucket_store: None,
            url: None,
            enabled: true,
            qa_mode: false,
            refresh_strategy: None,
            repository: None,
        }
    }

    /// Sets the key used to decrypt encrypted feature payloads.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::Client;
    ///
    /// let builder = Client::builder("https://cdn.example.com", "client-key")
    ///     .decryption_key("AAECAwQFBgcICQoLDA0ODw==");
    /// ```
    pub fn decryption_key(mut self, key: &str) -> Self {
        self.decryption_key = Some(key.to_owned());
        self
    }

    /// Sets the attributes of the evaluated user.
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// Sets feature values that win over every rule.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::HashMap;
    /// use featgate::Client;
    /// use serde_json::json;
    ///
    /// let builder = Client::builder("https://cdn.example.com", "client-key")
    ///     .forced_features(HashMap::from([("dark-mode".to_owned(), json!(true))]));
    /// ```
    pub fn forced_features(mut self, forced_features: HashMap<String, Value>) -> Self {
        self.forced_features = Some(forced_features);
        self
    }

    /// Sets variation indexes that win over hashing, keyed by experiment key.
    pub fn forced_variations(mut self, forced_variations: HashMap<String, usize>) -> Self {
        self.forced_variations = Some(forced_variations);
        self
    }

    /// Sets the callback invoked when the user is included in an experiment.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::Client;
    ///
    /// let builder = Client::builder("https://cdn.example.com", "client-key")
    ///     .tracking_callback(|experiment, assignment| {
    ///         println!("viewed {} variation {}", experiment.key, assignment.key);
    ///     });
    /// ```
    pub fn tracking_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Experiment, &Assignment) + Send + Sync + 'static,
    {
        self.tracking_callback = Some(Box::new(callback));
        self
    }

    /// Sets the callback invoked after every feature evaluation.
    pub fn feature_usage_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &FeatureResult) + Send + Sync + 'static,
    {
        self.feature_usage_callback = Some(Box::new(callback));
        self
    }

    /// Sets the store used to keep experiment assignments stable.
    /// Sticky bucketing is off without a store.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use featgate::{Client, InMemoryStickyBucketStore};
    ///
    /// let builder = Client::builder("https://cdn.example.com", "client-key")
    ///     .sticky_bucket_store(Arc::new(InMemoryStickyBucketStore::new()));
    /// ```
    pub fn sticky_bucket_store(mut self, store: Arc<dyn StickyBucketStore>) -> Self {
        self.sticky_bucket_store = Some(store);
        self
    }

    /// Sets the URL of the current page, used for query string variation overrides.
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_owned());
        self
    }

    /// Enables or disables experiments.
    /// Default value is `true`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// In QA mode only forced variations are assigned.
    /// Default value is `false`.
    pub fn qa_mode(mut self, qa_mode: bool) -> Self {
        self.qa_mode = qa_mode;
        self
    }

    /// Sets the [`RefreshStrategy`] of the client.
    /// Default value is [`RefreshStrategy::StaleWhileRevalidate`].
    pub fn refresh_strategy(mut self, refresh_strategy: RefreshStrategy) -> Self {
        self.refresh_strategy = Some(refresh_strategy);
        self
    }

    /// Sets the [`FeatureRepository`] the client loads its features from.
    /// Default value is [`FeatureRepository::shared`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use featgate::{Client, FeatureRepository, RepositoryOptions};
    ///
    /// let repository = FeatureRepository::new(
    ///     RepositoryOptions::builder().stale_ttl(Duration::from_secs(10)).build(),
    /// ).unwrap();
    ///
    /// let builder = Client::builder("https://cdn.example.com", "client-key")
    ///     .repository(Arc::new(repository));
    /// ```
    pub fn repository(mut self, repository: Arc<FeatureRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Creates a [`Client`] from the configuration made on the builder.
    ///
    /// # Errors
    ///
    /// This method fails if the client key is empty or has an invalid format, if the API host
    /// is not a valid HTTP(S) URL, or if the shared repository can't be initialized.
    pub fn build(self) -> Result<Client, ClientError> {
        if !is_client_key_valid(&self.client_key) {
            return Err(ClientError::new(
                ErrorKind::InvalidClientKey,
                format!("Client key '{}' is invalid.", self.client_key),
            ));
        }
        if !is_api_host_valid(&self.api_host) {
            return Err(ClientError::new(
                ErrorKind::InvalidApiHost,
                format!("API host '{}' is not a valid HTTP(S) URL.", self.api_host),
            ));
        }
        let repository = match self.repository {
            Some(repository) => repository,
            None => FeatureRepository::shared()?,
        };

        let mut context = Context::new();
        if let Some(callback) = self.tracking_callback {
            context = context.with_tracking_callback(callback);
        }
        if let Some(callback) = self.feature_usage_callback {
            context = context.with_feature_usage_callback(callback);
        }
        if let Some(store) = self.sticky_bucket_store {
            context = context.with_sticky_bucket_store(store);
        }
        if let Some(attributes) = self.attributes {
            context.set_attributes(attributes);
        }
        if let Some(forced_features) = self.forced_features {
            context.set_forced_features(forced_features);
        }
        if let Some(forced_variations) = self.forced_variations {
            context.set_forced_variations(forced_variations);
        }
        context.set_url(self.url.as_deref());
        context.set_enabled(self.enabled);
        context.set_qa_mode(self.qa_mode);

        let options = Options {
            api_host: self.api_host.trim_end_matches('/').to_owned(),
            client_key: self.client_key,
            decryption_key: self.decryption_key,
            refresh_strategy: self.refresh_strategy.unwrap_or_default(),
        };
        Ok(Client::with_options(options, repository, context))
    }
}

fn is_client_key_valid(client_key: &str) -> bool {
    !client_key.is_empty()
        && client_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_api_host_valid(api_host: &str) -> bool {
    match Url::parse(api_host) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}
