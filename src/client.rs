use crate::builder::{ClientBuilder, Options};
use crate::errors::{ClientError, ErrorKind};
use crate::eval::details::{Assignment, FeatureResult};
use crate::fetch::repository::{FeatureRepository, Subscription};
use crate::model::experiment::Experiment;
use crate::model::feature::FeatureApiResponse;
use crate::modes::RefreshStrategy;
use crate::{Attributes, Context};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, PoisonError};

/// The main component for evaluating features and running experiments.
///
/// A [`Client`] loads its feature payload through a [`FeatureRepository`] and evaluates
/// features with its [`Context`]. Evaluation is synchronous and works from the last
/// successfully loaded payload.
///
/// # Examples
///
/// ```no_run
/// use featgate::{Attributes, Client};
///
/// #[tokio::main]
/// async fn main() {
///     let client = Client::builder("https://cdn.example.com", "client-key")
///         .attributes(Attributes::new().id("user-42").with("country", "US"))
///         .build()
///         .unwrap();
///
///     client.load_features().await.unwrap();
///     let is_enabled = client.is_on("dark-mode");
/// }
/// ```
pub struct Client {
    options: Options,
    repository: Arc<FeatureRepository>,
    context: Arc<Context>,
    subscription: Mutex<Option<Subscription>>,
}

impl Client {
    pub(crate) fn with_options(
        options: Options,
        repository: Arc<FeatureRepository>,
        context: Context,
    ) -> Self {
        Self {
            options,
            repository,
            context: Arc::new(context),
            subscription: Mutex::new(None),
        }
    }

    /// Creates a new [`ClientBuilder`] used to build a [`Client`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use featgate::Client;
    ///
    /// let client = Client::builder("https://cdn.example.com", "client-key")
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn builder(api_host: &str, client_key: &str) -> ClientBuilder {
        ClientBuilder::new(api_host, client_key)
    }

    /// Creates a new [`Client`] with default options.
    ///
    /// # Errors
    ///
    /// This method fails if the client key or the API host is invalid.
    pub fn new(api_host: &str, client_key: &str) -> Result<Self, ClientError> {
        ClientBuilder::new(api_host, client_key).build()
    }

    /// Loads the feature payload (from cache when possible) and activates it.
    ///
    /// With [`RefreshStrategy::ServerSentEvents`] the first call also subscribes to payload
    /// pushes, which are activated as they arrive.
    ///
    /// # Errors
    ///
    /// This method fails when no payload is available or the payload can't be decrypted.
    /// The previously activated features stay in use in both cases.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use featgate::Client;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = Client::new("https://cdn.example.com", "client-key").unwrap();
    ///     client.load_features().await.unwrap();
    /// }
    /// ```
    pub async fn load_features(&self) -> Result<(), ClientError> {
        if *self.options.refresh_strategy() == RefreshStrategy::ServerSentEvents {
            self.subscribe();
        }
        let payload = self
            .repository
            .load_features(self.options.api_host(), self.options.client_key())
            .await;
        self.activate(payload)
    }

    /// Fetches the feature payload regardless of the cached one's age and activates it.
    ///
    /// # Errors
    ///
    /// This method fails when the fetch fails or the payload can't be decrypted.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let payload = self
            .repository
            .refresh(self.options.api_host(), self.options.client_key())
            .await;
        self.activate(payload)
    }

    /// Returns `true` when the feature's value is truthy.
    pub fn is_on(&self, key: &str) -> bool {
        self.context.is_on(key)
    }

    /// Returns `true` when the feature's value is falsy (or the feature is unknown).
    pub fn is_off(&self, key: &str) -> bool {
        self.context.is_off(key)
    }

    /// Returns the feature's value converted to `T`, or `fallback`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use featgate::Client;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = Client::new("https://cdn.example.com", "client-key").unwrap();
    ///     client.load_features().await.unwrap();
    ///
    ///     let limit = client.get_feature_value("upload-limit", 10_u32);
    /// }
    /// ```
    pub fn get_feature_value<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        self.context.get_feature_value(key, fallback)
    }

    /// Evaluates the feature identified by `key`.
    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        self.context.eval_feature(key)
    }

    /// Runs an inline experiment for the current attributes.
    pub fn run(&self, experiment: &Experiment) -> Assignment {
        self.context.run(experiment)
    }

    /// Replaces the attributes of the evaluated user.
    pub fn set_attributes(&self, attributes: Attributes) {
        self.context.set_attributes(attributes);
    }

    /// Returns the [`Context`] of the client for the less common settings.
    pub fn context(&self) -> &Context {
        &self.context
    }

    fn activate(&self, payload: Option<Arc<FeatureApiResponse>>) -> Result<(), ClientError> {
        match payload {
            Some(payload) => self
                .context
                .set_payload(&payload, self.options.decryption_key()),
            None => {
                let err = ClientError::new(
                    ErrorKind::FeaturesNotAvailable,
                    format!(
                        "Features of '{}' are not available. Keeping the previously loaded features.",
                        self.options.client_key()
                    ),
                );
                warn!(event_id = err.kind.as_u8(); "{}", err);
                Err(err)
            }
        }
    }

    fn subscribe(&self) {
        let mut subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return;
        }
        let context = Arc::downgrade(&self.context);
        let decryption_key = self.options.decryption_key().map(str::to_owned);
        *subscription = Some(self.repository.subscribe(
            self.options.api_host(),
            self.options.client_key(),
            move |payload| {
                if let Some(context) = context.upgrade() {
                    if context
                        .set_payload(&payload, decryption_key.as_deref())
                        .is_ok()
                    {
                        debug!("Activated pushed features");
                    }
                }
            },
        ));
    }
}
