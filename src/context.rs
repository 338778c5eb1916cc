use crate::errors::{ClientError, ErrorKind};
use crate::eval::details::{Assignment, FeatureResult};
use crate::eval::evaluator::{eval_feature, run_experiment, EvalContext, EvalState};
use crate::model::experiment::Experiment;
use crate::model::feature::{FeatureApiResponse, FeatureDefinition, Features};
use crate::sticky::StickyBucketStore;
use crate::Attributes;
use arc_swap::{ArcSwap, ArcSwapOption};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::type_name;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type TrackingCallback = Arc<dyn Fn(&Experiment, &Assignment) + Send + Sync>;
type FeatureUsageCallback = Arc<dyn Fn(&str, &FeatureResult) + Send + Sync>;

/// Number of tracked assignments remembered for deduplication.
pub(crate) const MAX_TRACKED_ASSIGNMENTS: usize = 10_000;

/// Assignments already reported to the tracking callback. The oldest one is forgotten
/// once the limit is reached.
#[derive(Default)]
struct TrackedAssignments {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

impl TrackedAssignments {
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() >= MAX_TRACKED_ASSIGNMENTS {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// Holds everything an evaluation needs and evaluates features and experiments.
///
/// Evaluation is synchronous and never performs I/O. Every setter swaps its value
/// atomically, so a [`Context`] can be shared between threads and updated while
/// other threads evaluate.
///
/// # Examples
///
/// ```rust
/// use std::collections::HashMap;
/// use std::sync::Arc;
/// use featgate::{Attributes, Context, FeatureDefinition};
///
/// let features: HashMap<String, FeatureDefinition> = serde_json::from_str(r#"{
///     "dark-mode": {
///         "defaultValue": false,
///         "rules": [{"condition": {"country": "US"}, "force": true}]
///     }
/// }"#).unwrap();
///
/// let context = Context::new();
/// context.set_features(Arc::new(features));
/// context.set_attributes(Attributes::new().id("user-42").with("country", "US"));
///
/// assert!(context.is_on("dark-mode"));
/// ```
pub struct Context {
    features: ArcSwap<HashMap<String, FeatureDefinition>>,
    attributes: ArcSwap<Value>,
    forced_features: ArcSwap<HashMap<String, Value>>,
    forced_variations: ArcSwap<HashMap<String, usize>>,
    url: ArcSwapOption<String>,
    enabled: AtomicBool,
    qa_mode: AtomicBool,
    sticky_store: Option<Arc<dyn StickyBucketStore>>,
    tracking_callback: Option<TrackingCallback>,
    feature_usage_callback: Option<FeatureUsageCallback>,
    tracked: Mutex<TrackedAssignments>,
}

impl Context {
    /// Creates an enabled context without features and attributes.
    pub fn new() -> Self {
        Self {
            features: ArcSwap::from_pointee(HashMap::new()),
            attributes: ArcSwap::from_pointee(Value::Object(Default::default())),
            forced_features: ArcSwap::from_pointee(HashMap::new()),
            forced_variations: ArcSwap::from_pointee(HashMap::new()),
            url: ArcSwapOption::empty(),
            enabled: AtomicBool::new(true),
            qa_mode: AtomicBool::new(false),
            sticky_store: None,
            tracking_callback: None,
            feature_usage_callback: None,
            tracked: Mutex::new(TrackedAssignments::default()),
        }
    }

    /// Sets the callback invoked when the user is included in an experiment.
    ///
    /// The callback is invoked once per distinct assignment
    /// (hash attribute, hash value, experiment key and variation). The most recent
    /// assignments are remembered for deduplication, up to a fixed limit.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::Context;
    ///
    /// let context = Context::new().with_tracking_callback(|experiment, assignment| {
    ///     println!("{} -> {}", experiment.key, assignment.variation_id);
    /// });
    /// ```
    pub fn with_tracking_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Experiment, &Assignment) + Send + Sync + 'static,
    {
        self.tracking_callback = Some(Arc::new(callback));
        self
    }

    /// Sets the callback invoked after every feature evaluation.
    pub fn with_feature_usage_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &FeatureResult) + Send + Sync + 'static,
    {
        self.feature_usage_callback = Some(Arc::new(callback));
        self
    }

    /// Sets the store used to keep experiment assignments stable.
    pub fn with_sticky_bucket_store(mut self, store: Arc<dyn StickyBucketStore>) -> Self {
        self.sticky_store = Some(store);
        self
    }

    /// Returns `true` when the feature's value is truthy.
    pub fn is_on(&self, key: &str) -> bool {
        self.eval_feature(key).on
    }

    /// Returns `true` when the feature's value is falsy (or the feature is unknown).
    pub fn is_off(&self, key: &str) -> bool {
        self.eval_feature(key).off
    }

    /// Returns the feature's value converted to `T`.
    ///
    /// Returns `fallback` when the feature is unknown, its value is `null`, or the value
    /// can't be converted to `T`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::Context;
    ///
    /// let context = Context::new();
    /// let color = context.get_feature_value("button-color", "blue".to_owned());
    /// assert_eq!(color, "blue");
    /// ```
    pub fn get_feature_value<T: DeserializeOwned>(&self, key: &str, fallback: T) -> T {
        let result = self.eval_feature(key);
        if result.value.is_null() {
            return fallback;
        }
        match serde_json::from_value::<T>(result.value) {
            Ok(value) => value,
            Err(err) => {
                let err = ClientError::new(
                    ErrorKind::FeatureValueTypeMismatch,
                    format!(
                        "The value of feature '{key}' can't be converted to '{}'. Returning the fallback value. ({err})",
                        type_name::<T>()
                    ),
                );
                warn!(event_id = err.kind.as_u8(); "{}", err);
                fallback
            }
        }
    }

    /// Evaluates the feature identified by `key`.
    ///
    /// Never fails: unknown features evaluate to `null` with
    /// [`crate::FeatureSource::UnknownFeature`].
    pub fn eval_feature(&self, key: &str) -> FeatureResult {
        let mut state = EvalState::default();
        let result = self.with_eval_context(|ctx| eval_feature(key, ctx, &mut state));
        self.track(&state.included);
        if let Some(callback) = &self.feature_usage_callback {
            if catch_unwind(AssertUnwindSafe(|| callback(key, &result))).is_err() {
                error!(event_id = 3003; "The feature usage callback panicked while handling '{key}'.");
            }
        }
        result
    }

    /// Runs an inline experiment for the current attributes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::{Attributes, Context, Experiment};
    /// use serde_json::json;
    ///
    /// let context = Context::new();
    /// context.set_attributes(Attributes::new().id("user-42"));
    ///
    /// let result = context.run(&Experiment::new("exp1", vec![json!("control"), json!("treatment")]));
    /// assert!(result.in_experiment);
    /// ```
    pub fn run(&self, experiment: &Experiment) -> Assignment {
        let mut state = EvalState::default();
        let result =
            self.with_eval_context(|ctx| run_experiment(experiment, None, ctx, &mut state));
        self.track(&state.included);
        result
    }

    /// Replaces the attributes of the evaluated user.
    pub fn set_attributes(&self, attributes: Attributes) {
        self.attributes.store(Arc::new(attributes.to_value()));
    }

    /// Replaces the active feature map.
    pub fn set_features(&self, features: Features) {
        self.features.store(features);
    }

    /// Replaces the active feature map with the features of `payload`, decrypting them
    /// with `decryption_key` when the payload is encrypted.
    ///
    /// # Errors
    ///
    /// Fails when the payload is encrypted and can't be decrypted. The active feature map
    /// stays untouched in that case.
    pub fn set_payload(
        &self,
        payload: &FeatureApiResponse,
        decryption_key: Option<&str>,
    ) -> Result<(), ClientError> {
        match payload.decrypt_features(decryption_key) {
            Ok(features) => {
                self.set_features(features);
                Ok(())
            }
            Err(err) => {
                error!(event_id = err.kind.as_u8(); "{}", err);
                Err(err)
            }
        }
    }

    /// Replaces the forced feature values. Forced values win over every rule.
    pub fn set_forced_features(&self, forced_features: HashMap<String, Value>) {
        self.forced_features.store(Arc::new(forced_features));
    }

    /// Replaces the forced variation indexes, keyed by experiment key.
    pub fn set_forced_variations(&self, forced_variations: HashMap<String, usize>) {
        self.forced_variations.store(Arc::new(forced_variations));
    }

    /// Sets the URL of the current page. `?{experiment key}={index}` query parameters
    /// force experiment variations.
    pub fn set_url(&self, url: Option<&str>) {
        self.url.store(url.map(|url| Arc::new(url.to_owned())));
    }

    /// Enables or disables experiments. Disabled contexts don't include anyone in experiments.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// In QA mode only forced variations are assigned.
    pub fn set_qa_mode(&self, qa_mode: bool) {
        self.qa_mode.store(qa_mode, Ordering::SeqCst);
    }

    /// Returns the active feature map.
    pub fn features(&self) -> Features {
        self.features.load_full()
    }

    fn with_eval_context<R>(&self, f: impl FnOnce(&EvalContext) -> R) -> R {
        let features = self.features.load();
        let attributes = self.attributes.load();
        let forced_features = self.forced_features.load();
        let forced_variations = self.forced_variations.load();
        let url = self.url.load();
        let ctx = EvalContext {
            features: &features,
            attributes: &attributes,
            forced_features: &forced_features,
            forced_variations: &forced_variations,
            sticky_store: self.sticky_store.as_deref(),
            url: url.as_deref().map(String::as_str),
            enabled: self.enabled.load(Ordering::SeqCst),
            qa_mode: self.qa_mode.load(Ordering::SeqCst),
        };
        f(&ctx)
    }

    fn track(&self, included: &[(Experiment, Assignment)]) {
        let Some(callback) = &self.tracking_callback else {
            return;
        };
        for (experiment, assignment) in included {
            let key = format!(
                "{}|{}|{}|{}",
                assignment.hash_attribute,
                assignment.hash_value,
                experiment.key,
                assignment.variation_id
            );
            let first = self
                .tracked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key);
            if !first {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(experiment, assignment))).is_err() {
                error!(event_id = 3003; "The tracking callback panicked while handling experiment '{}'.", experiment.key);
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod context_tests {
    use crate::context::{Context, TrackedAssignments, MAX_TRACKED_ASSIGNMENTS};
    use crate::errors::ErrorKind;
    use crate::model::enums::FeatureSource;
    use crate::model::feature::FeatureApiResponse;
    use crate::utils::test_utils::{ENCRYPTED_FEATURES, ENCRYPTION_KEY};
    use crate::{Attributes, Experiment};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn context_with(features: Value) -> Context {
        let context = Context::new();
        context.set_features(Arc::new(serde_json::from_value(features).unwrap()));
        context
    }

    #[test]
    fn typed_values() {
        let context = context_with(json!({
            "count": {"defaultValue": 3},
            "name": {"defaultValue": "x"},
            "nothing": {"defaultValue": null}
        }));
        assert_eq!(context.get_feature_value("count", 0_i64), 3);
        assert_eq!(context.get_feature_value("name", 0_i64), 0);
        assert_eq!(context.get_feature_value("nothing", "fb".to_owned()), "fb");
        assert_eq!(context.get_feature_value("unknown", true), true);
        assert!(context.is_off("unknown"));
    }

    #[test]
    fn tracked_assignments_are_bounded() {
        let mut tracked = TrackedAssignments::default();
        assert!(tracked.insert("first".to_owned()));
        assert!(!tracked.insert("first".to_owned()));
        for i in 0..MAX_TRACKED_ASSIGNMENTS {
            tracked.insert(format!("key-{i}"));
        }
        assert_eq!(tracked.keys.len(), MAX_TRACKED_ASSIGNMENTS);
        assert_eq!(tracked.order.len(), MAX_TRACKED_ASSIGNMENTS);
        assert!(tracked.insert("first".to_owned()));
        assert!(!tracked.insert(format!("key-{}", MAX_TRACKED_ASSIGNMENTS - 1)));
    }

    #[test]
    fn forced_features() {
        let context = context_with(json!({"f": {"defaultValue": false}}));
        context.set_forced_features(HashMap::from([("f".to_owned(), json!(true))]));
        let result = context.eval_feature("f");
        assert!(result.on);
        assert_eq!(result.source, FeatureSource::Override);
    }

    #[test]
    fn encrypted_payload() {
        let context = context_with(json!({"old": {"defaultValue": 1}}));
        let payload = FeatureApiResponse {
            encrypted_features: Some(ENCRYPTED_FEATURES.to_owned()),
            ..FeatureApiResponse::default()
        };

        let err = context.set_payload(&payload, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DecryptionKeyMissing);
        let err = context
            .set_payload(&payload, Some("Zvwv/+uhpFDznZ6SX28Yjg=="))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DecryptionFailure);
        assert!(context.features().contains_key("old"));

        context.set_payload(&payload, Some(ENCRYPTION_KEY)).unwrap();
        assert!(context.is_on("feature"));
        assert!(!context.features().contains_key("old"));
    }

    #[test]
    fn tracking_is_deduplicated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let context = Context::new().with_tracking_callback(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        context.set_attributes(Attributes::new().id("user-42"));
        let experiment = Experiment::new("exp1", vec![json!(0), json!(1)]);

        for _ in 0..3 {
            assert!(context.run(&experiment).in_experiment);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        context.set_attributes(Attributes::new().id("user-1"));
        context.run(&experiment);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callbacks_are_contained() {
        let context = context_with(json!({"f": {"defaultValue": true}}))
            .with_tracking_callback(|_, _| panic!("tracking"))
            .with_feature_usage_callback(|_, _| panic!("usage"));
        context.set_attributes(Attributes::new().id("user-42"));
        assert!(context.is_on("f"));
        assert!(context
            .run(&Experiment::new("exp1", vec![json!(0), json!(1)]))
            .in_experiment);
    }

    #[test]
    fn disabled_and_qa_mode() {
        let context = Context::new();
        context.set_attributes(Attributes::new().id("user-42"));
        let experiment = Experiment::new("exp1", vec![json!(0), json!(1)]);

        context.set_enabled(false);
        assert!(!context.run(&experiment).in_experiment);
        context.set_enabled(true);

        context.set_qa_mode(true);
        assert!(!context.run(&experiment).in_experiment);
        context.set_forced_variations(HashMap::from([("exp1".to_owned(), 1)]));
        let result = context.run(&experiment);
        assert_eq!(result.variation_id, 1);
        assert!(!result.hash_used);
    }

    #[test]
    fn url_override() {
        let context = Context::new();
        context.set_attributes(Attributes::new().id("user-42"));
        context.set_url(Some("https://example.com/?exp1=1"));
        let result = context.run(&Experiment::new("exp1", vec![json!(0), json!(1)]));
        assert_eq!(result.variation_id, 1);
        assert_eq!(result.value, json!(1));
    }
}
