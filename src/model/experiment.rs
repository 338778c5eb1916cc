use crate::eval::condition::Condition;
use serde::Deserialize;
use serde_json::Value;

/// Half-open `[start, end)` slice of the unit interval.
///
/// Deserialized from a two element array: `[0.0, 0.5]`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct BucketRange(
    /// Inclusive start.
    pub f64,
    /// Exclusive end.
    pub f64,
);

/// Mutually exclusive experiment namespace, deserialized from `[id, start, end]`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "(String, f64, f64)")]
pub struct Namespace {
    /// Namespace id hashed together with the hash value.
    pub id: String,
    /// Inclusive lower bound.
    pub start: f64,
    /// Exclusive upper bound.
    pub end: f64,
}

impl From<(String, f64, f64)> for Namespace {
    fn from((id, start, end): (String, f64, f64)) -> Self {
        Self { id, start, end }
    }
}

/// Additional hash based targeting. A user passes a filter when their hash lands inside
/// one of its ranges.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Hash seed.
    pub seed: String,
    /// Accepted ranges.
    pub ranges: Vec<BucketRange>,
    /// Hashed attribute. Defaults to `id`.
    pub attribute: Option<String>,
    /// Defaults to `2`.
    pub hash_version: Option<u32>,
}

/// Per-variation metadata.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VariationMeta {
    /// Stable key of the variation, used by sticky bucketing. Defaults to the index.
    pub key: Option<String>,
    /// Display name.
    pub name: Option<String>,
    /// Passthrough variations don't change the served value.
    pub passthrough: Option<bool>,
}

/// An experiment definition. Experiments come either from feature rules or are run inline
/// with [`crate::Context::run`].
///
/// # Examples
///
/// ```rust
/// use featgate::Experiment;
/// use serde_json::json;
///
/// let experiment = Experiment {
///     weights: Some(vec![0.1, 0.9]),
///     ..Experiment::new("checkout-button", vec![json!("blue"), json!("green")])
/// };
/// ```
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    /// Experiment key, also the default hash seed.
    #[serde(default)]
    pub key: String,
    /// Values served by the variations.
    #[serde(default)]
    pub variations: Vec<Value>,
    /// Traffic share of each variation. Equal weights when missing or invalid.
    pub weights: Option<Vec<f64>>,
    /// Inactive experiments include nobody. Defaults to `true`.
    pub active: Option<bool>,
    /// Share of users included in the experiment, `0.0..=1.0`. Defaults to `1.0`.
    pub coverage: Option<f64>,
    /// Explicit bucket ranges, used instead of `weights` and `coverage`.
    pub ranges: Option<Vec<BucketRange>>,
    /// Targeting condition users must match to be included.
    pub condition: Option<Condition>,
    /// Namespace slice users must fall into to be included.
    pub namespace: Option<Namespace>,
    /// Variation index served to everybody, without tracking.
    pub force: Option<usize>,
    /// Attribute whose value is hashed. Defaults to `id`.
    pub hash_attribute: Option<String>,
    /// Attribute hashed when `hash_attribute` is missing. Only used with sticky bucketing.
    pub fallback_attribute: Option<String>,
    /// Hashing algorithm version, `1` or `2`. Defaults to `1`.
    pub hash_version: Option<u32>,
    /// Hash seed. Defaults to `key`.
    pub seed: Option<String>,
    /// Metadata of the variations, in the order of `variations`.
    pub meta: Option<Vec<VariationMeta>>,
    /// Hash based filters users must pass.
    pub filters: Option<Vec<Filter>>,
    /// Display name.
    pub name: Option<String>,
    /// Experiment phase, reported in assignments.
    pub phase: Option<String>,
    /// Opts out of sticky bucketing even when a store is configured.
    pub disable_sticky_bucketing: Option<bool>,
    /// Sticky assignments made with another version are discarded. Defaults to `0`.
    pub bucket_version: Option<u32>,
    /// Users with a sticky assignment older than this version are excluded.
    pub min_bucket_version: Option<u32>,
}

impl Experiment {
    /// Creates an experiment with equal weights and full coverage.
    pub fn new(key: &str, variations: Vec<Value>) -> Self {
        Self {
            key: key.to_owned(),
            variations,
            ..Experiment::default()
        }
    }

    pub(crate) fn variation_meta(&self, index: usize) -> Option<&VariationMeta> {
        self.meta.as_ref().and_then(|meta| meta.get(index))
    }

    /// Key stored by sticky bucketing for the variation at `index`.
    pub(crate) fn variation_key(&self, index: usize) -> String {
        self.variation_meta(index)
            .and_then(|meta| meta.key.clone())
            .unwrap_or_else(|| index.to_string())
    }
}
