use crate::errors::{ClientError, ErrorKind};
use crate::eval::condition::Condition;
use crate::model::experiment::{BucketRange, Experiment, Filter, Namespace, VariationMeta};
use crate::utils::decrypt;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("JSON parsing failed. ({0})")]
    Parse(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum RuleError {
    #[error("rule has neither 'force' nor 'variations'")]
    UnknownShape,
    #[error("experiment rule has no variations")]
    NoVariations,
}

/// Shared map of feature keys to their definitions.
pub type Features = Arc<HashMap<String, FeatureDefinition>>;

/// The feature payload served by the API.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FeatureApiResponse {
    /// Plain feature definitions by key.
    #[serde(default)]
    pub features: Features,
    /// `<base64 iv>.<base64 ciphertext>` of the feature map, when the payload is encrypted.
    pub encrypted_features: Option<String>,
    /// Last modification time reported by the server.
    pub date_updated: Option<String>,
}

impl FeatureApiResponse {
    /// Returns the features of the payload, decrypting them first when the payload is encrypted.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::DecryptionKeyMissing`] when the payload is encrypted and no key
    /// is given, and with [`ErrorKind::DecryptionFailure`] when the key is wrong or the
    /// decrypted content is not a valid feature map.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::FeatureApiResponse;
    ///
    /// let payload: FeatureApiResponse = serde_json::from_str(
    ///     r#"{"encryptedFeatures": "EBESExQVFhcYGRobHB0eHw==.hJtJTFjJW5RUWa7UVCcWE0wGXm+XrzyMipreQQWF/46hot9ca1mBRavfEBGm3pFZ"}"#,
    /// ).unwrap();
    /// let features = payload.decrypt_features(Some("AAECAwQFBgcICQoLDA0ODw==")).unwrap();
    /// assert_eq!(features["feature"].default_value, serde_json::json!(true));
    /// ```
    pub fn decrypt_features(&self, key: Option<&str>) -> Result<Features, ClientError> {
        let Some(encrypted) = self.encrypted_features.as_deref() else {
            return Ok(Arc::clone(&self.features));
        };
        let Some(key) = key else {
            return Err(ClientError::new(
                ErrorKind::DecryptionKeyMissing,
                "The feature payload is encrypted but no decryption key was configured.".to_owned(),
            ));
        };
        let plain = decrypt(encrypted, key).map_err(|err| {
            ClientError::new(
                ErrorKind::DecryptionFailure,
                format!("Failed to decrypt the feature payload. ({err})"),
            )
        })?;
        serde_json::from_str::<HashMap<String, FeatureDefinition>>(plain.as_str())
            .map(Arc::new)
            .map_err(|err| {
                ClientError::new(
                    ErrorKind::DecryptionFailure,
                    format!("Decrypted features are not a valid feature map. ({err})"),
                )
            })
    }
}

/// A feature: its default value and the rules that may override it.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDefinition {
    /// Served when no rule applies. `null` when missing.
    #[serde(default)]
    pub default_value: Value,
    /// Rules in evaluation order. Malformed rules are dropped while parsing.
    #[serde(default, deserialize_with = "lenient_rules")]
    pub rules: Vec<Rule>,
}

/// A feature rule. The variant is picked from the shape of the rule object.
#[derive(Debug, Clone)]
pub enum Rule {
    /// Serves a fixed value to everyone matching the targeting.
    Force(ForceRule),
    /// Serves a fixed value to a hashed percentage of the users matching the targeting.
    Rollout(RolloutRule),
    /// Buckets the users matching the targeting into experiment variations.
    Experiment(ExperimentRule),
}

impl Rule {
    /// The targeting shared by all rule kinds.
    pub fn targeting(&self) -> &RuleTargeting {
        match self {
            Rule::Force(rule) => &rule.targeting,
            Rule::Rollout(rule) => &rule.targeting,
            Rule::Experiment(rule) => &rule.targeting,
        }
    }
}

/// Fields shared by every rule kind.
#[derive(Debug, Clone, Default)]
pub struct RuleTargeting {
    /// Rule id reported in [`crate::FeatureResult::rule_id`].
    pub id: Option<String>,
    /// Attribute condition. Rules without one match everybody.
    pub condition: Option<Condition>,
    /// Conditions on prerequisite features.
    pub parent_conditions: Vec<ParentCondition>,
    /// Hash based filters.
    pub filters: Vec<Filter>,
}

/// Condition on the evaluated value of another feature.
#[derive(Deserialize, Debug, Clone)]
pub struct ParentCondition {
    /// Key of the parent feature.
    pub id: String,
    /// Evaluated against `{"value": <parent value>}`.
    pub condition: Condition,
    /// When set, a failing condition blocks the whole feature instead of skipping the rule.
    #[serde(default)]
    pub gate: bool,
}

/// Rule that serves `value` to every matching user.
#[derive(Debug, Clone)]
pub struct ForceRule {
    /// Who the rule applies to.
    pub targeting: RuleTargeting,
    /// Served value.
    pub value: Value,
}

/// Rule that serves `value` to the matching users whose hash lands in the rollout range.
#[derive(Debug, Clone)]
pub struct RolloutRule {
    /// Who the rule applies to.
    pub targeting: RuleTargeting,
    /// Served value.
    pub value: Value,
    /// Rolled out share, read as the range `[0, coverage)`.
    pub coverage: Option<f64>,
    /// Explicit rollout range. Wins over `coverage`.
    pub range: Option<BucketRange>,
    /// Attribute whose value is hashed. Defaults to `id`.
    pub hash_attribute: Option<String>,
    /// Hash seed. Defaults to the feature key.
    pub seed: Option<String>,
    /// Defaults to `1`.
    pub hash_version: Option<u32>,
}

/// Rule that runs an experiment for the matching users.
#[derive(Debug, Clone)]
pub struct ExperimentRule {
    /// Who the rule applies to.
    pub targeting: RuleTargeting,
    /// The experiment to run. An empty key means the key of the feature.
    pub experiment: Experiment,
}

impl ExperimentRule {
    pub(crate) fn to_experiment(&self, feature_key: &str) -> Experiment {
        let mut experiment = self.experiment.clone();
        if experiment.key.is_empty() {
            feature_key.clone_into(&mut experiment.key);
        }
        experiment
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRule {
    id: Option<String>,
    condition: Option<Condition>,
    parent_conditions: Option<Vec<ParentCondition>>,
    filters: Option<Vec<Filter>>,
    #[serde(default, deserialize_with = "present")]
    force: Option<Value>,
    variations: Option<Vec<Value>>,
    weights: Option<Vec<f64>>,
    key: Option<String>,
    coverage: Option<f64>,
    range: Option<BucketRange>,
    ranges: Option<Vec<BucketRange>>,
    namespace: Option<Namespace>,
    hash_attribute: Option<String>,
    fallback_attribute: Option<String>,
    hash_version: Option<u32>,
    seed: Option<String>,
    meta: Option<Vec<VariationMeta>>,
    name: Option<String>,
    phase: Option<String>,
    disable_sticky_bucketing: Option<bool>,
    bucket_version: Option<u32>,
    min_bucket_version: Option<u32>,
}

/// Keeps an explicit `null` apart from a missing field.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawRule> for Rule {
    type Error = RuleError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        if let Some(variations) = raw.variations {
            if variations.is_empty() {
                return Err(RuleError::NoVariations);
            }
            return Ok(Rule::Experiment(ExperimentRule {
                targeting: RuleTargeting {
                    id: raw.id,
                    condition: raw.condition,
                    parent_conditions: raw.parent_conditions.unwrap_or_default(),
                    filters: vec![],
                },
                experiment: Experiment {
                    key: raw.key.unwrap_or_default(),
                    variations,
                    weights: raw.weights,
                    coverage: raw.coverage,
                    ranges: raw.ranges,
                    namespace: raw.namespace,
                    hash_attribute: raw.hash_attribute,
                    fallback_attribute: raw.fallback_attribute,
                    hash_version: raw.hash_version,
                    seed: raw.seed,
                    meta: raw.meta,
                    filters: raw.filters,
                    name: raw.name,
                    phase: raw.phase,
                    disable_sticky_bucketing: raw.disable_sticky_bucketing,
                    bucket_version: raw.bucket_version,
                    min_bucket_version: raw.min_bucket_version,
                    ..Experiment::default()
                },
            }));
        }

        let value = raw.force.ok_or(RuleError::UnknownShape)?;
        let targeting = RuleTargeting {
            id: raw.id,
            condition: raw.condition,
            parent_conditions: raw.parent_conditions.unwrap_or_default(),
            filters: raw.filters.unwrap_or_default(),
        };
        if raw.coverage.is_some() || raw.range.is_some() {
            Ok(Rule::Rollout(RolloutRule {
                targeting,
                value,
                coverage: raw.coverage,
                range: raw.range,
                hash_attribute: raw.hash_attribute,
                seed: raw.seed,
                hash_version: raw.hash_version,
            }))
        } else {
            Ok(Rule::Force(ForceRule { targeting, value }))
        }
    }
}

fn decode_rule(value: Value) -> Result<Rule, String> {
    let raw = serde_json::from_value::<RawRule>(value).map_err(|err| err.to_string())?;
    Rule::try_from(raw).map_err(|err| err.to_string())
}

/// Decodes each rule on its own so that one malformed rule doesn't take the whole feature down.
fn lenient_rules<'de, D>(deserializer: D) -> Result<Vec<Rule>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw_rules = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw_rules
        .into_iter()
        .enumerate()
        .filter_map(|(index, raw)| match decode_rule(raw) {
            Ok(rule) => Some(rule),
            Err(err) => {
                warn!(event_id = 2100; "Skipping malformed rule #{index}: {err}");
                None
            }
        })
        .collect())
}

/// A fetched payload together with its source JSON and fetch time.
#[derive(Debug, Clone)]
pub struct FeatureEntry {
    pub payload: Arc<FeatureApiResponse>,
    pub payload_json: String,
    pub fetch_time: DateTime<Utc>,
}

impl FeatureEntry {
    /// Serialized form written to a [`crate::PersistentCache`]: `<fetch time millis>\n<payload json>`.
    pub fn serialize(&self) -> String {
        self.fetch_time.timestamp_millis().to_string() + "\n" + &self.payload_json
    }
}

pub fn entry_from_json(json: &str, fetch_time: DateTime<Utc>) -> Result<FeatureEntry, Error> {
    match serde_json::from_str::<FeatureApiResponse>(json) {
        Ok(payload) => Ok(FeatureEntry {
            payload: Arc::new(payload),
            payload_json: json.to_owned(),
            fetch_time,
        }),
        Err(err) => Err(Error::Parse(err.to_string())),
    }
}

pub fn entry_from_cached_json(cached_json: &str) -> Result<FeatureEntry, Error> {
    let Some((time_string, payload_json)) = cached_json.split_once('\n') else {
        return Err(Error::Parse(
            "Number of values is fewer than expected".to_owned(),
        ));
    };
    let Ok(time) = time_string.parse::<i64>() else {
        return Err(Error::Parse(format!("Invalid fetch time: '{time_string}'")));
    };
    let Some(fetch_time) = DateTime::from_timestamp_millis(time) else {
        return Err(Error::Parse(format!(
            "Invalid unix milliseconds value: '{time}'"
        )));
    };
    entry_from_json(payload_json, fetch_time)
}
