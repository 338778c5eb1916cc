use crate::eval::condition::is_truthy;
use crate::model::enums::FeatureSource;
use crate::model::experiment::Experiment;
use serde_json::Value;

/// Result of evaluating a feature.
#[derive(Debug, Clone)]
pub struct FeatureResult {
    /// The evaluated value. `null` when the feature is unknown.
    pub value: Value,
    /// Why the feature got its value.
    pub source: FeatureSource,
    /// Whether the value is truthy.
    pub on: bool,
    /// Negation of `on`.
    pub off: bool,
    /// Id of the rule that produced the value (if any).
    pub rule_id: Option<String>,
    /// The experiment that produced the value (if any).
    pub experiment: Option<Experiment>,
    /// The assignment of the experiment that produced the value (if any).
    pub experiment_result: Option<Assignment>,
}

impl FeatureResult {
    pub(crate) fn new(value: Value, source: FeatureSource) -> Self {
        let on = is_truthy(Some(&value));
        Self {
            value,
            source,
            on,
            off: !on,
            rule_id: None,
            experiment: None,
            experiment_result: None,
        }
    }

    pub(crate) fn with_rule_id(mut self, rule_id: &Option<String>) -> Self {
        self.rule_id.clone_from(rule_id);
        self
    }
}

/// Outcome of running an experiment for the current attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Key of the experiment.
    pub experiment_key: String,
    /// Index of the assigned variation. `0` when the user is not in the experiment.
    pub variation_id: usize,
    /// Value of the assigned variation.
    pub value: Value,
    /// The attribute used for hashing.
    pub hash_attribute: String,
    /// The value of the hash attribute. Empty when the attribute is missing.
    pub hash_value: String,
    /// Whether the user is part of the experiment.
    pub in_experiment: bool,
    /// Whether hashing decided the variation (as opposed to an override).
    pub hash_used: bool,
    /// The hash bucket of the user between 0 and 1 (if computed).
    pub bucket: Option<f64>,
    /// Key of the feature the experiment belongs to (if any).
    pub feature_id: Option<String>,
    /// Whether the variation came from a sticky bucket assignment.
    pub sticky_bucket_used: bool,
    /// Key of the variation, defaults to its index.
    pub key: String,
    /// Name of the variation (if any).
    pub name: Option<String>,
    /// Passthrough variations don't change the served feature value.
    pub passthrough: bool,
}
