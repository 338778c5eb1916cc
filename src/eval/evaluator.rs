use crate::constants::DEFAULT_HASH_ATTRIBUTE;
use crate::eval::condition::{get_path, to_js_string};
use crate::eval::details::{Assignment, FeatureResult};
use crate::eval::hashing::{
    choose_variation, get_bucket_ranges, hash, in_namespace, in_range, query_string_override,
};
use crate::model::enums::FeatureSource;
use crate::model::experiment::{BucketRange, Experiment, Filter};
use crate::model::feature::{FeatureDefinition, ParentCondition, RolloutRule, Rule};
use crate::sticky::{StickyAssignmentsDocument, StickyBucketStore};
use log::{debug, warn};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Everything an evaluation reads. Borrowed from the [`crate::Context`] for a single call.
pub(crate) struct EvalContext<'a> {
    pub features: &'a HashMap<String, FeatureDefinition>,
    pub attributes: &'a Value,
    pub forced_features: &'a HashMap<String, Value>,
    pub forced_variations: &'a HashMap<String, usize>,
    pub sticky_store: Option<&'a dyn StickyBucketStore>,
    pub url: Option<&'a str>,
    pub enabled: bool,
    pub qa_mode: bool,
}

/// Mutable bookkeeping of one evaluation call.
#[derive(Default)]
pub(crate) struct EvalState {
    /// Keys of the features being evaluated, used to detect prerequisite cycles.
    cycle_tracker: Vec<String>,
    /// Experiments the user was included in, in evaluation order.
    pub included: Vec<(Experiment, Assignment)>,
}

enum ParentResult {
    Pass,
    Skip,
    Gate,
    Cycle,
}

pub(crate) fn eval_feature(key: &str, ctx: &EvalContext, state: &mut EvalState) -> FeatureResult {
    if let Some(value) = ctx.forced_features.get(key) {
        return FeatureResult::new(value.clone(), FeatureSource::Override);
    }
    let Some(feature) = ctx.features.get(key) else {
        debug!("Feature '{key}' is unknown");
        return FeatureResult::new(Value::Null, FeatureSource::UnknownFeature);
    };
    if state.cycle_tracker.iter().any(|k| k == key) {
        let output = state
            .cycle_tracker
            .iter()
            .chain(std::iter::once(&key.to_owned()))
            .map(|k| format!("'{k}'"))
            .collect::<Vec<String>>()
            .join(" -> ");
        warn!(event_id = 3001; "Circular dependency detected between prerequisite features: {output}");
        return FeatureResult::new(Value::Null, FeatureSource::CyclicPrerequisite);
    }

    state.cycle_tracker.push(key.to_owned());
    let result = eval_rules(key, feature, ctx, state);
    state.cycle_tracker.pop();
    result
}

fn eval_rules(
    key: &str,
    feature: &FeatureDefinition,
    ctx: &EvalContext,
    state: &mut EvalState,
) -> FeatureResult {
    for rule in &feature.rules {
        let targeting = rule.targeting();
        match eval_parents(&targeting.parent_conditions, ctx, state) {
            ParentResult::Pass => {}
            ParentResult::Skip => continue,
            ParentResult::Gate => {
                debug!("Feature '{key}' is blocked by a prerequisite");
                return FeatureResult::new(Value::Null, FeatureSource::Prerequisite)
                    .with_rule_id(&targeting.id);
            }
            ParentResult::Cycle => {
                return FeatureResult::new(Value::Null, FeatureSource::CyclicPrerequisite)
            }
        }
        if is_filtered_out(&targeting.filters, ctx.attributes) {
            continue;
        }
        if let Some(condition) = &targeting.condition {
            if !condition.eval(ctx.attributes) {
                continue;
            }
        }

        match rule {
            Rule::Force(force) => {
                return FeatureResult::new(force.value.clone(), FeatureSource::Force)
                    .with_rule_id(&targeting.id);
            }
            Rule::Rollout(rollout) => {
                if is_in_rollout(key, rollout, ctx.attributes) {
                    return FeatureResult::new(rollout.value.clone(), FeatureSource::Rollout)
                        .with_rule_id(&targeting.id);
                }
            }
            Rule::Experiment(exp_rule) => {
                let experiment = exp_rule.to_experiment(key);
                let assignment = run_experiment(&experiment, Some(key), ctx, state);
                if assignment.in_experiment && !assignment.passthrough {
                    return FeatureResult {
                        experiment: Some(experiment),
                        experiment_result: Some(assignment.clone()),
                        ..FeatureResult::new(assignment.value, FeatureSource::Experiment)
                            .with_rule_id(&targeting.id)
                    };
                }
            }
        }
    }
    FeatureResult::new(feature.default_value.clone(), FeatureSource::DefaultValue)
}

fn eval_parents(
    parents: &[ParentCondition],
    ctx: &EvalContext,
    state: &mut EvalState,
) -> ParentResult {
    for parent in parents {
        let parent_result = eval_feature(&parent.id, ctx, state);
        if parent_result.source == FeatureSource::CyclicPrerequisite {
            return ParentResult::Cycle;
        }
        let evaluated = json!({ "value": parent_result.value });
        if !parent.condition.eval(&evaluated) {
            return if parent.gate {
                ParentResult::Gate
            } else {
                ParentResult::Skip
            };
        }
    }
    ParentResult::Pass
}

fn is_in_rollout(key: &str, rule: &RolloutRule, attributes: &Value) -> bool {
    let attribute = rule
        .hash_attribute
        .as_deref()
        .unwrap_or(DEFAULT_HASH_ATTRIBUTE);
    let Some(hash_value) = hash_attribute_value(attributes, attribute) else {
        return false;
    };
    let seed = rule.seed.as_deref().unwrap_or(key);
    let Some(n) = hash(seed, &hash_value, rule.hash_version.unwrap_or(1)) else {
        return false;
    };
    let range = rule
        .range
        .unwrap_or_else(|| BucketRange(0.0, rule.coverage.unwrap_or(1.0)));
    in_range(n, &range)
}

fn is_filtered_out(filters: &[Filter], attributes: &Value) -> bool {
    filters.iter().any(|filter| {
        let attribute = filter.attribute.as_deref().unwrap_or(DEFAULT_HASH_ATTRIBUTE);
        let Some(hash_value) = hash_attribute_value(attributes, attribute) else {
            return true;
        };
        let Some(n) = hash(&filter.seed, &hash_value, filter.hash_version.unwrap_or(2)) else {
            return true;
        };
        !filter.ranges.iter().any(|range| in_range(n, range))
    })
}

/// The hashable text of an attribute. Missing, empty and non-scalar attributes yield [`None`].
///
/// A top-level key wins over a dotted path of the same name.
fn hash_attribute_value(attributes: &Value, attribute: &str) -> Option<String> {
    let value = attributes
        .get(attribute)
        .or_else(|| get_path(attributes, attribute));
    to_js_string(value).filter(|v| !v.is_empty())
}

/// Per-run data copied into every [`Assignment`].
struct RunInfo<'a> {
    hash_attribute: String,
    hash_value: String,
    feature_id: Option<&'a str>,
    bucket: Option<f64>,
    sticky_bucket_used: bool,
}

impl RunInfo<'_> {
    fn assignment(
        &self,
        experiment: &Experiment,
        variation: Option<usize>,
        in_experiment: bool,
        hash_used: bool,
    ) -> Assignment {
        let index = variation
            .filter(|i| *i < experiment.variations.len())
            .unwrap_or(0);
        let in_experiment = in_experiment && variation == Some(index);
        let meta = experiment.variation_meta(index);
        Assignment {
            experiment_key: experiment.key.clone(),
            variation_id: index,
            value: experiment
                .variations
                .get(index)
                .cloned()
                .unwrap_or(Value::Null),
            hash_attribute: self.hash_attribute.clone(),
            hash_value: self.hash_value.clone(),
            in_experiment,
            hash_used,
            bucket: self.bucket,
            feature_id: self.feature_id.map(str::to_owned),
            sticky_bucket_used: self.sticky_bucket_used,
            key: experiment.variation_key(index),
            name: meta.and_then(|m| m.name.clone()),
            passthrough: meta.and_then(|m| m.passthrough).unwrap_or(false),
        }
    }

    fn not_in(&self, experiment: &Experiment) -> Assignment {
        self.assignment(experiment, None, false, false)
    }
}

pub(crate) fn run_experiment(
    experiment: &Experiment,
    feature_id: Option<&str>,
    ctx: &EvalContext,
    state: &mut EvalState,
) -> Assignment {
    let num_variations = experiment.variations.len();
    let sticky_store = ctx
        .sticky_store
        .filter(|_| !experiment.disable_sticky_bucketing.unwrap_or(false));
    let (hash_attribute, hash_value) =
        resolve_hash_attribute(experiment, ctx.attributes, sticky_store.is_some());
    let mut info = RunInfo {
        hash_attribute,
        hash_value: hash_value.clone().unwrap_or_default(),
        feature_id,
        bucket: None,
        sticky_bucket_used: false,
    };

    if num_variations < 2 {
        debug!("Experiment '{}' has less than 2 variations, skipping", experiment.key);
        return info.not_in(experiment);
    }
    if !ctx.enabled {
        return info.not_in(experiment);
    }
    let Some(hash_value) = hash_value else {
        debug!(
            "Attribute '{}' is missing, skipping experiment '{}'",
            info.hash_attribute, experiment.key
        );
        return info.not_in(experiment);
    };

    if let Some(url) = ctx.url {
        if let Some(index) = query_string_override(&experiment.key, url, num_variations) {
            return info.assignment(experiment, Some(index), false, false);
        }
    }
    if let Some(index) = ctx.forced_variations.get(&experiment.key) {
        return info.assignment(experiment, Some(*index), false, false);
    }
    if experiment.active == Some(false) {
        return info.not_in(experiment);
    }

    let mut variation = None;
    if let Some(store) = sticky_store {
        let assignments = sticky_assignments(experiment, ctx.attributes, store);
        match sticky_variation(experiment, &assignments) {
            StickyLookup::Blocked => {
                debug!("Sticky bucket version of experiment '{}' is blocked", experiment.key);
                info.sticky_bucket_used = true;
                return info.not_in(experiment);
            }
            StickyLookup::Found(index) => {
                variation = Some(index);
                info.sticky_bucket_used = true;
            }
            StickyLookup::None => {}
        }
    }

    if variation.is_none() {
        match (&experiment.filters, &experiment.namespace) {
            (Some(filters), _) => {
                if is_filtered_out(filters, ctx.attributes) {
                    return info.not_in(experiment);
                }
            }
            (None, Some(namespace)) => {
                if !in_namespace(&hash_value, namespace) {
                    return info.not_in(experiment);
                }
            }
            (None, None) => {}
        }
        if let Some(condition) = &experiment.condition {
            if !condition.eval(ctx.attributes) {
                return info.not_in(experiment);
            }
        }
    }

    let seed = experiment.seed.as_deref().unwrap_or(&experiment.key);
    let Some(n) = hash(seed, &hash_value, experiment.hash_version.unwrap_or(1)) else {
        warn!(event_id = 3002; "Experiment '{}' has an unsupported hash version, skipping", experiment.key);
        return info.not_in(experiment);
    };
    info.bucket = Some(n);

    if variation.is_none() {
        let ranges = match &experiment.ranges {
            Some(ranges) => ranges.clone(),
            None => get_bucket_ranges(
                num_variations,
                experiment.coverage.unwrap_or(1.0),
                experiment.weights.as_deref(),
            ),
        };
        variation = choose_variation(n, &ranges);
    }
    let Some(index) = variation else {
        return info.not_in(experiment);
    };

    if let Some(forced) = experiment.force {
        return info.assignment(experiment, Some(forced), false, false);
    }
    if ctx.qa_mode {
        return info.not_in(experiment);
    }

    let result = info.assignment(experiment, Some(index), true, true);
    if let Some(store) = sticky_store {
        save_sticky_assignment(experiment, store, &result);
    }
    state.included.push((experiment.clone(), result.clone()));
    result
}

/// Picks the hash attribute, falling back to `fallback_attribute` for sticky bucketed runs.
fn resolve_hash_attribute(
    experiment: &Experiment,
    attributes: &Value,
    sticky: bool,
) -> (String, Option<String>) {
    let attribute = experiment
        .hash_attribute
        .as_deref()
        .unwrap_or(DEFAULT_HASH_ATTRIBUTE);
    let value = hash_attribute_value(attributes, attribute);
    if value.is_none() && sticky {
        if let Some(fallback) = &experiment.fallback_attribute {
            if let Some(fallback_value) = hash_attribute_value(attributes, fallback) {
                return (fallback.clone(), Some(fallback_value));
            }
        }
    }
    (attribute.to_owned(), value)
}

enum StickyLookup {
    None,
    Found(usize),
    Blocked,
}

fn sticky_key(experiment: &Experiment, version: u32) -> String {
    format!("{}__{version}", experiment.key)
}

/// Merges the stored assignments of the fallback and hash attributes, the latter winning.
fn sticky_assignments(
    experiment: &Experiment,
    attributes: &Value,
    store: &dyn StickyBucketStore,
) -> HashMap<String, String> {
    let hash_attribute = experiment
        .hash_attribute
        .as_deref()
        .unwrap_or(DEFAULT_HASH_ATTRIBUTE);
    let mut merged = HashMap::new();
    for attribute in [experiment.fallback_attribute.as_deref(), Some(hash_attribute)]
        .into_iter()
        .flatten()
    {
        if let Some(value) = hash_attribute_value(attributes, attribute) {
            if let Some(doc) = store.get_assignments(attribute, &value) {
                merged.extend(doc.assignments);
            }
        }
    }
    merged
}

fn sticky_variation(experiment: &Experiment, assignments: &HashMap<String, String>) -> StickyLookup {
    let min_version = experiment.min_bucket_version.unwrap_or(0);
    if (0..min_version).any(|v| assignments.contains_key(&sticky_key(experiment, v))) {
        return StickyLookup::Blocked;
    }
    let version = experiment.bucket_version.unwrap_or(0);
    let Some(variation_key) = assignments.get(&sticky_key(experiment, version)) else {
        return StickyLookup::None;
    };
    match (0..experiment.variations.len()).find(|i| experiment.variation_key(*i) == *variation_key)
    {
        Some(index) => StickyLookup::Found(index),
        None => StickyLookup::None,
    }
}

fn save_sticky_assignment(
    experiment: &Experiment,
    store: &dyn StickyBucketStore,
    assignment: &Assignment,
) {
    let key = sticky_key(experiment, experiment.bucket_version.unwrap_or(0));
    let mut doc = store
        .get_assignments(&assignment.hash_attribute, &assignment.hash_value)
        .unwrap_or_else(|| {
            StickyAssignmentsDocument::new(&assignment.hash_attribute, &assignment.hash_value)
        });
    if doc.assignments.get(&key) == Some(&assignment.key) {
        return;
    }
    doc.assignments.insert(key, assignment.key.clone());
    store.save_assignments(doc);
}

#[cfg(test)]
mod evaluator_tests {
    use crate::eval::evaluator::{eval_feature, run_experiment, EvalContext, EvalState};
    use crate::model::enums::FeatureSource;
    use crate::model::experiment::Experiment;
    use crate::model::feature::FeatureDefinition;
    use crate::sticky::{InMemoryStickyBucketStore, StickyBucketStore};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    fn features(value: Value) -> HashMap<String, FeatureDefinition> {
        serde_json::from_value(value).unwrap()
    }

    fn ctx<'a>(
        features: &'a HashMap<String, FeatureDefinition>,
        attributes: &'a Value,
        empty_forced: &'a HashMap<String, Value>,
        empty_variations: &'a HashMap<String, usize>,
    ) -> EvalContext<'a> {
        EvalContext {
            features,
            attributes,
            forced_features: empty_forced,
            forced_variations: empty_variations,
            sticky_store: None,
            url: None,
            enabled: true,
            qa_mode: false,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let f = features(json!({
            "flag": {
                "defaultValue": "default",
                "rules": [
                    {"id": "r1", "condition": {"tier": "gold"}, "force": "gold"},
                    {"id": "r2", "condition": {"country": "US"}, "force": "us"},
                    {"id": "r3", "force": "everyone"}
                ]
            },
            "plain": {"defaultValue": 5}
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());

        let attrs = json!({"tier": "gold", "country": "US"});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!("gold"));
        assert_eq!(result.rule_id.as_deref(), Some("r1"));

        let attrs = json!({"country": "US"});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!("us"));
        assert_eq!(result.source, FeatureSource::Force);

        let attrs = json!({});
        let result = eval_feature("plain", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!(5));
        assert_eq!(result.source, FeatureSource::DefaultValue);
        assert!(result.on);

        let result = eval_feature("nope", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, Value::Null);
        assert_eq!(result.source, FeatureSource::UnknownFeature);
        assert!(result.off);
    }

    #[test]
    fn forced_feature_wins() {
        let f = features(json!({"flag": {"defaultValue": false}}));
        let forced = HashMap::from([("flag".to_owned(), json!(true))]);
        let variations = HashMap::new();
        let attrs = json!({});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!(true));
        assert_eq!(result.source, FeatureSource::Override);
    }

    #[test]
    fn rollout() {
        // hash("flag", "user-42", 1) == 0.317, hash("flag", "user-1", 1) == 0.574,
        // hash("sliced", "user-42", 1) == 0.525
        let f = features(json!({
            "flag": {
                "defaultValue": false,
                "rules": [{"force": true, "coverage": 0.5}]
            },
            "sliced": {
                "defaultValue": false,
                "rules": [{"force": true, "range": [0.6, 0.7]}, {"force": "slice", "range": [0.5, 0.6]}]
            }
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());

        let attrs = json!({"id": "user-42"});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.source, FeatureSource::Rollout);
        let result = eval_feature("sliced", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!("slice"));

        let attrs = json!({"id": "user-1"});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.source, FeatureSource::DefaultValue);

        let attrs = json!({});
        let result = eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.source, FeatureSource::DefaultValue);
    }

    #[test]
    fn dotted_hash_attribute() {
        // hash("flag", "user-42", 1) == 0.317, hash("flag", "user-1", 1) == 0.574
        let f = features(json!({
            "flag": {"defaultValue": false, "rules": [{"force": true, "coverage": 0.5, "hashAttribute": "user.id"}]}
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let source = |attrs: Value| {
            eval_feature("flag", &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).source
        };

        assert_eq!(source(json!({"user.id": "user-42"})), FeatureSource::Rollout);
        assert_eq!(source(json!({"user": {"id": "user-42"}})), FeatureSource::Rollout);
        assert_eq!(
            source(json!({"user.id": "user-1", "user": {"id": "user-42"}})),
            FeatureSource::DefaultValue
        );
    }

    #[test]
    fn filters() {
        // hash("flag", "user-42", 2) is in [0, 1) for sure, and never in [0, 0)
        let f = features(json!({
            "open": {"defaultValue": 0, "rules": [{"force": 1, "filters": [{"seed": "flag", "ranges": [[0.0, 1.0]]}]}]},
            "closed": {"defaultValue": 0, "rules": [{"force": 1, "filters": [{"seed": "flag", "ranges": [[0.0, 0.0]]}]}]}
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let attrs = json!({"id": "user-42"});
        let c = ctx(&f, &attrs, &forced, &variations);
        assert_eq!(eval_feature("open", &c, &mut EvalState::default()).value, json!(1));
        assert_eq!(eval_feature("closed", &c, &mut EvalState::default()).value, json!(0));
    }

    #[test]
    fn prerequisites() {
        let f = features(json!({
            "parent": {"defaultValue": true, "rules": [{"condition": {"beta": false}, "force": false}]},
            "gated": {
                "defaultValue": "on",
                "rules": [{"parentConditions": [{"id": "parent", "condition": {"value": true}, "gate": true}], "force": "child"}]
            },
            "soft": {
                "defaultValue": "fallback",
                "rules": [{"parentConditions": [{"id": "parent", "condition": {"value": true}}], "force": "child"}]
            }
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());

        let attrs = json!({"beta": true});
        let c = ctx(&f, &attrs, &forced, &variations);
        assert_eq!(eval_feature("gated", &c, &mut EvalState::default()).value, json!("child"));
        assert_eq!(eval_feature("soft", &c, &mut EvalState::default()).value, json!("child"));

        let attrs = json!({"beta": false});
        let c = ctx(&f, &attrs, &forced, &variations);
        let gated = eval_feature("gated", &c, &mut EvalState::default());
        assert_eq!(gated.value, Value::Null);
        assert_eq!(gated.source, FeatureSource::Prerequisite);
        let soft = eval_feature("soft", &c, &mut EvalState::default());
        assert_eq!(soft.value, json!("fallback"));
        assert_eq!(soft.source, FeatureSource::DefaultValue);
    }

    #[test]
    fn prerequisite_cycles() {
        let f = features(json!({
            "a": {"rules": [{"parentConditions": [{"id": "b", "condition": {"value": true}}], "force": 1}]},
            "b": {"rules": [{"parentConditions": [{"id": "a", "condition": {"value": true}}], "force": 1}]},
            "self": {"rules": [{"parentConditions": [{"id": "self", "condition": {"value": true}}], "force": 1}]}
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let attrs = json!({});
        let c = ctx(&f, &attrs, &forced, &variations);
        assert_eq!(eval_feature("a", &c, &mut EvalState::default()).source, FeatureSource::CyclicPrerequisite);
        assert_eq!(eval_feature("self", &c, &mut EvalState::default()).source, FeatureSource::CyclicPrerequisite);
    }

    #[test]
    fn experiment_rule() {
        // hash("exp1", "user-42", 1) == 0.369
        let f = features(json!({
            "feature": {
                "defaultValue": "none",
                "rules": [{"key": "exp1", "variations": ["control", "treatment"], "weights": [0.5, 0.5]}]
            },
            "passthrough": {
                "defaultValue": "none",
                "rules": [{"key": "exp1", "variations": ["control", "treatment"], "meta": [{"passthrough": true}, {}]}]
            }
        }));
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let attrs = json!({"id": "user-42"});
        let c = ctx(&f, &attrs, &forced, &variations);

        let mut state = EvalState::default();
        let result = eval_feature("feature", &c, &mut state);
        assert_eq!(result.value, json!("control"));
        assert_eq!(result.source, FeatureSource::Experiment);
        let assignment = result.experiment_result.unwrap();
        assert_eq!(assignment.variation_id, 0);
        assert_eq!(assignment.bucket, Some(0.369));
        assert_eq!(assignment.feature_id.as_deref(), Some("feature"));
        assert_eq!(state.included.len(), 1);

        let result = eval_feature("passthrough", &c, &mut EvalState::default());
        assert_eq!(result.value, json!("none"));
        assert_eq!(result.source, FeatureSource::DefaultValue);
    }

    #[test]
    fn experiment_exclusions() {
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let f = HashMap::new();
        let attrs = json!({"id": "user-42"});
        let base = Experiment::new("exp1", vec![json!(0), json!(1)]);

        let one = Experiment::new("exp1", vec![json!(0)]);
        assert!(!run_experiment(&one, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);

        let mut disabled = ctx(&f, &attrs, &forced, &variations);
        disabled.enabled = false;
        assert!(!run_experiment(&base, None, &disabled, &mut EvalState::default()).in_experiment);

        let missing = json!({});
        assert!(!run_experiment(&base, None, &ctx(&f, &missing, &forced, &variations), &mut EvalState::default()).in_experiment);

        let inactive = Experiment { active: Some(false), ..base.clone() };
        assert!(!run_experiment(&inactive, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);

        let uncovered = Experiment { coverage: Some(0.0), ..base.clone() };
        assert!(!run_experiment(&uncovered, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);

        let mut qa = ctx(&f, &attrs, &forced, &variations);
        qa.qa_mode = true;
        assert!(!run_experiment(&base, None, &qa, &mut EvalState::default()).in_experiment);

        // hash("__ns1", "user-42", 1) == 0.801
        let outside = Experiment {
            namespace: Some(serde_json::from_value(json!(["ns1", 0.0, 0.5])).unwrap()),
            ..base.clone()
        };
        assert!(!run_experiment(&outside, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);
        let inside = Experiment {
            namespace: Some(serde_json::from_value(json!(["ns1", 0.8, 1.0])).unwrap()),
            ..base.clone()
        };
        assert!(run_experiment(&inside, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);

        let conditioned = Experiment {
            condition: Some(serde_json::from_value(json!({"country": "US"})).unwrap()),
            ..base
        };
        assert!(!run_experiment(&conditioned, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default()).in_experiment);
    }

    #[test]
    fn experiment_overrides() {
        let f = HashMap::new();
        let forced = HashMap::new();
        let attrs = json!({"id": "user-42"});
        let base = Experiment::new("exp1", vec![json!("a"), json!("b"), json!("c")]);

        let variations = HashMap::from([("exp1".to_owned(), 2)]);
        let result = run_experiment(&base, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.value, json!("c"));
        assert!(!result.in_experiment);

        let variations = HashMap::new();
        let mut with_url = ctx(&f, &attrs, &forced, &variations);
        with_url.url = Some("https://example.com/?exp1=1");
        let mut state = EvalState::default();
        let result = run_experiment(&base, None, &with_url, &mut state);
        assert_eq!(result.value, json!("b"));
        assert!(!result.in_experiment);
        assert!(state.included.is_empty());

        let forced_index = Experiment { force: Some(1), ..base };
        let result = run_experiment(&forced_index, None, &ctx(&f, &attrs, &forced, &variations), &mut EvalState::default());
        assert_eq!(result.variation_id, 1);
        assert!(!result.in_experiment);
    }

    #[test]
    fn sticky_bucketing_survives_weight_changes() {
        let f = HashMap::new();
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let attrs = json!({"id": "user-42"});
        let store = InMemoryStickyBucketStore::new();
        let mut c = ctx(&f, &attrs, &forced, &variations);
        c.sticky_store = Some(&store);

        // 0.369 lands in the first half
        let first = Experiment {
            meta: Some(serde_json::from_value(json!([{"key": "control"}, {"key": "treatment"}])).unwrap()),
            ..Experiment::new("exp1", vec![json!("a"), json!("b")])
        };
        let result = run_experiment(&first, None, &c, &mut EvalState::default());
        assert_eq!(result.variation_id, 0);
        assert!(!result.sticky_bucket_used);
        let doc = store.get_assignments("id", "user-42").unwrap();
        assert_eq!(doc.assignments["exp1__0"], "control");

        // 0.369 would land in the second variation without the stored assignment
        let reweighted = Experiment {
            weights: Some(vec![0.1, 0.9]),
            ..first.clone()
        };
        let result = run_experiment(&reweighted, None, &c, &mut EvalState::default());
        assert_eq!(result.variation_id, 0);
        assert!(result.sticky_bucket_used);
        assert!(result.in_experiment);

        let blocked = Experiment {
            bucket_version: Some(1),
            min_bucket_version: Some(1),
            ..first.clone()
        };
        let result = run_experiment(&blocked, None, &c, &mut EvalState::default());
        assert!(!result.in_experiment);

        let disabled = Experiment {
            disable_sticky_bucketing: Some(true),
            ..reweighted
        };
        let result = run_experiment(&disabled, None, &c, &mut EvalState::default());
        assert_eq!(result.variation_id, 1);
    }

    #[test]
    fn sticky_fallback_attribute() {
        let f = HashMap::new();
        let (forced, variations) = (HashMap::new(), HashMap::new());
        let attrs = json!({"deviceId": "user-42"});
        let store = InMemoryStickyBucketStore::new();
        let exp = Experiment {
            fallback_attribute: Some("deviceId".to_owned()),
            ..Experiment::new("exp1", vec![json!("a"), json!("b")])
        };

        let c = ctx(&f, &attrs, &forced, &variations);
        assert!(!run_experiment(&exp, None, &c, &mut EvalState::default()).in_experiment);

        let mut sticky = ctx(&f, &attrs, &forced, &variations);
        sticky.sticky_store = Some(&store);
        let result = run_experiment(&exp, None, &sticky, &mut EvalState::default());
        assert!(result.in_experiment);
        assert_eq!(result.hash_attribute, "deviceId");
        assert!(store.get_assignments("deviceId", "user-42").is_some());
    }
}
