//! Feature flag and experiment assignment SDK for Rust.
//!
//! The [`Client`] loads a feature payload through a [`FeatureRepository`] and evaluates
//! features and experiments for the attributes of a user. Evaluation is deterministic:
//! the same payload and attributes always produce the same values and variations.

#![warn(missing_docs)]

mod attributes;
mod builder;
mod cache;
mod client;
mod constants;
mod context;
mod errors;
mod eval;
mod fetch;
mod model;
mod modes;
mod options;
mod sticky;
mod utils;

pub use attributes::Attributes;
pub use builder::ClientBuilder;
pub use cache::PersistentCache;
pub use client::Client;
pub use constants::PKG_VERSION;
pub use context::Context;
pub use errors::{ClientError, ErrorKind};

pub use eval::condition::{
    eval_condition, Condition, ConditionError, ElemMatch, Operator, ValueCondition, VersionOp,
    MAX_CONDITION_DEPTH,
};
pub use eval::details::{Assignment, FeatureResult};
pub use eval::hashing::{
    choose_variation, get_bucket_ranges, get_equal_weights, hash, in_namespace, in_range,
    query_string_override,
};

pub use model::enums::FeatureSource;
pub use model::experiment::{BucketRange, Experiment, Filter, Namespace, VariationMeta};
pub use model::feature::{
    ExperimentRule, FeatureApiResponse, FeatureDefinition, Features, ForceRule, ParentCondition,
    RolloutRule, Rule, RuleTargeting,
};

pub use fetch::repository::{FeatureRepository, Subscription};
pub use modes::RefreshStrategy;
pub use options::{RepositoryOptions, RepositoryOptionsBuilder};
pub use sticky::{InMemoryStickyBucketStore, StickyAssignmentsDocument, StickyBucketStore};
