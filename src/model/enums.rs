use std::fmt::{Display, Formatter};

/// Describes why an evaluated feature got its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSource {
    /// The feature key is not in the feature map.
    UnknownFeature,
    /// No rule matched, the feature's default value was used.
    DefaultValue,
    /// A force rule matched.
    Force,
    /// A percentage rollout rule matched.
    Rollout,
    /// An experiment rule put the user into a variation.
    Experiment,
    /// The value was forced on the context.
    Override,
    /// A gating prerequisite feature blocked the evaluation.
    Prerequisite,
    /// Prerequisite features depend on each other in a cycle.
    CyclicPrerequisite,
}

impl Display for FeatureSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureSource::UnknownFeature => f.write_str("unknownFeature"),
            FeatureSource::DefaultValue => f.write_str("defaultValue"),
            FeatureSource::Force => f.write_str("force"),
            FeatureSource::Rollout => f.write_str("rollout"),
            FeatureSource::Experiment => f.write_str("experiment"),
            FeatureSource::Override => f.write_str("override"),
            FeatureSource::Prerequisite => f.write_str("prerequisite"),
            FeatureSource::CyclicPrerequisite => f.write_str("cyclicPrerequisite"),
        }
    }
}
