//! Evaluation results. These are what callers receive and what gets cached.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Timestamp;

/// Why a flag evaluated the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    /// A targeting rule (segment, user list, or attribute match) matched.
    TargetingRule,
    /// No rule matched; the configured default applies.
    Default,
    /// A previously persisted decision was served.
    StickyAssignment,
    /// The user's bucket falls inside the rollout.
    RolloutIncluded,
    /// The user's bucket falls outside the rollout.
    RolloutExcluded,
    /// A rollout needs a user id and none was provided.
    NoUserId,
    FlagNotFound,
    FlagArchived,
    EnvironmentNotFound,
    /// The flag has no configuration for the environment.
    NoConfig,
    FlagDisabled,
    UnsupportedFlagType,
    /// Flag data is malformed; the flag is served disabled.
    EvaluationError,
    /// The backing store failed; the flag is served disabled.
    RepositoryError,
}

impl FlagReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlagReason::TargetingRule => "targeting_rule",
            FlagReason::Default => "default",
            FlagReason::StickyAssignment => "sticky_assignment",
            FlagReason::RolloutIncluded => "rollout_included",
            FlagReason::RolloutExcluded => "rollout_excluded",
            FlagReason::NoUserId => "no_user_id",
            FlagReason::FlagNotFound => "flag_not_found",
            FlagReason::FlagArchived => "flag_archived",
            FlagReason::EnvironmentNotFound => "environment_not_found",
            FlagReason::NoConfig => "no_config",
            FlagReason::FlagDisabled => "flag_disabled",
            FlagReason::UnsupportedFlagType => "unsupported_flag_type",
            FlagReason::EvaluationError => "evaluation_error",
            FlagReason::RepositoryError => "repository_error",
        }
    }

    /// Returns `true` if an evaluation with this reason may be served from cache later.
    ///
    /// Results produced by faults are not cached, so that the next request retries.
    pub fn is_cacheable(self) -> bool {
        !matches!(
            self,
            FlagReason::FlagNotFound
                | FlagReason::EnvironmentNotFound
                | FlagReason::UnsupportedFlagType
                | FlagReason::EvaluationError
                | FlagReason::RepositoryError
        )
    }
}

impl std::fmt::Display for FlagReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an experiment evaluated the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentReason {
    NotFound,
    ExperimentNotRunning,
    ExperimentNotStarted,
    ExperimentEnded,
    EnvironmentNotFound,
    NoVariants,
    NoUserId,
    /// The user is outside the experiment's traffic allocation and sees no variant at all.
    TrafficExcluded,
    StickyAssignment,
    NoVariantWeights,
    /// Weighted selection found nothing. Unreachable while weights sum to more than zero.
    NoVariantSelected,
    VariantAssignment,
    RepositoryError,
}

impl ExperimentReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExperimentReason::NotFound => "not_found",
            ExperimentReason::ExperimentNotRunning => "experiment_not_running",
            ExperimentReason::ExperimentNotStarted => "experiment_not_started",
            ExperimentReason::ExperimentEnded => "experiment_ended",
            ExperimentReason::EnvironmentNotFound => "environment_not_found",
            ExperimentReason::NoVariants => "no_variants",
            ExperimentReason::NoUserId => "no_user_id",
            ExperimentReason::TrafficExcluded => "traffic_excluded",
            ExperimentReason::StickyAssignment => "sticky_assignment",
            ExperimentReason::NoVariantWeights => "no_variant_weights",
            ExperimentReason::NoVariantSelected => "no_variant_selected",
            ExperimentReason::VariantAssignment => "variant_assignment",
            ExperimentReason::RepositoryError => "repository_error",
        }
    }

    /// Returns `true` if an evaluation with this reason may be served from cache later.
    pub fn is_cacheable(self) -> bool {
        !matches!(
            self,
            ExperimentReason::NotFound
                | ExperimentReason::EnvironmentNotFound
                | ExperimentReason::NoVariantSelected
                | ExperimentReason::RepositoryError
        )
    }
}

impl std::fmt::Display for ExperimentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a flag evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEvaluation {
    pub key: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub reason: FlagReason,
    pub timestamp: Timestamp,
}

impl FeatureEvaluation {
    /// A boolean decision, with `value` mirroring `enabled`.
    pub(crate) fn boolean(key: &str, enabled: bool, reason: FlagReason, now: Timestamp) -> Self {
        FeatureEvaluation {
            key: key.to_owned(),
            enabled,
            value: Some(serde_json::Value::Bool(enabled)),
            variant: None,
            reason,
            timestamp: now,
        }
    }

    /// A fail-closed decision carrying no value.
    pub(crate) fn disabled(key: &str, reason: FlagReason, now: Timestamp) -> Self {
        FeatureEvaluation {
            key: key.to_owned(),
            enabled: false,
            value: None,
            variant: None,
            reason,
            timestamp: now,
        }
    }
}

/// Outcome of an experiment evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvaluation {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub in_experiment: bool,
    pub reason: ExperimentReason,
    pub timestamp: Timestamp,
}

impl ExperimentEvaluation {
    /// The user is not part of the experiment.
    pub(crate) fn excluded(key: &str, reason: ExperimentReason, now: Timestamp) -> Self {
        ExperimentEvaluation {
            key: key.to_owned(),
            variant_id: None,
            variant: None,
            payload: None,
            in_experiment: false,
            reason,
            timestamp: now,
        }
    }
}
