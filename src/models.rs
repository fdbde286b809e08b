//! Records read from and written to the [`Repository`](crate::repository::Repository).
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::segment::Condition;

#[allow(missing_docs)]
pub type Timestamp = DateTime<Utc>;

/// `TryParse` allows a subfield to fail parsing without failing the parsing of the whole record.
///
/// This keeps a flag with malformed targeting rules loadable: the problem surfaces when the rules
/// are actually needed, as an evaluation error for that flag only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<T> From<T> for TryParse<T> {
    fn from(value: T) -> TryParse<T> {
        TryParse::Parsed(value)
    }
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// A feature flag definition.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FeatureFlag {
    pub id: Uuid,
    /// Globally unique, stable key.
    pub key: String,
    #[serde(rename = "type")]
    pub flag_type: FlagType,
    pub enabled: bool,
    /// Archived flags are disabled regardless of their configuration.
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Evaluation strategy of a flag.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Boolean,
    Percentage,
    Variant,
    /// Flags that front an experiment. Evaluated through
    /// [`FeatureManager::evaluate_experiment`](crate::FeatureManager::evaluate_experiment).
    Experiment,
    /// A type this version does not know about.
    #[serde(other)]
    Unknown,
}

/// A named deployment tier.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FeatureEnvironment {
    pub id: Uuid,
    pub name: String,
}

/// Configuration of one flag in one environment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FeatureFlagConfig {
    pub flag_id: Uuid,
    pub environment_id: Uuid,
    pub enabled: bool,
    /// Share of users (0–100) that receive the flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_rules: Option<TryParse<TargetingRules>>,
    /// Weighted variants served by `variant` flags. Order is significant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<FlagVariant>,
}

/// Overrides evaluated before any statistical rollout.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct TargetingRules {
    /// Keys of segments whose members receive the flag.
    #[serde(default)]
    pub segments: Vec<String>,
    /// Users that receive the flag.
    #[serde(default)]
    pub user_ids: Vec<String>,
    /// Attributes that must all be equal for the flag to be received.
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl TargetingRules {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.user_ids.is_empty() && self.attributes.is_empty()
    }
}

/// A weighted arm of a `variant` flag.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FlagVariant {
    pub key: String,
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// An A/B/n test.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Experiment {
    pub id: Uuid,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<Timestamp>,
    /// Share of users (0–100) eligible for assignment at all.
    pub traffic_allocation: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Archived,
}

/// A weighted arm of an experiment.
///
/// The order in which variants are declared is the tie-break order for selection and must not
/// change while the experiment is live.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExperimentVariant {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub key: String,
    /// Relative weight, not required to sum to 100.
    pub weight: u32,
    #[serde(default)]
    pub is_control: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// A reusable set of AND-combined conditions.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserSegment {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A persisted decision that pins a user to an outcome.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserAssignment {
    pub user_id: String,
    pub environment_id: Uuid,
    #[serde(flatten)]
    pub target: AssignmentTarget,
    pub created_at: Timestamp,
}

impl UserAssignment {
    /// Key of the flag or experiment this record pins.
    pub fn key(&self) -> &str {
        match &self.target {
            AssignmentTarget::Flag { flag_key, .. } => flag_key,
            AssignmentTarget::Experiment { experiment_key, .. } => experiment_key,
        }
    }
}

/// What a [`UserAssignment`] pins: a flag outcome or an experiment variant, never both.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentTarget {
    Flag {
        flag_id: Uuid,
        flag_key: String,
        enabled: bool,
    },
    Experiment {
        experiment_id: Uuid,
        experiment_key: String,
        variant_id: Uuid,
    },
}

/// Analytics record of an evaluation outcome. Append-only.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FeatureEvent {
    pub id: Uuid,
    pub event_type: FeatureEventType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    pub created_at: Timestamp,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum FeatureEventType {
    FlagEvaluation,
    ExperimentEvaluation,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        AssignmentTarget, FeatureFlag, FeatureFlagConfig, FlagType, TargetingRules, TryParse,
        UserAssignment,
    };

    #[test]
    fn unknown_flag_type_does_not_fail_parsing() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "id": "6f1c1f2e-4a2b-4c55-9c8e-8d8c4b7a1f00",
            "key": "new",
            "type": "multivariate",
            "enabled": true
        }))
        .unwrap();
        assert_eq!(flag.flag_type, FlagType::Unknown);
        assert!(!flag.archived);
    }

    #[test]
    fn malformed_targeting_rules_are_isolated() {
        let config: FeatureFlagConfig = serde_json::from_value(json!({
            "flag_id": "6f1c1f2e-4a2b-4c55-9c8e-8d8c4b7a1f00",
            "environment_id": "0b6d1c8e-2f1a-4f58-9d3c-3e2f7c1b9a11",
            "enabled": true,
            "targeting_rules": {"user_ids": "not-a-list"}
        }))
        .unwrap();
        assert!(matches!(
            config.targeting_rules,
            Some(TryParse::ParseFailed(_))
        ));
    }

    #[test]
    fn targeting_rules_parse() {
        let rules: TargetingRules = serde_json::from_value(json!({
            "segments": ["beta-testers"],
            "user_ids": ["alice"],
            "attributes": {"plan": "pro"}
        }))
        .unwrap();
        assert_eq!(rules.segments, vec!["beta-testers"]);
        assert!(!rules.is_empty());
        assert!(TargetingRules::default().is_empty());
    }

    #[test]
    fn assignment_target_is_tagged() {
        let assignment: UserAssignment = serde_json::from_value(json!({
            "user_id": "alice",
            "environment_id": "0b6d1c8e-2f1a-4f58-9d3c-3e2f7c1b9a11",
            "kind": "flag",
            "flag_id": "6f1c1f2e-4a2b-4c55-9c8e-8d8c4b7a1f00",
            "flag_key": "beta",
            "enabled": true,
            "created_at": "2024-05-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(assignment.key(), "beta");
        assert!(matches!(
            assignment.target,
            AssignmentTarget::Flag { enabled: true, .. }
        ));
    }
}
