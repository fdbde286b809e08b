use uuid::Uuid;

use crate::{
    evaluation::{FeatureEvaluation, FlagReason},
    hasher::{in_rollout, AssignmentHasher},
    models::{
        AssignmentTarget, FeatureEnvironment, FeatureFlag, FeatureFlagConfig, FlagType,
        FlagVariant, TargetingRules, Timestamp, TryParse, UserAssignment,
    },
    repository::{Repository, RepositoryError},
    segment::{evaluate_segment, values_equal},
    EvaluationContext, EvaluationError,
};

use super::{select_by_hash, Evaluated};

const CONTROL: &str = "control";
const TREATMENT: &str = "treatment";

/// Decides flag outcomes for `boolean`, `percentage` and `variant` flags.
///
/// Reads segments and sticky records through the repository. Failures of those lookups, and
/// segments whose conditions fail to evaluate, degrade (the segment does not match, the sticky
/// record is absent) rather than fail the evaluation.
pub struct FeatureEvaluator<'a> {
    repository: &'a dyn Repository,
    hasher: &'a dyn AssignmentHasher,
}

impl<'a> FeatureEvaluator<'a> {
    pub fn new(repository: &'a dyn Repository, hasher: &'a dyn AssignmentHasher) -> Self {
        FeatureEvaluator { repository, hasher }
    }

    /// Evaluate `flag` for `context` using its configuration in `environment`.
    ///
    /// Flag types other than boolean, percentage and variant evaluate to `unsupported_flag_type`.
    pub fn evaluate(
        &self,
        flag: &FeatureFlag,
        config: &FeatureFlagConfig,
        environment: &FeatureEnvironment,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> Result<Evaluated<FeatureEvaluation>, EvaluationError> {
        match flag.flag_type {
            FlagType::Boolean => self.evaluate_boolean(flag, config, context, now),
            FlagType::Percentage => {
                self.evaluate_percentage(flag, config, environment, context, now)
            }
            FlagType::Variant => self.evaluate_variant(flag, config, context, now),
            FlagType::Experiment | FlagType::Unknown => Ok(Evaluated::new(
                FeatureEvaluation::disabled(&flag.key, FlagReason::UnsupportedFlagType, now),
            )),
        }
    }

    fn evaluate_boolean(
        &self,
        flag: &FeatureFlag,
        config: &FeatureFlagConfig,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> Result<Evaluated<FeatureEvaluation>, EvaluationError> {
        let evaluation = if self.matches_targeting(flag, config, context)? {
            FeatureEvaluation::boolean(&flag.key, true, FlagReason::TargetingRule, now)
        } else {
            FeatureEvaluation::boolean(&flag.key, config.enabled, FlagReason::Default, now)
        };
        Ok(Evaluated::new(evaluation))
    }

    fn evaluate_percentage(
        &self,
        flag: &FeatureFlag,
        config: &FeatureFlagConfig,
        environment: &FeatureEnvironment,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> Result<Evaluated<FeatureEvaluation>, EvaluationError> {
        if self.matches_targeting(flag, config, context)? {
            return Ok(Evaluated::new(FeatureEvaluation::boolean(
                &flag.key,
                true,
                FlagReason::TargetingRule,
                now,
            )));
        }

        let Some(user_id) = context.user_id.as_deref() else {
            return Ok(Evaluated::new(FeatureEvaluation::boolean(
                &flag.key,
                false,
                FlagReason::NoUserId,
                now,
            )));
        };

        if let Some(enabled) = self.sticky_outcome(user_id, environment.id, &flag.key) {
            return Ok(Evaluated::new(FeatureEvaluation::boolean(
                &flag.key,
                enabled,
                FlagReason::StickyAssignment,
                now,
            )));
        }

        let rollout = config.rollout_percentage.unwrap_or(0.0);
        let percentage = self
            .hasher
            .hash_to_percentage(user_id, &flag.key, &salt(flag.id));
        let enabled = in_rollout(percentage, rollout);

        log::trace!(target: "flagwise",
                    flag_key:display = flag.key,
                    user_id,
                    percentage,
                    rollout,
                    enabled;
                    "evaluated percentage rollout");

        let reason = if enabled {
            FlagReason::RolloutIncluded
        } else {
            FlagReason::RolloutExcluded
        };
        let sticky = UserAssignment {
            user_id: user_id.to_owned(),
            environment_id: environment.id,
            target: AssignmentTarget::Flag {
                flag_id: flag.id,
                flag_key: flag.key.clone(),
                enabled,
            },
            created_at: now,
        };
        Ok(Evaluated::pinned(
            FeatureEvaluation::boolean(&flag.key, enabled, reason, now),
            sticky,
        ))
    }

    fn evaluate_variant(
        &self,
        flag: &FeatureFlag,
        config: &FeatureFlagConfig,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> Result<Evaluated<FeatureEvaluation>, EvaluationError> {
        if self.matches_targeting(flag, config, context)? {
            return Ok(Evaluated::new(variant_evaluation(
                &flag.key,
                true,
                TREATMENT,
                None,
                FlagReason::TargetingRule,
                now,
            )));
        }

        let Some(rollout) = config.rollout_percentage else {
            return Ok(Evaluated::new(variant_evaluation(
                &flag.key,
                true,
                CONTROL,
                None,
                FlagReason::Default,
                now,
            )));
        };

        let subject = context.user_id.as_deref().unwrap_or("");
        let salt = salt(flag.id);
        let percentage = self.hasher.hash_to_percentage(subject, &flag.key, &salt);
        if !in_rollout(percentage, rollout) {
            return Ok(Evaluated::new(FeatureEvaluation {
                variant: Some(CONTROL.to_owned()),
                ..FeatureEvaluation::disabled(&flag.key, FlagReason::RolloutExcluded, now)
            }));
        }

        let defaults;
        let variants: &[FlagVariant] = if config.variants.is_empty() {
            defaults = default_variants();
            &defaults
        } else {
            &config.variants
        };

        let hash = self.hasher.hash(subject, &flag.key, &salt);
        let evaluation = match select_by_hash(variants, hash) {
            Some(variant) => variant_evaluation(
                &flag.key,
                true,
                &variant.key,
                variant.payload.clone(),
                FlagReason::RolloutIncluded,
                now,
            ),
            None => {
                log::debug!(target: "flagwise",
                            flag_key:display = flag.key;
                            "all variant weights are zero, serving control");
                variant_evaluation(&flag.key, true, CONTROL, None, FlagReason::Default, now)
            }
        };
        Ok(Evaluated::new(evaluation))
    }

    /// Returns `true` if any targeting rule of `config` selects `context`.
    ///
    /// Rules are checked in order: segment membership, the user id allow-list, then attribute
    /// equality (all listed attributes must match).
    fn matches_targeting(
        &self,
        flag: &FeatureFlag,
        config: &FeatureFlagConfig,
        context: &EvaluationContext,
    ) -> Result<bool, EvaluationError> {
        let rules: &TargetingRules = match &config.targeting_rules {
            None => return Ok(false),
            Some(TryParse::Parsed(rules)) => rules,
            Some(TryParse::ParseFailed(_)) => return Err(EvaluationError::MalformedTargetingRules),
        };

        for segment_key in &rules.segments {
            match self.repository.get_user_segment(segment_key) {
                Ok(segment) => match evaluate_segment(&segment, context) {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(err) => {
                        log::warn!(target: "flagwise",
                                   flag_key:display = flag.key,
                                   segment_key:display = segment_key;
                                   "skipping segment that failed to evaluate: {err}");
                    }
                },
                Err(RepositoryError::NotFound) => {
                    log::debug!(target: "flagwise",
                                flag_key:display = flag.key,
                                segment_key:display = segment_key;
                                "targeted segment does not exist");
                }
                Err(err) => {
                    log::warn!(target: "flagwise",
                               flag_key:display = flag.key,
                               segment_key:display = segment_key;
                               "failed to load segment, treating as non-matching: {err}");
                }
            }
        }

        if let Some(user_id) = &context.user_id {
            if rules.user_ids.iter().any(|id| id == user_id) {
                return Ok(true);
            }
        }

        let attributes_match = !rules.attributes.is_empty()
            && rules.attributes.iter().all(|(name, expected)| {
                context
                    .resolve(name)
                    .is_some_and(|actual| values_equal(&actual, expected))
            });
        Ok(attributes_match)
    }

    /// Outcome pinned by an existing sticky record, if there is one.
    fn sticky_outcome(&self, user_id: &str, environment_id: Uuid, flag_key: &str) -> Option<bool> {
        match self
            .repository
            .get_user_assignment(user_id, environment_id, flag_key)
        {
            Ok(UserAssignment {
                target: AssignmentTarget::Flag { enabled, .. },
                ..
            }) => Some(enabled),
            Ok(_) => {
                log::warn!(target: "flagwise",
                           flag_key,
                           user_id;
                           "sticky record for flag pins an experiment, ignoring");
                None
            }
            Err(RepositoryError::NotFound) => None,
            Err(err) => {
                log::warn!(target: "flagwise",
                           flag_key,
                           user_id;
                           "failed to load sticky record, recomputing: {err}");
                None
            }
        }
    }
}

fn salt(id: Uuid) -> String {
    id.to_string()
}

fn default_variants() -> Vec<FlagVariant> {
    ["variant_a", "variant_b"]
        .into_iter()
        .map(|key| FlagVariant {
            key: key.to_owned(),
            weight: 1,
            payload: None,
        })
        .collect()
}

fn variant_evaluation(
    key: &str,
    enabled: bool,
    variant: &str,
    payload: Option<serde_json::Value>,
    reason: FlagReason,
    now: Timestamp,
) -> FeatureEvaluation {
    FeatureEvaluation {
        key: key.to_owned(),
        enabled,
        value: Some(payload.unwrap_or_else(|| serde_json::Value::String(variant.to_owned()))),
        variant: Some(variant.to_owned()),
        reason,
        timestamp: now,
    }
}
