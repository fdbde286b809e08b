use uuid::Uuid;

use crate::{
    evaluation::{ExperimentEvaluation, ExperimentReason},
    hasher::{in_rollout, AssignmentHasher},
    models::{
        AssignmentTarget, Experiment, ExperimentStatus, ExperimentVariant, FeatureEnvironment,
        Timestamp, UserAssignment,
    },
    repository::{Repository, RepositoryError},
    EvaluationContext,
};

use super::{select_by_hash, total_weight, Evaluated};

/// Assigns users to experiment variants.
pub struct ExperimentEvaluator<'a> {
    repository: &'a dyn Repository,
    hasher: &'a dyn AssignmentHasher,
}

impl<'a> ExperimentEvaluator<'a> {
    pub fn new(repository: &'a dyn Repository, hasher: &'a dyn AssignmentHasher) -> Self {
        ExperimentEvaluator { repository, hasher }
    }

    /// Check whether `experiment` is accepting users at `now`.
    ///
    /// Returns the terminal reason if it is not running, has not started yet or has ended.
    pub fn schedule_gate(experiment: &Experiment, now: Timestamp) -> Option<ExperimentReason> {
        if experiment.status != ExperimentStatus::Running {
            return Some(ExperimentReason::ExperimentNotRunning);
        }
        if experiment.start_date.is_some_and(|start| now < start) {
            return Some(ExperimentReason::ExperimentNotStarted);
        }
        if experiment.end_date.is_some_and(|end| now > end) {
            return Some(ExperimentReason::ExperimentEnded);
        }
        None
    }

    /// Assign `context` to one of `variants`.
    ///
    /// `variants` must be in declaration order. The schedule is not checked here, see
    /// [`ExperimentEvaluator::schedule_gate`].
    pub fn evaluate(
        &self,
        experiment: &Experiment,
        variants: &[ExperimentVariant],
        environment: &FeatureEnvironment,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> Evaluated<ExperimentEvaluation> {
        let excluded =
            |reason| Evaluated::new(ExperimentEvaluation::excluded(&experiment.key, reason, now));

        if variants.is_empty() {
            return excluded(ExperimentReason::NoVariants);
        }

        let Some(user_id) = context.user_id.as_deref() else {
            return excluded(ExperimentReason::NoUserId);
        };

        if let Some(variant) = self.sticky_variant(experiment, variants, user_id, environment.id)
        {
            return Evaluated::new(assigned(
                &experiment.key,
                variant,
                ExperimentReason::StickyAssignment,
                now,
            ));
        }

        let salt = experiment.id.to_string();
        let percentage = self
            .hasher
            .hash_to_percentage(user_id, &experiment.key, &salt);
        if !in_rollout(percentage, experiment.traffic_allocation) {
            log::trace!(target: "flagwise",
                        experiment_key:display = experiment.key,
                        user_id,
                        percentage;
                        "user outside experiment traffic");
            return excluded(ExperimentReason::TrafficExcluded);
        }

        if total_weight(variants) == 0 {
            return excluded(ExperimentReason::NoVariantWeights);
        }

        let hash = self.hasher.hash(user_id, &experiment.key, &salt);
        let Some(variant) = select_by_hash(variants, hash) else {
            return excluded(ExperimentReason::NoVariantSelected);
        };

        log::trace!(target: "flagwise",
                    experiment_key:display = experiment.key,
                    user_id,
                    variant:display = variant.key;
                    "assigned experiment variant");

        let sticky = UserAssignment {
            user_id: user_id.to_owned(),
            environment_id: environment.id,
            target: AssignmentTarget::Experiment {
                experiment_id: experiment.id,
                experiment_key: experiment.key.clone(),
                variant_id: variant.id,
            },
            created_at: now,
        };
        Evaluated::pinned(
            assigned(
                &experiment.key,
                variant,
                ExperimentReason::VariantAssignment,
                now,
            ),
            sticky,
        )
    }

    fn sticky_variant<'v>(
        &self,
        experiment: &Experiment,
        variants: &'v [ExperimentVariant],
        user_id: &str,
        environment_id: Uuid,
    ) -> Option<&'v ExperimentVariant> {
        let assignment = match self
            .repository
            .get_user_assignment(user_id, environment_id, &experiment.key)
        {
            Ok(assignment) => assignment,
            Err(RepositoryError::NotFound) => return None,
            Err(err) => {
                log::warn!(target: "flagwise",
                           experiment_key:display = experiment.key,
                           user_id;
                           "failed to load sticky record, recomputing: {err}");
                return None;
            }
        };

        let AssignmentTarget::Experiment { variant_id, .. } = assignment.target else {
            log::warn!(target: "flagwise",
                       experiment_key:display = experiment.key,
                       user_id;
                       "sticky record for experiment pins a flag, ignoring");
            return None;
        };

        let variant = variants.iter().find(|variant| variant.id == variant_id);
        if variant.is_none() {
            log::warn!(target: "flagwise",
                       experiment_key:display = experiment.key,
                       user_id,
                       variant_id:display = variant_id;
                       "sticky record points to a variant that no longer exists, ignoring");
        }
        variant
    }
}

fn assigned(
    key: &str,
    variant: &ExperimentVariant,
    reason: ExperimentReason,
    now: Timestamp,
) -> ExperimentEvaluation {
    ExperimentEvaluation {
        key: key.to_owned(),
        variant_id: Some(variant.id),
        variant: Some(variant.key.clone()),
        payload: variant.payload.clone(),
        in_experiment: true,
        reason,
        timestamp: now,
    }
}
