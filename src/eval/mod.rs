//! Decision logic for flags and experiments.
//!
//! Evaluators are pure with respect to time (`now` is passed in) and never write: a decision that
//! should be pinned is returned as a [`UserAssignment`] alongside the evaluation, and the caller
//! decides when to persist it.
mod experiment;
mod feature;
mod weighted;

pub use experiment::ExperimentEvaluator;
pub use feature::FeatureEvaluator;
pub use weighted::{select_by_hash, total_weight, Weighted};

use crate::models::UserAssignment;

/// An evaluation plus the sticky record it produced, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated<T> {
    pub evaluation: T,
    /// Record to persist so that later evaluations return the same outcome.
    pub sticky: Option<UserAssignment>,
}

impl<T> Evaluated<T> {
    pub(crate) fn new(evaluation: T) -> Evaluated<T> {
        Evaluated {
            evaluation,
            sticky: None,
        }
    }

    pub(crate) fn pinned(evaluation: T, sticky: UserAssignment) -> Evaluated<T> {
        Evaluated {
            evaluation,
            sticky: Some(sticky),
        }
    }
}
