//! The storage port the engine reads definitions from and writes sticky assignments and analytics
//! events to.
//!
//! Production deployments implement [`Repository`] over their database. [`InMemoryRepository`] is
//! a complete implementation for tests, benchmarks and embedded use.
use uuid::Uuid;

use crate::models::{
    Experiment, ExperimentVariant, FeatureEnvironment, FeatureEvent, FeatureFlag,
    FeatureFlagConfig, UserAssignment, UserSegment,
};

mod memory;

pub use memory::{InMemoryRepository, RepositorySnapshot};

/// Result type of repository calls.
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Errors reported by a [`Repository`].
///
/// Not-found is distinct from a transport or backend failure, so that the engine can tell an absent
/// record from an outage.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RepositoryError {
    /// The record does not exist.
    #[error("record not found")]
    NotFound,

    /// A record with the same unique key already exists.
    ///
    /// Returned by [`Repository::create_user_assignment`] when another replica won the race to
    /// persist the same sticky assignment. The engine treats it as success.
    #[error("record already exists")]
    AlreadyExists,

    /// The backing store failed. Such errors are considered transient.
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Read access to flag definitions, plus the two append-style writes the engine performs.
///
/// All methods are synchronous: evaluation runs on the caller's thread and only waits on this port
/// and on the [`Cache`](crate::cache::Cache).
pub trait Repository: Send + Sync {
    fn get_feature_flag(&self, key: &str) -> RepositoryResult<FeatureFlag>;

    /// List flags whose `archived` field equals `archived`.
    fn get_feature_flags(&self, archived: bool) -> RepositoryResult<Vec<FeatureFlag>>;

    fn get_environment(&self, name: &str) -> RepositoryResult<FeatureEnvironment>;

    fn get_feature_flag_config(
        &self,
        flag_id: Uuid,
        environment_id: Uuid,
    ) -> RepositoryResult<FeatureFlagConfig>;

    fn get_experiment(&self, key: &str) -> RepositoryResult<Experiment>;

    /// Variants of the experiment in declaration order.
    fn get_experiment_variants(&self, experiment_id: Uuid)
        -> RepositoryResult<Vec<ExperimentVariant>>;

    fn get_user_segment(&self, key: &str) -> RepositoryResult<UserSegment>;

    /// Look up the sticky record of `user_id` for the flag or experiment named `key`.
    fn get_user_assignment(
        &self,
        user_id: &str,
        environment_id: Uuid,
        key: &str,
    ) -> RepositoryResult<UserAssignment>;

    /// Persist a sticky record. Implementations must keep at most one record per
    /// `(user_id, environment_id, key)` and return [`RepositoryError::AlreadyExists`] for the
    /// loser of a race.
    fn create_user_assignment(&self, assignment: &UserAssignment) -> RepositoryResult<()>;

    fn create_feature_event(&self, event: &FeatureEvent) -> RepositoryResult<()>;
}
