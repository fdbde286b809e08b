use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Repository, RepositoryError, RepositoryResult};
use crate::models::{
    Experiment, ExperimentVariant, FeatureEnvironment, FeatureEvent, FeatureFlag,
    FeatureFlagConfig, UserAssignment, UserSegment,
};

/// Serializable contents of an [`InMemoryRepository`], e.g. a JSON fixture.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    #[serde(default)]
    pub environments: Vec<FeatureEnvironment>,
    #[serde(default)]
    pub flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub configs: Vec<FeatureFlagConfig>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    /// Variants of all experiments, in declaration order.
    #[serde(default)]
    pub variants: Vec<ExperimentVariant>,
    #[serde(default)]
    pub segments: Vec<UserSegment>,
    #[serde(default)]
    pub assignments: Vec<UserAssignment>,
}

#[derive(Default)]
struct State {
    flags: HashMap<String, FeatureFlag>,
    environments: HashMap<String, FeatureEnvironment>,
    configs: HashMap<(Uuid, Uuid), FeatureFlagConfig>,
    experiments: HashMap<String, Experiment>,
    variants: HashMap<Uuid, Vec<ExperimentVariant>>,
    segments: HashMap<String, UserSegment>,
    assignments: HashMap<(String, Uuid, String), UserAssignment>,
    events: Vec<FeatureEvent>,
}

/// A [`Repository`] kept entirely in memory.
///
/// Sticky assignments honour the same unique constraint a database would: the first writer wins,
/// later writers get [`RepositoryError::AlreadyExists`].
#[derive(Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
    /// When set, every call fails with [`RepositoryError::Unavailable`].
    unavailable: AtomicBool,
}

impl InMemoryRepository {
    pub fn new() -> InMemoryRepository {
        InMemoryRepository::default()
    }

    /// Build a repository pre-populated from `snapshot`.
    pub fn from_snapshot(snapshot: RepositorySnapshot) -> InMemoryRepository {
        let repository = InMemoryRepository::new();
        {
            let mut state = repository.state.write().unwrap_or_else(|err| err.into_inner());
            for environment in snapshot.environments {
                state.environments.insert(environment.name.clone(), environment);
            }
            for flag in snapshot.flags {
                state.flags.insert(flag.key.clone(), flag);
            }
            for config in snapshot.configs {
                state
                    .configs
                    .insert((config.flag_id, config.environment_id), config);
            }
            for experiment in snapshot.experiments {
                state.experiments.insert(experiment.key.clone(), experiment);
            }
            for variant in snapshot.variants {
                state
                    .variants
                    .entry(variant.experiment_id)
                    .or_default()
                    .push(variant);
            }
            for segment in snapshot.segments {
                state.segments.insert(segment.key.clone(), segment);
            }
            for assignment in snapshot.assignments {
                let key = assignment_key(&assignment.user_id, assignment.environment_id, assignment.key());
                state.assignments.insert(key, assignment);
            }
        }
        repository
    }

    pub fn insert_environment(&self, environment: FeatureEnvironment) {
        self.write(|state| {
            state.environments.insert(environment.name.clone(), environment);
        });
    }

    /// Insert or replace a flag, keyed by `flag.key`.
    pub fn insert_flag(&self, flag: FeatureFlag) {
        self.write(|state| {
            state.flags.insert(flag.key.clone(), flag);
        });
    }

    /// Insert or replace the configuration of a flag in an environment.
    pub fn insert_config(&self, config: FeatureFlagConfig) {
        self.write(|state| {
            state
                .configs
                .insert((config.flag_id, config.environment_id), config);
        });
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        self.write(|state| {
            state.experiments.insert(experiment.key.clone(), experiment);
        });
    }

    /// Append a variant to its experiment. Variants keep the order they were inserted in.
    pub fn insert_variant(&self, variant: ExperimentVariant) {
        self.write(|state| {
            state
                .variants
                .entry(variant.experiment_id)
                .or_default()
                .push(variant);
        });
    }

    pub fn insert_segment(&self, segment: UserSegment) {
        self.write(|state| {
            state.segments.insert(segment.key.clone(), segment);
        });
    }

    /// Simulate an outage of the backing store.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// All sticky assignments persisted so far.
    pub fn assignments(&self) -> Vec<UserAssignment> {
        self.read(|state| Ok(state.assignments.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// All analytics events recorded so far, in insertion order.
    pub fn events(&self) -> Vec<FeatureEvent> {
        self.read(|state| Ok(state.events.clone()))
            .unwrap_or_default()
    }

    fn check_available(&self) -> RepositoryResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable(
                "in-memory repository marked unavailable".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> RepositoryResult<T>) -> RepositoryResult<T> {
        let state = self
            .state
            .read()
            .map_err(|_| RepositoryError::Unavailable("state lock poisoned".to_owned()))?;
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // A poisoned lock only means another thread panicked mid-write into plain maps; the data
        // is still usable.
        let mut state = self.state.write().unwrap_or_else(|err| err.into_inner());
        f(&mut state)
    }
}

fn assignment_key(user_id: &str, environment_id: Uuid, key: &str) -> (String, Uuid, String) {
    (user_id.to_owned(), environment_id, key.to_owned())
}

impl Repository for InMemoryRepository {
    fn get_feature_flag(&self, key: &str) -> RepositoryResult<FeatureFlag> {
        self.check_available()?;
        self.read(|state| state.flags.get(key).cloned().ok_or(RepositoryError::NotFound))
    }

    fn get_feature_flags(&self, archived: bool) -> RepositoryResult<Vec<FeatureFlag>> {
        self.check_available()?;
        self.read(|state| {
            let mut flags = state
                .flags
                .values()
                .filter(|flag| flag.archived == archived)
                .cloned()
                .collect::<Vec<_>>();
            flags.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(flags)
        })
    }

    fn get_environment(&self, name: &str) -> RepositoryResult<FeatureEnvironment> {
        self.check_available()?;
        self.read(|state| {
            state
                .environments
                .get(name)
                .cloned()
                .ok_or(RepositoryError::NotFound)
        })
    }

    fn get_feature_flag_config(
        &self,
        flag_id: Uuid,
        environment_id: Uuid,
    ) -> RepositoryResult<FeatureFlagConfig> {
        self.check_available()?;
        self.read(|state| {
            state
                .configs
                .get(&(flag_id, environment_id))
                .cloned()
                .ok_or(RepositoryError::NotFound)
        })
    }

    fn get_experiment(&self, key: &str) -> RepositoryResult<Experiment> {
        self.check_available()?;
        self.read(|state| {
            state
                .experiments
                .get(key)
                .cloned()
                .ok_or(RepositoryError::NotFound)
        })
    }

    fn get_experiment_variants(
        &self,
        experiment_id: Uuid,
    ) -> RepositoryResult<Vec<ExperimentVariant>> {
        self.check_available()?;
        self.read(|state| {
            Ok(state
                .variants
                .get(&experiment_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn get_user_segment(&self, key: &str) -> RepositoryResult<UserSegment> {
        self.check_available()?;
        self.read(|state| state.segments.get(key).cloned().ok_or(RepositoryError::NotFound))
    }

    fn get_user_assignment(
        &self,
        user_id: &str,
        environment_id: Uuid,
        key: &str,
    ) -> RepositoryResult<UserAssignment> {
        self.check_available()?;
        self.read(|state| {
            state
                .assignments
                .get(&assignment_key(user_id, environment_id, key))
                .cloned()
                .ok_or(RepositoryError::NotFound)
        })
    }

    fn create_user_assignment(&self, assignment: &UserAssignment) -> RepositoryResult<()> {
        self.check_available()?;
        let key = assignment_key(&assignment.user_id, assignment.environment_id, assignment.key());
        self.write(|state| match state.assignments.entry(key) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(assignment.clone());
                Ok(())
            }
        })
    }

    fn create_feature_event(&self, event: &FeatureEvent) -> RepositoryResult<()> {
        self.check_available()?;
        self.write(|state| state.events.push(event.clone()));
        Ok(())
    }
}
