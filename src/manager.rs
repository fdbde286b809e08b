use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::{
    background::BackgroundWriter,
    cache::Cache,
    eval::{Evaluated, ExperimentEvaluator, FeatureEvaluator},
    evaluation::{ExperimentEvaluation, ExperimentReason, FeatureEvaluation, FlagReason},
    hasher::{AssignmentHasher, Md5Hasher},
    models::{FeatureEvent, FeatureEventType, Timestamp, UserAssignment},
    repository::{Repository, RepositoryError},
    Error, EvaluationContext, Fallback, FeatureManagerConfig, Result,
};

const FLAG_KIND: &str = "flag";
const EXPERIMENT_KIND: &str = "experiment";
const ANONYMOUS: &str = "anonymous";

/// Evaluates flags and experiments with a read-through cache in front of the repository.
///
/// `FeatureManager` is `Send + Sync`; share one instance between request handlers, e.g. behind an
/// `Arc`. Sticky records and analytics events are written by background threads owned by the
/// manager. Call [`FeatureManager::shutdown`] before exiting to flush them.
pub struct FeatureManager {
    repository: Arc<dyn Repository>,
    cache: Arc<dyn Cache>,
    hasher: Arc<dyn AssignmentHasher + Send + Sync>,
    writer: BackgroundWriter,
    config: FeatureManagerConfig,
}

impl FeatureManager {
    /// Create a manager and start its background writer threads.
    pub fn new(
        repository: Arc<dyn Repository>,
        cache: Arc<dyn Cache>,
        config: FeatureManagerConfig,
    ) -> Result<FeatureManager> {
        let writer = BackgroundWriter::start(Arc::clone(&repository), config.background.clone())?;
        Ok(FeatureManager {
            repository,
            cache,
            hasher: Arc::new(Md5Hasher),
            writer,
            config,
        })
    }

    /// Replace the hasher used for bucketing.
    ///
    /// All replicas must use the same hasher, otherwise users flip between outcomes.
    pub fn with_hasher(mut self, hasher: impl AssignmentHasher + Send + Sync + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Evaluate the flag `key` for `context`.
    ///
    /// On error, the returned [`Fallback`] carries a disabled evaluation that should be served
    /// instead.
    pub fn evaluate_flag(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> std::result::Result<FeatureEvaluation, Fallback<FeatureEvaluation>> {
        let cache_key = self.cache_key(FLAG_KIND, key, context);
        if let Some(evaluation) = self.cached::<FeatureEvaluation>(&cache_key) {
            log::trace!(target: "flagwise", flag_key = key; "serving flag from cache");
            return Ok(evaluation);
        }

        let now = Utc::now();
        let Evaluated { evaluation, sticky } = self.evaluate_flag_uncached(key, context, now)?;

        if evaluation.reason.is_cacheable() {
            self.store(&cache_key, &evaluation, self.config.cache_ttl);
        }
        self.persist(sticky);
        self.track(FeatureEvent {
            id: Uuid::new_v4(),
            event_type: FeatureEventType::FlagEvaluation,
            key: key.to_owned(),
            user_id: context.user_id.clone(),
            environment: context.environment.clone(),
            enabled: Some(evaluation.enabled),
            variant: evaluation.variant.clone(),
            reason: evaluation.reason.as_str().to_owned(),
            properties: context.custom.clone(),
            created_at: now,
        });

        log::trace!(target: "flagwise",
                    flag_key = key,
                    enabled = evaluation.enabled,
                    reason:display = evaluation.reason;
                    "evaluated flag");
        Ok(evaluation)
    }

    fn evaluate_flag_uncached(
        &self,
        key: &str,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> std::result::Result<Evaluated<FeatureEvaluation>, Fallback<FeatureEvaluation>> {
        let disabled = |reason| FeatureEvaluation::disabled(key, reason, now);
        let fault = |err: RepositoryError| {
            log::warn!(target: "flagwise", flag_key = key; "repository failed: {err}");
            Fallback::new(
                Error::Repository(err),
                disabled(FlagReason::RepositoryError),
            )
        };

        let flag = match self.repository.get_feature_flag(key) {
            Ok(flag) => flag,
            Err(RepositoryError::NotFound) => {
                return Err(Fallback::new(
                    Error::FlagNotFound(key.to_owned()),
                    disabled(FlagReason::FlagNotFound),
                ))
            }
            Err(err) => return Err(fault(err)),
        };

        if flag.archived {
            return Ok(Evaluated::new(disabled(FlagReason::FlagArchived)));
        }

        let environment = match self.repository.get_environment(&context.environment) {
            Ok(environment) => environment,
            Err(RepositoryError::NotFound) => {
                return Err(Fallback::new(
                    Error::EnvironmentNotFound(context.environment.clone()),
                    disabled(FlagReason::EnvironmentNotFound),
                ))
            }
            Err(err) => return Err(fault(err)),
        };

        let config = match self
            .repository
            .get_feature_flag_config(flag.id, environment.id)
        {
            Ok(config) => config,
            Err(RepositoryError::NotFound) => {
                return Ok(Evaluated::new(disabled(FlagReason::NoConfig)))
            }
            Err(err) => return Err(fault(err)),
        };

        if !flag.enabled || !config.enabled {
            return Ok(Evaluated::new(disabled(FlagReason::FlagDisabled)));
        }

        let evaluator = FeatureEvaluator::new(&*self.repository, &*self.hasher);
        match evaluator.evaluate(&flag, &config, &environment, context, now) {
            Ok(evaluated) => {
                if evaluated.evaluation.reason == FlagReason::UnsupportedFlagType {
                    log::warn!(target: "flagwise",
                               flag_key = key,
                               flag_type:? = flag.flag_type;
                               "flag type cannot be evaluated as a feature flag");
                }
                Ok(evaluated)
            }
            Err(err) => {
                log::warn!(target: "flagwise",
                           flag_key = key,
                           environment:display = environment.name;
                           "failed to evaluate flag, serving disabled: {err}");
                Ok(Evaluated::new(disabled(FlagReason::EvaluationError)))
            }
        }
    }

    /// Assign `context` to a variant of the experiment `key`.
    pub fn evaluate_experiment(
        &self,
        key: &str,
        context: &EvaluationContext,
    ) -> std::result::Result<ExperimentEvaluation, Fallback<ExperimentEvaluation>> {
        let cache_key = self.cache_key(EXPERIMENT_KIND, key, context);
        if let Some(evaluation) = self.cached::<ExperimentEvaluation>(&cache_key) {
            log::trace!(target: "flagwise", experiment_key = key; "serving experiment from cache");
            return Ok(evaluation);
        }

        let now = Utc::now();
        let (Evaluated { evaluation, sticky }, ttl) =
            self.evaluate_experiment_uncached(key, context, now)?;

        if evaluation.reason.is_cacheable() {
            self.store(&cache_key, &evaluation, ttl);
        }
        self.persist(sticky);

        let mut properties = context.custom.clone();
        if let Some(variant_id) = evaluation.variant_id {
            properties.insert("variant_id".to_owned(), variant_id.to_string().into());
        }
        self.track(FeatureEvent {
            id: Uuid::new_v4(),
            event_type: FeatureEventType::ExperimentEvaluation,
            key: key.to_owned(),
            user_id: context.user_id.clone(),
            environment: context.environment.clone(),
            enabled: Some(evaluation.in_experiment),
            variant: evaluation.variant.clone(),
            reason: evaluation.reason.as_str().to_owned(),
            properties,
            created_at: now,
        });

        log::trace!(target: "flagwise",
                    experiment_key = key,
                    variant:? = evaluation.variant,
                    reason:display = evaluation.reason;
                    "evaluated experiment");
        Ok(evaluation)
    }

    /// Returns the evaluation and how long it may be cached.
    fn evaluate_experiment_uncached(
        &self,
        key: &str,
        context: &EvaluationContext,
        now: Timestamp,
    ) -> std::result::Result<(Evaluated<ExperimentEvaluation>, Duration), Fallback<ExperimentEvaluation>>
    {
        let excluded = |reason| ExperimentEvaluation::excluded(key, reason, now);
        let fault = |err: RepositoryError| {
            log::warn!(target: "flagwise", experiment_key = key; "repository failed: {err}");
            Fallback::new(
                Error::Repository(err),
                excluded(ExperimentReason::RepositoryError),
            )
        };

        let experiment = match self.repository.get_experiment(key) {
            Ok(experiment) => experiment,
            Err(RepositoryError::NotFound) => {
                return Err(Fallback::new(
                    Error::ExperimentNotFound(key.to_owned()),
                    excluded(ExperimentReason::NotFound),
                ))
            }
            Err(err) => return Err(fault(err)),
        };

        if let Some(reason) = ExperimentEvaluator::schedule_gate(&experiment, now) {
            let ttl = match (reason, experiment.start_date) {
                (ExperimentReason::ExperimentNotStarted, Some(start)) => {
                    ttl_until(start, now, self.config.cache_ttl)
                }
                _ => self.config.cache_ttl,
            };
            return Ok((Evaluated::new(excluded(reason)), ttl));
        }

        let environment = match self.repository.get_environment(&context.environment) {
            Ok(environment) => environment,
            Err(RepositoryError::NotFound) => {
                return Err(Fallback::new(
                    Error::EnvironmentNotFound(context.environment.clone()),
                    excluded(ExperimentReason::EnvironmentNotFound),
                ))
            }
            Err(err) => return Err(fault(err)),
        };

        let variants = self
            .repository
            .get_experiment_variants(experiment.id)
            .map_err(fault)?;

        let evaluator = ExperimentEvaluator::new(&*self.repository, &*self.hasher);
        let evaluated = evaluator.evaluate(&experiment, &variants, &environment, context, now);
        Ok((evaluated, self.config.cache_ttl))
    }

    /// Evaluate several flags at once.
    ///
    /// Keys are evaluated independently, in parallel. The returned map contains every requested
    /// key; keys that failed to evaluate map to their fail-closed evaluation.
    pub fn evaluate_flags<K: AsRef<str>>(
        &self,
        keys: &[K],
        context: &EvaluationContext,
    ) -> HashMap<String, FeatureEvaluation> {
        let mut seen = HashSet::new();
        let keys = keys
            .iter()
            .map(|key| key.as_ref())
            .filter(|key| seen.insert(*key))
            .collect::<Vec<&str>>();
        if keys.is_empty() {
            return HashMap::new();
        }

        let chunk_size = keys.len().div_ceil(self.config.batch_parallelism.max(1));
        if chunk_size >= keys.len() {
            return self.evaluate_chunk(&keys, context).into_iter().collect();
        }

        std::thread::scope(|scope| {
            let handles = keys
                .chunks(chunk_size)
                .map(|chunk| (chunk, scope.spawn(move || self.evaluate_chunk(chunk, context))))
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|(chunk, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        log::warn!(target: "flagwise", "batch evaluation thread panicked");
                        let now = Utc::now();
                        chunk
                            .iter()
                            .map(|key| {
                                let evaluation =
                                    FeatureEvaluation::disabled(key, FlagReason::EvaluationError, now);
                                (key.to_string(), evaluation)
                            })
                            .collect()
                    })
                })
                .collect()
        })
    }

    fn evaluate_chunk(
        &self,
        keys: &[&str],
        context: &EvaluationContext,
    ) -> Vec<(String, FeatureEvaluation)> {
        keys.iter()
            .map(|&key| {
                let evaluation = self.evaluate_flag(key, context).unwrap_or_else(|fallback| {
                    log::warn!(target: "flagwise",
                               flag_key = key;
                               "serving fallback in batch evaluation: {}", fallback.error);
                    fallback.into_evaluation()
                });
                (key.to_owned(), evaluation)
            })
            .collect()
    }

    /// Evaluate every non-archived flag for `context`.
    pub fn get_all_flags(
        &self,
        context: &EvaluationContext,
    ) -> Result<HashMap<String, FeatureEvaluation>> {
        let flags = self
            .repository
            .get_feature_flags(false)
            .map_err(Error::Repository)?;
        let keys = flags.into_iter().map(|flag| flag.key).collect::<Vec<_>>();
        Ok(self.evaluate_flags(&keys, context))
    }

    /// Delete every cached evaluation whose key contains any of `patterns`.
    ///
    /// Environment, key and user id segments are percent-encoded in cache keys, so patterns
    /// naming values that contain reserved characters must be encoded the same way.
    ///
    /// Returns the number of entries deleted. Cache failures are logged and skipped.
    pub fn invalidate_cache<P: AsRef<str>>(&self, patterns: &[P]) -> usize {
        patterns
            .iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                match self.cache.delete_pattern(pattern) {
                    Ok(deleted) => {
                        log::debug!(target: "flagwise",
                                    pattern,
                                    deleted;
                                    "invalidated cache entries");
                        deleted
                    }
                    Err(err) => {
                        log::warn!(target: "flagwise",
                                   pattern;
                                   "failed to invalidate cache entries: {err}");
                        0
                    }
                }
            })
            .sum()
    }

    /// Stop background writers, waiting for queued writes to finish.
    ///
    /// Evaluation keeps working after shutdown, but sticky records and events are no longer
    /// written.
    pub fn shutdown(&self) -> Result<()> {
        self.writer.shutdown()
    }

    /// Segments are percent-encoded so a `:` inside a key or user id cannot shift them.
    fn cache_key(&self, kind: &str, key: &str, context: &EvaluationContext) -> String {
        let environment = urlencoding::encode(&context.environment);
        let key = urlencoding::encode(key);
        let user = context
            .user_id
            .as_deref()
            .map_or(ANONYMOUS.into(), urlencoding::encode);
        format!("{}:{kind}:{environment}:{key}:{user}", self.config.cache_prefix)
    }

    fn cached<T: DeserializeOwned>(&self, cache_key: &str) -> Option<T> {
        let bytes = match self.cache.get(cache_key) {
            Ok(bytes) => bytes?,
            Err(err) => {
                log::warn!(target: "flagwise", cache_key; "cache read failed: {err}");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!(target: "flagwise", cache_key; "ignoring undecodable cache entry: {err}");
                None
            }
        }
    }

    fn store<T: Serialize>(&self, cache_key: &str, value: &T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let result = serde_json::to_vec(value)
            .map_err(|err| err.to_string())
            .and_then(|bytes| {
                self.cache
                    .set(cache_key, bytes, ttl)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            log::warn!(target: "flagwise", cache_key; "cache write failed: {err}");
        }
    }

    fn persist(&self, sticky: Option<UserAssignment>) {
        if let Some(assignment) = sticky {
            if let Err(err) = self.writer.submit(assignment) {
                log::debug!(target: "flagwise", "sticky record not queued: {err}");
            }
        }
    }

    fn track(&self, event: FeatureEvent) {
        if !self.config.track_events {
            return;
        }
        if let Err(err) = self.writer.submit(event) {
            log::debug!(target: "flagwise", "analytics event not queued: {err}");
        }
    }
}

/// Time left until `start`, capped at `ttl`.
fn ttl_until(start: Timestamp, now: Timestamp, ttl: Duration) -> Duration {
    (start - now)
        .to_std()
        .map_or(Duration::ZERO, |remaining| remaining.min(ttl))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::{Duration as TimeDelta, TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::{ttl_until, FeatureManager};
    use crate::{
        cache::{Cache, CacheError, CacheResult, InMemoryCache},
        evaluation::{ExperimentReason, FlagReason},
        models::{
            AssignmentTarget, Experiment, ExperimentStatus, ExperimentVariant,
            FeatureEnvironment, FeatureEventType, FeatureFlag, FeatureFlagConfig, FlagType,
            TryParse,
        },
        repository::{InMemoryRepository, Repository, RepositoryError},
        Error, EvaluationContext, FeatureManagerConfig,
    };

    /// Fails every call.
    struct BrokenCache;

    impl Cache for BrokenCache {
        fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
            Err(CacheError::Poisoned)
        }
        fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Poisoned)
        }
        fn delete(&self, _key: &str) -> CacheResult<()> {
            Err(CacheError::Poisoned)
        }
        fn delete_pattern(&self, _pattern: &str) -> CacheResult<usize> {
            Err(CacheError::Poisoned)
        }
        fn exists(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Poisoned)
        }
    }

    struct Fixture {
        repository: Arc<InMemoryRepository>,
        cache: Arc<InMemoryCache>,
        manager: FeatureManager,
        environment: FeatureEnvironment,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture::with_config(FeatureManagerConfig::default())
        }

        fn with_config(config: FeatureManagerConfig) -> Fixture {
            let repository = Arc::new(InMemoryRepository::new());
            let cache = Arc::new(InMemoryCache::new());
            let environment = FeatureEnvironment {
                id: Uuid::new_v4(),
                name: "production".to_owned(),
            };
            repository.insert_environment(environment.clone());
            let manager = FeatureManager::new(repository.clone(), cache.clone(), config).unwrap();
            Fixture {
                repository,
                cache,
                manager,
                environment,
            }
        }

        fn add_flag(&self, key: &str, flag_type: FlagType, rollout: Option<f64>) -> FeatureFlag {
            let flag = FeatureFlag {
                id: Uuid::new_v4(),
                key: key.to_owned(),
                flag_type,
                enabled: true,
                archived: false,
                description: None,
            };
            self.repository.insert_flag(flag.clone());
            self.repository.insert_config(FeatureFlagConfig {
                flag_id: flag.id,
                environment_id: self.environment.id,
                enabled: true,
                rollout_percentage: rollout,
                targeting_rules: None,
                variants: Vec::new(),
            });
            flag
        }

        fn add_experiment(&self, key: &str, experiment: impl FnOnce(&mut Experiment)) {
            let mut value = Experiment {
                id: Uuid::new_v4(),
                key: key.to_owned(),
                status: ExperimentStatus::Running,
                start_date: None,
                end_date: None,
                traffic_allocation: 100.0,
            };
            experiment(&mut value);
            for (name, weight) in [("control", 1), ("treatment", 1)] {
                self.repository.insert_variant(ExperimentVariant {
                    id: Uuid::new_v4(),
                    experiment_id: value.id,
                    key: name.to_owned(),
                    weight,
                    is_control: name == "control",
                    payload: None,
                });
            }
            self.repository.insert_experiment(value);
        }
    }

    fn alice() -> EvaluationContext {
        EvaluationContext::new("production").with_user_id("alice")
    }

    #[test]
    fn boolean_flag_is_cached() {
        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);

        let first = fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        assert!(first.enabled);
        assert_eq!(first.value, Some(json!(true)));
        assert_eq!(first.reason, FlagReason::Default);
        assert!(fixture
            .cache
            .exists("feature:flag:production:dark_mode:alice")
            .unwrap());

        // A cache hit never reaches the repository.
        fixture.repository.set_unavailable(true);
        let second = fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn anonymous_cache_key() {
        let fixture = Fixture::with_config(FeatureManagerConfig::new().with_cache_prefix("ff"));
        fixture.add_flag("dark_mode", FlagType::Boolean, None);

        fixture
            .manager
            .evaluate_flag("dark_mode", &EvaluationContext::new("production"))
            .unwrap();
        assert!(fixture
            .cache
            .exists("ff:flag:production:dark_mode:anonymous")
            .unwrap());
    }

    #[test]
    fn cache_key_segments_cannot_collide() {
        let fixture = Fixture::new();
        fixture.add_flag("a:b", FlagType::Boolean, None);
        let flag = fixture.add_flag("a", FlagType::Boolean, None);
        let config = fixture
            .repository
            .get_feature_flag_config(flag.id, fixture.environment.id)
            .unwrap();
        fixture.repository.insert_config(FeatureFlagConfig {
            enabled: false,
            ..config
        });

        let c = EvaluationContext::new("production").with_user_id("c");
        let b_c = EvaluationContext::new("production").with_user_id("b:c");
        assert!(fixture.manager.evaluate_flag("a:b", &c).unwrap().enabled);
        assert!(!fixture.manager.evaluate_flag("a", &b_c).unwrap().enabled);

        assert!(fixture.cache.exists("feature:flag:production:a%3Ab:c").unwrap());
        assert!(fixture.cache.exists("feature:flag:production:a:b%3Ac").unwrap());
        assert!(fixture.manager.evaluate_flag("a:b", &c).unwrap().enabled);
    }

    #[test]
    fn expired_evaluations_are_reclaimed() {
        let fixture = Fixture::with_config(
            FeatureManagerConfig::new()
                .with_cache_ttl(Duration::from_millis(1))
                .with_track_events(false),
        );
        fixture.add_flag("dark_mode", FlagType::Boolean, None);

        for round in 0..3 {
            for i in 0..500 {
                let context = EvaluationContext::new("production")
                    .with_user_id(format!("user-{round}-{i}"));
                fixture.manager.evaluate_flag("dark_mode", &context).unwrap();
            }
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(fixture.cache.len(), 0, "round {round}");
        }
    }

    #[test]
    fn huge_cache_ttl_is_served_from_cache() {
        let fixture =
            Fixture::with_config(FeatureManagerConfig::new().with_cache_ttl(Duration::MAX));
        fixture.add_flag("dark_mode", FlagType::Boolean, None);

        let first = fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        fixture.repository.set_unavailable(true);
        let second = fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_flag_returns_fallback() {
        let fixture = Fixture::new();

        let fallback = fixture.manager.evaluate_flag("nope", &alice()).unwrap_err();
        assert!(matches!(fallback.error, Error::FlagNotFound(ref key) if key == "nope"));
        assert!(!fallback.evaluation.enabled);
        assert_eq!(fallback.evaluation.reason, FlagReason::FlagNotFound);
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn missing_environment_returns_fallback() {
        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);

        let fallback = fixture
            .manager
            .evaluate_flag("dark_mode", &EvaluationContext::new("staging"))
            .unwrap_err();
        assert!(matches!(fallback.error, Error::EnvironmentNotFound(_)));
        assert_eq!(fallback.evaluation.reason, FlagReason::EnvironmentNotFound);
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn repository_outage_fails_closed() {
        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);
        fixture.repository.set_unavailable(true);

        let fallback = fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap_err();
        assert!(matches!(
            fallback.error,
            Error::Repository(RepositoryError::Unavailable(_))
        ));
        assert!(!fallback.evaluation.enabled);
        assert_eq!(fallback.evaluation.reason, FlagReason::RepositoryError);
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn configuration_states() {
        let fixture = Fixture::new();

        let archived = FeatureFlag {
            archived: true,
            ..fixture.add_flag("old", FlagType::Boolean, None)
        };
        fixture.repository.insert_flag(archived);
        fixture.repository.insert_flag(FeatureFlag {
            id: Uuid::new_v4(),
            key: "unconfigured".to_owned(),
            flag_type: FlagType::Boolean,
            enabled: true,
            archived: false,
            description: None,
        });
        let off = fixture.add_flag("off", FlagType::Boolean, None);
        fixture.repository.insert_config(FeatureFlagConfig {
            flag_id: off.id,
            environment_id: fixture.environment.id,
            enabled: false,
            rollout_percentage: None,
            targeting_rules: None,
            variants: Vec::new(),
        });

        for (key, reason) in [
            ("old", FlagReason::FlagArchived),
            ("unconfigured", FlagReason::NoConfig),
            ("off", FlagReason::FlagDisabled),
        ] {
            let evaluation = fixture.manager.evaluate_flag(key, &alice()).unwrap();
            assert!(!evaluation.enabled, "{key}");
            assert_eq!(evaluation.reason, reason, "{key}");
        }
        // All three are regular outcomes and get cached.
        assert_eq!(fixture.cache.len(), 3);
    }

    #[test]
    fn evaluation_errors_are_not_cached() {
        let fixture = Fixture::new();
        let flag = fixture.add_flag("broken", FlagType::Boolean, None);
        fixture.repository.insert_config(FeatureFlagConfig {
            flag_id: flag.id,
            environment_id: fixture.environment.id,
            enabled: true,
            rollout_percentage: None,
            targeting_rules: Some(TryParse::ParseFailed(json!(42))),
            variants: Vec::new(),
        });
        fixture.add_flag("legacy", FlagType::Experiment, None);

        let broken = fixture.manager.evaluate_flag("broken", &alice()).unwrap();
        assert_eq!(broken.reason, FlagReason::EvaluationError);
        let legacy = fixture.manager.evaluate_flag("legacy", &alice()).unwrap();
        assert_eq!(legacy.reason, FlagReason::UnsupportedFlagType);
        assert!(fixture.cache.is_empty());
    }

    #[test]
    fn cache_faults_degrade_to_miss() {
        let repository = Arc::new(InMemoryRepository::new());
        let environment = FeatureEnvironment {
            id: Uuid::new_v4(),
            name: "production".to_owned(),
        };
        repository.insert_environment(environment.clone());
        let flag = FeatureFlag {
            id: Uuid::new_v4(),
            key: "dark_mode".to_owned(),
            flag_type: FlagType::Boolean,
            enabled: true,
            archived: false,
            description: None,
        };
        repository.insert_flag(flag.clone());
        repository.insert_config(FeatureFlagConfig {
            flag_id: flag.id,
            environment_id: environment.id,
            enabled: true,
            rollout_percentage: None,
            targeting_rules: None,
            variants: Vec::new(),
        });
        let manager =
            FeatureManager::new(repository, Arc::new(BrokenCache), FeatureManagerConfig::new())
                .unwrap();

        let evaluation = manager.evaluate_flag("dark_mode", &alice()).unwrap();
        assert!(evaluation.enabled);
        assert_eq!(manager.invalidate_cache(&["dark_mode"]), 0);
    }

    #[test]
    fn percentage_flag_persists_sticky_record_and_event() {
        let fixture = Fixture::new();
        let flag = fixture.add_flag("beta", FlagType::Percentage, Some(100.0));

        let evaluation = fixture.manager.evaluate_flag("beta", &alice()).unwrap();
        assert_eq!(evaluation.reason, FlagReason::RolloutIncluded);
        fixture.manager.shutdown().unwrap();

        let assignments = fixture.repository.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(
            assignments[0].target,
            AssignmentTarget::Flag {
                flag_id: flag.id,
                flag_key: "beta".to_owned(),
                enabled: true,
            }
        );

        let events = fixture.repository.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, FeatureEventType::FlagEvaluation);
        assert_eq!(events[0].reason, "rollout_included");
        assert_eq!(events[0].user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn cache_hits_and_disabled_tracking_record_no_events() {
        let fixture = Fixture::with_config(FeatureManagerConfig::new().with_track_events(false));
        fixture.add_flag("dark_mode", FlagType::Boolean, None);
        fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        fixture.manager.shutdown().unwrap();
        assert!(fixture.repository.events().is_empty());

        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);
        fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        fixture.manager.evaluate_flag("dark_mode", &alice()).unwrap();
        fixture.manager.shutdown().unwrap();
        assert_eq!(fixture.repository.events().len(), 1);
    }

    #[test]
    fn batch_contains_every_key() {
        let fixture = Fixture::with_config(FeatureManagerConfig::new().with_batch_parallelism(3));
        let mut keys = Vec::new();
        for i in 0..10 {
            let key = format!("flag-{i}");
            fixture.add_flag(&key, FlagType::Boolean, None);
            keys.push(key);
        }
        keys.push("missing".to_owned());
        keys.push("flag-0".to_owned());

        let results = fixture.manager.evaluate_flags(&keys, &alice());
        assert_eq!(results.len(), 11);
        assert!(results["flag-7"].enabled);
        assert_eq!(results["missing"].reason, FlagReason::FlagNotFound);
        assert!(!results["missing"].enabled);
    }

    #[test]
    fn get_all_flags_skips_archived() {
        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);
        let archived = FeatureFlag {
            archived: true,
            ..fixture.add_flag("old", FlagType::Boolean, None)
        };
        fixture.repository.insert_flag(archived);

        let flags = fixture.manager.get_all_flags(&alice()).unwrap();
        assert_eq!(flags.len(), 1);
        assert!(flags.contains_key("dark_mode"));

        fixture.repository.set_unavailable(true);
        assert!(matches!(
            fixture.manager.get_all_flags(&alice()),
            Err(Error::Repository(_))
        ));
    }

    #[test]
    fn invalidation_by_substring() {
        let fixture = Fixture::new();
        fixture.add_flag("dark_mode", FlagType::Boolean, None);
        fixture.add_flag("beta", FlagType::Percentage, Some(50.0));
        let bob = EvaluationContext::new("production").with_user_id("bob");
        for context in [alice(), bob] {
            fixture.manager.evaluate_flag("dark_mode", &context).unwrap();
            fixture.manager.evaluate_flag("beta", &context).unwrap();
        }
        assert_eq!(fixture.cache.len(), 4);

        assert_eq!(fixture.manager.invalidate_cache(&[":beta:"]), 2);
        assert_eq!(fixture.manager.invalidate_cache(&[":alice"]), 1);
        assert_eq!(fixture.cache.len(), 1);
    }

    #[test]
    fn experiment_assignment() {
        let fixture = Fixture::new();
        fixture.add_experiment("checkout-test", |_| {});

        let evaluation = fixture
            .manager
            .evaluate_experiment("checkout-test", &alice())
            .unwrap();
        assert!(evaluation.in_experiment);
        assert_eq!(evaluation.reason, ExperimentReason::VariantAssignment);
        assert!(fixture
            .cache
            .exists("feature:experiment:production:checkout-test:alice")
            .unwrap());
        fixture.manager.shutdown().unwrap();

        assert_eq!(fixture.repository.assignments().len(), 1);
        let events = fixture.repository.events();
        assert_eq!(events[0].event_type, FeatureEventType::ExperimentEvaluation);
        assert_eq!(
            events[0].properties.get("variant_id"),
            evaluation.variant_id.map(|id| json!(id.to_string())).as_ref()
        );
    }

    #[test]
    fn experiment_states() {
        let fixture = Fixture::new();
        fixture.add_experiment("paused", |e| e.status = ExperimentStatus::Paused);
        fixture.add_experiment("future", |e| {
            e.start_date = Some(Utc::now() + TimeDelta::days(1))
        });
        fixture.add_experiment("over", |e| e.end_date = Some(Utc::now() - TimeDelta::days(1)));

        for (key, reason) in [
            ("paused", ExperimentReason::ExperimentNotRunning),
            ("future", ExperimentReason::ExperimentNotStarted),
            ("over", ExperimentReason::ExperimentEnded),
        ] {
            let evaluation = fixture.manager.evaluate_experiment(key, &alice()).unwrap();
            assert!(!evaluation.in_experiment, "{key}");
            assert_eq!(evaluation.reason, reason, "{key}");
        }

        let fallback = fixture
            .manager
            .evaluate_experiment("nope", &alice())
            .unwrap_err();
        assert!(matches!(fallback.error, Error::ExperimentNotFound(_)));
        assert_eq!(fallback.evaluation.reason, ExperimentReason::NotFound);
    }

    #[test]
    fn not_started_ttl_is_capped_by_start_date() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ttl = Duration::from_secs(300);

        assert_eq!(ttl_until(now + TimeDelta::seconds(60), now, ttl), Duration::from_secs(60));
        assert_eq!(ttl_until(now + TimeDelta::hours(1), now, ttl), ttl);
        assert_eq!(ttl_until(now - TimeDelta::seconds(1), now, ttl), Duration::ZERO);
    }
}
