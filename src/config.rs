use std::time::Duration;

/// Configuration for [`FeatureManager`](crate::FeatureManager).
///
/// ```
/// # use std::time::Duration;
/// # use flagwise::FeatureManagerConfig;
/// let config = FeatureManagerConfig::new()
///     .with_cache_ttl(Duration::from_secs(30))
///     .with_track_events(false);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureManagerConfig {
    /// How long evaluations stay cached.
    ///
    /// Defaults to [`FeatureManagerConfig::DEFAULT_CACHE_TTL`].
    pub cache_ttl: Duration,
    /// First segment of every cache key. Replicas sharing a cache must agree on it.
    ///
    /// Defaults to [`FeatureManagerConfig::DEFAULT_CACHE_PREFIX`].
    pub cache_prefix: String,
    /// Record an analytics event for every evaluation that is not served from cache.
    pub track_events: bool,
    /// Maximum number of threads used by a single batch evaluation.
    ///
    /// Defaults to [`FeatureManagerConfig::DEFAULT_BATCH_PARALLELISM`].
    pub batch_parallelism: usize,
    pub background: BackgroundWriterConfig,
}

impl FeatureManagerConfig {
    /// Default value for [`FeatureManagerConfig::cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`FeatureManagerConfig::cache_prefix`].
    pub const DEFAULT_CACHE_PREFIX: &'static str = "feature";
    /// Default value for [`FeatureManagerConfig::batch_parallelism`].
    pub const DEFAULT_BATCH_PARALLELISM: usize = 8;

    pub fn new() -> FeatureManagerConfig {
        FeatureManagerConfig::default()
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> FeatureManagerConfig {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_cache_prefix(mut self, cache_prefix: impl Into<String>) -> FeatureManagerConfig {
        self.cache_prefix = cache_prefix.into();
        self
    }

    pub fn with_track_events(mut self, track_events: bool) -> FeatureManagerConfig {
        self.track_events = track_events;
        self
    }

    /// Set the batch thread limit. Values below one are treated as one.
    pub fn with_batch_parallelism(mut self, batch_parallelism: usize) -> FeatureManagerConfig {
        self.batch_parallelism = batch_parallelism.max(1);
        self
    }

    pub fn with_background(mut self, background: BackgroundWriterConfig) -> FeatureManagerConfig {
        self.background = background;
        self
    }
}

impl Default for FeatureManagerConfig {
    fn default() -> FeatureManagerConfig {
        FeatureManagerConfig {
            cache_ttl: FeatureManagerConfig::DEFAULT_CACHE_TTL,
            cache_prefix: FeatureManagerConfig::DEFAULT_CACHE_PREFIX.to_owned(),
            track_events: true,
            batch_parallelism: FeatureManagerConfig::DEFAULT_BATCH_PARALLELISM,
            background: BackgroundWriterConfig::default(),
        }
    }
}

/// Configuration for the background writer that persists sticky records and analytics events.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundWriterConfig {
    /// Number of worker threads.
    ///
    /// Defaults to [`BackgroundWriterConfig::DEFAULT_WORKERS`].
    pub workers: usize,
    /// Number of tasks that may wait in the queue. Tasks submitted while the queue is full are
    /// dropped.
    ///
    /// Defaults to [`BackgroundWriterConfig::DEFAULT_QUEUE_CAPACITY`].
    pub queue_capacity: usize,
    /// How many times a write failing with a transient error is retried.
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// Random delay added to every retry, so that replicas recovering from the same outage do not
    /// retry in lockstep.
    pub retry_jitter: Duration,
    /// How long shutdown waits for queued tasks to drain.
    ///
    /// Defaults to [`BackgroundWriterConfig::DEFAULT_SHUTDOWN_TIMEOUT`].
    pub shutdown_timeout: Duration,
}

impl BackgroundWriterConfig {
    /// Default value for [`BackgroundWriterConfig::workers`].
    pub const DEFAULT_WORKERS: usize = 4;
    /// Default value for [`BackgroundWriterConfig::queue_capacity`].
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
    /// Default value for [`BackgroundWriterConfig::max_retries`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default value for [`BackgroundWriterConfig::retry_backoff`].
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);
    /// Default value for [`BackgroundWriterConfig::retry_jitter`].
    pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(25);
    /// Default value for [`BackgroundWriterConfig::shutdown_timeout`].
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> BackgroundWriterConfig {
        BackgroundWriterConfig::default()
    }

    /// Set the number of worker threads. Values below one are treated as one.
    pub fn with_workers(mut self, workers: usize) -> BackgroundWriterConfig {
        self.workers = workers.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> BackgroundWriterConfig {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> BackgroundWriterConfig {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> BackgroundWriterConfig {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_retry_jitter(mut self, retry_jitter: Duration) -> BackgroundWriterConfig {
        self.retry_jitter = retry_jitter;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> BackgroundWriterConfig {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

impl Default for BackgroundWriterConfig {
    fn default() -> BackgroundWriterConfig {
        BackgroundWriterConfig {
            workers: BackgroundWriterConfig::DEFAULT_WORKERS,
            queue_capacity: BackgroundWriterConfig::DEFAULT_QUEUE_CAPACITY,
            max_retries: BackgroundWriterConfig::DEFAULT_MAX_RETRIES,
            retry_backoff: BackgroundWriterConfig::DEFAULT_RETRY_BACKOFF,
            retry_jitter: BackgroundWriterConfig::DEFAULT_RETRY_JITTER,
            shutdown_timeout: BackgroundWriterConfig::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}
