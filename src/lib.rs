//! `flagwise` is a feature-flag and experiment evaluation engine.
//!
//! # Overview
//!
//! The engine revolves around a [`FeatureManager`] that decides, for an [`EvaluationContext`],
//! whether a feature flag is enabled and which experiment variant a user sees. Decisions are
//! derived from a deterministic hash of the user, so any number of stateless replicas reach the
//! same answer without coordination.
//!
//! Flag definitions are read through the [`Repository`](repository::Repository) port and results
//! are memoized in a [`Cache`](cache::Cache). In-memory implementations of both ship with the
//! crate; a Redis cache is available behind the `redis` feature.
//!
//! Percentage rollouts and experiment assignments are pinned with sticky records, which are
//! written to the repository by background threads together with analytics events.
//!
//! # Error Handling
//!
//! Evaluation never fails without an answer. When a flag or experiment cannot be found or the
//! repository is unavailable, a [`Fallback`] is returned carrying both the [`Error`] and a
//! fail-closed evaluation to serve instead. Misconfigured flag data is logged and evaluates as
//! disabled.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! under the `flagwise` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into evaluation.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use flagwise::{
//! #     cache::InMemoryCache, repository::{InMemoryRepository, RepositorySnapshot},
//! #     EvaluationContext, FeatureManager, FeatureManagerConfig,
//! # };
//! let snapshot: RepositorySnapshot = serde_json::from_str(r#"{
//!     "environments": [{"id": "0b6d1c8e-2f1a-4f58-9d3c-3e2f7c1b9a11", "name": "production"}],
//!     "flags": [{
//!         "id": "6f1c1f2e-4a2b-4c55-9c8e-8d8c4b7a1f00",
//!         "key": "dark_mode",
//!         "type": "boolean",
//!         "enabled": true
//!     }],
//!     "configs": [{
//!         "flag_id": "6f1c1f2e-4a2b-4c55-9c8e-8d8c4b7a1f00",
//!         "environment_id": "0b6d1c8e-2f1a-4f58-9d3c-3e2f7c1b9a11",
//!         "enabled": true
//!     }]
//! }"#)?;
//!
//! let manager = FeatureManager::new(
//!     Arc::new(InMemoryRepository::from_snapshot(snapshot)),
//!     Arc::new(InMemoryCache::new()),
//!     FeatureManagerConfig::default(),
//! )?;
//!
//! let context = EvaluationContext::new("production").with_user_id("user-42");
//! let dark_mode = manager
//!     .evaluate_flag("dark_mode", &context)
//!     .unwrap_or_else(|fallback| fallback.into_evaluation());
//! assert!(dark_mode.enabled);
//!
//! manager.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod background;
pub mod cache;
mod config;
mod context;
mod error;
pub mod eval;
mod evaluation;
pub mod hasher;
mod manager;
pub mod models;
pub mod repository;
pub mod segment;

pub use config::{BackgroundWriterConfig, FeatureManagerConfig};
pub use context::{Attributes, EvaluationContext};
pub use error::{Error, EvaluationError, Fallback, Result};
pub use evaluation::{ExperimentEvaluation, ExperimentReason, FeatureEvaluation, FlagReason};
pub use hasher::{AssignmentHasher, Md5Hasher};
pub use manager::FeatureManager;
pub use models::UserSegment;
