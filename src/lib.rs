//! Feature flag evaluation with consistent-hash rollout and an offline-first snapshot cache.
//!
//! # Overview
//!
//! Flags are organized into segments. Each segment carries constraints matched against an
//! entity's context, a rollout percentage, and a distribution of traffic across variants.
//! Evaluation walks segments in rank order and assigns the entity to a variant of the first
//! segment whose constraints match, bucketing the entity id with CRC32 so the same entity always
//! lands in the same variant.
//!
//! Flags are read from an immutable [`FlagSnapshot`]. A [`SnapshotCache`] fetches snapshots from a
//! source, persists them for cold starts, serves the last good copy when the source is down, and
//! optionally refreshes on a timer or on realtime change notifications.
//!
//! [`Evaluator`] is the entry point for evaluation. It reads from a [`SnapshotCache`] and can
//! memoize results in a [`ResultCache`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Evaluation itself never fails on bad input: an unmatched entity yields a result with no
//! variant. Errors are reserved for lookups (unknown flag, cache not ready) and for fetching or
//! persisting snapshots.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with structured key-values
//! under the `flagent` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into cache refreshes and evaluation misses.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod evaluator;
pub mod model;
pub mod persistence;
pub mod poller_thread;
pub mod realtime;
pub mod result_cache;
pub mod rules;
pub mod sharder;
pub mod snapshot;
pub mod snapshot_cache;
pub mod snapshot_fetcher;
pub mod snapshot_store;

pub use config::{RealtimeConfig, SnapshotCacheConfig, SourceConfig};
pub use context::{ContextAttributes, ContextValue, EntityContext};
pub use error::{Error, Result};
pub use eval::{evaluate_flag, EvaluationReason, EvaluationResult};
pub use evaluator::{EvaluationRequest, Evaluator, EvaluatorConfig};
pub use model::{Constraint, Distribution, Flag, Segment, Variant};
pub use result_cache::ResultCache;
pub use rules::Operator;
pub use snapshot::{FlagSnapshot, SnapshotDocument, TagOperator};
pub use snapshot_cache::{CacheState, SnapshotCache};
pub use snapshot_fetcher::SnapshotFetcher;
