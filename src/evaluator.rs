use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    context::EntityContext,
    eval::EvaluationResult,
    model::FlagId,
    result_cache::{ResultCache, ResultCacheKey},
    snapshot::{FlagSnapshot, TagOperator},
    snapshot_cache::{evaluate_resolved, resolve_flag, SnapshotCache},
    Error, Result,
};

pub struct EvaluatorConfig {
    pub cache: Arc<SnapshotCache>,
    /// Optional memoization of results. Bypassed for debug evaluations.
    pub result_cache: Option<ResultCache>,
}

/// A single evaluation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    #[serde(rename = "flagID", default)]
    pub flag_id: Option<FlagId>,
    #[serde(default)]
    pub flag_key: Option<String>,
    #[serde(flatten)]
    pub entity: EntityContext,
    #[serde(default)]
    pub enable_debug: bool,
}

impl EvaluationRequest {
    pub fn by_key(flag_key: impl Into<String>, entity: EntityContext) -> EvaluationRequest {
        EvaluationRequest {
            flag_key: Some(flag_key.into()),
            entity,
            ..Default::default()
        }
    }

    pub fn by_id(flag_id: FlagId, entity: EntityContext) -> EvaluationRequest {
        EvaluationRequest {
            flag_id: Some(flag_id),
            entity,
            ..Default::default()
        }
    }

    pub fn with_debug(mut self, enable_debug: bool) -> EvaluationRequest {
        self.enable_debug = enable_debug;
        self
    }
}

/// Evaluator is the entry point for evaluation. It reads snapshots from a [`SnapshotCache`] and
/// optionally memoizes results.
pub struct Evaluator {
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig) -> Evaluator {
        Evaluator { config }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.config.cache
    }

    /// Evaluate a single flag for a single entity.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the snapshot cache is not bootstrapped.
    /// - [`Error::FlagNotFound`] if the request's flag id or key does not resolve.
    pub fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let snapshot = self.config.cache.snapshot()?;
        self.evaluate_cached(
            &snapshot,
            request.flag_id,
            request.flag_key.as_deref(),
            &request.entity,
            request.enable_debug,
        )
    }

    /// Evaluate every combination of `entities` and flags against one snapshot.
    ///
    /// Flags that don't resolve are skipped.
    pub fn evaluate_batch(
        &self,
        entities: &[EntityContext],
        flag_keys: &[String],
        flag_ids: &[FlagId],
        debug: bool,
    ) -> Result<Vec<EvaluationResult>> {
        let snapshot = self.config.cache.snapshot()?;

        let flags: Vec<(Option<FlagId>, Option<&str>)> = flag_ids
            .iter()
            .map(|id| (Some(*id), None))
            .chain(flag_keys.iter().map(|key| (None, Some(key.as_str()))))
            .collect();

        let mut results = Vec::with_capacity(entities.len() * flags.len());
        for entity in entities {
            for (flag_id, flag_key) in &flags {
                match self.evaluate_cached(&snapshot, *flag_id, *flag_key, entity, debug) {
                    Ok(result) => results.push(result),
                    Err(Error::FlagNotFound) => {
                        // Already logged. Skip the combination.
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(results)
    }

    /// Evaluate every flag carrying the requested tags for `entity`.
    pub fn evaluate_by_tags<T: AsRef<str>>(
        &self,
        entity: &EntityContext,
        tags: &[T],
        operator: TagOperator,
        debug: bool,
    ) -> Result<Vec<EvaluationResult>> {
        let snapshot = self.config.cache.snapshot()?;
        snapshot
            .flags_by_tags(tags, operator)
            .into_iter()
            .map(|flag| self.evaluate_cached(&snapshot, Some(flag.id), None, entity, debug))
            .collect()
    }

    /// Drop all memoized results.
    pub fn clear_result_cache(&self) {
        if let Some(result_cache) = &self.config.result_cache {
            result_cache.clear();
        }
    }

    fn evaluate_cached(
        &self,
        snapshot: &FlagSnapshot,
        flag_id: Option<FlagId>,
        flag_key: Option<&str>,
        entity: &EntityContext,
        debug: bool,
    ) -> Result<EvaluationResult> {
        let flag = resolve_flag(snapshot, flag_id, flag_key)?;

        let result_cache = match &self.config.result_cache {
            Some(result_cache) if !debug => result_cache,
            _ => return Ok(evaluate_resolved(snapshot, flag, entity, debug)),
        };

        let key = ResultCacheKey::new(flag.id, entity);
        // Results from an older snapshot are misses.
        if let Some(cached) = result_cache
            .get(&key)
            .filter(|cached| cached.revision == snapshot.revision())
        {
            return Ok(cached);
        }

        let result = evaluate_resolved(snapshot, flag, entity, debug);
        result_cache.put(key, result.clone());
        Ok(result)
    }
}
