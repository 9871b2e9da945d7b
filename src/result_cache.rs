//! Short-lived memoization of evaluation results.
//!
//! The cache is never a source of truth. Clearing it only affects latency, never outcomes.
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{context::EntityContext, eval::EvaluationResult, model::FlagId};

/// Everything an evaluation outcome depends on, apart from the snapshot revision.
///
/// The flag is identified by the id it resolved to, so a request that names a flag by key and
/// one that names it by id share an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultCacheKey {
    pub flag_id: FlagId,
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub context: BTreeMap<String, String>,
}

impl ResultCacheKey {
    pub fn new(flag_id: FlagId, entity: &EntityContext) -> Self {
        ResultCacheKey {
            flag_id,
            entity_id: entity.entity_id.clone(),
            entity_type: entity.entity_type.clone(),
            context: entity
                .context
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<ResultCacheKey, (EvaluationResult, Instant)>,
    puts_since_sweep: usize,
}

/// Thread-safe `key → (result, timestamp)` store with a fixed ttl.
///
/// Expired entries are dropped when read and swept every [`ResultCache::SWEEP_EVERY`] writes, so
/// keys that are never read again do not accumulate.
pub struct ResultCache {
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl ResultCache {
    /// Default value for the ttl.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Number of writes between sweeps of expired entries.
    pub const SWEEP_EVERY: usize = 256;

    pub fn new(ttl: Duration) -> ResultCache {
        ResultCache {
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached result for `key`. Expired entries are evicted and reported as a miss.
    pub fn get(&self, key: &ResultCacheKey) -> Option<EvaluationResult> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &ResultCacheKey, now: Instant) -> Option<EvaluationResult> {
        let mut entries = self.lock();
        let (result, stored_at) = entries.map.get(key)?;
        if now.saturating_duration_since(*stored_at) > self.ttl {
            entries.map.remove(key);
            return None;
        }
        Some(result.clone())
    }

    /// Store `result`, overwriting any previous entry for `key`.
    pub fn put(&self, key: ResultCacheKey, result: EvaluationResult) {
        self.put_at(key, result, Instant::now());
    }

    fn put_at(&self, key: ResultCacheKey, result: EvaluationResult, now: Instant) {
        let mut entries = self.lock();
        entries.map.insert(key, (result, now));
        entries.puts_since_sweep += 1;
        if entries.puts_since_sweep >= Self::SWEEP_EVERY {
            log::trace!(target: "flagent", len = entries.map.len(); "sweeping result cache");
            self.sweep(&mut entries, now);
        }
    }

    /// Sweep all expired entries once.
    pub fn evict_expired(&self) {
        self.evict_expired_at(Instant::now());
    }

    fn evict_expired_at(&self, now: Instant) {
        self.sweep(&mut self.lock(), now);
    }

    fn sweep(&self, entries: &mut Entries, now: Instant) {
        let ttl = self.ttl;
        entries
            .map
            .retain(|_, (_, stored_at)| now.saturating_duration_since(*stored_at) <= ttl);
        entries.puts_since_sweep = 0;
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.map.clear();
        entries.puts_since_sweep = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .expect("thread holding result cache lock should not panic")
    }
}

impl Default for ResultCache {
    fn default() -> ResultCache {
        ResultCache::new(ResultCache::DEFAULT_TTL)
    }
}
