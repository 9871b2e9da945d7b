//! Owns the live snapshot and keeps it fresh.
//!
//! [`SnapshotCache`] moves through `Uninitialized → Bootstrapping → Ready ⇄ Refreshing`. Once
//! `Ready`, failed refreshes never tear the cache down: the previous snapshot keeps being served
//! and the error is returned to whoever asked for the refresh.
use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    config::{RealtimeConfig, SnapshotCacheConfig},
    context::EntityContext,
    eval::{evaluate_flag, EvaluationResult},
    model::{Flag, FlagId},
    persistence::SnapshotPersistence,
    poller_thread::PollerThread,
    realtime::{RealtimeInvalidator, RealtimeStatus},
    snapshot::FlagSnapshot,
    snapshot_fetcher::SnapshotFetcher,
    snapshot_store::SnapshotStore,
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Never bootstrapped, or cleared.
    Uninitialized,
    /// First snapshot is being loaded.
    Bootstrapping,
    /// A snapshot is being served.
    Ready,
    /// A snapshot is being served while a newer one is fetched.
    Refreshing,
}

pub struct SnapshotCache {
    this: Weak<SnapshotCache>,
    config: SnapshotCacheConfig,
    fetcher: Box<dyn SnapshotFetcher>,
    persistence: Box<dyn SnapshotPersistence>,
    store: SnapshotStore,
    state: Mutex<CacheState>,
    /// Held for the duration of every fetch. Stores the outcome of the last refresh so that
    /// callers that waited for it can reuse it.
    fetch_lock: Mutex<Option<Result<()>>>,
    /// Incremented (under `fetch_lock`) every time a refresh completes.
    refresh_generation: AtomicU64,
    stale_refresh_in_flight: AtomicBool,
    /// Background refresh of an expired snapshot. Joined on shutdown.
    stale_refresh: Mutex<Option<JoinHandle<()>>>,
    is_shut_down: AtomicBool,
    poller: Mutex<Option<PollerThread>>,
    realtime: Mutex<Option<RealtimeInvalidator>>,
}

impl SnapshotCache {
    /// Create a cache fetching through `fetcher`. Persistence follows
    /// [`SnapshotCacheConfig::persistence_path`].
    pub fn new(fetcher: Box<dyn SnapshotFetcher>, config: SnapshotCacheConfig) -> Arc<SnapshotCache> {
        let persistence = config.persistence();
        SnapshotCache::with_persistence(fetcher, persistence, config)
    }

    pub fn with_persistence(
        fetcher: Box<dyn SnapshotFetcher>,
        persistence: Box<dyn SnapshotPersistence>,
        config: SnapshotCacheConfig,
    ) -> Arc<SnapshotCache> {
        Arc::new_cyclic(|this| SnapshotCache {
            this: this.clone(),
            config,
            fetcher,
            persistence,
            store: SnapshotStore::new(),
            state: Mutex::new(CacheState::Uninitialized),
            fetch_lock: Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
            stale_refresh_in_flight: AtomicBool::new(false),
            stale_refresh: Mutex::new(None),
            is_shut_down: AtomicBool::new(false),
            poller: Mutex::new(None),
            realtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SnapshotCacheConfig {
        &self.config
    }

    pub fn state(&self) -> CacheState {
        *self
            .state
            .lock()
            .expect("thread holding cache state lock should not panic")
    }

    fn set_state(&self, state: CacheState) {
        *self
            .state
            .lock()
            .expect("thread holding cache state lock should not panic") = state;
    }

    fn lock_fetch(&self) -> MutexGuard<'_, Option<Result<()>>> {
        self.fetch_lock
            .lock()
            .expect("thread holding fetch lock should not panic")
    }

    /// Load the first snapshot.
    ///
    /// Without `force_refresh` this is a no-op on a ready cache, and a fresh persisted snapshot is
    /// adopted without fetching. Otherwise the snapshot is fetched. If the fetch fails, any
    /// persisted snapshot is adopted even if it has expired, and only if there is none does
    /// bootstrap fail.
    pub fn bootstrap(&self, force_refresh: bool) -> Result<()> {
        let _fetch_guard = self.lock_fetch();

        if !force_refresh && self.is_ready() {
            return Ok(());
        }

        let was_ready = self.is_ready();
        self.set_state(if was_ready {
            CacheState::Refreshing
        } else {
            CacheState::Bootstrapping
        });

        let persisted = if force_refresh {
            None
        } else {
            self.load_persisted()
        };

        if let Some(persisted) = persisted.filter(|snapshot| !snapshot.is_expired()) {
            log::debug!(target: "flagent",
                        revision = persisted.revision();
                        "bootstrapped from persisted snapshot");
            self.store.set_snapshot(Arc::new(persisted));
            self.set_state(CacheState::Ready);
            self.start_poller();
            return Ok(());
        }

        match self.fetcher.fetch(self.config.snapshot_ttl) {
            Ok(snapshot) => {
                log::debug!(target: "flagent",
                            revision = snapshot.revision(),
                            flags = snapshot.len();
                            "bootstrapped from fetched snapshot");
                self.adopt(snapshot);
            }
            Err(err) => {
                log::warn!(target: "flagent", "failed to fetch snapshot during bootstrap: {err}");
                if was_ready {
                    // The in-memory snapshot is at least as new as the persisted one.
                } else if let Some(persisted) = self.load_persisted() {
                    log::warn!(target: "flagent",
                               revision = persisted.revision(),
                               expired = persisted.is_expired();
                               "falling back to persisted snapshot");
                    self.store.set_snapshot(Arc::new(persisted));
                } else {
                    self.set_state(CacheState::Uninitialized);
                    return Err(err);
                }
            }
        }

        self.set_state(CacheState::Ready);
        self.start_poller();
        Ok(())
    }

    /// Fetch a new snapshot and swap it in.
    ///
    /// On failure the previous snapshot keeps being served and the error is returned. Concurrent
    /// calls coalesce: a caller that waited while another refresh completed returns that
    /// refresh's outcome without fetching again.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the cache is not bootstrapped. Nothing is fetched.
    /// - Any fetch failure.
    pub fn refresh(&self) -> Result<()> {
        let observed_generation = self.refresh_generation.load(Ordering::Acquire);
        let mut last_outcome = self.lock_fetch();

        if self.refresh_generation.load(Ordering::Acquire) != observed_generation {
            if let Some(outcome) = last_outcome.as_ref() {
                log::debug!(target: "flagent", "coalesced refresh with a concurrent one");
                return outcome.clone();
            }
        }

        if !self.is_ready() {
            return Err(Error::NotReady);
        }

        self.set_state(CacheState::Refreshing);
        log::debug!(target: "flagent", "refreshing snapshot");
        let outcome = match self.fetcher.fetch(self.config.snapshot_ttl) {
            Ok(snapshot) => {
                log::debug!(target: "flagent",
                            revision = snapshot.revision(),
                            flags = snapshot.len();
                            "refreshed snapshot");
                self.adopt(snapshot);
                Ok(())
            }
            Err(err) => {
                log::warn!(target: "flagent", "failed to refresh snapshot, serving previous one: {err}");
                Err(err)
            }
        };
        self.set_state(CacheState::Ready);

        *last_outcome = Some(outcome.clone());
        self.refresh_generation.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Persist `snapshot` and make it live.
    fn adopt(&self, snapshot: FlagSnapshot) {
        if let Err(err) = self.persistence.save(&snapshot) {
            log::warn!(target: "flagent", "failed to persist snapshot: {err}");
        }
        self.store.set_snapshot(Arc::new(snapshot));
    }

    fn load_persisted(&self) -> Option<FlagSnapshot> {
        match self.persistence.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                log::warn!(target: "flagent", "failed to load persisted snapshot: {err}");
                None
            }
        }
    }

    /// Current snapshot. Never performs I/O.
    ///
    /// An expired snapshot is still returned. If auto-refresh is enabled, a background refresh is
    /// scheduled for it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the cache is not bootstrapped.
    pub fn snapshot(&self) -> Result<Arc<FlagSnapshot>> {
        let Some(snapshot) = self.store.get_snapshot() else {
            log::warn!(target: "flagent", "evaluating before snapshot cache has been bootstrapped");
            return Err(Error::NotReady);
        };

        if snapshot.is_expired() {
            self.schedule_stale_refresh();
        }

        Ok(snapshot)
    }

    /// Evaluate the flag identified by `flag_id` or `flag_key` against the current snapshot.
    ///
    /// # Errors
    ///
    /// - [`Error::NotReady`] if the cache is not bootstrapped.
    /// - [`Error::FlagNotFound`] if neither `flag_id` nor `flag_key` resolves.
    pub fn evaluate(
        &self,
        flag_id: Option<FlagId>,
        flag_key: Option<&str>,
        ctx: &EntityContext,
        debug: bool,
    ) -> Result<EvaluationResult> {
        let snapshot = self.snapshot()?;
        evaluate_in_snapshot(&snapshot, flag_id, flag_key, ctx, debug)
    }

    /// Drop the in-memory and persisted snapshots and return to `Uninitialized`.
    pub fn clear_cache(&self) {
        let mut last_outcome = self.lock_fetch();
        self.store.clear();
        if let Err(err) = self.persistence.clear() {
            log::warn!(target: "flagent", "failed to clear persisted snapshot: {err}");
        }
        *last_outcome = None;
        self.set_state(CacheState::Uninitialized);
        log::debug!(target: "flagent", "cleared snapshot cache");
    }

    pub fn is_ready(&self) -> bool {
        self.store.get_snapshot().is_some()
    }

    /// Age of the current snapshot. `None` if not bootstrapped.
    pub fn snapshot_age(&self) -> Option<Duration> {
        self.store.get_snapshot().map(|snapshot| snapshot.age())
    }

    /// Returns `true` if there is no snapshot or the current one has outlived its ttl. Never
    /// triggers a refresh.
    pub fn is_expired(&self) -> bool {
        self.store
            .get_snapshot()
            .map_or(true, |snapshot| snapshot.is_expired())
    }

    /// Subscribe to change notifications and refresh on every relevant event.
    ///
    /// Replaces any previous subscription. Returns a handle for observing the connection.
    pub fn enable_realtime(&self, config: RealtimeConfig) -> Result<Arc<RealtimeStatus>> {
        if self.is_shut_down.load(Ordering::Acquire) {
            return Err(Error::InvalidationStream(
                "snapshot cache has been shut down".to_owned(),
            ));
        }

        let this = self.this.clone();
        let invalidator = RealtimeInvalidator::start(config, move || refresh_weak(&this))?;
        let status = invalidator.status();

        let previous = self
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic")
            .replace(invalidator);
        if let Some(previous) = previous {
            previous.shutdown()?;
        }

        Ok(status)
    }

    /// Stop the refresh timer, the realtime subscription and any background refresh of an expired
    /// snapshot, waiting for all of them to exit. Idempotent.
    ///
    /// The snapshot stays available for evaluation.
    pub fn shutdown(&self) -> Result<()> {
        self.is_shut_down.store(true, Ordering::Release);

        let poller = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic")
            .take();
        let realtime = self
            .realtime
            .lock()
            .expect("thread holding realtime lock should not panic")
            .take();
        let stale_refresh = self.lock_stale_refresh().take();

        let poller_result = poller.map_or(Ok(()), PollerThread::shutdown);
        let realtime_result = realtime.map_or(Ok(()), RealtimeInvalidator::shutdown);
        let stale_refresh_result = stale_refresh.map_or(Ok(()), |handle| {
            handle.join().map_err(|_| Error::PollerThreadPanicked)
        });
        log::debug!(target: "flagent", "snapshot cache shut down");
        poller_result.and(realtime_result).and(stale_refresh_result)
    }

    fn start_poller(&self) {
        if !self.config.auto_refresh || self.is_shut_down.load(Ordering::Acquire) {
            return;
        }

        let mut poller = self
            .poller
            .lock()
            .expect("thread holding poller lock should not panic");
        if poller.is_some() {
            return;
        }

        let this = self.this.clone();
        match PollerThread::start(self.config.poller_config(), move || refresh_weak(&this)) {
            Ok(thread) => *poller = Some(thread),
            Err(err) => {
                log::warn!(target: "flagent", "failed to start poller thread: {err}");
            }
        }
    }

    fn schedule_stale_refresh(&self) {
        if !self.config.auto_refresh || self.is_shut_down.load(Ordering::Acquire) {
            return;
        }
        if self
            .stale_refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut stale_refresh = self.lock_stale_refresh();
        // Checked under the lock so that shutdown either sees the handle or stops the spawn.
        if self.is_shut_down.load(Ordering::Acquire) {
            self.stale_refresh_in_flight.store(false, Ordering::Release);
            return;
        }

        let this = self.this.clone();
        let spawned = std::thread::Builder::new()
            .name("flagent-stale-refresh".to_owned())
            .spawn(move || {
                if let Some(cache) = this.upgrade() {
                    if !cache.is_shut_down.load(Ordering::Acquire) {
                        log::debug!(target: "flagent", "refreshing expired snapshot in background");
                        let _ = cache.refresh();
                    }
                    cache.stale_refresh_in_flight.store(false, Ordering::Release);
                }
            });
        match spawned {
            Ok(handle) => *stale_refresh = Some(handle),
            Err(err) => {
                log::warn!(target: "flagent", "failed to spawn background refresh: {err}");
                self.stale_refresh_in_flight.store(false, Ordering::Release);
            }
        }
    }

    fn lock_stale_refresh(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.stale_refresh
            .lock()
            .expect("thread holding stale refresh lock should not panic")
    }
}

/// Refresh the cache if it is still alive. Errors are logged by `refresh` itself.
fn refresh_weak(cache: &Weak<SnapshotCache>) -> ControlFlow<()> {
    match cache.upgrade() {
        Some(cache) => {
            let _ = cache.refresh();
            ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
    }
}

/// Evaluate a flag against a specific snapshot, stamping the result with its revision.
pub(crate) fn evaluate_in_snapshot(
    snapshot: &FlagSnapshot,
    flag_id: Option<FlagId>,
    flag_key: Option<&str>,
    ctx: &EntityContext,
    debug: bool,
) -> Result<EvaluationResult> {
    let flag = resolve_flag(snapshot, flag_id, flag_key)?;
    Ok(evaluate_resolved(snapshot, flag, ctx, debug))
}

/// Look up a flag by id, falling back to key.
pub(crate) fn resolve_flag<'a>(
    snapshot: &'a FlagSnapshot,
    flag_id: Option<FlagId>,
    flag_key: Option<&str>,
) -> Result<&'a Flag> {
    snapshot.find_flag(flag_id, flag_key).ok_or_else(|| {
        log::warn!(target: "flagent",
                   flag_id:? = flag_id,
                   flag_key:? = flag_key;
                   "flag not found in snapshot");
        Error::FlagNotFound
    })
}

/// Evaluate `flag`, which must come from `snapshot`.
pub(crate) fn evaluate_resolved(
    snapshot: &FlagSnapshot,
    flag: &Flag,
    ctx: &EntityContext,
    debug: bool,
) -> EvaluationResult {
    let mut result = evaluate_flag(flag, ctx, debug);
    result.revision = snapshot.revision();
    result
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Barrier,
        },
        time::{Duration, Instant},
    };

    use chrono::{TimeDelta, Utc};

    use super::{CacheState, SnapshotCache};
    use crate::{
        config::SnapshotCacheConfig,
        context::EntityContext,
        model::{Distribution, Flag, Segment, Variant},
        persistence::{FilePersistence, InMemoryPersistence, SnapshotPersistence},
        snapshot::FlagSnapshot,
        snapshot_fetcher::SnapshotFetcher,
        Error, Result,
    };

    /// Flags `f1` and `f2`, both assigning everyone to `variant_key`.
    fn flags(variant_key: &str) -> Vec<Flag> {
        [(1, "f1"), (2, "f2")]
            .into_iter()
            .map(|(id, key)| {
                Flag::new(
                    id,
                    key,
                    true,
                    vec![Segment::new(id, 0, 100, vec![], vec![Distribution::new(1, 100)])],
                    vec![Variant::new(1, variant_key)],
                )
            })
            .collect()
    }

    fn snapshot(variant_key: &str, revision: u64, ttl: Duration) -> FlagSnapshot {
        FlagSnapshot::new(flags(variant_key), revision, Utc::now(), ttl)
    }

    /// Fetcher returning `variant_key` snapshots with increasing revisions while `healthy` is set.
    struct TestFetcher {
        fetches: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        variant_key: &'static str,
        delay: Duration,
    }

    impl TestFetcher {
        fn new(variant_key: &'static str) -> TestFetcher {
            TestFetcher {
                fetches: Arc::new(AtomicUsize::new(0)),
                healthy: Arc::new(AtomicBool::new(true)),
                variant_key,
                delay: Duration::ZERO,
            }
        }
    }

    impl SnapshotFetcher for TestFetcher {
        fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot> {
            std::thread::sleep(self.delay);
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            if self.healthy.load(Ordering::SeqCst) {
                Ok(snapshot(self.variant_key, n, ttl))
            } else {
                Err(Error::UnexpectedStatus(503))
            }
        }
    }

    fn manual_config() -> SnapshotCacheConfig {
        SnapshotCacheConfig::new().with_auto_refresh(false)
    }

    fn variant_of(cache: &SnapshotCache, flag_key: &str) -> Option<String> {
        cache
            .evaluate(None, Some(flag_key), &EntityContext::new("user-42"), false)
            .unwrap()
            .variant_key
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn evaluate_before_bootstrap_is_not_ready() {
        let cache = SnapshotCache::new(Box::new(TestFetcher::new("on")), manual_config());
        assert_eq!(cache.state(), CacheState::Uninitialized);
        assert!(!cache.is_ready());
        assert!(cache.snapshot_age().is_none());
        let err = cache
            .evaluate(Some(1), None, &EntityContext::new("user-42"), false)
            .unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }

    #[test]
    fn bootstrap_fetches_and_evaluates() {
        let fetcher = TestFetcher::new("on");
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());

        cache.bootstrap(false).unwrap();
        assert_eq!(cache.state(), CacheState::Ready);
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("on"));

        let result = cache
            .evaluate(Some(2), None, &EntityContext::new("user-42"), false)
            .unwrap();
        assert_eq!(result.flag_key, "f2");
        assert_eq!(result.revision, 1);

        // Already bootstrapped.
        cache.bootstrap(false).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_flag_is_not_found() {
        let cache = SnapshotCache::new(Box::new(TestFetcher::new("on")), manual_config());
        cache.bootstrap(false).unwrap();
        let err = cache
            .evaluate(Some(404), Some("missing"), &EntityContext::new("user-42"), false)
            .unwrap_err();
        assert!(matches!(err, Error::FlagNotFound));
    }

    #[test]
    fn bootstrap_adopts_fresh_persisted_snapshot_without_fetching() {
        let persistence = InMemoryPersistence::new();
        persistence
            .save(&snapshot("persisted", 7, Duration::from_secs(60)))
            .unwrap();
        let fetcher = TestFetcher::new("fetched");
        let fetches = fetcher.fetches.clone();
        let cache =
            SnapshotCache::with_persistence(Box::new(fetcher), Box::new(persistence), manual_config());

        cache.bootstrap(false).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("persisted"));
    }

    #[test]
    fn forced_bootstrap_skips_persisted_snapshot() {
        let persistence = InMemoryPersistence::new();
        persistence
            .save(&snapshot("persisted", 7, Duration::from_secs(60)))
            .unwrap();
        let cache = SnapshotCache::with_persistence(
            Box::new(TestFetcher::new("fetched")),
            Box::new(persistence),
            manual_config(),
        );

        cache.bootstrap(true).unwrap();
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("fetched"));
    }

    #[test]
    fn bootstrap_falls_back_to_expired_persisted_snapshot() {
        let persistence = InMemoryPersistence::new();
        persistence
            .save(&FlagSnapshot::new(
                flags("stale"),
                3,
                Utc::now() - TimeDelta::hours(1),
                Duration::from_secs(60),
            ))
            .unwrap();
        let fetcher = TestFetcher::new("fetched");
        fetcher.healthy.store(false, Ordering::SeqCst);
        let cache =
            SnapshotCache::with_persistence(Box::new(fetcher), Box::new(persistence), manual_config());

        cache.bootstrap(false).unwrap();
        assert!(cache.is_ready());
        assert!(cache.is_expired());
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("stale"));
    }

    #[test]
    fn bootstrap_fails_without_any_snapshot() {
        let fetcher = TestFetcher::new("fetched");
        fetcher.healthy.store(false, Ordering::SeqCst);
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());

        let err = cache.bootstrap(false).unwrap_err();
        assert!(err.is_fetch_failure());
        assert_eq!(cache.state(), CacheState::Uninitialized);
        assert!(!cache.is_ready());
    }

    #[test]
    fn failed_refresh_keeps_serving_previous_snapshot() {
        let fetcher = TestFetcher::new("on");
        let healthy = fetcher.healthy.clone();
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());
        cache.bootstrap(false).unwrap();
        let before = cache
            .evaluate(None, Some("f1"), &EntityContext::new("user-42"), false)
            .unwrap();

        healthy.store(false, Ordering::SeqCst);
        let err = cache.refresh().unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus(503)));

        let after = cache
            .evaluate(None, Some("f1"), &EntityContext::new("user-42"), false)
            .unwrap();
        assert_eq!(after, before);
        assert_eq!(cache.state(), CacheState::Ready);

        healthy.store(true, Ordering::SeqCst);
        cache.refresh().unwrap();
        let refreshed = cache
            .evaluate(None, Some("f1"), &EntityContext::new("user-42"), false)
            .unwrap();
        assert!(refreshed.revision > before.revision);
    }

    #[test]
    fn refresh_before_bootstrap_does_not_fetch() {
        let fetcher = TestFetcher::new("on");
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());
        assert!(matches!(cache.refresh(), Err(Error::NotReady)));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clear_cache_resets_to_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let cache = SnapshotCache::new(
            Box::new(TestFetcher::new("on")),
            manual_config().with_persistence_path(&path),
        );
        cache.bootstrap(false).unwrap();
        assert!(path.exists());

        cache.clear_cache();
        assert_eq!(cache.state(), CacheState::Uninitialized);
        assert!(!path.exists());
        assert!(matches!(
            cache.evaluate(Some(1), None, &EntityContext::new("user-42"), false),
            Err(Error::NotReady)
        ));
        assert!(matches!(cache.refresh(), Err(Error::NotReady)));
    }

    #[test]
    fn restarted_cache_bootstraps_from_persisted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        let first = SnapshotCache::new(
            Box::new(TestFetcher::new("on")),
            manual_config().with_persistence_path(&path),
        );
        first.bootstrap(false).unwrap();
        first.shutdown().unwrap();

        let offline = TestFetcher::new("unused");
        offline.healthy.store(false, Ordering::SeqCst);
        let second = SnapshotCache::with_persistence(
            Box::new(offline),
            Box::new(FilePersistence::new(&path)),
            manual_config(),
        );
        second.bootstrap(false).unwrap();
        assert_eq!(variant_of(&second, "f1").as_deref(), Some("on"));
    }

    #[test]
    fn concurrent_refreshes_coalesce() {
        let mut fetcher = TestFetcher::new("on");
        fetcher.delay = Duration::from_millis(200);
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());
        cache.bootstrap(false).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.refresh()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let refresh_fetches = fetches.load(Ordering::SeqCst) - 1;
        assert!(
            (1..=2).contains(&refresh_fetches),
            "expected coalesced refreshes, got {refresh_fetches} fetches"
        );
    }

    #[test]
    fn readers_never_see_a_torn_snapshot() {
        // Odd revisions assign "old", even revisions assign "new".
        let revision = Arc::new(AtomicU64::new(0));
        let fetcher = {
            let revision = revision.clone();
            move |ttl: Duration| -> Result<FlagSnapshot> {
                let n = revision.fetch_add(1, Ordering::SeqCst) + 1;
                let key = if n % 2 == 1 { "old" } else { "new" };
                Ok(snapshot(key, n, ttl))
            }
        };
        let cache = SnapshotCache::new(Box::new(fetcher), manual_config());
        cache.bootstrap(false).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let ctx = EntityContext::new("user-42");
                    while !done.load(Ordering::SeqCst) {
                        let result = cache.evaluate(None, Some("f1"), &ctx, false).unwrap();
                        let expected = if result.revision % 2 == 1 { "old" } else { "new" };
                        assert_eq!(result.variant_key.as_deref(), Some(expected));

                        let snapshot = cache.snapshot().unwrap();
                        let keys: Vec<_> = snapshot
                            .flags()
                            .iter()
                            .map(|flag| flag.variants[0].key.clone())
                            .collect();
                        assert_eq!(keys[0], keys[1]);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            cache.refresh().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn auto_refresh_runs_until_shutdown() {
        let fetcher = TestFetcher::new("on");
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(
            Box::new(fetcher),
            SnapshotCacheConfig::new()
                .with_refresh_interval(Duration::from_millis(10))
                .with_refresh_jitter(Duration::ZERO),
        );
        cache.bootstrap(false).unwrap();

        assert!(wait_until(|| fetches.load(Ordering::SeqCst) >= 3));

        cache.shutdown().unwrap();
        let after_shutdown = fetches.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fetches.load(Ordering::SeqCst), after_shutdown);

        // Idempotent, and the snapshot stays available.
        cache.shutdown().unwrap();
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("on"));
    }

    #[test]
    fn expired_snapshot_is_served_and_refreshed_in_background() {
        let fetcher = TestFetcher::new("on");
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(
            Box::new(fetcher),
            SnapshotCacheConfig::new()
                .with_snapshot_ttl(Duration::from_millis(1))
                .with_refresh_interval(Duration::from_secs(3600)),
        );
        cache.bootstrap(false).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.is_expired());

        // Served stale.
        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("on"));
        assert!(wait_until(|| fetches.load(Ordering::SeqCst) >= 2));

        cache.shutdown().unwrap();
    }

    #[test]
    fn shutdown_waits_for_background_refresh() {
        let mut fetcher = TestFetcher::new("on");
        fetcher.delay = Duration::from_millis(300);
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(
            Box::new(fetcher),
            SnapshotCacheConfig::new()
                .with_snapshot_ttl(Duration::from_millis(1))
                .with_refresh_interval(Duration::from_secs(3600)),
        );
        cache.bootstrap(false).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        // Schedules a background refresh that is still fetching when shutdown begins.
        cache.snapshot().unwrap();
        cache.shutdown().unwrap();

        let after_shutdown = fetches.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fetches.load(Ordering::SeqCst), after_shutdown);

        // No new background refresh after shutdown.
        cache.snapshot().unwrap();
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fetches.load(Ordering::SeqCst), after_shutdown);
    }

    #[test]
    fn expired_snapshot_is_not_refreshed_without_auto_refresh() {
        let fetcher = TestFetcher::new("on");
        let fetches = fetcher.fetches.clone();
        let cache = SnapshotCache::new(
            Box::new(fetcher),
            manual_config().with_snapshot_ttl(Duration::from_millis(1)),
        );
        cache.bootstrap(false).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(variant_of(&cache, "f1").as_deref(), Some("on"));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshot_age_grows() {
        let cache = SnapshotCache::new(Box::new(TestFetcher::new("on")), manual_config());
        cache.bootstrap(false).unwrap();
        let first = cache.snapshot_age().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.snapshot_age().unwrap() > first);
        assert!(!cache.is_expired());
    }
}
