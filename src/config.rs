use std::{path::PathBuf, time::Duration};

use crate::{
    model::FlagId,
    persistence::{FilePersistence, InMemoryPersistence, SnapshotPersistence},
    poller_thread::PollerThreadConfig,
    snapshot_fetcher::{FileFetcher, HttpFetcher, SnapshotFetcher},
    Result,
};

/// Configuration for [`SnapshotCache`](crate::snapshot_cache::SnapshotCache).
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use flagent::SnapshotCacheConfig;
/// let config = SnapshotCacheConfig::new()
///     .with_snapshot_ttl(Duration::from_secs(600))
///     .with_persistence_path("/var/cache/flagent/snapshot.json");
/// ```
// Not implementing `Copy` as `persistence_path` is not copyable.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotCacheConfig {
    /// How long a fetched snapshot stays fresh. Zero means it never expires.
    ///
    /// Defaults to [`SnapshotCacheConfig::DEFAULT_SNAPSHOT_TTL`].
    pub snapshot_ttl: Duration,
    /// Interval between automatic refreshes.
    ///
    /// Defaults to [`SnapshotCacheConfig::DEFAULT_REFRESH_INTERVAL`].
    pub refresh_interval: Duration,
    /// Randomized amount subtracted from each refresh interval. This helps to avoid multiple
    /// instances synchronizing and producing spiky load on the flag source.
    ///
    /// Defaults to [`SnapshotCacheConfig::DEFAULT_REFRESH_JITTER`].
    pub refresh_jitter: Duration,
    /// Whether to start a background thread refreshing the snapshot periodically.
    pub auto_refresh: bool,
    /// Where to persist the snapshot. `None` keeps the persisted copy in memory only.
    pub persistence_path: Option<PathBuf>,
}

impl SnapshotCacheConfig {
    /// Default value for [`SnapshotCacheConfig::snapshot_ttl`].
    pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`SnapshotCacheConfig::refresh_interval`].
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`SnapshotCacheConfig::refresh_jitter`].
    pub const DEFAULT_REFRESH_JITTER: Duration = Duration::from_secs(3);

    pub fn new() -> SnapshotCacheConfig {
        SnapshotCacheConfig::default()
    }

    /// Load configuration from `FLAGENT_EVALCACHE_REFRESH_INTERVAL` (seconds),
    /// `FLAGENT_SNAPSHOT_TTL` (seconds) and `FLAGENT_SNAPSHOT_PATH`. Missing or invalid values
    /// fall back to defaults. A zero refresh interval is invalid.
    pub fn from_env() -> SnapshotCacheConfig {
        SnapshotCacheConfig::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SnapshotCacheConfig {
        let mut config = SnapshotCacheConfig::default();
        match seconds_var(&lookup, "FLAGENT_EVALCACHE_REFRESH_INTERVAL") {
            Some(Duration::ZERO) => {
                log::warn!(target: "flagent",
                           name = "FLAGENT_EVALCACHE_REFRESH_INTERVAL";
                           "ignoring zero refresh interval");
            }
            Some(interval) => config.refresh_interval = interval,
            None => {}
        }
        if let Some(ttl) = seconds_var(&lookup, "FLAGENT_SNAPSHOT_TTL") {
            config.snapshot_ttl = ttl;
        }
        if let Some(path) = lookup("FLAGENT_SNAPSHOT_PATH").filter(|p| !p.is_empty()) {
            config.persistence_path = Some(PathBuf::from(path));
        }
        config
    }

    pub fn with_snapshot_ttl(mut self, ttl: Duration) -> SnapshotCacheConfig {
        self.snapshot_ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> SnapshotCacheConfig {
        self.refresh_interval = interval;
        self
    }

    pub fn with_refresh_jitter(mut self, jitter: Duration) -> SnapshotCacheConfig {
        self.refresh_jitter = jitter;
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> SnapshotCacheConfig {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn with_persistence_path(mut self, path: impl Into<PathBuf>) -> SnapshotCacheConfig {
        self.persistence_path = Some(path.into());
        self
    }

    pub(crate) fn poller_config(&self) -> PollerThreadConfig {
        PollerThreadConfig::new()
            .with_interval(self.refresh_interval)
            .with_jitter(self.refresh_jitter)
    }

    pub(crate) fn persistence(&self) -> Box<dyn SnapshotPersistence> {
        match &self.persistence_path {
            Some(path) => Box::new(FilePersistence::new(path.clone())),
            None => Box::new(InMemoryPersistence::new()),
        }
    }
}

impl Default for SnapshotCacheConfig {
    fn default() -> SnapshotCacheConfig {
        SnapshotCacheConfig {
            snapshot_ttl: SnapshotCacheConfig::DEFAULT_SNAPSHOT_TTL,
            refresh_interval: SnapshotCacheConfig::DEFAULT_REFRESH_INTERVAL,
            refresh_jitter: SnapshotCacheConfig::DEFAULT_REFRESH_JITTER,
            auto_refresh: true,
            persistence_path: None,
        }
    }
}

/// Selects the upstream source a snapshot is fetched from.
///
/// The store-backed source is constructed directly from a
/// [`FlagStore`](crate::snapshot_fetcher::FlagStore) with
/// [`StoreFetcher`](crate::snapshot_fetcher::StoreFetcher).
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    /// A static JSON export document.
    JsonFile { path: PathBuf },
    /// A JSON export document served over HTTP.
    JsonHttp { url: String, timeout: Duration },
}

impl SourceConfig {
    /// Default value for the HTTP request timeout.
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(59);

    /// Load the source from `FLAGENT_DB_DRIVER` (`json_file` or `json_http`),
    /// `FLAGENT_DB_CONNECTION_STR` (path or URL) and `FLAGENT_EVALCACHE_REFRESH_TIMEOUT` (seconds).
    ///
    /// Returns `None` if no file or HTTP source is configured.
    pub fn from_env() -> Option<SourceConfig> {
        SourceConfig::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<SourceConfig> {
        let driver = lookup("FLAGENT_DB_DRIVER")?;
        let connection = lookup("FLAGENT_DB_CONNECTION_STR").unwrap_or_default();
        match driver.as_str() {
            "json_file" => Some(SourceConfig::JsonFile {
                path: PathBuf::from(connection),
            }),
            "json_http" => Some(SourceConfig::JsonHttp {
                url: connection,
                timeout: seconds_var(&lookup, "FLAGENT_EVALCACHE_REFRESH_TIMEOUT")
                    .unwrap_or(SourceConfig::DEFAULT_HTTP_TIMEOUT),
            }),
            other => {
                log::debug!(target: "flagent", driver = other; "no file or http snapshot source configured");
                None
            }
        }
    }

    /// Build the fetcher for this source.
    pub fn into_fetcher(self) -> Result<Box<dyn SnapshotFetcher>> {
        Ok(match self {
            SourceConfig::JsonFile { path } => Box::new(FileFetcher::new(path)),
            SourceConfig::JsonHttp { url, timeout } => Box::new(HttpFetcher::new(&url, timeout)?),
        })
    }
}

/// Configuration for [`RealtimeInvalidator`](crate::realtime::RealtimeInvalidator).
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Base URL of the flag server. The stream is served at `/api/v1/realtime/sse`.
    pub base_url: String,
    /// Only listen for changes of these flag keys. Empty means all flags.
    pub flag_keys: Vec<String>,
    /// Only listen for changes of these flag ids. Empty means all flags.
    pub flag_ids: Vec<FlagId>,
    /// Delay before the first reconnection attempt. Doubles with every consecutive failure.
    ///
    /// Defaults to [`RealtimeConfig::DEFAULT_RECONNECT_BASE_DELAY`].
    pub reconnect_base_delay: Duration,
    /// Upper bound for the reconnection delay.
    ///
    /// Defaults to [`RealtimeConfig::DEFAULT_RECONNECT_MAX_DELAY`].
    pub reconnect_max_delay: Duration,
}

impl RealtimeConfig {
    /// Default value for [`RealtimeConfig::reconnect_base_delay`].
    pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
    /// Default value for [`RealtimeConfig::reconnect_max_delay`].
    pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

    pub fn new(base_url: impl Into<String>) -> RealtimeConfig {
        RealtimeConfig {
            base_url: base_url.into(),
            flag_keys: Vec::new(),
            flag_ids: Vec::new(),
            reconnect_base_delay: RealtimeConfig::DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: RealtimeConfig::DEFAULT_RECONNECT_MAX_DELAY,
        }
    }

    pub fn with_flag_keys<T: Into<String>>(
        mut self,
        flag_keys: impl IntoIterator<Item = T>,
    ) -> RealtimeConfig {
        self.flag_keys = flag_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flag_ids(mut self, flag_ids: impl IntoIterator<Item = FlagId>) -> RealtimeConfig {
        self.flag_ids = flag_ids.into_iter().collect();
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> RealtimeConfig {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }
}

fn seconds_var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let value = lookup(name)?;
    match value.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(err) => {
            log::warn!(target: "flagent", name, value:display = value; "ignoring invalid duration: {err}");
            None
        }
    }
}
