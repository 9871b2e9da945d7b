use std::{path::PathBuf, sync::Arc};

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors of flag evaluation and snapshot synchronization.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Evaluation was attempted before the snapshot cache was bootstrapped.
    #[error("snapshot cache is not ready, call bootstrap() first")]
    NotReady,

    /// The requested flag id/key is absent from the current snapshot.
    #[error("flag not found")]
    FlagNotFound,

    /// Invalid base URL configuration.
    #[error("invalid url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Static snapshot file does not exist.
    #[error("snapshot source file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    /// Upstream returned a non-2xx response.
    #[error("received non-2xx response from snapshot source: {0}")]
    UnexpectedStatus(u16),

    /// Snapshot document could not be parsed.
    #[error("malformed snapshot document")]
    SnapshotParse(#[source] Arc<serde_json::Error>),

    /// The authoring store failed to produce a consistent read.
    #[error("flag store read failed: {0}")]
    Store(Arc<dyn std::error::Error + Send + Sync>),

    /// Local save/load of the persisted snapshot failed.
    #[error("snapshot persistence failed")]
    Persistence(#[source] Arc<std::io::Error>),

    /// Realtime invalidation stream failed.
    #[error("invalidation stream error: {0}")]
    InvalidationStream(String),

    /// Indicates that a background worker panicked. This should normally never happen.
    #[error("background worker panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl Error {
    /// Wrap an error produced by a [`FlagStore`](crate::snapshot_fetcher::FlagStore).
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::Store(Arc::new(err))
    }

    /// Returns `true` if the error means the upstream source could not deliver a valid snapshot.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidBaseUrl(_)
                | Error::SourceMissing(_)
                | Error::UnexpectedStatus(_)
                | Error::SnapshotParse(_)
                | Error::Store(_)
                | Error::Io(_)
                | Error::Network(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::SnapshotParse(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
