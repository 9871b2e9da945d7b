//! Strategies that pull a complete [`FlagSnapshot`] from an upstream source.
//!
//! All fetchers are blocking. They are called from the refresh path, never from evaluation.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use reqwest::Url;

use crate::{
    model::Flag,
    snapshot::{FlagSnapshot, SnapshotDocument},
    Error, Result,
};

/// Pulls a full snapshot from an upstream source. A failed fetch returns an error and has no other
/// effect.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot>;
}

impl<F> SnapshotFetcher for F
where
    F: Fn(Duration) -> Result<FlagSnapshot> + Send + Sync,
{
    fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot> {
        self(ttl)
    }
}

/// Read access to the flag authoring store.
pub trait FlagStore: Send + Sync {
    /// Return all non-deleted flags with their segments and variants loaded.
    ///
    /// Implementations must perform a single logical read (one transaction or read view), so
    /// concurrent writes never produce a torn result.
    fn read_flags(&self) -> Result<Vec<Flag>>;
}

/// Fetches snapshots from a [`FlagStore`].
pub struct StoreFetcher<S> {
    store: S,
}

impl<S: FlagStore> StoreFetcher<S> {
    pub fn new(store: S) -> StoreFetcher<S> {
        StoreFetcher { store }
    }
}

impl<S: FlagStore> SnapshotFetcher for StoreFetcher<S> {
    fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot> {
        log::debug!(target: "flagent", "reading flags from store");
        let flags = self.store.read_flags()?;
        log::debug!(target: "flagent", flags = flags.len(); "successfully read flags from store");
        Ok(FlagSnapshot::from_document(
            SnapshotDocument {
                flags,
                revision: None,
            },
            ttl,
        ))
    }
}

/// A [`FlagStore`] held in memory. Writes replace the whole flag set.
#[derive(Default)]
pub struct InMemoryFlagStore {
    flags: RwLock<Vec<Flag>>,
}

impl InMemoryFlagStore {
    pub fn new(flags: Vec<Flag>) -> InMemoryFlagStore {
        InMemoryFlagStore {
            flags: RwLock::new(flags),
        }
    }

    pub fn set_flags(&self, flags: Vec<Flag>) {
        let mut slot = self
            .flags
            .write()
            .expect("thread holding flag store lock should not panic");
        *slot = flags;
    }
}

impl FlagStore for InMemoryFlagStore {
    fn read_flags(&self) -> Result<Vec<Flag>> {
        let flags = self
            .flags
            .read()
            .expect("thread holding flag store lock should not panic");
        Ok(flags.clone())
    }
}

/// Fetches snapshots from a static JSON export document on disk.
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> FileFetcher {
        FileFetcher { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotFetcher for FileFetcher {
    fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot> {
        log::debug!(target: "flagent", path:? = self.path; "reading snapshot file");
        let bytes = std::fs::read(&self.path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                Error::SourceMissing(self.path.clone())
            } else {
                Error::from(err)
            }
        })?;
        let document: SnapshotDocument = serde_json::from_slice(&bytes)?;
        Ok(FlagSnapshot::from_document(document, ttl))
    }
}

/// Fetches snapshots from an HTTP export endpoint.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
}

impl HttpFetcher {
    /// Create a fetcher for `url`. Every request must complete within `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<HttpFetcher> {
        let url = Url::parse(url).map_err(Error::InvalidBaseUrl)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client, url })
    }
}

impl SnapshotFetcher for HttpFetcher {
    fn fetch(&self, ttl: Duration) -> Result<FlagSnapshot> {
        log::debug!(target: "flagent", "fetching snapshot");
        let response = self.client.get(self.url.clone()).send()?;

        let status = response.status();
        if !status.is_success() {
            log::warn!(target: "flagent", status = status.as_u16(); "received non-2xx response while fetching snapshot");
            return Err(Error::UnexpectedStatus(status.as_u16()));
        }

        let body = response.bytes()?;
        let document: SnapshotDocument = serde_json::from_slice(&body)?;

        log::debug!(target: "flagent", flags = document.flags.len(); "successfully fetched snapshot");
        Ok(FlagSnapshot::from_document(document, ttl))
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, time::Duration};

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::{FileFetcher, HttpFetcher, InMemoryFlagStore, SnapshotFetcher, StoreFetcher};
    use crate::{model::Flag, Error};

    const TTL: Duration = Duration::from_secs(60);

    fn fixture_json() -> String {
        std::fs::read_to_string("tests/data/flags.json").unwrap()
    }

    #[test]
    fn file_fetcher_reads_export_document() {
        let snapshot = FileFetcher::new("tests/data/flags.json").fetch(TTL).unwrap();
        assert!(snapshot.flag_by_key("f1").is_some());
        assert_eq!(snapshot.ttl(), TTL);
    }

    #[test]
    fn file_fetcher_fails_on_missing_file() {
        let err = FileFetcher::new("tests/data/does-not-exist.json")
            .fetch(TTL)
            .unwrap_err();
        assert!(matches!(err, Error::SourceMissing(_)));
        assert!(err.is_fetch_failure());
    }

    #[test]
    fn file_fetcher_fails_on_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ \"flags\": [ { \"id\": ").unwrap();
        let err = FileFetcher::new(file.path()).fetch(TTL).unwrap_err();
        assert!(matches!(err, Error::SnapshotParse(_)));
    }

    #[test]
    fn store_fetcher_reads_current_flags() {
        let store = InMemoryFlagStore::new(vec![Flag::new(1, "f1", true, vec![], vec![])]);
        let fetcher = StoreFetcher::new(store);
        assert_eq!(fetcher.fetch(TTL).unwrap().len(), 1);

        fetcher
            .store
            .set_flags(vec![Flag::new(2, "f2", true, vec![], vec![])]);
        let snapshot = fetcher.fetch(TTL).unwrap();
        assert!(snapshot.flag_by_key("f1").is_none());
        assert!(snapshot.flag_by_key("f2").is_some());
    }

    #[test]
    fn closures_are_fetchers() {
        let fetcher = |_ttl: Duration| -> crate::Result<crate::snapshot::FlagSnapshot> {
            Err(Error::UnexpectedStatus(503))
        };
        assert!(matches!(fetcher.fetch(TTL), Err(Error::UnexpectedStatus(503))));
    }

    #[test]
    fn http_fetcher_rejects_invalid_url() {
        assert!(matches!(
            HttpFetcher::new("not a url", TTL),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    // The blocking client must be created, used and dropped outside of the async runtime.
    async fn fetch_blocking(url: String) -> crate::Result<crate::snapshot::FlagSnapshot> {
        tokio::task::spawn_blocking(move || {
            HttpFetcher::new(&url, Duration::from_secs(1))?.fetch(TTL)
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_fetcher_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/flags/export"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(fixture_json(), "application/json"),
            )
            .mount(&server)
            .await;

        let snapshot = fetch_blocking(format!("{}/api/v1/flags/export", server.uri()))
            .await
            .unwrap();
        assert!(snapshot.flag_by_key("f1").is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_fetcher_fails_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = fetch_blocking(server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedStatus(500)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_fetcher_fails_on_malformed_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = fetch_blocking(server.uri()).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotParse(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn http_fetcher_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(fixture_json(), "application/json")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let url = server.uri();
        let err = tokio::task::spawn_blocking(move || {
            HttpFetcher::new(&url, Duration::from_millis(200))?.fetch(TTL)
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
