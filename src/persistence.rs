//! Durable local storage for the last good snapshot.
//!
//! Persistence is best-effort: the in-memory snapshot stays authoritative for the lifetime of the
//! process, and unreadable persisted data is reported as absent.
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    model::{Flag, FlagId},
    snapshot::FlagSnapshot,
    Error, Result,
};

/// A single durable slot holding one snapshot.
pub trait SnapshotPersistence: Send + Sync {
    /// Replace the persisted snapshot.
    fn save(&self, snapshot: &FlagSnapshot) -> Result<()>;
    /// Load the persisted snapshot, expired or not. Corrupt data loads as `None`.
    fn load(&self) -> Result<Option<FlagSnapshot>>;
    /// Remove the persisted snapshot. Clearing an empty slot is not an error.
    fn clear(&self) -> Result<()>;
}

/// On-disk layout of a persisted snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSnapshot {
    flags: BTreeMap<FlagId, Flag>,
    revision: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    fetched_at: DateTime<Utc>,
    ttl_ms: u64,
}

impl From<&FlagSnapshot> for PersistedSnapshot {
    fn from(snapshot: &FlagSnapshot) -> PersistedSnapshot {
        PersistedSnapshot {
            flags: snapshot
                .flags()
                .into_iter()
                .map(|flag| (flag.id, flag.clone()))
                .collect(),
            revision: snapshot.revision(),
            fetched_at: snapshot.fetched_at(),
            ttl_ms: u64::try_from(snapshot.ttl().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<PersistedSnapshot> for FlagSnapshot {
    fn from(persisted: PersistedSnapshot) -> FlagSnapshot {
        FlagSnapshot::new(
            persisted.flags.into_values(),
            persisted.revision,
            persisted.fetched_at,
            Duration::from_millis(persisted.ttl_ms),
        )
    }
}

/// Persists the snapshot as a JSON document at a fixed path.
///
/// Writes go to a sibling temporary file which is then renamed over the target, so a crash never
/// leaves a half-written document behind.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> FilePersistence {
        FilePersistence { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn persistence_error(err: std::io::Error) -> Error {
    Error::Persistence(Arc::new(err))
}

impl SnapshotPersistence for FilePersistence {
    fn save(&self, snapshot: &FlagSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec(&PersistedSnapshot::from(snapshot))
            .map_err(|err| persistence_error(std::io::Error::other(err)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(persistence_error)?;
        }

        let temp_path = self.temp_path();
        std::fs::write(&temp_path, bytes).map_err(persistence_error)?;
        std::fs::rename(&temp_path, &self.path).map_err(persistence_error)?;

        log::debug!(target: "flagent",
                    path:? = self.path,
                    revision = snapshot.revision();
                    "persisted snapshot");
        Ok(())
    }

    fn load(&self) -> Result<Option<FlagSnapshot>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(persistence_error(err)),
        };

        match serde_json::from_slice::<PersistedSnapshot>(&bytes) {
            Ok(persisted) => Ok(Some(persisted.into())),
            Err(err) => {
                log::warn!(target: "flagent",
                           path:? = self.path;
                           "ignoring corrupt persisted snapshot: {err}");
                Ok(None)
            }
        }
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persistence_error(err)),
        }
    }
}

/// Keeps the "persisted" snapshot in memory. Used when no persistence path is configured.
#[derive(Default)]
pub struct InMemoryPersistence {
    snapshot: Mutex<Option<FlagSnapshot>>,
}

impl InMemoryPersistence {
    pub fn new() -> InMemoryPersistence {
        InMemoryPersistence::default()
    }
}

impl SnapshotPersistence for InMemoryPersistence {
    fn save(&self, snapshot: &FlagSnapshot) -> Result<()> {
        *self
            .snapshot
            .lock()
            .expect("thread holding persisted snapshot lock should not panic") = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<FlagSnapshot>> {
        Ok(self
            .snapshot
            .lock()
            .expect("thread holding persisted snapshot lock should not panic")
            .clone())
    }

    fn clear(&self) -> Result<()> {
        self.snapshot
            .lock()
            .expect("thread holding persisted snapshot lock should not panic")
            .take();
        Ok(())
    }
}
