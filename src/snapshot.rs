//! Immutable, versioned view of flag configuration.
use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{Flag, FlagId};

/// The `{ "flags": [...] }` export document served by flag sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDocument {
    pub flags: Vec<Flag>,
    /// Optional revision assigned by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// How a tag query combines multiple tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TagOperator {
    /// Flag has at least one of the tags.
    #[default]
    Any,
    /// Flag has all of the tags.
    All,
}

/// A complete, immutable set of flags together with the moment it was fetched and how long it
/// stays fresh.
///
/// A snapshot is only ever replaced wholesale. There is no way to edit the flags it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagSnapshot {
    flags: HashMap<FlagId, Flag>,
    flag_ids_by_key: HashMap<String, FlagId>,
    revision: u64,
    fetched_at: DateTime<Utc>,
    /// Zero means the snapshot never expires.
    ttl: Duration,
}

impl FlagSnapshot {
    pub fn new(
        flags: impl IntoIterator<Item = Flag>,
        revision: u64,
        fetched_at: DateTime<Utc>,
        ttl: Duration,
    ) -> FlagSnapshot {
        let flags: HashMap<FlagId, Flag> = flags.into_iter().map(|flag| (flag.id, flag)).collect();
        let flag_ids_by_key = flags
            .values()
            .map(|flag| (flag.key.clone(), flag.id))
            .collect();
        FlagSnapshot {
            flags,
            flag_ids_by_key,
            revision,
            fetched_at,
            ttl,
        }
    }

    /// Build a snapshot from an export document fetched just now.
    ///
    /// Documents without a revision are stamped with the fetch time in milliseconds, which keeps
    /// revisions increasing across refreshes.
    pub fn from_document(document: SnapshotDocument, ttl: Duration) -> FlagSnapshot {
        let fetched_at = Utc::now();
        let revision = document
            .revision
            .unwrap_or_else(|| fetched_at.timestamp_millis().max(0) as u64);
        FlagSnapshot::new(document.flags, revision, fetched_at, ttl)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Time elapsed since the snapshot was fetched. Never negative.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns `true` once `now - fetched_at > ttl`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.ttl.is_zero() && self.age_at(now) > self.ttl
    }

    pub fn flag_by_id(&self, id: FlagId) -> Option<&Flag> {
        self.flags.get(&id)
    }

    pub fn flag_by_key(&self, key: &str) -> Option<&Flag> {
        self.flag_ids_by_key
            .get(key)
            .and_then(|id| self.flags.get(id))
    }

    /// Resolve a flag by id, falling back to key.
    pub fn find_flag(&self, flag_id: Option<FlagId>, flag_key: Option<&str>) -> Option<&Flag> {
        flag_id
            .and_then(|id| self.flag_by_id(id))
            .or_else(|| flag_key.and_then(|key| self.flag_by_key(key)))
    }

    /// All flags ordered by id.
    pub fn flags(&self) -> Vec<&Flag> {
        let mut flags: Vec<&Flag> = self.flags.values().collect();
        flags.sort_by_key(|flag| flag.id);
        flags
    }

    /// Flags matching the tag query, ordered by id. An empty tag list matches nothing.
    pub fn flags_by_tags<T: AsRef<str>>(&self, tags: &[T], operator: TagOperator) -> Vec<&Flag> {
        if tags.is_empty() {
            return Vec::new();
        }
        self.flags()
            .into_iter()
            .filter(|flag| match operator {
                TagOperator::Any => tags.iter().any(|tag| flag.has_tag(tag.as_ref())),
                TagOperator::All => tags.iter().all(|tag| flag.has_tag(tag.as_ref())),
            })
            .collect()
    }

    /// Export the snapshot as a document that can be served to other instances.
    pub fn export(&self) -> SnapshotDocument {
        SnapshotDocument {
            flags: self.flags().into_iter().cloned().collect(),
            revision: Some(self.revision),
        }
    }
}
