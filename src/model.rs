//! Read-only flag configuration model.
//!
//! Types deserialize from the `{ "flags": [...] }` export document. [`Flag`] and [`Segment`] are
//! prepared on construction: segments are ordered for evaluation and each segment's
//! accumulated-percent array is computed once, so evaluation never re-derives them.
use serde::{Deserialize, Serialize};

use crate::rules::Operator;

pub type FlagId = i64;
pub type SegmentId = i64;
pub type VariantId = i64;

/// Opaque key/value payload attached to a variant. Returned to callers, never interpreted.
pub type Attachment = serde_json::Map<String, serde_json::Value>;

/// Rank assigned to segments that don't declare one.
pub const DEFAULT_SEGMENT_RANK: i32 = 999;

/// Scales 0–100 percent onto the 0–1000 bucket space.
pub const PERCENT_MULTIPLIER: u32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FlagWire", into = "FlagWire")]
pub struct Flag {
    pub id: FlagId,
    pub key: String,
    pub description: Option<String>,
    pub enabled: bool,
    /// Entity type reported for evaluations that don't specify one.
    pub entity_type: Option<String>,
    pub snapshot_id: i64,
    pub tags: Vec<Tag>,
    pub variants: Vec<Variant>,
    /// Ordered by `(rank, id)`.
    segments: Vec<Segment>,
}

impl Flag {
    pub fn new(
        id: FlagId,
        key: impl Into<String>,
        enabled: bool,
        segments: Vec<Segment>,
        variants: Vec<Variant>,
    ) -> Flag {
        FlagWire {
            id,
            key: key.into(),
            description: None,
            enabled,
            entity_type: None,
            snapshot_id: 0,
            tags: Vec::new(),
            segments,
            variants,
        }
        .into()
    }

    pub fn with_tags<T: Into<String>>(mut self, tags: impl IntoIterator<Item = T>) -> Flag {
        self.tags = tags.into_iter().map(Tag::new).collect();
        self
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Flag {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Segments in evaluation order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn variant(&self, variant_id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.value == tag)
    }

    /// Salt for the consistent hash: the flag id in decimal.
    pub(crate) fn salt(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlagWire {
    #[serde(default)]
    id: FlagId,
    key: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    entity_type: Option<String>,
    #[serde(default)]
    snapshot_id: i64,
    #[serde(default)]
    tags: Vec<Tag>,
    #[serde(default)]
    segments: Vec<Segment>,
    #[serde(default)]
    variants: Vec<Variant>,
}

impl From<FlagWire> for Flag {
    fn from(wire: FlagWire) -> Flag {
        let mut segments = wire.segments;
        segments.sort_by_key(|segment| (segment.rank, segment.id));
        Flag {
            id: wire.id,
            key: wire.key,
            description: wire.description,
            enabled: wire.enabled,
            entity_type: wire.entity_type,
            snapshot_id: wire.snapshot_id,
            tags: wire.tags,
            variants: wire.variants,
            segments,
        }
    }
}

impl From<Flag> for FlagWire {
    fn from(flag: Flag) -> FlagWire {
        FlagWire {
            id: flag.id,
            key: flag.key,
            description: flag.description,
            enabled: flag.enabled,
            entity_type: flag.entity_type,
            snapshot_id: flag.snapshot_id,
            tags: flag.tags,
            segments: flag.segments,
            variants: flag.variants,
        }
    }
}

/// An ordered rule within a flag: which entities it applies to and how they are split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SegmentWire", into = "SegmentWire")]
pub struct Segment {
    pub id: SegmentId,
    pub description: Option<String>,
    pub rank: i32,
    /// 0–100.
    pub rollout_percent: u32,
    pub constraints: Vec<Constraint>,
    distributions: Vec<Distribution>,
    /// `accumulated[i] = accumulated[i - 1] + distributions[i].percent * 10`.
    accumulated: Vec<u32>,
}

impl Segment {
    pub fn new(
        id: SegmentId,
        rank: i32,
        rollout_percent: u32,
        constraints: Vec<Constraint>,
        distributions: Vec<Distribution>,
    ) -> Segment {
        SegmentWire {
            id,
            description: None,
            rank,
            rollout_percent,
            constraints,
            distributions,
        }
        .into()
    }

    /// Distributions in declaration order.
    pub fn distributions(&self) -> &[Distribution] {
        &self.distributions
    }

    /// Accumulated percents on the 0–1000 bucket scale, parallel to [`Segment::distributions`].
    pub fn accumulated_percents(&self) -> &[u32] {
        &self.accumulated
    }

    /// Return a copy of this segment with a different rollout percent.
    pub fn with_rollout_percent(&self, rollout_percent: u32) -> Segment {
        Segment {
            rollout_percent,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentWire {
    #[serde(default)]
    id: SegmentId,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_rank")]
    rank: i32,
    #[serde(default)]
    rollout_percent: u32,
    #[serde(default)]
    constraints: Vec<Constraint>,
    #[serde(default)]
    distributions: Vec<Distribution>,
}

fn default_rank() -> i32 {
    DEFAULT_SEGMENT_RANK
}

impl From<SegmentWire> for Segment {
    fn from(wire: SegmentWire) -> Segment {
        let accumulated = wire
            .distributions
            .iter()
            .scan(0u32, |acc, distribution| {
                *acc = acc.saturating_add(distribution.percent.saturating_mul(PERCENT_MULTIPLIER));
                Some(*acc)
            })
            .collect();
        Segment {
            id: wire.id,
            description: wire.description,
            rank: wire.rank,
            rollout_percent: wire.rollout_percent,
            constraints: wire.constraints,
            distributions: wire.distributions,
            accumulated,
        }
    }
}

impl From<Segment> for SegmentWire {
    fn from(segment: Segment) -> SegmentWire {
        SegmentWire {
            id: segment.id,
            description: segment.description,
            rank: segment.rank,
            rollout_percent: segment.rollout_percent,
            constraints: segment.constraints,
            distributions: segment.distributions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    #[serde(default)]
    pub id: i64,
    pub property: String,
    pub operator: Operator,
    /// String-encoded comparison value.
    #[serde(default)]
    pub value: String,
}

impl Constraint {
    pub fn new(property: impl Into<String>, operator: Operator, value: impl Into<String>) -> Self {
        Constraint {
            id: 0,
            property: property.into(),
            operator,
            value: value.into(),
        }
    }
}

/// A variant's share of traffic within a segment's rolled-in population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    #[serde(default)]
    pub id: i64,
    #[serde(alias = "variantID")]
    pub variant_id: VariantId,
    #[serde(default)]
    pub variant_key: Option<String>,
    /// 0–100.
    #[serde(default)]
    pub percent: u32,
}

impl Distribution {
    pub fn new(variant_id: VariantId, percent: u32) -> Self {
        Distribution {
            id: 0,
            variant_id,
            variant_key: None,
            percent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    #[serde(default)]
    pub id: VariantId,
    pub key: String,
    #[serde(default)]
    pub attachment: Option<Attachment>,
}

impl Variant {
    pub fn new(id: VariantId, key: impl Into<String>) -> Self {
        Variant {
            id,
            key: key.into(),
            attachment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    #[serde(default)]
    pub id: i64,
    pub value: String,
}

impl Tag {
    pub fn new(value: impl Into<String>) -> Self {
        Tag {
            id: 0,
            value: value.into(),
        }
    }
}
