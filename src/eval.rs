//! Flag evaluation: ordered segment matching followed by consistent-hash rollout.
//!
//! Everything here is a pure function of its inputs. Callers are responsible for picking the flag
//! out of a snapshot.
use serde::{Deserialize, Serialize};

use crate::{
    context::EntityContext,
    model::{Attachment, Flag, FlagId, Segment, SegmentId, VariantId},
    rules::matches_all,
    sharder::{bucket, Crc32Sharder, Sharder},
};

/// Machine-readable outcome of a flag evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    /// A segment matched and rolled the entity in.
    Match,
    /// Flag is disabled.
    FlagDisabled,
    /// Flag has no segments.
    NoSegments,
    /// No segment both matched and rolled the entity in.
    NoMatch,
}

/// One entry of the debug trace. Only populated when debug is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugEntry {
    #[serde(rename = "segmentID")]
    pub segment_id: Option<SegmentId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    #[serde(rename = "flagID")]
    pub flag_id: FlagId,
    pub flag_key: String,
    pub flag_tags: Vec<String>,
    pub flag_snapshot_id: i64,
    /// Segment that produced the assignment, or the last visited one when nothing rolled in.
    #[serde(rename = "segmentID")]
    pub segment_id: Option<SegmentId>,
    /// `None` means "no assignment", which is a valid outcome.
    #[serde(rename = "variantID")]
    pub variant_id: Option<VariantId>,
    pub variant_key: Option<String>,
    pub variant_attachment: Option<Attachment>,
    #[serde(rename = "entityID")]
    pub entity_id: String,
    pub entity_type: Option<String>,
    /// Revision of the snapshot that served the evaluation. Zero when evaluated outside a cache.
    pub revision: u64,
    pub reason: EvaluationReason,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug_log: Vec<DebugEntry>,
}

impl EvaluationResult {
    fn new(flag: &Flag, ctx: &EntityContext, reason: EvaluationReason) -> EvaluationResult {
        EvaluationResult {
            flag_id: flag.id,
            flag_key: flag.key.clone(),
            flag_tags: flag.tags.iter().map(|tag| tag.value.clone()).collect(),
            flag_snapshot_id: flag.snapshot_id,
            segment_id: None,
            variant_id: None,
            variant_key: None,
            variant_attachment: None,
            entity_id: ctx.entity_id.clone(),
            entity_type: ctx
                .entity_type
                .clone()
                .or_else(|| flag.entity_type.clone()),
            revision: 0,
            reason,
            debug_log: Vec::new(),
        }
    }

    /// Returns `true` if a variant was assigned.
    pub fn is_assigned(&self) -> bool {
        self.variant_id.is_some()
    }
}

/// Evaluate `flag` for the entity in `ctx` using the CRC32 sharder.
pub fn evaluate_flag(flag: &Flag, ctx: &EntityContext, debug: bool) -> EvaluationResult {
    evaluate_flag_with_sharder(flag, ctx, debug, &Crc32Sharder)
}

pub fn evaluate_flag_with_sharder(
    flag: &Flag,
    ctx: &EntityContext,
    debug: bool,
    sharder: &impl Sharder,
) -> EvaluationResult {
    if !flag.enabled {
        let mut result = EvaluationResult::new(flag, ctx, EvaluationReason::FlagDisabled);
        if debug {
            result.debug_log.push(DebugEntry {
                segment_id: None,
                message: format!("flagID {} is not enabled", flag.id),
            });
        }
        return result;
    }

    if flag.segments().is_empty() {
        let mut result = EvaluationResult::new(flag, ctx, EvaluationReason::NoSegments);
        if debug {
            result.debug_log.push(DebugEntry {
                segment_id: None,
                message: format!("flagID {} has no segments", flag.id),
            });
        }
        return result;
    }

    let salt = flag.salt();
    let mut result = EvaluationResult::new(flag, ctx, EvaluationReason::NoMatch);

    for segment in flag.segments() {
        result.segment_id = Some(segment.id);

        if !matches_all(&segment.constraints, &ctx.context) {
            if debug {
                result.debug_log.push(DebugEntry {
                    segment_id: Some(segment.id),
                    message: format!("segment_id {} did not match constraints", segment.id),
                });
            }
            continue;
        }

        let rollout = rollout(segment, &salt, &ctx.entity_id, sharder);
        if debug {
            result.debug_log.push(DebugEntry {
                segment_id: Some(segment.id),
                message: format!("matched all constraints. {}", rollout.describe(segment)),
            });
        }

        if let Some(variant_id) = rollout.variant_id {
            result.variant_id = Some(variant_id);
            result.reason = EvaluationReason::Match;
            if let Some(variant) = flag.variant(variant_id) {
                result.variant_key = Some(variant.key.clone());
                result.variant_attachment = variant.attachment.clone();
            } else {
                log::warn!(target: "flagent",
                           flag_key:display = flag.key,
                           segment_id = segment.id,
                           variant_id;
                           "internal: distribution references an unknown variant");
            }
            break;
        }
    }

    log::trace!(target: "flagent",
                flag_key:display = flag.key,
                entity_id:display = ctx.entity_id,
                variant_id:? = result.variant_id;
                "evaluated a flag");

    result
}

/// Outcome of rolling an entity out within a single segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rollout {
    /// `None` when the entity was not eligible for bucketing at all.
    pub bucket: Option<u32>,
    /// Candidate variant, whether or not it passed the rollout gate.
    pub candidate: Option<VariantId>,
    /// Assigned variant. `None` means "not rolled in".
    pub variant_id: Option<VariantId>,
}

impl Rollout {
    const NOT_ELIGIBLE: Rollout = Rollout {
        bucket: None,
        candidate: None,
        variant_id: None,
    };

    fn describe(&self, segment: &Segment) -> String {
        let verdict = if self.variant_id.is_some() {
            "rollout yes"
        } else {
            "rollout no"
        };
        match self.bucket {
            None => format!(
                "{verdict}. not eligible for rollout. RolloutPercent: {}, Distributions: {}",
                segment.rollout_percent,
                segment.distributions().len()
            ),
            Some(bucket) => {
                let variant_ids: Vec<_> = segment
                    .distributions()
                    .iter()
                    .map(|d| d.variant_id)
                    .collect();
                format!(
                    "{verdict}. BucketNum: {bucket}, DistributionArray: {:?}, VariantIDs: {:?}, RolloutPercent: {}",
                    segment.accumulated_percents(),
                    variant_ids,
                    segment.rollout_percent
                )
            }
        }
    }
}

/// Consistent-hash rollout of `entity_id` within `segment`.
///
/// The bucket is `crc32(salt + entity_id) % 1000`. The candidate distribution is the first one whose
/// accumulated percent is `>= bucket + 1` (clamped to the last). The candidate is accepted iff
/// `100 * (bucket - min) <= max(max - min - 1, 0) * rollout_percent`, where `min`/`max` bound the
/// candidate's range. Integer arithmetic only.
pub fn rollout(
    segment: &Segment,
    salt: &str,
    entity_id: &str,
    sharder: &impl Sharder,
) -> Rollout {
    let accumulated = segment.accumulated_percents();
    if entity_id.is_empty() || segment.rollout_percent == 0 || accumulated.is_empty() {
        return Rollout::NOT_ELIGIBLE;
    }

    let bucket_num = bucket(sharder, salt, entity_id);

    let index = accumulated
        .partition_point(|&acc| acc < bucket_num + 1)
        .min(accumulated.len() - 1);

    let min = if index == 0 {
        0
    } else {
        i64::from(accumulated[index - 1])
    };
    let max = i64::from(accumulated[index]);
    let range = (max - min - 1).max(0);

    let candidate = segment.distributions()[index].variant_id;
    let rolled_in =
        100 * (i64::from(bucket_num) - min) <= range * i64::from(segment.rollout_percent);

    Rollout {
        bucket: Some(bucket_num),
        candidate: Some(candidate),
        variant_id: rolled_in.then_some(candidate),
    }
}
