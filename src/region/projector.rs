//! Local projection of stored regions across a text edit.
//!
//! The engine only sees buffer content when it is synced, so between syncs
//! the cached regions are moved along with local edits. Each edit produces a
//! fresh list; the input list is never mutated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{MAX_OFFSET, NavigationTarget, Region, RegionPayload, is_sorted_non_overlapping};

const LOG_TARGET: &str = "annocache::projector";

/// A single contiguous replace operation in a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEvent {
    pub file: PathBuf,
    pub offset: usize,
    pub old_length: usize,
    pub new_length: usize,
}

impl EditEvent {
    pub fn new(file: impl Into<PathBuf>, offset: usize, old_length: usize, new_length: usize) -> Self {
        Self {
            file: file.into(),
            offset,
            old_length,
            new_length,
        }
    }

    pub fn insertion(file: impl Into<PathBuf>, offset: usize, length: usize) -> Self {
        Self::new(file, offset, 0, length)
    }

    pub fn deletion(file: impl Into<PathBuf>, offset: usize, length: usize) -> Self {
        Self::new(file, offset, length, 0)
    }

    /// `new_length - old_length`, or `None` if a length exceeds `i64`.
    pub fn delta(&self) -> Option<i64> {
        let new_length = i64::try_from(self.new_length).ok()?;
        let old_length = i64::try_from(self.old_length).ok()?;
        new_length.checked_sub(old_length)
    }
}

/// How a region reacts to an edit that lands inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionPolicy {
    /// Grow on insertion strictly inside, shrink on deletion contained in
    /// the region.
    ShiftAndResize,
    /// Drop the region once the edit touches its interior.
    ShiftOrDelete,
}

/// Result of projecting a region list across one edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub regions: Vec<Region>,
    /// True if any region moved, resized, vanished, or had a target moved.
    pub changed: bool,
}

enum SpanOutcome {
    Keep,
    Move { offset: i64, length: i64 },
    Delete,
}

/// Project `regions` (sorted, non-overlapping) across `edit`.
///
/// Only the size difference of the edit matters: an insertion of `delta`
/// characters at `edit.offset`, or a deletion of `[offset, offset - delta)`.
/// Same-length replacements leave regions where they are.
///
/// Navigation targets pointing into `edit.file` are moved too, whether or
/// not their region survives.
pub fn project(regions: &[Region], edit: &EditEvent, policy: ProjectionPolicy) -> Projection {
    let (Some(delta), Ok(at)) = (edit.delta(), i64::try_from(edit.offset)) else {
        log::warn!(
            target: LOG_TARGET,
            "Ignoring edit at {} ({} -> {}) in {}: offsets out of range",
            edit.offset,
            edit.old_length,
            edit.new_length,
            edit.file.display()
        );
        return Projection {
            regions: regions.to_vec(),
            changed: false,
        };
    };
    if delta == 0 || regions.is_empty() {
        return Projection {
            regions: regions.to_vec(),
            changed: false,
        };
    }

    let mut projected = Vec::with_capacity(regions.len());
    let mut changed = false;

    for region in regions {
        let (region, retargeted) = match project_targets(region, &edit.file, edit.offset, delta) {
            Some(updated) => (updated, true),
            None => (region.clone(), false),
        };
        changed |= retargeted;

        match project_span(&region, at, delta, policy) {
            SpanOutcome::Keep => projected.push(region),
            SpanOutcome::Move { offset, length } => {
                changed = true;
                let Some((new_offset, new_length)) = checked_span(offset, length) else {
                    log::warn!(
                        target: LOG_TARGET,
                        "Dropping region {}+{} projected to {}+{} by edit at {} (delta {})",
                        region.offset(),
                        region.length(),
                        offset,
                        length,
                        edit.offset,
                        delta
                    );
                    continue;
                };
                projected.push(region.with_span(new_offset, new_length));
            }
            SpanOutcome::Delete => {
                changed = true;
                log::trace!(
                    target: LOG_TARGET,
                    "Deleted region {}+{} touched by edit at {} (delta {})",
                    region.offset(),
                    region.length(),
                    edit.offset,
                    delta
                );
            }
        }
    }

    debug_assert!(is_sorted_non_overlapping(&projected));

    Projection {
        regions: projected,
        changed,
    }
}

/// A region whose projected span does not fit in `i64` is deleted.
fn project_span(region: &Region, at: i64, delta: i64, policy: ProjectionPolicy) -> SpanOutcome {
    span_outcome(region, at, delta, policy).unwrap_or(SpanOutcome::Delete)
}

fn span_outcome(
    region: &Region,
    at: i64,
    delta: i64,
    policy: ProjectionPolicy,
) -> Option<SpanOutcome> {
    let start = i64::try_from(region.offset()).ok()?;
    let length = i64::try_from(region.length()).ok()?;
    let end = start.checked_add(length)?;

    if delta > 0 {
        if at <= start {
            return Some(SpanOutcome::Move {
                offset: start.checked_add(delta)?,
                length,
            });
        }
        if at < end {
            return Some(match policy {
                ProjectionPolicy::ShiftAndResize => SpanOutcome::Move {
                    offset: start,
                    length: length.checked_add(delta)?,
                },
                ProjectionPolicy::ShiftOrDelete => SpanOutcome::Delete,
            });
        }
        return Some(SpanOutcome::Keep);
    }

    let removed = delta.checked_neg()?;
    let right = at.checked_add(removed)?;
    if right <= start {
        return Some(SpanOutcome::Move {
            offset: start + delta,
            length,
        });
    }
    if policy == ProjectionPolicy::ShiftAndResize && start <= at && right <= end && length != removed
    {
        return Some(SpanOutcome::Move {
            offset: start,
            length: length + delta,
        });
    }
    if at < end {
        return Some(SpanOutcome::Delete);
    }
    Some(SpanOutcome::Keep)
}

/// Converts a projected span back to offsets, or `None` if it is empty,
/// starts before zero or ends past [`MAX_OFFSET`].
fn checked_span(offset: i64, length: i64) -> Option<(usize, usize)> {
    let offset = usize::try_from(offset).ok()?;
    let length = usize::try_from(length).ok().filter(|&length| length > 0)?;
    offset
        .checked_add(length)
        .filter(|&end| end <= MAX_OFFSET)
        .map(|_| (offset, length))
}

/// Returns the region with moved targets, or `None` if no target points at
/// or after the edit in the edited file.
fn project_targets(region: &Region, file: &Path, at: usize, delta: i64) -> Option<Region> {
    let targets = region.targets();
    if !targets
        .iter()
        .any(|target| target.file == file && target.offset >= at)
    {
        return None;
    }

    let moved: Vec<NavigationTarget> = targets
        .iter()
        .map(|target| {
            if target.file != file {
                return target.clone();
            }
            NavigationTarget {
                offset: project_point(target.offset, at, delta),
                ..target.clone()
            }
        })
        .collect();

    if moved.as_slice() == targets {
        return None;
    }
    Some(
        region
            .clone()
            .with_payload(RegionPayload::Navigation { targets: moved }),
    )
}

/// A point at or after an insertion moves right; a point inside a deleted
/// range collapses onto the deletion start.
fn project_point(point: usize, at: usize, delta: i64) -> usize {
    if point < at {
        return point;
    }
    let magnitude = usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX);
    if delta > 0 {
        return point.saturating_add(magnitude).min(MAX_OFFSET);
    }
    let removed = magnitude;
    if point >= at.saturating_add(removed) {
        point - removed
    } else {
        at
    }
}
