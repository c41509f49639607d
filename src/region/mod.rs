//! Offset-based annotation regions computed by the analysis engine.
//!
//! A region is an `offset + length` span tagged with a kind-specific payload.
//! Regions are immutable; edits produce new regions via the projector.

mod projector;
mod store;

pub use projector::{EditEvent, Projection, ProjectionPolicy, project};
pub use store::{RangeScan, RegionList, RegionStore};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Largest offset a region or target may reach. Projection works on signed
/// offsets, so anything past `i64::MAX` is rejected up front.
pub const MAX_OFFSET: usize = i64::MAX as usize;

/// The five kinds of region data kept per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionKind {
    Highlight,
    Navigation,
    Override,
    ImplementedClass,
    ImplementedMember,
}

impl RegionKind {
    pub const ALL: [RegionKind; 5] = [
        RegionKind::Highlight,
        RegionKind::Navigation,
        RegionKind::Override,
        RegionKind::ImplementedClass,
        RegionKind::ImplementedMember,
    ];

    /// Highlights stretch with typing inside them; everything else is
    /// dropped once an edit lands inside it.
    pub fn projection_policy(self) -> ProjectionPolicy {
        match self {
            RegionKind::Highlight => ProjectionPolicy::ShiftAndResize,
            RegionKind::Navigation
            | RegionKind::Override
            | RegionKind::ImplementedClass
            | RegionKind::ImplementedMember => ProjectionPolicy::ShiftOrDelete,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegionKind::Highlight => "highlight",
            RegionKind::Navigation => "navigation",
            RegionKind::Override => "override",
            RegionKind::ImplementedClass => "implemented_class",
            RegionKind::ImplementedMember => "implemented_member",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A jump target of a navigation region.
///
/// `offset` points into `file`, which is not necessarily the file holding
/// the region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationTarget {
    pub file: PathBuf,
    pub offset: usize,
    pub kind: String,
}

/// A member that an override region overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverriddenMember {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_name: Option<String>,
}

/// Kind-specific data attached to a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionPayload {
    Highlight {
        highlight_type: String,
    },
    Navigation {
        targets: Vec<NavigationTarget>,
    },
    Override {
        superclass_member: Option<OverriddenMember>,
        interface_members: Vec<OverriddenMember>,
    },
    Implemented,
}

/// An annotation span with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    offset: usize,
    length: usize,
    payload: RegionPayload,
}

impl Region {
    pub fn new(offset: usize, length: usize, payload: RegionPayload) -> Self {
        Self {
            offset,
            length,
            payload,
        }
    }

    pub fn highlight(offset: usize, length: usize, highlight_type: impl Into<String>) -> Self {
        Self::new(
            offset,
            length,
            RegionPayload::Highlight {
                highlight_type: highlight_type.into(),
            },
        )
    }

    pub fn navigation(offset: usize, length: usize, targets: Vec<NavigationTarget>) -> Self {
        Self::new(offset, length, RegionPayload::Navigation { targets })
    }

    pub fn implemented(offset: usize, length: usize) -> Self {
        Self::new(offset, length, RegionPayload::Implemented)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Exclusive end offset, saturating at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.length)
    }

    /// True if the span and every target lie within [`MAX_OFFSET`].
    pub fn in_bounds(&self) -> bool {
        self.offset
            .checked_add(self.length)
            .is_some_and(|end| end <= MAX_OFFSET)
            && self.targets().iter().all(|target| target.offset <= MAX_OFFSET)
    }

    pub fn payload(&self) -> &RegionPayload {
        &self.payload
    }

    /// Navigation targets, empty for other payloads.
    pub fn targets(&self) -> &[NavigationTarget] {
        match &self.payload {
            RegionPayload::Navigation { targets } => targets,
            _ => &[],
        }
    }

    pub(crate) fn with_span(&self, offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            payload: self.payload.clone(),
        }
    }

    pub(crate) fn with_payload(mut self, payload: RegionPayload) -> Self {
        self.payload = payload;
        self
    }
}

/// Returns true if `regions` is ascending by offset with no two regions
/// overlapping.
pub fn is_sorted_non_overlapping(regions: &[Region]) -> bool {
    regions.windows(2).all(|pair| pair[0].end() <= pair[1].offset)
}
