//! Per-file storage of region lists.
//!
//! `RegionStore` maps `(file, kind)` to a `RegionList`. Lists are shared
//! snapshots (`Arc`), so readers keep a list alive without holding the lock
//! that guards the store, and installing a new list is a pointer swap.

use std::collections::HashMap;
use std::ops::{Deref, Range};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::projector::{EditEvent, project};
use super::{Region, RegionKind, is_sorted_non_overlapping};

const LOG_TARGET: &str = "annocache::store";

/// Sorted, non-overlapping regions of one kind for one file.
#[derive(Debug, Clone, Default)]
pub struct RegionList(Arc<Vec<Region>>);

impl RegionList {
    /// Build a list from engine data.
    ///
    /// Zero-length regions are discarded. Returns `None` if a region lies
    /// past [`MAX_OFFSET`](super::MAX_OFFSET) or the remaining regions are not sorted ascending
    /// and non-overlapping.
    pub fn from_engine(mut regions: Vec<Region>) -> Option<Self> {
        regions.retain(|region| region.length() > 0);
        if !regions.iter().all(Region::in_bounds) || !is_sorted_non_overlapping(&regions) {
            return None;
        }
        Some(Self(Arc::new(regions)))
    }

    fn from_projected(regions: Vec<Region>) -> Self {
        Self(Arc::new(regions))
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.0
    }

    /// Exact-match lookup: the region starting at `offset` whose length is
    /// exactly `length`.
    ///
    /// A region starting at `offset` with a different length is treated as
    /// absent, as is any region merely overlapping `offset`.
    pub fn lookup_at(&self, offset: usize, length: usize) -> Option<&Region> {
        let index = self
            .0
            .binary_search_by_key(&offset, Region::offset)
            .ok()?;
        let region = &self.0[index];
        (region.length() == length).then_some(region)
    }

    /// All regions fully contained in `range`, ascending by offset.
    pub fn range_scan(&self, range: Range<usize>) -> RangeScan<'_> {
        let start = self.0.partition_point(|region| region.offset() < range.start);
        RangeScan {
            regions: &self.0[start..],
            end: range.end,
        }
    }

    fn same_list(&self, other: &RegionList) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Deref for RegionList {
    type Target = [Region];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for RegionList {
    fn eq(&self, other: &Self) -> bool {
        self.same_list(other)
    }
}

impl Eq for RegionList {}

/// Lazy scan over the regions of a list that lie inside a range.
///
/// The scan holds no state beyond its position; calling `range_scan` again
/// starts over.
#[derive(Debug, Clone)]
pub struct RangeScan<'a> {
    regions: &'a [Region],
    end: usize,
}

impl<'a> Iterator for RangeScan<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        // Sorted and non-overlapping: the first region sticking out of the
        // range ends the scan.
        let (first, rest) = self.regions.split_first()?;
        if first.end() > self.end {
            self.regions = &[];
            return None;
        }
        self.regions = rest;
        Some(first)
    }
}

#[derive(Debug, Default)]
struct FileRegions {
    lists: [RegionList; 5],
}

impl FileRegions {
    fn is_empty(&self) -> bool {
        self.lists.iter().all(|list| list.is_empty())
    }
}

/// Region lists for every file with engine data.
#[derive(Debug, Default)]
pub struct RegionStore {
    files: HashMap<PathBuf, FileRegions>,
}

impl RegionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `regions` for `(file, kind)`, replacing any previous list.
    ///
    /// Returns `false` if the new list equals the installed one.
    pub fn replace(&mut self, file: &Path, kind: RegionKind, regions: RegionList) -> bool {
        let entry = self.files.entry(file.to_path_buf()).or_default();
        let slot = &mut entry.lists[kind.index()];
        if *slot == regions {
            return false;
        }
        log::debug!(
            target: LOG_TARGET,
            "Installed {} {} regions for {}",
            regions.len(),
            kind,
            file.display()
        );
        *slot = regions;
        true
    }

    /// The list for `(file, kind)`, empty if there is none.
    pub fn get(&self, file: &Path, kind: RegionKind) -> RegionList {
        self.files
            .get(file)
            .map(|regions| regions.lists[kind.index()].clone())
            .unwrap_or_default()
    }

    /// Drop every kind of data for `file`.
    pub fn remove_file(&mut self, file: &Path) -> bool {
        self.files.remove(file).is_some()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn lookup_at(
        &self,
        file: &Path,
        kind: RegionKind,
        offset: usize,
        length: usize,
    ) -> Option<Region> {
        self.files
            .get(file)?
            .lists[kind.index()]
            .lookup_at(offset, length)
            .cloned()
    }

    pub fn range_scan(&self, file: &Path, kind: RegionKind, range: Range<usize>) -> RangeScan<'_> {
        match self.files.get(file) {
            Some(regions) => regions.lists[kind.index()].range_scan(range),
            None => RangeScan {
                regions: &[],
                end: range.end,
            },
        }
    }

    /// Project every list of `edit.file` across the edit, each kind with its
    /// own policy. Returns true if anything changed.
    pub fn apply_edit(&mut self, edit: &EditEvent) -> bool {
        let Some(file_regions) = self.files.get_mut(&edit.file) else {
            return false;
        };

        let mut changed = false;
        for kind in RegionKind::ALL {
            let slot = &mut file_regions.lists[kind.index()];
            if slot.is_empty() {
                continue;
            }
            let projection = project(slot.as_slice(), edit, kind.projection_policy());
            if projection.changed {
                *slot = RegionList::from_projected(projection.regions);
                changed = true;
            }
        }

        if file_regions.is_empty() {
            log::trace!(
                target: LOG_TARGET,
                "All regions of {} removed by edit",
                edit.file.display()
            );
        }
        changed
    }

    /// Files with at least one stored list (possibly empty).
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> PathBuf {
        PathBuf::from("/work/a.txt")
    }

    fn list(spans: &[(usize, usize)]) -> RegionList {
        RegionList::from_engine(
            spans
                .iter()
                .map(|&(offset, length)| Region::highlight(offset, length, "KEYWORD"))
                .collect(),
        )
        .unwrap()
    }

    fn spans(regions: &[Region]) -> Vec<(usize, usize)> {
        regions.iter().map(|r| (r.offset(), r.length())).collect()
    }

    #[test]
    fn get_missing_is_empty() {
        let store = RegionStore::new();
        assert!(store.get(&file(), RegionKind::Highlight).is_empty());
    }

    #[test]
    fn replace_installs_and_reports_change() {
        let mut store = RegionStore::new();
        assert!(store.replace(&file(), RegionKind::Highlight, list(&[(0, 4), (10, 3)])));
        assert_eq!(
            spans(&store.get(&file(), RegionKind::Highlight)),
            vec![(0, 4), (10, 3)]
        );
        assert!(store.get(&file(), RegionKind::Navigation).is_empty());
    }

    #[test]
    fn identical_replace_is_a_no_op() {
        let mut store = RegionStore::new();
        store.replace(&file(), RegionKind::Highlight, list(&[(0, 4)]));
        assert!(!store.replace(&file(), RegionKind::Highlight, list(&[(0, 4)])));
        assert_eq!(spans(&store.get(&file(), RegionKind::Highlight)), vec![(0, 4)]);
    }

    #[test]
    fn from_engine_drops_zero_length_regions() {
        let regions = list(&[(0, 0), (1, 2), (5, 0)]);
        assert_eq!(spans(&regions), vec![(1, 2)]);
    }

    #[test]
    fn from_engine_rejects_overlapping_regions() {
        let regions = vec![
            Region::highlight(0, 5, "A"),
            Region::highlight(3, 5, "B"),
        ];
        assert!(RegionList::from_engine(regions).is_none());
    }

    #[test]
    fn from_engine_rejects_overflowing_regions() {
        let regions = vec![
            Region::highlight(usize::MAX, 1, "A"),
            Region::highlight(0, 1, "B"),
        ];
        assert!(RegionList::from_engine(regions).is_none());

        let regions = vec![Region::highlight(crate::region::MAX_OFFSET, 1, "A")];
        assert!(RegionList::from_engine(regions).is_none());
    }

    #[test]
    fn remove_file_drops_all_kinds() {
        let mut store = RegionStore::new();
        store.replace(&file(), RegionKind::Highlight, list(&[(0, 4)]));
        store.replace(&file(), RegionKind::Override, list(&[(6, 2)]));

        assert!(store.remove_file(&file()));
        for kind in RegionKind::ALL {
            assert!(store.get(&file(), kind).is_empty());
        }
        assert!(!store.remove_file(&file()));
    }

    #[test]
    fn lookup_requires_exact_offset_and_length() {
        let mut store = RegionStore::new();
        store.replace(&file(), RegionKind::Navigation, list(&[(0, 4), (10, 6)]));

        let found = store.lookup_at(&file(), RegionKind::Navigation, 10, 6);
        assert_eq!(found.map(|r| (r.offset(), r.length())), Some((10, 6)));

        // same start, different shape
        assert!(store.lookup_at(&file(), RegionKind::Navigation, 10, 3).is_none());
        // overlapping point inside a region
        assert!(store.lookup_at(&file(), RegionKind::Navigation, 12, 2).is_none());
        // nothing there
        assert!(store.lookup_at(&file(), RegionKind::Navigation, 5, 1).is_none());
        assert!(store.lookup_at(&file(), RegionKind::Highlight, 10, 6).is_none());
    }

    #[test]
    fn range_scan_yields_contained_regions_in_order() {
        let regions = list(&[(0, 2), (3, 2), (6, 2), (9, 4), (14, 1)]);

        let found: Vec<_> = regions.range_scan(3..13).map(|r| r.offset()).collect();
        assert_eq!(found, vec![3, 6, 9]);

        // a region crossing the range start is not contained
        let found: Vec<_> = regions.range_scan(1..8).map(|r| r.offset()).collect();
        assert_eq!(found, vec![3, 6]);

        // a region crossing the range end stops the scan
        let found: Vec<_> = regions.range_scan(6..12).map(|r| r.offset()).collect();
        assert_eq!(found, vec![6]);
    }

    #[test]
    fn range_scan_tolerates_empty_results() {
        let regions = list(&[(0, 2), (10, 2)]);
        assert_eq!(regions.range_scan(3..9).count(), 0);
        assert_eq!(regions.range_scan(20..30).count(), 0);
        assert_eq!(RegionList::default().range_scan(0..100).count(), 0);

        let store = RegionStore::new();
        assert_eq!(
            store
                .range_scan(&file(), RegionKind::Highlight, 0..100)
                .count(),
            0
        );
    }

    #[test]
    fn range_scan_is_restartable() {
        let regions = list(&[(0, 2), (3, 2)]);
        let first: Vec<_> = regions.range_scan(0..10).map(|r| r.offset()).collect();
        let second: Vec<_> = regions.range_scan(0..10).map(|r| r.offset()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn snapshots_survive_replacement() {
        let mut store = RegionStore::new();
        store.replace(&file(), RegionKind::Highlight, list(&[(0, 4)]));
        let snapshot = store.get(&file(), RegionKind::Highlight);

        store.replace(&file(), RegionKind::Highlight, list(&[(8, 1)]));
        assert_eq!(spans(&snapshot), vec![(0, 4)]);
    }

    #[test]
    fn apply_edit_uses_kind_policies() {
        let mut store = RegionStore::new();
        store.replace(&file(), RegionKind::Highlight, list(&[(10, 5)]));
        store.replace(
            &file(),
            RegionKind::ImplementedMember,
            RegionList::from_engine(vec![Region::implemented(10, 5)]).unwrap(),
        );

        assert!(store.apply_edit(&EditEvent::insertion(file(), 12, 3)));
        assert_eq!(spans(&store.get(&file(), RegionKind::Highlight)), vec![(10, 8)]);
        assert!(store.get(&file(), RegionKind::ImplementedMember).is_empty());
    }

    #[test]
    fn apply_edit_on_unknown_file_changes_nothing() {
        let mut store = RegionStore::new();
        assert!(!store.apply_edit(&EditEvent::insertion(file(), 0, 3)));
    }
}
