#![forbid(unsafe_code)]
//! Extent primitives and block geometry.
//!
//! The unit of work everywhere in this workspace is the [`Extent`]: a
//! contiguous run of blocks with a position on the device (`physical`)
//! and a position in the loop-file's flat view (`logical`).
//!
//! ## Contents (logical, single file)
//!
//! - **extent**: `Extent` value type and [`ExtentList`], an ordered,
//!   coalescing container keyed by `physical`.
//! - **ranges**: [`RangeSet`], disjoint `[start, end)` intervals with
//!   union, subtraction, intersection and complement.
//! - **geometry**: [`BlockBits`] (log2 block size) and
//!   [`BlockSizeProbe`], which infers the effective block size from a
//!   bitmask accumulated over every extent endpoint.

use rfs_error::{Result, RfsError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Extent ──────────────────────────────────────────────────────────────────

/// A contiguous range of blocks (or bytes, before shifting).
///
/// `physical` is the position on the device, `logical` the position in
/// the loop-file's flat view, `length` the run length. All three share
/// one unit; [`ExtentList::shift_right`] converts bytes to blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub physical: u64,
    pub logical: u64,
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub fn new(physical: u64, logical: u64, length: u64) -> Self {
        Self {
            physical,
            logical,
            length,
        }
    }

    /// One past the last physical unit, or `None` on overflow.
    #[must_use]
    pub fn end_physical(&self) -> Option<u64> {
        self.physical.checked_add(self.length)
    }

    /// One past the last logical unit, or `None` on overflow.
    #[must_use]
    pub fn end_logical(&self) -> Option<u64> {
        self.logical.checked_add(self.length)
    }

    /// True if every endpoint is a multiple of `1 << bits`.
    #[must_use]
    pub fn is_aligned(&self, bits: BlockBits) -> bool {
        let mask = bits.byte_mask();
        (self.physical | self.logical | self.length) & mask == 0
    }

    fn ensure_aligned(&self, bits: BlockBits) -> Result<()> {
        if self.is_aligned(bits) {
            Ok(())
        } else {
            Err(RfsError::Misalignment {
                physical: self.physical,
                logical: self.logical,
                length: self.length,
                block_size: bits.block_size(),
            })
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(physical = {}, logical = {}, length = {})",
            self.physical, self.logical, self.length
        )
    }
}

// ── ExtentList ──────────────────────────────────────────────────────────────

/// Ordered list of non-overlapping extents, keyed by `physical`.
///
/// `insert` keeps the order and coalesces an extent with its neighbors
/// when they are contiguous in both `physical` and `logical`, so a file
/// fragmented into adjacent runs collapses to one extent per run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    extents: Vec<Extent>,
}

impl ExtentList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from extents in arbitrary order.
    #[must_use]
    pub fn from_unsorted(extents: Vec<Extent>) -> Self {
        let mut list = Self::new();
        for extent in extents {
            list.insert(extent);
        }
        list
    }

    /// Positional insert, coalescing with neighbors contiguous in both
    /// `physical` and `logical`. Zero-length extents are dropped.
    pub fn insert(&mut self, extent: Extent) {
        if extent.length == 0 {
            return;
        }
        let at = self
            .extents
            .partition_point(|e| e.physical < extent.physical);

        // Merge into the predecessor when it ends exactly where the new
        // extent starts, in both dimensions.
        if at > 0 {
            let prev = &mut self.extents[at - 1];
            if prev.physical + prev.length == extent.physical
                && prev.logical + prev.length == extent.logical
            {
                prev.length += extent.length;
                // The grown predecessor may now touch its successor.
                if at < self.extents.len() {
                    let next = self.extents[at];
                    let prev = self.extents[at - 1];
                    if prev.physical + prev.length == next.physical
                        && prev.logical + prev.length == next.logical
                    {
                        self.extents[at - 1].length += next.length;
                        self.extents.remove(at);
                    }
                }
                return;
            }
        }

        // Merge into the successor when the new extent ends where it starts.
        if at < self.extents.len() {
            let next = &mut self.extents[at];
            if extent.physical + extent.length == next.physical
                && extent.logical + extent.length == next.logical
            {
                next.physical = extent.physical;
                next.logical = extent.logical;
                next.length += extent.length;
                return;
            }
        }

        self.extents.insert(at, extent);
    }

    /// Sum of extent lengths.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Extent] {
        &self.extents
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Extent> {
        self.extents.iter()
    }

    /// The extents reordered by `logical`.
    #[must_use]
    pub fn sorted_by_logical(&self) -> Vec<Extent> {
        let mut sorted = self.extents.clone();
        sorted.sort_by_key(|e| e.logical);
        sorted
    }

    /// Multiply every field by `1 << bits` (blocks to bytes).
    pub fn shift_left(&mut self, bits: BlockBits) -> Result<()> {
        let shift = u32::from(bits.get());
        for e in &mut self.extents {
            let physical = e
                .physical
                .checked_shl(shift)
                .filter(|v| v >> shift == e.physical);
            let logical = e
                .logical
                .checked_shl(shift)
                .filter(|v| v >> shift == e.logical);
            let length = e
                .length
                .checked_shl(shift)
                .filter(|v| v >> shift == e.length);
            match (physical, logical, length) {
                (Some(p), Some(l), Some(n)) => {
                    e.physical = p;
                    e.logical = l;
                    e.length = n;
                }
                _ => return Err(RfsError::Overflow("extent shift")),
            }
        }
        Ok(())
    }

    /// Divide every field by `1 << bits` (bytes to blocks), rejecting
    /// unaligned endpoints.
    pub fn shift_right(&mut self, bits: BlockBits) -> Result<()> {
        self.ensure_aligned(bits)?;
        let shift = u32::from(bits.get());
        for e in &mut self.extents {
            e.physical >>= shift;
            e.logical >>= shift;
            e.length >>= shift;
        }
        Ok(())
    }

    /// Verify every extent against an inferred block size.
    pub fn ensure_aligned(&self, bits: BlockBits) -> Result<()> {
        for e in &self.extents {
            e.ensure_aligned(bits)?;
        }
        Ok(())
    }

    /// Gaps in the logical view, as identity-mapped extents in block units.
    ///
    /// Walks the extents sorted by `logical` over `[0, total_len)` (byte
    /// units) and emits each uncovered gap as an extent with
    /// `logical == physical`, both shifted right by `bits`. Unioned with
    /// the input, the result tiles `[0, total_len >> bits)` exactly once.
    pub fn complement0_logical_shift(
        &self,
        bits: BlockBits,
        total_len: u64,
    ) -> Result<ExtentList> {
        self.ensure_aligned(bits)?;
        if total_len & bits.byte_mask() != 0 {
            return Err(RfsError::Misalignment {
                physical: 0,
                logical: 0,
                length: total_len,
                block_size: bits.block_size(),
            });
        }
        let shift = u32::from(bits.get());
        let mut holes = ExtentList::new();
        let mut cursor = 0_u64;
        for e in self.sorted_by_logical() {
            if e.logical > cursor {
                let start = cursor >> shift;
                holes.insert(Extent::new(start, start, (e.logical - cursor) >> shift));
            }
            let end = e
                .end_logical()
                .ok_or(RfsError::Overflow("extent logical end"))?;
            cursor = cursor.max(end);
        }
        if total_len > cursor {
            let start = cursor >> shift;
            holes.insert(Extent::new(start, start, (total_len - cursor) >> shift));
        }
        Ok(holes)
    }
}

impl<'a> IntoIterator for &'a ExtentList {
    type Item = &'a Extent;
    type IntoIter = std::slice::Iter<'a, Extent>;

    fn into_iter(self) -> Self::IntoIter {
        self.extents.iter()
    }
}

// ── RangeSet ────────────────────────────────────────────────────────────────

/// Disjoint `[start, end)` intervals over one dimension.
///
/// Used by the planner as the working free set and the storage arena:
/// positions lose their logical pairing once they are free, so a plain
/// interval set is the right shape here, not an [`ExtentList`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // start -> length
    ranges: BTreeMap<u64, u64>,
}

impl RangeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `[start, start + len)` into the set, merging neighbors and
    /// absorbing overlaps.
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + len;

        // Absorb a predecessor that touches or overlaps the new range.
        if let Some((&s, &l)) = self.ranges.range(..=start).next_back() {
            if s + l >= new_start {
                new_start = s;
                new_end = new_end.max(s + l);
                self.ranges.remove(&s);
            }
        }
        // Absorb successors swallowed by or touching the new range.
        let swallowed: Vec<u64> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in swallowed {
            let l = self.ranges.remove(&s).unwrap_or(0);
            new_end = new_end.max(s + l);
        }
        self.ranges.insert(new_start, new_end - new_start);
    }

    /// Subtract `[start, start + len)` from the set.
    pub fn remove(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = start + len;
        let affected: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .filter(|&(&s, &l)| s + l > start)
            .map(|(&s, &l)| (s, l))
            .collect();
        for (s, l) in affected {
            self.ranges.remove(&s);
            if s < start {
                self.ranges.insert(s, start - s);
            }
            if s + l > end {
                self.ranges.insert(end, s + l - end);
            }
        }
    }

    /// True if `[start, start + len)` lies entirely inside one range.
    #[must_use]
    pub fn covers(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        self.ranges
            .range(..=start)
            .next_back()
            .is_some_and(|(&s, &l)| start >= s && start + len <= s + l)
    }

    /// Set intersection.
    #[must_use]
    pub fn intersect(&self, other: &RangeSet) -> RangeSet {
        let mut out = RangeSet::new();
        for (&s, &l) in &self.ranges {
            let end = s + l;
            for (&os, &ol) in other.ranges.range(..end) {
                let oend = os + ol;
                let lo = s.max(os);
                let hi = end.min(oend);
                if lo < hi {
                    out.insert(lo, hi - lo);
                }
            }
        }
        out
    }

    /// Complement within `[0, total)`.
    #[must_use]
    pub fn complement(&self, total: u64) -> RangeSet {
        let mut out = RangeSet::new();
        let mut cursor = 0_u64;
        for (&s, &l) in &self.ranges {
            if s > cursor {
                out.insert(cursor, s - cursor);
            }
            cursor = s + l;
        }
        if total > cursor {
            out.insert(cursor, total - cursor);
        }
        out
    }

    /// Length of the contiguous run that would contain
    /// `[start, start + len)` after inserting it.
    #[must_use]
    pub fn merged_run_len_if_added(&self, start: u64, len: u64) -> u64 {
        let mut run_start = start;
        let mut run_end = start + len;
        if let Some((&s, &l)) = self.ranges.range(..=start).next_back() {
            if s + l >= start {
                run_start = s;
                run_end = run_end.max(s + l);
            }
        }
        for (&s, &l) in self.ranges.range(start..) {
            if s > run_end {
                break;
            }
            run_end = run_end.max(s + l);
        }
        run_end - run_start
    }

    /// The largest range; ties broken by lowest start.
    #[must_use]
    pub fn largest_range(&self) -> Option<(u64, u64)> {
        self.ranges
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&s, &l)| (s, l))
    }

    /// Sum of range lengths.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.ranges.values().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&s, &l)| (s, l))
    }
}

impl FromIterator<(u64, u64)> for RangeSet {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for (start, len) in iter {
            set.insert(start, len);
        }
        set
    }
}

// ── Block geometry ──────────────────────────────────────────────────────────

/// Largest supported block-size exponent (1 GiB blocks).
pub const MAX_BLOCK_BITS: u8 = 30;

/// log2 of the effective block size. Zero means byte-granular.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockBits(u8);

impl BlockBits {
    /// Byte granularity (block size 1).
    pub const BYTE: Self = Self(0);

    /// Create from an exponent in `0..=30`.
    pub fn new(bits: u8) -> Result<Self> {
        if bits > MAX_BLOCK_BITS {
            return Err(RfsError::Overflow("block size exponent"));
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// The block size in bytes.
    #[must_use]
    pub fn block_size(self) -> u64 {
        1_u64 << self.0
    }

    /// Mask of the intra-block byte offset bits.
    #[must_use]
    pub fn byte_mask(self) -> u64 {
        self.block_size() - 1
    }

    /// Convert an aligned byte count to blocks.
    #[must_use]
    pub fn to_blocks(self, bytes: u64) -> u64 {
        bytes >> self.0
    }

    /// Convert a block count to bytes, or `None` on overflow.
    #[must_use]
    pub fn to_bytes(self, blocks: u64) -> Option<u64> {
        let bytes = blocks << self.0;
        (bytes >> self.0 == blocks).then_some(bytes)
    }
}

impl fmt::Display for BlockBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.block_size())
    }
}

/// Infers the effective block size from extent endpoints.
///
/// Every `physical`, `logical` and `length`, plus the device length, is
/// OR-ed into one bitmask; the effective block size is the largest power
/// of two dividing all of them, i.e. the lowest set bit.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockSizeProbe {
    bitmask: u64,
}

impl BlockSizeProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a bitmask accumulated elsewhere (e.g. a save file).
    #[must_use]
    pub fn from_bitmask(bitmask: u64) -> Self {
        Self { bitmask }
    }

    pub fn accumulate_value(&mut self, value: u64) {
        self.bitmask |= value;
    }

    pub fn accumulate_extent(&mut self, extent: &Extent) {
        self.bitmask |= extent.physical | extent.logical | extent.length;
    }

    pub fn accumulate_list(&mut self, list: &ExtentList) {
        for e in list {
            self.accumulate_extent(e);
        }
    }

    #[must_use]
    pub fn bitmask(&self) -> u64 {
        self.bitmask
    }

    /// The inferred block-size exponent, or `None` when nothing was
    /// accumulated (empty device: the run is a no-op).
    #[must_use]
    pub fn finish(&self) -> Option<BlockBits> {
        if self.bitmask == 0 {
            return None;
        }
        let bits = self.bitmask.trailing_zeros() as u8;
        Some(BlockBits(bits.min(MAX_BLOCK_BITS)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
