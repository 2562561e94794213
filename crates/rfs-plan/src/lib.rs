#![forbid(unsafe_code)]
//! The move planner.
//!
//! Given the loop-file extents, the free-space extents and the device
//! length, produce an ordered list of copy operations that relocates
//! every loop-file block to its logical position, staging through a
//! bounded storage area when a destination is still occupied.
//!
//! The planner works in block units internally and emits byte units.
//! It is deterministic: the same inputs (including a resumed storage
//! selection) always produce the same plan, which is what lets an
//! interrupted job recompute its plan from the persisted extent files
//! and skip the steps already executed.

use rfs_error::{Result, RfsError};
use rfs_types::{BlockBits, Extent, ExtentList, RangeSet};
use serde::Serialize;
use tracing::{debug, info, trace};

// ── Plan model ──────────────────────────────────────────────────────────────

/// Where a step's source and destination live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MoveKind {
    /// Device range to device range through a bounce buffer.
    DevToDev,
    /// Device range into the storage window (`dst` is a window offset).
    DevToStorage,
    /// Storage window back onto the device (`src` is a window offset).
    StorageToDev,
}

/// One atomic transfer, byte units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MoveStep {
    pub kind: MoveKind,
    pub src: u64,
    pub dst: u64,
    pub length: u64,
}

/// The ordered move plan plus the storage split that backs it.
#[derive(Debug, Clone, Serialize)]
pub struct MovePlan {
    pub block_bits: BlockBits,
    pub steps: Vec<MoveStep>,
    /// In-device storage extents, byte units, identity mapped.
    pub primary_storage: ExtentList,
    /// Scratch file size in bytes.
    pub secondary_len: u64,
}

impl MovePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Total staging bytes (primary + secondary).
    #[must_use]
    pub fn storage_total(&self) -> u64 {
        self.primary_storage.total_length() + self.secondary_len
    }
}

/// Planner input. All byte units.
#[derive(Debug)]
pub struct PlanRequest<'a> {
    pub loop_extents: &'a ExtentList,
    pub free_extents: &'a ExtentList,
    pub device_length: u64,
    pub block_bits: BlockBits,
    /// Upper bound on staging bytes the user is willing to spend.
    pub requested_storage: u64,
    /// Alignment (bytes) required of primary storage offsets, normally
    /// the host page size.
    pub storage_alignment: u64,
    /// Resume: the exact storage split persisted by the original run.
    pub fixed_storage: Option<(ExtentList, u64)>,
}

// ── Internal state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Src {
    Dev(u64),
    Storage(u64),
}

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    src: Src,
    logical: u64,
    length: u64,
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Compute the move plan. See the module docs for the strategy.
pub fn plan(req: &PlanRequest<'_>) -> Result<MovePlan> {
    let bits = req.block_bits;
    validate(req)?;

    let mut loop_blocks = req.loop_extents.clone();
    loop_blocks.shift_right(bits)?;
    let mut free_blocks = req.free_extents.clone();
    free_blocks.shift_right(bits)?;
    let device_blocks = bits.to_blocks(req.device_length);

    check_geometry(&loop_blocks, &free_blocks, device_blocks)?;

    // Working free set and the union of final destinations.
    let mut free: RangeSet = free_blocks.iter().map(|e| (e.physical, e.length)).collect();
    let dst_all: RangeSet = loop_blocks.iter().map(|e| (e.logical, e.length)).collect();

    let mut pending: Vec<PendingMove> = loop_blocks
        .iter()
        .filter(|e| e.physical != e.logical)
        .map(|e| PendingMove {
            src: Src::Dev(e.physical),
            logical: e.logical,
            length: e.length,
        })
        .collect();
    pending.sort_by_key(|p| p.logical);

    let conflict_total: u64 = pending
        .iter()
        .filter(|p| !free.covers(p.logical, p.length))
        .map(|p| p.length)
        .sum();

    // Storage split: resumed jobs reuse the persisted selection so the
    // recomputed plan matches the one already partially executed.
    let (primary, secondary_blocks) = match &req.fixed_storage {
        Some((list, secondary_len)) => {
            let mut list = list.clone();
            list.shift_right(bits)?;
            (list, bits.to_blocks(*secondary_len))
        }
        None => {
            let budget = bits.to_blocks(req.requested_storage).min(conflict_total);
            let align_blocks = (req.storage_alignment >> bits.get()).max(1);
            select_storage(&free, &dst_all, budget, align_blocks)
        }
    };

    for e in &primary {
        free.remove(e.physical, e.length);
    }
    let storage_total = primary.total_length() + secondary_blocks;
    let mut storage_free = RangeSet::new();
    storage_free.insert(0, storage_total);

    debug!(
        target: "rfs::plan",
        pending = pending.len(),
        conflict_blocks = conflict_total,
        primary_blocks = primary.total_length(),
        secondary_blocks,
        "planning"
    );

    let mut steps = Vec::new();
    while !pending.is_empty() {
        if let Some(index) = best_placeable(&pending, &free, &storage_free) {
            let done = pending.remove(index);
            free.remove(done.logical, done.length);
            let kind = match done.src {
                Src::Dev(physical) => {
                    free.insert(physical, done.length);
                    MoveKind::DevToDev
                }
                Src::Storage(offset) => {
                    storage_free.insert(offset, done.length);
                    MoveKind::StorageToDev
                }
            };
            let src = match done.src {
                Src::Dev(v) | Src::Storage(v) => v,
            };
            trace!(target: "rfs::plan", ?kind, src, dst = done.logical, length = done.length, "place");
            steps.push(MoveStep {
                kind,
                src,
                dst: done.logical,
                length: done.length,
            });
            continue;
        }

        // No destination is entirely free. A destination may still be
        // partially free: place that piece now and keep the rest
        // pending. This is what keeps scarce-storage jobs moving.
        if place_partial(&mut pending, &mut free, &mut storage_free, &mut steps) {
            continue;
        }

        // Nothing placeable at all: stage the lowest-logical
        // device-sourced extent (or as much of it as fits) into storage.
        let Some(index) = pending
            .iter()
            .position(|p| matches!(p.src, Src::Dev(_)))
        else {
            return Err(stall(&pending, bits));
        };
        let Some((run_start, run_len)) = storage_free.largest_range() else {
            return Err(stall(&pending, bits));
        };
        let victim = pending[index];
        let Src::Dev(physical) = victim.src else {
            unreachable!("position() selected a device source");
        };
        let staged_len = run_len.min(victim.length);
        trace!(
            target: "rfs::plan",
            src = physical,
            storage_offset = run_start,
            length = staged_len,
            "stage"
        );
        steps.push(MoveStep {
            kind: MoveKind::DevToStorage,
            src: physical,
            dst: run_start,
            length: staged_len,
        });
        storage_free.remove(run_start, staged_len);
        free.insert(physical, staged_len);
        pending[index] = PendingMove {
            src: Src::Storage(run_start),
            logical: victim.logical,
            length: staged_len,
        };
        if victim.length > staged_len {
            pending.insert(
                index + 1,
                PendingMove {
                    src: Src::Dev(physical + staged_len),
                    logical: victim.logical + staged_len,
                    length: victim.length - staged_len,
                },
            );
        }
    }

    let mut primary_bytes = primary;
    primary_bytes.shift_left(bits)?;
    let secondary_len = bits
        .to_bytes(secondary_blocks)
        .ok_or(RfsError::Overflow("secondary storage length"))?;
    let steps = shift_steps(steps, bits)?;

    info!(
        target: "rfs::plan",
        steps = steps.len(),
        primary_bytes = primary_bytes.total_length(),
        secondary_bytes = secondary_len,
        "plan ready"
    );
    Ok(MovePlan {
        block_bits: bits,
        steps,
        primary_storage: primary_bytes,
        secondary_len,
    })
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn validate(req: &PlanRequest<'_>) -> Result<()> {
    let bits = req.block_bits;
    req.loop_extents.ensure_aligned(bits)?;
    req.free_extents.ensure_aligned(bits)?;
    if req.device_length & bits.byte_mask() != 0 {
        return Err(RfsError::Misalignment {
            physical: 0,
            logical: 0,
            length: req.device_length,
            block_size: bits.block_size(),
        });
    }
    if let Some((list, secondary_len)) = &req.fixed_storage {
        list.ensure_aligned(bits)?;
        if secondary_len & bits.byte_mask() != 0 {
            return Err(RfsError::Misalignment {
                physical: 0,
                logical: 0,
                length: *secondary_len,
                block_size: bits.block_size(),
            });
        }
    }
    Ok(())
}

fn check_geometry(
    loop_blocks: &ExtentList,
    free_blocks: &ExtentList,
    device_blocks: u64,
) -> Result<()> {
    let mut loop_phys = RangeSet::new();
    let mut loop_logical = RangeSet::new();
    for e in loop_blocks {
        let phys_end = e.end_physical().ok_or(RfsError::Overflow("loop extent"))?;
        let log_end = e.end_logical().ok_or(RfsError::Overflow("loop extent"))?;
        if phys_end > device_blocks || log_end > device_blocks {
            return Err(RfsError::Format(format!(
                "loop extent {e} extends past the device end ({device_blocks} blocks)"
            )));
        }
        loop_phys.insert(e.physical, e.length);
        loop_logical.insert(e.logical, e.length);
    }
    if loop_phys.total_len() != loop_blocks.total_length()
        || loop_logical.total_len() != loop_blocks.total_length()
    {
        return Err(RfsError::Format(
            "loop extents overlap each other".to_owned(),
        ));
    }

    let mut free_set = RangeSet::new();
    for e in free_blocks {
        let end = e.end_physical().ok_or(RfsError::Overflow("free extent"))?;
        if end > device_blocks {
            return Err(RfsError::Format(format!(
                "free extent {e} extends past the device end ({device_blocks} blocks)"
            )));
        }
        free_set.insert(e.physical, e.length);
    }
    if free_set.total_len() != free_blocks.total_length() {
        return Err(RfsError::Format(
            "free extents overlap each other".to_owned(),
        ));
    }
    if !free_set.intersect(&loop_phys).is_empty() {
        return Err(RfsError::Format(
            "free space overlaps the loop file".to_owned(),
        ));
    }
    Ok(())
}

/// Pick primary storage from free extents disjoint from every final
/// destination: greedy largest-first, ties by lowest start, candidate
/// offsets trimmed to `align_blocks`. Whatever the budget still needs
/// after primary becomes the secondary (scratch file) requirement.
fn select_storage(
    free: &RangeSet,
    dst_all: &RangeSet,
    budget: u64,
    align_blocks: u64,
) -> (ExtentList, u64) {
    if budget == 0 {
        return (ExtentList::new(), 0);
    }
    let mut candidates = free.clone();
    for (start, len) in dst_all.iter() {
        candidates.remove(start, len);
    }

    let mut aligned: Vec<(u64, u64)> = candidates
        .iter()
        .filter_map(|(start, len)| {
            let lo = start.next_multiple_of(align_blocks);
            let hi = ((start + len) / align_blocks) * align_blocks;
            (lo < hi).then_some((lo, hi - lo))
        })
        .collect();
    aligned.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut primary = ExtentList::new();
    let mut taken = 0_u64;
    for (start, len) in aligned {
        if taken >= budget {
            break;
        }
        let take = len.min(budget - taken);
        primary.insert(Extent::new(start, start, take));
        taken += take;
    }
    (primary, budget - taken)
}

/// Lowest-logical candidate with the best release score: the length of
/// the contiguous free run its source would join once released.
fn best_placeable(
    pending: &[PendingMove],
    free: &RangeSet,
    storage_free: &RangeSet,
) -> Option<usize> {
    let mut best: Option<(u64, usize)> = None;
    for (index, p) in pending.iter().enumerate() {
        if !free.covers(p.logical, p.length) {
            continue;
        }
        let score = match p.src {
            Src::Dev(physical) => free.merged_run_len_if_added(physical, p.length),
            Src::Storage(offset) => storage_free.merged_run_len_if_added(offset, p.length),
        };
        // pending is sorted by logical, so on equal scores the earlier
        // index wins the tie.
        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((score, index));
        }
    }
    best.map(|(_, index)| index)
}

/// Place the free piece of some destination: take the lowest-logical
/// pending move whose destination overlaps the free set, emit a copy
/// for the lowest overlapping chunk, and keep the uncovered head and
/// tail pending. Returns false when no destination overlaps free space.
fn place_partial(
    pending: &mut Vec<PendingMove>,
    free: &mut RangeSet,
    storage_free: &mut RangeSet,
    steps: &mut Vec<MoveStep>,
) -> bool {
    for index in 0..pending.len() {
        let p = pending[index];
        let dst: RangeSet = [(p.logical, p.length)].into_iter().collect();
        let Some((chunk_start, chunk_len)) = free.intersect(&dst).iter().next() else {
            continue;
        };
        let offset = chunk_start - p.logical;
        let (kind, src) = match p.src {
            Src::Dev(physical) => (MoveKind::DevToDev, physical + offset),
            Src::Storage(window) => (MoveKind::StorageToDev, window + offset),
        };
        trace!(
            target: "rfs::plan",
            ?kind,
            src,
            dst = chunk_start,
            length = chunk_len,
            "partial place"
        );
        steps.push(MoveStep {
            kind,
            src,
            dst: chunk_start,
            length: chunk_len,
        });
        free.remove(chunk_start, chunk_len);
        match p.src {
            Src::Dev(_) => free.insert(src, chunk_len),
            Src::Storage(_) => storage_free.insert(src, chunk_len),
        }

        pending.remove(index);
        let mut insert_at = index;
        if offset > 0 {
            pending.insert(
                insert_at,
                PendingMove {
                    src: p.src,
                    logical: p.logical,
                    length: offset,
                },
            );
            insert_at += 1;
        }
        let tail = p.length - offset - chunk_len;
        if tail > 0 {
            let tail_src = match p.src {
                Src::Dev(physical) => Src::Dev(physical + offset + chunk_len),
                Src::Storage(window) => Src::Storage(window + offset + chunk_len),
            };
            pending.insert(
                insert_at,
                PendingMove {
                    src: tail_src,
                    logical: chunk_start + chunk_len,
                    length: tail,
                },
            );
        }
        return true;
    }
    false
}

fn stall(pending: &[PendingMove], bits: BlockBits) -> RfsError {
    let remaining: u64 = pending
        .iter()
        .filter(|p| matches!(p.src, Src::Dev(_)))
        .map(|p| p.length)
        .sum();
    let needed = remaining.max(1) << bits.get();
    RfsError::InsufficientStorage { needed }
}

fn shift_steps(steps: Vec<MoveStep>, bits: BlockBits) -> Result<Vec<MoveStep>> {
    steps
        .into_iter()
        .map(|s| {
            let src = bits.to_bytes(s.src).ok_or(RfsError::Overflow("step source"))?;
            let dst = bits
                .to_bytes(s.dst)
                .ok_or(RfsError::Overflow("step destination"))?;
            let length = bits
                .to_bytes(s.length)
                .ok_or(RfsError::Overflow("step length"))?;
            Ok(MoveStep {
                kind: s.kind,
                src,
                dst,
                length,
            })
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(physical: u64, logical: u64, length: u64) -> Extent {
        Extent::new(physical, logical, length)
    }

    fn request<'a>(
        loop_extents: &'a ExtentList,
        free_extents: &'a ExtentList,
        device_length: u64,
        requested_storage: u64,
    ) -> PlanRequest<'a> {
        PlanRequest {
            loop_extents,
            free_extents,
            device_length,
            block_bits: BlockBits::BYTE,
            requested_storage,
            storage_alignment: 1,
            fixed_storage: None,
        }
    }

    // ── Symbolic plan simulation ────────────────────────────────────────

    /// Apply a plan to a symbolic device and check every loop extent
    /// ends up with its original bytes at its logical position.
    fn simulate_and_check(
        plan: &MovePlan,
        loop_extents: &ExtentList,
        device_length: u64,
    ) {
        // Window layout: primary extents in order, then the scratch file.
        let storage_len = plan.storage_total() as usize;
        let mut device: Vec<u64> = (0..device_length).collect();
        let initial = device.clone();
        let mut storage: Vec<u64> = vec![u64::MAX; storage_len];

        // Window offset -> device offset for the primary part.
        let mut window_to_dev: Vec<Option<u64>> = Vec::with_capacity(storage_len);
        for e in &plan.primary_storage {
            for i in 0..e.length {
                window_to_dev.push(Some(e.physical + i));
            }
        }
        window_to_dev.resize(storage_len, None);

        for step in &plan.steps {
            let len = step.length as usize;
            match step.kind {
                MoveKind::DevToDev => {
                    let from = step.src as usize;
                    let to = step.dst as usize;
                    let data: Vec<u64> = device[from..from + len].to_vec();
                    device[to..to + len].copy_from_slice(&data);
                }
                MoveKind::DevToStorage => {
                    let from = step.src as usize;
                    let to = step.dst as usize;
                    for i in 0..len {
                        storage[to + i] = device[from + i];
                        // Primary storage aliases the device.
                        if let Some(dev_off) = window_to_dev[to + i] {
                            device[dev_off as usize] = device[from + i];
                        }
                    }
                }
                MoveKind::StorageToDev => {
                    let from = step.src as usize;
                    let to = step.dst as usize;
                    for i in 0..len {
                        assert_ne!(storage[from + i], u64::MAX, "read of unwritten storage");
                        device[to + i] = storage[from + i];
                    }
                }
            }
        }

        for e in loop_extents {
            for i in 0..e.length {
                assert_eq!(
                    device[(e.logical + i) as usize],
                    initial[(e.physical + i) as usize],
                    "block {i} of extent {e} not relocated"
                );
            }
        }
    }

    // ── Core relocation cases ───────────────────────────────────────────

    #[test]
    fn identity_layout_needs_no_plan() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(100, 100, 900)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 0)).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.storage_total(), 0);
    }

    #[test]
    fn simple_shift_is_one_direct_copy() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(500, 0, 100)]);
        let free_extents =
            ExtentList::from_unsorted(vec![ext(0, 0, 500), ext(600, 600, 400)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 0)).unwrap();
        assert_eq!(
            plan.steps,
            vec![MoveStep {
                kind: MoveKind::DevToDev,
                src: 500,
                dst: 0,
                length: 100,
            }]
        );
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    #[test]
    fn swap_stages_through_storage_in_three_steps() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 800)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();

        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].kind, MoveKind::DevToStorage);
        assert_eq!(plan.steps[1].kind, MoveKind::DevToDev);
        assert_eq!(plan.steps[2].kind, MoveKind::StorageToDev);
        assert_eq!(plan.storage_total(), 100);
        assert_eq!(plan.secondary_len, 0, "free space should cover staging");
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    #[test]
    fn swap_without_storage_stalls() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        let free_extents = ExtentList::new();
        let err = plan(&request(&loop_extents, &free_extents, 200, 0)).unwrap_err();
        assert!(
            matches!(err, RfsError::InsufficientStorage { .. }),
            "got {err}"
        );
    }

    #[test]
    fn misaligned_input_is_rejected_up_front() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 0, 7)]);
        let free_extents = ExtentList::new();
        let mut req = request(&loop_extents, &free_extents, 8, 0);
        req.block_bits = BlockBits::new(2).unwrap();
        let err = plan(&req).unwrap_err();
        assert!(matches!(err, RfsError::Misalignment { .. }), "got {err}");
    }

    // ── Storage selection ───────────────────────────────────────────────

    #[test]
    fn storage_never_overlaps_final_destinations() {
        // A free extent sits inside the loop file's final footprint
        // (200..300 is a destination). The planner must reserve staging
        // from 400.. instead, or it would block its own end state.
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 200, 100), ext(300, 0, 100)]);
        let free_extents =
            ExtentList::from_unsorted(vec![ext(200, 200, 100), ext(400, 400, 600)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();

        let dst: RangeSet = [(0_u64, 100_u64), (200_u64, 100_u64)].into_iter().collect();
        for e in &plan.primary_storage {
            assert!(
                dst.intersect(&[(e.physical, e.length)].into_iter().collect())
                    .is_empty(),
                "storage extent {e} overlaps a destination"
            );
            assert!(e.physical >= 400, "staging taken from {e}");
        }
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    #[test]
    fn storage_budget_is_capped_by_conflict_total() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 800)]);
        // Request far more than the two conflicting extents need.
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 10_000)).unwrap();
        assert_eq!(plan.storage_total(), 200);
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    #[test]
    fn scarce_free_space_spills_into_secondary() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        // Only 30 free blocks on the device.
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 30)]);
        let plan = plan(&request(&loop_extents, &free_extents, 230, 100)).unwrap();
        assert_eq!(plan.primary_storage.total_length(), 30);
        assert_eq!(plan.secondary_len, 70);
        simulate_and_check(&plan, &loop_extents, 230);
    }

    #[test]
    fn primary_storage_respects_alignment() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 64, 64), ext(64, 0, 64)]);
        // Free extent straddles alignment boundaries awkwardly.
        let free_extents = ExtentList::from_unsorted(vec![ext(130, 130, 126)]);
        let mut req = request(&loop_extents, &free_extents, 256, 64);
        req.storage_alignment = 64;
        let plan = plan(&req).unwrap();
        for e in &plan.primary_storage {
            assert_eq!(e.physical % 64, 0, "unaligned storage extent {e}");
        }
        simulate_and_check(&plan, &loop_extents, 256);
    }

    // ── Staging with splits ─────────────────────────────────────────────

    #[test]
    fn extent_larger_than_storage_is_staged_in_pieces() {
        // Swap two 100-block extents with only 40 blocks of storage:
        // the planner must split staged copies and still converge.
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 40)]);
        let plan = plan(&request(&loop_extents, &free_extents, 240, 40)).unwrap();
        assert!(plan.steps.len() > 3, "split staging expected");
        simulate_and_check(&plan, &loop_extents, 240);
    }

    #[test]
    fn rotation_of_three_extents_converges() {
        // 0 -> 100 -> 200 -> 0 rotation, storage for one extent.
        let loop_extents = ExtentList::from_unsorted(vec![
            ext(0, 100, 100),
            ext(100, 200, 100),
            ext(200, 0, 100),
        ]);
        let free_extents = ExtentList::from_unsorted(vec![ext(300, 300, 700)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    #[test]
    fn self_overlapping_slide_converges() {
        // Destination overlaps the source of the same extent.
        let loop_extents = ExtentList::from_unsorted(vec![ext(50, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(0, 0, 50), ext(150, 150, 50)]);
        let plan = plan(&request(&loop_extents, &free_extents, 200, 200)).unwrap();
        simulate_and_check(&plan, &loop_extents, 200);
    }

    #[test]
    fn fragmented_loop_file_defragments() {
        let loop_extents = ExtentList::from_unsorted(vec![
            ext(700, 0, 50),
            ext(300, 50, 100),
            ext(100, 150, 50),
            ext(550, 200, 100),
        ]);
        let free_extents = ExtentList::from_unsorted(vec![
            ext(0, 0, 100),
            ext(150, 150, 150),
            ext(400, 400, 150),
            ext(650, 650, 50),
            ext(750, 750, 250),
        ]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();
        simulate_and_check(&plan, &loop_extents, 1000);
    }

    // ── Block units and determinism ─────────────────────────────────────

    #[test]
    fn plan_emits_byte_units_for_block_inputs() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(4096, 0, 4096)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(0, 0, 4096)]);
        let mut req = request(&loop_extents, &free_extents, 8192, 0);
        req.block_bits = BlockBits::new(12).unwrap();
        let plan = plan(&req).unwrap();
        assert_eq!(
            plan.steps,
            vec![MoveStep {
                kind: MoveKind::DevToDev,
                src: 4096,
                dst: 0,
                length: 4096,
            }]
        );
    }

    #[test]
    fn planning_is_deterministic() {
        let loop_extents = ExtentList::from_unsorted(vec![
            ext(0, 100, 100),
            ext(100, 0, 100),
            ext(400, 200, 100),
        ]);
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 200), ext(500, 500, 500)]);
        let first = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();
        let second = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();
        assert_eq!(first.steps, second.steps);
        assert_eq!(first.primary_storage, second.primary_storage);
        assert_eq!(first.secondary_len, second.secondary_len);
    }

    #[test]
    fn resume_reuses_the_persisted_storage_split() {
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100), ext(100, 0, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(200, 200, 800)]);
        let original = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();

        let mut resume_req = request(&loop_extents, &free_extents, 1000, 0);
        resume_req.fixed_storage =
            Some((original.primary_storage.clone(), original.secondary_len));
        let resumed = plan(&resume_req).unwrap();
        assert_eq!(original.steps, resumed.steps);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        // Loop extent past the device end.
        let loop_extents = ExtentList::from_unsorted(vec![ext(900, 0, 200)]);
        let free_extents = ExtentList::new();
        assert!(plan(&request(&loop_extents, &free_extents, 1000, 0)).is_err());

        // Free space overlapping the loop file.
        let loop_extents = ExtentList::from_unsorted(vec![ext(0, 100, 100)]);
        let free_extents = ExtentList::from_unsorted(vec![ext(50, 50, 100)]);
        assert!(plan(&request(&loop_extents, &free_extents, 1000, 0)).is_err());
    }

    #[test]
    fn empty_loop_file_is_an_empty_plan() {
        let loop_extents = ExtentList::new();
        let free_extents = ExtentList::from_unsorted(vec![ext(0, 0, 1000)]);
        let plan = plan(&request(&loop_extents, &free_extents, 1000, 100)).unwrap();
        assert!(plan.is_empty());
    }
}
