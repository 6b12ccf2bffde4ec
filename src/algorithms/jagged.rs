// This file contains the implementation of the jagged partitioner used to split
// weighted point sets into balanced parts with axis-aligned cuts.
// # Reference
//
// Deveci, Mehmet, et al. "Multi-jagged: A scalable parallel spatial partitioning
// algorithm." IEEE Transactions on Parallel and Distributed Systems 27.3 (2015):
// 803-817.

use std::mem;

use log::{debug, trace};
use rayon::prelude::*;

use crate::algorithms::Error;
use crate::comm::{Collective, SingleProcess};
use crate::imbalance::cut_imbalance;
use crate::migration::Migrator;
use crate::plan::{expand_level, PartitionPlan};
use crate::points::PointSet;
use crate::Partition;

const DEFAULT_CONCURRENT_PART_COUNT: usize = 16;

// Tie weight shares are truncated to three decimals, biased up a hair, so
// that every process rounds identical shares the same way.
const TIE_ROUND_BIAS: f64 = 0.0001;
const TIE_ROUND_SCALE: f64 = 1000.0;

/// How the thread tier of the partitioner runs its per-iteration loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionPolicy {
    /// Fork-join parallel loops over fixed-size chunks of the point range.
    #[default]
    Parallel,

    /// Plain sequential loops; a single chunk spans the whole range.
    Sequential,
}

/// How the classifier locates the bucket of a point among the cut lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPolicy {
    /// Binary search over the ordered cut coordinates.
    #[default]
    Binary,

    /// Linear scan outward from the bucket the point landed in last
    /// iteration.
    Linear,
}

/// Diagnostic counters for one partitioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    /// The number of dimension levels the driver went through.
    pub levels: usize,

    /// Total cut-search iterations over all levels and windows.
    pub solver_iterations: usize,

    /// How many collective rounds the run consumed.
    pub collective_rounds: usize,
}

/// Jagged Partitioner
///
/// Computes a balanced multi-way partition of a weighted point set by
/// successive axis-aligned cuts, where each level may split every part into
/// more than two pieces. Cut coordinates are searched iteratively until the
/// weight on either side of each cut is within `imbalance_tolerance` of its
/// target share. Parts are refined in batches of `concurrent_part_count` so
/// that one collective exchange per iteration serves the whole batch.
///
/// # Example
///
/// ```rust
/// use JaggedCut::algorithms::JaggedPartitioner;
/// use JaggedCut::plan::PartitionPlan;
/// use JaggedCut::points::PointSet;
/// use JaggedCut::Partition;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let points = PointSet::new(vec![
///         vec![0.0, 1.0, 2.0, 3.0],
///         vec![0.0, 1.0, 0.0, 1.0],
///     ])?;
///     let weights = vec![1.0; points.len()];
///     let mut partition = vec![0; points.len()];
///
///     JaggedPartitioner {
///         plan: PartitionPlan::TotalParts(2),
///         ..Default::default()
///     }
///     .partition(&mut partition, (&points, weights.as_slice()))?;
/// #   Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JaggedPartitioner<C: Collective = SingleProcess> {
    /// How many parts to produce, level by level or as a total.
    pub plan: PartitionPlan,

    /// Allowed relative deviation of a part's weight from its target share.
    /// A cut is final once both of its sides are within this factor.
    pub imbalance_tolerance: f64,

    /// How many parts are refined together in one batch of collective
    /// operations. Zero picks a default. Larger windows need fewer
    /// communication rounds but more working memory.
    pub concurrent_part_count: usize,

    /// Whether points lying exactly on a cut may be split between its two
    /// sides to hit the target weight exactly. When disabled, on-cut points
    /// always go to the right side.
    pub allow_non_rectilinear: bool,

    /// Thread-tier scheduling strategy.
    pub execution: ExecutionPolicy,

    /// Bucket search strategy of the classifier.
    pub search: SearchPolicy,

    /// The collective backend shared by all cooperating processes.
    pub comm: C,
}

impl Default for JaggedPartitioner<SingleProcess> {
    fn default() -> Self {
        JaggedPartitioner {
            plan: PartitionPlan::default(),
            imbalance_tolerance: 0.1,
            concurrent_part_count: 0,
            allow_non_rectilinear: true,
            execution: ExecutionPolicy::default(),
            search: SearchPolicy::default(),
            comm: SingleProcess,
        }
    }
}

impl<C: Collective> JaggedPartitioner<C> {
    /// Partition with a migration collaborator. After every level the
    /// migrator is offered the current assignment and may return a plan to
    /// redistribute point ownership across processes.
    pub fn partition_with_migrator(
        &mut self,
        part_ids: &mut [usize],
        points: &PointSet,
        weights: Option<&[f64]>,
        migrator: &mut dyn Migrator,
    ) -> Result<Metadata, Error> {
        check_input_len(part_ids, points, weights)?;
        jagged_partition(part_ids, points, weights, self, Some(migrator))
    }
}

impl<'a, C: Collective> Partition<(&'a PointSet, &'a [f64])> for JaggedPartitioner<C> {
    type Metadata = Metadata;
    type Error = Error;

    fn partition(
        &mut self,
        part_ids: &mut [usize],
        (points, weights): (&'a PointSet, &'a [f64]),
    ) -> Result<Self::Metadata, Self::Error> {
        check_input_len(part_ids, points, Some(weights))?;
        jagged_partition(part_ids, points, Some(weights), self, None)
    }
}

impl<'a, C: Collective> Partition<&'a PointSet> for JaggedPartitioner<C> {
    type Metadata = Metadata;
    type Error = Error;

    fn partition(
        &mut self,
        part_ids: &mut [usize],
        points: &'a PointSet,
    ) -> Result<Self::Metadata, Self::Error> {
        check_input_len(part_ids, points, None)?;
        jagged_partition(part_ids, points, None, self, None)
    }
}

fn check_input_len(
    part_ids: &[usize],
    points: &PointSet,
    weights: Option<&[f64]>,
) -> Result<(), Error> {
    if part_ids.len() != points.len() {
        return Err(Error::InputLenMismatch {
            expected: points.len(),
            actual: part_ids.len(),
        });
    }
    if let Some(weights) = weights {
        if weights.len() != points.len() {
            return Err(Error::InputLenMismatch {
                expected: points.len(),
                actual: weights.len(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    /// The part is not split this level; its range is copied through.
    PassThrough,

    /// No process holds any point of this part; all children stay empty.
    Empty,

    /// The part's coordinate range is a single value (or it has no weight),
    /// so every point goes to the first child without entering the solver.
    Trivial,

    /// The part takes the full cut search.
    Solvable,
}

// One part of the concurrency window currently being refined.
#[derive(Debug, Clone, Copy)]
struct WindowPart {
    begin: usize,
    end: usize,
    split: usize,
    cuts: usize,
    // offset of this part's cuts in the window-wide cut arrays
    cut_offset: usize,
    // offset of this part's segment in the reduction buffer (4 cuts + 1 wide)
    buf_offset: usize,
    min: f64,
    max: f64,
    total: f64,
    kind: PartKind,
}

// Double-buffered cut state of a concurrency window. The work coordinates
// are only swapped in at iteration boundaries, once every cut of the window
// has been advanced against the same current coordinates.
struct CutBatch {
    coords: Vec<f64>,
    next_coords: Vec<f64>,
    lower_bound: Vec<f64>,
    upper_bound: Vec<f64>,
    lower_weight: Vec<f64>,
    upper_weight: Vec<f64>,
    done: Vec<bool>,
    tie_ratio: Vec<f64>,
    target_ratio: Vec<f64>,
}

impl CutBatch {
    fn new(cut_total: usize) -> Self {
        CutBatch {
            coords: vec![0.0; cut_total],
            next_coords: vec![0.0; cut_total],
            lower_bound: vec![0.0; cut_total],
            upper_bound: vec![0.0; cut_total],
            lower_weight: vec![0.0; cut_total],
            upper_weight: vec![0.0; cut_total],
            done: vec![true; cut_total],
            tie_ratio: vec![0.0; cut_total],
            target_ratio: vec![0.0; cut_total],
        }
    }

    fn swap_buffers(&mut self) {
        mem::swap(&mut self.coords, &mut self.next_coords);
    }
}

fn jagged_partition<C: Collective>(
    part_ids: &mut [usize],
    points: &PointSet,
    weights: Option<&[f64]>,
    config: &JaggedPartitioner<C>,
    mut migrator: Option<&mut dyn Migrator>,
) -> Result<Metadata, Error> {
    config.plan.validate()?;

    let num_points = points.len();
    let dim = points.dim();
    let level_count = if dim == 0 { 0 } else { config.plan.level_count(dim) };
    let concurrent = if config.concurrent_part_count == 0 {
        DEFAULT_CONCURRENT_PART_COUNT
    } else {
        config.concurrent_part_count
    };

    let mut meta = Metadata {
        levels: level_count,
        solver_iterations: 0,
        collective_rounds: 0,
    };

    // per current part, how many leaf parts it still has to produce
    let mut future = vec![config.plan.total_parts()];

    let mut current_perm: Vec<usize> = (0..num_points).collect();
    let mut next_perm: Vec<usize> = vec![0; num_points];
    // end offset of each part's range in the current permutation
    let mut part_ends: Vec<usize> = vec![num_points];
    // last known bucket of each permutation slot, seeding the next search
    let mut bucket_cache: Vec<u32> = vec![0; num_points];

    for level in 0..level_count {
        let axis = level % dim;
        let axis_coords = points.axis(axis);
        let split = expand_level(
            &future,
            config.plan.fixed_split(level),
            (level_count - level) as u32,
        );
        if split.out_part_count == part_ends.len() {
            // nothing splits this level
            future = split.future;
            continue;
        }
        debug!(
            "level {}: splitting {} parts into {} along axis {}",
            level,
            part_ends.len(),
            split.out_part_count,
            axis
        );

        // first child index of each current part
        let mut child_base = vec![0usize; part_ends.len()];
        let mut acc = 0;
        for (part, &part_split) in split.splits.iter().enumerate() {
            child_base[part] = acc;
            acc += part_split;
        }

        let part_count = part_ends.len();
        let mut out_ends = vec![0usize; split.out_part_count];
        let mut current_out = 0usize;
        let mut previous_end = 0usize;

        let mut work_part = 0;
        while work_part < part_count {
            let window_len = concurrent.min(part_count - work_part);

            // describe the window and compute local bounds per part
            let mut window = Vec::with_capacity(window_len);
            let mut local_mmt = vec![0.0; 3 * window_len];
            let mut cut_offset = 0;
            let mut buf_offset = 0;
            for kk in 0..window_len {
                let part = work_part + kk;
                let begin = if part == 0 { 0 } else { part_ends[part - 1] };
                let end = part_ends[part];
                let part_split = split.splits[part];
                let cuts = part_split - 1;

                let (min, max, total) = if part_split > 1 {
                    local_min_max_total(
                        axis_coords,
                        weights,
                        &current_perm[begin..end],
                        config.execution,
                    )
                } else {
                    (f64::MAX, f64::MIN, 0.0)
                };
                local_mmt[kk] = min;
                local_mmt[kk + window_len] = max;
                local_mmt[kk + 2 * window_len] = total;

                window.push(WindowPart {
                    begin,
                    end,
                    split: part_split,
                    cuts,
                    cut_offset,
                    buf_offset,
                    min,
                    max,
                    total,
                    kind: PartKind::PassThrough,
                });
                cut_offset += cuts;
                buf_offset += 4 * cuts + 1;
            }
            let cut_total = cut_offset;
            let buf_total = buf_offset;

            let mut global_mmt = vec![0.0; 3 * window_len];
            config
                .comm
                .allreduce_min_max_sum(window_len, &local_mmt, &mut global_mmt)?;
            meta.collective_rounds += 1;

            // settle what each part needs, now that bounds are global
            for (kk, wp) in window.iter_mut().enumerate() {
                wp.min = global_mmt[kk];
                wp.max = global_mmt[kk + window_len];
                wp.total = global_mmt[kk + 2 * window_len];
                wp.kind = if wp.split == 1 {
                    PartKind::PassThrough
                } else if wp.min > wp.max {
                    PartKind::Empty
                } else if (wp.max - wp.min).abs() < f64::EPSILON || wp.total <= 0.0 {
                    PartKind::Trivial
                } else {
                    PartKind::Solvable
                };
            }

            // initial cut coordinates, spaced by the cumulative target
            // ratios of the children still to be produced
            let mut batch = CutBatch::new(cut_total);
            let mut active_per_part = vec![0usize; window_len];
            let mut active_total = 0usize;
            for (kk, wp) in window.iter().enumerate() {
                if wp.kind != PartKind::Solvable {
                    continue;
                }
                let part = work_part + kk;
                let children = &split.future[child_base[part]..child_base[part] + wp.split];
                let parent_future: usize = children.iter().sum();
                let range = wp.max - wp.min;
                let mut cumulative = 0usize;
                for i in 0..wp.cuts {
                    cumulative += children[i];
                    let ratio = cumulative as f64 / parent_future as f64;
                    batch.target_ratio[wp.cut_offset + i] = ratio;
                    batch.coords[wp.cut_offset + i] = wp.min + range * ratio;
                    batch.lower_bound[wp.cut_offset + i] = wp.min;
                    batch.upper_bound[wp.cut_offset + i] = wp.max;
                    batch.lower_weight[wp.cut_offset + i] = 0.0;
                    batch.upper_weight[wp.cut_offset + i] = wp.total;
                    batch.done[wp.cut_offset + i] = false;
                }
                active_per_part[kk] = wp.cuts;
                active_total += wp.cuts;

                // estimate a starting bucket for every point, assuming a
                // uniform spread over the coordinate range
                let slice_width = range / wp.split as f64;
                estimate_buckets(
                    axis_coords,
                    &current_perm[wp.begin..wp.end],
                    &mut bucket_cache[wp.begin..wp.end],
                    wp.min,
                    slice_width,
                    config.execution,
                );
            }

            // the iterative cut search; the loop is a synchronization
            // barrier, every process leaves it after the same iteration
            let part_cuts: Vec<usize> = window.iter().map(|wp| wp.cuts).collect();
            let mut local_buf = vec![0.0; buf_total];
            let mut global_buf = vec![0.0; buf_total];
            let mut local_cut_weights = vec![0.0; cut_total];
            let mut global_cut_weights = vec![0.0; cut_total];
            let mut last_scans: Vec<Vec<ChunkScan>> = (0..window_len).map(|_| Vec::new()).collect();

            while active_total > 0 {
                meta.solver_iterations += 1;
                trace!("cut search iteration with {} active cuts", active_total);

                for (kk, wp) in window.iter().enumerate() {
                    if active_per_part[kk] == 0 {
                        continue;
                    }
                    let scans = classify_part(
                        axis_coords,
                        weights,
                        &current_perm[wp.begin..wp.end],
                        &mut bucket_cache[wp.begin..wp.end],
                        &batch.coords[wp.cut_offset..wp.cut_offset + wp.cuts],
                        config.search,
                        config.execution,
                    );
                    accumulate_scans(
                        &scans,
                        &batch.coords[wp.cut_offset..wp.cut_offset + wp.cuts],
                        &mut local_buf[wp.buf_offset..wp.buf_offset + 4 * wp.cuts + 1],
                    );
                    last_scans[kk] = scans;
                }

                config
                    .comm
                    .allreduce_sum_min_min(&part_cuts, &local_buf, &mut global_buf)?;
                meta.collective_rounds += 1;

                local_cut_weights.fill(0.0);
                let mut tie_pending = 0usize;
                for (kk, wp) in window.iter().enumerate() {
                    if active_per_part[kk] == 0 {
                        continue;
                    }
                    let lo = wp.cut_offset;
                    let hi = wp.cut_offset + wp.cuts;
                    let buf = wp.buf_offset..wp.buf_offset + 4 * wp.cuts + 1;
                    let mut active = active_per_part[kk];
                    advance_cuts(
                        wp.total,
                        config.imbalance_tolerance,
                        config.allow_non_rectilinear,
                        &batch.target_ratio[lo..hi],
                        &global_buf[buf.clone()],
                        &local_buf[buf],
                        &batch.coords[lo..hi],
                        &mut batch.next_coords[lo..hi],
                        &mut batch.lower_bound[lo..hi],
                        &mut batch.upper_bound[lo..hi],
                        &mut batch.lower_weight[lo..hi],
                        &mut batch.upper_weight[lo..hi],
                        &mut batch.done[lo..hi],
                        &mut batch.tie_ratio[lo..hi],
                        &mut local_cut_weights[lo..hi],
                        &mut active,
                        &mut tie_pending,
                    );
                    active_total -= active_per_part[kk] - active;
                    active_per_part[kk] = active;
                }

                if tie_pending > 0 {
                    // one scan settles every cut that balances only by
                    // splitting its on-cut weight: ranks take their share of
                    // the leftover budget in rank order
                    config
                        .comm
                        .scan_sum(&local_cut_weights, &mut global_cut_weights)?;
                    meta.collective_rounds += 1;
                    resolve_tie_ratios(
                        &window,
                        &batch.target_ratio,
                        &global_buf,
                        &local_cut_weights,
                        &global_cut_weights,
                        &mut batch.tie_ratio,
                    );
                }

                batch.swap_buffers();
            }

            // reassignment: scatter each part's points into the next
            // permutation buffer and record its children's end offsets
            let mut out_shift = 0usize;
            for (kk, wp) in window.iter().enumerate() {
                let start = current_out + out_shift;
                let range_len = wp.end - wp.begin;
                match wp.kind {
                    PartKind::PassThrough => {
                        next_perm[wp.begin..wp.end]
                            .copy_from_slice(&current_perm[wp.begin..wp.end]);
                        out_ends[start] = range_len;
                    }
                    PartKind::Empty => {
                        for child in 0..wp.split {
                            out_ends[start + child] = 0;
                        }
                    }
                    PartKind::Trivial => {
                        next_perm[wp.begin..wp.end]
                            .copy_from_slice(&current_perm[wp.begin..wp.end]);
                        for child in 0..wp.split {
                            out_ends[start + child] = range_len;
                        }
                    }
                    PartKind::Solvable => {
                        counting_sort_part(
                            weights,
                            &current_perm[wp.begin..wp.end],
                            &mut bucket_cache[wp.begin..wp.end],
                            &batch.coords[wp.cut_offset..wp.cut_offset + wp.cuts],
                            &batch.tie_ratio[wp.cut_offset..wp.cut_offset + wp.cuts],
                            &local_buf[wp.buf_offset..wp.buf_offset + 2 * wp.cuts + 1],
                            &last_scans[kk],
                            config.allow_non_rectilinear,
                            config.execution,
                            &mut next_perm[wp.begin..wp.end],
                            &mut out_ends[start..start + wp.split],
                        );
                    }
                }
                out_shift += wp.split;
            }

            // the offsets above are part-relative; shift them to be global
            let mut offset = current_out;
            for wp in &window {
                for child in 0..wp.split {
                    out_ends[offset + child] += previous_end;
                }
                previous_end = out_ends[offset + wp.split - 1];
                offset += wp.split;
            }

            current_out = offset;
            work_part += window_len;
        }

        mem::swap(&mut current_perm, &mut next_perm);
        part_ends = out_ends;
        future = split.future;

        if let Some(migrator) = migrator.as_deref_mut() {
            offer_migration(migrator, &config.comm, num_points, &current_perm, &part_ends)?;
        }
    }

    write_part_ids(part_ids, &current_perm, &part_ends, config.execution);
    Ok(meta)
}

// Write the final part id of every point, one contiguous permutation range
// per part.
fn write_part_ids(
    part_ids: &mut [usize],
    perm: &[usize],
    part_ends: &[usize],
    execution: ExecutionPolicy,
) {
    match execution {
        ExecutionPolicy::Parallel => {
            let destination = ScatterPtr(part_ids.as_mut_ptr());
            (0..part_ends.len()).into_par_iter().for_each(|part| {
                let begin = if part == 0 { 0 } else { part_ends[part - 1] };
                for &point in &perm[begin..part_ends[part]] {
                    // part ranges are disjoint, so the writes are too
                    unsafe { destination.write(point, part) };
                }
            });
        }
        ExecutionPolicy::Sequential => {
            let mut begin = 0;
            for (part, &end) in part_ends.iter().enumerate() {
                for &point in &perm[begin..end] {
                    part_ids[point] = part;
                }
                begin = end;
            }
        }
    }
}

// Hand the current assignment to the migration collaborator. Applying a plan
// means physically exchanging points, which needs the embedding transport;
// the partitioner only accepts plans that keep every local point in place.
fn offer_migration<C: Collective>(
    migrator: &mut dyn Migrator,
    comm: &C,
    num_points: usize,
    perm: &[usize],
    part_ends: &[usize],
) -> Result<(), Error> {
    let mut assignment = vec![0usize; num_points];
    let mut population = Vec::with_capacity(part_ends.len());
    let mut begin = 0;
    for (part, &end) in part_ends.iter().enumerate() {
        for &point in &perm[begin..end] {
            assignment[point] = part;
        }
        population.push(end - begin);
        begin = end;
    }

    if let Some(plan) = migrator.plan(&assignment, &population) {
        if plan.send_counts.len() != comm.size() {
            return Err(Error::InputLenMismatch {
                expected: comm.size(),
                actual: plan.send_counts.len(),
            });
        }
        let leaving: usize = plan
            .send_counts
            .iter()
            .enumerate()
            .filter(|&(rank, _)| rank != comm.rank())
            .map(|(_, &count)| count)
            .sum();
        if leaving > 0 || plan.new_local_count != num_points {
            return Err(Error::Collective(crate::comm::CommError {
                message: "migration plan moves points but no transport is attached".to_string(),
            }));
        }
        debug!("migration plan keeps all {} local points", num_points);
    }
    Ok(())
}

// The chunk length both the classifier and the counting sort cut the point
// range into. Chunk boundaries must agree between the two, because the tie
// weight budgets are split per chunk.
fn chunk_len(len: usize, execution: ExecutionPolicy) -> usize {
    match execution {
        ExecutionPolicy::Sequential => len.max(1),
        ExecutionPolicy::Parallel => len.div_ceil(rayon::current_num_threads()).max(1),
    }
}

fn local_min_max_total(
    coords: &[f64],
    weights: Option<&[f64]>,
    perm: &[usize],
    execution: ExecutionPolicy,
) -> (f64, f64, f64) {
    if perm.is_empty() {
        return (f64::MAX, f64::MIN, 0.0);
    }
    let chunk = chunk_len(perm.len(), execution);
    let scan = |chunk: &[usize]| -> (f64, f64, f64) {
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut total = 0.0;
        for &point in chunk {
            let coord = coords[point];
            if coord < min {
                min = coord;
            }
            if coord > max {
                max = coord;
            }
            total += weights.map_or(1.0, |w| w[point]);
        }
        (min, max, total)
    };
    let partials: Vec<(f64, f64, f64)> = match execution {
        ExecutionPolicy::Parallel => perm.par_chunks(chunk).map(scan).collect(),
        ExecutionPolicy::Sequential => perm.chunks(chunk).map(scan).collect(),
    };
    // chunks combine in slice order, so the sum is reproducible
    partials
        .into_iter()
        .fold((f64::MAX, f64::MIN, 0.0), |acc, p| {
            (acc.0.min(p.0), acc.1.max(p.1), acc.2 + p.2)
        })
}

fn estimate_buckets(
    coords: &[f64],
    perm: &[usize],
    cache: &mut [u32],
    min: f64,
    slice_width: f64,
    execution: ExecutionPolicy,
) {
    let chunk = chunk_len(perm.len(), execution);
    let estimate = |(perm_chunk, cache_chunk): (&[usize], &mut [u32])| {
        for (slot, &point) in perm_chunk.iter().enumerate() {
            let estimated = ((coords[point] - min) / slice_width) as usize;
            cache_chunk[slot] = (2 * estimated) as u32;
        }
    };
    match execution {
        ExecutionPolicy::Parallel => perm
            .par_chunks(chunk)
            .zip(cache.par_chunks_mut(chunk))
            .for_each(estimate),
        ExecutionPolicy::Sequential => perm
            .chunks(chunk)
            .zip(cache.chunks_mut(chunk))
            .for_each(estimate),
    }
}

// Where a point falls relative to the ordered cut lines of its part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Located {
    // strictly between cut `p - 1` and cut `p`
    Part(usize),
    // exactly on cut `j`, within machine epsilon
    OnCut(usize),
}

fn locate_binary(cuts: &[f64], coord: f64) -> Located {
    let p = cuts.partition_point(|&cut| cut <= coord - f64::EPSILON);
    if p < cuts.len() && (cuts[p] - coord).abs() < f64::EPSILON {
        Located::OnCut(p)
    } else {
        Located::Part(p)
    }
}

fn locate_linear(cuts: &[f64], coord: f64, hint: usize) -> Located {
    let cut_count = cuts.len();
    let mut j = hint.min(cut_count - 1);
    loop {
        let distance = coord - cuts[j];
        if distance.abs() < f64::EPSILON {
            return Located::OnCut(j);
        }
        if distance < 0.0 {
            if j == 0 {
                return Located::Part(0);
            }
            let below = coord - cuts[j - 1];
            if below.abs() < f64::EPSILON {
                return Located::OnCut(j - 1);
            }
            if below > 0.0 {
                return Located::Part(j);
            }
            j -= 1;
        } else {
            if j == cut_count - 1 {
                return Located::Part(cut_count);
            }
            let above = coord - cuts[j + 1];
            if above.abs() < f64::EPSILON {
                return Located::OnCut(j + 1);
            }
            if above < 0.0 {
                return Located::Part(j + 1);
            }
            j += 1;
        }
    }
}

// Per-chunk result of one classification pass: a raw weight histogram over
// the `2 cuts + 1` alternating part / on-cut buckets, and the closest
// distance seen from either side of every cut.
struct ChunkScan {
    weights: Vec<f64>,
    left: Vec<f64>,
    right: Vec<f64>,
}

impl ChunkScan {
    fn new(cut_count: usize) -> Self {
        ChunkScan {
            weights: vec![0.0; 2 * cut_count + 1],
            left: vec![f64::MAX; cut_count],
            right: vec![f64::MAX; cut_count],
        }
    }

    // Deposit one point and return the bucket it landed in.
    fn deposit(&mut self, cuts: &[f64], located: Located, coord: f64, weight: f64) -> u32 {
        match located {
            Located::Part(p) => {
                self.weights[2 * p] += weight;
                if p > 0 {
                    let distance = coord - cuts[p - 1];
                    if distance < self.right[p - 1] {
                        self.right[p - 1] = distance;
                    }
                }
                if p < cuts.len() {
                    let distance = cuts[p] - coord;
                    if distance < self.left[p] {
                        self.left[p] = distance;
                    }
                }
                (2 * p) as u32
            }
            Located::OnCut(j) => {
                self.weights[2 * j + 1] += weight;
                self.left[j] = 0.0;
                self.right[j] = 0.0;
                let cut = cuts[j];
                // the weight also lands on every cut sharing this coordinate
                let mut k = j + 1;
                while k < cuts.len() {
                    let distance = (cuts[k] - cut).abs();
                    if distance < f64::EPSILON {
                        self.weights[2 * k + 1] += weight;
                        self.left[k] = 0.0;
                        self.right[k] = 0.0;
                        k += 1;
                    } else {
                        if distance < self.left[k] {
                            self.left[k] = distance;
                        }
                        break;
                    }
                }
                let mut k = j;
                while k > 0 {
                    k -= 1;
                    let distance = (cuts[k] - cut).abs();
                    if distance < f64::EPSILON {
                        self.weights[2 * k + 1] += weight;
                        self.left[k] = 0.0;
                        self.right[k] = 0.0;
                    } else {
                        if distance < self.right[k] {
                            self.right[k] = distance;
                        }
                        break;
                    }
                }
                (2 * j + 1) as u32
            }
        }
    }
}

fn classify_part(
    coords: &[f64],
    weights: Option<&[f64]>,
    perm: &[usize],
    cache: &mut [u32],
    cuts: &[f64],
    search: SearchPolicy,
    execution: ExecutionPolicy,
) -> Vec<ChunkScan> {
    let chunk = chunk_len(perm.len(), execution);
    let scan = |(perm_chunk, cache_chunk): (&[usize], &mut [u32])| -> ChunkScan {
        let mut result = ChunkScan::new(cuts.len());
        for (slot, &point) in perm_chunk.iter().enumerate() {
            let coord = coords[point];
            let weight = weights.map_or(1.0, |w| w[point]);
            let located = match search {
                SearchPolicy::Binary => locate_binary(cuts, coord),
                SearchPolicy::Linear => {
                    locate_linear(cuts, coord, (cache_chunk[slot] / 2) as usize)
                }
            };
            cache_chunk[slot] = result.deposit(cuts, located, coord, weight);
        }
        result
    };
    match execution {
        ExecutionPolicy::Parallel => perm
            .par_chunks(chunk)
            .zip(cache.par_chunks_mut(chunk))
            .map(scan)
            .collect(),
        ExecutionPolicy::Sequential => perm
            .chunks(chunk)
            .zip(cache.chunks_mut(chunk))
            .map(scan)
            .collect(),
    }
}

// Combine the chunk results of one part into its reduction-buffer segment:
// summed weight buckets turned into a prefix histogram, then minimized left
// and right closest distances.
fn accumulate_scans(scans: &[ChunkScan], cuts: &[f64], buf: &mut [f64]) {
    let cut_count = cuts.len();
    let weight_len = 2 * cut_count + 1;
    buf[..weight_len].fill(0.0);
    buf[weight_len..].fill(f64::MAX);
    for scan in scans {
        for (dst, src) in buf[..weight_len].iter_mut().zip(&scan.weights) {
            *dst += src;
        }
        for i in 0..cut_count {
            if scan.left[i] < buf[weight_len + i] {
                buf[weight_len + i] = scan.left[i];
            }
            if scan.right[i] < buf[weight_len + cut_count + i] {
                buf[weight_len + cut_count + i] = scan.right[i];
            }
        }
    }
    // prefix accumulation; cuts sharing a position each carry the full
    // on-cut weight, so the bucket between two coincident cuts copies its
    // left twin instead of accumulating that weight twice
    for i in 1..weight_len {
        if i % 2 == 0
            && i > 1
            && i < weight_len - 1
            && (cuts[i / 2] - cuts[i / 2 - 1]).abs() < f64::EPSILON
        {
            buf[i] = buf[i - 2];
            continue;
        }
        buf[i] += buf[i - 1];
    }
}

// Next trial coordinate: weighted interpolation between the bound
// coordinates, targeting the expected weight.
fn pivot_position(
    lower_bound: f64,
    upper_bound: f64,
    lower_weight: f64,
    upper_weight: f64,
    expected: f64,
) -> f64 {
    if upper_weight == lower_weight {
        return lower_bound;
    }
    (upper_bound - lower_bound) / (upper_weight - lower_weight) * (expected - lower_weight)
        + lower_bound
}

// Advance every still-active cut of one part by one iteration, against the
// globally reduced weights and closest distances.
fn advance_cuts(
    total_weight: f64,
    imbalance_tolerance: f64,
    allow_non_rectilinear: bool,
    target_ratios: &[f64],
    global: &[f64],
    local: &[f64],
    cut_coords: &[f64],
    next_coords: &mut [f64],
    lower_bound: &mut [f64],
    upper_bound: &mut [f64],
    lower_weight: &mut [f64],
    upper_weight: &mut [f64],
    done: &mut [bool],
    tie_ratio: &mut [f64],
    local_cut_weights: &mut [f64],
    active: &mut usize,
    tie_pending: &mut usize,
) {
    let cut_count = cut_coords.len();
    let weight_len = 2 * cut_count + 1;
    // a closest distance left at the sentinel means no point was seen on
    // that side this iteration; treat it as touching the cut
    let left_closest = |i: usize| {
        let distance = global[weight_len + i];
        if distance == f64::MAX {
            0.0
        } else {
            distance
        }
    };
    let right_closest = |i: usize| {
        let distance = global[weight_len + cut_count + i];
        if distance == f64::MAX {
            0.0
        } else {
            distance
        }
    };

    for i in 0..cut_count {
        if done[i] {
            next_coords[i] = cut_coords[i];
            continue;
        }
        let seen = global[2 * i];
        let expected_ratio = target_ratios[i];
        let left_imbalance = cut_imbalance(seen, total_weight, expected_ratio);
        let right_imbalance =
            cut_imbalance(total_weight - seen, total_weight, 1.0 - expected_ratio);

        if left_imbalance.abs() - imbalance_tolerance < f64::EPSILON
            && right_imbalance.abs() - imbalance_tolerance < f64::EPSILON
        {
            done[i] = true;
            *active -= 1;
            next_coords[i] = cut_coords[i];
            continue;
        }

        let expected = total_weight * expected_ratio;
        if left_imbalance < 0.0 {
            // too little weight on the left: the cut moves right
            if allow_non_rectilinear {
                let through = global[2 * i + 1];
                if through == expected {
                    done[i] = true;
                    *active -= 1;
                    next_coords[i] = cut_coords[i];
                    tie_ratio[i] = 1.0;
                    continue;
                } else if through > expected {
                    // splitting the on-cut weight balances this cut; the
                    // left share is settled once ranks scan their budgets
                    done[i] = true;
                    *active -= 1;
                    *tie_pending += 1;
                    next_coords[i] = cut_coords[i];
                    local_cut_weights[i] = local[2 * i + 1] - local[2 * i];
                    continue;
                }
            }
            lower_bound[i] = cut_coords[i] + right_closest(i);
            lower_weight[i] = seen;
            // neighboring cuts of the same part may carry tighter bounds
            for ii in i + 1..cut_count {
                let part_weight = global[2 * ii];
                let through_weight = global[2 * ii + 1];
                if part_weight >= expected {
                    if part_weight == expected {
                        upper_bound[i] = cut_coords[ii];
                        upper_weight[i] = part_weight;
                        lower_bound[i] = cut_coords[ii];
                        lower_weight[i] = part_weight;
                    } else if part_weight < upper_weight[i] {
                        upper_bound[i] = cut_coords[ii] - left_closest(ii);
                        upper_weight[i] = part_weight;
                    }
                    break;
                }
                if through_weight >= expected {
                    upper_bound[i] = cut_coords[ii];
                    upper_weight[i] = through_weight;
                    lower_bound[i] = cut_coords[ii];
                    lower_weight[i] = part_weight;
                    break;
                }
                if part_weight >= lower_weight[i] {
                    lower_bound[i] = cut_coords[ii] + right_closest(ii);
                    lower_weight[i] = part_weight;
                }
            }
            let pivot = pivot_position(
                lower_bound[i],
                upper_bound[i],
                lower_weight[i],
                upper_weight[i],
                expected,
            );
            if (cut_coords[i] - pivot).abs() < f64::EPSILON || upper_bound[i] < lower_bound[i] {
                done[i] = true;
                *active -= 1;
                next_coords[i] = cut_coords[i];
            } else {
                next_coords[i] = pivot;
            }
        } else {
            // the cut moves left
            upper_bound[i] = cut_coords[i] - left_closest(i);
            upper_weight[i] = seen;
            for ii in (0..i).rev() {
                let part_weight = global[2 * ii];
                let through_weight = global[2 * ii + 1];
                if part_weight <= expected {
                    if part_weight == expected {
                        upper_bound[i] = cut_coords[ii];
                        upper_weight[i] = part_weight;
                        lower_bound[i] = cut_coords[ii];
                        lower_weight[i] = part_weight;
                    } else if part_weight > lower_weight[i] {
                        lower_bound[i] = cut_coords[ii] + right_closest(ii);
                        lower_weight[i] = part_weight;
                        if through_weight > expected {
                            upper_bound[i] = cut_coords[ii] + right_closest(ii);
                            upper_weight[i] = through_weight;
                        }
                    }
                    break;
                }
                if part_weight < upper_weight[i]
                    || (part_weight == upper_weight[i]
                        && upper_bound[i] > cut_coords[ii] - left_closest(ii))
                {
                    upper_bound[i] = cut_coords[ii] - left_closest(ii);
                    upper_weight[i] = part_weight;
                }
            }
            let pivot = pivot_position(
                lower_bound[i],
                upper_bound[i],
                lower_weight[i],
                upper_weight[i],
                expected,
            );
            if (cut_coords[i] - pivot).abs() < f64::EPSILON || upper_bound[i] < lower_bound[i] {
                done[i] = true;
                *active -= 1;
                next_coords[i] = cut_coords[i];
            } else {
                next_coords[i] = pivot;
            }
        }
    }
}

// Turn the scanned on-cut weight budgets into per-process left-side ratios.
// `global_cut_weights` holds the inclusive prefix sum over ranks, so each
// rank knows how much of the expected on-cut weight the ranks before it
// already claim.
fn resolve_tie_ratios(
    window: &[WindowPart],
    target_ratios: &[f64],
    global_buf: &[f64],
    local_cut_weights: &[f64],
    global_cut_weights: &[f64],
    tie_ratio: &mut [f64],
) {
    for wp in window {
        for i in 0..wp.cuts {
            let idx = wp.cut_offset + i;
            let through_me = global_cut_weights[idx];
            if through_me <= 0.0 {
                continue;
            }
            let expected = wp.total * target_ratios[idx];
            let expected_on_line = expected - global_buf[wp.buf_offset + 2 * i];
            let my_weight_on_line = local_cut_weights[idx];
            let mine = expected_on_line - through_me + my_weight_on_line;
            tie_ratio[idx] = if mine < 0.0 {
                0.0
            } else if mine >= my_weight_on_line {
                1.0
            } else {
                mine / my_weight_on_line
            };
        }
    }
}

fn round_tie_weight(weight: f64) -> f64 {
    ((weight + TIE_ROUND_BIAS) * TIE_ROUND_SCALE).floor() / TIE_ROUND_SCALE
}

// Shared destination buffer for the parallel scatter. Every (chunk, bin)
// pair writes to its own offset range computed by the prefix sums.
#[derive(Clone, Copy)]
struct ScatterPtr<T>(*mut T);

unsafe impl<T: Send> Send for ScatterPtr<T> {}
unsafe impl<T: Send> Sync for ScatterPtr<T> {}

impl<T> ScatterPtr<T> {
    unsafe fn write(&self, index: usize, value: T) {
        self.0.add(index).write(value);
    }
}

// Scatter the points of one finished part into the next permutation buffer:
// resolve every point's destination bin, count per (chunk, bin), prefix-sum
// the counts into disjoint write offsets, then write.
fn counting_sort_part(
    weights: Option<&[f64]>,
    perm: &[usize],
    cache: &mut [u32],
    cuts: &[f64],
    tie_ratio: &[f64],
    local_part_weights: &[f64],
    scans: &[ChunkScan],
    allow_non_rectilinear: bool,
    execution: ExecutionPolicy,
    next_perm: &mut [usize],
    child_ends: &mut [usize],
) {
    let cut_count = cuts.len();
    let split = child_ends.len();
    let chunk = chunk_len(perm.len(), execution);
    let chunk_count = if perm.is_empty() {
        0
    } else {
        perm.len().div_ceil(chunk)
    };
    debug_assert_eq!(chunk_count, scans.len());

    // split each cut's left-side share of the on-cut weight over the chunks
    // in chunk order, so ties resolve identically on every run
    let mut budgets: Vec<Vec<f64>> = vec![vec![0.0; cut_count]; chunk_count];
    if allow_non_rectilinear {
        for i in 0..cut_count {
            let mut left_weight =
                tie_ratio[i] * (local_part_weights[2 * i + 1] - local_part_weights[2 * i]);
            for (budget, scan) in budgets.iter_mut().zip(scans) {
                if left_weight > f64::EPSILON {
                    let chunk_weight = scan.weights[2 * i + 1];
                    budget[i] = chunk_weight.min(left_weight);
                    left_weight -= chunk_weight;
                } else {
                    budget[i] = 0.0;
                }
            }
        }
        for budget in &mut budgets {
            for i in (1..cut_count).rev() {
                if (cuts[i] - cuts[i - 1]).abs() < f64::EPSILON {
                    // coincident cuts see the same on-cut points; keep only
                    // this cut's own share
                    budget[i] -= budget[i - 1];
                }
                budget[i] = round_tie_weight(budget[i]);
            }
        }
    }

    let resolve = |((perm_chunk, cache_chunk), budget): (
        (&[usize], &mut [u32]),
        &mut Vec<f64>,
    )|
     -> Vec<usize> {
        let mut counts = vec![0usize; split];
        for (slot, &point) in perm_chunk.iter().enumerate() {
            let bucket = cache_chunk[slot] as usize;
            let cut = bucket / 2;
            let bin = if bucket % 2 == 1 {
                if allow_non_rectilinear && budget[cut] > f64::EPSILON {
                    let weight = weights.map_or(1.0, |w| w[point]);
                    budget[cut] -= weight;
                    if budget[cut] < 0.0
                        && cut + 1 < cut_count
                        && (cuts[cut + 1] - cuts[cut]).abs() < f64::EPSILON
                    {
                        // roll the overdraft into the coincident twin
                        budget[cut + 1] += budget[cut];
                    }
                    cut
                } else {
                    cut + 1
                }
            } else {
                cut
            };
            counts[bin] += 1;
            cache_chunk[slot] = bin as u32;
        }
        counts
    };
    let mut chunk_counts: Vec<Vec<usize>> = match execution {
        ExecutionPolicy::Parallel => perm
            .par_chunks(chunk)
            .zip(cache.par_chunks_mut(chunk))
            .zip(budgets.par_iter_mut())
            .map(resolve)
            .collect(),
        ExecutionPolicy::Sequential => perm
            .chunks(chunk)
            .zip(cache.chunks_mut(chunk))
            .zip(budgets.iter_mut())
            .map(resolve)
            .collect(),
    };

    // bin totals give the children's boundaries; the per-chunk counts turn
    // into write offsets inside each bin
    let mut totals = vec![0usize; split];
    for bin in 0..split {
        let mut acc = 0;
        for counts in &mut chunk_counts {
            let count = counts[bin];
            counts[bin] = acc;
            acc += count;
        }
        totals[bin] = acc;
    }
    for bin in 1..split {
        totals[bin] += totals[bin - 1];
    }
    for counts in &mut chunk_counts {
        for bin in 1..split {
            counts[bin] += totals[bin - 1];
        }
    }
    child_ends.copy_from_slice(&totals);

    let destination = ScatterPtr(next_perm.as_mut_ptr());
    let scatter = |((perm_chunk, cache_chunk), offsets): (
        (&[usize], &[u32]),
        &mut Vec<usize>,
    )| {
        for (slot, &point) in perm_chunk.iter().enumerate() {
            let bin = cache_chunk[slot] as usize;
            unsafe { destination.write(offsets[bin], point) };
            offsets[bin] += 1;
        }
    };
    match execution {
        ExecutionPolicy::Parallel => perm
            .par_chunks(chunk)
            .zip(cache.par_chunks(chunk))
            .zip(chunk_counts.par_iter_mut())
            .for_each(scatter),
        ExecutionPolicy::Sequential => perm
            .chunks(chunk)
            .zip(cache.chunks(chunk))
            .zip(chunk_counts.iter_mut())
            .for_each(scatter),
    }
}
