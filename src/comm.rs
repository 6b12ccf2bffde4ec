use std::fmt;

/// Error raised by a [`Collective`] backend when a collective call cannot be
/// completed. The partitioner treats any such failure as fatal.
#[derive(Debug, Clone)]
pub struct CommError {
    pub message: String,
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collective communication failed: {}", self.message)
    }
}

impl std::error::Error for CommError {}

/// The distributed collective primitive the cut solver runs on.
///
/// Every process of the partitioning call must hold one of these and enter
/// each collective the same number of times with the same buffer layouts; the
/// solver loop is gated on reduced aggregates, so no process may skip a
/// round. The crate ships [`SingleProcess`]; multi-process backends (e.g. an
/// MPI binding) implement the same trait and can reuse the combine functions
/// below for a portable manual all-reduce.
pub trait Collective {
    /// The rank of this process, in `0..size()`.
    fn rank(&self) -> usize;

    /// The number of cooperating processes.
    fn size(&self) -> usize;

    /// Combined reduction of per-part bound data: `k` minimums, then `k`
    /// maximums, then `k` sums, all in one round.
    fn allreduce_min_max_sum(
        &self,
        k: usize,
        local: &[f64],
        global: &mut [f64],
    ) -> Result<(), CommError>;

    /// Combined reduction of cut-search data for a window of parts. For each
    /// part with `c` cuts the buffer holds `2c + 1` weight buckets (summed),
    /// then `c` left-closest distances (minimized), then `c` right-closest
    /// distances (minimized), concatenated over `part_cuts`. One round,
    /// regardless of the window size.
    fn allreduce_sum_min_min(
        &self,
        part_cuts: &[usize],
        local: &[f64],
        global: &mut [f64],
    ) -> Result<(), CommError>;

    /// Inclusive prefix sum over process ranks, element-wise.
    fn scan_sum(&self, local: &[f64], global: &mut [f64]) -> Result<(), CommError>;
}

/// The length of a `sum_min_min` buffer for the given per-part cut counts.
pub fn sum_min_min_len(part_cuts: &[usize]) -> usize {
    part_cuts.iter().map(|&cuts| 4 * cuts + 1).sum()
}

/// Element-wise combine step of the `sum_min_min` reduction: accumulate
/// `from` into `into` following the per-part layout described on
/// [`Collective::allreduce_sum_min_min`].
pub fn combine_sum_min_min(part_cuts: &[usize], into: &mut [f64], from: &[f64]) {
    let mut next = 0;
    for &cuts in part_cuts {
        for _ in 0..2 * cuts + 1 {
            into[next] += from[next];
            next += 1;
        }
        for _ in 0..2 * cuts {
            if into[next] > from[next] {
                into[next] = from[next];
            }
            next += 1;
        }
    }
}

/// Element-wise combine step of the `min_max_sum` reduction.
pub fn combine_min_max_sum(k: usize, into: &mut [f64], from: &[f64]) {
    let mut next = 0;
    for _ in 0..k {
        if into[next] > from[next] {
            into[next] = from[next];
        }
        next += 1;
    }
    for _ in 0..k {
        if into[next] < from[next] {
            into[next] = from[next];
        }
        next += 1;
    }
    for _ in 0..k {
        into[next] += from[next];
        next += 1;
    }
}

/// Trivial backend for a single process: every collective is a copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_min_max_sum(
        &self,
        k: usize,
        local: &[f64],
        global: &mut [f64],
    ) -> Result<(), CommError> {
        if local.len() != 3 * k || global.len() != 3 * k {
            return Err(CommError {
                message: format!("min_max_sum buffer sized {}, expected {}", local.len(), 3 * k),
            });
        }
        global.copy_from_slice(local);
        Ok(())
    }

    fn allreduce_sum_min_min(
        &self,
        part_cuts: &[usize],
        local: &[f64],
        global: &mut [f64],
    ) -> Result<(), CommError> {
        let expected = sum_min_min_len(part_cuts);
        if local.len() != expected || global.len() != expected {
            return Err(CommError {
                message: format!(
                    "sum_min_min buffer sized {}, expected {}",
                    local.len(),
                    expected
                ),
            });
        }
        global.copy_from_slice(local);
        Ok(())
    }

    fn scan_sum(&self, local: &[f64], global: &mut [f64]) -> Result<(), CommError> {
        global.copy_from_slice(local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::assert_equal;

    #[test]
    fn test_combine_sum_min_min() {
        // Arrange
        // Two parts in the window: 2 cuts and 1 cut.
        let part_cuts = [2, 1];
        let mut into = vec![
            1.0, 2.0, 3.0, 4.0, 5.0, /* left */ 0.5, 9.0, /* right */ 8.0, 0.25, //
            6.0, 7.0, 8.0, /* left */ 3.0, /* right */ 1.0,
        ];
        let from = vec![
            1.0, 1.0, 1.0, 1.0, 1.0, /* left */ 2.0, 2.0, /* right */ 2.0, 2.0, //
            1.0, 1.0, 1.0, /* left */ 1.0, /* right */ 2.0,
        ];

        // Act
        combine_sum_min_min(&part_cuts, &mut into, &from);

        // Assert
        assert_equal(
            into,
            vec![
                2.0, 3.0, 4.0, 5.0, 6.0, 0.5, 2.0, 2.0, 0.25, //
                7.0, 8.0, 9.0, 1.0, 1.0,
            ],
        );
    }

    #[test]
    fn test_combine_min_max_sum() {
        // Arrange
        let mut into = vec![3.0, -1.0, 2.0, 5.0, 10.0, 10.0];
        let from = vec![1.0, 0.0, 4.0, 4.0, 1.0, 2.0];

        // Act
        combine_min_max_sum(2, &mut into, &from);

        // Assert
        assert_equal(into, vec![1.0, -1.0, 4.0, 5.0, 11.0, 12.0]);
    }

    #[test]
    fn test_single_process_is_identity() {
        // Arrange
        let comm = SingleProcess;
        let local = vec![2.0, 4.0, 8.0, 1.0, 0.0];
        let mut global = vec![0.0; 5];

        // Act
        comm.allreduce_sum_min_min(&[1], &local, &mut global).unwrap();

        // Assert
        assert_equal(global, local);
        assert_eq!(comm.size(), 1);
        assert_eq!(comm.rank(), 0);
    }

    #[test]
    fn test_single_process_rejects_bad_layout() {
        // Arrange
        let comm = SingleProcess;
        let local = vec![0.0; 4];
        let mut global = vec![0.0; 4];

        // Act
        let result = comm.allreduce_sum_min_min(&[1], &local, &mut global);

        // Assert
        assert!(result.is_err());
    }
}
