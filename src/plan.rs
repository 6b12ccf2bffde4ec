use crate::algorithms::Error;

/// How the jagged partitioner should split the point set, level by level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionPlan {
    /// One entry per level: every part of that level is split into the given
    /// number of sub-parts. The leaf part count is the product of the entries.
    Explicit(Vec<usize>),

    /// A target total part count. Per-level split counts are derived by
    /// taking integer roots: with `l` levels left, the next level splits each
    /// part into roughly the `l`-th root of the parts it still has to
    /// produce, so the split tree may be ragged.
    TotalParts(usize),
}

impl Default for PartitionPlan {
    fn default() -> Self {
        PartitionPlan::TotalParts(2)
    }
}

impl PartitionPlan {
    /// Check the plan before any work is done. A sub-part count below one is
    /// a fatal configuration error.
    pub fn validate(&self) -> Result<(), Error> {
        match self {
            PartitionPlan::Explicit(counts) => {
                if counts.is_empty() {
                    return Err(Error::InvalidPlan {
                        level: 0,
                        part_count: 0,
                    });
                }
                for (level, &part_count) in counts.iter().enumerate() {
                    if part_count < 1 {
                        return Err(Error::InvalidPlan { level, part_count });
                    }
                }
                Ok(())
            }
            PartitionPlan::TotalParts(total) => {
                if *total < 1 {
                    return Err(Error::InvalidPlan {
                        level: 0,
                        part_count: *total,
                    });
                }
                Ok(())
            }
        }
    }

    /// The number of partitioning levels for a point set of dimension `dim`.
    pub fn level_count(&self, dim: usize) -> usize {
        match self {
            PartitionPlan::Explicit(counts) => counts.len(),
            PartitionPlan::TotalParts(_) => dim,
        }
    }

    /// The number of leaf parts the plan produces.
    pub fn total_parts(&self) -> usize {
        match self {
            PartitionPlan::Explicit(counts) => counts.iter().product(),
            PartitionPlan::TotalParts(total) => *total,
        }
    }

    /// The fixed split count of a level, when the plan prescribes one.
    pub(crate) fn fixed_split(&self, level: usize) -> Option<usize> {
        match self {
            PartitionPlan::Explicit(counts) => Some(counts[level]),
            PartitionPlan::TotalParts(_) => None,
        }
    }
}

// Smallest integer close to the `root`-th root of `value`, snapped down when
// floating error leaves it just above a whole number.
pub(crate) fn ceil_root(value: usize, root: u32) -> usize {
    let fp = (value as f64).powf(1.0 / root as f64);
    let ip = fp as usize;
    if fp - (ip as f64) < f64::from(f32::EPSILON) {
        ip
    } else {
        ip + 1
    }
}

/// The split counts of one level, together with the bookkeeping for the next.
#[derive(Debug, Clone)]
pub(crate) struct LevelSplit {
    /// How many sub-parts each current part is split into.
    pub splits: Vec<usize>,

    /// For each child part, how many leaf parts it still has to produce.
    pub future: Vec<usize>,

    /// Total number of parts once this level completes.
    pub out_part_count: usize,
}

// Expand one level of the part tree. `future` holds, per current part, the
// number of leaf parts it still has to produce. With a fixed split count
// every part divides evenly; otherwise each part takes the
// `levels_remaining`-th root of its future count and spreads the remainder
// one by one over its leftmost children.
pub(crate) fn expand_level(
    future: &[usize],
    fixed_split: Option<usize>,
    levels_remaining: u32,
) -> LevelSplit {
    let mut splits = Vec::with_capacity(future.len());
    let mut next_future = Vec::new();
    let mut out_part_count = 0;

    for &num_future in future {
        let split = match fixed_split {
            Some(split) => split,
            None => ceil_root(num_future, levels_remaining),
        };
        splits.push(split);
        out_part_count += split;

        let ideal = num_future / split;
        let remainder = num_future % split;
        for child in 0..split {
            next_future.push(if child < remainder { ideal + 1 } else { ideal });
        }
    }

    LevelSplit {
        splits,
        future: next_future,
        out_part_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_zero_split() {
        // Arrange
        let plan = PartitionPlan::Explicit(vec![2, 0, 3]);

        // Act
        let result = plan.validate();

        // Assert
        assert!(matches!(
            result,
            Err(Error::InvalidPlan {
                level: 1,
                part_count: 0
            })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_total() {
        // Arrange
        let plan = PartitionPlan::TotalParts(0);

        // Act and Assert
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_total_parts_of_explicit_plan() {
        // Arrange
        let plan = PartitionPlan::Explicit(vec![2, 3, 2]);

        // Act and Assert
        assert_eq!(plan.total_parts(), 12);
        assert_eq!(plan.level_count(3), 3);
    }

    #[test]
    fn test_ceil_root() {
        // Arrange and Act
        let exact = ceil_root(16, 2);
        let snapped = ceil_root(8, 3);
        let rounded_up = ceil_root(5, 2);
        let unity = ceil_root(1, 3);

        // Assert
        assert_eq!(exact, 4);
        assert_eq!(snapped, 2);
        assert_eq!(rounded_up, 3);
        assert_eq!(unity, 1);
    }

    #[test]
    fn test_expand_level_fixed_split() {
        // Arrange
        let future = [6, 6];

        // Act
        let split = expand_level(&future, Some(3), 2);

        // Assert
        assert_eq!(split.splits, vec![3, 3]);
        assert_eq!(split.future, vec![2, 2, 2, 2, 2, 2]);
        assert_eq!(split.out_part_count, 6);
    }

    #[test]
    fn test_expand_level_ragged_tree() {
        // Arrange
        let future = [5];

        // Act
        let split = expand_level(&future, None, 2);

        // Assert
        // 5 parts over 2 levels: 3-way split now, remainder spread left.
        assert_eq!(split.splits, vec![3]);
        assert_eq!(split.future, vec![2, 2, 1]);
        assert_eq!(split.out_part_count, 3);
    }

    #[test]
    fn test_expand_level_exhausted_parts() {
        // Arrange
        let future = [1, 1, 1];

        // Act
        let split = expand_level(&future, None, 1);

        // Assert
        assert_eq!(split.splits, vec![1, 1, 1]);
        assert_eq!(split.out_part_count, 3);
    }
}
