// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe
use std::fmt;

mod jagged;

pub use jagged::ExecutionPolicy;
pub use jagged::JaggedPartitioner;
pub use jagged::Metadata;
pub use jagged::SearchPolicy;

use crate::comm::CommError;

/// Common errors thrown by algorithms.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A partition plan asked for fewer than one sub-part at some level.
    InvalidPlan { level: usize, part_count: usize },

    /// Input sets don't have matching lengths.
    InputLenMismatch { expected: usize, actual: usize },

    /// A distributed collective failed; the partitioning call is aborted.
    Collective(CommError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPlan { level, part_count } => write!(
                f,
                "partition plan requests {part_count} sub-parts at level {level} (must be at least 1)",
            ),
            Error::InputLenMismatch { expected, actual } => write!(
                f,
                "input sets don't have the same length (expected {expected} items, got {actual})",
            ),
            Error::Collective(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CommError> for Error {
    fn from(e: CommError) -> Self {
        Error::Collective(e)
    }
}
