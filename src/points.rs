use crate::algorithms::Error;

/// Struct that represents a set of points in d dimensions.
///
/// Coordinates are stored as one array per axis so that a partitioning level
/// can stream a single axis without touching the others. Points never move:
/// algorithms address them through index permutations.
#[derive(Debug, Clone)]
pub struct PointSet {
    coords: Vec<Vec<f64>>,
    len: usize,
}

impl PointSet {
    /// Create a point set from per-axis coordinate arrays.
    ///
    /// All axes must hold the same number of coordinates.
    pub fn new(coords: Vec<Vec<f64>>) -> Result<Self, Error> {
        let len = coords.first().map_or(0, Vec::len);

        for axis in &coords {
            if axis.len() != len {
                return Err(Error::InputLenMismatch {
                    expected: len,
                    actual: axis.len(),
                });
            }
        }

        Ok(Self { coords, len })
    }

    /// The number of points.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set has no points.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of coordinate axes.
    pub fn dim(&self) -> usize {
        self.coords.len()
    }

    /// The coordinates of every point along the given axis.
    pub fn axis(&self, axis: usize) -> &[f64] {
        &self.coords[axis]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_point_set() {
        // Arrange
        let xs = vec![0.0, 1.0, 2.0];
        let ys = vec![5.0, 6.0, 7.0];

        // Act
        let points = PointSet::new(vec![xs, ys]).unwrap();

        // Assert
        assert_eq!(points.len(), 3);
        assert_eq!(points.dim(), 2);
        assert_eq!(points.axis(1)[2], 7.0);
    }

    #[test]
    fn test_new_point_set_len_mismatch() {
        // Arrange
        let xs = vec![0.0, 1.0, 2.0];
        let ys = vec![5.0, 6.0];

        // Act
        let result = PointSet::new(vec![xs, ys]);

        // Assert
        assert!(matches!(
            result,
            Err(Error::InputLenMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_empty_point_set() {
        // Arrange and Act
        let points = PointSet::new(vec![]).unwrap();

        // Assert
        assert!(points.is_empty());
        assert_eq!(points.dim(), 0);
    }
}
