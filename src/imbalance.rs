// This file has code from https://github.com/LIHPC-Computational-Geometry/coupe (See NOTICE.md)
use num_traits::ToPrimitive;

/// Calculates the total weight for each part of a given partition.
pub fn compute_parts_load(partition: &[usize], num_parts: usize, weights: &[f64]) -> Vec<f64> {
    let mut loads = vec![0.0; num_parts];

    for (&part, w) in partition.iter().zip(weights.iter()) {
        if part < num_parts {
            loads[part] += w;
        }
    }

    loads
}

/// Compute imbalance after passing part loads.
pub fn compute_imbalance_from_part_loads(num_parts: usize, part_loads: &[f64]) -> f64 {
    let total_weight: f64 = part_loads.iter().sum();

    let ideal_part_weight = total_weight / num_parts.to_f64().unwrap_or(1.0);
    if ideal_part_weight == 0.0 {
        return 0.0;
    }

    part_loads
        .iter()
        .map(|part_weight| (part_weight - ideal_part_weight) / ideal_part_weight)
        .fold(0.0f64, |acc, dev| acc.max(dev))
}

/// Compute the imbalance of the given partition.
pub fn imbalance(num_parts: usize, partition: &[usize], weights: &[f64]) -> f64 {
    if num_parts == 0 {
        return 0.0;
    }

    let part_loads = compute_parts_load(partition, num_parts, weights);

    compute_imbalance_from_part_loads(num_parts, &part_loads)
}

/// Signed imbalance of a single cut: how far the weight on the left of the
/// cut deviates from its target share of the total, relative to that target.
/// Zero means the cut is exact, positive means too much weight on the left.
pub fn cut_imbalance(achieved: f64, total_weight: f64, expected_ratio: f64) -> f64 {
    achieved / (total_weight * expected_ratio) - 1.0
}

#[cfg(test)]
mod tests {
    use approx::assert_ulps_eq;
    use itertools::assert_equal;
    use crate::imbalance::{compute_parts_load, cut_imbalance, imbalance};

    #[test]
    fn test_compute_parts_load() {
        // Arrange
        let partition = [0, 0, 1, 1];
        let point_weights = vec![4.0, 7.0, 5.0, 2.0];
        let num_parts = 2;

        // Act
        let partition_weights = compute_parts_load(&partition, num_parts, &point_weights);

        // Assert
        assert_equal(partition_weights, [11.0, 7.0]);
    }

    #[test]
    fn test_imbalance() {
        // Arrange
        let partition = [0, 0, 1, 1];
        let point_weights = vec![3.0, 3.0, 2.0, 2.0];
        let num_parts = 2;

        // Act
        let imb = imbalance(num_parts, &partition, &point_weights);

        // Assert
        assert_ulps_eq!(imb, 0.2);
    }

    #[test]
    fn test_cut_imbalance() {
        // Arrange
        let total = 8.0;

        // Act
        let exact = cut_imbalance(2.0, total, 0.25);
        let heavy_left = cut_imbalance(3.0, total, 0.25);
        let light_left = cut_imbalance(1.0, total, 0.25);

        // Assert
        assert_ulps_eq!(exact, 0.0);
        assert_ulps_eq!(heavy_left, 0.5);
        assert_ulps_eq!(light_left, -0.5);
    }
}
