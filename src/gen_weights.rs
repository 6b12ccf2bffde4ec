use rand::{Rng};

/// Generate the weight vector where each point has the same weight
pub fn gen_uniform_weights(no_of_points: usize) -> Vec<f64> {
    vec![1.0; no_of_points]
}

/// Generate the weight vector where each point has a random weight
pub fn gen_random_weights(no_of_points: usize, min_weight: f64, max_weight: f64) -> Vec<f64> {
    if max_weight < min_weight {
        panic!("Max weight must be greater than min weight.");
    }

    if max_weight < 0.0 || min_weight <= 0.0 {
        panic!("Max/min weight must be non-negative.");
    }
    let mut rng = rand::thread_rng();

    let random_weights: Vec<f64> = (0..no_of_points)
        .map(|_| rng.gen_range(min_weight..max_weight))
        .collect();

    random_weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_uniform_weights() {
        // Arrange and Act
        let weights = gen_uniform_weights(4);

        // Assert
        assert_eq!(weights, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_gen_random_weights_in_range() {
        // Arrange and Act
        let weights = gen_random_weights(100, 1.0, 3.0);

        // Assert
        assert_eq!(weights.len(), 100);
        assert!(weights.iter().all(|w| (1.0..3.0).contains(w)));
    }
}
