pub mod gaussian_hmm;
pub mod regime_detector;

pub use gaussian_hmm::{GaussianHMM, HmmParams};
pub use regime_detector::RegimeDetector;

/// Per-state label counts over `n_states` states
pub fn state_distribution(labels: &[usize], n_states: usize) -> Vec<usize> {
    let mut counts = vec![0; n_states];
    for &label in labels {
        if label < n_states {
            counts[label] += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_distribution() {
        assert_eq!(state_distribution(&[0, 2, 2, 1, 2], 3), vec![1, 1, 3]);
        assert_eq!(state_distribution(&[], 2), vec![0, 0]);
    }
}
