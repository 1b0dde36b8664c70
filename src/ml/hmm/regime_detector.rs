use anyhow::Result;
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::GaussianHMM;

/// Read-only regime labeller around a trained HMM
#[derive(Debug, Clone)]
pub struct RegimeDetector {
    hmm: Arc<GaussianHMM>,
}

impl RegimeDetector {
    pub fn new(hmm: GaussianHMM) -> Self {
        Self { hmm: Arc::new(hmm) }
    }

    /// Create detector from a trained model artifact
    pub fn from_json(path: &Path) -> Result<Self> {
        let hmm = GaussianHMM::load_from_json(path)?;
        info!(
            "Loaded regime detector from {} ({} states, {} features)",
            path.display(),
            hmm.n_states,
            hmm.n_features
        );
        Ok(Self::new(hmm))
    }

    /// Observation width the model expects
    pub fn n_features(&self) -> usize {
        self.hmm.n_features
    }

    pub fn n_states(&self) -> usize {
        self.hmm.n_states
    }

    /// Log-likelihood of a sequence under the detector's model
    pub fn log_likelihood(&self, observations: &Array2<f64>) -> Result<f64> {
        self.hmm.score(observations)
    }

    /// Label every row of a sequence
    pub fn detect_sequence(&self, observations: &Array2<f64>) -> Result<Vec<usize>> {
        self.hmm.predict(observations)
    }

    /// Label a single observation
    pub fn detect(&self, sample: &[f64]) -> Result<usize> {
        let obs = Array2::from_shape_vec((1, sample.len()), sample.to_vec())?;
        let states = self.hmm.predict(&obs)?;
        Ok(states[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_state_detector_labels_zero() {
        let detector = RegimeDetector::new(GaussianHMM::new(1, 3));
        assert_eq!(detector.n_features(), 3);
        assert_eq!(detector.detect(&[1.5, 2.0, 3.0]).unwrap(), 0);
        assert!(detector.detect(&[1.5]).is_err());
    }

    #[test]
    fn test_detect_sequence_length() {
        let detector = RegimeDetector::new(GaussianHMM::new(2, 1));
        let obs = Array2::from_shape_vec((4, 1), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let labels = detector.detect_sequence(&obs).unwrap();
        assert_eq!(labels.len(), 4);
        assert!(labels.iter().all(|&l| l < 2));
        assert_eq!(detector.n_states(), 2);
        assert!(detector.log_likelihood(&obs).unwrap().is_finite());
    }
}
