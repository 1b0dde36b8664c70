use anyhow::{bail, Result};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::persistence;

pub fn mse(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let sum: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    sum / y_true.len() as f64
}

pub fn rmse(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    mse(y_true, y_pred).sqrt()
}

/// Coefficient of determination. A constant target scores 1.0 when matched
/// exactly and 0.0 otherwise.
pub fn r2(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    let mean = y_true.mean().unwrap_or(0.0);
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();

    if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Held-out evaluation of a trained regressor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub r2: f64,
    pub n_train: usize,
    pub n_test: usize,
}

impl RegressionMetrics {
    pub fn evaluate(
        y_true: &Array1<f64>,
        y_pred: &Array1<f64>,
        n_train: usize,
    ) -> Self {
        Self {
            rmse: rmse(y_true, y_pred),
            r2: r2(y_true, y_pred),
            n_train,
            n_test: y_true.len(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persistence::write_json(path, self)
    }
}

/// Shuffled split of `n` row indices into (train, test); the test side gets
/// `ceil(test_size * n)` rows.
pub fn train_test_split(n: usize, test_size: f64, seed: u64) -> Result<(Vec<usize>, Vec<usize>)> {
    if !(test_size > 0.0 && test_size < 1.0) {
        bail!("test_size must be between 0 and 1, got {}", test_size);
    }
    let n_test = (test_size * n as f64).ceil() as usize;
    if n_test == 0 || n_test >= n {
        bail!(
            "Cannot split {} rows with test_size {}: one side would be empty",
            n,
            test_size
        );
    }

    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let train = indices.split_off(n_test);
    Ok((train, indices))
}

/// Contiguous, unshuffled K-fold partition as (train, validation) index pairs.
/// The first `n % k` folds get one extra row.
pub fn kfold(n: usize, k: usize) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 {
        bail!("K-fold needs at least 2 folds, got {}", k);
    }
    if n < k {
        bail!("Cannot make {} folds from {} rows", k, n);
    }

    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for fold in 0..k {
        let size = n / k + usize::from(fold < n % k);
        let validation: Vec<usize> = (start..start + size).collect();
        let train: Vec<usize> = (0..start).chain(start + size..n).collect();
        folds.push((train, validation));
        start += size;
    }
    Ok(folds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rmse_and_r2() {
        let y = array![1.0, 2.0, 3.0, 4.0];
        let perfect = y.clone();
        assert_eq!(rmse(&y, &perfect), 0.0);
        assert_eq!(r2(&y, &perfect), 1.0);

        let off = array![2.0, 3.0, 4.0, 5.0];
        assert_eq!(rmse(&y, &off), 1.0);
        assert!((r2(&y, &off) - (1.0 - 4.0 / 5.0)).abs() < 1e-12);
    }

    #[test]
    fn test_r2_constant_target() {
        let y = array![3.0, 3.0, 3.0];
        assert_eq!(r2(&y, &y.clone()), 1.0);
        assert_eq!(r2(&y, &array![3.0, 3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_split_sizes_and_determinism() {
        let (train, test) = train_test_split(10, 0.25, 42).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);

        let mut all: Vec<usize> = train.iter().chain(test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        assert_eq!(train_test_split(10, 0.25, 42).unwrap(), (train, test));
    }

    #[test]
    fn test_split_rejects_empty_side() {
        assert!(train_test_split(1, 0.2, 0).is_err());
        assert!(train_test_split(0, 0.2, 0).is_err());
        assert!(train_test_split(10, 1.0, 0).is_err());
    }

    #[test]
    fn test_kfold_partitions() {
        let folds = kfold(10, 3).unwrap();
        let sizes: Vec<usize> = folds.iter().map(|(_, v)| v.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(folds[1].1, vec![4, 5, 6]);
        assert_eq!(folds[1].0.len(), 7);
        assert!(kfold(2, 3).is_err());
    }

    #[test]
    fn test_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = RegressionMetrics::evaluate(&array![1.0, 2.0], &array![1.0, 2.0], 8);
        metrics.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["n_train"], 8);
        assert_eq!(value["n_test"], 2);
        assert_eq!(value["rmse"], 0.0);
    }
}
