use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;
use tracing::{debug, warn};

use crate::ml::persistence;
use crate::ml::ModelError;

const INTERCHANGE_KIND: &str = "gaussian_hmm";

/// Shape of the per-state emission covariance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceType {
    /// One variance per feature
    #[default]
    Diag,
    /// One variance shared by all features
    Spherical,
}

/// Training parameters for the regime detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HmmParams {
    pub n_components: usize,
    pub covariance_type: CovarianceType,
    pub n_iter: usize,
    pub tol: f64,
    pub min_covar: f64,
}

impl Default for HmmParams {
    fn default() -> Self {
        Self {
            n_components: 3,
            covariance_type: CovarianceType::Diag,
            n_iter: 100,
            tol: 1e-4,
            min_covar: 1e-3,
        }
    }
}

/// K-state Hidden Markov Model with Gaussian emissions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianHMM {
    /// Number of hidden states
    pub n_states: usize,
    /// Width of one observation; 0 in artifacts written before it was recorded
    #[serde(default)]
    pub n_features: usize,
    #[serde(default)]
    pub covariance_type: CovarianceType,
    /// State transition matrix (n_states x n_states)
    pub transition: Array2<f64>,
    /// Initial state probabilities (n_states)
    pub start_prob: Array1<f64>,
    /// Mean vectors for each state (n_states x n_features)
    pub means: Array2<f64>,
    /// Per-state variances (n_states x n_features); spherical rows repeat one value
    pub covars: Array2<f64>,
    /// Floor added to every variance estimate
    #[serde(default = "default_min_covar")]
    pub min_covar: f64,
}

fn default_min_covar() -> f64 {
    1e-3
}

impl GaussianHMM {
    /// Create a new HMM with uniform start probabilities and unit variances
    pub fn new(n_states: usize, n_features: usize) -> Self {
        let start_prob = Array1::from_elem(n_states, 1.0 / n_states as f64);

        // Slight self-persistence bias
        let mut transition = if n_states > 1 {
            Array2::from_elem((n_states, n_states), 0.5 / (n_states - 1) as f64)
        } else {
            Array2::zeros((n_states, n_states))
        };
        for i in 0..n_states {
            transition[[i, i]] = if n_states > 1 { 0.5 } else { 1.0 };
        }

        Self {
            n_states,
            n_features,
            covariance_type: CovarianceType::Diag,
            transition,
            start_prob,
            means: Array2::zeros((n_states, n_features)),
            covars: Array2::ones((n_states, n_features)),
            min_covar: default_min_covar(),
        }
    }

    pub fn from_params(params: &HmmParams, n_features: usize) -> Self {
        let mut hmm = Self::new(params.n_components, n_features);
        hmm.covariance_type = params.covariance_type;
        hmm.min_covar = params.min_covar;
        hmm
    }

    fn check_features(&self, observations: &Array2<f64>) -> Result<()> {
        if observations.ncols() != self.n_features {
            return Err(ModelError::FeatureMismatch {
                expected: self.n_features,
                actual: observations.ncols(),
            }
            .into());
        }
        Ok(())
    }

    /// Initialize means and variances with K-means over contiguous slices
    pub fn init_with_kmeans(&mut self, observations: &Array2<f64>) -> Result<()> {
        self.check_features(observations)?;

        let n_obs = observations.nrows();
        let mut labels: Vec<usize> = (0..n_obs).map(|i| (i * self.n_states) / n_obs).collect();

        for _ in 0..10 {
            self.means.fill(0.0);
            let mut counts = vec![0usize; self.n_states];

            for (i, &label) in labels.iter().enumerate() {
                for j in 0..self.n_features {
                    self.means[[label, j]] += observations[[i, j]];
                }
                counts[label] += 1;
            }

            for state in 0..self.n_states {
                if counts[state] > 0 {
                    for j in 0..self.n_features {
                        self.means[[state, j]] /= counts[state] as f64;
                    }
                }
            }

            for (i, label) in labels.iter_mut().enumerate() {
                let obs = observations.row(i);
                let mut min_dist = f64::INFINITY;
                let mut best_state = 0;

                for state in 0..self.n_states {
                    let dist: f64 = obs
                        .iter()
                        .zip(self.means.row(state).iter())
                        .map(|(o, m)| (o - m).powi(2))
                        .sum();

                    if dist < min_dist {
                        min_dist = dist;
                        best_state = state;
                    }
                }
                *label = best_state;
            }
        }

        // Clusters too small for a variance estimate fall back to the global one
        let global_mean = observations.mean_axis(ndarray::Axis(0)).unwrap_or_else(|| Array1::zeros(self.n_features));
        let global_var = weighted_variance(observations, &Array1::ones(n_obs), global_mean.view());

        for state in 0..self.n_states {
            let weights = Array1::from_iter(labels.iter().map(|&l| if l == state { 1.0 } else { 0.0 }));
            let variance = if weights.sum() >= 2.0 {
                weighted_variance(observations, &weights, self.means.row(state))
            } else {
                global_var.clone()
            };
            self.set_variance(state, variance);
        }

        Ok(())
    }

    fn set_variance(&mut self, state: usize, variance: Array1<f64>) {
        let variance = match self.covariance_type {
            CovarianceType::Diag => variance,
            CovarianceType::Spherical => {
                let shared = variance.mean().unwrap_or(0.0);
                Array1::from_elem(self.n_features, shared)
            }
        };
        for (j, v) in variance.iter().enumerate() {
            self.covars[[state, j]] = v + self.min_covar;
        }
    }

    /// Log density of one observation under each state (n_obs x n_states)
    fn log_emissions(&self, observations: &Array2<f64>) -> Array2<f64> {
        let n_obs = observations.nrows();
        let log_2pi = (2.0 * PI).ln();
        let mut log_b = Array2::zeros((n_obs, self.n_states));

        for t in 0..n_obs {
            let obs = observations.row(t);
            for state in 0..self.n_states {
                let mut acc = 0.0;
                for j in 0..self.n_features {
                    let var = self.covars[[state, j]];
                    let diff = obs[j] - self.means[[state, j]];
                    acc += log_2pi + var.ln() + diff * diff / var;
                }
                log_b[[t, state]] = -0.5 * acc;
            }
        }

        log_b
    }

    /// Forward algorithm in log space
    fn forward(&self, log_b: &Array2<f64>) -> (Array2<f64>, f64) {
        let n_obs = log_b.nrows();
        let log_trans = self.transition.mapv(f64::ln);
        let mut log_alpha = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);

        for state in 0..self.n_states {
            log_alpha[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        let mut terms = vec![0.0; self.n_states];
        for t in 1..n_obs {
            for j in 0..self.n_states {
                for i in 0..self.n_states {
                    terms[i] = log_alpha[[t - 1, i]] + log_trans[[i, j]];
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + log_b[[t, j]];
            }
        }

        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());
        (log_alpha, log_prob)
    }

    /// Backward algorithm in log space
    fn backward(&self, log_b: &Array2<f64>) -> Array2<f64> {
        let n_obs = log_b.nrows();
        let log_trans = self.transition.mapv(f64::ln);
        let mut log_beta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);

        for state in 0..self.n_states {
            log_beta[[n_obs - 1, state]] = 0.0;
        }

        let mut terms = vec![0.0; self.n_states];
        for t in (0..n_obs - 1).rev() {
            for i in 0..self.n_states {
                for j in 0..self.n_states {
                    terms[j] = log_trans[[i, j]] + log_b[[t + 1, j]] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    fn posteriors(log_alpha: &Array2<f64>, log_beta: &Array2<f64>) -> Array2<f64> {
        let (n_obs, n_states) = log_alpha.dim();
        let mut gamma = Array2::zeros((n_obs, n_states));
        let mut terms = vec![0.0; n_states];

        for t in 0..n_obs {
            for s in 0..n_states {
                terms[s] = log_alpha[[t, s]] + log_beta[[t, s]];
            }
            let log_denom = log_sum_exp(&terms);
            for s in 0..n_states {
                gamma[[t, s]] = (terms[s] - log_denom).exp();
            }
        }

        gamma
    }

    /// Train HMM using Baum-Welch EM algorithm
    /// Returns (final_log_likelihood, iterations_run)
    pub fn fit(&mut self, observations: &Array2<f64>, n_iter: usize, tol: f64) -> Result<(f64, usize)> {
        self.check_features(observations)?;

        let n_obs = observations.nrows();
        if n_obs < self.n_states.max(2) {
            bail!(
                "Need at least {} observations to fit {} states, got {}",
                self.n_states.max(2),
                self.n_states,
                n_obs
            );
        }
        if observations.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::InvalidData("observations contain non-finite values".into()).into());
        }

        self.init_with_kmeans(observations)?;

        let mut prev_log_prob = f64::NEG_INFINITY;

        for iteration in 0..n_iter {
            // E-step
            let log_b = self.log_emissions(observations);
            let (log_alpha, log_prob) = self.forward(&log_b);
            let log_beta = self.backward(&log_b);

            debug!("EM iteration {}: log-likelihood {:.4}", iteration + 1, log_prob);
            if (log_prob - prev_log_prob).abs() < tol {
                return Ok((log_prob, iteration + 1));
            }
            prev_log_prob = log_prob;

            let gamma = Self::posteriors(&log_alpha, &log_beta);

            let log_trans = self.transition.mapv(f64::ln);
            let mut xi_sum = Array2::zeros((self.n_states, self.n_states));
            for t in 0..n_obs - 1 {
                for i in 0..self.n_states {
                    for j in 0..self.n_states {
                        let log_xi = log_alpha[[t, i]]
                            + log_trans[[i, j]]
                            + log_b[[t + 1, j]]
                            + log_beta[[t + 1, j]]
                            - log_prob;
                        xi_sum[[i, j]] += log_xi.exp();
                    }
                }
            }

            // M-step
            for state in 0..self.n_states {
                self.start_prob[state] = gamma[[0, state]];
            }

            for i in 0..self.n_states {
                let row_sum: f64 = xi_sum.row(i).sum();
                if row_sum > 0.0 {
                    for j in 0..self.n_states {
                        self.transition[[i, j]] = xi_sum[[i, j]] / row_sum;
                    }
                }
            }

            for state in 0..self.n_states {
                let weights = gamma.column(state).to_owned();
                let gamma_sum = weights.sum();
                if gamma_sum <= f64::MIN_POSITIVE {
                    continue;
                }

                for feat in 0..self.n_features {
                    let weighted: f64 = weights
                        .iter()
                        .zip(observations.column(feat).iter())
                        .map(|(w, x)| w * x)
                        .sum();
                    self.means[[state, feat]] = weighted / gamma_sum;
                }

                let mean = self.means.row(state).to_owned();
                let variance = weighted_variance(observations, &weights, mean.view());
                self.set_variance(state, variance);
            }
        }

        Ok((prev_log_prob, n_iter))
    }

    /// Log-likelihood of a sequence under the model
    pub fn score(&self, observations: &Array2<f64>) -> Result<f64> {
        self.check_sequence(observations)?;
        let log_b = self.log_emissions(observations);
        Ok(self.forward(&log_b).1)
    }

    /// Posterior state probabilities per observation (n_obs x n_states)
    pub fn predict_proba(&self, observations: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_sequence(observations)?;
        let log_b = self.log_emissions(observations);
        let (log_alpha, _) = self.forward(&log_b);
        let log_beta = self.backward(&log_b);
        Ok(Self::posteriors(&log_alpha, &log_beta))
    }

    fn check_sequence(&self, observations: &Array2<f64>) -> Result<()> {
        if observations.nrows() == 0 {
            bail!("Cannot decode an empty observation sequence");
        }
        self.check_features(observations)
    }

    /// Most likely state sequence (Viterbi)
    pub fn predict(&self, observations: &Array2<f64>) -> Result<Vec<usize>> {
        self.check_sequence(observations)?;

        let n_obs = observations.nrows();
        let log_b = self.log_emissions(observations);
        let log_trans = self.transition.mapv(f64::ln);
        let mut log_delta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((n_obs, self.n_states));

        for state in 0..self.n_states {
            log_delta[[0, state]] = self.start_prob[state].ln() + log_b[[0, state]];
        }

        for t in 1..n_obs {
            for j in 0..self.n_states {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_state = 0;

                for i in 0..self.n_states {
                    let val = log_delta[[t - 1, i]] + log_trans[[i, j]];
                    if val > max_val {
                        max_val = val;
                        max_state = i;
                    }
                }

                log_delta[[t, j]] = max_val + log_b[[t, j]];
                psi[[t, j]] = max_state;
            }
        }

        let mut states = vec![0; n_obs];
        let mut max_val = f64::NEG_INFINITY;
        for state in 0..self.n_states {
            if log_delta[[n_obs - 1, state]] > max_val {
                max_val = log_delta[[n_obs - 1, state]];
                states[n_obs - 1] = state;
            }
        }

        for t in (0..n_obs - 1).rev() {
            states[t] = psi[[t + 1, states[t + 1]]];
        }

        Ok(states)
    }

    /// Save the model as a JSON artifact
    pub fn save_json(&self, path: &Path) -> Result<()> {
        persistence::write_json(path, self)
    }

    /// Load a JSON artifact or its interchange mirror. Older artifacts without
    /// `n_features` get it from the means; artifacts without any emission
    /// columns become one-feature models with neutral emissions.
    pub fn load_from_json(path: &Path) -> Result<Self> {
        let value: serde_json::Value = persistence::read_json(path)?;
        let mut hmm: GaussianHMM = if value.get("format").is_some() {
            persistence::read_interchange(path, INTERCHANGE_KIND)?
        } else {
            serde_json::from_value(value)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        };
        if hmm.n_features == 0 {
            if hmm.means.ncols() == 0 {
                warn!(
                    "{} has no emission columns; assuming one feature with neutral emissions",
                    path.display()
                );
                hmm.means = Array2::zeros((hmm.n_states, 1));
                hmm.covars = Array2::ones((hmm.n_states, 1));
            }
            hmm.n_features = hmm.means.ncols();
            debug!("Inferred n_features = {} for {}", hmm.n_features, path.display());
        }
        hmm.validate_shapes()
            .with_context(|| format!("Invalid regime model {}", path.display()))?;
        Ok(hmm)
    }

    fn validate_shapes(&self) -> Result<()> {
        let k = self.n_states;
        if k == 0 {
            bail!("model has no states");
        }
        if self.transition.dim() != (k, k) {
            bail!("transition matrix is {:?}, expected ({}, {})", self.transition.dim(), k, k);
        }
        if self.start_prob.len() != k {
            bail!("start_prob has {} entries, expected {}", self.start_prob.len(), k);
        }
        if self.means.dim() != (k, self.n_features) {
            return Err(anyhow!(
                "means are {:?}, expected ({}, {})",
                self.means.dim(),
                k,
                self.n_features
            ));
        }
        if self.covars.dim() != (k, self.n_features) {
            bail!("covars are {:?}, expected ({}, {})", self.covars.dim(), k, self.n_features);
        }
        Ok(())
    }

    /// Write the portable mirror consumed by downstream tooling
    pub fn export_interchange(&self, path: &Path) -> Result<()> {
        persistence::write_interchange(path, INTERCHANGE_KIND, self.n_features, "label", self)
    }
}

/// Per-feature variance of observations around `mean`, weighted by `weights`
fn weighted_variance(
    observations: &Array2<f64>,
    weights: &Array1<f64>,
    mean: ArrayView1<f64>,
) -> Array1<f64> {
    let total = weights.sum();
    let mut variance = Array1::zeros(observations.ncols());
    if total <= 0.0 {
        return variance;
    }
    for (row, w) in observations.rows().into_iter().zip(weights.iter()) {
        for (j, x) in row.iter().enumerate() {
            let diff = x - mean[j];
            variance[j] += w * diff * diff;
        }
    }
    variance / total
}

/// Log-sum-exp trick for numerical stability
pub(crate) fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}
