use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::gbm::{GbmParams, GradientBoostedRegressor};
use super::metrics::{kfold, mse};
use super::{persistence, TradingModel};

/// Seed of the candidate draw, independent of the split seed
pub const SEARCH_SEED: u64 = 42;

/// Candidate values per hyperparameter name
pub type ParamGrid = BTreeMap<String, Vec<f64>>;

/// One sampled hyperparameter assignment
pub type Candidate = BTreeMap<String, f64>;

/// Grid searched when no parameter file is given
pub fn default_grid() -> ParamGrid {
    let mut grid = ParamGrid::new();
    grid.insert("n_estimators".into(), vec![100.0, 200.0, 500.0]);
    grid.insert("max_depth".into(), vec![3.0, 4.0, 6.0, 8.0]);
    grid.insert("learning_rate".into(), vec![0.01, 0.05, 0.1, 0.2]);
    grid.insert("subsample".into(), vec![0.6, 0.8, 1.0]);
    grid.insert("colsample_bytree".into(), vec![0.6, 0.8, 1.0]);
    grid
}

/// Read a `{ "name": [values...] }` parameter file
pub fn load_grid(path: &Path) -> Result<ParamGrid> {
    let grid: ParamGrid = persistence::read_json(path)?;
    if grid.is_empty() {
        bail!("Parameter grid {} is empty", path.display());
    }
    if let Some((name, _)) = grid.iter().find(|(_, values)| values.is_empty()) {
        bail!("Parameter '{}' in {} has no candidate values", name, path.display());
    }
    Ok(grid)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScore {
    pub params: Candidate,
    /// Mean negative MSE across folds (higher is better)
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub best_candidate: Candidate,
    pub best_params: GbmParams,
    pub best_score: f64,
    pub scores: Vec<CandidateScore>,
}

/// Randomized hyperparameter search scored by K-fold cross-validation
#[derive(Debug, Clone)]
pub struct RandomizedSearch {
    grid: ParamGrid,
    n_iter: usize,
    cv: usize,
}

impl RandomizedSearch {
    pub fn new(grid: ParamGrid) -> Self {
        Self {
            grid,
            n_iter: 20,
            cv: 3,
        }
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.n_iter = n_iter;
        self
    }

    pub fn with_cv(mut self, cv: usize) -> Self {
        self.cv = cv;
        self
    }

    /// Draw up to `n_iter` distinct grid points. Small grids are enumerated in full.
    pub fn sample_candidates(&self) -> Result<Vec<Candidate>> {
        if self.grid.values().any(Vec::is_empty) {
            bail!("Every searched parameter needs at least one candidate value");
        }
        let sizes: Vec<usize> = self.grid.values().map(Vec::len).collect();
        let total = sizes
            .iter()
            .try_fold(1usize, |acc, &len| acc.checked_mul(len))
            .ok_or_else(|| anyhow::anyhow!("Parameter grid is too large to enumerate"))?;

        let picks: Vec<usize> = if total <= self.n_iter {
            (0..total).collect()
        } else {
            let mut rng = StdRng::seed_from_u64(SEARCH_SEED);
            sample(&mut rng, total, self.n_iter).into_vec()
        };

        Ok(picks.into_iter().map(|index| self.decode(index)).collect())
    }

    /// Mixed-radix decoding of a flat grid index; the last parameter varies fastest
    fn decode(&self, mut index: usize) -> Candidate {
        let mut candidate = Candidate::new();
        for (name, values) in self.grid.iter().rev() {
            candidate.insert(name.clone(), values[index % values.len()]);
            index /= values.len();
        }
        candidate
    }

    fn params_for(&self, candidate: &Candidate) -> Result<GbmParams> {
        let mut params = GbmParams::default();
        for (name, value) in candidate {
            params.set(name, *value)?;
        }
        params.validate()?;
        Ok(params)
    }

    /// Mean negative MSE of one parameter set across the folds
    fn cross_validate(
        &self,
        params: &GbmParams,
        features: &Array2<f64>,
        target: &Array1<f64>,
        folds: &[(Vec<usize>, Vec<usize>)],
    ) -> Result<f64> {
        let mut total = 0.0;
        for (train, validation) in folds {
            let mut model = GradientBoostedRegressor::with_params(params.clone());
            model.fit(
                &features.select(Axis(0), train),
                &target.select(Axis(0), train),
            )?;
            let predictions = model.predict(&features.select(Axis(0), validation))?;
            total += mse(&target.select(Axis(0), validation), &predictions);
        }
        Ok(-total / folds.len() as f64)
    }

    pub fn fit(&self, features: &Array2<f64>, target: &Array1<f64>) -> Result<SearchResult> {
        let candidates = self.sample_candidates()?;
        let folds = kfold(features.nrows(), self.cv)?;
        info!(
            "Randomized search: {} candidates x {} folds on {} rows",
            candidates.len(),
            folds.len(),
            features.nrows()
        );

        // Parameter names are checked before any model is trained
        let param_sets = candidates
            .iter()
            .map(|candidate| self.params_for(candidate))
            .collect::<Result<Vec<_>>>()?;

        let mut scores = Vec::with_capacity(candidates.len());
        let mut best: Option<(usize, f64)> = None;
        for (i, (candidate, params)) in candidates.iter().zip(&param_sets).enumerate() {
            let score = self.cross_validate(params, features, target, &folds)?;
            debug!("Candidate {:?}: score {:.6}", candidate, score);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((i, score));
            }
            scores.push(CandidateScore {
                params: candidate.clone(),
                score,
            });
        }

        let Some((best_index, best_score)) = best else {
            bail!("Randomized search evaluated no candidates");
        };
        info!(
            "Best parameters {:?} (score {:.6})",
            candidates[best_index], best_score
        );

        Ok(SearchResult {
            best_candidate: candidates[best_index].clone(),
            best_params: param_sets[best_index].clone(),
            best_score,
            scores,
        })
    }
}
