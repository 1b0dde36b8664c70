use anyhow::Result;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

use super::tree::{RegressionTree, TreeParams};
use crate::ml::persistence::{self, ModelType};
use crate::ml::{ModelError, TradingModel};

/// Accepted but without effect on this implementation
const IGNORED_HYPERPARAMS: [&str; 4] = ["n_jobs", "verbosity", "tree_method", "eval_metric"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbmParams {
    pub n_estimators: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Fraction of rows drawn (without replacement) per tree
    pub subsample: f64,
    /// Fraction of feature columns drawn per tree
    pub colsample_bytree: f64,
    pub reg_lambda: f64,
    pub reg_alpha: f64,
    /// Minimum loss reduction needed to split a leaf
    pub gamma: f64,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for GbmParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: 6,
            learning_rate: 0.3,
            subsample: 1.0,
            colsample_bytree: 1.0,
            reg_lambda: 1.0,
            reg_alpha: 0.0,
            gamma: 0.0,
            min_samples_leaf: 1,
            seed: 0,
        }
    }
}

impl GbmParams {
    /// Build from the free-form `hyperparams` object of a model entry
    pub fn from_hyperparams(hyperparams: &Map<String, Value>) -> Result<Self> {
        let mut params = Self::default();
        for (name, value) in hyperparams {
            if IGNORED_HYPERPARAMS.contains(&name.as_str()) {
                debug!("Ignoring hyperparameter {}", name);
                continue;
            }
            if name == "objective" {
                match value.as_str() {
                    Some("reg:squarederror") | Some("reg:linear") => continue,
                    _ => {
                        return Err(ModelError::InvalidData(format!(
                            "unsupported objective {}",
                            value
                        ))
                        .into())
                    }
                }
            }
            let number = value.as_f64().ok_or_else(|| {
                ModelError::InvalidData(format!("hyperparameter {} must be numeric, got {}", name, value))
            })?;
            params.set(name, number)?;
        }
        params.validate()?;
        Ok(params)
    }

    /// Set one parameter by name. Integer parameters are truncated.
    pub fn set(&mut self, name: &str, value: f64) -> Result<(), ModelError> {
        match name {
            "n_estimators" => self.n_estimators = value as usize,
            "max_depth" => self.max_depth = value as usize,
            "learning_rate" | "eta" => self.learning_rate = value,
            "subsample" => self.subsample = value,
            "colsample_bytree" => self.colsample_bytree = value,
            "reg_lambda" | "lambda" => self.reg_lambda = value,
            "reg_alpha" | "alpha" => self.reg_alpha = value,
            "gamma" | "min_split_loss" => self.gamma = value,
            "min_samples_leaf" | "min_child_weight" => self.min_samples_leaf = value as usize,
            "seed" | "random_state" => self.seed = value as u64,
            other => return Err(ModelError::UnknownParameter(other.to_string())),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::InvalidData("learning_rate must be positive".into()));
        }
        if !(self.subsample > 0.0 && self.subsample <= 1.0) {
            return Err(ModelError::InvalidData("subsample must be in (0, 1]".into()));
        }
        if !(self.colsample_bytree > 0.0 && self.colsample_bytree <= 1.0) {
            return Err(ModelError::InvalidData("colsample_bytree must be in (0, 1]".into()));
        }
        if self.reg_lambda < 0.0 {
            return Err(ModelError::InvalidData("reg_lambda must be non-negative".into()));
        }
        if self.reg_alpha < 0.0 {
            return Err(ModelError::InvalidData("reg_alpha must be non-negative".into()));
        }
        if self.gamma < 0.0 {
            return Err(ModelError::InvalidData("gamma must be non-negative".into()));
        }
        Ok(())
    }

    fn tree_params(&self) -> TreeParams {
        TreeParams {
            max_depth: self.max_depth,
            min_samples_leaf: self.min_samples_leaf,
            reg_lambda: self.reg_lambda,
            reg_alpha: self.reg_alpha,
            gamma: self.gamma,
        }
    }
}

/// Gradient-boosted regression trees with squared loss
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedRegressor {
    params: GbmParams,
    base_score: f64,
    n_features: Option<usize>,
    trees: Vec<RegressionTree>,
}

impl GradientBoostedRegressor {
    pub fn new() -> Self {
        Self::with_params(GbmParams::default())
    }

    pub fn with_params(params: GbmParams) -> Self {
        Self {
            params,
            base_score: 0.0,
            n_features: None,
            trees: Vec::new(),
        }
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn is_trained(&self) -> bool {
        self.n_features.is_some()
    }

    fn sample_indices(rng: &mut StdRng, total: usize, fraction: f64) -> Vec<usize> {
        if fraction >= 1.0 || total == 0 {
            return (0..total).collect();
        }
        let amount = ((total as f64 * fraction).round() as usize).clamp(1, total);
        let mut picked = sample(rng, total, amount).into_vec();
        picked.sort_unstable();
        picked
    }
}

impl Default for GradientBoostedRegressor {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingModel for GradientBoostedRegressor {
    fn fit(&mut self, features: &Array2<f64>, target: &Array1<f64>) -> Result<()> {
        let (n_rows, n_cols) = features.dim();
        if n_rows == 0 {
            return Err(ModelError::InvalidData("cannot fit on zero rows".into()).into());
        }
        if target.len() != n_rows {
            return Err(ModelError::InvalidData(format!(
                "{} feature rows but {} targets",
                n_rows,
                target.len()
            ))
            .into());
        }
        self.params.validate()?;

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let tree_params = self.params.tree_params();
        self.base_score = target.mean().unwrap_or(0.0);
        self.trees.clear();

        let mut predictions = vec![self.base_score; n_rows];
        let mut residuals = vec![0.0; n_rows];

        for round in 0..self.params.n_estimators {
            for (i, r) in residuals.iter_mut().enumerate() {
                *r = target[i] - predictions[i];
            }
            let rows = Self::sample_indices(&mut rng, n_rows, self.params.subsample);
            let columns = Self::sample_indices(&mut rng, n_cols, self.params.colsample_bytree);

            let tree = RegressionTree::fit(features, &residuals, &rows, &columns, &tree_params);
            for (i, prediction) in predictions.iter_mut().enumerate() {
                *prediction += self.params.learning_rate * tree.predict_row(features.row(i));
            }
            debug!("Boosting round {}: {} leaves", round + 1, tree.n_leaves());
            self.trees.push(tree);
        }

        self.n_features = Some(n_cols);
        info!(
            "Fitted {} trees on {} rows x {} features",
            self.trees.len(),
            n_rows,
            n_cols
        );
        Ok(())
    }

    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>> {
        let expected = self.n_features.ok_or(ModelError::NotTrained)?;
        if features.ncols() != expected {
            return Err(ModelError::FeatureMismatch {
                expected,
                actual: features.ncols(),
            }
            .into());
        }

        Ok(features
            .rows()
            .into_iter()
            .map(|row| {
                let boost: f64 = self.trees.iter().map(|tree| tree.predict_row(row)).sum();
                self.base_score + self.params.learning_rate * boost
            })
            .collect())
    }

    fn save(&self, path: &Path) -> Result<()> {
        if !self.is_trained() {
            return Err(ModelError::NotTrained.into());
        }
        persistence::write_json(path, self)?;
        info!("Saved model to {}", path.display());
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let model: Self = persistence::read_json(path)?;
        if let (Some(width), Some(max)) = (
            model.n_features,
            model.trees.iter().filter_map(RegressionTree::max_feature).max(),
        ) {
            if max >= width {
                return Err(ModelError::InvalidData(format!(
                    "tree reads feature {} of a {}-feature model",
                    max, width
                ))
                .into());
            }
        }
        Ok(model)
    }

    fn export_interchange(&self, path: &Path) -> Result<()> {
        let n_features = self.n_features.ok_or(ModelError::NotTrained)?;
        persistence::write_interchange(path, "gradient_boosted_regressor", n_features, "variable", self)
    }

    fn n_features(&self) -> Option<usize> {
        self.n_features
    }

    fn model_type(&self) -> ModelType {
        ModelType::XGBoost
    }
}
