pub mod gbm;
pub mod hmm;
pub mod metrics;
pub mod persistence;
pub mod search;

pub use gbm::GradientBoostedRegressor;
pub use hmm::RegimeDetector;
pub use metrics::{train_test_split, RegressionMetrics};
pub use persistence::{ModelArtifacts, ModelType};
pub use search::{ParamGrid, RandomizedSearch, SearchResult};

use anyhow::Result;
use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model not trained")]
    NotTrained,

    #[error("Feature count mismatch: model expects {expected}, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown hyperparameter: {0}")]
    UnknownParameter(String),

    #[error("Unknown model type: {0}")]
    UnknownModelType(String),
}

/// A supervised regressor the pipeline can train, persist and reload
pub trait TradingModel: Send + Sync {
    fn fit(&mut self, features: &Array2<f64>, target: &Array1<f64>) -> Result<()>;

    fn predict(&self, features: &Array2<f64>) -> Result<Array1<f64>>;

    /// Write the native artifact
    fn save(&self, path: &Path) -> Result<()>;

    /// Reconstitute a model written by `save`
    fn load(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Write the portable mirror next to the native artifact
    fn export_interchange(&self, path: &Path) -> Result<()>;

    /// Feature width seen during training, `None` before fitting
    fn n_features(&self) -> Option<usize>;

    fn model_type(&self) -> ModelType;
}
