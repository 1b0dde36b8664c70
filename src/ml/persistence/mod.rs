use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use super::gbm::{GbmParams, GradientBoostedRegressor};
use super::{ModelError, TradingModel};

/// Interchange document format tag
pub const INTERCHANGE_FORMAT: &str = "regime-pipeline-interchange/1";
/// Name of the single input tensor of every exported model
pub const INPUT_TENSOR: &str = "float_input";

/// Model type identifier as written in the `type` field of a model spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelType {
    XGBoost,
}

impl ModelType {
    pub fn as_str(&self) -> &str {
        match self {
            ModelType::XGBoost => "XGBoost",
        }
    }

    /// Fresh untrained model configured from a spec's hyperparameters
    pub fn create(
        &self,
        hyperparams: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Box<dyn TradingModel>> {
        match self {
            ModelType::XGBoost => {
                let params = GbmParams::from_hyperparams(hyperparams)?;
                Ok(Box::new(GradientBoostedRegressor::with_params(params)))
            }
        }
    }

    /// Load a trained model from its native artifact
    pub fn load(&self, path: &Path) -> Result<Box<dyn TradingModel>> {
        match self {
            ModelType::XGBoost => Ok(Box::new(GradientBoostedRegressor::load(path)?)),
        }
    }
}

impl FromStr for ModelType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, ModelError> {
        match s {
            "XGBoost" | "xgboost" | "GradientBoosting" => Ok(ModelType::XGBoost),
            _ => Err(ModelError::UnknownModelType(s.to_string())),
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Paths written for one trained per-regime model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    pub model_path: PathBuf,
    pub interchange_path: PathBuf,
    pub metrics_path: PathBuf,
}

impl ModelArtifacts {
    /// Interchange mirror sits beside the native file; metrics go to `metrics_<name>.json`
    /// in the same directory.
    pub fn for_model(name: &str, model_path: &Path) -> Self {
        let dir = model_path.parent().unwrap_or_else(|| Path::new(""));
        Self {
            model_path: model_path.to_path_buf(),
            interchange_path: model_path.with_extension("portable.json"),
            metrics_path: dir.join(format!("metrics_{}.json", name)),
        }
    }
}

/// Tensor declared by an interchange document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    /// `None` marks a dynamic dimension
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

/// Portable, self-describing mirror of a trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterchangeDocument {
    pub format: String,
    pub model_kind: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub payload: serde_json::Value,
}

/// Write any serializable value as pretty JSON, creating parent directories
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Export a model's interchange mirror with a `[None, n_features]` float32 input
pub fn write_interchange<T: Serialize>(
    path: &Path,
    model_kind: &str,
    n_features: usize,
    output_name: &str,
    model: &T,
) -> Result<()> {
    let document = InterchangeDocument {
        format: INTERCHANGE_FORMAT.to_string(),
        model_kind: model_kind.to_string(),
        inputs: vec![TensorSpec {
            name: INPUT_TENSOR.to_string(),
            shape: vec![None, Some(n_features)],
            dtype: "float32".to_string(),
        }],
        outputs: vec![TensorSpec {
            name: output_name.to_string(),
            shape: vec![None],
            dtype: "float32".to_string(),
        }],
        payload: serde_json::to_value(model)?,
    };
    write_json(path, &document)?;
    info!("Exported {} interchange model to {}", model_kind, path.display());
    Ok(())
}

/// Read an interchange mirror back, checking format and kind
pub fn read_interchange<T: DeserializeOwned>(path: &Path, model_kind: &str) -> Result<T> {
    let document: InterchangeDocument = read_json(path)?;
    if document.format != INTERCHANGE_FORMAT {
        bail!("Unsupported interchange format '{}'", document.format);
    }
    if document.model_kind != model_kind {
        return Err(anyhow!(
            "Interchange file holds a {} model, expected {}",
            document.model_kind,
            model_kind
        ));
    }
    Ok(serde_json::from_value(document.payload)?)
}
