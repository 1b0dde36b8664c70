use anyhow::{bail, Context, Result};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::analytics::{TradingEvaluator, TradingMetrics};
use crate::config::PipelineConfig;
use crate::data::Dataset;
use crate::ml::persistence;
use crate::ml::{ModelError, ModelType, RegimeDetector, TradingModel};

use super::load_dataset;

/// One emitted prediction in the backtest output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp_index: usize,
    pub regime: usize,
    pub model: String,
    pub prediction: f64,
}

/// A loaded model together with the regimes it serves
pub struct RegimeModel {
    pub name: String,
    pub regimes: Vec<usize>,
    pub model: Box<dyn TradingModel>,
}

impl RegimeModel {
    pub fn covers(&self, regime: usize) -> bool {
        self.regimes.contains(&regime)
    }
}

/// Loaded per-regime models in config order
#[derive(Default)]
pub struct ModelRegistry {
    models: Vec<RegimeModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, model: RegimeModel) {
        self.models.push(model);
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Load every configured model artifact. Unknown types are skipped; a
    /// missing artifact for a known type is an error.
    pub fn load_from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for spec in &config.models {
            let model_type = match spec.model_type.parse::<ModelType>() {
                Ok(model_type) => model_type,
                Err(_) => {
                    info!("Skipping unknown model type: {}", spec.model_type);
                    continue;
                }
            };
            let path = config.resolve(&spec.model_path);
            let model = model_type
                .load(&path)
                .with_context(|| format!("Failed to load model {}", spec.name))?;
            info!(
                "✓ Loaded {} ({}) from {}",
                spec.name,
                model.model_type(),
                path.display()
            );
            registry.push(RegimeModel {
                name: spec.name.clone(),
                regimes: spec.regimes.clone(),
                model,
            });
        }
        Ok(registry)
    }

    /// First model, in config order, that serves `regime`
    pub fn select(&self, regime: usize) -> Option<&RegimeModel> {
        self.models.iter().find(|model| model.covers(regime))
    }
}

/// Route each row to the first model covering its regime and predict it.
/// Rows whose regime no model covers produce no record.
pub fn dispatch(
    features: &Array2<f64>,
    regimes: &[usize],
    registry: &ModelRegistry,
) -> Result<Vec<PredictionRecord>> {
    if regimes.len() != features.nrows() {
        bail!(
            "Got {} regime labels for {} feature rows",
            regimes.len(),
            features.nrows()
        );
    }
    for entry in &registry.models {
        match entry.model.n_features() {
            Some(expected) if expected != features.ncols() => {
                return Err(ModelError::FeatureMismatch {
                    expected,
                    actual: features.ncols(),
                })
                .with_context(|| format!("Model {} cannot read the dataset", entry.name));
            }
            Some(_) => {}
            None => return Err(ModelError::NotTrained).context(entry.name.clone()),
        }
    }

    let mut records = Vec::new();
    for (index, (row, &regime)) in features.axis_iter(Axis(0)).zip(regimes).enumerate() {
        let Some(entry) = registry.select(regime) else {
            continue;
        };
        let input = row.insert_axis(Axis(0)).to_owned();
        let prediction = entry.model.predict(&input)?;
        records.push(PredictionRecord {
            timestamp_index: index,
            regime,
            model: entry.name.clone(),
            prediction: prediction[0],
        });
    }
    Ok(records)
}

pub fn write_predictions(path: &Path, records: &[PredictionRecord]) -> Result<()> {
    persistence::write_json(path, records)?;
    info!("Wrote {} predictions to {}", records.len(), path.display());
    Ok(())
}

/// Trade the predictions against the dataset's closes and write the metrics
pub fn evaluate_trading(
    config: &PipelineConfig,
    dataset: &Dataset,
    records: &[PredictionRecord],
) -> Result<TradingMetrics> {
    let closes: Vec<f64> = dataset.bars.iter().map(|bar| bar.close).collect();
    let next_closes = dataset.target.to_vec();
    let metrics = TradingEvaluator::new(config.strategy.starting_cash, config.strategy.commission_rate)
        .evaluate(records, &closes, &next_closes);
    metrics.log_summary();

    let path = config.trading_metrics_path();
    persistence::write_json(&path, &metrics)?;
    info!("Trading metrics saved to {}", path.display());
    Ok(metrics)
}

/// Re-label the whole dataset with the saved detector and predict every
/// covered row with its regime's model.
pub async fn run_backtest(config: &PipelineConfig) -> Result<Vec<PredictionRecord>> {
    let dataset = load_dataset(config).await?;

    let detector = RegimeDetector::from_json(&config.regime_model_path())?;
    let regimes = detector.detect_sequence(&dataset.features)?;
    debug!(
        "Dataset log-likelihood under the regime model: {:.2}",
        detector.log_likelihood(&dataset.features)?
    );
    let registry = ModelRegistry::load_from_config(config)?;
    if registry.is_empty() {
        warn!("No usable models configured; no rows will be predicted");
    }

    let records = dispatch(&dataset.features, &regimes, &registry)?;
    info!(
        "Backtest predicted {} of {} rows with {} models",
        records.len(),
        dataset.len(),
        registry.len()
    );
    write_predictions(&config.predictions_path(), &records)?;
    evaluate_trading(config, &dataset, &records)?;
    Ok(records)
}
