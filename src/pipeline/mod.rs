pub mod backtest;
pub mod regime;
pub mod registry;
pub mod standalone;

#[cfg(test)]
mod test_support;

pub use backtest::{run_backtest, PredictionRecord};
pub use regime::{
    format_labels, predict_regimes_from_text, train_regime_detector, RegimeTrainingReport,
};
pub use registry::train_registry;
pub use standalone::{run_standalone_training, StandaloneOptions};

use anyhow::Result;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::data::{load_bars, preprocess, Dataset};

/// Load the configured bars and turn them into a feature matrix
pub async fn load_dataset(config: &PipelineConfig) -> Result<Dataset> {
    let bars = load_bars(config).await?;
    let dataset = preprocess(&bars)?;
    info!(
        "Dataset ready: {} rows x {} features",
        dataset.len(),
        dataset.n_features()
    );
    debug!("Features: {}", dataset.feature_names.join(", "));
    Ok(dataset)
}

/// One-line digest of a regime fit
pub fn log_regime_report(report: &RegimeTrainingReport) {
    info!(
        "Regime detector: {} rows x {} features, log-likelihood {:.2} after {} iterations",
        report.n_observations, report.n_features, report.log_likelihood, report.iterations
    );
}

/// Regime training, per-regime model training and backtest in one go
pub async fn run_all(config: &PipelineConfig) -> Result<Vec<PredictionRecord>> {
    info!("━━━ Step 1: Regime detection ━━━");
    let dataset = load_dataset(config).await?;
    let report = train_regime_detector(config, &dataset)?;
    log_regime_report(&report);

    info!("━━━ Step 2: Per-regime models ━━━");
    let trained = train_registry(config, &dataset, &report.regimes)?;
    for model in &trained {
        info!(
            "  {}: RMSE {:.4}, R² {:.4} ({} test rows)",
            model.name, model.metrics.rmse, model.metrics.r2, model.metrics.n_test
        );
    }

    info!("━━━ Step 3: Backtest ━━━");
    run_backtest(config).await
}
