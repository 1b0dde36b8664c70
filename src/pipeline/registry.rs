use anyhow::{bail, Result};
use ndarray::Axis;
use tracing::{info, warn};

use crate::config::{ModelSpec, PipelineConfig};
use crate::data::Dataset;
use crate::ml::{train_test_split, ModelArtifacts, ModelType, RegressionMetrics};

/// Outcome of training one model entry
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub name: String,
    pub metrics: RegressionMetrics,
    pub artifacts: ModelArtifacts,
}

/// Indices of rows whose regime label is one of `covered`
pub fn regime_rows(regimes: &[usize], covered: &[usize]) -> Vec<usize> {
    regimes
        .iter()
        .enumerate()
        .filter(|(_, regime)| covered.contains(*regime))
        .map(|(i, _)| i)
        .collect()
}

/// Train one model entry on the rows of its regimes. Unknown model types,
/// entries whose regimes never occur and partitions too small to split are
/// skipped with `Ok(None)`.
pub fn train_model_spec(
    config: &PipelineConfig,
    spec: &ModelSpec,
    dataset: &Dataset,
    regimes: &[usize],
) -> Result<Option<TrainedModel>> {
    let model_type = match spec.model_type.parse::<ModelType>() {
        Ok(model_type) => model_type,
        Err(_) => {
            info!("Skipping unknown model type: {}", spec.model_type);
            return Ok(None);
        }
    };

    let rows = regime_rows(regimes, &spec.regimes);
    if rows.is_empty() {
        warn!(
            "No rows for model {} (regimes {:?}); skipping",
            spec.name, spec.regimes
        );
        return Ok(None);
    }

    let (train, test) = match train_test_split(rows.len(), spec.test_size, spec.random_state) {
        Ok(split) => split,
        Err(e) => {
            warn!("Cannot train model {}: {}; skipping", spec.name, e);
            return Ok(None);
        }
    };

    info!("━━━ Training {} on regimes {:?} ━━━", spec.name, spec.regimes);
    let (features, target) = dataset.select(&rows);
    let (x_train, y_train) = (
        features.select(Axis(0), &train),
        target.select(Axis(0), &train),
    );
    let (x_test, y_test) = (
        features.select(Axis(0), &test),
        target.select(Axis(0), &test),
    );

    let mut model = model_type.create(&spec.hyperparams)?;
    model.fit(&x_train, &y_train)?;
    let predictions = model.predict(&x_test)?;
    let metrics = RegressionMetrics::evaluate(&y_test, &predictions, train.len());
    info!(
        "✓ {}: {} train / {} test rows, RMSE {:.4}, R² {:.4}",
        spec.name,
        train.len(),
        test.len(),
        metrics.rmse,
        metrics.r2
    );

    let artifacts = ModelArtifacts::for_model(&spec.name, &config.resolve(&spec.model_path));
    model.save(&artifacts.model_path)?;
    model.export_interchange(&artifacts.interchange_path)?;
    metrics.save(&artifacts.metrics_path)?;

    Ok(Some(TrainedModel {
        name: spec.name.clone(),
        metrics,
        artifacts,
    }))
}

/// Train every configured model entry against the regime labels
pub fn train_registry(
    config: &PipelineConfig,
    dataset: &Dataset,
    regimes: &[usize],
) -> Result<Vec<TrainedModel>> {
    if regimes.len() != dataset.len() {
        bail!(
            "Got {} regime labels for {} dataset rows",
            regimes.len(),
            dataset.len()
        );
    }

    let mut trained = Vec::new();
    for spec in &config.models {
        if let Some(model) = train_model_spec(config, spec, dataset, regimes)? {
            trained.push(model);
        }
    }
    info!(
        "Trained {} of {} configured models",
        trained.len(),
        config.models.len()
    );
    Ok(trained)
}
