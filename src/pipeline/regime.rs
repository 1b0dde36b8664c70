use anyhow::{bail, Context, Result};
use ndarray::Array2;
use std::path::Path;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::data::preprocess::{extra_cell, extra_columns};
use crate::data::{parse_feature_row, Dataset};
use crate::ml::hmm::{state_distribution, GaussianHMM, RegimeDetector};
use crate::types::Bar;

/// Share of rows one state may cover before the fit is reported as degenerate
const DEGENERATE_STATE_PCT: f64 = 95.0;

#[derive(Debug, Clone)]
pub struct RegimeTrainingReport {
    pub n_observations: usize,
    pub n_features: usize,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub state_counts: Vec<usize>,
    /// One label per dataset row
    pub regimes: Vec<usize>,
}

impl RegimeTrainingReport {
    /// Largest share of rows held by a single state, in percent
    pub fn dominant_state_pct(&self) -> f64 {
        if self.n_observations == 0 {
            return 0.0;
        }
        let max = self.state_counts.iter().copied().max().unwrap_or(0);
        max as f64 / self.n_observations as f64 * 100.0
    }
}

/// Fit the regime HMM on the dataset features and write the model, its
/// interchange mirror and the per-row label CSV.
pub fn train_regime_detector(config: &PipelineConfig, dataset: &Dataset) -> Result<RegimeTrainingReport> {
    if dataset.is_empty() {
        bail!("Cannot train the regime detector on an empty dataset");
    }
    let params = &config.regime_detection.params;
    let (n_obs, n_features) = dataset.features.dim();

    info!("━━━ Training {}-state Gaussian HMM ━━━", params.n_components);
    info!("  Observations: {} x {} features", n_obs, n_features);

    let mut hmm = GaussianHMM::from_params(params, n_features);
    let start_time = std::time::Instant::now();
    let (log_likelihood, iterations) = hmm
        .fit(&dataset.features, params.n_iter, params.tol)
        .context("Regime detector training failed")?;
    info!("✓ Training complete in {:.1}s", start_time.elapsed().as_secs_f64());
    info!("  Final log-likelihood: {:.2}", log_likelihood);
    info!("  EM iterations: {}", iterations);

    let regimes = hmm.predict(&dataset.features)?;
    let posteriors = hmm.predict_proba(&dataset.features)?;
    let confidence = posteriors
        .rows()
        .into_iter()
        .map(|row| row.iter().copied().fold(0.0, f64::max))
        .sum::<f64>()
        / n_obs as f64;
    info!("  Mean posterior confidence: {:.3}", confidence);

    let state_counts = state_distribution(&regimes, hmm.n_states);
    let report = RegimeTrainingReport {
        n_observations: n_obs,
        n_features,
        log_likelihood,
        iterations,
        state_counts,
        regimes,
    };

    info!("  State distribution:");
    for (state, count) in report.state_counts.iter().enumerate() {
        info!(
            "    State {}: {:6} rows ({:5.1}%)",
            state,
            count,
            *count as f64 / n_obs as f64 * 100.0
        );
    }
    let dominant = report.dominant_state_pct();
    if dominant > DEGENERATE_STATE_PCT {
        warn!("⚠ Model may be degenerate (one state covers {:.1}% of data)", dominant);
    }

    let model_path = config.regime_model_path();
    hmm.save_json(&model_path)?;
    info!("✓ Regime model saved to {}", model_path.display());

    hmm.export_interchange(&config.regime_interchange_path())?;

    let labels_path = config.regime_labels_path();
    write_regime_labels(&labels_path, &dataset.bars, &report.regimes)?;
    info!("✓ Regime labels written to {}", labels_path.display());

    Ok(report)
}

/// One CSV row per labelled bar: timestamp, base columns, extras, regime
pub fn write_regime_labels(path: &Path, bars: &[Bar], regimes: &[usize]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let extras = extra_columns(bars);
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec!["timestamp".to_string()];
    header.extend(Bar::BASE_COLUMNS.iter().map(|c| c.to_string()));
    header.extend(extras.iter().cloned());
    header.push("regime".to_string());
    writer.write_record(&header)?;

    for (bar, regime) in bars.iter().zip(regimes) {
        let mut record = vec![bar.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()];
        record.extend(bar.base_values().iter().map(f64::to_string));
        record.extend(extras.iter().map(|name| extra_cell(&bar.extra, name)));
        record.push(regime.to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Label rows given as comma-separated groups of whitespace-separated values
pub fn predict_regimes_from_text(detector: &RegimeDetector, text: &str) -> Result<Vec<usize>> {
    let rows = text
        .split(',')
        .map(str::trim)
        .filter(|row| !row.is_empty())
        .map(parse_feature_row)
        .collect::<Result<Vec<_>>>()?;
    if rows.is_empty() {
        anyhow::bail!("No feature rows given");
    }

    let width = rows[0].len();
    if let Some(bad) = rows.iter().position(|row| row.len() != width) {
        anyhow::bail!(
            "Row {} has {} values, expected {}",
            bad + 1,
            rows[bad].len(),
            width
        );
    }

    let observations = Array2::from_shape_vec((rows.len(), width), rows.concat())?;
    detector.detect_sequence(&observations)
}

/// Render labels the way the predict command prints them
pub fn format_labels(labels: &[usize]) -> String {
    labels
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::preprocess;
    use crate::pipeline::test_support::{config_in, regime_bars};

    #[test]
    fn test_train_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let dataset = preprocess(&regime_bars(60)).unwrap();

        let report = train_regime_detector(&config, &dataset).unwrap();
        assert_eq!(report.regimes.len(), dataset.len());
        assert_eq!(report.n_observations, dataset.len());
        assert_eq!(report.n_features, 7);
        assert!(report.log_likelihood.is_finite());
        assert!(report.iterations >= 1);
        assert_eq!(report.state_counts.iter().sum::<usize>(), dataset.len());
        assert!(report.regimes.iter().all(|&r| r < 2));

        assert!(config.regime_model_path().exists());
        assert!(config.regime_interchange_path().exists());

        let labels = std::fs::read_to_string(config.regime_labels_path()).unwrap();
        let mut lines = labels.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,open,high,low,close,bid,ask,volume,regime"
        );
        assert_eq!(lines.count(), dataset.len());

        let detector = RegimeDetector::from_json(&config.regime_model_path()).unwrap();
        assert_eq!(detector.n_features(), 7);
        assert_eq!(detector.detect_sequence(&dataset.features).unwrap(), report.regimes);
    }

    #[test]
    fn test_empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let dataset = Dataset {
            features: Array2::zeros((0, 3)),
            target: ndarray::Array1::zeros(0),
            feature_names: vec!["a".into(), "b".into(), "c".into()],
            bars: Vec::new(),
        };
        let err = train_regime_detector(&config, &dataset).unwrap_err();
        assert!(err.to_string().contains("empty dataset"));
        assert!(!config.regime_model_path().exists());
    }

    #[test]
    fn test_predict_from_text() {
        let detector = RegimeDetector::new(GaussianHMM::new(1, 2));
        let labels = predict_regimes_from_text(&detector, "0.1 0.2, 0.3 0.4 ,0.5 0.6").unwrap();
        assert_eq!(format_labels(&labels), "0,0,0");

        assert!(predict_regimes_from_text(&detector, "0.1 0.2, 0.3").is_err());
        assert!(predict_regimes_from_text(&detector, "0.1 x").is_err());
        assert!(predict_regimes_from_text(&detector, " , ").is_err());
    }

    #[test]
    fn test_dominant_state_pct() {
        let report = RegimeTrainingReport {
            n_observations: 20,
            n_features: 1,
            log_likelihood: 0.0,
            iterations: 1,
            state_counts: vec![19, 1],
            regimes: Vec::new(),
        };
        assert_eq!(report.dominant_state_pct(), 95.0);
    }
}
