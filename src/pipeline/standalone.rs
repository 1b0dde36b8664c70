use anyhow::Result;
use ndarray::Axis;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::data::Dataset;
use crate::ml::search::{default_grid, load_grid};
use crate::ml::{
    train_test_split, GradientBoostedRegressor, ParamGrid, RandomizedSearch, RegressionMetrics,
    SearchResult, TradingModel,
};

use super::load_dataset;

/// Options of the `train-gbm` command
#[derive(Debug, Clone)]
pub struct StandaloneOptions {
    pub test_size: f64,
    /// Seed of the train/test split and of the final refit
    pub random_state: u64,
    /// Candidates drawn by the randomized search
    pub n_iter: usize,
    /// Cross-validation folds per candidate
    pub cv: usize,
    /// JSON grid replacing the built-in search space
    pub param_config: Option<PathBuf>,
    pub model_output: PathBuf,
    pub metrics_output: PathBuf,
    /// Load only this leading percentage of the records
    pub partial_percent: Option<f64>,
}

impl Default for StandaloneOptions {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            random_state: 42,
            n_iter: 20,
            cv: 3,
            param_config: None,
            model_output: PathBuf::from("xgb_saved/xgb_model.json"),
            metrics_output: PathBuf::from("xgb_saved/metrics.json"),
            partial_percent: None,
        }
    }
}

pub struct StandaloneOutcome {
    pub model: GradientBoostedRegressor,
    pub search: SearchResult,
    pub metrics: RegressionMetrics,
}

/// Split, search, refit on the training partition and score the held-out rows.
/// The search draws its candidates with its own fixed seed.
pub fn train_with_search(
    dataset: &Dataset,
    grid: ParamGrid,
    opts: &StandaloneOptions,
) -> Result<StandaloneOutcome> {
    let (train, test) = train_test_split(dataset.len(), opts.test_size, opts.random_state)?;
    let x_train = dataset.features.select(Axis(0), &train);
    let y_train = dataset.target.select(Axis(0), &train);
    let x_test = dataset.features.select(Axis(0), &test);
    let y_test = dataset.target.select(Axis(0), &test);
    info!("Split {} rows into {} train / {} test", dataset.len(), train.len(), test.len());

    let search = RandomizedSearch::new(grid)
        .with_n_iter(opts.n_iter)
        .with_cv(opts.cv)
        .fit(&x_train, &y_train)?;
    info!(
        "Evaluated {} candidates, best CV score {:.6}",
        search.scores.len(),
        search.best_score
    );

    let mut params = search.best_params.clone();
    params.seed = opts.random_state;
    let mut model = GradientBoostedRegressor::with_params(params);
    model.fit(&x_train, &y_train)?;
    debug!("Refit model has {} trees", model.n_trees());

    let predictions = model.predict(&x_test)?;
    let metrics = RegressionMetrics::evaluate(&y_test, &predictions, train.len());
    info!("✓ Test RMSE {:.4}, R² {:.4}", metrics.rmse, metrics.r2);

    Ok(StandaloneOutcome {
        model,
        search,
        metrics,
    })
}

/// Train a single regressor on every row, without regime routing
pub async fn run_standalone_training(
    config: &PipelineConfig,
    opts: &StandaloneOptions,
) -> Result<RegressionMetrics> {
    let mut config = config.clone();
    if let Some(percent) = opts.partial_percent {
        config.data.use_partial_data = true;
        config.data.partial_data_percent = percent;
    }

    let dataset = load_dataset(&config).await?;
    let grid = match &opts.param_config {
        Some(path) => load_grid(path)?,
        None => default_grid(),
    };

    let outcome = train_with_search(&dataset, grid, opts)?;
    info!("Best parameters: {:?}", outcome.search.best_candidate);

    outcome.model.save(&opts.model_output)?;
    info!("Model saved to {}", opts.model_output.display());
    outcome.metrics.save(&opts.metrics_output)?;
    info!("Metrics saved to {}", opts.metrics_output.display());
    Ok(outcome.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::preprocess;
    use crate::pipeline::test_support::regime_bars;

    fn small_grid() -> ParamGrid {
        let mut grid = ParamGrid::new();
        grid.insert("n_estimators".into(), vec![5.0, 15.0]);
        grid.insert("max_depth".into(), vec![2.0, 3.0]);
        grid
    }

    #[test]
    fn test_train_with_search() {
        let dataset = preprocess(&regime_bars(40)).unwrap();
        let outcome = train_with_search(&dataset, small_grid(), &StandaloneOptions::default()).unwrap();

        assert_eq!(outcome.metrics.n_test, 8);
        assert_eq!(outcome.metrics.n_train, 31);
        assert_eq!(outcome.search.scores.len(), 4);
        assert!(outcome.model.is_trained());
        assert!(outcome.metrics.rmse.is_finite());
    }

    #[test]
    fn test_search_is_deterministic() {
        let dataset = preprocess(&regime_bars(30)).unwrap();
        let opts = StandaloneOptions {
            test_size: 0.25,
            random_state: 7,
            ..StandaloneOptions::default()
        };
        let a = train_with_search(&dataset, small_grid(), &opts).unwrap();
        let b = train_with_search(&dataset, small_grid(), &opts).unwrap();
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.search.best_candidate, b.search.best_candidate);
    }

    #[test]
    fn test_split_seed_does_not_reseed_candidate_draw() {
        let dataset = preprocess(&regime_bars(40)).unwrap();
        let mut grid = small_grid();
        grid.insert("learning_rate".into(), vec![0.05, 0.1, 0.3]);
        let drawn = |random_state| {
            let opts = StandaloneOptions {
                random_state,
                n_iter: 5,
                cv: 2,
                ..StandaloneOptions::default()
            };
            let outcome = train_with_search(&dataset, grid.clone(), &opts).unwrap();
            outcome
                .search
                .scores
                .into_iter()
                .map(|candidate| candidate.params)
                .collect::<Vec<_>>()
        };
        let first = drawn(1);
        assert_eq!(first.len(), 5);
        assert_eq!(first, drawn(99));
    }

    #[tokio::test]
    async fn test_run_standalone_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("bars.csv");
        let mut body = String::from("timestamp,open,high,low,close,bid,ask,volume\n");
        for bar in regime_bars(30) {
            body.push_str(&format!(
                "{},{},{},{},{},{},{},{}\n",
                bar.timestamp.format("%Y-%m-%d %H:%M:%S"),
                bar.open,
                bar.high,
                bar.low,
                bar.close,
                bar.bid,
                bar.ask,
                bar.volume
            ));
        }
        std::fs::write(&csv, body).unwrap();
        let grid = dir.path().join("grid.json");
        std::fs::write(&grid, r#"{ "n_estimators": [5], "max_depth": [2, 3] }"#).unwrap();

        let mut config = crate::pipeline::test_support::config_in(dir.path());
        config.data.input_csv_path = csv;
        config.data.csv_open_col = 1;
        config.data.csv_high_col = 2;
        config.data.csv_low_col = 3;
        config.data.csv_close_col = 4;
        config.data.csv_bid_col = 5;
        config.data.csv_ask_col = 6;
        config.data.csv_volume_col = 7;
        let opts = StandaloneOptions {
            param_config: Some(grid),
            model_output: dir.path().join("out/model.json"),
            metrics_output: dir.path().join("out/metrics.json"),
            ..StandaloneOptions::default()
        };

        let metrics = run_standalone_training(&config, &opts).await.unwrap();
        assert_eq!(metrics.n_train + metrics.n_test, 29);
        assert!(opts.model_output.exists());
        let saved: RegressionMetrics =
            crate::ml::persistence::read_json(&opts.metrics_output).unwrap();
        assert_eq!(saved, metrics);
    }
}
