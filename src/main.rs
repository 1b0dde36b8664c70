mod analytics;
mod config;
mod data;
mod ml;
mod pipeline;
mod server;
mod types;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::PipelineConfig;
use ml::RegimeDetector;
use pipeline::StandaloneOptions;

#[derive(Parser)]
#[command(name = "regime-pipeline")]
#[command(version = "0.1.0")]
#[command(about = "Regime detection and per-regime price models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the regime HMM and write its artifacts and label CSV
    TrainRegime,
    /// Train every configured per-regime model
    TrainModels,
    /// Predict every row with the model of its regime
    Backtest,
    /// Regime training, model training and backtest in sequence
    RunAll,
    /// Train one regressor over all rows with a randomized search
    TrainGbm {
        /// Fraction of rows held out for testing
        #[arg(long, default_value = "0.2")]
        test_size: f64,
        /// Seed for the split and the final refit
        #[arg(long, default_value = "42")]
        random_state: u64,
        /// Candidates drawn by the randomized search
        #[arg(long, default_value = "20")]
        n_iter: usize,
        /// Cross-validation folds per candidate
        #[arg(long, default_value = "3")]
        cv: usize,
        /// JSON file with hyperparameter search spaces
        #[arg(long)]
        param_config: Option<PathBuf>,
        #[arg(long, default_value = "xgb_saved/xgb_model.json")]
        model_output: PathBuf,
        #[arg(long, default_value = "xgb_saved/metrics.json")]
        metrics_output: PathBuf,
        /// Load only part of the data
        #[arg(long)]
        partial: bool,
        /// Percent of data to load with --partial
        #[arg(long, default_value = "100.0")]
        partial_percent: f64,
    },
    /// Label rows read from stdin (rows split by commas, values by whitespace)
    PredictRegimes {
        /// Regime model to use instead of the configured one
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Serve regime labels over TCP
    Serve {
        /// Port to listen on (defaults to the configured one)
        #[arg(short, long)]
        port: Option<u16>,
        /// Regime model to use instead of the configured one
        #[arg(long)]
        model: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    // RUST_LOG wins over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PipelineConfig::load_validated(&cli.config)?;

    match cli.command {
        Commands::TrainRegime => {
            let dataset = pipeline::load_dataset(&config).await?;
            let report = pipeline::train_regime_detector(&config, &dataset)?;
            pipeline::log_regime_report(&report);
        }
        Commands::TrainModels => {
            train_models(&config).await?;
        }
        Commands::Backtest => {
            let records = pipeline::run_backtest(&config).await?;
            info!("✓ {} predictions written", records.len());
        }
        Commands::RunAll => {
            let records = pipeline::run_all(&config).await?;
            info!("✓ Pipeline complete: {} predictions", records.len());
        }
        Commands::TrainGbm {
            test_size,
            random_state,
            n_iter,
            cv,
            param_config,
            model_output,
            metrics_output,
            partial,
            partial_percent,
        } => {
            let opts = StandaloneOptions {
                test_size,
                random_state,
                n_iter,
                cv,
                param_config,
                model_output,
                metrics_output,
                partial_percent: partial.then_some(partial_percent),
            };
            pipeline::run_standalone_training(&config, &opts).await?;
        }
        Commands::PredictRegimes { model } => {
            let path = model.unwrap_or_else(|| config.regime_model_path());
            let detector = RegimeDetector::from_json(&path)?;
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            let labels = pipeline::predict_regimes_from_text(&detector, &input)?;
            println!("{}", pipeline::format_labels(&labels));
        }
        Commands::Serve { port, model } => {
            server::run_server(&config, model, port).await?;
        }
    }

    Ok(())
}

/// Label the dataset with the saved detector, then train the model entries
async fn train_models(config: &PipelineConfig) -> Result<()> {
    if config.models.is_empty() {
        bail!("No models configured under \"Models\"");
    }
    let dataset = pipeline::load_dataset(config).await?;
    let detector = RegimeDetector::from_json(&config.regime_model_path())?;
    let regimes = detector.detect_sequence(&dataset.features)?;

    let trained = pipeline::train_registry(config, &dataset, &regimes)?;
    for model in &trained {
        info!(
            "  {}: RMSE {:.4}, R² {:.4}, metrics at {}",
            model.name,
            model.metrics.rmse,
            model.metrics.r2,
            model.artifacts.metrics_path.display()
        );
    }
    Ok(())
}
