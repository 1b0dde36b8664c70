use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ml::hmm::HmmParams;

/// Full pipeline configuration as read from `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(rename = "Data", default)]
    pub data: DataSettings,
    #[serde(rename = "RegimeDetection")]
    pub regime_detection: RegimeDetectionSettings,
    #[serde(rename = "Strategy", default)]
    pub strategy: StrategySettings,
    #[serde(rename = "Models", default)]
    pub models: Vec<ModelSpec>,
    #[serde(rename = "Server", default)]
    pub server: ServerSettings,
    /// Directory relative paths are resolved against (the config file's directory)
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl PipelineConfig {
    /// Load configuration from a JSON file. A missing or malformed file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        info!(
            "Config loaded from {} ({} model specs)",
            path.display(),
            config.models.len()
        );
        Ok(config)
    }

    /// Load and validate in one step, joining validation errors into one message
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load(path)?;
        config
            .validate()
            .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Data validation
        if !(self.data.partial_data_percent > 0.0 && self.data.partial_data_percent <= 100.0) {
            errors.push("PARTIAL_DATA_PERCENT must be in (0, 100]".to_string());
        }
        if self.data.csv_delimiter.chars().count() != 1 {
            errors.push("CSV_Delimiter must be a single character".to_string());
        }

        // Regime detection validation
        if self.regime_detection.model_path.as_os_str().is_empty() {
            errors.push("RegimeDetection.model_path must be set".to_string());
        }
        if self.regime_detection.params.n_components == 0 {
            errors.push("RegimeDetection.params.n_components must be >= 1".to_string());
        }

        // Strategy validation
        if !(self.strategy.starting_cash > 0.0) {
            errors.push("Strategy.StartingCash must be positive".to_string());
        }
        if !(self.strategy.commission_rate >= 0.0) {
            errors.push("Strategy.CommissionRate must be non-negative".to_string());
        }

        // Model spec validation
        let mut seen = HashSet::new();
        for spec in &self.models {
            if spec.name.trim().is_empty() {
                errors.push("Models: every spec needs a non-empty name".to_string());
            } else if !seen.insert(spec.name.as_str()) {
                errors.push(format!("Models: duplicate model name '{}'", spec.name));
            }
            if !(spec.test_size > 0.0 && spec.test_size < 1.0) {
                errors.push(format!("{}: test_size must be between 0 and 1", spec.name));
            }
            if spec.model_path.as_os_str().is_empty() {
                errors.push(format!("{}: model_path must be set", spec.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve a configured path against the config file's directory
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn regime_model_path(&self) -> PathBuf {
        self.resolve(&self.regime_detection.model_path)
    }

    /// Portable mirror of the regime detector
    pub fn regime_interchange_path(&self) -> PathBuf {
        match &self.strategy.hmm_interchange_path {
            Some(path) => self.resolve(path),
            None => self.regime_model_path().with_extension("portable.json"),
        }
    }

    /// Regime-label CSV written next to the detector artifact
    pub fn regime_labels_path(&self) -> PathBuf {
        self.regime_model_path().with_extension("csv")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.resolve(&self.strategy.predictions_path)
    }

    pub fn trading_metrics_path(&self) -> PathBuf {
        self.resolve(&self.strategy.trading_metrics_path)
    }
}

/// Which data source feeds the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputSource {
    Csv,
    Api,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    #[serde(rename = "INPUT_SOURCE")]
    pub input_source: InputSource,
    #[serde(rename = "INPUT_CSV_PATH")]
    pub input_csv_path: PathBuf,
    #[serde(rename = "API_URL")]
    pub api_url: String,
    #[serde(rename = "USE_PARTIAL_DATA")]
    pub use_partial_data: bool,
    #[serde(rename = "PARTIAL_DATA_PERCENT")]
    pub partial_data_percent: f64,
    #[serde(rename = "CSV_Delimiter")]
    pub csv_delimiter: String,
    #[serde(rename = "CSV_Has_Header")]
    pub csv_has_header: bool,
    #[serde(rename = "CSV_Timestamp_Format")]
    pub csv_timestamp_format: String,
    #[serde(rename = "CSV_Timestamp_Col")]
    pub csv_timestamp_col: i64,
    #[serde(rename = "CSV_Open_Col")]
    pub csv_open_col: i64,
    #[serde(rename = "CSV_High_Col")]
    pub csv_high_col: i64,
    #[serde(rename = "CSV_Low_Col")]
    pub csv_low_col: i64,
    #[serde(rename = "CSV_Close_Col")]
    pub csv_close_col: i64,
    #[serde(rename = "CSV_Bid_Col")]
    pub csv_bid_col: i64,
    #[serde(rename = "CSV_Ask_Col")]
    pub csv_ask_col: i64,
    #[serde(rename = "CSV_Volume_Col")]
    pub csv_volume_col: i64,
    #[serde(rename = "API_Timestamp_Format")]
    pub api_timestamp_format: String,
    #[serde(rename = "API_Field_Timestamp")]
    pub api_field_timestamp: String,
    #[serde(rename = "API_Field_Open")]
    pub api_field_open: String,
    #[serde(rename = "API_Field_High")]
    pub api_field_high: String,
    #[serde(rename = "API_Field_Low")]
    pub api_field_low: String,
    #[serde(rename = "API_Field_Close")]
    pub api_field_close: String,
    #[serde(rename = "API_Field_Bid")]
    pub api_field_bid: String,
    #[serde(rename = "API_Field_Ask")]
    pub api_field_ask: String,
    #[serde(rename = "API_Field_Volume")]
    pub api_field_volume: String,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            input_source: InputSource::Csv,
            input_csv_path: PathBuf::from("data/bars.csv"),
            api_url: String::new(),
            use_partial_data: false,
            partial_data_percent: 100.0,
            csv_delimiter: ",".to_string(),
            csv_has_header: true,
            csv_timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            csv_timestamp_col: 0,
            csv_open_col: -1,
            csv_high_col: -1,
            csv_low_col: -1,
            csv_close_col: 1,
            csv_bid_col: -1,
            csv_ask_col: -1,
            csv_volume_col: -1,
            api_timestamp_format: "%Y-%m-%dT%H:%M:%S".to_string(),
            api_field_timestamp: "timestamp".to_string(),
            api_field_open: "open".to_string(),
            api_field_high: "high".to_string(),
            api_field_low: "low".to_string(),
            api_field_close: "close".to_string(),
            api_field_bid: "bid".to_string(),
            api_field_ask: "ask".to_string(),
            api_field_volume: "volume".to_string(),
        }
    }
}

impl DataSettings {
    /// Negative indices mean "column not present"
    pub fn column(index: i64) -> Option<usize> {
        usize::try_from(index).ok()
    }

    pub fn delimiter(&self) -> u8 {
        self.csv_delimiter.bytes().next().unwrap_or(b',')
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeDetectionSettings {
    pub model_path: PathBuf,
    #[serde(default)]
    pub params: HmmParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    #[serde(rename = "HMMInterchangePath", alias = "HMMOnnxPath")]
    pub hmm_interchange_path: Option<PathBuf>,
    #[serde(rename = "PredictionsPath")]
    pub predictions_path: PathBuf,
    /// Equity the prediction-driven trading evaluation starts from
    #[serde(rename = "StartingCash")]
    pub starting_cash: f64,
    /// Percent of traded value charged on entry and again on exit
    #[serde(rename = "CommissionRate")]
    pub commission_rate: f64,
    #[serde(rename = "TradingMetricsPath")]
    pub trading_metrics_path: PathBuf,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            hmm_interchange_path: None,
            predictions_path: PathBuf::from("regime_predictions.json"),
            starting_cash: 100_000.0,
            commission_rate: 0.0,
            trading_metrics_path: PathBuf::from("trading_metrics.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    #[serde(rename = "Port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { port: 12345 }
    }
}

/// One per-regime model entry of the `Models` array
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub model_path: PathBuf,
    pub regimes: Vec<usize>,
    #[serde(default)]
    pub hyperparams: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
}

fn default_test_size() -> f64 {
    0.2
}

fn default_random_state() -> u64 {
    42
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "Data": { "INPUT_CSV_PATH": "bars.csv", "CSV_Close_Col": 4 },
        "RegimeDetection": { "model_path": "hmm_saved/hmm_model.json", "params": { "n_components": 4 } },
        "Strategy": { "HMMOnnxPath": "hmm_saved/hmm_model.onnx" },
        "Models": [
            { "name": "calm", "type": "XGBoost", "model_path": "models/calm.json", "regimes": [0, 1] },
            { "name": "wild", "type": "XGBoost", "model_path": "models/wild.json", "regimes": [2],
              "hyperparams": { "n_estimators": 50 }, "test_size": 0.3, "random_state": 7 }
        ]
    }"#;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_sample_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), SAMPLE);
        let config = PipelineConfig::load(&path).unwrap();

        assert_eq!(config.data.csv_close_col, 4);
        assert_eq!(config.data.csv_timestamp_col, 0);
        assert_eq!(config.regime_detection.params.n_components, 4);
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.models[0].test_size, 0.2);
        assert_eq!(config.models[0].random_state, 42);
        assert_eq!(config.models[1].random_state, 7);
        assert_eq!(config.models[0].regimes, vec![0, 1]);
        assert_eq!(config.strategy.starting_cash, 100_000.0);
        assert_eq!(
            config.trading_metrics_path(),
            dir.path().join("trading_metrics.json")
        );
        assert_eq!(config.server.port, 12345);
        assert_eq!(
            config.regime_interchange_path(),
            dir.path().join("hmm_saved/hmm_model.onnx")
        );
        assert_eq!(
            config.regime_labels_path(),
            dir.path().join("hmm_saved/hmm_model.csv")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PipelineConfig::load(dir.path().join("absent.json")).is_err());
    }

    #[test]
    fn test_validate_collects_errors() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"{
            "RegimeDetection": { "model_path": "hmm.json", "params": { "n_components": 0 } },
            "Strategy": { "StartingCash": 0, "CommissionRate": 0.06 },
            "Models": [
                { "name": "a", "type": "XGBoost", "model_path": "a.json", "regimes": [0], "test_size": 1.5 },
                { "name": "a", "type": "XGBoost", "model_path": "b.json", "regimes": [1] }
            ]
        }"#;
        let path = write_config(dir.path(), body);
        let config = PipelineConfig::load(&path).unwrap();
        let errors = config.validate().unwrap_err();

        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("StartingCash")));
        assert!(PipelineConfig::load_validated(&path).is_err());
    }

    #[test]
    fn test_negative_column_is_absent() {
        assert_eq!(DataSettings::column(-1), None);
        assert_eq!(DataSettings::column(3), Some(3));
    }
}
