use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{
    DataSettings, ModelSpec, PipelineConfig, RegimeDetectionSettings, ServerSettings,
    StrategySettings,
};
use crate::ml::hmm::HmmParams;
use crate::types::Bar;

/// Bars alternating between two price levels every 15 minutes
pub fn regime_bars(n: usize) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..n)
        .map(|i| {
            let level = if (i / 15) % 2 == 0 { 100.0 } else { 200.0 };
            let close = level + (i % 5) as f64 * 0.1;
            Bar::from_values(
                start + Duration::minutes(i as i64),
                [
                    close,
                    close + 0.5,
                    close - 0.5,
                    close,
                    close - 0.05,
                    close + 0.05,
                    1000.0 + (i % 7) as f64,
                ],
                BTreeMap::new(),
            )
        })
        .collect()
}

/// Write `regime_bars(n)` as a close-only CSV with a textual `spread_tag` column
pub fn write_bars_csv(path: &Path, n: usize) {
    let mut body = String::from("timestamp,close,spread_tag\n");
    for (i, bar) in regime_bars(n).iter().enumerate() {
        let tag = if i % 3 == 0 { "wide" } else { "tight" };
        body.push_str(&format!(
            "{},{},{}\n",
            bar.timestamp.format("%Y-%m-%d %H:%M:%S"),
            bar.close,
            tag
        ));
    }
    std::fs::write(path, body).unwrap();
}

/// Two-state config rooted at `dir` with no model entries
pub fn config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        data: DataSettings::default(),
        regime_detection: RegimeDetectionSettings {
            model_path: PathBuf::from("hmm_saved/hmm_model.json"),
            params: HmmParams {
                n_components: 2,
                n_iter: 30,
                ..HmmParams::default()
            },
        },
        strategy: StrategySettings::default(),
        models: Vec::new(),
        server: ServerSettings::default(),
        base_dir: dir.to_path_buf(),
    }
}

pub fn model_spec(name: &str, model_type: &str, regimes: &[usize]) -> ModelSpec {
    let mut hyperparams = serde_json::Map::new();
    hyperparams.insert("n_estimators".into(), serde_json::json!(10));
    hyperparams.insert("max_depth".into(), serde_json::json!(3));
    ModelSpec {
        name: name.to_string(),
        model_type: model_type.to_string(),
        model_path: PathBuf::from(format!("models/{}.json", name)),
        regimes: regimes.to_vec(),
        hyperparams,
        test_size: 0.2,
        random_state: 42,
    }
}
