use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Axis};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::types::{Bar, ExtraValue};

/// Aligned feature matrix and next-close target built from bars
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: Array2<f64>,
    pub target: Array1<f64>,
    pub feature_names: Vec<String>,
    /// Source bar of each kept row, in row order
    pub bars: Vec<Bar>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    /// Features and targets of the given rows, in the given order
    pub fn select(&self, rows: &[usize]) -> (Array2<f64>, Array1<f64>) {
        (
            self.features.select(Axis(0), rows),
            self.target.select(Axis(0), rows),
        )
    }
}

enum ExtraColumn {
    Numeric(String),
    Categorical { name: String, levels: Vec<String> },
}

/// Sort bars by time, pair each with the next bar's close, drop incomplete
/// rows and one-hot encode textual extra columns.
pub fn preprocess(bars: &[Bar]) -> Result<Dataset> {
    if bars.len() < 2 {
        bail!(
            "At least 2 bars are needed to build a next-close target, got {}",
            bars.len()
        );
    }

    let mut sorted: Vec<&Bar> = bars.iter().collect();
    sorted.sort_by_key(|bar| bar.timestamp);

    let extra_names: BTreeSet<&str> = sorted
        .iter()
        .flat_map(|bar| bar.extra.keys().map(String::as_str))
        .collect();
    let categorical: BTreeSet<&str> = extra_names
        .iter()
        .copied()
        .filter(|name| {
            sorted
                .iter()
                .any(|bar| bar.extra.get(*name).is_some_and(ExtraValue::is_text))
        })
        .collect();

    // Row i predicts the close of bar i + 1; completeness is judged per row
    let mut kept: Vec<(usize, f64)> = Vec::new();
    for (i, pair) in sorted.windows(2).enumerate() {
        let (bar, next) = (pair[0], pair[1]);
        let complete = next.close.is_finite()
            && bar.base_values().iter().all(|v| v.is_finite())
            && extra_names.iter().all(|name| match bar.extra.get(*name) {
                Some(ExtraValue::Number(v)) => categorical.contains(name) || v.is_finite(),
                Some(ExtraValue::Text(_)) => true,
                None => false,
            });
        if complete {
            kept.push((i, next.close));
        }
    }

    let dropped = sorted.len() - 1 - kept.len();
    if dropped > 0 {
        debug!("Dropped {} incomplete rows", dropped);
    }
    if kept.is_empty() {
        bail!("No complete rows remain after preprocessing {} bars", bars.len());
    }

    let mut columns: Vec<ExtraColumn> = extra_names
        .iter()
        .filter(|name| !categorical.contains(*name))
        .map(|name| ExtraColumn::Numeric(name.to_string()))
        .collect();
    for name in &categorical {
        let levels: BTreeSet<String> = kept
            .iter()
            .filter_map(|(i, _)| sorted[*i].extra.get(*name).map(ExtraValue::to_string))
            .collect();
        // First level is the reference category
        columns.push(ExtraColumn::Categorical {
            name: name.to_string(),
            levels: levels.into_iter().skip(1).collect(),
        });
    }

    let mut feature_names: Vec<String> = Bar::BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    for column in &columns {
        match column {
            ExtraColumn::Numeric(name) => feature_names.push(format!("extra_{}", name)),
            ExtraColumn::Categorical { name, levels } => feature_names.extend(
                levels
                    .iter()
                    .map(|level| format!("extra_{}_{}", name, level)),
            ),
        }
    }

    let n_cols = feature_names.len();
    let mut values = Vec::with_capacity(kept.len() * n_cols);
    for (i, _) in &kept {
        let bar = sorted[*i];
        values.extend_from_slice(&bar.base_values());
        for column in &columns {
            match column {
                ExtraColumn::Numeric(name) => {
                    values.push(bar.extra.get(name).and_then(ExtraValue::as_number).unwrap_or(f64::NAN))
                }
                ExtraColumn::Categorical { name, levels } => {
                    let level = bar.extra.get(name).map(ExtraValue::to_string);
                    values.extend(levels.iter().map(|candidate| {
                        if level.as_deref() == Some(candidate.as_str()) {
                            1.0
                        } else {
                            0.0
                        }
                    }));
                }
            }
        }
    }

    let features = Array2::from_shape_vec((kept.len(), n_cols), values)?;
    let target = Array1::from_iter(kept.iter().map(|(_, close)| *close));
    let kept_bars = kept.iter().map(|(i, _)| sorted[*i].clone()).collect();

    info!(
        "Preprocessed {} bars into {} rows x {} features",
        bars.len(),
        features.nrows(),
        n_cols
    );

    Ok(Dataset {
        features,
        target,
        feature_names,
        bars: kept_bars,
    })
}

/// Sorted union of extra column names across bars
pub fn extra_columns(bars: &[Bar]) -> Vec<String> {
    let names: BTreeSet<&String> = bars.iter().flat_map(|bar| bar.extra.keys()).collect();
    names.into_iter().cloned().collect()
}

/// Extra value lookup that renders absent values as empty text
pub fn extra_cell(extra: &BTreeMap<String, ExtraValue>, name: &str) -> String {
    extra.get(name).map(ExtraValue::to_string).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bar(minute: i64, close: f64) -> Bar {
        let timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        Bar::from_values(
            timestamp,
            [close, close + 1.0, close - 1.0, close, close - 0.5, close + 0.5, 10.0],
            BTreeMap::new(),
        )
    }

    fn with_extra(mut bar: Bar, name: &str, value: ExtraValue) -> Bar {
        bar.extra.insert(name.to_string(), value);
        bar
    }

    #[test]
    fn test_rows_are_one_less_than_bars() {
        let bars: Vec<Bar> = (0..6).map(|i| bar(i, 100.0 + i as f64)).collect();
        let dataset = preprocess(&bars).unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.features.nrows(), 5);
        assert_eq!(dataset.n_features(), 7);
        assert_eq!(dataset.target[0], 101.0);
        assert_eq!(dataset.target[4], 105.0);
        assert_eq!(dataset.feature_names[3], "close");
    }

    #[test]
    fn test_unsorted_input_is_ordered_by_time() {
        let bars = vec![bar(2, 102.0), bar(0, 100.0), bar(1, 101.0)];
        let dataset = preprocess(&bars).unwrap();

        assert_eq!(dataset.features[[0, 3]], 100.0);
        assert_eq!(dataset.target.to_vec(), vec![101.0, 102.0]);
    }

    #[test]
    fn test_categorical_extra_is_one_hot_encoded() {
        let venues = ["NYSE", "ARCA", "BATS", "NYSE", "ARCA"];
        let bars: Vec<Bar> = venues
            .iter()
            .enumerate()
            .map(|(i, venue)| {
                let b = with_extra(bar(i as i64, 100.0), "venue", ExtraValue::Text(venue.to_string()));
                with_extra(b, "imbalance", ExtraValue::Number(i as f64))
            })
            .collect();
        let dataset = preprocess(&bars).unwrap();

        // Rows keep venues NYSE, ARCA, BATS, NYSE; ARCA is the dropped reference level
        assert_eq!(
            dataset.feature_names[7..].to_vec(),
            vec!["extra_imbalance", "extra_venue_BATS", "extra_venue_NYSE"]
        );
        assert_eq!(dataset.features.row(0).to_vec()[8..], [0.0, 1.0]);
        assert_eq!(dataset.features.row(1).to_vec()[8..], [0.0, 0.0]);
        assert_eq!(dataset.features.row(2).to_vec()[8..], [1.0, 0.0]);
        assert_eq!(dataset.features[[3, 7]], 3.0);
    }

    #[test]
    fn test_rows_missing_extras_are_dropped() {
        let bars = vec![
            with_extra(bar(0, 100.0), "beta", ExtraValue::Number(1.0)),
            bar(1, 101.0),
            with_extra(bar(2, 102.0), "beta", ExtraValue::Number(f64::NAN)),
            with_extra(bar(3, 103.0), "beta", ExtraValue::Number(0.5)),
            bar(4, 104.0),
        ];
        let dataset = preprocess(&bars).unwrap();

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.target.to_vec(), vec![101.0, 104.0]);
        assert_eq!(dataset.bars[1].close, 103.0);
    }

    #[test]
    fn test_too_few_bars() {
        assert!(preprocess(&[bar(0, 1.0)]).is_err());
        assert!(preprocess(&[]).is_err());
    }

    #[test]
    fn test_select_rows() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, i as f64)).collect();
        let dataset = preprocess(&bars).unwrap();
        let (x, y) = dataset.select(&[3, 1]);
        assert_eq!(x.nrows(), 2);
        assert_eq!(y.to_vec(), vec![4.0, 2.0]);
    }
}
