use anyhow::{bail, Result};
use tracing::{info, warn};

use super::{ApiDataSource, BarParser, CsvDataSource, DataError, DataSource};
use crate::config::{InputSource, PipelineConfig};
use crate::types::Bar;

/// Pulls records from a source and turns them into bars
pub struct DataLoader {
    source: Box<dyn DataSource>,
    parser: BarParser,
    partial_percent: Option<f64>,
}

impl DataLoader {
    pub fn new(source: Box<dyn DataSource>, parser: BarParser) -> Self {
        Self {
            source,
            parser,
            partial_percent: None,
        }
    }

    /// Build the loader the configuration asks for
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let settings = &config.data;
        let source: Box<dyn DataSource> = match settings.input_source {
            InputSource::Csv => Box::new(CsvDataSource::from_settings(
                settings,
                config.resolve(&settings.input_csv_path),
            )),
            InputSource::Api => {
                if settings.api_url.trim().is_empty() {
                    bail!("INPUT_SOURCE is api but API_URL is empty");
                }
                Box::new(ApiDataSource::new(settings.api_url.clone()))
            }
        };

        let mut loader = Self::new(source, BarParser::from_settings(settings));
        if settings.use_partial_data {
            loader = loader.with_partial(settings.partial_data_percent);
        }
        Ok(loader)
    }

    /// Keep only the leading share of records (rounded up) when below 100 percent
    pub fn with_partial(mut self, percent: f64) -> Self {
        self.partial_percent = Some(percent);
        self
    }

    pub async fn load_data(&self) -> Result<Vec<Bar>, DataError> {
        let raw = self.source.fetch().await?;
        if raw.is_empty() {
            warn!("{} returned no records", self.source.describe());
            return Ok(Vec::new());
        }
        let total = raw.len();

        let take = match self.partial_percent {
            Some(pct) if pct > 0.0 && pct < 100.0 => {
                let limit = ((total as f64) * pct / 100.0).ceil() as usize;
                info!("Using partial data: {}% -> {} of {} records", pct, limit, total);
                limit.min(total)
            }
            _ => total,
        };

        let header = raw.header.as_deref();
        let bars: Vec<Bar> = raw
            .records
            .iter()
            .take(take)
            .filter_map(|record| self.parser.parse(record, header))
            .collect();

        let skipped = take - bars.len();
        if skipped > 0 {
            warn!("Skipped {} unparseable records from {}", skipped, self.source.describe());
        }
        info!("Loaded {} bars from {}", bars.len(), self.source.describe());
        Ok(bars)
    }
}

/// Load bars using the configured source
pub async fn load_bars(config: &PipelineConfig) -> Result<Vec<Bar>> {
    let loader = DataLoader::from_config(config)?;
    Ok(loader.load_data().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataSettings;
    use crate::data::source::{MockDataSource, RawRecord, RawRecords};

    fn record(ts: &str, close: &str) -> RawRecord {
        RawRecord::Fields(vec![ts.to_string(), close.to_string()])
    }

    fn ten_records() -> RawRecords {
        RawRecords {
            header: None,
            records: (0..10)
                .map(|i| record(&format!("2024-01-01 00:{:02}:00", i), &format!("{}.0", 100 + i)))
                .collect(),
        }
    }

    fn mock_source(records: RawRecords) -> Box<dyn DataSource> {
        let mut source = MockDataSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(move || Ok(records.clone()));
        source.expect_describe().returning(|| "mock".to_string());
        Box::new(source)
    }

    #[tokio::test]
    async fn test_loads_all_records() {
        let loader = DataLoader::new(
            mock_source(ten_records()),
            BarParser::from_settings(&DataSettings::default()),
        );
        let bars = loader.load_data().await.unwrap();
        assert_eq!(bars.len(), 10);
        assert_eq!(bars[9].close, 109.0);
    }

    #[tokio::test]
    async fn test_partial_rounds_up() {
        let loader = DataLoader::new(
            mock_source(ten_records()),
            BarParser::from_settings(&DataSettings::default()),
        )
        .with_partial(25.0);
        let bars = loader.load_data().await.unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].close, 100.0);
    }

    #[tokio::test]
    async fn test_bad_rows_are_skipped() {
        let mut raw = ten_records();
        raw.records[3] = record("garbage", "1.0");
        raw.records[5] = record("2024-01-01 00:05:00", "n/a");
        let loader = DataLoader::new(
            mock_source(raw),
            BarParser::from_settings(&DataSettings::default()),
        );
        assert_eq!(loader.load_data().await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_empty_source_yields_no_bars() {
        let loader = DataLoader::new(
            mock_source(RawRecords {
                header: Some(vec!["timestamp".into(), "close".into()]),
                records: Vec::new(),
            }),
            BarParser::from_settings(&DataSettings::default()),
        )
        .with_partial(50.0);
        assert!(loader.load_data().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_source_propagates() {
        let mut source = MockDataSource::new();
        source
            .expect_fetch()
            .returning(|| Err(DataError::unavailable("mock", "connection refused")));
        source.expect_describe().returning(|| "mock".to_string());

        let loader = DataLoader::new(
            Box::new(source),
            BarParser::from_settings(&DataSettings::default()),
        );
        let err = loader.load_data().await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
