use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::DataError;
use crate::config::DataSettings;

/// One unparsed record as delivered by a source
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    /// Delimited text fields, addressed by column index
    Fields(Vec<String>),
    /// A JSON object, addressed by field name
    Object(Map<String, Value>),
}

/// A batch of raw records plus the CSV header row when there is one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecords {
    pub header: Option<Vec<String>>,
    pub records: Vec<RawRecord>,
}

impl RawRecords {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fetch every available record in source order
    async fn fetch(&self) -> Result<RawRecords, DataError>;
    fn describe(&self) -> String;
}

/// Delimited text file source
#[derive(Debug, Clone)]
pub struct CsvDataSource {
    path: PathBuf,
    delimiter: u8,
    has_header: bool,
}

impl CsvDataSource {
    pub fn new(path: impl Into<PathBuf>, delimiter: u8, has_header: bool) -> Self {
        Self {
            path: path.into(),
            delimiter,
            has_header,
        }
    }

    pub fn from_settings(settings: &DataSettings, path: PathBuf) -> Self {
        Self::new(path, settings.delimiter(), settings.csv_has_header)
    }
}

#[async_trait]
impl DataSource for CsvDataSource {
    async fn fetch(&self) -> Result<RawRecords, DataError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.has_header)
            .comment(Some(b'#'))
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| DataError::unavailable(self.describe(), e))?;

        let header = if self.has_header {
            let headers = reader
                .headers()
                .map_err(|e| DataError::unavailable(self.describe(), e))?;
            Some(headers.iter().map(str::to_string).collect())
        } else {
            None
        };

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            match row {
                Ok(row) => {
                    records.push(RawRecord::Fields(row.iter().map(str::to_string).collect()))
                }
                Err(e) => warn!("Skipping unreadable row {} in {}: {}", line + 1, self.path.display(), e),
            }
        }

        info!("Read {} rows from {}", records.len(), self.path.display());
        Ok(RawRecords { header, records })
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

/// HTTP source returning either a JSON array of objects or one object per line
#[derive(Debug, Clone)]
pub struct ApiDataSource {
    client: Client,
    url: String,
}

impl ApiDataSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
        }
    }

    /// Split a response body into JSON objects. Non-object entries are skipped.
    pub fn parse_body(body: &str) -> Result<Vec<RawRecord>, serde_json::Error> {
        let trimmed = body.trim_start();
        let values: Vec<Value> = if trimmed.starts_with('[') {
            serde_json::from_str(trimmed)?
        } else {
            trimmed
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(serde_json::from_str::<Value>)
                .collect::<Result<_, _>>()?
        };

        Ok(values
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(map) => Some(RawRecord::Object(map)),
                other => {
                    debug!("Ignoring non-object API entry: {}", other);
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl DataSource for ApiDataSource {
    async fn fetch(&self) -> Result<RawRecords, DataError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| DataError::unavailable(self.describe(), e))?;

        let body = response
            .text()
            .await
            .map_err(|e| DataError::unavailable(self.describe(), e))?;

        let records =
            Self::parse_body(&body).map_err(|e| DataError::unavailable(self.describe(), e))?;

        info!("Fetched {} records from {}", records.len(), self.url);
        Ok(RawRecords {
            header: None,
            records,
        })
    }

    fn describe(&self) -> String {
        format!("api:{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_csv_source_reads_header_and_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bars.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "timestamp,close,venue").unwrap();
        writeln!(file, "# exported by recorder").unwrap();
        writeln!(file, "2024-01-01 00:00:00, 100.5 ,NYSE").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "2024-01-01 00:01:00,101.0,ARCA").unwrap();

        let source = CsvDataSource::new(&path, b',', true);
        let raw = source.fetch().await.unwrap();

        assert_eq!(
            raw.header,
            Some(vec!["timestamp".to_string(), "close".to_string(), "venue".to_string()])
        );
        assert_eq!(raw.len(), 2);
        assert_eq!(
            raw.records[0],
            RawRecord::Fields(vec![
                "2024-01-01 00:00:00".to_string(),
                "100.5".to_string(),
                "NYSE".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_missing_csv_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvDataSource::new(dir.path().join("absent.csv"), b',', true);
        let err = source.fetch().await.unwrap_err();
        assert!(matches!(err, DataError::Unavailable { .. }));
    }

    #[test]
    fn test_parse_body_array_and_lines() {
        let array = r#"[{"timestamp": 1, "close": 2.0}, 5, {"timestamp": 2, "close": 3.0}]"#;
        assert_eq!(ApiDataSource::parse_body(array).unwrap().len(), 2);

        let lines = "{\"timestamp\": 1, \"close\": 2.0}\n\n{\"timestamp\": 2, \"close\": 3.0}\n";
        assert_eq!(ApiDataSource::parse_body(lines).unwrap().len(), 2);

        assert!(ApiDataSource::parse_body("{not json").is_err());
    }
}
