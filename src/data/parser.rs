use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::RawRecord;
use crate::config::DataSettings;
use crate::types::{Bar, ExtraValue};

const FALLBACK_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
/// Epoch values above this are taken as milliseconds
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a timestamp with the configured format, then the common fallbacks,
/// then as an epoch number.
pub fn parse_timestamp(raw: &str, format: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
        return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, FALLBACK_TIMESTAMP_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    raw.parse::<f64>().ok().and_then(from_epoch)
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    let whole = value.trunc() as i64;
    if whole.abs() > EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(whole).single()
    } else {
        Utc.timestamp_opt(whole, 0).single()
    }
}

/// Parse a whitespace-separated row of feature values
pub fn parse_feature_row(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| anyhow!("invalid feature value '{}'", token))
        })
        .collect()
}

/// Price fields found on a record before fallbacks are applied
#[derive(Debug, Default, Clone, Copy)]
struct PriceFields {
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    bid: Option<f64>,
    ask: Option<f64>,
    volume: Option<f64>,
}

impl PriceFields {
    /// Fill absent fields. Without a close, the mid of bid/ask (or whichever
    /// side exists) stands in for it; without any of the three the record is unusable.
    fn resolve(self) -> Option<[f64; 7]> {
        let close = match (self.close, self.bid, self.ask) {
            (Some(close), _, _) => close,
            (None, Some(bid), Some(ask)) => (bid + ask) / 2.0,
            (None, Some(bid), None) => bid,
            (None, None, Some(ask)) => ask,
            (None, None, None) => return None,
        };

        let (bid, ask) = if self.close.is_some() {
            (self.bid.unwrap_or(close), self.ask.unwrap_or(close))
        } else {
            (
                self.bid.or(self.ask).unwrap_or(close),
                self.ask.or(self.bid).unwrap_or(close),
            )
        };

        Some([
            self.open.unwrap_or(close),
            self.high.unwrap_or(close),
            self.low.unwrap_or(close),
            close,
            bid,
            ask,
            self.volume.unwrap_or(0.0),
        ])
    }
}

#[derive(Debug, Clone)]
struct CsvLayout {
    timestamp_format: String,
    timestamp: Option<usize>,
    open: Option<usize>,
    high: Option<usize>,
    low: Option<usize>,
    close: Option<usize>,
    bid: Option<usize>,
    ask: Option<usize>,
    volume: Option<usize>,
}

impl CsvLayout {
    fn mapped(&self) -> [Option<usize>; 8] {
        [
            self.timestamp,
            self.open,
            self.high,
            self.low,
            self.close,
            self.bid,
            self.ask,
            self.volume,
        ]
    }
}

#[derive(Debug, Clone)]
struct ApiLayout {
    timestamp_format: String,
    timestamp: String,
    open: String,
    high: String,
    low: String,
    close: String,
    bid: String,
    ask: String,
    volume: String,
}

impl ApiLayout {
    fn mapped(&self) -> [&str; 8] {
        [
            self.timestamp.as_str(),
            self.open.as_str(),
            self.high.as_str(),
            self.low.as_str(),
            self.close.as_str(),
            self.bid.as_str(),
            self.ask.as_str(),
            self.volume.as_str(),
        ]
    }
}

/// Turns raw records into bars using the configured column and field mappings
#[derive(Debug, Clone)]
pub struct BarParser {
    csv: CsvLayout,
    api: ApiLayout,
}

impl BarParser {
    pub fn from_settings(settings: &DataSettings) -> Self {
        Self {
            csv: CsvLayout {
                timestamp_format: settings.csv_timestamp_format.clone(),
                timestamp: DataSettings::column(settings.csv_timestamp_col),
                open: DataSettings::column(settings.csv_open_col),
                high: DataSettings::column(settings.csv_high_col),
                low: DataSettings::column(settings.csv_low_col),
                close: DataSettings::column(settings.csv_close_col),
                bid: DataSettings::column(settings.csv_bid_col),
                ask: DataSettings::column(settings.csv_ask_col),
                volume: DataSettings::column(settings.csv_volume_col),
            },
            api: ApiLayout {
                timestamp_format: settings.api_timestamp_format.clone(),
                timestamp: settings.api_field_timestamp.clone(),
                open: settings.api_field_open.clone(),
                high: settings.api_field_high.clone(),
                low: settings.api_field_low.clone(),
                close: settings.api_field_close.clone(),
                bid: settings.api_field_bid.clone(),
                ask: settings.api_field_ask.clone(),
                volume: settings.api_field_volume.clone(),
            },
        }
    }

    /// Parse one record. Returns `None` when the record cannot yield a bar.
    pub fn parse(&self, record: &RawRecord, header: Option<&[String]>) -> Option<Bar> {
        match record {
            RawRecord::Fields(fields) => self.parse_fields(fields, header),
            RawRecord::Object(object) => self.parse_object(object),
        }
    }

    fn parse_fields(&self, fields: &[String], header: Option<&[String]>) -> Option<Bar> {
        let layout = &self.csv;
        let field = |index: Option<usize>| index.and_then(|i| fields.get(i)).map(String::as_str);
        let number = |index: Option<usize>| field(index).and_then(|v| v.parse::<f64>().ok());

        let timestamp = match field(layout.timestamp) {
            Some(raw) => parse_timestamp(raw, &layout.timestamp_format),
            None => None,
        };
        let Some(timestamp) = timestamp else {
            debug!("Skipping row without a parseable timestamp: {:?}", fields);
            return None;
        };

        let prices = PriceFields {
            open: number(layout.open),
            high: number(layout.high),
            low: number(layout.low),
            close: number(layout.close),
            bid: number(layout.bid),
            ask: number(layout.ask),
            volume: number(layout.volume),
        }
        .resolve()?;

        let mapped = layout.mapped();
        let extra = fields
            .iter()
            .enumerate()
            .filter(|(i, value)| !mapped.contains(&Some(*i)) && !value.is_empty())
            .map(|(i, value)| {
                let name = header
                    .and_then(|h| h.get(i))
                    .filter(|name| !name.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("col{}", i));
                (name, ExtraValue::parse(value))
            })
            .collect();

        Some(Bar::from_values(timestamp, prices, extra))
    }

    fn parse_object(&self, object: &Map<String, Value>) -> Option<Bar> {
        let layout = &self.api;
        let number = |name: &str| object.get(name).and_then(value_as_number);

        let timestamp = match object.get(&layout.timestamp) {
            Some(Value::String(raw)) => parse_timestamp(raw, &layout.timestamp_format),
            Some(Value::Number(n)) => n.as_f64().and_then(from_epoch),
            _ => None,
        };
        let Some(timestamp) = timestamp else {
            debug!("Skipping object without a parseable timestamp");
            return None;
        };

        let prices = PriceFields {
            open: number(&layout.open),
            high: number(&layout.high),
            low: number(&layout.low),
            close: number(&layout.close),
            bid: number(&layout.bid),
            ask: number(&layout.ask),
            volume: number(&layout.volume),
        }
        .resolve()?;

        let mapped = layout.mapped();
        let extra: BTreeMap<String, ExtraValue> = object
            .iter()
            .filter(|(key, _)| !mapped.contains(&key.as_str()))
            .filter_map(|(key, value)| match value {
                Value::Number(n) => n.as_f64().map(|v| (key.clone(), ExtraValue::Number(v))),
                Value::String(s) => Some((key.clone(), ExtraValue::Text(s.clone()))),
                _ => None,
            })
            .collect();

        Some(Bar::from_values(timestamp, prices, extra))
    }
}

fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use serde_json::json;

    fn fields(values: &[&str]) -> RawRecord {
        RawRecord::Fields(values.iter().map(|v| v.to_string()).collect())
    }

    fn csv_settings() -> DataSettings {
        DataSettings {
            csv_bid_col: 2,
            csv_ask_col: 3,
            ..DataSettings::default()
        }
    }

    #[test]
    fn test_timestamp_fallbacks() {
        let configured = parse_timestamp("2024-03-01 09:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(configured.hour(), 9);

        let fractional = parse_timestamp("2024-03-01 09:30:00.250", "%d/%m/%Y").unwrap();
        assert_eq!(fractional.minute(), 30);

        let rfc = parse_timestamp("2024-03-01T09:30:00Z", "%d/%m/%Y").unwrap();
        assert_eq!(rfc, configured);

        let seconds = parse_timestamp("1709285400", "%d/%m/%Y").unwrap();
        let millis = parse_timestamp("1709285400000", "%d/%m/%Y").unwrap();
        assert_eq!(seconds, configured);
        assert_eq!(millis, configured);

        assert!(parse_timestamp("yesterday", "%Y-%m-%d").is_none());
        assert!(parse_timestamp("", "%Y-%m-%d").is_none());
    }

    #[test]
    fn test_close_present_fills_missing_fields() {
        let parser = BarParser::from_settings(&csv_settings());
        let bar = parser
            .parse(&fields(&["2024-01-01 00:00:00", "100.0", "", "101.0"]), None)
            .unwrap();

        assert_eq!(bar.close, 100.0);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.bid, 100.0);
        assert_eq!(bar.ask, 101.0);
        assert_eq!(bar.volume, 0.0);
    }

    #[test]
    fn test_mid_price_fallback() {
        let parser = BarParser::from_settings(&csv_settings());

        let both = parser
            .parse(&fields(&["2024-01-01 00:00:00", "", "99.0", "101.0"]), None)
            .unwrap();
        assert_eq!(both.close, 100.0);
        assert_eq!(both.high, 100.0);

        let bid_only = parser
            .parse(&fields(&["2024-01-01 00:00:00", "", "99.0", ""]), None)
            .unwrap();
        assert_eq!(bid_only.close, 99.0);
        assert_eq!(bid_only.ask, 99.0);

        assert!(parser
            .parse(&fields(&["2024-01-01 00:00:00", "", "", ""]), None)
            .is_none());
    }

    #[test]
    fn test_unmapped_columns_become_extras() {
        let parser = BarParser::from_settings(&DataSettings::default());
        let header: Vec<String> = ["timestamp", "close", "venue", "imbalance"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let bar = parser
            .parse(
                &fields(&["2024-01-01 00:00:00", "10.0", "NYSE", "0.25", "7"]),
                Some(&header),
            )
            .unwrap();

        assert_eq!(bar.extra.get("venue"), Some(&ExtraValue::Text("NYSE".to_string())));
        assert_eq!(bar.extra.get("imbalance"), Some(&ExtraValue::Number(0.25)));
        assert_eq!(bar.extra.get("col4"), Some(&ExtraValue::Number(7.0)));
    }

    #[test]
    fn test_bad_timestamp_skips_row() {
        let parser = BarParser::from_settings(&DataSettings::default());
        assert!(parser.parse(&fields(&["not a time", "10.0"]), None).is_none());
    }

    #[test]
    fn test_object_record() {
        let parser = BarParser::from_settings(&DataSettings::default());
        let object = json!({
            "timestamp": "2024-01-01T00:00:00",
            "close": "12.5",
            "volume": 300,
            "sector": "tech",
            "beta": 1.2,
            "flag": true
        });
        let Value::Object(map) = object else { unreachable!() };

        let bar = parser.parse(&RawRecord::Object(map), None).unwrap();
        assert_eq!(bar.close, 12.5);
        assert_eq!(bar.volume, 300.0);
        assert_eq!(bar.extra.len(), 2);
        assert_eq!(bar.extra.get("sector"), Some(&ExtraValue::Text("tech".to_string())));

        let epoch = json!({ "timestamp": 1704067200, "bid": 1.0, "ask": 3.0 });
        let Value::Object(map) = epoch else { unreachable!() };
        let bar = parser.parse(&RawRecord::Object(map), None).unwrap();
        assert_eq!(bar.close, 2.0);
        assert_eq!(bar.timestamp.timestamp(), 1704067200);
    }

    #[test]
    fn test_parse_feature_row() {
        assert_eq!(parse_feature_row(" 1.5  2.0\t3 ").unwrap(), vec![1.5, 2.0, 3.0]);
        let err = parse_feature_row("1.0 abc").unwrap_err();
        assert_eq!(err.to_string(), "invalid feature value 'abc'");
    }
}
