use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value of an open-ended extra column carried by a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Number(f64),
    Text(String),
}

impl ExtraValue {
    /// Numeric text becomes a number, anything else stays text
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(value) => ExtraValue::Number(value),
            Err(_) => ExtraValue::Text(trimmed.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            ExtraValue::Number(value) => Some(*value),
            ExtraValue::Text(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ExtraValue::Text(_))
    }
}

impl fmt::Display for ExtraValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtraValue::Number(value) => write!(f, "{}", value),
            ExtraValue::Text(text) => write!(f, "{}", text),
        }
    }
}

/// One time-stamped market observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    #[serde(default)]
    pub extra: BTreeMap<String, ExtraValue>,
}

impl Bar {
    /// Names of the base numeric fields, in feature-matrix order
    pub const BASE_COLUMNS: [&'static str; 7] =
        ["open", "high", "low", "close", "bid", "ask", "volume"];

    /// Build a bar from base values laid out as in [`Bar::BASE_COLUMNS`]
    pub fn from_values(
        timestamp: DateTime<Utc>,
        values: [f64; 7],
        extra: BTreeMap<String, ExtraValue>,
    ) -> Self {
        let [open, high, low, close, bid, ask, volume] = values;
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            bid,
            ask,
            volume,
            extra,
        }
    }

    pub fn base_values(&self) -> [f64; 7] {
        [
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
