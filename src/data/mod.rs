pub mod source;
pub mod parser;
pub mod loader;
pub mod preprocess;

pub use source::{ApiDataSource, CsvDataSource, DataSource, RawRecord};
pub use parser::{parse_feature_row, BarParser};
pub use loader::load_bars;
pub use preprocess::{preprocess, Dataset};

use thiserror::Error;

/// Failures raised while obtaining bars
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Data unavailable from {origin}: {reason}")]
    Unavailable { origin: String, reason: String },
}

impl DataError {
    pub fn unavailable(origin: impl Into<String>, reason: impl ToString) -> Self {
        DataError::Unavailable {
            origin: origin.into(),
            reason: reason.to_string(),
        }
    }
}
