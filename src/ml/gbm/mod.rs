pub mod regressor;
pub mod tree;

pub use regressor::{GbmParams, GradientBoostedRegressor};
