pub mod config;
pub mod error;
pub mod geo;
pub mod retry;
pub mod types;

pub use config::PlotariConfig;
pub use error::{PlotariError, ProviderError, Result};
pub use geo::{GeoPoint, GeoRadius};
pub use retry::RetryPolicy;
pub use types::*;
