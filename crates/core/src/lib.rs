//! Shared model for the ad rule engine: rules, ad hierarchy, metrics,
//! action log records, configuration and the error taxonomy.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{EngineError, EngineResult, PlatformError};
