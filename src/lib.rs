//! AED Forecast Library
//!
//! Daily A&E attendance forecasting: leak-safe feature construction,
//! gradient-boosted training with walk-forward validation, a model registry,
//! rolling multi-day prediction and a continuous-learning loop.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod exogenous;
pub mod forecaster;
pub mod holidays;
pub mod learner;
pub mod ml;
pub mod series;
pub mod stats;
pub mod store;
pub mod traits;

// Re-export commonly used types
pub use api::ObservatoryClient;
pub use config::AppConfig;
pub use db::Database;
pub use error::{ForecastError, Result};
pub use exogenous::{AqhiDay, AqhiRisk, Exogenous, FactorCategory, QualitativeFactor, WeatherDay};
pub use forecaster::Forecaster;
pub use holidays::HolidayCalendar;
pub use learner::{FusionWeights, GovernorDecision, ImpactSet, WeightUpdateRecord};
pub use ml::{
    CancelToken, FeatureSet, ModelArtifact, ModelRegistry, PredictionRecord, RollingPredictor,
    ServingModel, Track, VersionSelector,
};
pub use series::{AttendancePoint, Series};
pub use store::{MemoryAttendanceStore, MemoryLearnerState, MemoryPredictionLog};
pub use traits::{
    AttendanceStore, Clock, DailyLookup, HKT, HolidayProvider, LearnerState, MockClock,
    PredictionLog, SystemClock,
};
